//! MTTR, remediation capacity, and trend computation. Runs strictly after
//! status resolution; consumes only stored findings and assets.
//!
//! Findings are per-session rows, so a (asset, plugin) pair accumulates one
//! row per scan it appeared in or was resolved by. Current state is the row
//! with the latest event date per pair; MTTR still counts every remediation
//! event. Every breakdown bucket falls back to a documented default instead
//! of being omitted, so downstream consumers always see a number.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::core::hash;
use crate::core::types::{
    Asset, AssetClass, CapacityReport, Finding, MetricSnapshot, MttrReport, RemediationStatus,
    Severity, TrendRow,
};

pub const GROUP_FALLBACK_DAYS: f64 = 30.0;
pub const OVERALL_FALLBACK_DAYS: f64 = 30.0;

pub fn severity_fallback_days(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 7.0,
        Severity::High => 15.0,
        Severity::Medium => 30.0,
        Severity::Low => 90.0,
        Severity::Info => 0.0,
    }
}

pub fn class_fallback_days(class: AssetClass) -> f64 {
    match class {
        AssetClass::Host => 21.0,
        _ => 30.0,
    }
}

/// When a row became authoritative: its remediation date, or the scan it was
/// last observed in.
fn event_date(finding: &Finding) -> DateTime<Utc> {
    finding.remediation_date.unwrap_or(finding.last_seen)
}

/// Latest row per (fingerprint, plugin) pair: the pair's current state.
fn latest_per_pair(findings: &[Finding]) -> BTreeMap<(String, String), &Finding> {
    let mut map: BTreeMap<(String, String), &Finding> = BTreeMap::new();
    for finding in findings {
        let key = (finding.asset_fingerprint.clone(), finding.plugin_id.clone());
        match map.get(&key) {
            Some(prev) if event_date(prev) >= event_date(finding) => {}
            _ => {
                map.insert(key, finding);
            }
        }
    }
    map
}

pub fn build_snapshot(
    session_id: &str,
    findings: &[Finding],
    assets: &BTreeMap<String, Asset>,
    window: Duration,
    now: DateTime<Utc>,
) -> MetricSnapshot {
    MetricSnapshot {
        id: hash::snapshot_id(session_id),
        session_id: session_id.to_string(),
        generated_at: now,
        mttr: mttr_report(findings, assets),
        capacity: capacity_report(findings, window, now),
        trend: trend_rows(findings, window, now),
    }
}

/// MTTR over remediation events: every remediated row contributes its
/// fractional-day exposure span, even when the pair reopened later.
pub fn mttr_report(findings: &[Finding], assets: &BTreeMap<String, Asset>) -> MttrReport {
    let remediated: Vec<&Finding> = findings
        .iter()
        .filter(|f| f.remediation_date.is_some())
        .collect();

    let (overall_days, overall_is_fallback) = match mean_days(remediated.iter().copied()) {
        Some(mean) => (round2(mean), false),
        None => (OVERALL_FALLBACK_DAYS, true),
    };

    let mut by_severity = BTreeMap::new();
    for severity in Severity::actionable() {
        let mean = mean_days(remediated.iter().copied().filter(|f| f.severity == severity))
            .map(round2)
            .unwrap_or_else(|| severity_fallback_days(severity));
        by_severity.insert(severity.as_str().to_string(), mean);
    }

    let mut by_class = BTreeMap::new();
    for class in classes_present(assets) {
        let mean = mean_days(remediated.iter().copied().filter(|f| {
            assets
                .get(&f.asset_fingerprint)
                .map(|a| a.class == class)
                .unwrap_or(false)
        }))
        .map(round2)
        .unwrap_or_else(|| class_fallback_days(class));
        by_class.insert(class.as_str().to_string(), mean);
    }

    let mut by_group = BTreeMap::new();
    for path in group_paths_present(assets) {
        let mean = mean_days(remediated.iter().copied().filter(|f| {
            assets
                .get(&f.asset_fingerprint)
                .map(|a| a.group_paths.contains(&path))
                .unwrap_or(false)
        }))
        .map(round2)
        .unwrap_or(GROUP_FALLBACK_DAYS);
        by_group.insert(path, mean);
    }

    MttrReport {
        overall_days,
        overall_is_fallback,
        by_severity,
        by_group,
        by_class,
    }
}

pub fn capacity_report(findings: &[Finding], window: Duration, now: DateTime<Utc>) -> CapacityReport {
    let latest = latest_per_pair(findings);
    let total = latest.len() as u64;
    let open = latest.values().filter(|f| f.status.is_open()).count() as u64;
    let remediated = latest
        .values()
        .filter(|f| f.status == RemediationStatus::Remediated)
        .count() as u64;
    let rate = if total == 0 {
        0.0
    } else {
        round2(remediated as f64 / total as f64 * 100.0)
    };

    // Throughput counts every remediation event in the window, reopened
    // later or not.
    let window_days = window.num_days().max(1);
    let since = now - window;
    let recent = findings
        .iter()
        .filter(|f| f.remediation_date.map(|d| d >= since).unwrap_or(false))
        .count() as f64;

    CapacityReport {
        total_findings: total,
        open_findings: open,
        remediated_findings: remediated,
        remediation_rate_pct: rate,
        avg_daily_remediation: round2(recent / window_days as f64),
        window_days,
    }
}

/// One row for every calendar day in the look-back window ending at `now`,
/// quiet days included: those carry zero event counts and the as-of-day open
/// snapshot. Re-computation replaces whole rows, so the day key stays unique
/// in the store.
pub fn trend_rows(findings: &[Finding], window: Duration, now: DateTime<Utc>) -> Vec<TrendRow> {
    let latest = latest_per_pair(findings);
    let start = (now - window).date_naive();
    let end = now.date_naive();

    let mut days: BTreeMap<NaiveDate, TrendRow> = BTreeMap::new();
    let mut day = start;
    while day <= end {
        days.insert(
            day,
            TrendRow {
                day,
                new_findings: 0,
                remediated_findings: 0,
                reopened_findings: 0,
                open_by_severity: BTreeMap::new(),
            },
        );
        let Some(next) = day.succ_opt() else { break };
        day = next;
    }

    // New findings count distinct pairs on the day they first appeared;
    // remediations and reopens count events, one row each. Events outside
    // the window fall off the series without losing their stored history.
    for pair in latest.values() {
        if let Some(r) = days.get_mut(&pair.first_seen.date_naive()) {
            r.new_findings += 1;
        }
    }
    for finding in findings {
        if let Some(date) = finding.remediation_date {
            if let Some(r) = days.get_mut(&date.date_naive()) {
                r.remediated_findings += 1;
            }
        }
        if finding.status == RemediationStatus::Reopened {
            if let Some(r) = days.get_mut(&finding.last_seen.date_naive()) {
                r.reopened_findings += 1;
            }
        }
    }

    // Open-by-severity reconstructs each pair's state as of that day: the
    // row with the latest event date not after the day decides.
    let day_keys: Vec<NaiveDate> = days.keys().copied().collect();
    let mut rows_by_pair: BTreeMap<(String, String), Vec<&Finding>> = BTreeMap::new();
    for finding in findings {
        rows_by_pair
            .entry((finding.asset_fingerprint.clone(), finding.plugin_id.clone()))
            .or_default()
            .push(finding);
    }
    for day in day_keys {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for rows in rows_by_pair.values() {
            let state = rows
                .iter()
                .filter(|f| event_date(f).date_naive() <= day)
                .max_by_key(|f| event_date(f));
            if let Some(state) = state {
                if state.status.is_open() {
                    *counts
                        .entry(state.severity.as_str().to_string())
                        .or_insert(0) += 1;
                }
            }
        }
        if let Some(row) = days.get_mut(&day) {
            row.open_by_severity = counts;
        }
    }

    days.into_values().collect()
}

fn mean_days<'a, I: Iterator<Item = &'a Finding>>(findings: I) -> Option<f64> {
    let mut total = 0.0;
    let mut count = 0u64;
    for f in findings {
        let Some(date) = f.remediation_date else {
            continue;
        };
        total += (date - f.first_seen).num_seconds() as f64 / 86_400.0;
        count += 1;
    }
    if count == 0 {
        None
    } else {
        Some(total / count as f64)
    }
}

fn classes_present(assets: &BTreeMap<String, Asset>) -> Vec<AssetClass> {
    let mut classes: Vec<AssetClass> = assets.values().map(|a| a.class).collect();
    classes.sort();
    classes.dedup();
    classes
}

fn group_paths_present(assets: &BTreeMap<String, Asset>) -> Vec<String> {
    let mut paths: Vec<String> = assets
        .values()
        .flat_map(|a| a.group_paths.iter().cloned())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
