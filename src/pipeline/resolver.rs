//! Resolves remediation status by diffing the current session against the
//! immediately preceding one, per (asset fingerprint, plugin id) pair.
//!
//! New pair → open. Persisting pair → open with the original first_seen.
//! Pair that disappeared → a remediated row synthesized into the current
//! session, remediation_date = the current scan date. Pair back after being
//! remediated → reopened, first_seen preserved, remediation_date cleared.
//! With no prior session everything is simply open.

use std::collections::BTreeMap;

use crate::core::hash;
use crate::core::types::{Finding, RemediationStatus, ScanSession};

pub fn resolve_statuses(
    session: &ScanSession,
    current: Vec<Finding>,
    previous: &[Finding],
) -> Vec<Finding> {
    let prior: BTreeMap<(String, String), &Finding> = previous
        .iter()
        .map(|f| ((f.asset_fingerprint.clone(), f.plugin_id.clone()), f))
        .collect();

    let mut seen: BTreeMap<(String, String), ()> = BTreeMap::new();
    let mut resolved = Vec::with_capacity(current.len());

    for mut finding in current {
        let key = (finding.asset_fingerprint.clone(), finding.plugin_id.clone());
        seen.insert(key.clone(), ());
        match prior.get(&key) {
            Some(prev) if prev.status == RemediationStatus::Remediated => {
                finding.status = RemediationStatus::Reopened;
                finding.first_seen = prev.first_seen;
                finding.remediation_date = None;
            }
            Some(prev) => {
                finding.status = RemediationStatus::Open;
                finding.first_seen = prev.first_seen;
                finding.remediation_date = None;
            }
            None => {
                finding.status = RemediationStatus::Open;
                finding.first_seen = session.scan_date;
                finding.remediation_date = None;
            }
        }
        finding.last_seen = session.scan_date;
        resolved.push(finding);
    }

    // Open pairs that vanished are considered fixed as of this scan.
    for (key, prev) in &prior {
        if seen.contains_key(key) || !prev.status.is_open() {
            continue;
        }
        resolved.push(Finding {
            id: hash::finding_id(&prev.asset_fingerprint, &prev.plugin_id, &session.id),
            asset_fingerprint: prev.asset_fingerprint.clone(),
            plugin_id: prev.plugin_id.clone(),
            session_id: session.id.clone(),
            severity: prev.severity,
            port: prev.port,
            protocol: prev.protocol.clone(),
            service: prev.service.clone(),
            first_seen: prev.first_seen,
            last_seen: prev.last_seen,
            status: RemediationStatus::Remediated,
            remediation_date: Some(session.scan_date),
            evidence: prev.evidence.clone(),
        });
    }

    resolved.sort_by(|a, b| a.id.cmp(&b.id));
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Severity;
    use chrono::{DateTime, TimeZone, Utc};

    fn session(id: &str, day: u32) -> ScanSession {
        ScanSession {
            id: id.to_string(),
            name: "weekly".to_string(),
            scan_date: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
            source_hash: id.to_string(),
            total_assets: 0,
            total_findings: 0,
        }
    }

    fn finding(fp: &str, plugin: &str, session_id: &str, at: DateTime<Utc>) -> Finding {
        Finding {
            id: hash::finding_id(fp, plugin, session_id),
            asset_fingerprint: fp.to_string(),
            plugin_id: plugin.to_string(),
            session_id: session_id.to_string(),
            severity: Severity::High,
            port: None,
            protocol: None,
            service: None,
            first_seen: at,
            last_seen: at,
            status: RemediationStatus::Open,
            remediation_date: None,
            evidence: None,
        }
    }

    fn by_plugin<'a>(findings: &'a [Finding], plugin: &str) -> &'a Finding {
        findings.iter().find(|f| f.plugin_id == plugin).unwrap()
    }

    #[test]
    fn first_session_opens_everything() {
        let s = session("scan_a", 1);
        let current = vec![finding("fp1", "v1", "scan_a", s.scan_date)];
        let resolved = resolve_statuses(&s, current, &[]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, RemediationStatus::Open);
        assert_eq!(resolved[0].first_seen, s.scan_date);
    }

    #[test]
    fn disappeared_pair_becomes_remediated() {
        let a = session("scan_a", 1);
        let b = session("scan_b", 8);
        let prev = vec![
            finding("fp1", "v1", "scan_a", a.scan_date),
            finding("fp1", "v2", "scan_a", a.scan_date),
        ];
        let current = vec![finding("fp1", "v2", "scan_b", b.scan_date)];
        let resolved = resolve_statuses(&b, current, &prev);
        assert_eq!(resolved.len(), 2);

        let v1 = by_plugin(&resolved, "v1");
        assert_eq!(v1.status, RemediationStatus::Remediated);
        assert_eq!(v1.remediation_date, Some(b.scan_date));
        assert_eq!(v1.first_seen, a.scan_date);
        assert_eq!(v1.session_id, "scan_b");

        let v2 = by_plugin(&resolved, "v2");
        assert_eq!(v2.status, RemediationStatus::Open);
        assert_eq!(v2.first_seen, a.scan_date);
    }

    #[test]
    fn remediated_pair_seen_again_is_reopened() {
        let a = session("scan_a", 1);
        let c = session("scan_c", 15);
        let mut prev = finding("fp1", "v1", "scan_b", a.scan_date);
        prev.status = RemediationStatus::Remediated;
        prev.remediation_date = Some(Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap());

        let current = vec![finding("fp1", "v1", "scan_c", c.scan_date)];
        let resolved = resolve_statuses(&c, current, &[prev]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].status, RemediationStatus::Reopened);
        assert_eq!(resolved[0].first_seen, a.scan_date);
        assert_eq!(resolved[0].remediation_date, None);
    }

    #[test]
    fn already_remediated_pair_is_not_resynthesized() {
        let b = session("scan_b", 8);
        let mut prev = finding("fp1", "v1", "scan_a", b.scan_date);
        prev.status = RemediationStatus::Remediated;
        prev.remediation_date = Some(b.scan_date);
        let resolved = resolve_statuses(&b, vec![], &[prev]);
        assert!(resolved.is_empty());
    }
}
