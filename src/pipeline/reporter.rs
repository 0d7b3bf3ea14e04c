//! Renders metric snapshots and trend windows to json/jsonl/markdown/csv.

use std::fs;
use std::path::Path;

use anyhow::Result;

use crate::core::types::{MetricSnapshot, OutputFormat, Severity, TrendRow};

pub fn write_snapshot(snapshot: &MetricSnapshot, format: OutputFormat, path: &Path) -> Result<()> {
    let body = render_snapshot(snapshot, format)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)?;
    Ok(())
}

pub fn write_trend(rows: &[TrendRow], format: OutputFormat, path: &Path) -> Result<()> {
    let body = render_trend(rows, format)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, body)?;
    Ok(())
}

pub fn render_snapshot(snapshot: &MetricSnapshot, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => {
            let mut body = serde_json::to_string_pretty(snapshot)?;
            body.push('\n');
            body
        }
        OutputFormat::Jsonl => {
            let mut body = serde_json::to_string(snapshot)?;
            body.push('\n');
            body
        }
        OutputFormat::Markdown => snapshot_markdown(snapshot),
        OutputFormat::Csv => snapshot_csv(snapshot),
    })
}

pub fn render_trend(rows: &[TrendRow], format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => {
            let mut body = serde_json::to_string_pretty(rows)?;
            body.push('\n');
            body
        }
        OutputFormat::Jsonl => {
            let mut body = String::new();
            for row in rows {
                body.push_str(&serde_json::to_string(row)?);
                body.push('\n');
            }
            body
        }
        OutputFormat::Markdown => trend_markdown(rows),
        OutputFormat::Csv => trend_csv(rows),
    })
}

fn snapshot_markdown(snapshot: &MetricSnapshot) -> String {
    let mut out = String::new();
    out.push_str("# Remediation Metrics\n\n");
    out.push_str(&format!("Session: {}\n\n", snapshot.session_id));
    out.push_str(&format!(
        "Generated: {}\n\n",
        snapshot.generated_at.to_rfc3339()
    ));

    out.push_str("## MTTR\n\n");
    out.push_str(&format!(
        "- Overall: {} days{}\n",
        snapshot.mttr.overall_days,
        if snapshot.mttr.overall_is_fallback {
            " (default, no remediations observed)"
        } else {
            ""
        }
    ));
    for (severity, days) in &snapshot.mttr.by_severity {
        out.push_str(&format!("- {}: {} days\n", severity, days));
    }
    if !snapshot.mttr.by_group.is_empty() {
        out.push_str("\n| Group | MTTR (days) |\n|---|---|\n");
        for (path, days) in &snapshot.mttr.by_group {
            out.push_str(&format!("| {} | {} |\n", path, days));
        }
    }
    if !snapshot.mttr.by_class.is_empty() {
        out.push_str("\n| Class | MTTR (days) |\n|---|---|\n");
        for (class, days) in &snapshot.mttr.by_class {
            out.push_str(&format!("| {} | {} |\n", class, days));
        }
    }

    out.push_str("\n## Capacity\n\n");
    let cap = &snapshot.capacity;
    out.push_str(&format!(
        "- Total findings: {}\n- Open: {}\n- Remediated: {}\n- Remediation rate: {}%\n- Avg daily remediation ({}d window): {}\n\n",
        cap.total_findings,
        cap.open_findings,
        cap.remediated_findings,
        cap.remediation_rate_pct,
        cap.window_days,
        cap.avg_daily_remediation
    ));

    out.push_str("## Trend\n\n");
    out.push_str(&trend_markdown(&snapshot.trend));
    out
}

fn snapshot_csv(snapshot: &MetricSnapshot) -> String {
    let mut out = String::from("metric,value\n");
    out.push_str(&format!("overall_mttr_days,{}\n", snapshot.mttr.overall_days));
    for (severity, days) in &snapshot.mttr.by_severity {
        out.push_str(&format!("mttr_{},{}\n", severity.to_lowercase(), days));
    }
    let cap = &snapshot.capacity;
    out.push_str(&format!("total_findings,{}\n", cap.total_findings));
    out.push_str(&format!("open_findings,{}\n", cap.open_findings));
    out.push_str(&format!("remediated_findings,{}\n", cap.remediated_findings));
    out.push_str(&format!("remediation_rate_pct,{}\n", cap.remediation_rate_pct));
    out.push_str(&format!(
        "avg_daily_remediation,{}\n",
        cap.avg_daily_remediation
    ));
    out
}

fn trend_markdown(rows: &[TrendRow]) -> String {
    if rows.is_empty() {
        return "_No activity recorded._\n".to_string();
    }
    let mut out =
        String::from("| Day | New | Remediated | Reopened | Open (C/H/M/L) |\n|---|---|---|---|---|\n");
    for row in rows {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            row.day,
            row.new_findings,
            row.remediated_findings,
            row.reopened_findings,
            open_summary(row)
        ));
    }
    out
}

fn trend_csv(rows: &[TrendRow]) -> String {
    let mut out = String::from(
        "day,new_findings,remediated_findings,reopened_findings,open_critical,open_high,open_medium,open_low\n",
    );
    for row in rows {
        let count = |s: Severity| row.open_by_severity.get(s.as_str()).copied().unwrap_or(0);
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            row.day,
            row.new_findings,
            row.remediated_findings,
            row.reopened_findings,
            count(Severity::Critical),
            count(Severity::High),
            count(Severity::Medium),
            count(Severity::Low),
        ));
    }
    out
}

fn open_summary(row: &TrendRow) -> String {
    let count = |s: Severity| row.open_by_severity.get(s.as_str()).copied().unwrap_or(0);
    format!(
        "{}/{}/{}/{}",
        count(Severity::Critical),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn rows() -> Vec<TrendRow> {
        let mut open = BTreeMap::new();
        open.insert("High".to_string(), 2u64);
        vec![TrendRow {
            day: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            new_findings: 3,
            remediated_findings: 1,
            reopened_findings: 0,
            open_by_severity: open,
        }]
    }

    #[test]
    fn trend_csv_has_fixed_columns() {
        let body = render_trend(&rows(), OutputFormat::Csv).unwrap();
        let mut lines = body.lines();
        assert!(lines.next().unwrap().starts_with("day,new_findings"));
        assert_eq!(lines.next().unwrap(), "2024-03-01,3,1,0,0,2,0,0");
    }

    #[test]
    fn trend_jsonl_is_one_row_per_line() {
        let body = render_trend(&rows(), OutputFormat::Jsonl).unwrap();
        assert_eq!(body.lines().count(), 1);
        let parsed: TrendRow = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.new_findings, 3);
    }

    #[test]
    fn empty_trend_markdown_says_so() {
        let body = render_trend(&[], OutputFormat::Markdown).unwrap();
        assert!(body.contains("No activity"));
    }
}
