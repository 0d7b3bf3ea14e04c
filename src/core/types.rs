use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type AttributeBag = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Host,
    CodeProject,
    Website,
    Image,
    CloudResource,
    Unknown,
}

impl AssetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Host => "host",
            AssetClass::CodeProject => "code_project",
            AssetClass::Website => "website",
            AssetClass::Image => "image",
            AssetClass::CloudResource => "cloud_resource",
            AssetClass::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "host" => AssetClass::Host,
            "code_project" | "code project" | "repository" => AssetClass::CodeProject,
            "website" | "web site" | "url" => AssetClass::Website,
            "image" | "container_image" | "container image" => AssetClass::Image,
            "cloud_resource" | "cloud resource" => AssetClass::CloudResource,
            _ => AssetClass::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "info" | "informational" | "none" | "0" => Some(Severity::Info),
            "low" | "1" => Some(Severity::Low),
            "medium" | "moderate" | "2" => Some(Severity::Medium),
            "high" | "3" => Some(Severity::High),
            "critical" | "4" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Low => "Low",
            Severity::Medium => "Medium",
            Severity::High => "High",
            Severity::Critical => "Critical",
        }
    }

    /// Actionable levels, most severe first. Info findings never drive MTTR.
    pub fn actionable() -> [Severity; 4] {
        [
            Severity::Critical,
            Severity::High,
            Severity::Medium,
            Severity::Low,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub fingerprint: String,
    pub class: AssetClass,
    pub attributes: AttributeBag,
    pub first_discovered: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub criticality: u8,
    #[serde(default)]
    pub group_paths: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Asset {
    /// Max of the asset's own criticality and every matched tag contribution.
    pub fn effective_criticality(&self, tag_scores: &BTreeMap<String, u8>) -> u8 {
        let tag_max = self
            .tags
            .iter()
            .filter_map(|t| tag_scores.get(t).copied())
            .max()
            .unwrap_or(0);
        self.criticality.max(tag_max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Discovered,
    Changed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub prior: Option<String>,
    pub new: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetEvent {
    pub fingerprint: String,
    pub session_id: String,
    pub kind: EventKind,
    pub changes: Vec<FieldChange>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: String,
    pub name: String,
    pub scan_date: DateTime<Utc>,
    pub source_hash: String,
    pub total_assets: u64,
    pub total_findings: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnerabilityDefinition {
    pub plugin_id: String,
    pub name: String,
    pub severity: Severity,
    pub cvss_base_score: Option<f64>,
    pub family: Option<String>,
    pub description: Option<String>,
    pub solution: Option<String>,
    pub synopsis: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Open,
    Remediated,
    Reopened,
}

impl RemediationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationStatus::Open => "open",
            RemediationStatus::Remediated => "remediated",
            RemediationStatus::Reopened => "reopened",
        }
    }

    /// Counts toward the open set a later scan is diffed against.
    pub fn is_open(&self) -> bool {
        matches!(self, RemediationStatus::Open | RemediationStatus::Reopened)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub asset_fingerprint: String,
    pub plugin_id: String,
    pub session_id: String,
    pub severity: Severity,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub service: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: RemediationStatus,
    pub remediation_date: Option<DateTime<Utc>>,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    Manual,
    Imported,
    Dynamic,
}

impl TagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::Manual => "manual",
            TagKind::Imported => "imported",
            TagKind::Dynamic => "dynamic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagAssignment {
    pub fingerprint: String,
    pub tag: String,
    pub kind: TagKind,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAssignment {
    pub fingerprint: String,
    pub group_path: String,
    pub auto_applied: bool,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MttrReport {
    pub overall_days: f64,
    pub overall_is_fallback: bool,
    pub by_severity: BTreeMap<String, f64>,
    pub by_group: BTreeMap<String, f64>,
    pub by_class: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityReport {
    pub total_findings: u64,
    pub open_findings: u64,
    pub remediated_findings: u64,
    pub remediation_rate_pct: f64,
    pub avg_daily_remediation: f64,
    pub window_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendRow {
    pub day: NaiveDate,
    pub new_findings: u64,
    pub remediated_findings: u64,
    pub reopened_findings: u64,
    pub open_by_severity: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub id: String,
    pub session_id: String,
    pub generated_at: DateTime<Utc>,
    pub mttr: MttrReport,
    pub capacity: CapacityReport,
    pub trend: Vec<TrendRow>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Markdown,
    Csv,
}
