//! Loads one scan-session input file into a typed batch.
//!
//! The input is a JSON document: a `session` descriptor, a list of asset
//! `observations` keyed by a file-local `ref`, and a flat `findings` list
//! pointing back at those refs. The session id is derived from the source
//! hash, so feeding the same file twice converges on the same rows.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::hash;
use crate::core::types::{
    AssetClass, AttributeBag, ScanSession, Severity, VulnerabilityDefinition,
};

#[derive(Debug, Clone, Deserialize)]
struct SessionDocument {
    session: SessionDescriptor,
    #[serde(default)]
    observations: Vec<ObservationRecord>,
    #[serde(default)]
    findings: Vec<FindingRecord>,
}

#[derive(Debug, Clone, Deserialize)]
struct SessionDescriptor {
    name: String,
    scan_date: DateTime<Utc>,
    source_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ObservationRecord {
    #[serde(rename = "ref")]
    reference: String,
    #[serde(default = "default_class")]
    class: String,
    #[serde(default)]
    attributes: AttributeBag,
    criticality: Option<u8>,
}

fn default_class() -> String {
    "host".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct FindingRecord {
    asset_ref: String,
    plugin_id: String,
    severity: String,
    #[serde(default)]
    name: Option<String>,
    port: Option<u16>,
    protocol: Option<String>,
    service: Option<String>,
    evidence: Option<String>,
    cvss_base_score: Option<f64>,
    family: Option<String>,
    description: Option<String>,
    solution: Option<String>,
    synopsis: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ObservationInput {
    pub reference: String,
    pub class: AssetClass,
    pub attributes: AttributeBag,
    pub criticality: Option<u8>,
    pub findings: Vec<FindingInput>,
}

#[derive(Debug, Clone)]
pub struct FindingInput {
    pub plugin_id: String,
    pub severity: Severity,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub service: Option<String>,
    pub evidence: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionBatch {
    pub session: ScanSession,
    pub observations: Vec<ObservationInput>,
    pub definitions: Vec<VulnerabilityDefinition>,
}

pub fn load_session(path: &Path) -> Result<SessionBatch> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("cannot read {}: {}", path.display(), e))?;
    let doc: SessionDocument = serde_json::from_str(&content)
        .map_err(|e| anyhow!("cannot parse {}: {}", path.display(), e))?;
    let source_hash = match doc.session.source_hash.clone() {
        Some(h) => h,
        None => hash::hash_file(path)?,
    };
    Ok(build_batch(doc, source_hash))
}

fn build_batch(doc: SessionDocument, source_hash: String) -> SessionBatch {
    let mut by_ref: BTreeMap<String, ObservationInput> = BTreeMap::new();
    for obs in doc.observations {
        if by_ref.contains_key(&obs.reference) {
            tracing::warn!(reference = %obs.reference, "duplicate observation ref; keeping first");
            continue;
        }
        by_ref.insert(
            obs.reference.clone(),
            ObservationInput {
                reference: obs.reference,
                class: AssetClass::parse(&obs.class),
                attributes: obs.attributes,
                criticality: obs.criticality,
                findings: Vec::new(),
            },
        );
    }

    // Plugin metadata rides on the finding rows, scanner-export style; the
    // last row for a plugin wins, which is how re-published definitions
    // update in place.
    let mut definitions: BTreeMap<String, VulnerabilityDefinition> = BTreeMap::new();
    let mut total_findings = 0u64;
    for record in doc.findings {
        let Some(severity) = Severity::parse(&record.severity) else {
            tracing::warn!(
                plugin = %record.plugin_id,
                severity = %record.severity,
                "unknown severity; skipping finding"
            );
            continue;
        };
        let Some(obs) = by_ref.get_mut(&record.asset_ref) else {
            tracing::warn!(
                asset_ref = %record.asset_ref,
                plugin = %record.plugin_id,
                "finding references unknown observation; skipping"
            );
            continue;
        };
        definitions.insert(
            record.plugin_id.clone(),
            VulnerabilityDefinition {
                plugin_id: record.plugin_id.clone(),
                name: record
                    .name
                    .unwrap_or_else(|| format!("plugin {}", record.plugin_id)),
                severity,
                cvss_base_score: record.cvss_base_score,
                family: record.family,
                description: record.description,
                solution: record.solution,
                synopsis: record.synopsis,
            },
        );
        obs.findings.push(FindingInput {
            plugin_id: record.plugin_id,
            severity,
            port: record.port,
            protocol: record.protocol,
            service: record.service,
            evidence: record.evidence,
        });
        total_findings += 1;
    }

    let observations: Vec<ObservationInput> = by_ref.into_values().collect();
    let session = ScanSession {
        id: hash::session_id(&source_hash),
        name: doc.session.name,
        scan_date: doc.session.scan_date,
        source_hash,
        total_assets: observations.len() as u64,
        total_findings,
    };

    SessionBatch {
        session,
        observations,
        definitions: definitions.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(doc: &str) -> SessionBatch {
        let doc: SessionDocument = serde_json::from_str(doc).unwrap();
        build_batch(doc, "testhash".to_string())
    }

    #[test]
    fn findings_attach_to_their_observation() {
        let batch = parse(
            r#"{
                "session": {"name": "weekly", "scan_date": "2024-03-01T00:00:00Z"},
                "observations": [
                    {"ref": "a1", "class": "host", "attributes": {"ip_address": "10.0.0.1"}}
                ],
                "findings": [
                    {"asset_ref": "a1", "plugin_id": "19506", "severity": "High", "port": 443},
                    {"asset_ref": "ghost", "plugin_id": "11111", "severity": "Low"}
                ]
            }"#,
        );
        assert_eq!(batch.observations.len(), 1);
        assert_eq!(batch.observations[0].findings.len(), 1);
        assert_eq!(batch.session.total_findings, 1);
        assert_eq!(batch.definitions.len(), 1);
    }

    #[test]
    fn session_id_derives_from_source_hash() {
        let batch = parse(
            r#"{"session": {"name": "w", "scan_date": "2024-03-01T00:00:00Z"}}"#,
        );
        assert_eq!(batch.session.id, crate::core::hash::session_id("testhash"));
        assert_eq!(batch.session.source_hash, "testhash");
    }

    #[test]
    fn bad_severity_is_skipped() {
        let batch = parse(
            r#"{
                "session": {"name": "w", "scan_date": "2024-03-01T00:00:00Z"},
                "observations": [{"ref": "a1", "attributes": {"hostname": "web"}}],
                "findings": [{"asset_ref": "a1", "plugin_id": "1", "severity": "severe"}]
            }"#,
        );
        assert_eq!(batch.session.total_findings, 0);
        assert!(batch.definitions.is_empty());
    }
}
