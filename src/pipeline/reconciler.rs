//! Merges scan observations into the asset ledger.
//!
//! Each observation resolves to a fingerprint, then either creates an asset
//! or merges into the existing one. Merging never erases: a field only
//! changes when the incoming value is non-empty, and a `Changed` event is
//! recorded only when something actually differed. Observations run on a
//! semaphore-bounded worker pool with a per-fingerprint async lock; lock
//! acquisition is retried with backoff a bounded number of times and then
//! surfaced as a batch warning.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;

use crate::core::error::LedgerError;
use crate::core::fingerprint;
use crate::core::time::now_utc;
use crate::core::types::{
    Asset, AssetEvent, EventKind, FieldChange, ScanSession,
};

use super::ingest::ObservationInput;

#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    pub max_concurrent: usize,
    pub lock_retries: u32,
    pub lock_backoff_ms: u64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            lock_retries: 5,
            lock_backoff_ms: 20,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Every asset touched this session, sorted by fingerprint.
    pub assets: Vec<Asset>,
    pub events: Vec<AssetEvent>,
    /// Observation ref → resolved fingerprint, for attaching findings.
    pub fingerprints: BTreeMap<String, String>,
    pub skipped: u64,
    pub contended: u64,
}

struct Shared {
    ledger: Mutex<BTreeMap<String, Asset>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: Mutex<Vec<AssetEvent>>,
    fingerprints: Mutex<BTreeMap<String, String>>,
    skipped: Mutex<u64>,
    contended: Mutex<u64>,
}

pub async fn reconcile(
    session: &ScanSession,
    observations: Vec<ObservationInput>,
    ledger: BTreeMap<String, Asset>,
    policy: ReconcilePolicy,
) -> ReconcileOutcome {
    let shared = Arc::new(Shared {
        ledger: Mutex::new(ledger),
        locks: Mutex::new(HashMap::new()),
        events: Mutex::new(Vec::new()),
        fingerprints: Mutex::new(BTreeMap::new()),
        skipped: Mutex::new(0),
        contended: Mutex::new(0),
    });
    let semaphore = Arc::new(Semaphore::new(policy.max_concurrent.max(1)));

    let mut tasks = Vec::new();
    for obs in observations {
        let shared = Arc::clone(&shared);
        let semaphore = Arc::clone(&semaphore);
        let session = session.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            process_observation(&shared, &session, obs, &policy).await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }

    let shared = Arc::try_unwrap(shared).unwrap_or_else(|_| unreachable!("tasks joined"));
    let ledger = shared.ledger.into_inner().unwrap_or_else(|e| e.into_inner());
    let fingerprints = shared
        .fingerprints
        .into_inner()
        .unwrap_or_else(|e| e.into_inner());
    let mut events = shared.events.into_inner().unwrap_or_else(|e| e.into_inner());
    events.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

    let touched: Vec<Asset> = ledger
        .into_values()
        .filter(|a| fingerprints.values().any(|fp| fp == &a.fingerprint))
        .collect();

    ReconcileOutcome {
        assets: touched,
        events,
        fingerprints,
        skipped: shared.skipped.into_inner().unwrap_or_else(|e| e.into_inner()),
        contended: shared
            .contended
            .into_inner()
            .unwrap_or_else(|e| e.into_inner()),
    }
}

async fn process_observation(
    shared: &Shared,
    session: &ScanSession,
    obs: ObservationInput,
    policy: &ReconcilePolicy,
) {
    let fp = match fingerprint::resolve(obs.class, &obs.attributes) {
        Ok(fp) => fp,
        Err(LedgerError::Identity(msg)) => {
            tracing::warn!(
                reference = %obs.reference,
                payload = ?obs.attributes,
                "skipping observation: {}",
                msg
            );
            *shared.skipped.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            return;
        }
        Err(err) => {
            tracing::warn!(reference = %obs.reference, "skipping observation: {}", err);
            *shared.skipped.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            return;
        }
    };

    let lock = {
        let mut locks = shared.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(fp.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    };

    let mut guard = None;
    for attempt in 0..=policy.lock_retries {
        match lock.try_lock() {
            Ok(g) => {
                guard = Some(g);
                break;
            }
            Err(_) if attempt < policy.lock_retries => {
                tokio::time::sleep(std::time::Duration::from_millis(
                    policy.lock_backoff_ms * (attempt as u64 + 1),
                ))
                .await;
            }
            Err(_) => {}
        }
    }
    let Some(_guard) = guard else {
        let err = LedgerError::LockContention(fp.clone());
        tracing::warn!(reference = %obs.reference, "{}", err);
        *shared.contended.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        return;
    };

    let event = {
        let mut ledger = shared.ledger.lock().unwrap_or_else(|e| e.into_inner());
        apply_observation(&mut ledger, &fp, session, &obs)
    };
    if let Some(event) = event {
        shared
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
    shared
        .fingerprints
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(obs.reference.clone(), fp);
}

fn apply_observation(
    ledger: &mut BTreeMap<String, Asset>,
    fp: &str,
    session: &ScanSession,
    obs: &ObservationInput,
) -> Option<AssetEvent> {
    match ledger.get_mut(fp) {
        Some(asset) => merge_asset(asset, session, obs),
        None => {
            let asset = Asset {
                fingerprint: fp.to_string(),
                class: obs.class,
                attributes: obs.attributes.clone(),
                first_discovered: session.scan_date,
                last_seen: session.scan_date,
                is_active: true,
                criticality: obs.criticality.unwrap_or(0),
                group_paths: Default::default(),
                tags: Default::default(),
            };
            ledger.insert(fp.to_string(), asset);
            Some(AssetEvent {
                fingerprint: fp.to_string(),
                session_id: session.id.clone(),
                kind: EventKind::Discovered,
                changes: Vec::new(),
                at: now_utc(),
            })
        }
    }
}

/// Field-level last-write-wins, but only for non-empty incoming values.
fn merge_asset(
    asset: &mut Asset,
    session: &ScanSession,
    obs: &ObservationInput,
) -> Option<AssetEvent> {
    let mut changes = Vec::new();
    for (key, value) in &obs.attributes {
        if value.trim().is_empty() {
            continue;
        }
        match asset.attributes.get(key) {
            Some(prior) if prior == value => {}
            prior => {
                changes.push(FieldChange {
                    field: key.clone(),
                    prior: prior.cloned(),
                    new: value.clone(),
                });
                asset.attributes.insert(key.clone(), value.clone());
            }
        }
    }
    if let Some(crit) = obs.criticality {
        if crit != asset.criticality {
            changes.push(FieldChange {
                field: "criticality".to_string(),
                prior: Some(asset.criticality.to_string()),
                new: crit.to_string(),
            });
            asset.criticality = crit;
        }
    }
    if session.scan_date > asset.last_seen {
        asset.last_seen = session.scan_date;
    }
    asset.is_active = true;

    if changes.is_empty() {
        None
    } else {
        Some(AssetEvent {
            fingerprint: asset.fingerprint.clone(),
            session_id: session.id.clone(),
            kind: EventKind::Changed,
            changes,
            at: now_utc(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AssetClass;
    use chrono::{TimeZone, Utc};

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

    fn obs(reference: &str, pairs: &[(&str, &str)]) -> ObservationInput {
        ObservationInput {
            reference: reference.to_string(),
            class: AssetClass::Host,
            attributes: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            criticality: None,
            findings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn new_asset_emits_discovered() {
        let out = reconcile(
            &session("scan_a", 1),
            vec![obs("a1", &[("ip_address", "10.0.0.1"), ("hostname", "web-01")])],
            BTreeMap::new(),
            ReconcilePolicy::default(),
        )
        .await;
        assert_eq!(out.assets.len(), 1);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].kind, EventKind::Discovered);
        assert_eq!(out.fingerprints["a1"], "host:net:10.0.0.1|web-01");
    }

    #[tokio::test]
    async fn merge_keeps_non_empty_prior_fields() {
        let first = reconcile(
            &session("scan_a", 1),
            vec![obs(
                "a1",
                &[
                    ("ip_address", "10.0.0.1"),
                    ("hostname", "web-01"),
                    ("operating_system", "Ubuntu 22.04"),
                ],
            )],
            BTreeMap::new(),
            ReconcilePolicy::default(),
        )
        .await;
        let ledger: BTreeMap<String, Asset> = first
            .assets
            .into_iter()
            .map(|a| (a.fingerprint.clone(), a))
            .collect();

        let second = reconcile(
            &session("scan_b", 8),
            vec![obs(
                "a1",
                &[
                    ("ip_address", "10.0.0.1"),
                    ("hostname", "web-01"),
                    ("operating_system", ""),
                ],
            )],
            ledger,
            ReconcilePolicy::default(),
        )
        .await;
        let asset = &second.assets[0];
        assert_eq!(
            asset.attributes.get("operating_system").map(String::as_str),
            Some("Ubuntu 22.04")
        );
        assert_eq!(asset.last_seen, session("scan_b", 8).scan_date);
        // Nothing materially changed, so no Changed event.
        assert!(second.events.is_empty());
    }

    #[tokio::test]
    async fn changed_event_carries_prior_and_new() {
        let first = reconcile(
            &session("scan_a", 1),
            vec![obs("a1", &[("ip_address", "10.0.0.1"), ("hostname", "web-01")])],
            BTreeMap::new(),
            ReconcilePolicy::default(),
        )
        .await;
        let ledger: BTreeMap<String, Asset> = first
            .assets
            .into_iter()
            .map(|a| (a.fingerprint.clone(), a))
            .collect();

        let second = reconcile(
            &session("scan_b", 8),
            vec![obs(
                "a1",
                &[
                    ("ip_address", "10.0.0.1"),
                    ("hostname", "web-01"),
                    ("operating_system", "Ubuntu 24.04"),
                ],
            )],
            ledger,
            ReconcilePolicy::default(),
        )
        .await;
        assert_eq!(second.events.len(), 1);
        let event = &second.events[0];
        assert_eq!(event.kind, EventKind::Changed);
        assert_eq!(event.changes.len(), 1);
        assert_eq!(event.changes[0].field, "operating_system");
        assert_eq!(event.changes[0].prior, None);
        assert_eq!(event.changes[0].new, "Ubuntu 24.04");
    }

    #[tokio::test]
    async fn unidentifiable_observation_is_skipped() {
        let out = reconcile(
            &session("scan_a", 1),
            vec![
                obs("bad", &[("ip_address", "not-an-ip")]),
                obs("good", &[("hostname", "db-01")]),
            ],
            BTreeMap::new(),
            ReconcilePolicy::default(),
        )
        .await;
        assert_eq!(out.skipped, 1);
        assert_eq!(out.assets.len(), 1);
        assert!(!out.fingerprints.contains_key("bad"));
    }

    #[tokio::test]
    async fn duplicate_observations_converge_on_one_asset() {
        let out = reconcile(
            &session("scan_a", 1),
            (0..16)
                .map(|i| obs(&format!("r{}", i), &[("hostname", "web-01")]))
                .collect(),
            BTreeMap::new(),
            ReconcilePolicy {
                max_concurrent: 8,
                lock_retries: 50,
                lock_backoff_ms: 1,
            },
        )
        .await;
        assert_eq!(out.assets.len(), 1);
        assert_eq!(out.contended, 0);
        assert_eq!(out.fingerprints.len(), 16);
    }
}
