//! Command dispatch and run orchestration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::Duration;

use crate::cli::flags::{Cli, Command};
use crate::config::AppConfig;
use crate::core::rules::{self, EvalContext, RuleSet};
use crate::core::store::Store;
use crate::core::time::{now_utc, parse_window};
use crate::core::types::{
    Asset, Finding, GroupAssignment, MetricSnapshot, OutputFormat, ScanSession, Severity,
    TagAssignment, TagKind,
};
use crate::pipeline::{ingest, metrics, reconciler, reporter, resolver};

pub async fn run(cli: Cli, cfg: AppConfig) -> Result<()> {
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| PathBuf::from(&cfg.db_path));
    let mut store = Store::new(&db_path)?;
    let format: OutputFormat = cli.format.into();

    match cli.command {
        Command::Ingest {
            input,
            rules,
            no_metrics,
        } => {
            let ruleset = load_ruleset(rules.as_deref(), &cfg)?;
            let session = ingest_session_file(&mut store, &cfg, &ruleset, &input).await?;
            if !no_metrics {
                let snapshot = compute_metrics(&mut store, &cfg, &session.id)?;
                emit_snapshot(&snapshot, format, cli.output.as_deref(), false)?;
            }
            Ok(())
        }
        Command::IngestDir { input, rules } => {
            let ruleset = load_ruleset(rules.as_deref(), &cfg)?;
            let mut files: Vec<PathBuf> = std::fs::read_dir(&input)
                .map_err(|e| anyhow!("cannot read {}: {}", input.display(), e))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
                .collect();
            files.sort();
            if files.is_empty() {
                return Err(anyhow!("no *.json session files in {}", input.display()));
            }
            let mut last_session = None;
            for file in &files {
                let session = ingest_session_file(&mut store, &cfg, &ruleset, file).await?;
                last_session = Some(session);
            }
            // Metrics once, after the final session in the batch.
            if let Some(session) = last_session {
                let snapshot = compute_metrics(&mut store, &cfg, &session.id)?;
                emit_snapshot(&snapshot, format, cli.output.as_deref(), false)?;
            }
            Ok(())
        }
        Command::Metrics => {
            let session = store
                .latest_session()?
                .ok_or_else(|| anyhow!("no scan sessions ingested yet"))?;
            let snapshot = compute_metrics(&mut store, &cfg, &session.id)?;
            emit_snapshot(&snapshot, format, cli.output.as_deref(), true)
        }
        Command::Trend { window } => {
            let duration = parse_window(&window)?;
            let since = (now_utc() - duration).date_naive();
            let rows = store.trend_rows_since(since)?;
            match cli.output.as_deref() {
                Some(path) => reporter::write_trend(&rows, format, path),
                None => {
                    print!("{}", reporter::render_trend(&rows, format)?);
                    Ok(())
                }
            }
        }
        Command::Report => {
            let snapshot = store
                .latest_snapshot()?
                .ok_or_else(|| anyhow!("no metric snapshot stored yet; run ingest or metrics"))?;
            emit_snapshot(&snapshot, format, cli.output.as_deref(), true)
        }
    }
}

fn load_ruleset(override_path: Option<&Path>, cfg: &AppConfig) -> Result<RuleSet> {
    let path = override_path
        .map(Path::to_path_buf)
        .or_else(|| cfg.rules_path.as_ref().map(PathBuf::from));
    match path {
        Some(path) => {
            let set = rules::load_rules(&path)
                .map_err(|e| anyhow!("cannot load rules {}: {}", path.display(), e))?;
            tracing::info!(
                groups = set.groups.len(),
                tags = set.tags.len(),
                "rule document loaded from {}",
                path.display()
            );
            Ok(set)
        }
        None => Ok(rules::empty_rules()),
    }
}

/// One full session pass: load, reconcile, evaluate rules, resolve
/// remediation statuses, persist. Re-running the same file converges on the
/// same rows via the stable ids.
pub async fn ingest_session_file(
    store: &mut Store,
    cfg: &AppConfig,
    ruleset: &RuleSet,
    path: &Path,
) -> Result<ScanSession> {
    let batch = ingest::load_session(path)?;
    let mut session = batch.session.clone();
    if store.session_by_source_hash(&session.source_hash)?.is_some() {
        tracing::info!(session = %session.id, "session already ingested; re-run will converge");
    }

    let findings_by_ref: BTreeMap<String, Vec<ingest::FindingInput>> = batch
        .observations
        .iter()
        .map(|o| (o.reference.clone(), o.findings.clone()))
        .collect();

    let ledger: BTreeMap<String, Asset> = store
        .all_assets()?
        .into_iter()
        .map(|a| (a.fingerprint.clone(), a))
        .collect();
    let policy = reconciler::ReconcilePolicy {
        max_concurrent: cfg.max_concurrent,
        lock_retries: cfg.lock_retries,
        lock_backoff_ms: cfg.lock_backoff_ms,
    };
    let mut outcome =
        reconciler::reconcile(&session, batch.observations.clone(), ledger, policy).await;
    if outcome.contended > 0 {
        tracing::warn!(
            contended = outcome.contended,
            "observations dropped after lock retry exhaustion"
        );
    }

    // Current-session finding rows, initially open; the resolver rewrites
    // status and first_seen against the previous session.
    let mut current: BTreeMap<String, Finding> = BTreeMap::new();
    for (reference, inputs) in &findings_by_ref {
        let Some(fp) = outcome.fingerprints.get(reference) else {
            continue;
        };
        for input in inputs {
            let id = crate::core::hash::finding_id(fp, &input.plugin_id, &session.id);
            let entry = current.entry(id.clone()).or_insert_with(|| Finding {
                id,
                asset_fingerprint: fp.clone(),
                plugin_id: input.plugin_id.clone(),
                session_id: session.id.clone(),
                severity: input.severity,
                port: input.port,
                protocol: input.protocol.clone(),
                service: input.service.clone(),
                first_seen: session.scan_date,
                last_seen: session.scan_date,
                status: crate::core::types::RemediationStatus::Open,
                remediation_date: None,
                evidence: input.evidence.clone(),
            });
            // Same pair reported twice keeps the worse severity.
            if input.severity > entry.severity {
                entry.severity = input.severity;
            }
        }
    }

    let open_severities = open_severities_by_asset(store, current.values())?;
    let (group_rows, tag_rows) =
        evaluate_rules(ruleset, &mut outcome.assets, &open_severities);

    // Critical findings on assets whose tags push them to top criticality
    // deserve an operator-visible note.
    let tag_scores = ruleset.tag_scores();
    for asset in &outcome.assets {
        let criticality = asset.effective_criticality(&tag_scores);
        let has_critical = open_severities
            .get(&asset.fingerprint)
            .map(|s| s.contains(&Severity::Critical))
            .unwrap_or(false);
        if criticality >= 4 && has_critical {
            tracing::warn!(
                fingerprint = %asset.fingerprint,
                criticality,
                "open critical finding on high-criticality asset"
            );
        }
    }

    let previous_findings = match store.previous_session(session.scan_date, &session.id)? {
        Some(prev) => store.findings_for_session(&prev.id)?,
        None => Vec::new(),
    };
    let resolved = resolver::resolve_statuses(
        &session,
        current.into_values().collect(),
        &previous_findings,
    );

    session.total_assets = outcome.assets.len() as u64;
    session.total_findings = resolved.len() as u64;
    store.persist_session(
        &session,
        &outcome.assets,
        &outcome.events,
        &batch.definitions,
        &resolved,
        &group_rows,
        &tag_rows,
    )?;

    tracing::info!(
        session = %session.id,
        assets = session.total_assets,
        findings = session.total_findings,
        skipped = outcome.skipped,
        "session ingested from {}",
        path.display()
    );
    Ok(session)
}

/// Dynamic rule evaluation over the touched assets. Assignments are only
/// ever added; static assignments made outside the rules survive every
/// re-evaluation.
fn evaluate_rules(
    ruleset: &RuleSet,
    assets: &mut [Asset],
    open_severities: &BTreeMap<String, BTreeSet<Severity>>,
) -> (Vec<GroupAssignment>, Vec<TagAssignment>) {
    let mut group_rows = Vec::new();
    let mut tag_rows = Vec::new();
    let empty = BTreeSet::new();
    let now = now_utc();

    for asset in assets.iter_mut() {
        let severities = open_severities.get(&asset.fingerprint).unwrap_or(&empty);

        // Tags first, so tag_match group rules see this session's tags.
        let matched_tags: Vec<String> = {
            let ctx = EvalContext {
                attributes: &asset.attributes,
                tags: &asset.tags,
                open_severities: severities,
            };
            rules::matching_tags(ruleset, &ctx)
                .into_iter()
                .map(|t| t.name.clone())
                .collect()
        };
        for tag in matched_tags {
            if asset.tags.insert(tag.clone()) {
                tag_rows.push(TagAssignment {
                    fingerprint: asset.fingerprint.clone(),
                    tag,
                    kind: TagKind::Dynamic,
                    assigned_at: now,
                });
            }
        }

        let matched_groups: Vec<String> = {
            let ctx = EvalContext {
                attributes: &asset.attributes,
                tags: &asset.tags,
                open_severities: severities,
            };
            rules::matching_groups(ruleset, &ctx)
                .into_iter()
                .filter_map(|g| ruleset.arena.get(&g.name).map(|node| node.path.clone()))
                .collect()
        };
        for path in matched_groups {
            if asset.group_paths.insert(path.clone()) {
                group_rows.push(GroupAssignment {
                    fingerprint: asset.fingerprint.clone(),
                    group_path: path,
                    auto_applied: true,
                    assigned_at: now,
                });
            }
        }
    }
    (group_rows, tag_rows)
}

/// Open severities per asset: stored still-open findings plus everything the
/// current batch reports.
fn open_severities_by_asset<'a, I: Iterator<Item = &'a Finding>>(
    store: &Store,
    current: I,
) -> Result<BTreeMap<String, BTreeSet<Severity>>> {
    let mut map: BTreeMap<String, BTreeSet<Severity>> = BTreeMap::new();
    for finding in store.open_findings()? {
        map.entry(finding.asset_fingerprint.clone())
            .or_default()
            .insert(finding.severity);
    }
    for finding in current {
        map.entry(finding.asset_fingerprint.clone())
            .or_default()
            .insert(finding.severity);
    }
    Ok(map)
}

/// Recomputes the full metric snapshot from stored state and persists both
/// the snapshot and the per-day trend rows.
pub fn compute_metrics(
    store: &mut Store,
    cfg: &AppConfig,
    session_id: &str,
) -> Result<MetricSnapshot> {
    let findings = store.all_findings()?;
    let assets: BTreeMap<String, Asset> = store
        .all_assets()?
        .into_iter()
        .map(|a| (a.fingerprint.clone(), a))
        .collect();
    let snapshot = metrics::build_snapshot(
        session_id,
        &findings,
        &assets,
        Duration::days(cfg.metrics_window_days),
        now_utc(),
    );
    store.store_snapshot(&snapshot)?;
    store.upsert_trend_rows(&snapshot.trend)?;
    tracing::info!(
        session = %session_id,
        mttr = snapshot.mttr.overall_days,
        open = snapshot.capacity.open_findings,
        "metric snapshot stored"
    );
    Ok(snapshot)
}

fn emit_snapshot(
    snapshot: &MetricSnapshot,
    format: OutputFormat,
    output: Option<&Path>,
    to_stdout: bool,
) -> Result<()> {
    match output {
        Some(path) => reporter::write_snapshot(snapshot, format, path),
        None if to_stdout => {
            print!("{}", reporter::render_snapshot(snapshot, format)?);
            Ok(())
        }
        None => Ok(()),
    }
}
