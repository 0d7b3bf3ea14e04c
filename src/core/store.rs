//! SQLite persistence. Rows carry a full `data_json` serialization next to
//! the columns queries filter on, so schema churn stays cheap and reads
//! rehydrate through serde. All multi-row writes go through one transaction.

use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::types::{
    Asset, AssetEvent, Finding, GroupAssignment, MetricSnapshot, ScanSession, TagAssignment,
    TrendRow, VulnerabilityDefinition,
};

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn default_path() -> std::path::PathBuf {
        std::path::PathBuf::from("data").join("remtrack.db")
    }

    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS scan_sessions (
              id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              scan_date TEXT NOT NULL,
              source_hash TEXT NOT NULL,
              data_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_hash ON scan_sessions(source_hash);
            CREATE INDEX IF NOT EXISTS idx_sessions_date ON scan_sessions(scan_date);

            CREATE TABLE IF NOT EXISTS assets (
              fingerprint TEXT PRIMARY KEY,
              class TEXT NOT NULL,
              is_active INTEGER NOT NULL,
              last_seen TEXT NOT NULL,
              data_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS asset_events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              fingerprint TEXT NOT NULL,
              session_id TEXT NOT NULL,
              kind TEXT NOT NULL,
              at TEXT NOT NULL,
              data_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_fp ON asset_events(fingerprint);

            CREATE TABLE IF NOT EXISTS vulnerability_definitions (
              plugin_id TEXT PRIMARY KEY,
              severity TEXT NOT NULL,
              data_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS findings (
              id TEXT PRIMARY KEY,
              asset_fingerprint TEXT NOT NULL,
              plugin_id TEXT NOT NULL,
              session_id TEXT NOT NULL,
              severity TEXT NOT NULL,
              status TEXT NOT NULL,
              first_seen TEXT NOT NULL,
              remediation_date TEXT,
              data_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_findings_session ON findings(session_id);
            CREATE INDEX IF NOT EXISTS idx_findings_status ON findings(status);
            CREATE INDEX IF NOT EXISTS idx_findings_pair ON findings(asset_fingerprint, plugin_id);

            CREATE TABLE IF NOT EXISTS group_assignments (
              fingerprint TEXT NOT NULL,
              group_path TEXT NOT NULL,
              auto_applied INTEGER NOT NULL,
              assigned_at TEXT NOT NULL,
              data_json TEXT NOT NULL,
              PRIMARY KEY (fingerprint, group_path)
            );

            CREATE TABLE IF NOT EXISTS tag_assignments (
              fingerprint TEXT NOT NULL,
              tag TEXT NOT NULL,
              kind TEXT NOT NULL,
              assigned_at TEXT NOT NULL,
              data_json TEXT NOT NULL,
              PRIMARY KEY (fingerprint, tag)
            );

            CREATE TABLE IF NOT EXISTS metric_snapshots (
              id TEXT PRIMARY KEY,
              session_id TEXT NOT NULL,
              generated_at TEXT NOT NULL,
              data_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trend_rows (
              day TEXT PRIMARY KEY,
              data_json TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    pub fn session_by_source_hash(&self, source_hash: &str) -> Result<Option<ScanSession>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM scan_sessions WHERE source_hash = ?1",
                params![source_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    /// Most recent session strictly before `scan_date`, skipping the session
    /// being ingested itself so a re-run never diffs against its own rows.
    pub fn previous_session(
        &self,
        scan_date: DateTime<Utc>,
        exclude_id: &str,
    ) -> Result<Option<ScanSession>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM scan_sessions
                 WHERE scan_date < ?1 AND id != ?2
                 ORDER BY scan_date DESC LIMIT 1",
                params![scan_date.to_rfc3339(), exclude_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub fn latest_session(&self) -> Result<Option<ScanSession>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM scan_sessions ORDER BY scan_date DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub fn sessions_chronological(&self) -> Result<Vec<ScanSession>> {
        self.load_all("SELECT data_json FROM scan_sessions ORDER BY scan_date ASC")
    }

    /// Persists one ingested session atomically. Every statement is an
    /// upsert on a stable key, which is what makes re-ingesting the same
    /// file converge instead of duplicating rows.
    #[allow(clippy::too_many_arguments)]
    pub fn persist_session(
        &mut self,
        session: &ScanSession,
        assets: &[Asset],
        events: &[AssetEvent],
        definitions: &[VulnerabilityDefinition],
        findings: &[Finding],
        groups: &[GroupAssignment],
        tags: &[TagAssignment],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT OR REPLACE INTO scan_sessions (id, name, scan_date, source_hash, data_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id,
                session.name,
                session.scan_date.to_rfc3339(),
                session.source_hash,
                serde_json::to_string(session)?
            ],
        )?;

        for asset in assets {
            tx.execute(
                "INSERT OR REPLACE INTO assets (fingerprint, class, is_active, last_seen, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    asset.fingerprint,
                    asset.class.as_str(),
                    asset.is_active as i64,
                    asset.last_seen.to_rfc3339(),
                    serde_json::to_string(asset)?
                ],
            )?;
        }

        // Events are append-only; a replayed session already wrote its rows,
        // so skip duplicates by (fingerprint, session, kind).
        for event in events {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM asset_events
                     WHERE fingerprint = ?1 AND session_id = ?2 AND kind = ?3 LIMIT 1",
                    params![
                        event.fingerprint,
                        event.session_id,
                        serde_json::to_string(&event.kind)?
                    ],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                continue;
            }
            tx.execute(
                "INSERT INTO asset_events (fingerprint, session_id, kind, at, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.fingerprint,
                    event.session_id,
                    serde_json::to_string(&event.kind)?,
                    event.at.to_rfc3339(),
                    serde_json::to_string(event)?
                ],
            )?;
        }

        for def in definitions {
            tx.execute(
                "INSERT OR REPLACE INTO vulnerability_definitions (plugin_id, severity, data_json)
                 VALUES (?1, ?2, ?3)",
                params![
                    def.plugin_id,
                    def.severity.as_str(),
                    serde_json::to_string(def)?
                ],
            )?;
        }

        for finding in findings {
            upsert_finding(&tx, finding)?;
        }

        for group in groups {
            tx.execute(
                "INSERT OR REPLACE INTO group_assignments
                 (fingerprint, group_path, auto_applied, assigned_at, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    group.fingerprint,
                    group.group_path,
                    group.auto_applied as i64,
                    group.assigned_at.to_rfc3339(),
                    serde_json::to_string(group)?
                ],
            )?;
        }

        for tag in tags {
            tx.execute(
                "INSERT OR REPLACE INTO tag_assignments
                 (fingerprint, tag, kind, assigned_at, data_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tag.fingerprint,
                    tag.tag,
                    tag.kind.as_str(),
                    tag.assigned_at.to_rfc3339(),
                    serde_json::to_string(tag)?
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn upsert_findings(&mut self, findings: &[Finding]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for finding in findings {
            upsert_finding(&tx, finding)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn all_assets(&self) -> Result<Vec<Asset>> {
        self.load_all("SELECT data_json FROM assets ORDER BY fingerprint ASC")
    }

    pub fn asset(&self, fingerprint: &str) -> Result<Option<Asset>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM assets WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub fn all_findings(&self) -> Result<Vec<Finding>> {
        self.load_all("SELECT data_json FROM findings ORDER BY id ASC")
    }

    pub fn open_findings(&self) -> Result<Vec<Finding>> {
        let mut stmt = self.conn.prepare(
            "SELECT data_json FROM findings WHERE status IN ('open', 'reopened') ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn findings_for_session(&self, session_id: &str) -> Result<Vec<Finding>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data_json FROM findings WHERE session_id = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![session_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn definitions(&self) -> Result<Vec<VulnerabilityDefinition>> {
        self.load_all("SELECT data_json FROM vulnerability_definitions ORDER BY plugin_id ASC")
    }

    pub fn events_for_asset(&self, fingerprint: &str) -> Result<Vec<AssetEvent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data_json FROM asset_events WHERE fingerprint = ?1 ORDER BY at ASC")?;
        let rows = stmt.query_map(params![fingerprint], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn store_snapshot(&mut self, snapshot: &MetricSnapshot) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metric_snapshots (id, session_id, generated_at, data_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.id,
                snapshot.session_id,
                snapshot.generated_at.to_rfc3339(),
                serde_json::to_string(snapshot)?
            ],
        )?;
        Ok(())
    }

    pub fn latest_snapshot(&self) -> Result<Option<MetricSnapshot>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT data_json FROM metric_snapshots ORDER BY generated_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(match json {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub fn upsert_trend_rows(&mut self, rows: &[TrendRow]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT OR REPLACE INTO trend_rows (day, data_json) VALUES (?1, ?2)",
                params![row.day.to_string(), serde_json::to_string(row)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn trend_rows_since(&self, since: NaiveDate) -> Result<Vec<TrendRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT data_json FROM trend_rows WHERE day >= ?1 ORDER BY day ASC")?;
        let rows = stmt.query_map(params![since.to_string()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    pub fn group_assignments(&self) -> Result<Vec<GroupAssignment>> {
        self.load_all("SELECT data_json FROM group_assignments ORDER BY fingerprint, group_path")
    }

    pub fn tag_assignments(&self) -> Result<Vec<TagAssignment>> {
        self.load_all("SELECT data_json FROM tag_assignments ORDER BY fingerprint, tag")
    }

    fn load_all<T: serde::de::DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}

fn upsert_finding(tx: &rusqlite::Transaction<'_>, finding: &Finding) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO findings
         (id, asset_fingerprint, plugin_id, session_id, severity, status, first_seen, remediation_date, data_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            finding.id,
            finding.asset_fingerprint,
            finding.plugin_id,
            finding.session_id,
            finding.severity.as_str(),
            finding.status.as_str(),
            finding.first_seen.to_rfc3339(),
            finding.remediation_date.map(|d| d.to_rfc3339()),
            serde_json::to_string(finding)?
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AssetClass, RemediationStatus, Severity};
    use chrono::TimeZone;
    use std::collections::{BTreeMap, BTreeSet};

    fn session(id: &str, hash: &str, date: DateTime<Utc>) -> ScanSession {
        ScanSession {
            id: id.to_string(),
            name: "weekly".to_string(),
            scan_date: date,
            source_hash: hash.to_string(),
            total_assets: 1,
            total_findings: 1,
        }
    }

    fn asset(fp: &str, at: DateTime<Utc>) -> Asset {
        Asset {
            fingerprint: fp.to_string(),
            class: AssetClass::Host,
            attributes: BTreeMap::new(),
            first_discovered: at,
            last_seen: at,
            is_active: true,
            criticality: 0,
            group_paths: BTreeSet::new(),
            tags: BTreeSet::new(),
        }
    }

    fn finding(id: &str, session_id: &str, status: RemediationStatus, at: DateTime<Utc>) -> Finding {
        Finding {
            id: id.to_string(),
            asset_fingerprint: "host:ip:10.0.0.1".to_string(),
            plugin_id: "19506".to_string(),
            session_id: session_id.to_string(),
            severity: Severity::High,
            port: Some(443),
            protocol: Some("tcp".to_string()),
            service: None,
            first_seen: at,
            last_seen: at,
            status,
            remediation_date: None,
            evidence: None,
        }
    }

    #[test]
    fn session_round_trip_and_hash_lookup() {
        let mut store = Store::in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let s = session("scan_a", "hash_a", at);
        store
            .persist_session(&s, &[], &[], &[], &[], &[], &[])
            .unwrap();
        let loaded = store.session_by_source_hash("hash_a").unwrap().unwrap();
        assert_eq!(loaded.id, "scan_a");
        assert!(store.session_by_source_hash("hash_b").unwrap().is_none());
    }

    #[test]
    fn previous_session_skips_self() {
        let mut store = Store::in_memory().unwrap();
        let first = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap();
        store
            .persist_session(&session("scan_a", "h1", first), &[], &[], &[], &[], &[], &[])
            .unwrap();
        store
            .persist_session(&session("scan_b", "h2", second), &[], &[], &[], &[], &[], &[])
            .unwrap();

        let prev = store.previous_session(second, "scan_b").unwrap().unwrap();
        assert_eq!(prev.id, "scan_a");
        assert!(store.previous_session(first, "scan_a").unwrap().is_none());
    }

    #[test]
    fn replayed_persist_does_not_duplicate() {
        let mut store = Store::in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let s = session("scan_a", "h1", at);
        let assets = vec![asset("host:ip:10.0.0.1", at)];
        let findings = vec![finding("find_1", "scan_a", RemediationStatus::Open, at)];
        for _ in 0..2 {
            store
                .persist_session(&s, &assets, &[], &[], &findings, &[], &[])
                .unwrap();
        }
        assert_eq!(store.all_assets().unwrap().len(), 1);
        assert_eq!(store.all_findings().unwrap().len(), 1);
        assert_eq!(store.sessions_chronological().unwrap().len(), 1);
    }

    #[test]
    fn open_findings_include_reopened() {
        let mut store = Store::in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let rows = vec![
            finding("find_1", "scan_a", RemediationStatus::Open, at),
            finding("find_2", "scan_a", RemediationStatus::Remediated, at),
            finding("find_3", "scan_a", RemediationStatus::Reopened, at),
        ];
        store.upsert_findings(&rows).unwrap();
        let open = store.open_findings().unwrap();
        let ids: Vec<&str> = open.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["find_1", "find_3"]);
    }

    #[test]
    fn trend_rows_upsert_by_day() {
        let mut store = Store::in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut row = TrendRow {
            day,
            new_findings: 3,
            remediated_findings: 0,
            reopened_findings: 0,
            open_by_severity: BTreeMap::new(),
        };
        store.upsert_trend_rows(std::slice::from_ref(&row)).unwrap();
        row.new_findings = 5;
        store.upsert_trend_rows(std::slice::from_ref(&row)).unwrap();

        let rows = store.trend_rows_since(day).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].new_findings, 5);
    }
}
