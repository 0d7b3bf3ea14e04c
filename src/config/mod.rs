use std::{fs, path::Path};

use serde::Deserialize;

use crate::core::error::LedgerError;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    /// Rule document applied on every ingest unless overridden per run.
    #[serde(default)]
    pub rules_path: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
    /// Look-back window for capacity metrics, in days.
    #[serde(default = "default_metrics_window_days")]
    pub metrics_window_days: i64,
}

pub fn load_config(path: Option<&str>) -> Result<AppConfig, LedgerError> {
    let default_path = Path::new("config/remtrack.toml");
    let path = path.map(Path::new).unwrap_or(default_path);

    if !path.exists() {
        return Ok(default_config());
    }

    let content = fs::read_to_string(path).map_err(|e| LedgerError::Config(e.to_string()))?;
    let cfg: AppConfig =
        toml::from_str(&content).map_err(|e| LedgerError::Config(e.to_string()))?;
    Ok(cfg)
}

/// A `--log-file` flag wins over the configured path.
pub fn resolve_log_file(cli_override: Option<&str>, cfg: &AppConfig) -> String {
    cli_override
        .map(str::to_string)
        .unwrap_or_else(|| cfg.log_file.clone())
}

pub fn default_config() -> AppConfig {
    AppConfig {
        db_path: default_db_path(),
        log_file: default_log_file(),
        rules_path: None,
        max_concurrent: default_max_concurrent(),
        lock_retries: default_lock_retries(),
        lock_backoff_ms: default_lock_backoff_ms(),
        metrics_window_days: default_metrics_window_days(),
    }
}

fn default_db_path() -> String {
    "data/remtrack.db".to_string()
}

fn default_log_file() -> String {
    "data/remtrack.log".to_string()
}

fn default_max_concurrent() -> usize {
    8
}

fn default_lock_retries() -> u32 {
    5
}

fn default_lock_backoff_ms() -> u64 {
    20
}

fn default_metrics_window_days() -> i64 {
    30
}
