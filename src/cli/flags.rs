use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::core::types::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "remtrack",
    version,
    about = "Vulnerability scan ingestion and remediation tracking"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database path
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Config file path (TOML). Default: config/remtrack.toml
    #[arg(long)]
    pub config: Option<String>,

    /// Write rendered output to this path instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormatArg,

    /// Increase verbosity (info, debug, trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log file path, overriding the configured one
    #[arg(long)]
    pub log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest one scan-session file
    Ingest {
        /// Session input file (JSON)
        #[arg(long)]
        input: PathBuf,
        /// Rule document (TOML) overriding the configured one
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Skip the metrics stage after ingestion
        #[arg(long)]
        no_metrics: bool,
    },
    /// Ingest every *.json session file in a directory, metrics after the last
    IngestDir {
        #[arg(long)]
        input: PathBuf,
        /// Rule document (TOML) overriding the configured one
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    /// Recompute metrics from stored data without ingesting
    Metrics,
    /// Show the trend window from stored daily rows
    Trend {
        /// Window size (7d|30d|90d)
        #[arg(long)]
        window: String,
    },
    /// Render the latest stored metric snapshot
    Report,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OutputFormatArg {
    Json,
    Jsonl,
    Markdown,
    Csv,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(value: OutputFormatArg) -> Self {
        match value {
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Jsonl => OutputFormat::Jsonl,
            OutputFormatArg::Markdown => OutputFormat::Markdown,
            OutputFormatArg::Csv => OutputFormat::Csv,
        }
    }
}
