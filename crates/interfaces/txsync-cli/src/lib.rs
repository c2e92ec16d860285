pub mod accounts;
pub mod commands;

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDate};
use clap::ValueEnum;
use directories::ProjectDirs;
use txsync_core::{SortOrder, Timestamp};

const QUALIFIER: &str = "io";
const ORG: &str = "txsync";
const APP: &str = "txsync";

#[derive(ValueEnum, Clone, Debug, Copy)]
pub enum CliSortOrder {
    Asc,
    Desc,
}

impl From<CliSortOrder> for SortOrder {
    fn from(o: CliSortOrder) -> Self {
        match o {
            CliSortOrder::Asc => SortOrder::Ascending,
            CliSortOrder::Desc => SortOrder::Descending,
        }
    }
}

/// Platform data directory, used when neither `--data-dir` nor the env override is set.
pub fn default_data_dir() -> Result<Utf8PathBuf> {
    let proj_dirs = ProjectDirs::from(QUALIFIER, ORG, APP)
        .ok_or_else(|| anyhow!("Could not determine data directory"))?;
    Utf8PathBuf::from_path_buf(proj_dirs.data_dir().to_path_buf())
        .map_err(|p| anyhow!("Data directory is not valid UTF-8: {}", p.display()))
}

/// Accepts UNIX seconds, RFC 3339 timestamps or plain `YYYY-MM-DD` dates (UTC midnight).
pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    let s = s.trim();
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        return s.parse().with_context(|| format!("Invalid timestamp '{s}'"));
    }
    let secs = if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        dt.timestamp()
    } else {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{s}'"))?
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| anyhow!("Invalid date '{s}'"))?
            .and_utc()
            .timestamp()
    };
    u64::try_from(secs).map_err(|_| anyhow!("Timestamp '{s}' predates 1970"))
}

pub fn format_timestamp(ts: Timestamp) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
