use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Local, NaiveDate};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub devices: DevicesConfig,
    pub execution: ExecutionConfig,
    pub paths: PathsConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DevicesConfig {
    pub ips: Vec<String>,
    pub credentials: Credentials,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionConfig {
    pub max_workers: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PathsConfig {
    pub download_dir: PathBuf,
}

fn default_retry_delay() -> u64 { 60 }

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let data = std::fs::read(path)
        .with_context(|| format!("config file {} is missing or unreadable", path.display()))?;
    let cfg: AppConfig = serde_json::from_slice(&data)
        .with_context(|| format!("config file {} is malformed", path.display()))?;
    Ok(cfg)
}

/// Dates derived once at startup and shared read-only by the whole run.
#[derive(Clone, Debug)]
pub struct RunDates {
    pub run_datetime: DateTime<Local>,
    pub data_date: NaiveDate,
    /// `%Y%m%d`, embedded in downloaded archive names.
    pub run_date_str: String,
    /// `%Y%m%d_%H%M`, embedded in report names.
    pub run_timestamp_str: String,
    /// `%Y-%m-%d`, used both as the line filter prefix and in report names.
    pub data_date_str: String,
}

impl RunDates {
    pub fn new(now: DateTime<Local>, data_date_override: Option<NaiveDate>) -> Self {
        let data_date = data_date_override.unwrap_or_else(|| now.date_naive() - Duration::days(1));
        RunDates {
            run_datetime: now,
            data_date,
            run_date_str: now.format("%Y%m%d").to_string(),
            run_timestamp_str: now.format("%Y%m%d_%H%M").to_string(),
            data_date_str: data_date.format("%Y-%m-%d").to_string(),
        }
    }
}
