use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::VALIDATION;
use crate::{AppError, AppResult};

pub const DB_FILE_NAME: &str = "handreceipt.sqlite3";

/// Outbox replay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Failed attempts after which an entry is parked as `failed`.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Entries replayed per drain pass.
    pub batch_size: usize,
    /// Background worker tick.
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(300_000),
            batch_size: 100,
            interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub sync: SyncConfig,
    pub open_timeout: Duration,
    pub seed_demo: bool,
}

fn default_data_dir() -> AppResult<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| std::env::current_dir().ok())
        .ok_or_else(|| AppError::storage_unavailable("Failed to resolve application data directory."))?;
    Ok(base.join("handreceipt"))
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> AppResult<T> {
    raw.trim().parse::<T>().map_err(|_| {
        AppError::new(VALIDATION, "Invalid configuration value.")
            .with_context("key", key)
            .with_context("value", raw)
    })
}

fn parse_bool(key: &str, raw: &str) -> AppResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::new(VALIDATION, "Invalid configuration value.")
            .with_context("key", key)
            .with_context("value", raw)),
    }
}

impl AppConfig {
    /// Defaults for a data directory, without consulting the environment.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            api_url: None,
            api_token: None,
            sync: SyncConfig::default(),
            open_timeout: Duration::from_millis(5_000),
            seed_demo: true,
        }
    }

    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `lookup`, which returns the raw value of an
    /// environment variable if set.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup("HANDRECEIPT_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let mut config = Self::for_data_dir(data_dir);
        config.api_url = lookup("HANDRECEIPT_API_URL").filter(|v| !v.trim().is_empty());
        config.api_token = lookup("HANDRECEIPT_API_TOKEN").filter(|v| !v.trim().is_empty());

        let sync = &mut config.sync;
        if let Some(raw) = lookup("HANDRECEIPT_SYNC_MAX_RETRIES") {
            sync.max_retries = parse_var("HANDRECEIPT_SYNC_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = lookup("HANDRECEIPT_SYNC_BACKOFF_BASE_MS") {
            sync.backoff_base =
                Duration::from_millis(parse_var("HANDRECEIPT_SYNC_BACKOFF_BASE_MS", &raw)?);
        }
        if let Some(raw) = lookup("HANDRECEIPT_SYNC_BACKOFF_MAX_MS") {
            sync.backoff_max =
                Duration::from_millis(parse_var("HANDRECEIPT_SYNC_BACKOFF_MAX_MS", &raw)?);
        }
        if let Some(raw) = lookup("HANDRECEIPT_SYNC_BATCH_SIZE") {
            sync.batch_size = parse_var("HANDRECEIPT_SYNC_BATCH_SIZE", &raw)?;
            if sync.batch_size == 0 {
                return Err(AppError::new(VALIDATION, "Batch size must be positive.")
                    .with_context("key", "HANDRECEIPT_SYNC_BATCH_SIZE"));
            }
        }
        if let Some(raw) = lookup("HANDRECEIPT_SYNC_INTERVAL_SECS") {
            sync.interval = Duration::from_secs(parse_var("HANDRECEIPT_SYNC_INTERVAL_SECS", &raw)?);
        }
        if let Some(raw) = lookup("HANDRECEIPT_OPEN_TIMEOUT_MS") {
            config.open_timeout =
                Duration::from_millis(parse_var("HANDRECEIPT_OPEN_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("HANDRECEIPT_SEED_DEMO") {
            config.seed_demo = parse_bool("HANDRECEIPT_SEED_DEMO", &raw)?;
        }
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config =
            AppConfig::from_lookup(lookup(&[("HANDRECEIPT_DATA_DIR", "/tmp/hr")])).expect("config");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/hr").join(DB_FILE_NAME));
        assert_eq!(config.sync, SyncConfig::default());
        assert!(config.seed_demo);
        assert!(config.api_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = AppConfig::from_lookup(lookup(&[
            ("HANDRECEIPT_DATA_DIR", "/tmp/hr"),
            ("HANDRECEIPT_SYNC_MAX_RETRIES", "2"),
            ("HANDRECEIPT_SYNC_BACKOFF_BASE_MS", "10"),
            ("HANDRECEIPT_SEED_DEMO", "false"),
            ("HANDRECEIPT_API_URL", "https://api.example.test"),
        ]))
        .expect("config");
        assert_eq!(config.sync.max_retries, 2);
        assert_eq!(config.sync.backoff_base, Duration::from_millis(10));
        assert!(!config.seed_demo);
        assert_eq!(config.api_url.as_deref(), Some("https://api.example.test"));
    }

    #[test]
    fn invalid_numbers_are_errors() {
        let err = AppConfig::from_lookup(lookup(&[
            ("HANDRECEIPT_DATA_DIR", "/tmp/hr"),
            ("HANDRECEIPT_SYNC_BATCH_SIZE", "lots"),
        ]))
        .expect_err("invalid");
        assert_eq!(err.code(), VALIDATION);
        assert_eq!(
            err.context().get("key").map(String::as_str),
            Some("HANDRECEIPT_SYNC_BATCH_SIZE")
        );
    }
}
