//! Layered configuration loading utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::FixedOffset;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::Value;

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path of the SQLite journal holding runs and events.
    #[serde(default = "default_journal_path")]
    pub journal_path: PathBuf,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Secret from which the credential-vault key is derived.
    #[serde(default = "default_vault_key")]
    pub vault_key: String,
    /// Exchange timezone offset used for the RMS daily rollover.
    #[serde(default = "default_exchange_tz")]
    pub exchange_tz_offset: String,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub execution: ExecutionTuning,
    /// Broker-specific endpoints and knobs keyed by broker kind.
    #[serde(default)]
    pub brokers: HashMap<String, BrokerOptions>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerOptions {
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default, flatten)]
    pub params: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_place_secs")]
    pub adapter_place_secs: u64,
    #[serde(default = "default_metadata_secs")]
    pub adapter_metadata_secs: u64,
    #[serde(default = "default_run_parallel_secs")]
    pub run_parallel_secs: u64,
    #[serde(default = "default_run_staggered_secs")]
    pub run_staggered_secs: u64,
    #[serde(default = "default_webhook_window_secs")]
    pub webhook_idempotency_secs: u64,
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            adapter_place_secs: default_place_secs(),
            adapter_metadata_secs: default_metadata_secs(),
            run_parallel_secs: default_run_parallel_secs(),
            run_staggered_secs: default_run_staggered_secs(),
            webhook_idempotency_secs: default_webhook_window_secs(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn adapter_place(&self) -> Duration {
        Duration::from_secs(self.adapter_place_secs)
    }

    #[must_use]
    pub fn adapter_metadata(&self) -> Duration {
        Duration::from_secs(self.adapter_metadata_secs)
    }

    #[must_use]
    pub fn webhook_window(&self) -> Duration {
        Duration::from_secs(self.webhook_idempotency_secs)
    }

    #[must_use]
    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExecutionTuning {
    #[serde(default = "default_worker_pool")]
    pub worker_pool: usize,
    #[serde(default = "default_stagger_delay_ms")]
    pub stagger_delay_ms: u64,
    #[serde(default)]
    pub stagger_abort_threshold: Option<u32>,
    #[serde(default)]
    pub rollback_on_partial: bool,
}

impl Default for ExecutionTuning {
    fn default() -> Self {
        Self {
            worker_pool: default_worker_pool(),
            stagger_delay_ms: default_stagger_delay_ms(),
            stagger_abort_threshold: None,
            rollback_on_partial: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            journal_path: default_journal_path(),
            database_url: None,
            redis_url: None,
            vault_key: default_vault_key(),
            exchange_tz_offset: default_exchange_tz(),
            timeouts: TimeoutConfig::default(),
            execution: ExecutionTuning::default(),
            brokers: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Parse the configured exchange offset (e.g. `+05:30`). Falls back to
    /// IST when malformed.
    #[must_use]
    pub fn exchange_offset(&self) -> FixedOffset {
        parse_offset(&self.exchange_tz_offset)
            .unwrap_or_else(|| FixedOffset::east_opt(5 * 3600 + 1800).expect("static offset"))
    }
}

/// Parse `+HH:MM` / `-HH:MM` into a fixed offset.
#[must_use]
pub fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    let (sign, rest) = match raw.strip_prefix('-') {
        Some(rest) => (-1i32, rest),
        None => (1i32, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let (hours, minutes) = rest.split_once(':')?;
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("./data/journal.db")
}

fn default_vault_key() -> String {
    "change-me".to_string()
}

fn default_exchange_tz() -> String {
    "+05:30".to_string()
}

fn default_place_secs() -> u64 {
    5
}

fn default_metadata_secs() -> u64 {
    2
}

fn default_run_parallel_secs() -> u64 {
    30
}

fn default_run_staggered_secs() -> u64 {
    60
}

fn default_webhook_window_secs() -> u64 {
    60
}

fn default_scheduler_tick_secs() -> u64 {
    1
}

fn default_worker_pool() -> usize {
    8
}

fn default_stagger_delay_ms() -> u64 {
    250
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `FANOUT_`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(false));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }
    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));
    builder = builder.add_source(
        Environment::with_prefix("FANOUT")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let config = AppConfig::default();
        assert_eq!(config.timeouts.adapter_place(), Duration::from_secs(5));
        assert_eq!(config.timeouts.adapter_metadata(), Duration::from_secs(2));
        assert_eq!(config.timeouts.run_parallel_secs, 30);
        assert_eq!(config.timeouts.run_staggered_secs, 60);
        assert_eq!(config.timeouts.webhook_window(), Duration::from_secs(60));
    }

    #[test]
    fn offset_parsing_accepts_signed_forms() {
        assert_eq!(
            parse_offset("+05:30"),
            FixedOffset::east_opt(5 * 3600 + 1800)
        );
        assert_eq!(parse_offset("-04:00"), FixedOffset::east_opt(-4 * 3600));
        assert!(parse_offset("invalid").is_none());
    }

    #[test]
    fn malformed_offset_falls_back_to_ist() {
        let config = AppConfig {
            exchange_tz_offset: "nonsense".into(),
            ..AppConfig::default()
        };
        assert_eq!(
            config.exchange_offset(),
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap()
        );
    }
}
