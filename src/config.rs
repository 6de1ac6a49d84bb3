//! Configuration loader and validator for the scheduling service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub scheduling: Scheduling,
    pub sweeps: Sweeps,
    pub notify: Notify,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Bounds on slot allocation and queue synchronization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduling {
    /// Maximum number of days the slot finder scans forward. Guarantees
    /// search termination even on a channel with zero free capacity.
    pub lookahead_days: i64,
    /// How far into the future the queue sync reconciles delivery jobs.
    pub sync_horizon_days: i64,
}

/// Sweep triggers, minute granularity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sweeps {
    /// Minute of the hour the duplicate-schedule sweep fires.
    pub duplicate_minute: u32,
    /// Minute of the hour the invalid-slot sweep fires (runs just before
    /// the duplicate sweep by default).
    pub invalid_slot_minute: u32,
    /// Minute of the hour the missing-queue sweep fires.
    pub missing_queue_minute: u32,
    /// Interval in minutes between pending-post checks.
    pub pending_interval_minutes: u64,
    /// Seconds to wait after boot before the one-shot startup sweep, so it
    /// does not contend with service initialization.
    pub startup_delay_seconds: u64,
}

/// Owner notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notify {
    /// Webhook that receives per-batch reschedule summaries. Empty disables
    /// notifications.
    pub webhook_url: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.scheduling.lookahead_days <= 0 {
        return Err(ConfigError::Invalid(
            "scheduling.lookahead_days must be > 0",
        ));
    }
    if cfg.scheduling.sync_horizon_days <= 0 {
        return Err(ConfigError::Invalid(
            "scheduling.sync_horizon_days must be > 0",
        ));
    }

    if cfg.sweeps.duplicate_minute > 59 {
        return Err(ConfigError::Invalid("sweeps.duplicate_minute must be 0-59"));
    }
    if cfg.sweeps.invalid_slot_minute > 59 {
        return Err(ConfigError::Invalid(
            "sweeps.invalid_slot_minute must be 0-59",
        ));
    }
    if cfg.sweeps.missing_queue_minute > 59 {
        return Err(ConfigError::Invalid(
            "sweeps.missing_queue_minute must be 0-59",
        ));
    }
    if cfg.sweeps.pending_interval_minutes == 0 {
        return Err(ConfigError::Invalid(
            "sweeps.pending_interval_minutes must be > 0",
        ));
    }

    Ok(())
}

/// Example YAML configuration with the default sweep schedule.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

scheduling:
  lookahead_days: 90
  sync_horizon_days: 30

sweeps:
  duplicate_minute: 0
  invalid_slot_minute: 55
  missing_queue_minute: 0
  pending_interval_minutes: 16
  startup_delay_seconds: 10

notify:
  webhook_url: ""
"#
}
