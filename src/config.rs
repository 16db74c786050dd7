//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WAKESTATE_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wakestate_core::EngineConfig;
use wakestate_store::StoreConfig;
use wakestate_timer::TimerConfig;

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Context store configuration.
    pub storage: StorageConfig,
    /// Timer subsystem configuration.
    pub timers: TimersConfig,
    /// Engine configuration.
    pub scheduler: SchedulerConfig,
    /// Built-in heartbeat machine.
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// Loads configuration from `path` (if any), then applies environment
    /// variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.storage.apply_env_overrides();
        self.timers.apply_env_overrides();
        self.scheduler.apply_env_overrides();
        self.heartbeat.apply_env_overrides();
    }

    /// Checks values the library crates would otherwise misbehave on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timers.short_horizon_ms <= 0 {
            return Err(ConfigError::ValidationError(
                "timers.short_horizon_ms must be positive".to_string(),
            ));
        }
        if self.timers.coarse_granularity_ms <= 0 {
            return Err(ConfigError::ValidationError(
                "timers.coarse_granularity_ms must be positive".to_string(),
            ));
        }
        if self.scheduler.max_transition_chain == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.max_transition_chain must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.enabled && self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "heartbeat.interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_flag(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

/// Context store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Persist machine contexts at all.
    pub enabled: bool,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
    /// Rewrite the journal after this many records (0 = never).
    pub compact_after: u64,
}

/// Fsync policy for journal writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    /// Fsync after every write (safest, slowest).
    EveryWrite,
    /// Fsync after N writes.
    EveryN(u32),
    /// Never fsync, rely on OS (fastest, least safe).
    Never,
}

impl FsyncPolicy {
    /// Parses `every_write`, `every_n:<n>` or `never`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "every_write" | "everywrite" => Some(FsyncPolicy::EveryWrite),
            "never" => Some(FsyncPolicy::Never),
            s if s.starts_with("every_n:") => s[8..].parse().ok().map(FsyncPolicy::EveryN),
            _ => None,
        }
    }
}

impl From<FsyncPolicy> for wakestate_journal::FsyncPolicy {
    fn from(policy: FsyncPolicy) -> Self {
        match policy {
            FsyncPolicy::EveryWrite => wakestate_journal::FsyncPolicy::EveryWrite,
            FsyncPolicy::EveryN(n) => wakestate_journal::FsyncPolicy::EveryN(n),
            FsyncPolicy::Never => wakestate_journal::FsyncPolicy::Never,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: PathBuf::from("./data"),
            fsync_policy: FsyncPolicy::EveryWrite,
            compact_after: 4096,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("WAKESTATE_STORE_ENABLED") {
            self.enabled = env_flag(&enabled);
        }

        if let Ok(dir) = std::env::var("WAKESTATE_DATA") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(policy) = std::env::var("WAKESTATE_FSYNC_POLICY") {
            match FsyncPolicy::parse(&policy) {
                Some(parsed) => self.fsync_policy = parsed,
                None => tracing::warn!("Ignoring unknown fsync policy {}", policy),
            }
        }

        if let Ok(records) = std::env::var("WAKESTATE_COMPACT_AFTER") {
            if let Ok(n) = records.parse() {
                self.compact_after = n;
            }
        }
    }

    /// Returns the context store directory.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("contexts")
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.store_dir())
            .with_fsync_policy(self.fsync_policy.into())
            .with_compact_after(self.compact_after)
    }
}

/// Timer subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// Deadlines at most this far away use the precise timer.
    pub short_horizon_ms: i64,
    /// The coarse timer ignores re-arms within this distance.
    pub long_dedup_ms: i64,
    /// The coarse timer rounds sleeps up to this granularity.
    pub coarse_granularity_ms: i64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        let defaults = TimerConfig::default();
        Self {
            short_horizon_ms: defaults.short_horizon_ms,
            long_dedup_ms: defaults.long_dedup_ms,
            coarse_granularity_ms: defaults.coarse_granularity_ms,
        }
    }
}

impl TimersConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("WAKESTATE_SHORT_HORIZON_MS") {
            if let Ok(n) = ms.parse() {
                self.short_horizon_ms = n;
            }
        }

        if let Ok(ms) = std::env::var("WAKESTATE_LONG_DEDUP_MS") {
            if let Ok(n) = ms.parse() {
                self.long_dedup_ms = n;
            }
        }

        if let Ok(ms) = std::env::var("WAKESTATE_COARSE_GRANULARITY_MS") {
            if let Ok(n) = ms.parse() {
                self.coarse_granularity_ms = n;
            }
        }
    }

    pub fn timer_config(&self) -> TimerConfig {
        TimerConfig::default()
            .with_short_horizon_ms(self.short_horizon_ms)
            .with_long_dedup_ms(self.long_dedup_ms)
            .with_coarse_granularity_ms(self.coarse_granularity_ms)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between warnings while a worker ignores a stop request.
    pub worker_stop_warn_ms: u64,
    /// Longest entry-callback chain before it counts as a failure.
    pub max_transition_chain: usize,
    /// How long shutdown waits for the pump to acknowledge the stop.
    pub stop_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            worker_stop_warn_ms: defaults.worker_stop_warn.as_millis() as u64,
            max_transition_chain: defaults.max_transition_chain,
            stop_timeout_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("WAKESTATE_WORKER_STOP_WARN_MS") {
            if let Ok(n) = ms.parse() {
                self.worker_stop_warn_ms = n;
            }
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_worker_stop_warn(Duration::from_millis(self.worker_stop_warn_ms))
            .with_max_transition_chain(self.max_transition_chain)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Built-in heartbeat machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Interval between beats.
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
        }
    }
}

impl HeartbeatConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("WAKESTATE_HEARTBEAT_MS") {
            if let Ok(n) = ms.parse() {
                self.interval_ms = n;
            }
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
