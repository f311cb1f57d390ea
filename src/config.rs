use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_worker_limit() -> usize {
    4
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_max_transaction_pages() -> usize {
    200
}

/// First sync fetches this much history (the provider's maximum is two years).
fn default_first_sync_lookback_days() -> i64 {
    730
}

/// Bounded-backoff retry policy for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failures (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.initial_backoff_ms as f64 * factor) as u64)
    }
}

/// Sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum accounts whose transaction pages are processed concurrently.
    pub worker_limit: usize,
    /// Per-call deadline for provider requests. Timeouts degrade to
    /// retryable batch failures rather than stalls.
    pub provider_timeout_secs: u64,
    /// Cap on transaction pages per account per run.
    pub max_transaction_pages: usize,
    /// History window for an account's first transaction sync, in days.
    pub first_sync_lookback_days: i64,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            worker_limit: default_worker_limit(),
            provider_timeout_secs: default_provider_timeout_secs(),
            max_transaction_pages: default_max_transaction_pages(),
            first_sync_lookback_days: default_first_sync_lookback_days(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where the JSON file storage lives. Relative paths are resolved
    /// against the config file's directory.
    pub data_dir: Option<PathBuf>,
    pub sync: SyncConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load config, falling back to defaults when the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn resolve_data_dir(&self, config_dir: &Path) -> PathBuf {
        match &self.data_dir {
            Some(data_dir) if data_dir.is_absolute() => data_dir.clone(),
            Some(data_dir) => config_dir.join(data_dir),
            None => config_dir.to_path_buf(),
        }
    }
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./ledgersync.toml` if it exists in the current directory
/// 2. `~/.local/share/ledgersync/ledgersync.toml` (XDG data directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("ledgersync.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("ledgersync").join("ledgersync.toml");
    }

    local_config
}
