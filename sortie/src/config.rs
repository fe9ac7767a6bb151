use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ConfigError;

/// Settings for the license lease client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Base URL of the remote license authority (e.g., "http://localhost:3000/api").
    pub api_url: String,
    /// Seconds between background re-verifications.
    pub renewal_interval_secs: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000/api".to_string(),
            renewal_interval_secs: 1800,
            request_timeout_secs: 10,
        }
    }
}

impl LeaseConfig {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Timing and retry budgets for the per-item state machine.
///
/// Settle delays double as the timeout budget for readiness polls when the
/// session exposes a readiness signal.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Start delay applied per worker index.
    pub stagger_per_worker_ms: u64,
    /// Upper bound of random jitter added to the start delay.
    pub stagger_jitter_ms: u64,
    /// Resource loaded before credential artifacts are injected.
    pub landing_url: String,
    /// Resource loaded after injection so artifacts take effect.
    pub post_auth_url: String,
    pub settle_after_landing_ms: u64,
    pub settle_after_auth_ms: u64,
    /// Budget for the target resource to report ready.
    pub readiness_timeout_ms: u64,
    /// Interval between readiness checks.
    pub readiness_poll_ms: u64,
    /// Bounded wait for the interactive target.
    pub locate_timeout_ms: u64,
    pub settle_after_payload_ms: u64,
    /// Ordinary commit attempts before the forced commit.
    pub commit_attempts: u32,
    /// Pause between intercepted commit attempts.
    pub commit_backoff_ms: u64,
    pub settle_after_commit_ms: u64,
    /// Flags handed to the execution handle when it is opened.
    pub throttling_flags: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stagger_per_worker_ms: 2000,
            stagger_jitter_ms: 500,
            landing_url: String::new(),
            post_auth_url: String::new(),
            settle_after_landing_ms: 3000,
            settle_after_auth_ms: 3000,
            readiness_timeout_ms: 5000,
            readiness_poll_ms: 250,
            locate_timeout_ms: 10_000,
            settle_after_payload_ms: 2000,
            commit_attempts: 3,
            commit_backoff_ms: 2000,
            settle_after_commit_ms: 3000,
            throttling_flags: vec![
                "--disable-background-networking".to_string(),
                "--disable-background-timer-throttling".to_string(),
                "--disable-backgrounding-occluded-windows".to_string(),
            ],
        }
    }
}

impl SessionConfig {
    /// A configuration with every delay zeroed, for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            stagger_per_worker_ms: 0,
            stagger_jitter_ms: 0,
            settle_after_landing_ms: 0,
            settle_after_auth_ms: 0,
            readiness_timeout_ms: 0,
            readiness_poll_ms: 1,
            locate_timeout_ms: 50,
            settle_after_payload_ms: 0,
            commit_backoff_ms: 0,
            settle_after_commit_ms: 0,
            ..Self::default()
        }
    }
}

/// Retry policy for removing a worker's storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Wait for the execution handle's processes to exit before deleting.
    pub grace_ms: u64,
    /// Whole-procedure attempts.
    pub max_attempts: u32,
    /// Backoff unit; attempt `n` waits `backoff_ms * n`.
    pub backoff_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            grace_ms: 2000,
            max_attempts: 3,
            backoff_ms: 2000,
        }
    }
}

/// Dispatcher-wide settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Hard cap on concurrently running workers.
    pub max_pool_size: usize,
    /// Root of the identity/content store.
    pub identity_root: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 16,
            identity_root: PathBuf::from("data"),
        }
    }
}

/// Aggregate settings for the whole crate.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SortieConfig {
    pub lease: LeaseConfig,
    pub session: SessionConfig,
    pub reaper: ReaperConfig,
    pub dispatch: DispatchConfig,
}

impl SortieConfig {
    /// Load settings: defaults, then the JSON file at `path` if it exists,
    /// then `SORTIE_*` environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;

        let merged = if path.exists() {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        } else {
            debug!(?path, "settings file not found, using defaults");
            defaults
        };

        let mut config: Self = serde_json::from_value(merged)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Unparseable or out-of-range
    /// values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = read("SORTIE_API_URL") {
            self.lease.api_url = v;
        }
        if let Some(v) = read("SORTIE_RENEWAL_INTERVAL_SECS").and_then(|v| parse_range(&v, 1, 86_400)) {
            self.lease.renewal_interval_secs = v;
        }
        if let Some(v) = read("SORTIE_MAX_POOL_SIZE").and_then(|v| parse_range(&v, 1, 256)) {
            self.dispatch.max_pool_size = v as usize;
        }
        if let Some(v) = read("SORTIE_IDENTITY_ROOT") {
            self.dispatch.identity_root = PathBuf::from(v);
        }
        if let Some(v) = read("SORTIE_LOCATE_TIMEOUT_MS").and_then(|v| parse_range(&v, 1, 600_000)) {
            self.session.locate_timeout_ms = v;
        }
        if let Some(v) = read("SORTIE_COMMIT_ATTEMPTS").and_then(|v| parse_range(&v, 1, 20)) {
            self.session.commit_attempts = v as u32;
        }
    }
}

fn parse_range(val: &str, min: u64, max: u64) -> Option<u64> {
    val.trim()
        .parse::<u64>()
        .ok()
        .filter(|v| (min..=max).contains(v))
}

/// Recursive merge: objects merge per key, everything else is replaced by
/// `source`, nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}
