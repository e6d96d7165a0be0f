use crate::Result;
use log::warn;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_REASON: &str = "Manual reindexing";

const MIN_HEARTBEAT_INTERVAL_MS: u64 = 10;
const MIN_LIVENESS_TIMEOUT_MS: u64 = 3 * MIN_HEARTBEAT_INTERVAL_MS;

/// Tunables for the coordinator and execution pipeline.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReindexConfig {
    /// Upper bound on items reindexed at once per run.
    pub max_concurrency: usize,
    /// A `Running` record from another owner untouched for this long is stale.
    pub liveness_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub item_max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub progress_notify_every: u64,
    pub default_reason: String,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            liveness_timeout_ms: 5 * 60 * 1000,
            heartbeat_interval_ms: 30 * 1000,
            item_max_attempts: 2,
            retry_backoff_ms: 250,
            progress_notify_every: 10,
            default_reason: DEFAULT_REASON.to_string(),
        }
    }
}

impl ReindexConfig {
    /// Parse a TOML document. Unknown tables (e.g. a host's catalog) are ignored.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        #[derive(Deserialize, Default)]
        struct Wrapper {
            #[serde(default)]
            reindex: Option<ReindexConfig>,
        }
        let wrapper: Wrapper = toml::from_str(raw)?;
        Ok(wrapper.reindex.unwrap_or_default().normalized())
    }

    /// Load from `path` if it exists, then apply `REINDEX_*` overrides.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = tokio::fs::read_to_string(path).await?;
            Self::from_toml_str(&raw)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_u64("REINDEX_MAX_CONCURRENCY") {
            self.max_concurrency = usize::try_from(v).unwrap_or(usize::MAX);
        }
        if let Some(v) = env_u64("REINDEX_LIVENESS_TIMEOUT_MS") {
            self.liveness_timeout_ms = v;
        }
        if let Some(v) = env_u64("REINDEX_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval_ms = v;
        }
        self.normalized()
    }

    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_concurrency = self.max_concurrency.max(1);
        self.item_max_attempts = self.item_max_attempts.max(1);
        self.progress_notify_every = self.progress_notify_every.max(1);
        self.liveness_timeout_ms = self.liveness_timeout_ms.max(MIN_LIVENESS_TIMEOUT_MS);
        // Live runs must be refreshed several times per liveness window, or
        // other instances would take them over as stale.
        let ceiling = self.liveness_timeout_ms / 3;
        if self.heartbeat_interval_ms > ceiling {
            warn!(
                "heartbeat_interval_ms={} does not fit liveness_timeout_ms={}; using {ceiling}",
                self.heartbeat_interval_ms, self.liveness_timeout_ms
            );
            self.heartbeat_interval_ms = ceiling;
        }
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(MIN_HEARTBEAT_INTERVAL_MS);
        if self.default_reason.trim().is_empty() {
            self.default_reason = DEFAULT_REASON.to_string();
        }
        self
    }

    #[must_use]
    pub const fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {name}={trimmed}: not a non-negative integer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_table_yields_defaults() {
        let config = ReindexConfig::from_toml_str("[[targets]]\nkind = \"library\"\n").unwrap();
        assert_eq!(config, ReindexConfig::default());
    }

    #[test]
    fn partial_table_keeps_other_defaults() {
        let config = ReindexConfig::from_toml_str(
            "[reindex]\nmax_concurrency = 0\nprogress_notify_every = 25\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.progress_notify_every, 25);
        assert_eq!(config.default_reason, DEFAULT_REASON);
        assert_eq!(config.liveness_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn heartbeat_stays_inside_liveness_window() {
        let config = ReindexConfig {
            liveness_timeout_ms: 1_000,
            ..ReindexConfig::default()
        }
        .normalized();
        assert_eq!(config.heartbeat_interval_ms, 333);

        let tiny = ReindexConfig {
            liveness_timeout_ms: 0,
            heartbeat_interval_ms: 0,
            ..ReindexConfig::default()
        }
        .normalized();
        assert_eq!(tiny.liveness_timeout_ms, 30);
        assert_eq!(tiny.heartbeat_interval_ms, 10);

        let untouched = ReindexConfig::default().normalized();
        assert_eq!(untouched.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(ReindexConfig::from_toml_str("[reindex\n").is_err());
    }
}
