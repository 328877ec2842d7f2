//! Ledger configuration.
//!
//! Every field has a default, so an empty source yields a usable config.
//! [`LedgerConfig::load`] layers an optional `config/points-ledger.{toml,json,..}`
//! file under `POINTS__*` environment variables, e.g.
//! `POINTS__LOCK__WAIT_TIMEOUT_MS=5000`.

use std::time::Duration;

use serde::Deserialize;

use crate::policy::EarnPolicy;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub lock: LockConfig,
    pub cache: CacheConfig,
    pub processor: ProcessorConfig,
    pub settlement: SettlementConfig,
    pub policy: EarnPolicy,
}

impl LedgerConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("config/points-ledger")
    }

    pub fn load_from(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("POINTS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long `acquire` waits for a held lock before giving up.
    pub wait_timeout_ms: u64,
    /// Lease granted on acquisition; the lock frees itself after this.
    pub lease_ms: u64,
    pub poll_interval_ms: u64,
    /// Holding a lock longer than this logs a warning.
    pub hold_warn_threshold_ms: u64,
    pub key_prefix: String,
    /// Attempts for lock backend errors (not for timeouts).
    pub backend_attempts: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 3_000,
            lease_ms: 30_000,
            poll_interval_ms: 25,
            hold_warn_threshold_ms: 3_000,
            key_prefix: "points:lock:account:".to_string(),
            backend_attempts: 3,
        }
    }
}

impl LockConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn hold_warn_threshold(&self) -> Duration {
        Duration::from_millis(self.hold_warn_threshold_ms)
    }

    pub fn backend_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.backend_attempts, 50, 500, 0.2)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub max_entries: u64,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            max_entries: 100_000,
            key_prefix: "points:balance:".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Extra rounds after an optimistic conflict before giving up.
    pub max_conflict_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            retry_base_delay_ms: 20,
            retry_max_delay_ms: 500,
        }
    }
}

impl ProcessorConfig {
    pub fn conflict_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_conflict_retries + 1,
            self.retry_base_delay_ms,
            self.retry_max_delay_ms,
            0.25,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Lots fetched per sweep page.
    pub batch_size: usize,
    /// Accounts settled in parallel.
    pub account_concurrency: usize,
    pub max_account_attempts: usize,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            account_concurrency: 8,
            max_account_attempts: 3,
        }
    }
}

impl SettlementConfig {
    pub fn account_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_account_attempts, 50, 1_000, 0.25)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = LedgerConfig::load_from("config/does-not-exist").unwrap();
        assert_eq!(cfg.lock.wait_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.cache.ttl(), Duration::from_secs(30));
        assert_eq!(cfg.processor.max_conflict_retries, 3);
        assert_eq!(cfg.settlement.batch_size, 500);
        assert_eq!(cfg.policy.default_expiry_days, 365);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg: LedgerConfig = serde_json::from_str(
            r#"{ "lock": { "wait_timeout_ms": 10 }, "settlement": { "batch_size": 2 } }"#,
        )
        .unwrap();
        assert_eq!(cfg.lock.wait_timeout_ms, 10);
        assert_eq!(cfg.lock.lease_ms, 30_000);
        assert_eq!(cfg.settlement.batch_size, 2);
        assert_eq!(cfg.settlement.account_concurrency, 8);
    }

    #[test]
    fn conflict_retry_allows_one_more_attempt_than_retries() {
        let cfg = ProcessorConfig {
            max_conflict_retries: 2,
            ..Default::default()
        };
        assert_eq!(cfg.conflict_retry().max_attempts, 3);
    }
}
