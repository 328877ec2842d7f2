//! Per-account mutual exclusion across processes.
//!
//! A [`LockCoordinator`] is the lease primitive (set-if-absent with expiry,
//! compare-and-delete). [`LockManager`] layers waiting, nested-acquisition
//! detection and backend retries on top and hands out [`LockGuard`]s, which
//! release their lease on every exit path.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{LedgerError, Result};

mod memory;
pub use memory::MemoryLockCoordinator;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockCoordinator;

/// Current holder of a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub key: String,
    pub token: String,
    /// Time left on the lease, if the backend reports it.
    pub remaining: Option<Duration>,
}

impl LockInfo {
    /// The unit of work that holds the lock, parsed from the token.
    pub fn owner(&self) -> Option<Uuid> {
        owner_of(&self.token)
    }
}

fn owner_of(token: &str) -> Option<Uuid> {
    token
        .split_once(':')
        .and_then(|(owner, _)| Uuid::parse_str(owner).ok())
}

/// Lease-based lock primitive.
///
/// Tokens are opaque to implementors; they only compare them. Every method
/// must be a single atomic step on the backend.
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// Take `key` for `lease` if nobody holds it. Returns whether it was taken.
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Drop `key` if it is still held by `token`. Returns whether anything was removed.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;

    /// Renew the lease if `key` is still held by `token`.
    async fn extend(&self, key: &str, token: &str, lease: Duration) -> Result<bool>;

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>>;

    /// Drop `key` regardless of who holds it.
    async fn force_release(&self, key: &str) -> Result<bool>;
}

fn is_backend_error(err: &LedgerError) -> bool {
    matches!(err, LedgerError::Lock(_))
}

/// Hands out account locks according to [`LockConfig`].
#[derive(Clone)]
pub struct LockManager {
    coordinator: Arc<dyn LockCoordinator>,
    config: Arc<LockConfig>,
}

impl LockManager {
    pub fn new(coordinator: Arc<dyn LockCoordinator>, config: LockConfig) -> Self {
        Self {
            coordinator,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn key_for(&self, account_id: Uuid) -> String {
        format!("{}{}", self.config.key_prefix, account_id)
    }

    /// Acquire the account lock for `owner` with the configured lease.
    pub async fn acquire(&self, account_id: Uuid, owner: Uuid) -> Result<LockGuard> {
        self.acquire_with_lease(account_id, owner, self.config.lease())
            .await
    }

    /// Wait up to `wait_timeout` for the account lock.
    ///
    /// Fails with `DeadlockRisk` straight away if `owner` already holds it, and
    /// with `LockTimeout` once the wait runs out. Nothing is held on error.
    pub async fn acquire_with_lease(
        &self,
        account_id: Uuid,
        owner: Uuid,
        lease: Duration,
    ) -> Result<LockGuard> {
        let key = self.key_for(account_id);
        let token = format!("{}:{}", owner, Uuid::now_v7().simple());
        let started = Instant::now();
        let deadline = started + self.config.wait_timeout();
        let retry = self.config.backend_retry();
        let mut checked_holder = false;

        loop {
            let coordinator = &self.coordinator;
            let (k, t) = (key.as_str(), token.as_str());
            let acquired = retry
                .retry_if(
                    move |_| coordinator.try_acquire(k, t, lease),
                    is_backend_error,
                )
                .await
                .inspect_err(|_| {
                    counter!("points.lock.acquire", "result" => "error").increment(1);
                })?;

            if acquired {
                let waited = started.elapsed();
                histogram!("points.lock.wait_ms").record(waited.as_millis() as f64);
                counter!("points.lock.acquire", "result" => "acquired").increment(1);
                debug!(%key, waited_ms = waited.as_millis() as u64, "lock acquired");
                return Ok(LockGuard {
                    coordinator: Arc::clone(&self.coordinator),
                    account_id,
                    key,
                    token,
                    lease,
                    acquired_at: Instant::now(),
                    hold_warn_threshold: self.config.hold_warn_threshold(),
                    released: false,
                });
            }

            if !checked_holder {
                checked_holder = true;
                let holder = self.coordinator.holder(&key).await?;
                if holder.and_then(|info| info.owner()) == Some(owner) {
                    counter!("points.lock.acquire", "result" => "deadlock_risk").increment(1);
                    return Err(LedgerError::DeadlockRisk { key });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                counter!("points.lock.acquire", "result" => "timeout").increment(1);
                warn!(%key, waited_ms = waited.as_millis() as u64, "lock wait timed out");
                return Err(LedgerError::LockTimeout {
                    key,
                    waited,
                    idempotency_key: None,
                });
            }
            sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    pub async fn lock_info(&self, account_id: Uuid) -> Result<Option<LockInfo>> {
        self.coordinator.holder(&self.key_for(account_id)).await
    }

    /// Break a lock held by a crashed or stuck worker.
    pub async fn force_release(&self, account_id: Uuid) -> Result<bool> {
        let key = self.key_for(account_id);
        let removed = self.coordinator.force_release(&key).await?;
        if removed {
            warn!(%key, "lock force-released");
        }
        Ok(removed)
    }
}

/// A held account lock.
///
/// Call [`LockGuard::release`] on the happy path. A guard dropped without
/// it (early return, error, panic) releases in the background on the current
/// tokio runtime; without a runtime the lease simply runs out.
pub struct LockGuard {
    coordinator: Arc<dyn LockCoordinator>,
    account_id: Uuid,
    key: String,
    token: String,
    lease: Duration,
    acquired_at: Instant,
    hold_warn_threshold: Duration,
    released: bool,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("account_id", &self.account_id)
            .field("key", &self.key)
            .field("token", &self.token)
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Renew the lease for another full term. Fails if the lease already lapsed
    /// and someone else may hold the key.
    pub async fn extend(&mut self) -> Result<()> {
        if self
            .coordinator
            .extend(&self.key, &self.token, self.lease)
            .await?
        {
            Ok(())
        } else {
            Err(LedgerError::Lock(format!("lease on {} lapsed", self.key)))
        }
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.observe_hold();
        let removed = self.coordinator.release(&self.key, &self.token).await?;
        if !removed {
            debug!(key = %self.key, "lease had already lapsed on release");
        }
        Ok(())
    }

    fn observe_hold(&self) {
        let held = self.held_for();
        histogram!("points.lock.hold_ms").record(held.as_millis() as f64);
        if held > self.hold_warn_threshold {
            counter!("points.lock.hold_exceeded").increment(1);
            warn!(
                key = %self.key,
                held_ms = held.as_millis() as u64,
                threshold_ms = self.hold_warn_threshold.as_millis() as u64,
                "lock held longer than threshold"
            );
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.observe_hold();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let coordinator = Arc::clone(&self.coordinator);
                let key = std::mem::take(&mut self.key);
                let token = std::mem::take(&mut self.token);
                handle.spawn(async move {
                    if let Err(e) = coordinator.release(&key, &token).await {
                        warn!(%key, error = %e, "background lock release failed");
                    }
                });
            }
            Err(_) => {
                warn!(key = %self.key, "lock guard dropped outside a runtime; lease will lapse");
            }
        }
    }
}
