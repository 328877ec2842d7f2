//! Read-through balance cache.
//!
//! Entries are only ever written by a read that missed; mutations invalidate.
//! A fill is dropped when the account version moved while the view was being
//! computed. A commit landing between that check and the write can still
//! leave a stale entry, which the TTL bounds.
//! The backend is advisory: its failures are logged and treated as misses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::balance::BalanceView;
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{LedgerError, Missing, Result};
use crate::store::LedgerStore;

mod memory;
pub use memory::MemoryCacheBackend;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisCacheBackend;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<BalanceView>>;

    async fn put(&self, key: &str, view: &BalanceView, ttl: Duration) -> Result<()>;

    async fn invalidate(&self, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct BalanceCache {
    backend: Arc<dyn CacheBackend>,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<CacheConfig>,
}

impl BalanceCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        Self {
            backend,
            store,
            clock,
            config: Arc::new(config),
        }
    }

    pub fn key_for(&self, account_id: Uuid) -> String {
        format!("{}{}", self.config.key_prefix, account_id)
    }

    /// Spendable balance, from the cache when a fresh entry exists.
    pub async fn get_balance(&self, account_id: Uuid) -> Result<BalanceView> {
        let key = self.key_for(account_id);
        let now = self.clock.now();

        match self.backend.get(&key).await {
            Ok(Some(view)) if view.is_fresh_at(now) => {
                counter!("points.cache.lookups", "result" => "hit").increment(1);
                return Ok(view);
            }
            Ok(_) => {
                counter!("points.cache.lookups", "result" => "miss").increment(1);
            }
            Err(e) => {
                counter!("points.cache.lookups", "result" => "error").increment(1);
                warn!(%key, error = %e, "balance cache read failed");
            }
        }

        let (view, version) = self.compute_versioned(account_id).await?;
        match self.store.get_account(account_id).await {
            Ok(Some(account)) if account.version == version => {
                if let Err(e) = self.backend.put(&key, &view, self.config.ttl()).await {
                    warn!(%key, error = %e, "balance cache fill failed");
                }
            }
            Ok(_) => {
                counter!("points.cache.fills_skipped").increment(1);
                debug!(%key, version, "account changed while computing; not caching");
            }
            Err(e) => warn!(%key, error = %e, "balance cache fill check failed"),
        }
        Ok(view)
    }

    /// Balance straight from the store, bypassing the cache.
    pub async fn compute(&self, account_id: Uuid) -> Result<BalanceView> {
        Ok(self.compute_versioned(account_id).await?.0)
    }

    /// The view together with the account version it was read at.
    async fn compute_versioned(&self, account_id: Uuid) -> Result<(BalanceView, u64)> {
        let now = self.clock.now();
        let Some(account) = self.store.get_account(account_id).await? else {
            return Err(LedgerError::not_found(Missing::Account(account_id)));
        };
        let lots = self.store.find_active_lots(account_id, now).await?;
        Ok((BalanceView::from_lots(account_id, &lots, now), account.version))
    }

    pub async fn invalidate(&self, account_id: Uuid) {
        let key = self.key_for(account_id);
        if let Err(e) = self.backend.invalidate(&key).await {
            // The TTL bounds how long the stale entry can be served.
            warn!(%key, error = %e, "balance cache invalidation failed");
        }
    }
}
