use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use super::CacheBackend;
use crate::balance::BalanceView;
use crate::config::CacheConfig;
use crate::error::Result;

/// In-process cache backed by moka. Entries live for `CacheConfig::ttl`;
/// the per-call TTL is not used.
#[derive(Clone)]
pub struct MemoryCacheBackend {
    cache: Cache<String, BalanceView>,
}

impl MemoryCacheBackend {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(config.ttl())
            .build();
        Self { cache }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<BalanceView>> {
        Ok(self.cache.get(key).await)
    }

    async fn put(&self, key: &str, view: &BalanceView, _ttl: Duration) -> Result<()> {
        self.cache.insert(key.to_string(), view.clone()).await;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }
}
