use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use super::CacheBackend;
use crate::balance::BalanceView;
use crate::error::{LedgerError, Result};

fn cache_err(e: impl ToString) -> LedgerError {
    LedgerError::Cache(e.to_string())
}

/// Balance views as JSON strings with a `PX` expiry, shared by every instance.
#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: MultiplexedConnection,
}

impl RedisCacheBackend {
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(cache_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(cache_err)?;
        Ok(Self::from_connection(conn))
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<BalanceView>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.map_err(cache_err)?;
        raw.map(|json| serde_json::from_str(&json).map_err(cache_err))
            .transpose()
    }

    async fn put(&self, key: &str, view: &BalanceView, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(view).map_err(cache_err)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(json)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(cache_err)?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(cache_err)?;
        Ok(())
    }
}
