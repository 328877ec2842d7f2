use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use super::{LockCoordinator, LockInfo};
use crate::error::{LedgerError, Result};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

fn lock_err(e: redis::RedisError) -> LedgerError {
    LedgerError::Lock(e.to_string())
}

/// Leases as Redis keys: `SET NX PX` to take, compare-and-delete to release.
#[derive(Clone)]
pub struct RedisLockCoordinator {
    conn: MultiplexedConnection,
    release: Script,
    extend: Script,
}

impl RedisLockCoordinator {
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
        }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(lock_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(lock_err)?;
        Ok(Self::from_connection(conn))
    }
}

#[async_trait]
impl LockCoordinator for RedisLockCoordinator {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(lock_err)?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_err)?;
        Ok(removed == 1)
    }

    async fn extend(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .extend
            .key(key)
            .arg(token)
            .arg(lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_err)?;
        Ok(renewed == 1)
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>> {
        let mut conn = self.conn.clone();
        let (token, pttl): (Option<String>, i64) = redis::pipe()
            .atomic()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await
            .map_err(lock_err)?;
        Ok(token.map(|token| LockInfo {
            key: key.to_string(),
            token,
            remaining: u64::try_from(pttl).ok().map(Duration::from_millis),
        }))
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(lock_err)?;
        Ok(removed > 0)
    }
}
