use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LockCoordinator, LockInfo};
use crate::error::{LedgerError, Result};

struct Lease {
    token: String,
    expires_at: Instant,
}

/// Lease table for a single process. Expired leases are treated as absent.
#[derive(Clone, Default)]
pub struct MemoryLockCoordinator {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl MemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> Result<MutexGuard<'_, HashMap<String, Lease>>> {
        self.leases
            .lock()
            .map_err(|_| LedgerError::Lock("lock table mutex poisoned".to_string()))
    }

    /// The live lease on `key`, dropping it first if it has run out.
    fn live<'a>(
        leases: &'a mut HashMap<String, Lease>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Lease> {
        if leases.get(key).is_some_and(|l| l.expires_at <= now) {
            leases.remove(key);
        }
        leases.get_mut(key)
    }
}

#[async_trait]
impl LockCoordinator for MemoryLockCoordinator {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases()?;
        if Self::live(&mut leases, key, now).is_some() {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            Lease {
                token: token.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut leases = self.leases()?;
        let ours = Self::live(&mut leases, key, Instant::now()).is_some_and(|held| held.token == token);
        if ours {
            leases.remove(key);
        }
        Ok(ours)
    }

    async fn extend(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases()?;
        match Self::live(&mut leases, key, now) {
            Some(held) if held.token == token => {
                held.expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn holder(&self, key: &str) -> Result<Option<LockInfo>> {
        let now = Instant::now();
        let mut leases = self.leases()?;
        Ok(Self::live(&mut leases, key, now).map(|held| LockInfo {
            key: key.to_string(),
            token: held.token.clone(),
            remaining: Some(held.expires_at - now),
        }))
    }

    async fn force_release(&self, key: &str) -> Result<bool> {
        let mut leases = self.leases()?;
        let live = Self::live(&mut leases, key, Instant::now()).is_some();
        leases.remove(key);
        Ok(live)
    }
}
