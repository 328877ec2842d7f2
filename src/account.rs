use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A point holder.
///
/// `balance` is the sum of remaining amounts over the account's Active lots as
/// of the last commit. `version` increases by one with every commit and backs
/// the store's optimistic check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub balance: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            balance: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Balance after applying a signed net change, refusing to go negative.
    pub fn balance_after(&self, net: i64) -> Option<u64> {
        if net >= 0 {
            self.balance.checked_add(net as u64)
        } else {
            self.balance.checked_sub(net.unsigned_abs())
        }
    }
}
