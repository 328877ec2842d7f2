use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::Account;
use crate::error::Result;
use crate::lot::Lot;
use crate::transaction::Transaction;

pub(crate) fn hash_idempotency_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// The account half of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountWrite {
    pub account_id: Uuid,
    /// `None` creates the account; `Some(v)` requires the stored version to be `v`.
    pub expected_version: Option<u64>,
    pub balance: u64,
}

impl AccountWrite {
    pub fn create(account_id: Uuid, balance: u64) -> Self {
        Self {
            account_id,
            expected_version: None,
            balance,
        }
    }

    pub fn update(account: &Account, balance: u64) -> Self {
        Self {
            account_id: account.id,
            expected_version: Some(account.version),
            balance,
        }
    }
}

/// Everything one unit of work changes, persisted all-or-nothing.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub account: AccountWrite,
    /// Full post-images of every lot touched, new lots included.
    pub lots: Vec<Lot>,
    pub transaction: Transaction,
    pub committed_at: DateTime<Utc>,
}

/// Position in the expiry sweep. Pages continue strictly after this lot in
/// `(expires_at, id)` order, so lots a failed account leaves behind do not
/// hide the ones after them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryCursor {
    pub expires_at: DateTime<Utc>,
    pub lot_id: Uuid,
}

impl ExpiryCursor {
    pub fn after(lot: &Lot) -> Option<Self> {
        lot.expires_at.map(|expires_at| Self {
            expires_at,
            lot_id: lot.id,
        })
    }
}

/// Offset pagination for transaction history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Page {
    pub const MAX_LIMIT: u64 = 500;

    pub fn new(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: limit.clamp(1, Self::MAX_LIMIT),
        }
    }

    pub fn first(limit: u64) -> Self {
        Self::new(0, limit)
    }

    pub fn next(&self) -> Self {
        Self::new(self.offset + self.limit, self.limit)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, 50)
    }
}

/// Durable ledger storage.
///
/// Implementors MUST make `commit` atomic: the account row, every lot and the
/// transaction land together or not at all. The version check inside `commit`
/// is the last line of defence if a lease lapses under a slow holder.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>>;

    /// Active lots with something left that have not expired as of `as_of`,
    /// soonest expiry first (never-expiring last), then oldest earned.
    async fn find_active_lots(&self, account_id: Uuid, as_of: DateTime<Utc>) -> Result<Vec<Lot>>;

    /// Active lots with `expires_at <= before` across all accounts, ordered by
    /// `(expires_at, id)` and starting after `after` when given.
    async fn find_expiring_lots(
        &self,
        before: DateTime<Utc>,
        after: Option<ExpiryCursor>,
        limit: usize,
    ) -> Result<Vec<Lot>>;

    /// Every lot of an account regardless of status.
    async fn find_lots(&self, account_id: Uuid) -> Result<Vec<Lot>>;

    async fn get_lot(&self, lot_id: Uuid) -> Result<Option<Lot>>;

    async fn get_lots(&self, lot_ids: &[Uuid]) -> Result<Vec<Lot>>;

    async fn find_transaction(
        &self,
        account_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Transaction>>;

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>>;

    /// Newest first.
    async fn list_transactions(&self, account_id: Uuid, page: Page) -> Result<Vec<Transaction>>;

    /// Every transaction that reverses `original_id`, whatever its status, oldest first.
    async fn find_reversals(&self, original_id: Uuid) -> Result<Vec<Transaction>>;

    /// Persist a Pending transaction and its planned deltas ahead of the commit.
    /// Fails with `DuplicateIdempotencyKey` if the key is taken on the account.
    async fn record_pending(&self, transaction: &Transaction) -> Result<()>;

    /// Settle a Pending transaction as Failed without touching lots or the account.
    async fn fail_pending(&self, transaction: &Transaction) -> Result<()>;

    /// Atomically persist account, lots and transaction.
    /// Fails with `Conflict` if the account version does not match.
    async fn commit(&self, batch: CommitBatch) -> Result<Account>;

    /// Overwrite the stored balance alone, version checked like `commit`.
    /// Only reconciliation uses this, to repair drift from the lot sum.
    async fn write_balance(&self, write: AccountWrite, at: DateTime<Utc>) -> Result<Account>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_clamps_limit() {
        assert_eq!(Page::new(0, 0).limit, 1);
        assert_eq!(Page::new(0, 10_000).limit, Page::MAX_LIMIT);
        assert_eq!(Page::first(20).next(), Page::new(20, 20));
    }

    #[test]
    fn idempotency_hash_is_stable_hex() {
        let a = hash_idempotency_key("order-42");
        assert_eq!(a, hash_idempotency_key("order-42"));
        assert_ne!(a, hash_idempotency_key("order-43"));
        assert_eq!(a.len(), 64);
    }
}
