use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::account::Account;
use crate::error::{LedgerError, Result};
use crate::lot::{Lot, LotStatus};
use crate::store::{
    AccountWrite, CommitBatch, ExpiryCursor, LedgerStore, Page, hash_idempotency_key,
};
use crate::transaction::Transaction;

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<Uuid, Account>,
    lots: HashMap<Uuid, Lot>,
    transactions: HashMap<Uuid, Transaction>,
    /// (account, key digest) -> transaction id
    idempotency: HashMap<(Uuid, String), Uuid>,
}

/// Process-local ledger store. One mutex over all tables makes every commit atomic.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Storage("memory store mutex poisoned".to_string()))
    }

    /// Overwrite a lot outside the commit protocol. Only for tests that need
    /// to fabricate drift between lots and account balances.
    #[doc(hidden)]
    pub fn put_lot_unchecked(&self, lot: Lot) -> Result<()> {
        self.state()?.lots.insert(lot.id, lot);
        Ok(())
    }
}

impl MemoryState {
    fn check_key(&self, tx: &Transaction) -> Result<()> {
        let key = (tx.account_id, hash_idempotency_key(&tx.idempotency_key));
        match self.idempotency.get(&key) {
            Some(existing) if *existing != tx.id => Err(LedgerError::DuplicateIdempotencyKey {
                account_id: tx.account_id,
                idempotency_key: tx.idempotency_key.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn put_transaction(&mut self, tx: Transaction) {
        let key = (tx.account_id, hash_idempotency_key(&tx.idempotency_key));
        self.idempotency.insert(key, tx.id);
        self.transactions.insert(tx.id, tx);
    }

    /// The account row `write` would produce, or `Conflict` on a version mismatch.
    fn next_account(&self, write: &AccountWrite, at: DateTime<Utc>) -> Result<Account> {
        match (write.expected_version, self.accounts.get(&write.account_id)) {
            (None, None) => Ok(Account {
                version: 1,
                balance: write.balance,
                ..Account::new(write.account_id, at)
            }),
            (Some(expected), Some(current)) if current.version == expected => Ok(Account {
                version: expected + 1,
                balance: write.balance,
                updated_at: at,
                ..current.clone()
            }),
            (expected, current) => Err(LedgerError::Conflict {
                account_id: write.account_id,
                expected,
                found: current.map(|a| a.version),
            }),
        }
    }

    fn check_pending(&self, tx: &Transaction) -> Result<()> {
        match self.transactions.get(&tx.id) {
            Some(stored) if stored.status.is_final() => Err(LedgerError::Storage(format!(
                "transaction {} is already {}",
                tx.id,
                stored.status.as_str()
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn get_account(&self, account_id: Uuid) -> Result<Option<Account>> {
        Ok(self.state()?.accounts.get(&account_id).cloned())
    }

    async fn find_active_lots(&self, account_id: Uuid, as_of: DateTime<Utc>) -> Result<Vec<Lot>> {
        let state = self.state()?;
        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|lot| lot.account_id == account_id && lot.is_available(as_of))
            .cloned()
            .collect();
        lots.sort_by(|a, b| a.consumption_cmp(b));
        Ok(lots)
    }

    async fn find_expiring_lots(
        &self,
        before: DateTime<Utc>,
        after: Option<ExpiryCursor>,
        limit: usize,
    ) -> Result<Vec<Lot>> {
        let state = self.state()?;
        let after = after.map(|c| (Some(c.expires_at), c.lot_id));
        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|lot| lot.status == LotStatus::Active && lot.is_past_expiry(before))
            .filter(|lot| after.is_none_or(|cursor| (lot.expires_at, lot.id) > cursor))
            .cloned()
            .collect();
        lots.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        lots.truncate(limit);
        Ok(lots)
    }

    async fn find_lots(&self, account_id: Uuid) -> Result<Vec<Lot>> {
        let state = self.state()?;
        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|lot| lot.account_id == account_id)
            .cloned()
            .collect();
        lots.sort_by_key(|lot| lot.id);
        Ok(lots)
    }

    async fn get_lot(&self, lot_id: Uuid) -> Result<Option<Lot>> {
        Ok(self.state()?.lots.get(&lot_id).cloned())
    }

    async fn get_lots(&self, lot_ids: &[Uuid]) -> Result<Vec<Lot>> {
        let state = self.state()?;
        Ok(lot_ids
            .iter()
            .filter_map(|id| state.lots.get(id).cloned())
            .collect())
    }

    async fn find_transaction(
        &self,
        account_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Transaction>> {
        let state = self.state()?;
        let key = (account_id, hash_idempotency_key(idempotency_key));
        Ok(state
            .idempotency
            .get(&key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.state()?.transactions.get(&transaction_id).cloned())
    }

    async fn list_transactions(&self, account_id: Uuid, page: Page) -> Result<Vec<Transaction>> {
        let state = self.state()?;
        let mut txs: Vec<&Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.account_id == account_id)
            .collect();
        txs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(txs
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect())
    }

    async fn find_reversals(&self, original_id: Uuid) -> Result<Vec<Transaction>> {
        let state = self.state()?;
        let mut txs: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.reverses == Some(original_id))
            .cloned()
            .collect();
        txs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(txs)
    }

    async fn record_pending(&self, transaction: &Transaction) -> Result<()> {
        let mut state = self.state()?;
        state.check_key(transaction)?;
        if state.transactions.contains_key(&transaction.id) {
            return Err(LedgerError::Storage(format!(
                "transaction {} already recorded",
                transaction.id
            )));
        }
        state.put_transaction(transaction.clone());
        Ok(())
    }

    async fn fail_pending(&self, transaction: &Transaction) -> Result<()> {
        let mut state = self.state()?;
        state.check_key(transaction)?;
        state.check_pending(transaction)?;
        state.put_transaction(transaction.clone());
        Ok(())
    }

    async fn commit(&self, batch: CommitBatch) -> Result<Account> {
        let mut state = self.state()?;
        let write = &batch.account;

        // Validate everything before the first mutation.
        let next = state.next_account(write, batch.committed_at)?;
        state.check_key(&batch.transaction)?;
        state.check_pending(&batch.transaction)?;
        if let Some(bad) = batch.lots.iter().find(|l| l.account_id != write.account_id) {
            return Err(LedgerError::Storage(format!(
                "lot {} does not belong to account {}",
                bad.id, write.account_id
            )));
        }

        state.accounts.insert(next.id, next.clone());
        for lot in batch.lots {
            state.lots.insert(lot.id, lot);
        }
        state.put_transaction(batch.transaction);
        Ok(next)
    }

    async fn write_balance(&self, write: AccountWrite, at: DateTime<Utc>) -> Result<Account> {
        let mut state = self.state()?;
        let next = state.next_account(&write, at)?;
        state.accounts.insert(next.id, next.clone());
        Ok(next)
    }
}
