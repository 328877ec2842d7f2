pub mod account;
pub mod adapters;
mod apply;
pub mod balance;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod lot;
pub mod policy;
pub mod processor;
pub mod retry;
pub mod settlement;
pub mod store;
pub mod telemetry;
pub mod transaction;

pub use account::Account;
pub use adapters::MemoryLedgerStore;
#[cfg(feature = "postgres")]
pub use adapters::PostgresLedgerStore;
pub use balance::BalanceView;
pub use cache::{BalanceCache, CacheBackend, MemoryCacheBackend};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use error::{LedgerError, Missing, NotReversibleReason, PolicyViolation, Result};
pub use lock::{LockCoordinator, LockGuard, LockInfo, LockManager, MemoryLockCoordinator};
pub use lot::{DeltaEffect, Lot, LotDelta, LotStatus};
pub use policy::{EarnPolicy, ExpiryPolicy};
pub use processor::TransactionProcessor;
pub use settlement::{Reconciliation, SettlementJob, SettlementReport};
pub use store::{LedgerStore, Page};
pub use transaction::{Transaction, TransactionKind, TransactionStatus, TransactionView};

use std::sync::Arc;

use uuid::Uuid;

/// The ledger wired together: processor, settlement job and lock admin over
/// one store, one lock coordinator and one cache backend.
pub struct PointsLedger {
    store: Arc<dyn LedgerStore>,
    locks: LockManager,
    clock: Arc<dyn Clock>,
    processor: TransactionProcessor,
    settlement: SettlementJob,
}

impl PointsLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        coordinator: Arc<dyn LockCoordinator>,
        cache_backend: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
    ) -> Self {
        let locks = LockManager::new(coordinator, config.lock);
        let cache = BalanceCache::new(
            cache_backend,
            Arc::clone(&store),
            Arc::clone(&clock),
            config.cache,
        );
        let processor = TransactionProcessor::new(
            Arc::clone(&store),
            locks.clone(),
            cache.clone(),
            Arc::clone(&clock),
            config.policy,
            config.processor,
        );
        let settlement = SettlementJob::new(
            Arc::clone(&store),
            locks.clone(),
            cache,
            Arc::clone(&clock),
            config.settlement,
        );
        Self {
            store,
            locks,
            clock,
            processor,
            settlement,
        }
    }

    /// Everything in process: memory store, memory locks, moka cache.
    pub fn in_memory(config: LedgerConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = MemoryCacheBackend::new(&config.cache);
        Self::new(
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(MemoryLockCoordinator::new()),
            Arc::new(cache),
            clock,
            config,
        )
    }

    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: u64,
        idempotency_key: &str,
        expiry: ExpiryPolicy,
    ) -> Result<TransactionView> {
        self.processor
            .credit(account_id, amount, idempotency_key, expiry)
            .await
    }

    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: u64,
        idempotency_key: &str,
    ) -> Result<TransactionView> {
        self.processor.debit(account_id, amount, idempotency_key).await
    }

    pub async fn reverse(&self, transaction_id: Uuid) -> Result<TransactionView> {
        self.processor.reverse(transaction_id).await
    }

    pub async fn reverse_partial(
        &self,
        transaction_id: Uuid,
        amount: u64,
        idempotency_key: &str,
    ) -> Result<TransactionView> {
        self.processor
            .reverse_partial(transaction_id, amount, idempotency_key)
            .await
    }

    pub async fn get_balance(&self, account_id: Uuid) -> Result<BalanceView> {
        self.processor.get_balance(account_id).await
    }

    pub async fn get_transaction(&self, transaction_id: Uuid) -> Result<TransactionView> {
        self.processor.get_transaction(transaction_id).await
    }

    pub async fn list_transactions(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> Result<Vec<TransactionView>> {
        self.processor.list_transactions(account_id, page).await
    }

    /// One settlement sweep as of the ledger clock.
    pub async fn settle(&self) -> Result<SettlementReport> {
        self.settlement.run(self.clock.now()).await
    }

    pub async fn reconcile_account(&self, account_id: Uuid) -> Result<Option<Reconciliation>> {
        self.settlement.reconcile_account(account_id).await
    }

    pub async fn lock_info(&self, account_id: Uuid) -> Result<Option<LockInfo>> {
        self.locks.lock_info(account_id).await
    }

    pub async fn force_unlock(&self, account_id: Uuid) -> Result<bool> {
        self.locks.force_release(account_id).await
    }

    pub fn processor(&self) -> &TransactionProcessor {
        &self.processor
    }

    pub fn settlement(&self) -> &SettlementJob {
        &self.settlement
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }
}
