#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use points_ledger::config::{LockConfig, ProcessorConfig, SettlementConfig};
use points_ledger::store::{AccountWrite, CommitBatch, ExpiryCursor};
use points_ledger::{
    Account, Clock, LedgerConfig, LedgerError, LedgerStore, LockCoordinator, Lot, ManualClock,
    MemoryCacheBackend, MemoryLedgerStore, MemoryLockCoordinator, Page, PointsLedger, Transaction,
};
use uuid::Uuid;

pub struct Harness {
    pub ledger: PointsLedger,
    pub store: MemoryLedgerStore,
    pub clock: Arc<ManualClock>,
    pub cache: MemoryCacheBackend,
    pub locks: MemoryLockCoordinator,
}

/// Short waits and near-zero backoff so failure paths finish quickly.
pub fn fast_config() -> LedgerConfig {
    LedgerConfig {
        lock: LockConfig {
            wait_timeout_ms: 2_000,
            poll_interval_ms: 2,
            ..Default::default()
        },
        processor: ProcessorConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 5,
            ..Default::default()
        },
        settlement: SettlementConfig {
            batch_size: 2,
            max_account_attempts: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let store = MemoryLedgerStore::new();
        Self::with_store(config, store.clone(), Arc::new(store.clone()))
    }

    /// `backing` is what tests inspect; `store` is what the ledger writes through.
    pub fn with_store(
        config: LedgerConfig,
        backing: MemoryLedgerStore,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        Self::with_parts(config, backing, store, MemoryLockCoordinator::new())
    }

    pub fn with_parts(
        config: LedgerConfig,
        backing: MemoryLedgerStore,
        store: Arc<dyn LedgerStore>,
        locks: MemoryLockCoordinator,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = MemoryCacheBackend::new(&config.cache);
        let ledger = PointsLedger::new(
            store,
            Arc::new(locks.clone()),
            Arc::new(cache.clone()),
            Arc::clone(&clock) as Arc<dyn Clock>,
            config,
        );
        Self {
            ledger,
            store: backing,
            clock,
            cache,
            locks,
        }
    }

    /// A ledger over a [`FaultyStore`] that fails the first `commit_faults` commits.
    pub fn faulty(fault: Fault, commit_faults: usize) -> (Self, Arc<FaultyStore>) {
        let backing = MemoryLedgerStore::new();
        let locks = MemoryLockCoordinator::new();
        let store = Arc::new(FaultyStore::new(
            backing.clone(),
            locks.clone(),
            fault,
            commit_faults,
        ));
        let h = Self::with_parts(
            fast_config(),
            backing,
            Arc::clone(&store) as Arc<dyn LedgerStore>,
            locks,
        );
        (h, store)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_days(&self, days: i64) {
        self.clock.advance(Duration::days(days));
    }

    /// Stored balance equals the sum of what is left in Active lots.
    pub async fn assert_consistent(&self, account_id: Uuid) {
        let account = self
            .store
            .get_account(account_id)
            .await
            .unwrap()
            .expect("account exists");
        let lots = self.store.find_lots(account_id).await.unwrap();
        let sum: u64 = lots
            .iter()
            .filter(|lot| lot.is_active())
            .map(|lot| lot.remaining_amount)
            .sum();
        assert_eq!(account.balance, sum, "balance drifted from lot sum");
        for lot in &lots {
            assert!(lot.remaining_amount <= lot.original_amount);
            if !lot.is_active() {
                assert_eq!(lot.remaining_amount, 0, "inactive lot {} keeps points", lot.id);
            }
        }
    }

    pub async fn stored_balance(&self, account_id: Uuid) -> u64 {
        self.store
            .get_account(account_id)
            .await
            .unwrap()
            .map_or(0, |a| a.balance)
    }
}

/// Fixed start so expiry arithmetic in assertions is exact.
pub fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A concurrent writer on another node won the version check.
    Conflict,
    /// The connection dropped before the commit landed.
    Storage,
}

/// Delegates to a memory store, failing the first commits with `fault`.
///
/// Also records who held the account lock at every commit attempt, and can
/// slip a version bump into the next lot scan the way a racing commit would.
pub struct FaultyStore {
    inner: MemoryLedgerStore,
    locks: MemoryLockCoordinator,
    lock_prefix: String,
    fault: Fault,
    commit_faults: AtomicUsize,
    bump_on_scan: AtomicBool,
    commit_holders: Mutex<Vec<Option<String>>>,
}

impl FaultyStore {
    pub fn new(
        inner: MemoryLedgerStore,
        locks: MemoryLockCoordinator,
        fault: Fault,
        commit_faults: usize,
    ) -> Self {
        Self {
            inner,
            locks,
            lock_prefix: LockConfig::default().key_prefix,
            fault,
            commit_faults: AtomicUsize::new(commit_faults),
            bump_on_scan: AtomicBool::new(false),
            commit_holders: Mutex::new(Vec::new()),
        }
    }

    pub fn bump_version_on_next_scan(&self) {
        self.bump_on_scan.store(true, Ordering::SeqCst);
    }

    /// Lock tokens held at each commit attempt, in order.
    pub fn commit_holders(&self) -> Vec<Option<String>> {
        self.commit_holders.lock().unwrap().clone()
    }
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn get_account(&self, account_id: Uuid) -> points_ledger::Result<Option<Account>> {
        self.inner.get_account(account_id).await
    }

    async fn find_active_lots(
        &self,
        account_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> points_ledger::Result<Vec<Lot>> {
        if self.bump_on_scan.swap(false, Ordering::SeqCst) {
            if let Some(account) = self.inner.get_account(account_id).await? {
                self.inner
                    .write_balance(AccountWrite::update(&account, account.balance), as_of)
                    .await?;
            }
        }
        self.inner.find_active_lots(account_id, as_of).await
    }

    async fn find_expiring_lots(
        &self,
        before: DateTime<Utc>,
        after: Option<ExpiryCursor>,
        limit: usize,
    ) -> points_ledger::Result<Vec<Lot>> {
        self.inner.find_expiring_lots(before, after, limit).await
    }

    async fn find_lots(&self, account_id: Uuid) -> points_ledger::Result<Vec<Lot>> {
        self.inner.find_lots(account_id).await
    }

    async fn get_lot(&self, lot_id: Uuid) -> points_ledger::Result<Option<Lot>> {
        self.inner.get_lot(lot_id).await
    }

    async fn get_lots(&self, lot_ids: &[Uuid]) -> points_ledger::Result<Vec<Lot>> {
        self.inner.get_lots(lot_ids).await
    }

    async fn find_transaction(
        &self,
        account_id: Uuid,
        idempotency_key: &str,
    ) -> points_ledger::Result<Option<Transaction>> {
        self.inner.find_transaction(account_id, idempotency_key).await
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> points_ledger::Result<Option<Transaction>> {
        self.inner.get_transaction(transaction_id).await
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> points_ledger::Result<Vec<Transaction>> {
        self.inner.list_transactions(account_id, page).await
    }

    async fn find_reversals(&self, original_id: Uuid) -> points_ledger::Result<Vec<Transaction>> {
        self.inner.find_reversals(original_id).await
    }

    async fn record_pending(&self, transaction: &Transaction) -> points_ledger::Result<()> {
        self.inner.record_pending(transaction).await
    }

    async fn fail_pending(&self, transaction: &Transaction) -> points_ledger::Result<()> {
        self.inner.fail_pending(transaction).await
    }

    async fn commit(&self, batch: CommitBatch) -> points_ledger::Result<Account> {
        let lock_key = format!("{}{}", self.lock_prefix, batch.account.account_id);
        let holder = self.locks.holder(&lock_key).await?.map(|info| info.token);
        self.commit_holders.lock().unwrap().push(holder);

        let left = self.commit_faults.load(Ordering::SeqCst);
        if left > 0 {
            self.commit_faults.store(left - 1, Ordering::SeqCst);
            return Err(match self.fault {
                Fault::Conflict => LedgerError::Conflict {
                    account_id: batch.account.account_id,
                    expected: batch.account.expected_version,
                    found: Some(batch.account.expected_version.unwrap_or(0) + 1),
                },
                Fault::Storage => LedgerError::Storage("connection reset".to_string()),
            });
        }
        self.inner.commit(batch).await
    }

    async fn write_balance(
        &self,
        write: AccountWrite,
        at: DateTime<Utc>,
    ) -> points_ledger::Result<Account> {
        self.inner.write_balance(write, at).await
    }
}
