//! Expiry sweep and balance reconciliation.
//!
//! Each account is an independent unit of work: it is locked like any other
//! mutation, every due lot is re-checked under the lock, and a failure on one
//! account never stops the others. Expiries are keyed by lot id, so running
//! the sweep twice forfeits each lot at most once.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::apply::{Settled, settle_pending};
use crate::cache::BalanceCache;
use crate::clock::Clock;
use crate::config::SettlementConfig;
use crate::error::{LedgerError, Result};
use crate::lock::{LockGuard, LockManager};
use crate::lot::{DeltaEffect, LotDelta};
use crate::store::{AccountWrite, ExpiryCursor, LedgerStore};
use crate::transaction::{Transaction, TransactionKind, TransactionStatus, expire_key};

/// Stored balance that disagreed with the lot sum and was rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub account_id: Uuid,
    pub stored: u64,
    pub computed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettlementReport {
    pub scanned_lots: usize,
    pub expired_lots: usize,
    /// Due lots that turned out to need nothing: already consumed, already
    /// expired by an earlier run, or no longer due.
    pub skipped_lots: usize,
    pub forfeited_points: u64,
    pub accounts_settled: usize,
    pub failed_accounts: Vec<Uuid>,
    pub reconciliations: Vec<Reconciliation>,
}

#[derive(Debug, Default)]
struct AccountSettlement {
    expired: usize,
    skipped: usize,
    forfeited: u64,
    reconciliation: Option<Reconciliation>,
}

impl AccountSettlement {
    fn changed(&self) -> bool {
        self.expired > 0 || self.reconciliation.is_some()
    }
}

pub struct SettlementJob {
    store: Arc<dyn LedgerStore>,
    locks: LockManager,
    cache: BalanceCache,
    clock: Arc<dyn Clock>,
    config: SettlementConfig,
}

impl SettlementJob {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        locks: LockManager,
        cache: BalanceCache,
        clock: Arc<dyn Clock>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            locks,
            cache,
            clock,
            config,
        }
    }

    /// Expire every Active lot due at `now`, then reconcile the touched accounts.
    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SettlementReport> {
        let mut report = SettlementReport::default();
        let mut cursor: Option<ExpiryCursor> = None;
        let batch_size = self.config.batch_size.max(1);
        // The run is one lock owner; accounts within it never nest.
        let owner = Uuid::now_v7();

        loop {
            let page = self
                .store
                .find_expiring_lots(now, cursor, batch_size)
                .await?;
            let Some(next) = page.last().and_then(ExpiryCursor::after) else {
                break;
            };
            cursor = Some(next);
            report.scanned_lots += page.len();
            let exhausted = page.len() < batch_size;

            let mut by_account: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
            for lot in page {
                by_account.entry(lot.account_id).or_default().push(lot.id);
            }

            let results: Vec<(Uuid, Result<AccountSettlement>)> = stream::iter(by_account)
                .map(|(account_id, lot_ids)| async move {
                    let result = self
                        .settle_with_retry(owner, account_id, &lot_ids, now)
                        .await;
                    (account_id, result)
                })
                .buffer_unordered(self.config.account_concurrency.max(1))
                .collect()
                .await;

            for (account_id, result) in results {
                match result {
                    Ok(settled) => {
                        report.accounts_settled += 1;
                        report.expired_lots += settled.expired;
                        report.skipped_lots += settled.skipped;
                        report.forfeited_points += settled.forfeited;
                        report.reconciliations.extend(settled.reconciliation);
                    }
                    Err(e) => {
                        counter!("points.settlement.account_failures").increment(1);
                        warn!(%account_id, error = %e, "account settlement failed");
                        if !report.failed_accounts.contains(&account_id) {
                            report.failed_accounts.push(account_id);
                        }
                    }
                }
            }

            if exhausted {
                break;
            }
        }

        counter!("points.settlement.lots_expired").increment(report.expired_lots as u64);
        counter!("points.settlement.points_forfeited").increment(report.forfeited_points);
        info!(
            scanned = report.scanned_lots,
            expired = report.expired_lots,
            skipped = report.skipped_lots,
            forfeited = report.forfeited_points,
            failed_accounts = report.failed_accounts.len(),
            "settlement run finished"
        );
        Ok(report)
    }

    /// Compare an account's stored balance with its lot sum under the lock,
    /// repairing the balance if they differ.
    #[instrument(skip(self))]
    pub async fn reconcile_account(&self, account_id: Uuid) -> Result<Option<Reconciliation>> {
        let guard = self.locks.acquire(account_id, Uuid::now_v7()).await?;
        let result = self.reconcile_locked(account_id, self.clock.now()).await;
        release(guard).await;
        if matches!(result, Ok(Some(_))) {
            self.cache.invalidate(account_id).await;
        }
        result
    }

    async fn settle_with_retry(
        &self,
        owner: Uuid,
        account_id: Uuid,
        lot_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<AccountSettlement> {
        self.config
            .account_retry()
            .retry_if(
                move |attempt| {
                    if attempt > 0 {
                        debug!(%account_id, attempt, "retrying account settlement");
                    }
                    self.settle_account(owner, account_id, lot_ids, now)
                },
                LedgerError::is_retryable,
            )
            .await
    }

    async fn settle_account(
        &self,
        owner: Uuid,
        account_id: Uuid,
        lot_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<AccountSettlement> {
        let mut guard = self.locks.acquire(account_id, owner).await?;
        let result = self.expire_locked(&mut guard, account_id, lot_ids, now).await;
        release(guard).await;
        if result.as_ref().is_ok_and(AccountSettlement::changed) {
            self.cache.invalidate(account_id).await;
        }
        result
    }

    async fn expire_locked(
        &self,
        guard: &mut LockGuard,
        account_id: Uuid,
        lot_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<AccountSettlement> {
        let mut out = AccountSettlement::default();

        for &lot_id in lot_ids {
            let key = expire_key(lot_id);

            let pending = match self.store.find_transaction(account_id, &key).await? {
                Some(existing) if existing.kind != TransactionKind::Expire => {
                    return Err(LedgerError::InvalidRequest(format!(
                        "expiry key {} is held by a {} transaction {}",
                        key,
                        existing.kind.as_str(),
                        existing.id
                    )));
                }
                Some(existing) if existing.status == TransactionStatus::Pending => existing,
                Some(_) => {
                    out.skipped += 1;
                    continue;
                }
                None => {
                    // Re-check under the lock: a debit may have emptied it since the scan.
                    let Some(lot) = self.store.get_lot(lot_id).await? else {
                        out.skipped += 1;
                        continue;
                    };
                    if !lot.is_active() || lot.remaining_amount == 0 || !lot.is_past_expiry(now) {
                        debug!(%lot_id, status = lot.status.as_str(), "lot no longer due");
                        out.skipped += 1;
                        continue;
                    }
                    let tx = Transaction::pending(
                        account_id,
                        TransactionKind::Expire,
                        lot.remaining_amount,
                        key,
                        now,
                    )
                    .with_deltas(vec![LotDelta::new(
                        lot.id,
                        lot.remaining_amount,
                        DeltaEffect::Expire,
                    )]);
                    self.store.record_pending(&tx).await?;
                    tx
                }
            };

            match settle_pending(self.store.as_ref(), &pending, now).await? {
                Settled::Applied(transaction) => {
                    out.expired += 1;
                    out.forfeited += transaction.amount;
                    debug!(%lot_id, forfeited = transaction.amount, "lot expired");
                }
                Settled::Failed { .. } => out.skipped += 1,
            }
            guard.extend().await?;
        }

        out.reconciliation = self.reconcile_locked(account_id, now).await?;
        Ok(out)
    }

    async fn reconcile_locked(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Reconciliation>> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(None);
        };
        let computed: u64 = self
            .store
            .find_lots(account_id)
            .await?
            .iter()
            .filter(|lot| lot.is_active())
            .map(|lot| lot.remaining_amount)
            .sum();
        if computed == account.balance {
            return Ok(None);
        }

        warn!(
            %account_id,
            stored = account.balance,
            computed,
            "stored balance disagrees with lots; repairing"
        );
        self.store
            .write_balance(AccountWrite::update(&account, computed), now)
            .await?;
        Ok(Some(Reconciliation {
            account_id,
            stored: account.balance,
            computed,
        }))
    }
}

async fn release(guard: LockGuard) {
    let key = guard.key().to_string();
    if let Err(e) = guard.release().await {
        warn!(%key, error = %e, "lock release failed; lease will lapse");
    }
}
