//! Credit, debit and reversal under the account lock.
//!
//! Every request runs the same protocol: lock, look the idempotency key up,
//! plan lot deltas, record the transaction as Pending, commit, unlock,
//! invalidate the balance cache. Optimistic conflicts and storage errors
//! restart the whole protocol under the same lock owner; a Pending record left
//! behind by a crash or conflict is resumed from its recorded deltas instead
//! of being re-planned.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::account::Account;
use crate::apply::{Settled, settle_pending};
use crate::balance::BalanceView;
use crate::cache::BalanceCache;
use crate::clock::Clock;
use crate::config::ProcessorConfig;
use crate::error::{LedgerError, Missing, NotReversibleReason, PolicyViolation, Result};
use crate::lock::LockManager;
use crate::lot::{DeltaEffect, LotDelta};
use crate::policy::{EarnPolicy, ExpiryPolicy};
use crate::store::{LedgerStore, Page};
use crate::transaction::{
    Transaction, TransactionKind, TransactionStatus, TransactionView, is_reserved_key,
    reversal_key,
};

enum Operation {
    Credit { amount: u64, expiry: ExpiryPolicy },
    Debit { amount: u64 },
    /// `amount: None` reverses everything still outstanding under the derived key.
    Reverse {
        original_id: Uuid,
        amount: Option<u64>,
    },
}

impl Operation {
    fn kind(&self) -> TransactionKind {
        match self {
            Operation::Credit { .. } => TransactionKind::Credit,
            Operation::Debit { .. } => TransactionKind::Debit,
            Operation::Reverse { .. } => TransactionKind::Reversal,
        }
    }
}

struct Outcome {
    transaction: Transaction,
    /// False when an earlier result was replayed.
    committed: bool,
}

pub struct TransactionProcessor {
    store: Arc<dyn LedgerStore>,
    locks: LockManager,
    cache: BalanceCache,
    clock: Arc<dyn Clock>,
    policy: EarnPolicy,
    config: ProcessorConfig,
}

impl TransactionProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        locks: LockManager,
        cache: BalanceCache,
        clock: Arc<dyn Clock>,
        policy: EarnPolicy,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            locks,
            cache,
            clock,
            policy,
            config,
        }
    }

    pub fn policy(&self) -> &EarnPolicy {
        &self.policy
    }

    /// Earn `amount` points into a new lot.
    #[instrument(skip(self), fields(%account_id))]
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: u64,
        idempotency_key: &str,
        expiry: ExpiryPolicy,
    ) -> Result<TransactionView> {
        validate(amount, idempotency_key)?;
        self.execute(account_id, idempotency_key, Operation::Credit { amount, expiry })
            .await
    }

    /// Spend `amount` points, soonest-expiring lots first. All or nothing.
    #[instrument(skip(self), fields(%account_id))]
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: u64,
        idempotency_key: &str,
    ) -> Result<TransactionView> {
        validate(amount, idempotency_key)?;
        self.execute(account_id, idempotency_key, Operation::Debit { amount })
            .await
    }

    /// Undo a credit (void its untouched lot) or whatever is still
    /// outstanding of a debit (put the points back).
    #[instrument(skip(self), fields(%transaction_id))]
    pub async fn reverse(&self, transaction_id: Uuid) -> Result<TransactionView> {
        let original = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or(LedgerError::not_found(Missing::Transaction(transaction_id)))?;
        let key = reversal_key(original.id);
        self.execute(
            original.account_id,
            &key,
            Operation::Reverse {
                original_id: original.id,
                amount: None,
            },
        )
        .await
    }

    /// Give back `amount` of a debit. May be repeated under fresh keys until
    /// the whole debit is back; longest-lived usage is restored first.
    #[instrument(skip(self), fields(%transaction_id))]
    pub async fn reverse_partial(
        &self,
        transaction_id: Uuid,
        amount: u64,
        idempotency_key: &str,
    ) -> Result<TransactionView> {
        validate(amount, idempotency_key)?;
        let original = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                LedgerError::not_found(Missing::Transaction(transaction_id))
                    .with_request_key(idempotency_key)
            })?;
        self.execute(
            original.account_id,
            idempotency_key,
            Operation::Reverse {
                original_id: original.id,
                amount: Some(amount),
            },
        )
        .await
    }

    pub async fn get_balance(&self, account_id: Uuid) -> Result<BalanceView> {
        self.cache.get_balance(account_id).await
    }

    pub async fn get_transaction(&self, transaction_id: Uuid) -> Result<TransactionView> {
        self.store
            .get_transaction(transaction_id)
            .await?
            .map(|tx| tx.view())
            .ok_or(LedgerError::not_found(Missing::Transaction(transaction_id)))
    }

    /// Most recent first.
    pub async fn list_transactions(
        &self,
        account_id: Uuid,
        page: Page,
    ) -> Result<Vec<TransactionView>> {
        Ok(self
            .store
            .list_transactions(account_id, page)
            .await?
            .iter()
            .map(TransactionView::from)
            .collect())
    }

    async fn execute(
        &self,
        account_id: Uuid,
        idempotency_key: &str,
        op: Operation,
    ) -> Result<TransactionView> {
        let kind = op.kind();
        let retry = self.config.conflict_retry();
        let attempts = retry.max_attempts;
        // One lock owner for every attempt of this request.
        let owner = Uuid::now_v7();

        let (this, op) = (self, &op);
        let result = retry
            .retry_if(
                move |attempt| {
                    if attempt > 0 {
                        debug!(attempt, key = idempotency_key, "retrying request");
                    }
                    this.execute_once(owner, account_id, idempotency_key, op)
                },
                LedgerError::is_transient,
            )
            .await;

        match result {
            Ok(outcome) => {
                let tx = outcome.transaction;
                if outcome.committed {
                    counter!("points.transactions.total",
                        "kind" => kind.as_str(),
                        "status" => "applied"
                    )
                    .increment(1);
                    histogram!("points.transaction.amount", "kind" => kind.as_str())
                        .record(tx.amount as f64);
                    info!(transaction_id = %tx.id, amount = tx.amount, "transaction applied");
                } else {
                    counter!("points.transactions.total",
                        "kind" => kind.as_str(),
                        "status" => "replayed"
                    )
                    .increment(1);
                }
                Ok(tx.view())
            }
            Err(err) => {
                counter!("points.transactions.total",
                    "kind" => kind.as_str(),
                    "status" => "failed"
                )
                .increment(1);
                if err.is_transient() {
                    warn!(
                        key = idempotency_key,
                        attempts,
                        error = %err,
                        "giving up after repeated transient failures"
                    );
                    return Err(LedgerError::Transient {
                        idempotency_key: idempotency_key.to_string(),
                        attempts,
                        cause: err.to_string(),
                    });
                }
                Err(err.with_request_key(idempotency_key))
            }
        }
    }

    async fn execute_once(
        &self,
        owner: Uuid,
        account_id: Uuid,
        idempotency_key: &str,
        op: &Operation,
    ) -> Result<Outcome> {
        let guard = self.locks.acquire(account_id, owner).await?;
        let result = self.apply_locked(account_id, idempotency_key, op).await;
        if let Err(e) = guard.release().await {
            warn!(%account_id, error = %e, "lock release failed; lease will lapse");
        }
        if matches!(result, Ok(Outcome { committed: true, .. })) {
            self.cache.invalidate(account_id).await;
        }
        result
    }

    async fn apply_locked(
        &self,
        account_id: Uuid,
        idempotency_key: &str,
        op: &Operation,
    ) -> Result<Outcome> {
        let now = self.clock.now();

        if let Some(existing) = self.store.find_transaction(account_id, idempotency_key).await? {
            return self.replay(existing, op, now).await;
        }

        let account = self.store.get_account(account_id).await?;
        let planned = match op {
            Operation::Credit { amount, expiry } => {
                self.plan_credit(account_id, account.as_ref(), *amount, *expiry, idempotency_key, now)?
            }
            Operation::Debit { amount } => {
                let account =
                    account.ok_or(LedgerError::not_found(Missing::Account(account_id)))?;
                self.plan_debit(&account, *amount, idempotency_key, now).await?
            }
            Operation::Reverse {
                original_id,
                amount,
            } => {
                self.plan_reversal(*original_id, *amount, idempotency_key, now)
                    .await?
            }
        };

        self.store.record_pending(&planned).await?;
        self.settle(&planned, now).await
    }

    async fn replay(&self, existing: Transaction, op: &Operation, now: DateTime<Utc>) -> Result<Outcome> {
        if existing.kind != op.kind() {
            return Err(LedgerError::InvalidRequest(format!(
                "idempotency key {} already used for a {} transaction",
                existing.idempotency_key,
                existing.kind.as_str()
            )));
        }
        if let Operation::Reverse { original_id, .. } = op {
            if existing.reverses != Some(*original_id) {
                return Err(LedgerError::InvalidRequest(format!(
                    "idempotency key {} already used to reverse another transaction",
                    existing.idempotency_key
                )));
            }
        }
        match existing.status {
            TransactionStatus::Applied => {
                if let Operation::Reverse {
                    original_id,
                    amount: None,
                } = op
                {
                    return Err(LedgerError::NotReversible {
                        transaction_id: *original_id,
                        idempotency_key: existing.idempotency_key.clone(),
                        reason: NotReversibleReason::AlreadyReversed(existing.id),
                    });
                }
                debug!(transaction_id = %existing.id, "replaying applied transaction");
                Ok(Outcome {
                    transaction: existing,
                    committed: false,
                })
            }
            TransactionStatus::Failed => Err(LedgerError::PreviouslyFailed {
                reason: existing
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                idempotency_key: existing.idempotency_key,
            }),
            TransactionStatus::Pending => {
                info!(transaction_id = %existing.id, "resuming pending transaction");
                self.settle(&existing, now).await
            }
        }
    }

    async fn settle(&self, tx: &Transaction, now: DateTime<Utc>) -> Result<Outcome> {
        match settle_pending(self.store.as_ref(), tx, now).await? {
            Settled::Applied(transaction) => Ok(Outcome {
                transaction,
                committed: true,
            }),
            Settled::Failed { reason } => Err(LedgerError::PreviouslyFailed {
                idempotency_key: tx.idempotency_key.clone(),
                reason,
            }),
        }
    }

    fn plan_credit(
        &self,
        account_id: Uuid,
        account: Option<&Account>,
        amount: u64,
        expiry: ExpiryPolicy,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction> {
        let violation = |violation: PolicyViolation| LedgerError::Policy {
            idempotency_key: idempotency_key.to_string(),
            violation,
        };
        self.policy.check_amount(amount).map_err(violation)?;
        self.policy
            .check_balance(account.map_or(0, |a| a.balance), amount)
            .map_err(violation)?;
        let expires_at = self.policy.resolve_expiry(expiry, now).map_err(violation)?;

        let lot_id = Uuid::now_v7();
        Ok(
            Transaction::pending(account_id, TransactionKind::Credit, amount, idempotency_key, now)
                .with_lot_expiry(expires_at)
                .with_deltas(vec![LotDelta::new(lot_id, amount, DeltaEffect::Create)]),
        )
    }

    async fn plan_debit(
        &self,
        account: &Account,
        amount: u64,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction> {
        let lots = self.store.find_active_lots(account.id, now).await?;

        let mut outstanding = amount;
        let mut deltas = Vec::new();
        for lot in &lots {
            if outstanding == 0 {
                break;
            }
            let take = outstanding.min(lot.remaining_amount);
            deltas.push(LotDelta::new(lot.id, take, DeltaEffect::Consume));
            outstanding -= take;
        }

        if outstanding > 0 {
            return Err(LedgerError::InsufficientBalance {
                account_id: account.id,
                idempotency_key: idempotency_key.to_string(),
                requested: amount,
                available: amount - outstanding,
            });
        }

        Ok(
            Transaction::pending(account.id, TransactionKind::Debit, amount, idempotency_key, now)
                .with_deltas(deltas),
        )
    }

    async fn plan_reversal(
        &self,
        original_id: Uuid,
        amount: Option<u64>,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Transaction> {
        let original = self
            .store
            .get_transaction(original_id)
            .await?
            .ok_or(LedgerError::not_found(Missing::Transaction(original_id)))?;
        let refuse = |reason| LedgerError::NotReversible {
            transaction_id: original.id,
            idempotency_key: idempotency_key.to_string(),
            reason,
        };

        match original.kind {
            TransactionKind::Expire => return Err(refuse(NotReversibleReason::ExpireTransaction)),
            TransactionKind::Reversal => {
                return Err(refuse(NotReversibleReason::ReversalTransaction));
            }
            TransactionKind::Credit | TransactionKind::Debit => {}
        }
        if !original.is_applied() {
            return Err(refuse(NotReversibleReason::NotApplied));
        }

        if original.kind == TransactionKind::Credit {
            if amount.is_some() {
                return Err(refuse(NotReversibleReason::CreditNotDivisible));
            }
            let mut deltas = Vec::new();
            for delta in original.deltas.iter().filter(|d| d.effect == DeltaEffect::Create) {
                let lot = self
                    .store
                    .get_lot(delta.lot_id)
                    .await?
                    .ok_or(LedgerError::not_found(Missing::Lot(delta.lot_id)))?;
                if !lot.is_intact() {
                    return Err(refuse(NotReversibleReason::CreditLotNotIntact(lot.id)));
                }
                deltas.push(LotDelta::new(lot.id, lot.original_amount, DeltaEffect::Void));
            }
            return Ok(Transaction::pending(
                original.account_id,
                TransactionKind::Reversal,
                original.amount,
                idempotency_key,
                now,
            )
            .reversing(original.id)
            .with_deltas(deltas));
        }

        let prior = self.settled_reversals(&original, now).await?;
        let consumed: u64 = original
            .deltas
            .iter()
            .filter(|d| d.effect == DeltaEffect::Consume)
            .map(|d| d.amount)
            .sum();
        let restored: u64 = prior.iter().map(|tx| tx.amount).sum();
        let remaining = consumed.saturating_sub(restored);
        if remaining == 0 {
            let by = prior.last().map_or(original.id, |tx| tx.id);
            return Err(refuse(NotReversibleReason::AlreadyReversed(by)));
        }
        let amount = match amount {
            None => remaining,
            Some(requested) if requested <= remaining => requested,
            Some(requested) => {
                return Err(refuse(NotReversibleReason::ExceedsReversible {
                    requested,
                    remaining,
                }));
            }
        };

        // Debit deltas run soonest-expiring first, so walking them backwards
        // gives back the longest-lived usage first. Earlier reversals walked
        // the same path: the first `restored` points of it are already back.
        // Points go back into their own lot while it is still live; anything
        // whose lot has lapsed lands in one fresh lot.
        let mut skip = restored;
        let mut outstanding = amount;
        let mut deltas = Vec::new();
        let mut lapsed = 0u64;
        for delta in original
            .deltas
            .iter()
            .rev()
            .filter(|d| d.effect == DeltaEffect::Consume)
        {
            if outstanding == 0 {
                break;
            }
            let open = delta.amount.saturating_sub(skip);
            skip = skip.saturating_sub(delta.amount);
            if open == 0 {
                continue;
            }
            let take = open.min(outstanding);
            outstanding -= take;

            let lot = self
                .store
                .get_lot(delta.lot_id)
                .await?
                .ok_or(LedgerError::not_found(Missing::Lot(delta.lot_id)))?;
            if lot.status.is_terminal() || lot.is_past_expiry(now) {
                lapsed += take;
            } else {
                deltas.push(LotDelta::new(lot.id, take, DeltaEffect::Restore));
            }
        }

        let mut reversal = Transaction::pending(
            original.account_id,
            TransactionKind::Reversal,
            amount,
            idempotency_key,
            now,
        )
        .reversing(original.id);
        if lapsed > 0 {
            deltas.push(LotDelta::new(Uuid::now_v7(), lapsed, DeltaEffect::Restore));
            reversal = reversal.with_lot_expiry(Some(self.policy.restored_expiry(now)));
        }
        Ok(reversal.with_deltas(deltas))
    }

    /// Applied reversals of `original`, oldest first. Pending ones are settled
    /// first so the outstanding amount is exact.
    async fn settled_reversals(
        &self,
        original: &Transaction,
        now: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let mut applied = Vec::new();
        let mut resumed = false;
        for tx in self.store.find_reversals(original.id).await? {
            match tx.status {
                TransactionStatus::Applied => applied.push(tx),
                TransactionStatus::Failed => {}
                TransactionStatus::Pending => {
                    info!(transaction_id = %tx.id, "settling pending reversal before planning");
                    let settled = settle_pending(self.store.as_ref(), &tx, now).await?;
                    if let Settled::Applied(done) = settled {
                        resumed = true;
                        applied.push(done);
                    }
                }
            }
        }
        if resumed {
            self.cache.invalidate(original.account_id).await;
        }
        Ok(applied)
    }
}

fn validate(amount: u64, idempotency_key: &str) -> Result<()> {
    if idempotency_key.trim().is_empty() {
        return Err(LedgerError::InvalidRequest(
            "idempotency key must not be empty".to_string(),
        ));
    }
    if is_reserved_key(idempotency_key) {
        return Err(LedgerError::InvalidRequest(format!(
            "idempotency key {} is reserved for ledger-derived transactions",
            idempotency_key
        )));
    }
    if amount == 0 {
        return Err(LedgerError::InvalidAmount {
            idempotency_key: idempotency_key.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_zero_and_blank_key() {
        assert!(matches!(
            validate(0, "k"),
            Err(LedgerError::InvalidAmount { idempotency_key }) if idempotency_key == "k"
        ));
        assert!(matches!(
            validate(5, "  "),
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(validate(5, "k").is_ok());
    }

    #[test]
    fn validation_rejects_ledger_derived_keys() {
        let lot = Uuid::now_v7();
        assert!(matches!(
            validate(5, &crate::transaction::expire_key(lot)),
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate(5, &reversal_key(lot)),
            Err(LedgerError::InvalidRequest(_))
        ));
        assert!(validate(5, "refund:order-1").is_ok());
    }
}
