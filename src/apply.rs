//! Second phase of applying a transaction: turn its recorded deltas into lot
//! post-images and commit them together with the account.
//!
//! Fresh requests and resumed Pending transactions both go through here, so a
//! resume replays exactly what was planned.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::error::{LedgerError, Missing, Result};
use crate::lot::{DeltaMismatch, Lot};
use crate::store::{AccountWrite, CommitBatch, LedgerStore};
use crate::transaction::{Transaction, TransactionKind};

pub(crate) enum Settled {
    Applied(Transaction),
    /// Deltas no longer fit the lots; the transaction was stored as Failed.
    Failed { reason: String },
}

/// Apply `tx.deltas` in order to `current`, returning every touched lot once.
pub(crate) fn materialize(tx: &Transaction, current: Vec<Lot>) -> std::result::Result<Vec<Lot>, DeltaMismatch> {
    let mut lots: HashMap<Uuid, Lot> = current.into_iter().map(|l| (l.id, l)).collect();
    let mut touched: Vec<Uuid> = Vec::with_capacity(tx.deltas.len());

    for delta in &tx.deltas {
        let next = match lots.get(&delta.lot_id) {
            Some(lot) if lot.account_id != tx.account_id => {
                return Err(DeltaMismatch {
                    lot_id: delta.lot_id,
                    effect: delta.effect,
                    reason: "lot belongs to another account",
                });
            }
            Some(lot) => lot.apply_delta(delta)?,
            None if delta.can_create() => Lot::from_delta(
                delta,
                tx.account_id,
                tx.created_at,
                tx.lot_expires_at,
                tx.id,
            ),
            None => {
                return Err(DeltaMismatch {
                    lot_id: delta.lot_id,
                    effect: delta.effect,
                    reason: "lot does not exist",
                });
            }
        };
        if !touched.contains(&next.id) {
            touched.push(next.id);
        }
        lots.insert(next.id, next);
    }

    Ok(touched.iter().filter_map(|id| lots.remove(id)).collect())
}

/// Commit a recorded Pending transaction, or settle it as Failed if its
/// deltas cannot be applied any more. Must run under the account lock.
pub(crate) async fn settle_pending(
    store: &dyn LedgerStore,
    tx: &Transaction,
    now: DateTime<Utc>,
) -> Result<Settled> {
    let ids: Vec<Uuid> = tx.deltas.iter().map(|d| d.lot_id).collect();
    let current = store.get_lots(&ids).await?;

    let lots = match materialize(tx, current) {
        Ok(lots) => lots,
        Err(mismatch) => {
            let reason = mismatch.to_string();
            warn!(
                transaction_id = %tx.id,
                key = %tx.idempotency_key,
                %reason,
                "pending transaction no longer applies"
            );
            store.fail_pending(&tx.failed(reason.clone(), now)).await?;
            return Ok(Settled::Failed { reason });
        }
    };

    let net = tx.net_amount();
    let write = match store.get_account(tx.account_id).await? {
        Some(account) => {
            let balance = account.balance_after(net).ok_or_else(|| {
                LedgerError::Storage(format!(
                    "account {} balance {} cannot absorb {}",
                    account.id, account.balance, net
                ))
            })?;
            AccountWrite::update(&account, balance)
        }
        None if tx.kind == TransactionKind::Credit && net >= 0 => {
            AccountWrite::create(tx.account_id, net as u64)
        }
        None => return Err(LedgerError::not_found(Missing::Account(tx.account_id))),
    };

    let applied = tx.applied(now);
    store
        .commit(CommitBatch {
            account: write,
            lots,
            transaction: applied.clone(),
            committed_at: now,
        })
        .await?;

    Ok(Settled::Applied(applied))
}
