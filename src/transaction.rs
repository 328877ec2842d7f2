use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lot::LotDelta;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Credit,
    Debit,
    Expire,
    Reversal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Credit => "credit",
            TransactionKind::Debit => "debit",
            TransactionKind::Expire => "expire",
            TransactionKind::Reversal => "reversal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credit" => Some(TransactionKind::Credit),
            "debit" => Some(TransactionKind::Debit),
            "expire" => Some(TransactionKind::Expire),
            "reversal" => Some(TransactionKind::Reversal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Applied,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Applied => "applied",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "applied" => Some(TransactionStatus::Applied),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

const EXPIRE_KEY_PREFIX: &str = "expire:";
const REVERSAL_KEY_PREFIX: &str = "reverse:";

/// Idempotency key the settlement sweep uses for a lot's expiry.
pub fn expire_key(lot_id: Uuid) -> String {
    format!("{}{}", EXPIRE_KEY_PREFIX, lot_id)
}

/// Idempotency key of the full reversal of a transaction.
pub fn reversal_key(transaction_id: Uuid) -> String {
    format!("{}{}", REVERSAL_KEY_PREFIX, transaction_id)
}

/// Keys in the namespaces the ledger derives for itself. Callers may not use them.
pub fn is_reserved_key(key: &str) -> bool {
    let key = key.trim_start();
    key.starts_with(EXPIRE_KEY_PREFIX) || key.starts_with(REVERSAL_KEY_PREFIX)
}

/// An entry in the append-only audit trail.
///
/// Immutable once Applied or Failed. Only the transaction processor and the
/// settlement job write these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: TransactionKind,
    /// Requested amount.
    pub amount: u64,
    pub idempotency_key: String,
    pub status: TransactionStatus,
    pub deltas: Vec<LotDelta>,
    /// Expiry of any lot this transaction brings into existence.
    pub lot_expires_at: Option<DateTime<Utc>>,
    /// Original transaction, for reversals.
    pub reverses: Option<Uuid>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn pending(
        account_id: Uuid,
        kind: TransactionKind,
        amount: u64,
        idempotency_key: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            kind,
            amount,
            idempotency_key: idempotency_key.into(),
            status: TransactionStatus::Pending,
            deltas: Vec::new(),
            lot_expires_at: None,
            reverses: None,
            failure_reason: None,
            created_at,
            settled_at: None,
        }
    }

    pub fn with_deltas(mut self, deltas: Vec<LotDelta>) -> Self {
        self.deltas = deltas;
        self
    }

    pub fn with_lot_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.lot_expires_at = expires_at;
        self
    }

    pub fn reversing(mut self, original: Uuid) -> Self {
        self.reverses = Some(original);
        self
    }

    pub fn applied(&self, at: DateTime<Utc>) -> Self {
        Self {
            status: TransactionStatus::Applied,
            settled_at: Some(at),
            ..self.clone()
        }
    }

    pub fn failed(&self, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: TransactionStatus::Failed,
            failure_reason: Some(reason.into()),
            settled_at: Some(at),
            ..self.clone()
        }
    }

    pub fn is_applied(&self) -> bool {
        self.status == TransactionStatus::Applied
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }

    /// Net effect on the account balance.
    pub fn net_amount(&self) -> i64 {
        self.deltas.iter().map(LotDelta::signed_amount).sum()
    }

    pub fn view(&self) -> TransactionView {
        TransactionView::from(self)
    }
}

/// What callers of the ledger see for a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionView {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: TransactionKind,
    pub amount: u64,
    pub idempotency_key: String,
    pub status: TransactionStatus,
    pub deltas: Vec<LotDelta>,
    pub reverses: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            account_id: tx.account_id,
            kind: tx.kind,
            amount: tx.amount,
            idempotency_key: tx.idempotency_key.clone(),
            status: tx.status,
            deltas: tx.deltas.clone(),
            reverses: tx.reverses,
            created_at: tx.created_at,
        }
    }
}
