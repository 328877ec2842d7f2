use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// What a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Account(Uuid),
    Transaction(Uuid),
    Lot(Uuid),
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account(id) => write!(f, "account {}", id),
            Self::Transaction(id) => write!(f, "transaction {}", id),
            Self::Lot(id) => write!(f, "lot {}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReversibleReason {
    /// Expiries are settled by the sweep and never undone by callers.
    ExpireTransaction,
    ReversalTransaction,
    NotApplied,
    AlreadyReversed(Uuid),
    /// The credited lot was partly consumed, expired or voided since.
    CreditLotNotIntact(Uuid),
    /// Credits are voided whole or not at all.
    CreditNotDivisible,
    /// More than what is left of the debit after earlier reversals.
    ExceedsReversible { requested: u64, remaining: u64 },
}

impl fmt::Display for NotReversibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExpireTransaction => write!(f, "expire transactions cannot be reversed"),
            Self::ReversalTransaction => write!(f, "reversals cannot be reversed"),
            Self::NotApplied => write!(f, "transaction was never applied"),
            Self::AlreadyReversed(id) => write!(f, "already reversed by {}", id),
            Self::CreditLotNotIntact(lot) => write!(f, "credited lot {} is no longer intact", lot),
            Self::CreditNotDivisible => write!(f, "credits can only be reversed in full"),
            Self::ExceedsReversible {
                requested,
                remaining,
            } => write!(
                f,
                "{} requested but only {} is left to reverse",
                requested, remaining
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    AmountBelowMinimum { amount: u64, minimum: u64 },
    AmountAboveMaximum { amount: u64, maximum: u64 },
    BalanceLimitExceeded { balance: u64, amount: u64, limit: u64 },
    ExpiryOutOfRange { days: i64, min: u32, max: u32 },
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AmountBelowMinimum { amount, minimum } => {
                write!(f, "credit of {} is below the minimum of {}", amount, minimum)
            }
            Self::AmountAboveMaximum { amount, maximum } => {
                write!(f, "credit of {} is above the maximum of {}", amount, maximum)
            }
            Self::BalanceLimitExceeded {
                balance,
                amount,
                limit,
            } => write!(
                f,
                "balance {} plus credit {} exceeds the limit of {}",
                balance, amount, limit
            ),
            Self::ExpiryOutOfRange { days, min, max } => {
                write!(f, "expiry of {} days is outside {}..={}", days, min, max)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{idempotency_key}: amount must be greater than zero")]
    InvalidAmount { idempotency_key: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {missing}")]
    NotFound {
        missing: Missing,
        /// Set when the lookup failed on behalf of a keyed request.
        idempotency_key: Option<String>,
    },

    #[error("timed out after {waited:?} waiting for lock {key}")]
    LockTimeout {
        key: String,
        waited: Duration,
        idempotency_key: Option<String>,
    },

    #[error("lock {key} is already held by this unit of work")]
    DeadlockRisk { key: String },

    #[error(
        "insufficient balance on account {account_id} for {idempotency_key}: requested {requested}, available {available}"
    )]
    InsufficientBalance {
        account_id: Uuid,
        idempotency_key: String,
        requested: u64,
        available: u64,
    },

    #[error("version conflict on account {account_id}: expected {expected:?}, found {found:?}")]
    Conflict {
        account_id: Uuid,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("idempotency key {idempotency_key} already recorded on account {account_id}")]
    DuplicateIdempotencyKey {
        account_id: Uuid,
        idempotency_key: String,
    },

    #[error("transaction {transaction_id} ({idempotency_key}) is not reversible: {reason}")]
    NotReversible {
        transaction_id: Uuid,
        idempotency_key: String,
        reason: NotReversibleReason,
    },

    #[error("{idempotency_key} previously failed: {reason}")]
    PreviouslyFailed {
        idempotency_key: String,
        reason: String,
    },

    #[error("{idempotency_key} rejected by policy: {violation}")]
    Policy {
        idempotency_key: String,
        violation: PolicyViolation,
    },

    #[error("{idempotency_key} gave up after {attempts} attempts: {cause}")]
    Transient {
        idempotency_key: String,
        attempts: usize,
        cause: String,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("lock backend error: {0}")]
    Lock(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl LedgerError {
    pub fn not_found(missing: Missing) -> Self {
        Self::NotFound {
            missing,
            idempotency_key: None,
        }
    }

    /// Worth retrying the same request later, possibly after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::Conflict { .. }
                | Self::DuplicateIdempotencyKey { .. }
                | Self::Transient { .. }
                | Self::Storage(_)
                | Self::Lock(_)
        )
    }

    pub(crate) fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::DuplicateIdempotencyKey { .. }
        )
    }

    /// Failures the processor retries itself: optimistic conflicts and
    /// storage hiccups. A recorded Pending transaction makes the rerun safe.
    pub(crate) fn is_transient(&self) -> bool {
        self.is_conflict() || matches!(self, Self::Storage(_))
    }

    /// Attach the request's idempotency key to errors raised below the
    /// processor, which do not know it.
    pub(crate) fn with_request_key(self, key: &str) -> Self {
        match self {
            Self::LockTimeout {
                key: lock_key,
                waited,
                idempotency_key: None,
            } => Self::LockTimeout {
                key: lock_key,
                waited,
                idempotency_key: Some(key.to_string()),
            },
            Self::NotFound {
                missing,
                idempotency_key: None,
            } => Self::NotFound {
                missing,
                idempotency_key: Some(key.to_string()),
            },
            other => other,
        }
    }

    /// Idempotency key of the request that failed, when the error is user-visible.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::LockTimeout {
                idempotency_key, ..
            }
            | Self::NotFound {
                idempotency_key, ..
            } => idempotency_key.as_deref(),
            Self::InvalidAmount { idempotency_key }
            | Self::InsufficientBalance {
                idempotency_key, ..
            }
            | Self::DuplicateIdempotencyKey {
                idempotency_key, ..
            }
            | Self::NotReversible {
                idempotency_key, ..
            }
            | Self::PreviouslyFailed {
                idempotency_key, ..
            }
            | Self::Policy {
                idempotency_key, ..
            }
            | Self::Transient {
                idempotency_key, ..
            } => Some(idempotency_key),
            _ => None,
        }
    }
}
