use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a Lot.
/// Expired and Void are terminal. Consumed can only go back to Active through a reversal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Active,
    Consumed,
    Expired,
    Void,
}

impl LotStatus {
    pub fn can_transition_to(&self, target: LotStatus) -> bool {
        match (self, target) {
            (s1, s2) if *s1 == s2 => true,
            (LotStatus::Active, LotStatus::Consumed) => true,
            (LotStatus::Active, LotStatus::Expired) => true,
            (LotStatus::Active, LotStatus::Void) => true,
            (LotStatus::Consumed, LotStatus::Active) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LotStatus::Expired | LotStatus::Void)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LotStatus::Active => "active",
            LotStatus::Consumed => "consumed",
            LotStatus::Expired => "expired",
            LotStatus::Void => "void",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LotStatus::Active),
            "consumed" => Some(LotStatus::Consumed),
            "expired" => Some(LotStatus::Expired),
            "void" => Some(LotStatus::Void),
            _ => None,
        }
    }
}

/// How a transaction touched a lot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeltaEffect {
    /// A new lot was earned.
    Create,
    /// Points were spent from the lot.
    Consume,
    /// Previously spent points were put back.
    Restore,
    /// The remainder was forfeited past expiry.
    Expire,
    /// An untouched lot was cancelled.
    Void,
}

/// Exactly how much of one lot a transaction touched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LotDelta {
    pub lot_id: Uuid,
    pub amount: u64,
    pub effect: DeltaEffect,
}

impl LotDelta {
    pub fn new(lot_id: Uuid, amount: u64, effect: DeltaEffect) -> Self {
        Self {
            lot_id,
            amount,
            effect,
        }
    }

    /// Effect on the account balance.
    pub fn signed_amount(&self) -> i64 {
        match self.effect {
            DeltaEffect::Create | DeltaEffect::Restore => self.amount as i64,
            DeltaEffect::Consume | DeltaEffect::Expire | DeltaEffect::Void => -(self.amount as i64),
        }
    }

    /// Whether this delta may bring a lot into existence.
    pub fn can_create(&self) -> bool {
        matches!(self.effect, DeltaEffect::Create | DeltaEffect::Restore)
    }
}

/// A delta that cannot be applied to the lot as it currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaMismatch {
    pub lot_id: Uuid,
    pub effect: DeltaEffect,
    pub reason: &'static str,
}

impl fmt::Display for DeltaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} on lot {}: {}", self.effect, self.lot_id, self.reason)
    }
}

/// A discrete batch of points with its own remainder and expiry.
///
/// Invariants:
/// - `remaining_amount <= original_amount`
/// - `remaining_amount == 0` for every status but Active
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lot {
    pub id: Uuid,
    pub account_id: Uuid,
    pub original_amount: u64,
    pub remaining_amount: u64,
    pub earned_at: DateTime<Utc>,
    /// `None` never expires.
    pub expires_at: Option<DateTime<Utc>>,
    pub status: LotStatus,
    /// Transaction that brought this lot into existence.
    pub source_transaction_id: Uuid,
}

impl Lot {
    pub fn new(
        account_id: Uuid,
        amount: u64,
        earned_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        source_transaction_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            original_amount: amount,
            remaining_amount: amount,
            earned_at,
            expires_at,
            status: LotStatus::Active,
            source_transaction_id,
        }
    }

    /// Materialise the lot a Create/Restore delta names when it does not exist yet.
    pub fn from_delta(
        delta: &LotDelta,
        account_id: Uuid,
        earned_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        source_transaction_id: Uuid,
    ) -> Self {
        Self {
            id: delta.lot_id,
            account_id,
            original_amount: delta.amount,
            remaining_amount: delta.amount,
            earned_at,
            expires_at,
            status: LotStatus::Active,
            source_transaction_id,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LotStatus::Active
    }

    /// Spendable as of the given instant.
    pub fn is_available(&self, as_of: DateTime<Utc>) -> bool {
        self.is_active() && self.remaining_amount > 0 && !self.is_past_expiry(as_of)
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Untouched since it was earned.
    pub fn is_intact(&self) -> bool {
        self.is_active() && self.remaining_amount == self.original_amount
    }

    /// Soonest expiry first (never-expiring last), then oldest earned, then id.
    pub fn consumption_cmp(&self, other: &Lot) -> Ordering {
        let expiry = match (self.expires_at, other.expires_at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        expiry
            .then_with(|| self.earned_at.cmp(&other.earned_at))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Apply one delta, returning the updated lot.
    pub fn apply_delta(&self, delta: &LotDelta) -> Result<Lot, DeltaMismatch> {
        let reject = |reason| DeltaMismatch {
            lot_id: self.id,
            effect: delta.effect,
            reason,
        };

        if delta.lot_id != self.id {
            return Err(reject("delta names a different lot"));
        }
        if delta.amount == 0 {
            return Err(reject("zero amount"));
        }

        let mut next = self.clone();
        match delta.effect {
            DeltaEffect::Create => return Err(reject("lot already exists")),
            DeltaEffect::Consume => {
                if !self.is_active() {
                    return Err(reject("lot is not active"));
                }
                if self.remaining_amount < delta.amount {
                    return Err(reject("not enough remaining"));
                }
                next.remaining_amount -= delta.amount;
                if next.remaining_amount == 0 {
                    next.status = LotStatus::Consumed;
                }
            }
            DeltaEffect::Restore => {
                if self.status.is_terminal() {
                    return Err(reject("lot is expired or void"));
                }
                if self.remaining_amount + delta.amount > self.original_amount {
                    return Err(reject("restore exceeds original amount"));
                }
                next.remaining_amount += delta.amount;
                next.status = LotStatus::Active;
            }
            DeltaEffect::Expire => {
                if !self.is_active() {
                    return Err(reject("lot is not active"));
                }
                if self.remaining_amount != delta.amount {
                    return Err(reject("forfeit must equal the remainder"));
                }
                next.remaining_amount = 0;
                next.status = LotStatus::Expired;
            }
            DeltaEffect::Void => {
                if !self.is_intact() || self.original_amount != delta.amount {
                    return Err(reject("only an untouched lot can be voided"));
                }
                next.remaining_amount = 0;
                next.status = LotStatus::Void;
            }
        }

        debug_assert!(self.status.can_transition_to(next.status));
        Ok(next)
    }
}
