use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lot::Lot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceView {
    pub account_id: Uuid,
    /// Spendable points as of `as_of`.
    pub available: u64,
    /// Earliest expiry among the lots counted in `available`.
    pub next_expiry: Option<DateTime<Utc>>,
    pub as_of: DateTime<Utc>,
}

impl BalanceView {
    pub fn empty(account_id: Uuid, as_of: DateTime<Utc>) -> Self {
        Self {
            account_id,
            available: 0,
            next_expiry: None,
            as_of,
        }
    }

    pub fn from_lots<'a>(
        account_id: Uuid,
        lots: impl IntoIterator<Item = &'a Lot>,
        as_of: DateTime<Utc>,
    ) -> Self {
        let mut view = Self::empty(account_id, as_of);
        for lot in lots.into_iter().filter(|l| l.is_available(as_of)) {
            view.available += lot.remaining_amount;
            if let Some(at) = lot.expires_at {
                view.next_expiry = Some(view.next_expiry.map_or(at, |cur| cur.min(at)));
            }
        }
        view
    }

    /// A cached copy stops being trustworthy once a counted lot lapses.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.next_expiry.is_none_or(|at| now < at)
    }
}
