use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyViolation;

/// When the lot created by a credit expires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicy {
    Never,
    /// `EarnPolicy::default_expiry_days` from now.
    Default,
    Days(u32),
    At(DateTime<Utc>),
}

/// Limits applied to every credit before anything is written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EarnPolicy {
    pub min_credit: u64,
    pub max_credit: u64,
    pub max_balance: u64,
    pub default_expiry_days: u32,
    pub min_expiry_days: u32,
    pub max_expiry_days: u32,
}

impl Default for EarnPolicy {
    fn default() -> Self {
        Self {
            min_credit: 1,
            max_credit: 1_000_000,
            max_balance: 10_000_000,
            default_expiry_days: 365,
            min_expiry_days: 1,
            max_expiry_days: 1_825,
        }
    }
}

impl EarnPolicy {
    pub fn check_amount(&self, amount: u64) -> Result<(), PolicyViolation> {
        if amount < self.min_credit {
            return Err(PolicyViolation::AmountBelowMinimum {
                amount,
                minimum: self.min_credit,
            });
        }
        if amount > self.max_credit {
            return Err(PolicyViolation::AmountAboveMaximum {
                amount,
                maximum: self.max_credit,
            });
        }
        Ok(())
    }

    pub fn check_balance(&self, balance: u64, amount: u64) -> Result<(), PolicyViolation> {
        if balance.saturating_add(amount) > self.max_balance {
            return Err(PolicyViolation::BalanceLimitExceeded {
                balance,
                amount,
                limit: self.max_balance,
            });
        }
        Ok(())
    }

    /// Resolve an expiry policy to a concrete instant, checking it is in range.
    pub fn resolve_expiry(
        &self,
        policy: ExpiryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, PolicyViolation> {
        let at = match policy {
            ExpiryPolicy::Never => return Ok(None),
            ExpiryPolicy::Default => now + Duration::days(self.default_expiry_days as i64),
            ExpiryPolicy::Days(days) => {
                self.check_days(days as i64)?;
                now + Duration::days(days as i64)
            }
            ExpiryPolicy::At(at) => {
                // Whole days, rounded up, so "tomorrow at noon" counts as one.
                let secs = (at - now).num_seconds();
                let days = if secs <= 0 { 0 } else { (secs + 86_399) / 86_400 };
                self.check_days(days)?;
                at
            }
        };
        Ok(Some(at))
    }

    /// Expiry for points restored into a fresh lot because their original lot lapsed.
    pub fn restored_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(self.default_expiry_days as i64)
    }

    fn check_days(&self, days: i64) -> Result<(), PolicyViolation> {
        if days < self.min_expiry_days as i64 || days > self.max_expiry_days as i64 {
            return Err(PolicyViolation::ExpiryOutOfRange {
                days,
                min: self.min_expiry_days,
                max: self.max_expiry_days,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_bounds() {
        let policy = EarnPolicy {
            min_credit: 10,
            max_credit: 100,
            ..Default::default()
        };
        assert!(policy.check_amount(10).is_ok());
        assert!(policy.check_amount(100).is_ok());
        assert!(matches!(
            policy.check_amount(9),
            Err(PolicyViolation::AmountBelowMinimum { .. })
        ));
        assert!(matches!(
            policy.check_amount(101),
            Err(PolicyViolation::AmountAboveMaximum { .. })
        ));
    }

    #[test]
    fn balance_limit() {
        let policy = EarnPolicy {
            max_balance: 1_000,
            ..Default::default()
        };
        assert!(policy.check_balance(900, 100).is_ok());
        assert!(policy.check_balance(901, 100).is_err());
    }

    #[test]
    fn expiry_resolution() {
        let policy = EarnPolicy::default();
        let now = Utc::now();

        assert_eq!(policy.resolve_expiry(ExpiryPolicy::Never, now), Ok(None));
        assert_eq!(
            policy.resolve_expiry(ExpiryPolicy::Default, now),
            Ok(Some(now + Duration::days(365)))
        );
        assert_eq!(
            policy.resolve_expiry(ExpiryPolicy::Days(30), now),
            Ok(Some(now + Duration::days(30)))
        );
        assert!(policy.resolve_expiry(ExpiryPolicy::Days(0), now).is_err());
        assert!(policy.resolve_expiry(ExpiryPolicy::Days(5_000), now).is_err());

        let noon_tomorrow = now + Duration::hours(20);
        assert_eq!(
            policy.resolve_expiry(ExpiryPolicy::At(noon_tomorrow), now),
            Ok(Some(noon_tomorrow))
        );
        assert!(
            policy
                .resolve_expiry(ExpiryPolicy::At(now - Duration::days(1)), now)
                .is_err()
        );
    }
}
