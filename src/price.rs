// ─────────────────────────────────────────────────────────────────────────────
// price.rs — Limit price policies
// ─────────────────────────────────────────────────────────────────────────────
use std::fmt;
use std::sync::Arc;

use crate::errors::TargetPosError;
use crate::model::{Direction, Quote};

/// How a task prices its limit orders.
///
/// `Active` crosses the spread (BUY at ask1, SELL at bid1), `Passive` joins
/// the queue (BUY at bid1, SELL at ask1). Both fall back through the opposing
/// touch, the last price and the pre-close when a touch is missing. `Custom`
/// delegates to a caller function of the direction; returning `None` is a
/// fatal pricing error.
#[derive(Clone)]
pub enum PricePolicy {
    Active,
    Passive,
    Custom(Arc<dyn Fn(Direction) -> Option<f64> + Send + Sync>),
}

impl PricePolicy {
    /// Parses the string form accepted by the constructor.
    pub fn parse(mode: &str) -> Result<Self, TargetPosError> {
        match mode {
            "ACTIVE" => Ok(PricePolicy::Active),
            "PASSIVE" => Ok(PricePolicy::Passive),
            other => Err(TargetPosError::InvalidArgument(format!(
                "price mode must be ACTIVE or PASSIVE, got {other:?}"
            ))),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(Direction) -> Option<f64> + Send + Sync + 'static,
    {
        PricePolicy::Custom(Arc::new(f))
    }

    /// Best limit price for `direction` under this policy, or `None` when no
    /// usable price exists yet.
    pub fn resolve(&self, quote: &Quote, direction: Direction) -> Option<f64> {
        let active = match self {
            PricePolicy::Custom(f) => return f(direction).filter(|p| p.is_finite()),
            PricePolicy::Active => true,
            PricePolicy::Passive => false,
        };
        // Aggressive buy looks at the ask first; every reversal below flips
        // the preference.
        let (mut first, mut second) = (quote.ask_price1, quote.bid_price1);
        if direction == Direction::Sell {
            std::mem::swap(&mut first, &mut second);
        }
        if !active {
            std::mem::swap(&mut first, &mut second);
        }
        first
            .or(second)
            .or(quote.last_price)
            .or(quote.pre_close)
    }

    /// Same parameters on a second construction must compare equal; custom
    /// functions compare by identity.
    pub fn same_as(&self, other: &PricePolicy) -> bool {
        match (self, other) {
            (PricePolicy::Active, PricePolicy::Active) => true,
            (PricePolicy::Passive, PricePolicy::Passive) => true,
            (PricePolicy::Custom(a), PricePolicy::Custom(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for PricePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for PricePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PricePolicy::Active => write!(f, "ACTIVE"),
            PricePolicy::Passive => write!(f, "PASSIVE"),
            PricePolicy::Custom(_) => write!(f, "<custom>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn quote(ask: Option<f64>, bid: Option<f64>, last: Option<f64>, pre: Option<f64>) -> Quote {
        let mut q = Quote::new(
            "DCE.m2405",
            NaiveDate::from_ymd_opt(2024, 3, 14)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
        );
        q.ask_price1 = ask;
        q.bid_price1 = bid;
        q.last_price = last;
        q.pre_close = pre;
        q
    }

    #[test]
    fn test_active_crosses_the_spread() {
        let q = quote(Some(101.0), Some(100.0), Some(100.5), Some(99.0));
        assert_eq!(PricePolicy::Active.resolve(&q, Direction::Buy), Some(101.0));
        assert_eq!(PricePolicy::Active.resolve(&q, Direction::Sell), Some(100.0));
    }

    #[test]
    fn test_passive_joins_the_queue() {
        let q = quote(Some(101.0), Some(100.0), Some(100.5), Some(99.0));
        assert_eq!(PricePolicy::Passive.resolve(&q, Direction::Buy), Some(100.0));
        assert_eq!(PricePolicy::Passive.resolve(&q, Direction::Sell), Some(101.0));
    }

    #[test]
    fn test_fallback_chain() {
        let q = quote(None, Some(100.0), Some(100.5), Some(99.0));
        // missing ask: active buy falls to the bid
        assert_eq!(PricePolicy::Active.resolve(&q, Direction::Buy), Some(100.0));
        let q = quote(None, None, Some(100.5), Some(99.0));
        assert_eq!(PricePolicy::Active.resolve(&q, Direction::Buy), Some(100.5));
        let q = quote(None, None, None, Some(99.0));
        assert_eq!(PricePolicy::Passive.resolve(&q, Direction::Sell), Some(99.0));
        let q = quote(None, None, None, None);
        assert_eq!(PricePolicy::Active.resolve(&q, Direction::Buy), None);
    }

    #[test]
    fn test_custom_function_and_identity() {
        let policy = PricePolicy::custom(|dir| match dir {
            Direction::Buy => Some(123.0),
            Direction::Sell => None,
        });
        let q = quote(Some(1.0), Some(1.0), Some(1.0), Some(1.0));
        assert_eq!(policy.resolve(&q, Direction::Buy), Some(123.0));
        assert_eq!(policy.resolve(&q, Direction::Sell), None);

        let other = policy.clone();
        assert!(policy.same_as(&other));
        let unrelated = PricePolicy::custom(|_| Some(1.0));
        assert!(!policy.same_as(&unrelated));
        assert!(!policy.same_as(&PricePolicy::Active));
    }

    #[test]
    fn test_custom_nan_is_unusable() {
        let policy = PricePolicy::custom(|_| Some(f64::NAN));
        let q = quote(None, None, None, None);
        assert_eq!(policy.resolve(&q, Direction::Buy), None);
    }

    #[test]
    fn test_parse_mode() {
        assert!(PricePolicy::parse("ACTIVE").is_ok());
        assert!(PricePolicy::parse("PASSIVE").is_ok());
        assert!(PricePolicy::parse("aggressive").is_err());
    }
}
