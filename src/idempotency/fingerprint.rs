//! Deterministic fingerprints for logical actions

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::common::types::ActionKind;

/// Computes idempotency keys, optionally folding in a time bucket
///
/// Without a bucket two identical actions collide for the whole retention
/// window; with one they only collide within the same bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter {
    bucket: Option<Duration>,
}

impl Fingerprinter {
    pub fn new(bucket: Option<Duration>) -> Self {
        Self {
            bucket: bucket.filter(|b| b.as_secs() > 0),
        }
    }

    pub fn bucket(&self) -> Option<Duration> {
        self.bucket
    }

    pub fn key(
        &self,
        domain: &str,
        action: &ActionKind,
        target: Option<&str>,
        amount: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> String {
        let mut canonical = canonical_form(domain, action, target, amount);
        if let Some(bucket) = self.bucket {
            let index = now.timestamp().div_euclid(bucket.as_secs() as i64);
            canonical.push_str(&format!("|bucket:{}", index));
        }
        digest(&canonical)
    }
}

/// Unbucketed fingerprint of an action
pub fn fingerprint(
    domain: &str,
    action: &ActionKind,
    target: Option<&str>,
    amount: Option<Decimal>,
) -> String {
    digest(&canonical_form(domain, action, target, amount))
}

// `1.50` and `1.5` must hash the same
fn canonical_form(
    domain: &str,
    action: &ActionKind,
    target: Option<&str>,
    amount: Option<Decimal>,
) -> String {
    format!(
        "{}|{}|{}|{}",
        domain.trim(),
        action.as_str().to_lowercase(),
        target.map(str::trim).unwrap_or(""),
        amount.map(|a| a.normalize().to_string()).unwrap_or_default()
    )
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("spot", &ActionKind::Open, Some("BTC"), Some(dec!(100)));
        let b = fingerprint("spot", &ActionKind::Open, Some("BTC"), Some(dec!(100.00)));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_distinguishes_inputs() {
        let base = fingerprint("spot", &ActionKind::Open, Some("BTC"), Some(dec!(100)));
        assert_ne!(base, fingerprint("perps", &ActionKind::Open, Some("BTC"), Some(dec!(100))));
        assert_ne!(base, fingerprint("spot", &ActionKind::Close, Some("BTC"), Some(dec!(100))));
        assert_ne!(base, fingerprint("spot", &ActionKind::Open, Some("ETH"), Some(dec!(100))));
        assert_ne!(base, fingerprint("spot", &ActionKind::Open, Some("BTC"), Some(dec!(101))));
        assert_ne!(base, fingerprint("spot", &ActionKind::Open, None, Some(dec!(100))));
    }

    #[test]
    fn test_custom_action_case_is_ignored() {
        let upper = ActionKind::from("Rebalance");
        let lower = ActionKind::from("rebalance");
        assert_eq!(
            fingerprint("spot", &upper, Some("BTC"), Some(dec!(5))),
            fingerprint("spot", &lower, Some("BTC"), Some(dec!(5)))
        );
        // Built directly, bypassing the string conversion
        let raw = ActionKind::Other("REBALANCE".to_string());
        assert_eq!(
            fingerprint("spot", &raw, Some("BTC"), Some(dec!(5))),
            fingerprint("spot", &lower, Some("BTC"), Some(dec!(5)))
        );
    }

    #[test]
    fn test_bucketed_keys() {
        let hourly = Fingerprinter::new(Some(Duration::from_secs(3600)));
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 55, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();

        let key = |at| hourly.key("spot", &ActionKind::Open, Some("BTC"), Some(dec!(1)), at);
        assert_eq!(key(t0), key(t1));
        assert_ne!(key(t1), key(t2));

        let plain = Fingerprinter::default();
        assert_eq!(
            plain.key("spot", &ActionKind::Open, Some("BTC"), Some(dec!(1)), t0),
            fingerprint("spot", &ActionKind::Open, Some("BTC"), Some(dec!(1)))
        );
    }
}
