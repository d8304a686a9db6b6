// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The growth model: a deposit doubles every `period_days`, compounding
//! continuously within a period via fractional-exponent interpolation.
//! Everything here is pure; the pipelines recompute from these functions
//! under a row lock and never trust the cached `ledger_balance`.

use chrono::{DateTime, Utc};

const SECS_PER_DAY: f64 = 86_400.0;

/// The timestamp the growth curve is anchored to: every settled withdrawal
/// resets the compounding clock, so `last_withdrawal_at` supersedes
/// `principal_since` once set.
pub fn growth_anchor(
    principal_since: Option<DateTime<Utc>>,
    last_withdrawal_at: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    last_withdrawal_at.or(principal_since)
}

/// Current balance in smallest units.
///
/// `elapsed < 0` (clock skew) floors to the principal; zero principal yields
/// zero regardless of elapsed time. The result is floored to an integer unit
/// so the engine never disburses more than has accrued.
pub fn balance(principal: u64, anchor: DateTime<Utc>, now: DateTime<Utc>, period_days: f64) -> u64 {
    if principal == 0 {
        return 0;
    }

    let elapsed_days =
        ((now - anchor).num_milliseconds() as f64 / 1000.0 / SECS_PER_DAY).max(0.0);
    let full_periods = (elapsed_days / period_days).floor();
    let remainder = elapsed_days - full_periods * period_days;

    let factor = 2f64.powf(full_periods) * 2f64.powf(remainder / period_days);
    // Float-to-int casts saturate, which caps runaway balances at u64::MAX
    // instead of wrapping.
    (principal as f64 * factor).floor() as u64
}

/// The amount eligible for withdrawal.
pub fn profit(principal: u64, balance: u64) -> u64 {
    balance.saturating_sub(principal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const PERIOD: f64 = 10.0;
    const UNIT: u64 = 1_000_000_000;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_balance_equals_principal_at_anchor() {
        assert_eq!(balance(UNIT, t0(), t0(), PERIOD), UNIT);
    }

    #[test]
    fn test_balance_never_below_principal() {
        for days in [0, 1, 5, 9, 10, 15, 20, 100] {
            let now = t0() + Duration::days(days);
            assert!(
                balance(UNIT, t0(), now, PERIOD) >= UNIT,
                "balance dipped below principal at {} days",
                days
            );
        }
    }

    #[test]
    fn test_clock_skew_floors_to_principal() {
        let now = t0() - Duration::hours(3);
        assert_eq!(balance(UNIT, t0(), now, PERIOD), UNIT);
    }

    #[test]
    fn test_zero_principal_yields_zero() {
        let now = t0() + Duration::days(365);
        assert_eq!(balance(0, t0(), now, PERIOD), 0);
    }

    #[test]
    fn test_doubling_law() {
        for principal in [1u64, 17, UNIT, 123_456_789_012] {
            let now = t0() + Duration::days(10);
            assert_eq!(balance(principal, t0(), now, PERIOD), principal * 2);
        }
    }

    #[test]
    fn test_two_full_periods_quadruple() {
        let now = t0() + Duration::days(20);
        assert_eq!(balance(UNIT, t0(), now, PERIOD), UNIT * 4);
    }

    #[test]
    fn test_monotonically_non_decreasing() {
        let mut prev = 0u64;
        for hours in 0..=(24 * 30) {
            let now = t0() + Duration::hours(hours);
            let b = balance(UNIT, t0(), now, PERIOD);
            assert!(b >= prev, "balance decreased at hour {}", hours);
            prev = b;
        }
    }

    #[test]
    fn test_intra_period_interpolation_is_continuous() {
        // Halfway through a period the factor is 2^0.5, not a step.
        let now = t0() + Duration::days(5);
        let b = balance(UNIT, t0(), now, PERIOD);
        let expected = (UNIT as f64 * 2f64.sqrt()).floor() as u64;
        assert_eq!(b, expected);
        assert!(b > UNIT && b < 2 * UNIT);
    }

    #[test]
    fn test_profit_is_balance_minus_principal() {
        let now = t0() + Duration::days(10);
        let b = balance(UNIT, t0(), now, PERIOD);
        assert_eq!(profit(UNIT, b), UNIT);
        // Saturates rather than underflowing if the cache is ever ahead.
        assert_eq!(profit(UNIT, UNIT / 2), 0);
    }

    #[test]
    fn test_anchor_prefers_last_withdrawal() {
        let since = Some(t0());
        let withdrawal = Some(t0() + Duration::days(7));
        assert_eq!(growth_anchor(since, withdrawal), withdrawal);
        assert_eq!(growth_anchor(since, None), since);
        assert_eq!(growth_anchor(None, None), None);
    }
}
