//! Partial-period price adjustments.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

const SECONDS_PER_DAY: i64 = 86_400;

/// Whole days left in, and spanned by, a billing period at a given instant.
///
/// Both counts round partial days up; `remaining_days` never goes negative
/// and never exceeds `total_days`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProrationWindow {
    pub remaining_days: i64,
    pub total_days: i64,
}

fn ceil_days(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    let secs = (to - from).num_seconds().max(0);
    (secs + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

impl ProrationWindow {
    pub fn at(period_start: DateTime<Utc>, period_end: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let total_days = ceil_days(period_start, period_end);
        let remaining_days = ceil_days(now, period_end).min(total_days);
        Self {
            remaining_days,
            total_days,
        }
    }

    /// Share of `amount` covering the unused days, rounded to cents.
    pub fn unused_amount(&self, amount: Decimal) -> Decimal {
        if self.total_days <= 0 {
            return Decimal::ZERO;
        }
        (amount * Decimal::from(self.remaining_days) / Decimal::from(self.total_days)).round_dp(2)
    }

    /// Extra charge for moving from `old_price` to `new_price` for the rest
    /// of the period. Never negative.
    pub fn upgrade_charge(&self, old_price: Decimal, new_price: Decimal) -> Decimal {
        (self.unused_amount(new_price) - self.unused_amount(old_price)).max(Decimal::ZERO)
    }

    /// Charge for starting a fresh period at `new_price`, credited with the
    /// unused share of `old_price`. Never negative.
    pub fn cycle_switch_charge(&self, old_price: Decimal, new_price: Decimal) -> Decimal {
        (new_price - self.unused_amount(old_price)).max(Decimal::ZERO)
    }

    /// Refund owed when cancelling immediately at this point of the period.
    pub fn refund(&self, final_price: Decimal) -> Decimal {
        self.unused_amount(final_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn period() -> (DateTime<Utc>, DateTime<Utc>) {
        let start = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        (start, start + Duration::days(30))
    }

    #[test]
    fn refund_ten_days_into_thirty_day_period() {
        let (start, end) = period();
        let window = ProrationWindow::at(start, end, start + Duration::days(10));

        assert_eq!(window.remaining_days, 20);
        assert_eq!(window.total_days, 30);
        assert_eq!(window.refund(dec("900")), dec("600.00"));
    }

    #[test]
    fn partial_day_rounds_up() {
        let (start, end) = period();
        let window = ProrationWindow::at(start, end, start + Duration::days(10) + Duration::hours(1));
        assert_eq!(window.remaining_days, 20);
    }

    #[test]
    fn past_period_end_leaves_nothing() {
        let (start, end) = period();
        let window = ProrationWindow::at(start, end, end + Duration::days(3));

        assert_eq!(window.remaining_days, 0);
        assert_eq!(window.refund(dec("900")), Decimal::ZERO);
    }

    #[test]
    fn upgrade_charge_is_price_delta_over_remaining_days() {
        let (start, end) = period();
        let window = ProrationWindow::at(start, end, start + Duration::days(15));

        // 1998 * 15/30 - 999 * 15/30
        assert_eq!(window.upgrade_charge(dec("999"), dec("1998")), dec("499.50"));
    }

    #[test]
    fn upgrade_charge_floors_at_zero() {
        let (start, end) = period();
        let window = ProrationWindow::at(start, end, start + Duration::days(5));
        assert_eq!(window.upgrade_charge(dec("1998"), dec("999")), Decimal::ZERO);
    }

    #[test]
    fn cycle_switch_credits_unused_share_of_old_price() {
        let (start, end) = period();
        let window = ProrationWindow::at(start, end, start + Duration::days(10));

        // 21589.20 - 999 * 20/30
        assert_eq!(
            window.cycle_switch_charge(dec("999"), dec("21589.20")),
            dec("20923.20")
        );
        assert_eq!(window.cycle_switch_charge(dec("999"), dec("100")), Decimal::ZERO);
    }

    #[test]
    fn degenerate_period_prorates_to_zero() {
        let (start, _) = period();
        let window = ProrationWindow::at(start, start, start);
        assert_eq!(window.unused_amount(dec("100")), Decimal::ZERO);
    }
}
