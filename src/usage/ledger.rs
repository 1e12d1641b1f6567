//! Weekly token accounting.
//!
//! Accounting weeks start on Sunday (UTC). The ledger keeps running totals for
//! the open week and closes them into an immutable [`WeeklyUsageRecord`] once
//! a later week has begun. The check runs on every recorded exchange and on
//! explicit [`UsageLedger::roll_over`] calls, so a week with no traffic is
//! still closed out by the next request or tick.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;

/// Running totals for the open accounting week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Sunday on which the open week started.
    pub week_start: NaiveDate,
}

impl UsageTotals {
    pub fn empty(week_start: NaiveDate) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            week_start,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    fn is_zero(&self) -> bool {
        self.total_tokens() == 0
    }
}

/// A closed accounting week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyUsageRecord {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

impl WeeklyUsageRecord {
    /// The total saturates at `u64::MAX`. Callers taking counts from outside
    /// the process check [`WeeklyUsageRecord::checked`] instead.
    pub fn new(start_date: NaiveDate, input_tokens: u64, output_tokens: u64, unit_cost: f64) -> Self {
        let total_tokens = input_tokens.saturating_add(output_tokens);
        Self {
            start_date,
            end_date: start_date + Duration::days(6),
            input_tokens,
            output_tokens,
            total_tokens,
            total_cost: total_tokens as f64 * unit_cost,
        }
    }

    /// Like [`WeeklyUsageRecord::new`], but `None` when the total does not fit in a `u64`.
    pub fn checked(
        start_date: NaiveDate,
        input_tokens: u64,
        output_tokens: u64,
        unit_cost: f64,
    ) -> Option<Self> {
        input_tokens.checked_add(output_tokens)?;
        Some(Self::new(start_date, input_tokens, output_tokens, unit_cost))
    }
}

/// The most recent Sunday at or before `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_sunday() as i64)
}

/// Process-wide token ledger. All updates go through one mutex, so two
/// exchanges finishing together never lose an update.
#[derive(Debug)]
pub struct UsageLedger {
    totals: Mutex<UsageTotals>,
    unit_cost: f64,
}

impl UsageLedger {
    /// Empty ledger whose open week contains `now`.
    pub fn new(unit_cost: f64, now: DateTime<Utc>) -> Self {
        Self::with_totals(UsageTotals::empty(week_start(now.date_naive())), unit_cost)
    }

    pub fn with_totals(totals: UsageTotals, unit_cost: f64) -> Self {
        Self {
            totals: Mutex::new(totals),
            unit_cost,
        }
    }

    pub fn unit_cost(&self) -> f64 {
        self.unit_cost
    }

    /// Cost of `tokens` at the ledger's unit cost.
    pub fn cost_of(&self, tokens: u64) -> f64 {
        tokens as f64 * self.unit_cost
    }

    pub fn snapshot(&self) -> UsageTotals {
        *self.lock()
    }

    /// Add one exchange's counts to the open week. If `now` lies in a later
    /// week than the open one, the accumulated totals (this exchange
    /// included) are closed into a record and the counters restart at zero.
    pub fn record_exchange(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        now: DateTime<Utc>,
    ) -> Option<WeeklyUsageRecord> {
        let mut totals = self.lock();
        totals.input_tokens = totals.input_tokens.saturating_add(input_tokens);
        totals.output_tokens = totals.output_tokens.saturating_add(output_tokens);
        self.close_if_due(&mut totals, now)
    }

    /// Close the open week if `now` is past it, without recording anything.
    /// A week with no usage is skipped silently.
    pub fn roll_over(&self, now: DateTime<Utc>) -> Option<WeeklyUsageRecord> {
        let mut totals = self.lock();
        self.close_if_due(&mut totals, now)
    }

    fn close_if_due(&self, totals: &mut UsageTotals, now: DateTime<Utc>) -> Option<WeeklyUsageRecord> {
        let current_week = week_start(now.date_naive());
        if current_week <= totals.week_start {
            return None;
        }

        let closed = std::mem::replace(totals, UsageTotals::empty(current_week));
        if closed.is_zero() {
            return None;
        }

        let record = WeeklyUsageRecord::new(
            closed.week_start,
            closed.input_tokens,
            closed.output_tokens,
            self.unit_cost,
        );
        info!(
            week_start = %record.start_date,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            total_cost = record.total_cost,
            "Closed accounting week"
        );
        Some(record)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UsageTotals> {
        // The guarded value is plain counters, always consistent between statements.
        self.totals.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_week_start_is_previous_or_same_sunday() {
        // 2024-10-13 is a Sunday
        assert_eq!(week_start(date(2024, 10, 13)), date(2024, 10, 13));
        assert_eq!(week_start(date(2024, 10, 14)), date(2024, 10, 13));
        assert_eq!(week_start(date(2024, 10, 19)), date(2024, 10, 13));
        assert_eq!(week_start(date(2024, 10, 12)), date(2024, 10, 6));
    }

    #[test]
    fn test_record_within_week_accumulates() {
        let ledger = UsageLedger::new(0.000003, at(2024, 10, 14, 9));
        assert!(ledger.record_exchange(10, 5, at(2024, 10, 14, 10)).is_none());
        assert!(ledger.record_exchange(7, 3, at(2024, 10, 17, 22)).is_none());

        let totals = ledger.snapshot();
        assert_eq!((totals.input_tokens, totals.output_tokens), (17, 8));
        assert_eq!(totals.week_start, date(2024, 10, 13));
    }

    #[test]
    fn test_sunday_rollover_includes_current_exchange() {
        let ledger = UsageLedger::with_totals(
            UsageTotals {
                input_tokens: 100,
                output_tokens: 50,
                week_start: date(2024, 10, 6),
            },
            0.000003,
        );

        let record = ledger.record_exchange(10, 5, at(2024, 10, 13, 12)).unwrap();

        assert_eq!(record.input_tokens, 110);
        assert_eq!(record.output_tokens, 55);
        assert_eq!(record.total_tokens, 165);
        assert_eq!(record.start_date, date(2024, 10, 6));
        assert_eq!(record.end_date, date(2024, 10, 12));
        assert!((record.total_cost - 165.0 * 0.000003).abs() < 1e-12);

        let totals = ledger.snapshot();
        assert_eq!((totals.input_tokens, totals.output_tokens), (0, 0));
        assert_eq!(totals.week_start, date(2024, 10, 13));
    }

    #[test]
    fn test_second_exchange_same_sunday_does_not_roll_again() {
        let ledger = UsageLedger::new(1.0, at(2024, 10, 9, 0));
        ledger.record_exchange(1, 1, at(2024, 10, 9, 1));

        assert!(ledger.record_exchange(2, 2, at(2024, 10, 13, 8)).is_some());
        assert!(ledger.record_exchange(3, 3, at(2024, 10, 13, 20)).is_none());
        assert_eq!(ledger.snapshot().total_tokens(), 6);
    }

    #[test]
    fn test_rollover_record_sums_everything_since_prior_boundary() {
        let ledger = UsageLedger::new(0.5, at(2024, 10, 7, 0));
        let recorded = [(10, 1), (20, 2), (30, 3)];
        for (i, (input, output)) in recorded.iter().enumerate() {
            ledger.record_exchange(*input, *output, at(2024, 10, 8 + i as u32, 12));
        }

        let record = ledger.record_exchange(4, 4, at(2024, 10, 15, 12)).unwrap();
        assert_eq!(record.total_tokens, 10 + 1 + 20 + 2 + 30 + 3 + 8);
        assert!((record.total_cost - record.total_tokens as f64 * 0.5).abs() < 1e-9);
        assert_eq!(ledger.snapshot().total_tokens(), 0);
    }

    #[test]
    fn test_quiet_week_closed_on_next_weekday_request() {
        let ledger = UsageLedger::new(1.0, at(2024, 9, 30, 0));
        ledger.record_exchange(5, 5, at(2024, 10, 1, 0));

        // No traffic on 2024-10-06 (Sunday); the next request is a Wednesday.
        let record = ledger.record_exchange(1, 0, at(2024, 10, 9, 0)).unwrap();
        assert_eq!(record.start_date, date(2024, 9, 29));
        assert_eq!(record.total_tokens, 11);
        assert_eq!(ledger.snapshot().week_start, date(2024, 10, 6));
    }

    #[test]
    fn test_order_of_exchanges_does_not_matter_within_week() {
        let now = at(2024, 10, 15, 0);
        let a = UsageLedger::new(1.0, now);
        a.record_exchange(3, 4, now);
        a.record_exchange(11, 13, now);

        let b = UsageLedger::new(1.0, now);
        b.record_exchange(11, 13, now);
        b.record_exchange(3, 4, now);

        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_roll_over_without_usage_advances_silently() {
        let ledger = UsageLedger::new(1.0, at(2024, 10, 7, 0));
        assert!(ledger.roll_over(at(2024, 10, 21, 0)).is_none());
        assert_eq!(ledger.snapshot().week_start, date(2024, 10, 20));
    }

    #[test]
    fn test_roll_over_closes_pending_usage() {
        let ledger = UsageLedger::new(1.0, at(2024, 10, 7, 0));
        ledger.record_exchange(2, 3, at(2024, 10, 8, 0));

        assert!(ledger.roll_over(at(2024, 10, 12, 23)).is_none());
        let record = ledger.roll_over(at(2024, 10, 13, 0)).unwrap();
        assert_eq!((record.input_tokens, record.output_tokens), (2, 3));
        assert_eq!(ledger.snapshot().total_tokens(), 0);
    }

    #[test]
    fn test_clock_going_backwards_never_rolls() {
        let ledger = UsageLedger::new(1.0, at(2024, 10, 14, 0));
        assert!(ledger.record_exchange(1, 1, at(2024, 10, 1, 0)).is_none());
        assert_eq!(ledger.snapshot().week_start, date(2024, 10, 13));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let now = at(2024, 10, 15, 0);
        let ledger = Arc::new(UsageLedger::new(1.0, now));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        ledger.record_exchange(2, 1, now);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let totals = ledger.snapshot();
        assert_eq!(totals.input_tokens, 16_000);
        assert_eq!(totals.output_tokens, 8_000);
    }

    #[test]
    fn test_huge_counts_saturate_instead_of_wrapping() {
        let now = at(2024, 10, 15, 0);
        let ledger = UsageLedger::new(1.0, now);
        ledger.record_exchange(u64::MAX - 1, u64::MAX, now);
        ledger.record_exchange(5, 5, now);

        let totals = ledger.snapshot();
        assert_eq!(totals.input_tokens, u64::MAX);
        assert_eq!(totals.output_tokens, u64::MAX);
        assert_eq!(totals.total_tokens(), u64::MAX);

        let record = WeeklyUsageRecord::new(date(2024, 10, 6), u64::MAX, 1, 1.0);
        assert_eq!(record.total_tokens, u64::MAX);
    }

    #[test]
    fn test_checked_record_rejects_overflowing_total() {
        assert!(WeeklyUsageRecord::checked(date(2024, 10, 6), u64::MAX, 1, 1.0).is_none());

        let record = WeeklyUsageRecord::checked(date(2024, 10, 6), u64::MAX - 1, 1, 0.0).unwrap();
        assert_eq!(record.total_tokens, u64::MAX);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let record = WeeklyUsageRecord::new(date(2024, 10, 6), 1, 2, 1.0);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["startDate"], "2024-10-06");
        assert_eq!(value["endDate"], "2024-10-12");
        assert_eq!(value["totalTokens"], 3);
    }

    fn exchanges() -> impl Strategy<Value = Vec<(u64, u64)>> {
        prop::collection::vec((0u64..1_000_000, 0u64..1_000_000), 0..32)
    }

    proptest! {
        #[test]
        fn prop_totals_independent_of_order(
            (original, shuffled) in exchanges()
                .prop_flat_map(|v| (Just(v.clone()), Just(v).prop_shuffle()))
        ) {
            let now = at(2024, 10, 15, 0);
            let a = UsageLedger::new(1.0, now);
            let b = UsageLedger::new(1.0, now);
            for (input, output) in &original {
                a.record_exchange(*input, *output, now);
            }
            for (input, output) in &shuffled {
                b.record_exchange(*input, *output, now);
            }
            prop_assert_eq!(a.snapshot(), b.snapshot());
        }

        #[test]
        fn prop_every_token_lands_in_one_week(
            steps in prop::collection::vec((0u64..1000, 0u64..1000, 0i64..72), 1..40)
        ) {
            let mut now = at(2024, 10, 1, 0);
            let ledger = UsageLedger::new(1.0, now);
            let mut expected = 0u64;
            let mut closed = 0u64;
            let mut last_closed: Option<NaiveDate> = None;

            for (input, output, hours) in steps {
                now += Duration::hours(hours);
                expected += input + output;
                if let Some(record) = ledger.record_exchange(input, output, now) {
                    prop_assert_eq!(record.start_date.weekday(), chrono::Weekday::Sun);
                    prop_assert!(record.start_date < week_start(now.date_naive()));
                    if let Some(prev) = last_closed {
                        prop_assert!(record.start_date > prev);
                    }
                    last_closed = Some(record.start_date);
                    closed += record.total_tokens;
                }
            }

            let totals = ledger.snapshot();
            prop_assert_eq!(closed + totals.total_tokens(), expected);
            prop_assert_eq!(totals.week_start, week_start(now.date_naive()));
        }
    }
}
