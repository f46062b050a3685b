//! Property tests for the business-day calendar.
//!
//! 1. `resolve` rejects exactly the weekends and listed holidays, and returns
//!    every other date unchanged
//! 2. `previous_business_day` / `next_business_day` land on business days and
//!    skip nothing in between
//! 3. `count_business_days` is order-insensitive and agrees with `is_business_day`

use chrono::{Datelike, Duration, NaiveDate, Weekday};
use optreport_core::{BusinessDayCalendar, CalendarError, NonTradingReason};
use proptest::prelude::*;

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    // 2000-01-01 .. 2039-12-31
    (0i64..14_610).prop_map(|offset| {
        NaiveDate::from_ymd_opt(2000, 1, 1).unwrap() + Duration::days(offset)
    })
}

fn arb_overrides() -> impl Strategy<Value = Vec<NaiveDate>> {
    prop::collection::vec(arb_date(), 0..20)
}

// ── 1. Resolve ───────────────────────────────────────────────────────

proptest! {
    #[test]
    fn resolve_accepts_exactly_business_days(date in arb_date(), overrides in arb_overrides()) {
        let cal = BusinessDayCalendar::new(overrides.clone());
        let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);

        match cal.resolve(date) {
            Ok(td) => {
                prop_assert_eq!(td.date(), date);
                prop_assert!(!weekend);
                prop_assert!(!overrides.contains(&date));
            }
            Err(CalendarError::InvalidTradingDay { date: rejected, reason }) => {
                prop_assert_eq!(rejected, date);
                match reason {
                    NonTradingReason::Weekend => prop_assert!(weekend),
                    NonTradingReason::MarketHoliday => prop_assert!(overrides.contains(&date)),
                    NonTradingReason::NationalHoliday => prop_assert!(!weekend),
                }
            }
            Err(other) => prop_assert!(false, "unexpected error {other:?}"),
        }
    }

    #[test]
    fn weekends_never_resolve(date in arb_date()) {
        let cal = BusinessDayCalendar::default();
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            prop_assert!(cal.resolve(date).is_err());
        }
    }
}

// ── 2. Walks ─────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn previous_business_day_is_the_closest_one_before(date in arb_date()) {
        let cal = BusinessDayCalendar::default();
        let found = cal.previous_business_day(date).unwrap().date();

        prop_assert!(found < date);
        prop_assert!(cal.is_business_day(found));
        let mut gap = found.succ_opt().unwrap();
        while gap < date {
            prop_assert!(!cal.is_business_day(gap), "{gap} was skipped");
            gap = gap.succ_opt().unwrap();
        }
    }

    #[test]
    fn next_business_day_is_the_closest_one_after(date in arb_date()) {
        let cal = BusinessDayCalendar::default();
        let found = cal.next_business_day(date).unwrap().date();

        prop_assert!(found > date);
        prop_assert!(cal.is_business_day(found));
        prop_assert_eq!(cal.count_business_days(date.succ_opt().unwrap(), found), 1);
    }
}

// ── 3. Counting ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn count_is_symmetric_and_consistent(a in arb_date(), span in 0i64..120) {
        let cal = BusinessDayCalendar::default();
        let b = a + Duration::days(span);
        let forward = cal.count_business_days(a, b);

        prop_assert_eq!(forward, cal.count_business_days(b, a));
        let manual = a
            .iter_days()
            .take(span as usize + 1)
            .filter(|d| cal.is_business_day(*d))
            .count();
        prop_assert_eq!(forward, manual);
        prop_assert!(forward <= span as usize + 1);
    }
}
