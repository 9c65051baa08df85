use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

use super::models::BillingCycle;

// key: billing-calendar -> cycle arithmetic
/// Advances `from` by one billing cycle. The resulting day-of-month is the
/// anchor day, capped by the day `from` already landed on and by the length
/// of the target month. Once a short month clamps the day, later cycles keep
/// the clamped day: Jan 31 -> Feb 28 -> Mar 28.
pub fn next_cycle_end(anchor_day: u32, cycle: BillingCycle, from: DateTime<Utc>) -> DateTime<Utc> {
    let months = from.year() * 12 + from.month0() as i32 + cycle.months() as i32;
    let year = months.div_euclid(12);
    let month = months.rem_euclid(12) as u32 + 1;

    let day = anchor_day
        .min(from.day())
        .min(days_in_month(year, month))
        .max(1);

    NaiveDate::from_ymd_opt(year, month, day)
        .map(|date| Utc.from_utc_datetime(&date.and_time(from.time())))
        .unwrap_or(from)
}

/// Successive cycle ends starting at (and including) `first`.
pub fn cycle_schedule(
    anchor_day: u32,
    cycle: BillingCycle,
    first: DateTime<Utc>,
    count: u32,
) -> Vec<DateTime<Utc>> {
    let mut dates = Vec::with_capacity(count as usize);
    let mut cursor = first;
    for _ in 0..count {
        dates.push(cursor);
        cursor = next_cycle_end(anchor_day, cycle, cursor);
    }
    dates
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}
