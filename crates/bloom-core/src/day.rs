//! Day arithmetic. Bloom blocks are built per UTC calendar day.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

/// The UTC day `ts` falls on.
pub fn day_of(ts: DateTime<Utc>) -> NaiveDate {
    ts.date_naive()
}

/// Midnight (UTC) at the start of `day`.
pub fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// Inclusive bounds of `day`: from midnight up to the last nanosecond before the next midnight.
pub fn day_interval(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = day_start(day);
    let end = start + Duration::days(1) - Duration::nanoseconds(1);
    (start, end)
}

/// Days covered by the half-open range `[from, through)`.
pub fn days_in_range(from: NaiveDate, through: NaiveDate) -> Vec<NaiveDate> {
    from.iter_days().take_while(|day| *day < through).collect()
}

/// The day after the one `ts` falls on, i.e. the exclusive end of a range ending at `ts`.
///
/// Saturates at [`NaiveDate::MAX`].
pub fn day_after(ts: DateTime<Utc>) -> NaiveDate {
    let day = day_of(ts);
    day.succ_opt().unwrap_or(day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn interval_spans_whole_day() {
        let (start, end) = day_interval(date(5));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap());
        assert_eq!(day_of(end), date(5));
        assert_eq!(day_of(end + Duration::nanoseconds(1)), date(6));
    }

    #[test]
    fn range_is_half_open() {
        assert!(days_in_range(date(1), date(1)).is_empty());
        assert_eq!(days_in_range(date(1), date(2)), vec![date(1)]);
        assert_eq!(days_in_range(date(1), date(3)), vec![date(1), date(2)]);
        assert!(days_in_range(date(3), date(1)).is_empty());
    }

    #[test]
    fn day_after_is_exclusive_end() {
        let mid_day = Utc.with_ymd_and_hms(2024, 1, 2, 6, 0, 0).unwrap();
        assert_eq!(day_after(mid_day), date(3));
        assert_eq!(days_in_range(date(1), day_after(mid_day)), vec![date(1), date(2)]);

        let last = NaiveDate::MAX.and_time(NaiveTime::MIN).and_utc();
        assert_eq!(day_after(last), NaiveDate::MAX);
    }
}
