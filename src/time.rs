//! Day-granularity interval helpers and check-in time parsing.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};

/// Check-in time used when a submitted time cannot be understood.
pub const DEFAULT_CHECK_IN_TIME: &str = "14:00";

/// Half-open overlap: `[a_start, a_end)` against `[b_start, b_end)`.
///
/// The departing stay does not occupy its check-out day, so a booking ending
/// on the 15th and one starting on the 15th do not overlap.
pub fn intervals_overlap<T: PartialOrd>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && a_end > b_start
}

pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Last representable millisecond of `date` (23:59:59.999).
pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    start_of_day(date) + TimeDelta::days(1) - TimeDelta::milliseconds(1)
}

/// Whole days from `from` to `to`. Negative when `to` is earlier.
pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

/// Normalize a user-entered time to 24-hour `HH:MM`.
///
/// Accepts `14:30`, `9:05`, `14:30:00`, and 12-hour forms such as `2:30pm`,
/// `2:30 PM` or `2:30 p.m.`. Anything else yields `default`.
pub fn parse_flexible_time(raw: &str, default: &str) -> String {
    match try_parse_time(raw) {
        Some(t) => t.format("%H:%M").to_string(),
        None => default.to_string(),
    }
}

/// Strict form of [`parse_flexible_time`]: `None` when the input is not a time.
pub fn try_parse_time(raw: &str) -> Option<NaiveTime> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .flat_map(char::to_lowercase)
        .collect();
    if compact.is_empty() {
        return None;
    }

    let (clock, meridiem) = if let Some(rest) = compact.strip_suffix("am") {
        (rest, Some(false))
    } else if let Some(rest) = compact.strip_suffix("pm") {
        (rest, Some(true))
    } else {
        (compact.as_str(), None)
    };

    let mut parts = clock.split(':');
    let hour = parse_component(parts.next()?, 1, 2)?;
    let minute = parse_component(parts.next()?, 2, 2)?;
    let second = match parts.next() {
        Some(s) if meridiem.is_none() => parse_component(s, 2, 2)?,
        Some(_) => return None,
        None => 0,
    };
    if parts.next().is_some() || minute > 59 || second > 59 {
        return None;
    }

    let hour = match meridiem {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, false) => h,
                (h, true) => h + 12,
            }
        }
        None if hour > 23 => return None,
        None => hour,
    };

    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn parse_component(s: &str, min_len: usize, max_len: usize) -> Option<u32> {
    if s.len() < min_len || s.len() > max_len || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn overlap_is_half_open() {
        // 10..15 against 15..18: same-day turnover
        assert!(!intervals_overlap(d(2024, 1, 10), d(2024, 1, 15), d(2024, 1, 15), d(2024, 1, 18)));
        assert!(intervals_overlap(d(2024, 1, 10), d(2024, 1, 15), d(2024, 1, 14), d(2024, 1, 18)));
        assert!(intervals_overlap(d(2024, 1, 12), d(2024, 1, 13), d(2024, 1, 10), d(2024, 1, 15)));
        assert!(!intervals_overlap(d(2024, 1, 1), d(2024, 1, 10), d(2024, 1, 10), d(2024, 1, 11)));
    }

    #[test]
    fn day_boundaries() {
        let day = d(2024, 2, 29);
        assert_eq!(start_of_day(day).to_string(), "2024-02-29 00:00:00");
        assert_eq!(end_of_day(day).to_string(), "2024-02-29 23:59:59.999");
        assert_eq!(days_between(d(2024, 2, 28), d(2024, 3, 1)), 2);
        assert_eq!(days_between(d(2024, 3, 1), d(2024, 2, 28)), -2);
    }

    #[test]
    fn parses_24_hour() {
        assert_eq!(parse_flexible_time("14:30", DEFAULT_CHECK_IN_TIME), "14:30");
        assert_eq!(parse_flexible_time("9:05", DEFAULT_CHECK_IN_TIME), "09:05");
        assert_eq!(parse_flexible_time("00:00", DEFAULT_CHECK_IN_TIME), "00:00");
        assert_eq!(parse_flexible_time("15:45:10", DEFAULT_CHECK_IN_TIME), "15:45");
    }

    #[test]
    fn parses_12_hour() {
        assert_eq!(parse_flexible_time("2:30pm", DEFAULT_CHECK_IN_TIME), "14:30");
        assert_eq!(parse_flexible_time("2:30 PM", DEFAULT_CHECK_IN_TIME), "14:30");
        assert_eq!(parse_flexible_time("2:30 p.m.", DEFAULT_CHECK_IN_TIME), "14:30");
        assert_eq!(parse_flexible_time("12:15am", DEFAULT_CHECK_IN_TIME), "00:15");
        assert_eq!(parse_flexible_time("12:00pm", DEFAULT_CHECK_IN_TIME), "12:00");
        assert_eq!(parse_flexible_time("11:59 a.m.", DEFAULT_CHECK_IN_TIME), "11:59");
    }

    #[test]
    fn out_of_range_falls_back() {
        assert_eq!(parse_flexible_time("13:00am", DEFAULT_CHECK_IN_TIME), "14:00");
        assert_eq!(parse_flexible_time("0:30pm", DEFAULT_CHECK_IN_TIME), "14:00");
        assert_eq!(parse_flexible_time("10:60", DEFAULT_CHECK_IN_TIME), "14:00");
        assert_eq!(parse_flexible_time("24:00", DEFAULT_CHECK_IN_TIME), "14:00");
        assert_eq!(parse_flexible_time("noon", DEFAULT_CHECK_IN_TIME), "14:00");
        assert_eq!(parse_flexible_time("", "15:00"), "15:00");
    }
}
