//! Timestamp grammars shared by the format parsers.
//!
//! Logger exports disagree on almost everything here: compact
//! `YYYYMMDDTHHMMSS` tokens, day-first dotted European dates, underscore
//! separators, Unix epochs, and `24:00:00` as "end of day". Everything is
//! interpreted as UTC; the loggers report plant-local time without zone
//! information and downstream consumers expect it passed through unchanged.

use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

/// 2000-01-01T00:00:00Z. Epoch values below this are logger clock garbage.
pub const EPOCH_MIN: i64 = 946_684_800;
/// 2100-01-01T00:00:00Z. Epoch values above this are logger clock garbage.
pub const EPOCH_MAX: i64 = 4_102_444_800;

#[derive(thiserror::Error, Debug)]
#[error("invalid timestamp '{input}': {reason}")]
pub struct TimestampError {
    pub input: String,
    pub reason: String,
}

fn err(input: &str, reason: impl Into<String>) -> TimestampError {
    TimestampError {
        input: input.to_string(),
        reason: reason.into(),
    }
}

/// Parses the compact `YYYYMMDDTHHMMSS` form with explicit per-field range
/// validation. Rejects hour 24 outright; the midnight-rollover convention
/// only exists in formats with a separate time column.
pub fn parse_compact(s: &str) -> Result<OffsetDateTime, TimestampError> {
    let b = s.as_bytes();
    if b.len() != 15 || b[8] != b'T' {
        return Err(err(s, "expected YYYYMMDDTHHMMSS"));
    }
    if !b[..8].iter().chain(&b[9..]).all(u8::is_ascii_digit) {
        return Err(err(s, "non-digit in compact timestamp"));
    }

    let num = |range: std::ops::Range<usize>| -> u32 { s[range].parse().unwrap_or(0) };
    let year = num(0..4) as i32;
    let month = num(4..6);
    let day = num(6..8);
    let hour = num(9..11);
    let minute = num(11..13);
    let second = num(13..15);

    if !(1..=12).contains(&month) {
        return Err(err(s, format!("month {month} out of range")));
    }
    if !(1..=31).contains(&day) {
        return Err(err(s, format!("day {day} out of range")));
    }
    if hour > 23 {
        return Err(err(s, format!("hour {hour} out of range")));
    }
    if minute > 59 || second > 59 {
        return Err(err(s, "minute/second out of range"));
    }

    build(s, year, month as u8, day as u8, hour as u8, minute as u8, second as u8)
}

/// Parses any single-token timestamp a logger is known to emit: compact form
/// first, then `date time` with space or `T` separation, covering dash,
/// slash, dot and underscore date separators in day-first and year-first
/// order. Four-digit leading token means year-first; dotted dates are always
/// day-first (`01.10.2025` is October 1st, never January 10th).
pub fn parse_any(s: &str) -> Result<OffsetDateTime, TimestampError> {
    let s = s.trim();
    if let Ok(ts) = parse_compact(s) {
        return Ok(ts);
    }

    let (date_s, time_s) = s
        .split_once(' ')
        .or_else(|| s.split_once('T'))
        .ok_or_else(|| err(s, "missing time component"))?;

    let date = parse_date(date_s).map_err(|e| err(s, e.reason))?;
    let (h, m, sec) = parse_hms(time_s).map_err(|e| err(s, e.reason))?;
    if h > 23 {
        return Err(err(s, format!("hour {h} out of range")));
    }
    finish(s, date, h, m, sec)
}

/// Combines separate date and time fields. A time of exactly `24:00:00`
/// advances to `00:00:00` on the following calendar day, matching the
/// end-of-interval convention several European loggers use for midnight.
pub fn combine_date_time(date_s: &str, time_s: &str) -> Result<OffsetDateTime, TimestampError> {
    let joined = format!("{} {}", date_s.trim(), time_s.trim());
    let mut date = parse_date(date_s).map_err(|e| err(&joined, e.reason))?;
    let (h, m, s) = parse_hms(time_s).map_err(|e| err(&joined, e.reason))?;

    let h = if h == 24 && m == 0 && s == 0 {
        date = date
            .next_day()
            .ok_or_else(|| err(&joined, "midnight rollover past calendar end"))?;
        0
    } else if h > 23 {
        return Err(err(&joined, format!("hour {h} out of range")));
    } else {
        h
    };

    finish(&joined, date, h, m, s)
}

/// Unix epoch seconds guarded against logger clock garbage: anything outside
/// the years 2000-2100 (bounds inclusive) is rejected.
pub fn parse_epoch_guarded(secs: i64) -> Result<OffsetDateTime, TimestampError> {
    if !(EPOCH_MIN..=EPOCH_MAX).contains(&secs) {
        return Err(err(
            &secs.to_string(),
            "epoch seconds outside the 2000-2100 sanity window",
        ));
    }
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| err(&secs.to_string(), e.to_string()))
}

fn parse_date(s: &str) -> Result<Date, TimestampError> {
    let s = s.trim();
    let sep = ['-', '/', '.', '_'];
    let parts: Vec<&str> = s.split(sep).filter(|p| !p.is_empty()).collect();
    if parts.len() != 3 {
        return Err(err(s, "expected three date components"));
    }

    let nums: Vec<i64> = parts
        .iter()
        .map(|p| p.parse::<i64>().map_err(|_| err(s, "non-numeric date component")))
        .collect::<Result<_, _>>()?;

    let (year, month, day) = if parts[0].len() == 4 {
        (nums[0], nums[1], nums[2])
    } else {
        // Day-first. Dotted European dates land here.
        (nums[2], nums[1], nums[0])
    };

    if !(1..=12).contains(&month) {
        return Err(err(s, format!("month {month} out of range")));
    }
    if !(1..=31).contains(&day) {
        return Err(err(s, format!("day {day} out of range")));
    }

    let month = Month::try_from(month as u8).map_err(|e| err(s, e.to_string()))?;
    Date::from_calendar_date(year as i32, month, day as u8).map_err(|e| err(s, e.to_string()))
}

fn parse_hms(s: &str) -> Result<(u8, u8, u8), TimestampError> {
    let s = s.trim();
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return Err(err(s, "expected HH:MM[:SS]"));
    }
    let mut nums = [0u8; 3];
    for (i, p) in parts.iter().enumerate() {
        nums[i] = p.parse().map_err(|_| err(s, "non-numeric time component"))?;
    }
    if nums[1] > 59 || nums[2] > 59 {
        return Err(err(s, "minute/second out of range"));
    }
    Ok((nums[0], nums[1], nums[2]))
}

fn build(
    input: &str,
    year: i32,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
) -> Result<OffsetDateTime, TimestampError> {
    let month = Month::try_from(month).map_err(|e| err(input, e.to_string()))?;
    let date = Date::from_calendar_date(year, month, day).map_err(|e| err(input, e.to_string()))?;
    finish(input, date, hour, minute, second)
}

fn finish(
    input: &str,
    date: Date,
    hour: u8,
    minute: u8,
    second: u8,
) -> Result<OffsetDateTime, TimestampError> {
    let time = Time::from_hms(hour, minute, second).map_err(|e| err(input, e.to_string()))?;
    Ok(PrimitiveDateTime::new(date, time).assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn compact_parses_exactly() {
        assert_eq!(
            parse_compact("20251001T020435").unwrap(),
            datetime!(2025-10-01 02:04:35 UTC)
        );
    }

    #[test]
    fn compact_rejects_hour_24() {
        assert!(parse_compact("20251015T240000").is_err());
    }

    #[test]
    fn compact_rejects_day_32() {
        assert!(parse_compact("20251032T120000").is_err());
    }

    #[test]
    fn compact_rejects_calendar_impossible_day() {
        // Day 30 passes the 1-31 range check but February rejects it.
        assert!(parse_compact("20250230T120000").is_err());
    }

    #[test]
    fn dotted_date_is_day_first() {
        assert_eq!(
            parse_any("01.10.2025 01:50:00").unwrap(),
            datetime!(2025-10-01 01:50:00 UTC)
        );
    }

    #[test]
    fn year_first_variants_parse() {
        let expected = datetime!(2025-10-01 02:04:35 UTC);
        assert_eq!(parse_any("2025-10-01 02:04:35").unwrap(), expected);
        assert_eq!(parse_any("2025/10/01 02:04:35").unwrap(), expected);
        assert_eq!(parse_any("2025_10_01 02:04:35").unwrap(), expected);
        assert_eq!(parse_any("2025-10-01T02:04:35").unwrap(), expected);
    }

    #[test]
    fn slash_day_first_parses() {
        assert_eq!(
            parse_any("01/10/2025 02:04:35").unwrap(),
            datetime!(2025-10-01 02:04:35 UTC)
        );
    }

    #[test]
    fn single_token_rejects_hour_24() {
        assert!(parse_any("2025-10-01 24:00:00").is_err());
    }

    #[test]
    fn midnight_rollover_advances_a_day() {
        assert_eq!(
            combine_date_time("01.10.2025", "24:00:00").unwrap(),
            datetime!(2025-10-02 00:00:00 UTC)
        );
        // Month boundary.
        assert_eq!(
            combine_date_time("31.10.2025", "24:00:00").unwrap(),
            datetime!(2025-11-01 00:00:00 UTC)
        );
    }

    #[test]
    fn plain_time_does_not_roll_over() {
        assert_eq!(
            combine_date_time("01.10.2025", "01:50:00").unwrap(),
            datetime!(2025-10-01 01:50:00 UTC)
        );
    }

    #[test]
    fn epoch_guard_accepts_bounds() {
        assert_eq!(
            parse_epoch_guarded(EPOCH_MIN).unwrap(),
            datetime!(2000-01-01 00:00:00 UTC)
        );
        assert_eq!(
            parse_epoch_guarded(EPOCH_MAX).unwrap(),
            datetime!(2100-01-01 00:00:00 UTC)
        );
    }

    #[test]
    fn epoch_guard_rejects_outside_window() {
        assert!(parse_epoch_guarded(EPOCH_MIN - 1).is_err());
        assert!(parse_epoch_guarded(EPOCH_MAX + 1).is_err());
        assert!(parse_epoch_guarded(0).is_err());
    }
}
