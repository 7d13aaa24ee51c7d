//! Clock and calendar parsing on plain epoch milliseconds.
//!
//! All engine time math is `Ms` arithmetic; this module only converts the
//! human spellings accepted at the boundary ("9:00 AM", "2025-06-02") into
//! milliseconds. Strict by design: a malformed time is an error, never a
//! guess.

use std::error::Error;
use std::fmt;

use crate::model::Ms;

pub const MS_PER_MINUTE: Ms = 60_000;
pub const MS_PER_DAY: Ms = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// Input did not match `H:MM AM|PM`.
    InvalidTimeFormat(String),
    /// Input did not match `YYYY-MM-DD` or named an impossible date.
    InvalidDateFormat(String),
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::InvalidTimeFormat(s) => {
                write!(f, "invalid time {s:?}, expected H:MM AM|PM")
            }
            ClockError::InvalidDateFormat(s) => {
                write!(f, "invalid date {s:?}, expected YYYY-MM-DD")
            }
        }
    }
}

impl Error for ClockError {}

/// Parse a 12-hour clock string (`"9:00 AM"`, `"12:30 PM"`) into minutes
/// since midnight. Hours run 1..=12, minutes are exactly two digits.
pub fn parse_clock(s: &str) -> Result<u16, ClockError> {
    let bad = || ClockError::InvalidTimeFormat(s.to_string());

    let (hm, meridiem) = s.split_once(' ').ok_or_else(bad)?;
    let pm = if meridiem.eq_ignore_ascii_case("AM") {
        false
    } else if meridiem.eq_ignore_ascii_case("PM") {
        true
    } else {
        return Err(bad());
    };

    let (h, m) = hm.split_once(':').ok_or_else(bad)?;
    if h.is_empty() || h.len() > 2 || !h.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    if m.len() != 2 || !m.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let hour: u16 = h.parse().map_err(|_| bad())?;
    let minute: u16 = m.parse().map_err(|_| bad())?;
    if !(1..=12).contains(&hour) || minute > 59 {
        return Err(bad());
    }

    // 12 AM is midnight, 12 PM is noon.
    let hour24 = match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };
    Ok(hour24 * 60 + minute)
}

/// Parse a `YYYY-MM-DD` date into the epoch-ms instant of local midnight,
/// where "local" is the given fixed UTC offset in minutes.
pub fn parse_day(s: &str, tz_offset_min: i32) -> Result<Ms, ClockError> {
    let bad = || ClockError::InvalidDateFormat(s.to_string());

    let bytes = s.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return Err(bad());
    }
    let digits = |r: std::ops::Range<usize>| -> Result<i64, ClockError> {
        let part = &s[r];
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        part.parse().map_err(|_| bad())
    };
    let year = digits(0..4)?;
    let month = digits(5..7)?;
    let day = digits(8..10)?;
    if !(1..=12).contains(&month) || day < 1 || day > days_in_month(year, month) {
        return Err(bad());
    }

    let epoch_days = days_from_civil(year, month, day);
    Ok(epoch_days * MS_PER_DAY - tz_offset_min as Ms * MS_PER_MINUTE)
}

/// Parse `"YYYY-MM-DD H:MM AM"` into an epoch-ms instant.
pub fn parse_instant(s: &str, tz_offset_min: i32) -> Result<Ms, ClockError> {
    let (date, clock) = s
        .split_once(' ')
        .ok_or_else(|| ClockError::InvalidTimeFormat(s.to_string()))?;
    let midnight = parse_day(date, tz_offset_min)?;
    let minutes = parse_clock(clock)?;
    Ok(midnight + minutes as Ms * MS_PER_MINUTE)
}

/// Floor an instant to the start of its local calendar day.
pub fn local_day_start(now: Ms, tz_offset_min: i32) -> Ms {
    let off = tz_offset_min as Ms * MS_PER_MINUTE;
    (now + off).div_euclid(MS_PER_DAY) * MS_PER_DAY - off
}

fn is_leap_year(year: i64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

fn days_in_month(year: i64, month: i64) -> i64 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Days since 1970-01-01 for a proleptic-Gregorian date.
/// Howard Hinnant's `days_from_civil` algorithm.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_morning() {
        assert_eq!(parse_clock("9:00 AM"), Ok(540));
        assert_eq!(parse_clock("09:00 AM"), Ok(540));
        assert_eq!(parse_clock("1:05 am"), Ok(65));
    }

    #[test]
    fn clock_noon_and_midnight() {
        assert_eq!(parse_clock("12:00 AM"), Ok(0));
        assert_eq!(parse_clock("12:00 PM"), Ok(720));
        assert_eq!(parse_clock("12:30 PM"), Ok(750));
        assert_eq!(parse_clock("11:59 PM"), Ok(1439));
    }

    #[test]
    fn clock_afternoon() {
        assert_eq!(parse_clock("5:30 PM"), Ok(1050));
        assert_eq!(parse_clock("2:00 pm"), Ok(840));
    }

    #[test]
    fn clock_rejects_malformed() {
        for bad in [
            "25:00 PM", "13:00 PM", "0:30 AM", "9:60 AM", "9:00", "", "9 AM", "9:0 AM",
            "9:00AM", "9:00 XM", "009:00 AM", "9:000 AM", "-1:00 AM", "9:00  AM",
        ] {
            assert!(parse_clock(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn day_epoch() {
        assert_eq!(parse_day("1970-01-01", 0), Ok(0));
        assert_eq!(parse_day("1970-01-02", 0), Ok(MS_PER_DAY));
        assert_eq!(parse_day("1969-12-31", 0), Ok(-MS_PER_DAY));
    }

    #[test]
    fn day_leap_years() {
        assert!(parse_day("2024-02-29", 0).is_ok());
        assert!(parse_day("2023-02-29", 0).is_err());
        assert!(parse_day("2000-02-29", 0).is_ok());
        assert!(parse_day("1900-02-29", 0).is_err());
    }

    #[test]
    fn day_rejects_malformed() {
        for bad in [
            "2025-13-01", "2025-00-10", "2025-04-31", "2025-06-00", "2025-6-02",
            "25-06-02", "2025/06/02", "2025-06-02x", "",
        ] {
            assert!(parse_day(bad, 0).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn day_known_date() {
        // 2025-06-02 is 20241 days after the epoch.
        assert_eq!(parse_day("2025-06-02", 0), Ok(20_241 * MS_PER_DAY));
    }

    #[test]
    fn day_with_offset() {
        // UTC+2: local midnight falls two hours before UTC midnight.
        assert_eq!(parse_day("1970-01-01", 120), Ok(-120 * MS_PER_MINUTE));
        // UTC-5.
        assert_eq!(parse_day("1970-01-01", -300), Ok(300 * MS_PER_MINUTE));
    }

    #[test]
    fn instant_composition() {
        assert_eq!(parse_instant("1970-01-01 9:00 AM", 0), Ok(540 * MS_PER_MINUTE));
        let noon = parse_instant("2025-06-02 12:00 PM", 0).unwrap();
        assert_eq!(noon, 20_241 * MS_PER_DAY + 720 * MS_PER_MINUTE);
        assert!(parse_instant("2025-06-02", 0).is_err());
        assert!(parse_instant("2025-06-02 25:00 PM", 0).is_err());
    }

    #[test]
    fn day_start_floor() {
        assert_eq!(local_day_start(0, 0), 0);
        assert_eq!(local_day_start(MS_PER_DAY - 1, 0), 0);
        assert_eq!(local_day_start(MS_PER_DAY, 0), MS_PER_DAY);
        assert_eq!(local_day_start(-1, 0), -MS_PER_DAY);
    }

    #[test]
    fn day_start_with_offset() {
        // At UTC instant 23:30 in UTC+2 the local day has already rolled over.
        let utc_2330 = 23 * 60 * MS_PER_MINUTE + 30 * MS_PER_MINUTE;
        let start = local_day_start(utc_2330, 120);
        assert_eq!(start, MS_PER_DAY - 120 * MS_PER_MINUTE);
    }
}
