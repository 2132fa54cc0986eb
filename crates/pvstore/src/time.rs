//! Timestamp helpers.
//!
//! Records store their time as seconds (plus nanoseconds) into the year declared by the file header.
//! Everything outside a file works with `DateTime<Utc>` and epoch seconds; this module converts between
//! the two.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use std::fmt;

/// A timestamp decomposed into a year and an offset into that year.
///
/// Field order makes the derived `Ord` compare by year, then seconds, then nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearSecondTimestamp {
    /// Calendar year (UTC).
    pub year: i16,
    /// Seconds since January 1st 00:00:00 UTC of `year`.
    pub seconds_into_year: u32,
    /// Sub-second nanoseconds.
    pub nanos: u32,
}

impl YearSecondTimestamp {
    /// Earlier than any real timestamp. Used as an open lower query bound.
    pub const MIN: Self = Self {
        year: i16::MIN,
        seconds_into_year: 0,
        nanos: 0,
    };

    /// Later than any real timestamp. Used as an open upper query bound.
    pub const MAX: Self = Self {
        year: i16::MAX,
        seconds_into_year: u32::MAX,
        nanos: u32::MAX,
    };

    /// Creates a new year/second timestamp.
    pub fn new(year: i16, seconds_into_year: u32, nanos: u32) -> Self {
        Self {
            year,
            seconds_into_year,
            nanos,
        }
    }

    /// Converts to epoch seconds.
    pub fn epoch_seconds(&self) -> i64 {
        start_of_year_epoch_seconds(i32::from(self.year)) + i64::from(self.seconds_into_year)
    }

    /// Converts to a UTC instant.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        from_epoch_seconds(self.epoch_seconds(), self.nanos)
    }
}

impl From<DateTime<Utc>> for YearSecondTimestamp {
    fn from(ts: DateTime<Utc>) -> Self {
        to_year_second(&ts)
    }
}

impl fmt::Display for YearSecondTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

/// Mean Gregorian year, used only for years outside chrono's calendar range.
const MEAN_YEAR_SECONDS: i64 = 31_556_952;

/// Epoch seconds of January 1st 00:00:00 UTC of `year`.
pub fn start_of_year_epoch_seconds(year: i32) -> i64 {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|start| start.and_utc().timestamp())
        .unwrap_or_else(|| (i64::from(year) - 1970) * MEAN_YEAR_SECONDS)
}

/// Number of seconds in `year`.
pub fn seconds_in_year(year: i32) -> u32 {
    let days = if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
        366
    } else {
        365
    };
    days * 86_400
}

/// Converts epoch seconds plus nanoseconds to a UTC instant.
///
/// Out-of-range inputs collapse to the Unix epoch.
pub fn from_epoch_seconds(seconds: i64, nanos: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, nanos.min(999_999_999)).unwrap_or_default()
}

/// Decomposes a UTC instant into year and seconds-into-year.
pub fn to_year_second(ts: &DateTime<Utc>) -> YearSecondTimestamp {
    let year = ts.year();
    let seconds_into_year = ts.timestamp() - start_of_year_epoch_seconds(year);
    YearSecondTimestamp {
        year: year as i16,
        seconds_into_year: seconds_into_year as u32,
        nanos: ts.timestamp_subsec_nanos().min(999_999_999),
    }
}
