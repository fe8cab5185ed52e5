//! Microsecond timestamps, best-effort parsing, and the `landed_at` clock.
//!
//! Every timestamp stored by the pipeline is a count of microseconds since
//! the Unix epoch. Zero doubles as the sentinel for "absent or unparseable".
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

const DATE_TIME_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]"),
    format_description!("[day].[month].[year] [hour]:[minute]:[second]"),
    format_description!("[year]/[month]/[day] [hour]:[minute]:[second]"),
];

const DATE_FORMATS: &[&[BorrowedFormatItem<'static>]] = &[
    format_description!("[year]-[month]-[day]"),
    format_description!("[day].[month].[year]"),
    format_description!("[year]/[month]/[day]"),
];

const DISPLAY_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(us: i64) -> Self {
        Timestamp(us)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Wall clock, truncated to microseconds.
    pub fn now() -> Self {
        let us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Timestamp(i64::try_from(us).unwrap_or(i64::MAX))
    }

    fn from_offset_date_time(dt: OffsetDateTime) -> Option<Self> {
        i64::try_from(dt.unix_timestamp_nanos() / 1_000).ok().map(Timestamp)
    }

    /// Parse a timestamp written in any of the supported human or machine
    /// formats. Naive date-times are taken as UTC.
    ///
    /// Returns `None` when nothing matches; see [`Timestamp::parse_or_zero`].
    pub fn parse_best_effort(raw: &str) -> Option<Self> {
        let s = raw.trim();
        if s.is_empty() {
            return None;
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s.parse::<i64>().ok().and_then(Self::from_epoch_digits);
        }
        if let Ok(dt) = OffsetDateTime::parse(s, &Rfc3339) {
            return Self::from_offset_date_time(dt);
        }
        for fmt in DATE_TIME_FORMATS {
            if let Ok(pdt) = PrimitiveDateTime::parse(s, fmt) {
                return Self::from_offset_date_time(pdt.assume_utc());
            }
        }
        for fmt in DATE_FORMATS {
            if let Ok(date) = Date::parse(s, fmt) {
                return Self::from_offset_date_time(date.midnight().assume_utc());
            }
        }
        None
    }

    pub fn parse_or_zero(raw: &str) -> Self {
        Self::parse_best_effort(raw).unwrap_or(Self::ZERO)
    }

    /// Interpret an integer Unix epoch. The unit is inferred from the digit
    /// count: up to 10 digits are seconds, up to 13 milliseconds, up to 16
    /// microseconds. Anything longer is rejected.
    pub fn from_epoch_digits(value: i64) -> Option<Self> {
        if value < 0 {
            return None;
        }
        let digits = value.checked_ilog10().map_or(1, |d| d + 1);
        let us = match digits {
            0..=10 => value.checked_mul(1_000_000)?,
            11..=13 => value.checked_mul(1_000)?,
            14..=16 => value,
            _ => return None,
        };
        Some(Timestamp(us))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000)
            .ok()
            .and_then(|dt| dt.format(DISPLAY_FORMAT).ok());
        match formatted {
            Some(s) => f.write_str(&s),
            None => write!(f, "{}us", self.0),
        }
    }
}

/// Hands out strictly increasing `landed_at` stamps.
///
/// Each stamp is the wall clock reading, bumped by one microsecond when the
/// clock has not advanced past the previous stamp (or went backwards).
pub struct LandedAtClock {
    last: Timestamp,
    source: Box<dyn FnMut() -> Timestamp + Send>,
}

impl LandedAtClock {
    pub fn system() -> Self {
        Self::with_source(Timestamp::now)
    }

    pub fn with_source(source: impl FnMut() -> Timestamp + Send + 'static) -> Self {
        Self {
            last: Timestamp::ZERO,
            source: Box::new(source),
        }
    }

    /// Make sure every later stamp is greater than `seen`. Used on startup
    /// so a restarted transform never stamps below what is already stored.
    pub fn observe(&mut self, seen: Timestamp) {
        if seen > self.last {
            self.last = seen;
        }
    }

    pub fn next_stamp(&mut self) -> Timestamp {
        let now = (self.source)();
        let stamp = if now > self.last {
            now
        } else {
            Timestamp(self.last.0.saturating_add(1))
        };
        self.last = stamp;
        stamp
    }
}

impl fmt::Debug for LandedAtClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LandedAtClock").field("last", &self.last).finish_non_exhaustive()
    }
}
