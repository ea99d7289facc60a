/// Calendar-day scoping in a fixed time zone.
///
/// Token lookups and the daily reset both work on "today" as seen from
/// one fixed UTC offset, so deployments in different zones agree on
/// where a day begins.

use crate::error::QueueError;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};

/// Asia/Kolkata, which observes no daylight saving.
pub const KOLKATA_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayScope {
    offset: FixedOffset,
}

impl DayScope {
    pub fn new(offset: FixedOffset) -> Self {
        DayScope { offset }
    }

    pub fn kolkata() -> Self {
        DayScope::new(FixedOffset::east_opt(KOLKATA_OFFSET_SECS).expect("offset is within +/-24h"))
    }

    /// Parse offsets such as `+05:30`, `-03:00` or `Z`.
    pub fn parse_offset(value: &str) -> Result<Self, QueueError> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("z") || value.eq_ignore_ascii_case("utc") {
            return Ok(DayScope::new(Utc.fix()));
        }

        let invalid = || QueueError::InvalidInput(format!("Invalid UTC offset: '{}'. Expected +HH:MM", value));
        let (sign, rest) = match value.chars().next() {
            Some('+') => (1, &value[1..]),
            Some('-') => (-1, &value[1..]),
            _ => return Err(invalid()),
        };
        let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
        let hours: i32 = hours.parse().map_err(|_| invalid())?;
        let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
        if hours < 0 || !(0..60).contains(&minutes) {
            return Err(invalid());
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(DayScope::new)
            .ok_or_else(invalid)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local calendar day of an instant.
    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    pub fn today(&self) -> NaiveDate {
        self.day_of(Utc::now())
    }

    /// First instant strictly after `now` whose local wall time is `at`.
    pub fn next_occurrence(&self, now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
        let local_today = self.day_of(now);
        let candidate = self.instant(local_today, at);
        if candidate > now {
            candidate
        } else {
            self.instant(local_today + Duration::days(1), at)
        }
    }

    fn instant(&self, day: NaiveDate, at: NaiveTime) -> DateTime<Utc> {
        // Fixed offsets have no gaps or folds, so every local time maps to one instant.
        let local = day.and_time(at) - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&local)
    }
}

impl Default for DayScope {
    fn default() -> Self {
        DayScope::kolkata()
    }
}

/// Parse a wall-clock time given as `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, QueueError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| QueueError::InvalidInput(format!("Invalid time of day: '{}'. Expected HH:MM", value)))
}
