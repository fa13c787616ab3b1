//! Duration string parsing and timestamp comparison.
//!
//! Mirrors the original agent's `Timestamp` helper: durations are written as
//! `<n>{d|h|m}` (days, hours, minutes) and are always relative to "now".

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced while parsing durations or timestamps.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    /// The duration string did not match `<n>{d|h|m}`.
    #[error("invalid duration string: {0}")]
    InvalidDuration(String),
    /// The ISO-8601 string was not a well-formed extended timestamp.
    #[error("invalid time string: {0}")]
    InvalidTimestamp(String),
}

/// A single unit of a duration string (days, hours, or minutes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DurationUnit {
    Days,
    Hours,
    Minutes,
}

fn split_duration(spec: &str) -> Result<(i64, DurationUnit), TimeError> {
    if spec.len() < 2 {
        return Err(TimeError::InvalidDuration(spec.to_owned()));
    }
    let mut chars = spec.chars();
    let suffix = chars.next_back().ok_or_else(|| TimeError::InvalidDuration(spec.to_owned()))?;
    let digits: String = chars.collect();
    let value: i64 = digits
        .parse()
        .map_err(|_| TimeError::InvalidDuration(spec.to_owned()))?;
    let unit = match suffix {
        'd' => DurationUnit::Days,
        'h' => DurationUnit::Hours,
        'm' => DurationUnit::Minutes,
        _ => return Err(TimeError::InvalidDuration(spec.to_owned())),
    };
    Ok((value, unit))
}

/// Parse a `<n>{d|h|m}` duration string into a whole number of minutes.
///
/// # Errors
/// Returns [`TimeError::InvalidDuration`] if `spec` does not match the
/// expected format.
///
/// # Examples
/// ```
/// use pxa::time::parse_minutes;
/// assert_eq!(parse_minutes("2d").unwrap(), 2880);
/// assert_eq!(parse_minutes("16m").unwrap(), 16);
/// ```
pub fn parse_minutes(spec: &str) -> Result<u64, TimeError> {
    let (value, unit) = split_duration(spec)?;
    let minutes = match unit {
        DurationUnit::Days => value.saturating_mul(24).saturating_mul(60),
        DurationUnit::Hours => value.saturating_mul(60),
        DurationUnit::Minutes => value,
    };
    u64::try_from(minutes).map_err(|_| TimeError::InvalidDuration(spec.to_owned()))
}

/// Parse a `<n>{d|h|m}` duration string into a [`std::time::Duration`].
///
/// # Errors
/// Returns [`TimeError::InvalidDuration`] if `spec` does not match the
/// expected format.
pub fn parse_duration(spec: &str) -> Result<std::time::Duration, TimeError> {
    Ok(std::time::Duration::from_secs(parse_minutes(spec)? * 60))
}

/// A point in time, constructed either from "now" or from a past duration
/// relative to "now", used to compare against filesystem modification times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    instant: DateTime<Utc>,
}

impl Timestamp {
    /// Build a timestamp representing the current instant.
    #[must_use]
    pub fn now() -> Self { Self { instant: Utc::now() } }

    /// Build a timestamp for `past_duration` before now, e.g. `"1h"`.
    ///
    /// # Errors
    /// Returns [`TimeError::InvalidDuration`] if `past_duration` is malformed.
    pub fn past(past_duration: &str) -> Result<Self, TimeError> {
        let minutes = parse_minutes(past_duration)?;
        let delta = chrono::Duration::minutes(i64::try_from(minutes).unwrap_or(i64::MAX));
        Ok(Self {
            instant: Utc::now() - delta,
        })
    }

    /// Convert an extended ISO-8601 string (`2016-02-18T19:40:49.711227Z`)
    /// into the original agent's compact basic form
    /// (`20160218T194049.711227`).
    ///
    /// # Errors
    /// Returns [`TimeError::InvalidTimestamp`] if the string is shorter than
    /// 21 characters or does not end in `Z`.
    pub fn convert_to_iso(extended_iso8601_time: &str) -> Result<String, TimeError> {
        if extended_iso8601_time.len() < 21 || !extended_iso8601_time.ends_with('Z') {
            return Err(TimeError::InvalidTimestamp(extended_iso8601_time.to_owned()));
        }
        let Some(trimmed) = extended_iso8601_time.strip_suffix('Z') else {
            return Err(TimeError::InvalidTimestamp(extended_iso8601_time.to_owned()));
        };
        Ok(trimmed.chars().filter(|c| *c != '-' && *c != ':').collect())
    }

    /// Returns `true` if `self` is strictly later than `other`.
    ///
    /// # Errors
    /// Returns [`TimeError::InvalidTimestamp`] if `other` cannot be parsed.
    pub fn is_newer_than(&self, other: &str) -> Result<bool, TimeError> {
        let compact = Self::convert_to_iso(other)?;
        let parsed = parse_compact_basic(&compact)?;
        Ok(self.instant > parsed)
    }

    /// Returns `true` if `self` is strictly later than a filesystem
    /// modification time.
    #[must_use]
    pub fn is_newer_than_mtime(&self, mtime: SystemTime) -> bool {
        let other: DateTime<Utc> = mtime.into();
        self.instant > other
    }
}

fn parse_compact_basic(compact: &str) -> Result<DateTime<Utc>, TimeError> {
    // `20160218T194049.711227` -> reinsert separators, then parse.
    if compact.len() < 15 {
        return Err(TimeError::InvalidTimestamp(compact.to_owned()));
    }
    let (date, rest) = compact.split_at(8);
    let time_part = rest.strip_prefix('T').ok_or_else(|| TimeError::InvalidTimestamp(compact.to_owned()))?;
    if time_part.len() < 4 {
        return Err(TimeError::InvalidTimestamp(compact.to_owned()));
    }
    #[expect(clippy::indexing_slicing, reason = "lengths checked above: date is exactly 8 bytes, time_part at least 4")]
    let rebuilt = format!(
        "{}-{}-{}T{}:{}:{}Z",
        &date[0..4],
        &date[4..6],
        &date[6..8],
        &time_part[0..2],
        &time_part[2..4],
        &time_part[4..],
    );
    DateTime::parse_from_rfc3339(&rebuilt)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimeError::InvalidTimestamp(compact.to_owned()))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("0d", 0)]
    #[case("2d", 2880)]
    #[case("100h", 6000)]
    #[case("16m", 16)]
    fn parses_valid_durations(#[case] spec: &str, #[case] expected: u64) {
        assert_eq!(parse_minutes(spec).unwrap(), expected);
    }

    #[rstest]
    #[case("5x")]
    #[case("")]
    #[case("d")]
    #[case("abc")]
    fn rejects_invalid_durations(#[case] spec: &str) {
        assert!(parse_minutes(spec).is_err());
    }

    #[test]
    fn converts_extended_iso8601() {
        assert_eq!(
            Timestamp::convert_to_iso("2016-02-18T19:40:49.711227Z").unwrap(),
            "20160218T194049.711227"
        );
    }

    #[test]
    fn rejects_missing_trailing_z() {
        assert!(Timestamp::convert_to_iso("2016-02-18T19:40:49.711227").is_err());
    }

    #[test]
    fn rejects_short_timestamp() {
        assert!(Timestamp::convert_to_iso("2016-02-18Z").is_err());
    }

    #[test]
    fn is_newer_than_is_antisymmetric() {
        let earlier = Timestamp::past("1h").unwrap();
        let later = Timestamp::now();
        let earlier_iso = earlier.instant.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let later_iso = later.instant.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let a_newer = later.is_newer_than(&earlier_iso).unwrap();
        let b_newer = earlier.is_newer_than(&later_iso).unwrap();
        assert!(a_newer);
        assert!(!b_newer);
    }
}
