use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::model::EventTime;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimeError {
    #[error("timestamp {value:?} does not match format {format:?}")]
    Unparseable { value: String, format: String },
    #[error("timestamp {0} is out of range")]
    OutOfRange(String),
    #[error("bucket width must be a positive number of milliseconds")]
    InvalidInterval,
}

/// Fixed-width time buckets used to aggregate occurrence counts.
#[derive(Debug, Clone)]
pub struct Bucketing {
    width: TimeDelta,
    time_format: String,
}

impl Bucketing {
    pub fn new(width: TimeDelta, time_format: &str) -> Result<Self, TimeError> {
        if width.num_milliseconds() <= 0 {
            return Err(TimeError::InvalidInterval);
        }

        Ok(Self {
            width,
            time_format: time_format.to_owned(),
        })
    }

    pub fn from_minutes(minutes: u32, time_format: &str) -> Result<Self, TimeError> {
        Self::new(TimeDelta::minutes(minutes.into()), time_format)
    }

    pub fn width(&self) -> TimeDelta {
        self.width
    }

    /// Parse an event timestamp: textual timestamps use the configured strftime format
    /// and are read as UTC, numeric ones are Unix seconds with an optional fraction.
    pub fn parse(&self, timestamp: &EventTime) -> Result<DateTime<Utc>, TimeError> {
        match timestamp {
            EventTime::Unix(seconds) => {
                if !seconds.is_finite() {
                    return Err(TimeError::OutOfRange(seconds.to_string()));
                }
                let whole = seconds.floor();
                let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
                DateTime::from_timestamp(whole as i64, nanos)
                    .ok_or_else(|| TimeError::OutOfRange(seconds.to_string()))
            }
            EventTime::Text(value) => NaiveDateTime::parse_from_str(value, &self.time_format)
                .map(|naive| naive.and_utc())
                .map_err(|_| TimeError::Unparseable {
                    value: value.to_owned(),
                    format: self.time_format.clone(),
                }),
        }
    }

    /// Return the (start, end) of the bucket containing `t`. The start is the largest
    /// multiple of the width (counted from the Unix epoch) that is not after `t`.
    pub fn bounds(&self, t: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), TimeError> {
        let width = self.width.num_milliseconds();
        let start_ms = t.timestamp_millis().div_euclid(width) * width;
        let start = DateTime::from_timestamp_millis(start_ms)
            .ok_or_else(|| TimeError::OutOfRange(t.to_rfc3339()))?;
        let end = start
            .checked_add_signed(self.width)
            .ok_or_else(|| TimeError::OutOfRange(t.to_rfc3339()))?;

        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    #[test]
    fn test_bounds_truncate_to_interval() {
        let bucketing = Bucketing::from_minutes(15, FORMAT).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 10, 44, 59).unwrap();

        let (start, end) = bucketing.bounds(t).unwrap();

        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 9, 10, 30, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 9, 10, 45, 0).unwrap());
    }

    #[test]
    fn test_bounds_contain_timestamp_for_many_widths() {
        let t = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 30).unwrap()
            + TimeDelta::milliseconds(250);

        for minutes in [1, 5, 7, 15, 60, 1440] {
            let bucketing = Bucketing::from_minutes(minutes, FORMAT).unwrap();
            let (start, end) = bucketing.bounds(t).unwrap();
            let width = TimeDelta::minutes(minutes.into());

            assert!(start <= t, "start after t for width {minutes}");
            assert!(t < end, "end not after t for width {minutes}");
            assert_eq!(end - start, width);
            assert_eq!(start.timestamp_millis() % width.num_milliseconds(), 0);
        }
    }

    #[test]
    fn test_bounds_on_boundary_start_new_bucket() {
        let bucketing = Bucketing::from_minutes(15, FORMAT).unwrap();
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 10, 45, 0).unwrap();

        let (start, _) = bucketing.bounds(t).unwrap();

        assert_eq!(start, t);
    }

    #[test]
    fn test_bounds_before_epoch() {
        let bucketing = Bucketing::from_minutes(15, FORMAT).unwrap();
        let t = Utc.with_ymd_and_hms(1969, 12, 31, 23, 50, 0).unwrap();

        let (start, end) = bucketing.bounds(t).unwrap();

        assert_eq!(start, Utc.with_ymd_and_hms(1969, 12, 31, 23, 45, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_zero_width_is_rejected() {
        assert_eq!(
            Bucketing::from_minutes(0, FORMAT).unwrap_err(),
            TimeError::InvalidInterval
        );
    }

    #[test]
    fn test_parse_text_and_unix_timestamps() {
        let bucketing = Bucketing::from_minutes(15, FORMAT).unwrap();

        let text = bucketing
            .parse(&EventTime::Text("2024-03-09 10:44:59".to_owned()))
            .unwrap();
        assert_eq!(text, Utc.with_ymd_and_hms(2024, 3, 9, 10, 44, 59).unwrap());

        let unix = bucketing.parse(&EventTime::Unix(1_710_000_000.5)).unwrap();
        assert_eq!(unix.timestamp(), 1_710_000_000);
        assert_eq!(unix.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_parse_rejects_malformed_text() {
        let bucketing = Bucketing::from_minutes(15, FORMAT).unwrap();

        let err = bucketing
            .parse(&EventTime::Text("yesterday at noon".to_owned()))
            .unwrap_err();

        assert!(matches!(err, TimeError::Unparseable { .. }));
    }
}
