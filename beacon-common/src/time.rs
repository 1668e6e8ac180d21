//! Utilities to deal with wall clock timestamps.

use std::fmt;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, TimeZone, Utc};

/// A unix timestamp with millisecond precision.
///
/// This is the timestamp format written into persisted records. It is based on the system clock
/// and therefore subject to skew; use monotonic instants for scheduling.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UnixTimestamp(u64);

impl UnixTimestamp {
    /// Creates a timestamp from milliseconds elapsed since the UNIX epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Creates a unix timestamp from the given system time.
    pub fn from_system(time: SystemTime) -> Self {
        let millis = time
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Self(millis.try_into().unwrap_or(u64::MAX))
    }

    /// Returns the current timestamp.
    #[inline]
    pub fn now() -> Self {
        Self::from_system(SystemTime::now())
    }

    /// Returns the number of milliseconds since the UNIX epoch start.
    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns the time elapsed since this timestamp, or zero if it lies in the future.
    pub fn elapsed(self) -> Duration {
        Duration::from_millis(Self::now().0.saturating_sub(self.0))
    }

    /// Converts the timestamp into a chrono `DateTime`.
    pub fn as_datetime(self) -> Option<DateTime<Utc>> {
        let millis = i64::try_from(self.0).ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}

impl From<DateTime<Utc>> for UnixTimestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value.timestamp_millis().max(0) as u64)
    }
}

impl fmt::Debug for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnixTimestamp({})", self.0)
    }
}

impl fmt::Display for UnixTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_datetime() {
            Some(datetime) => write!(f, "{}", datetime.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datetime_conversion() {
        let datetime = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let timestamp = UnixTimestamp::from(datetime);
        assert_eq!(timestamp.as_millis(), 1_709_296_200_000);
        assert_eq!(timestamp.as_datetime(), Some(datetime));
        assert_eq!(timestamp.to_string(), "2024-03-01T12:30:00.000Z");
    }

    #[test]
    fn test_elapsed_future() {
        let future = UnixTimestamp::from_millis(UnixTimestamp::now().as_millis() + 60_000);
        assert_eq!(future.elapsed(), Duration::ZERO);
    }
}
