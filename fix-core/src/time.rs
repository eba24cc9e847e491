use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::fix_string::FixStr;

const FIX_TIME_FMT: &str = "%Y%m%d-%H:%M:%S%.6f";

#[derive(Debug)]
pub struct TimestampError(String);

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid FIX timestamp {:?}, expected YYYYMMDD-HH:MM:SS.ffffff", self.0)
    }
}

impl std::error::Error for TimestampError {}

/// `SendingTime<52>` / `OrigSendingTime<122>`: UTC, microsecond precision,
/// rendered as `YYYYMMDD-HH:MM:SS.ffffff`.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct UtcTimestamp(DateTime<Utc>);

impl UtcTimestamp {
    pub fn now() -> UtcTimestamp {
        UtcTimestamp(Utc::now())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> UtcTimestamp {
        UtcTimestamp(dt)
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn parse(s: &FixStr) -> Result<UtcTimestamp, TimestampError> {
        let naive = NaiveDateTime::parse_from_str(s.as_utf8(), FIX_TIME_FMT)
            .map_err(|_| TimestampError(s.as_utf8().to_owned()))?;
        Ok(UtcTimestamp(naive.and_utc()))
    }
}

impl fmt::Display for UtcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(FIX_TIME_FMT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix_string::FixString;

    #[test]
    fn formats_with_microsecond_precision() {
        let dt = NaiveDateTime::parse_from_str("20240102-03:04:05.123456", FIX_TIME_FMT).unwrap();
        let ts = UtcTimestamp::from_datetime(dt.and_utc());
        assert_eq!(ts.to_string(), "20240102-03:04:05.123456");
    }

    #[test]
    fn round_trips_through_fix_str() {
        let s = FixString::try_from("20240102-03:04:05.123456").unwrap();
        let ts = UtcTimestamp::parse(&s).unwrap();
        assert_eq!(ts.to_string(), s.to_string());
    }

    #[test]
    fn rejects_garbage() {
        let s = FixString::try_from("not-a-timestamp").unwrap();
        assert!(UtcTimestamp::parse(&s).is_err());
    }
}
