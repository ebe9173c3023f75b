//! Timestamp utilities

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Start of the enrichment watermark when nothing has been processed yet
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Wire representation of a payload timestamp (RFC 3339, UTC, microseconds)
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a payload timestamp
///
/// Accepts RFC 3339 with any offset, or a naive ISO-8601 date-time which is
/// taken to be UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(Error::MalformedPayload(format!("unparseable timestamp '{}'", raw)))
}

/// Drop sub-second precision; the store keeps whole seconds
pub fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(0).unwrap_or(ts)
}

/// Wall clock that never runs backwards for one owner
///
/// Successive payload timestamps from a single publisher must be
/// non-decreasing even if the system clock is stepped back (NTP sync on
/// boot is common on edge boards).
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Option<DateTime<Utc>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time, clamped to the previously returned value
    pub fn now(&mut self) -> DateTime<Utc> {
        self.observe(now())
    }

    fn observe(&mut self, wall: DateTime<Utc>) -> DateTime<Utc> {
        let ts = match self.last {
            Some(last) if wall < last => last,
            _ => wall,
        };
        self.last = Some(ts);
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800);
    }

    #[test]
    fn test_epoch_is_zero() {
        assert_eq!(epoch().timestamp(), 0);
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let ts = parse_timestamp("2025-03-01T12:00:05+02:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2025-03-01T10:00:05.000000Z");
    }

    #[test]
    fn test_parse_naive_iso_is_utc() {
        // Python's datetime.now().isoformat() has no offset
        let ts = parse_timestamp("2025-03-01T12:00:05.123456").unwrap();
        assert_eq!(format_timestamp(&ts), "2025-03-01T12:00:05.123456Z");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_truncate_to_seconds() {
        let ts = parse_timestamp("2025-03-01T12:00:05.987Z").unwrap();
        assert_eq!(
            truncate_to_seconds(ts),
            parse_timestamp("2025-03-01T12:00:05Z").unwrap()
        );
    }

    #[test]
    fn test_monotonic_clock_ignores_backward_step() {
        let mut clock = MonotonicClock::new();
        let t0 = parse_timestamp("2025-03-01T12:00:00Z").unwrap();
        assert_eq!(clock.observe(t0), t0);
        assert_eq!(clock.observe(t0 - ChronoDuration::seconds(30)), t0);
        let later = t0 + ChronoDuration::seconds(20);
        assert_eq!(clock.observe(later), later);
    }

    #[tokio::test]
    async fn test_monotonic_clock_advances() {
        let mut clock = MonotonicClock::new();
        let first = clock.now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(clock.now() > first);
    }
}
