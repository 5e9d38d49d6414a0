//! Timestamp utilities

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp for storage (RFC 3339, microsecond precision)
pub fn to_storage(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn from_storage(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Storage(format!("invalid stored timestamp '{}': {}", value, e)))
}

/// Parse an optional stored timestamp
pub fn from_storage_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(from_storage).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // Should be a reasonable timestamp (after year 2000)
        assert!(timestamp.timestamp() > 946_684_800);
    }

    #[tokio::test]
    async fn test_now_successive_calls_advance() {
        let time1 = now();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let time2 = now();
        assert!(time2 > time1);
    }

    #[test]
    fn test_storage_round_trip_keeps_microseconds() {
        let timestamp = now();
        let stored = to_storage(&timestamp);
        let parsed = from_storage(&stored).unwrap();
        assert_eq!(
            parsed.timestamp_micros(),
            timestamp.timestamp_micros()
        );
    }

    #[test]
    fn test_storage_format_sorts_lexically() {
        let earlier = from_storage("2025-01-02T03:04:05.000001Z").unwrap();
        let later = from_storage("2025-01-02T03:04:05.000002Z").unwrap();
        assert!(to_storage(&earlier) < to_storage(&later));
    }

    #[test]
    fn test_invalid_timestamp_is_storage_error() {
        let err = from_storage("yesterday").unwrap_err();
        assert!(err.is_persistence());
    }

    #[test]
    fn test_optional_timestamp() {
        assert_eq!(from_storage_opt(None).unwrap(), None);
        assert!(from_storage_opt(Some("2025-01-02T03:04:05Z".to_string()))
            .unwrap()
            .is_some());
    }
}
