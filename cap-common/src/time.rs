//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Exponential backoff delay for a retry attempt (attempt 1 = base delay)
///
/// Doubles per attempt, saturating instead of overflowing.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> std::time::Duration {
    let exponent = attempt.saturating_sub(1).min(20);
    std::time::Duration::from_millis(base_ms.saturating_mul(1u64 << exponent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_returns_valid_timestamp() {
        let timestamp = now();
        // After 2000-01-01, before 2100-01-01
        assert!(timestamp.timestamp() > 946_684_800);
        assert!(timestamp.timestamp() < 4_102_444_800);
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(1000, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(1000, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(1000, 3), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_zero_attempt_is_base() {
        assert_eq!(backoff_delay(250, 0), Duration::from_millis(250));
    }

    #[test]
    fn test_backoff_saturates() {
        // Should not panic on huge inputs
        let d = backoff_delay(u64::MAX, 40);
        assert_eq!(d.as_millis(), u64::MAX as u128);
    }
}
