//! Expiry arithmetic. Delays are stored in milliseconds, compared in minutes.

use std::time::Duration;

pub const MS_PER_MINUTE: i64 = 60_000;

/// Minutes left before an event stamped `event_ts_ms` expires, as seen at
/// `now_ms`. Zero or negative means the event has expired.
pub fn minutes_to_expiry(delete_after_ms: i64, event_ts_ms: i64, now_ms: i64) -> f64 {
    let delay_minutes = delete_after_ms as f64 / MS_PER_MINUTE as f64;
    let elapsed_minutes = (now_ms - event_ts_ms) as f64 / MS_PER_MINUTE as f64;
    delay_minutes - elapsed_minutes
}

pub fn is_expired(minutes_to_expiry: f64) -> bool {
    minutes_to_expiry <= 0.0
}

/// How long to sleep for `minutes` more; zero once expired.
pub fn sleep_for(minutes: f64) -> Duration {
    if minutes <= 0.0 || !minutes.is_finite() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(minutes * 60.0)
}

/// Convert a delay given in whole minutes to stored milliseconds.
pub fn minutes_to_ms(minutes: u64) -> Option<i64> {
    i64::try_from(minutes).ok()?.checked_mul(MS_PER_MINUTE)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn eleven_minutes_old_is_expired_with_ten_minute_delay() {
        let delay = 10 * MS_PER_MINUTE;
        let minutes = minutes_to_expiry(delay, NOW - 11 * MS_PER_MINUTE, NOW);
        assert!(minutes < 0.0);
        assert!(is_expired(minutes));
        assert!((minutes + 1.0).abs() < 1e-9);
    }

    #[test]
    fn nine_minutes_old_is_pending_with_ten_minute_delay() {
        let delay = 10 * MS_PER_MINUTE;
        let minutes = minutes_to_expiry(delay, NOW - 9 * MS_PER_MINUTE, NOW);
        assert!(minutes > 0.0);
        assert!(!is_expired(minutes));
    }

    #[test]
    fn exactly_at_delay_counts_as_expired() {
        let delay = 10 * MS_PER_MINUTE;
        assert!(is_expired(minutes_to_expiry(delay, NOW - delay, NOW)));
    }

    #[test]
    fn sleep_clamps_negative_to_zero() {
        assert_eq!(sleep_for(-3.0), Duration::ZERO);
        assert_eq!(sleep_for(f64::NAN), Duration::ZERO);
        assert_eq!(sleep_for(1.5), Duration::from_secs(90));
    }

    #[test]
    fn minutes_convert_to_ms() {
        assert_eq!(minutes_to_ms(10), Some(600_000));
        assert_eq!(minutes_to_ms(u64::MAX), None);
    }
}
