use std::time::{Duration, SystemTime};

/// Milliseconds since the Unix epoch for the given instant.
///
/// Instants before the epoch clamp to zero.
pub fn millis_since_epoch(at: SystemTime) -> u64 {
    let elapsed = at
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    millis_since_epoch(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_since_epoch() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(millis_since_epoch(at), 1_700_000_000_123);
    }

    #[test]
    fn test_before_epoch_clamps_to_zero() {
        let at = SystemTime::UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(millis_since_epoch(at), 0);
    }

    #[test]
    fn test_now_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
