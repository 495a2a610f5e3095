use std::time::{Instant, SystemTime};

lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock ran off before the unix epoch")
        .as_secs()
}

/// Milliseconds elapsed on the monotonic clock since the process first asked.
#[inline]
pub fn now_ms() -> i64 {
    EPOCH.elapsed().as_millis() as i64
}

/// Remaining budget after `elapsed_ms` has been spent. A zero budget means
/// "no deadline" and stays zero.
#[inline]
pub fn left_timeout(budget_ms: i64, elapsed_ms: i64) -> i64 {
    if budget_ms == 0 || elapsed_ms >= budget_ms {
        return 0;
    }

    budget_ms - elapsed_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_timeout() {
        assert_eq!(left_timeout(0, 50), 0);
        assert_eq!(left_timeout(100, 30), 70);
        assert_eq!(left_timeout(100, 100), 0);
        assert_eq!(left_timeout(100, 250), 0);
    }

    #[test]
    fn test_now_ms_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
