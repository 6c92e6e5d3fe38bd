use lazy_static::lazy_static;
use std::time::Instant;

lazy_static! {
    static ref ORIGIN: Instant = Instant::now();
}

/// Nanoseconds elapsed on the process-local monotonic clock. All protocol
/// timestamps (`start_time`, `processing_time`) are expressed in this unit.
#[inline]
pub fn monotonic_ns() -> u64 {
    ORIGIN.elapsed().as_nanos() as u64
}

/// Converts a nanosecond span to fractional milliseconds.
#[inline]
pub fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

/// Converts a nanosecond span to fractional seconds.
#[inline]
pub fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / 1_000_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(ns_to_ms(1_500_000), 1.5);
        assert_eq!(ns_to_secs(2_000_000_000), 2.0);
    }
}
