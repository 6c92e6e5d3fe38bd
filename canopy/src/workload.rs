//! Workload helpers. The actual processing kernels of a production service
//! are opaque to the runtime; here they are a fixed busy-spin plus random
//! payloads of configured size.

use pulse::time;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;

/// The single request kind the search-style workload speaks.
pub const SEARCH_KIND: u32 = 1;

/// Random alphanumeric payload of the given size.
pub fn random_payload(len: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .collect()
}

/// Busy-spins for the given duration, standing in for a compute kernel.
/// Sleeping would yield the reactor thread and understate service time.
pub fn spin_for(duration: Duration) {
    if duration.as_nanos() == 0 {
        return;
    }
    let deadline = time::monotonic_ns() + duration.as_nanos() as u64;
    while time::monotonic_ns() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_payload_has_requested_size() {
        assert_eq!(random_payload(0).len(), 0);
        assert_eq!(random_payload(512).len(), 512);
    }

    #[test]
    fn test_spin_for_takes_at_least_the_duration() {
        let before = time::monotonic_ns();
        spin_for(Duration::from_millis(2));
        assert!(time::monotonic_ns() - before >= 2_000_000);
    }
}
