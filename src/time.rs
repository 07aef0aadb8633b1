//! Monotonic millisecond clock.
//!
//! Session expiries and offline-message ages are compared against a
//! monotonic timeline so wall-clock adjustments cannot expire or revive
//! state. The epoch is the first call in the process.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed on the process-local monotonic timeline.
#[must_use]
pub fn now_ms() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
