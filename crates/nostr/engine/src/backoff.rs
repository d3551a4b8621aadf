//! Skip-slot reconnect backoff.
//!
//! Instead of a timer per connection, every keepalive tick asks the backoff
//! whether to try again. The counter doubles on each failed attempt, so retries
//! happen roughly every 1, 2, 4, ... up to `max` ticks.

/// Reconnect gate for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    counter: u32,
    skipped: u32,
    max: u32,
}

impl ReconnectBackoff {
    pub fn new(max: u32) -> Self {
        Self {
            counter: 0,
            skipped: 0,
            max: max.max(1),
        }
    }

    /// Decide whether an attempt may run now. A suppressed attempt uses up one skip slot.
    pub fn try_attempt(&mut self, force: bool) -> bool {
        let b = self.counter;
        if force || b == 1 || b > self.max || self.skipped == b {
            self.skipped = 0;
            true
        } else {
            self.skipped += 1;
            false
        }
    }

    /// A connection attempt failed or the socket errored.
    pub fn record_failure(&mut self) {
        self.counter = self.counter.saturating_mul(2).clamp(1, self.max);
    }

    /// Socket opened, or closed cleanly.
    pub fn reset(&mut self) {
        self.counter = 0;
        self.skipped = 0;
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_sequence_doubles_to_cap() {
        let mut backoff = ReconnectBackoff::new(512);
        let mut seen = Vec::new();
        for _ in 0..12 {
            backoff.record_failure();
            seen.push(backoff.counter());
        }

        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 512, 512]);
    }

    #[test]
    fn test_first_attempt_and_b_equals_one_are_allowed() {
        let mut backoff = ReconnectBackoff::default();
        assert!(backoff.try_attempt(false));

        backoff.record_failure();
        assert_eq!(backoff.counter(), 1);
        assert!(backoff.try_attempt(false));
        assert!(backoff.try_attempt(false));
    }

    #[test]
    fn test_skip_slots_until_counter() {
        let mut backoff = ReconnectBackoff::default();
        backoff.record_failure();
        backoff.record_failure();
        backoff.record_failure();
        assert_eq!(backoff.counter(), 4);

        let attempts: Vec<bool> = (0..10).map(|_| backoff.try_attempt(false)).collect();
        assert_eq!(
            attempts,
            vec![false, false, false, false, true, false, false, false, false, true]
        );
    }

    #[test]
    fn test_force_bypasses_gate() {
        let mut backoff = ReconnectBackoff::default();
        for _ in 0..5 {
            backoff.record_failure();
        }
        assert!(!backoff.try_attempt(false));
        assert!(backoff.try_attempt(true));
        assert_eq!(backoff.skipped(), 0);
    }

    #[test]
    fn test_reset_after_open() {
        let mut backoff = ReconnectBackoff::default();
        for _ in 0..20 {
            backoff.record_failure();
        }
        assert_eq!(backoff.counter(), 512);

        backoff.reset();
        assert_eq!(backoff.counter(), 0);
        assert_eq!(backoff.skipped(), 0);
    }
}
