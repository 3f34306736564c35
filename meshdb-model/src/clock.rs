//! Lamport clocks for event ordering
//!
//! Each database instance carries two independent clocks: one for
//! network join/leave events and one for table entry events. The
//! ordering contract is per-author: two events authored by the same
//! node compare by their logical time.

use std::sync::atomic::{AtomicU64, Ordering};

/// An atomic Lamport clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Current time without advancing the clock.
    pub fn time(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Advance the clock and return the new timestamp.
    pub fn increment(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Observe a remote timestamp: advance to `max(local, remote) + 1`
    /// when the remote time is ahead.
    pub fn witness(&self, remote: u64) {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            if remote < current {
                return;
            }
            match self.counter.compare_exchange(
                current,
                remote + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Clone for LamportClock {
    fn clone(&self) -> Self {
        Self {
            counter: AtomicU64::new(self.time()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_is_monotone() {
        let clock = LamportClock::new();
        assert_eq!(clock.time(), 0);
        assert_eq!(clock.increment(), 1);
        assert_eq!(clock.increment(), 2);
        assert_eq!(clock.time(), 2);
    }

    #[test]
    fn witness_advances_past_remote() {
        let clock = LamportClock::new();
        clock.witness(10);
        assert_eq!(clock.time(), 11);
        // Stale remote times are ignored
        clock.witness(5);
        assert_eq!(clock.time(), 11);
        // Equal remote time still advances
        clock.witness(11);
        assert_eq!(clock.time(), 12);
    }

    #[test]
    fn witness_then_increment_orders_after_remote() {
        let clock = LamportClock::new();
        clock.witness(41);
        assert!(clock.increment() > 41);
    }
}
