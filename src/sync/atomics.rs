//! Atomic helpers for statistics and counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing atomic counter.
#[derive(Debug)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create a new counter.
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Increment the counter, returning the new value.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// An atomic gauge for byte totals that go up and down, with a high-water mark.
#[derive(Debug, Default)]
pub struct AtomicGauge {
    current: AtomicU64,
    peak: AtomicU64,
}

impl AtomicGauge {
    /// Create a new gauge at zero.
    pub const fn new() -> Self {
        Self {
            current: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    /// Add to the gauge, returning the new value.
    pub fn add(&self, value: u64) -> u64 {
        let now = self.current.fetch_add(value, Ordering::Relaxed) + value;
        self.peak.fetch_max(now, Ordering::Relaxed);
        now
    }

    /// Subtract from the gauge, returning the new value.
    pub fn sub(&self, value: u64) -> u64 {
        let prev = self.current.fetch_sub(value, Ordering::Relaxed);
        debug_assert!(prev >= value, "gauge underflow: {} - {}", prev, value);
        prev.saturating_sub(value)
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Get the high-water mark.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = AtomicCounter::new(4);
        assert_eq!(counter.increment(), 5);
        assert_eq!(counter.increment(), 6);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge_peak() {
        let gauge = AtomicGauge::new();
        gauge.add(100);
        gauge.add(50);
        gauge.sub(120);
        assert_eq!(gauge.get(), 30);
        assert_eq!(gauge.peak(), 150);
    }
}
