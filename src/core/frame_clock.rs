//! Shared frame counter.
//!
//! Pools stamp released containers with the current frame and compare stamps
//! against it to decide when cooldowns expire.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic frame number shared by every pool of one context.
#[derive(Debug, Default)]
pub struct FrameClock {
    frame: AtomicU64,
}

impl FrameClock {
    pub const fn new() -> Self {
        Self {
            frame: AtomicU64::new(0),
        }
    }

    /// Current frame number.
    #[inline]
    pub fn current(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// Move to the next frame, returning its number.
    pub fn advance(&self) -> u64 {
        self.frame.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Frames elapsed since `stamp`.
    #[inline]
    pub fn frames_since(&self, stamp: u64) -> u64 {
        self.current().saturating_sub(stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance() {
        let clock = FrameClock::new();
        assert_eq!(clock.current(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.frames_since(1), 1);
        assert_eq!(clock.frames_since(5), 0);
    }
}
