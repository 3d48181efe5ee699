//! Profiler integration for device memory visualization.
//!
//! Callbacks receive every raw device allocation, free and frame boundary.
//! When the `tracy` feature is enabled, frame boundaries are also forwarded to
//! a running Tracy client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[cfg(feature = "tracy")]
pub use tracy_client;

/// Memory event for external profilers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    /// A raw device allocation was made.
    Alloc {
        handle: u64,
        size: u64,
        memory_type_index: u32,
    },
    /// A raw device allocation was returned to the driver.
    Free {
        handle: u64,
        size: u64,
        memory_type_index: u32,
    },
    /// Frame boundary.
    FrameMark {
        frame_number: u64,
    },
}

/// Callback type for external profiler integration.
pub type ProfilerCallback = Arc<dyn Fn(&MemoryEvent) + Send + Sync>;

/// Profiler hooks for external tools.
#[derive(Default)]
pub struct ProfilerHooks {
    callback: RwLock<Option<ProfilerCallback>>,
    enabled: AtomicBool,
}

impl ProfilerHooks {
    /// Create new profiler hooks with no callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the profiler callback and enable the hooks.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&MemoryEvent) + Send + Sync + 'static,
    {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
        self.enabled.store(true, Ordering::Release);
    }

    /// Enable or disable event delivery.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Check if events are being delivered.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Deliver an event to the callback.
    pub fn emit(&self, event: MemoryEvent) {
        if !self.is_enabled() {
            return;
        }
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&event);
        }
    }

    /// Emit a frame mark, forwarding it to Tracy when enabled.
    pub fn emit_frame_mark(&self, frame_number: u64) {
        #[cfg(feature = "tracy")]
        if let Some(client) = tracy_client::Client::running() {
            client.frame_mark();
        }

        self.emit(MemoryEvent::FrameMark { frame_number });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_profiler_hooks() {
        let hooks = ProfilerHooks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        hooks.set_callback(move |_event| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        hooks.emit(MemoryEvent::Alloc { handle: 1, size: 64, memory_type_index: 0 });
        hooks.emit(MemoryEvent::Free { handle: 1, size: 64, memory_type_index: 0 });
        hooks.emit_frame_mark(1);

        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_disabled_hooks() {
        let hooks = ProfilerHooks::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        hooks.set_callback(move |_event| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        hooks.set_enabled(false);
        hooks.emit_frame_mark(3);

        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }
}
