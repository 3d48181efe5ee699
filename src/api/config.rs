//! Allocator configuration.

use crate::gpu::{BufferUsage, DeviceSize};
use crate::util::size::{kb, mb};

/// Frames an empty page cools down before its memory is returned.
///
/// Mobile drivers are slow to reclaim, so pages go back sooner there.
pub const DEFAULT_PAGE_COOLDOWN_FRAMES: u64 = if cfg!(target_os = "android") { 3 } else { 20 };

/// Configuration for a [`GpuMemory`](crate::GpuMemory) context.
#[derive(Debug, Clone)]
pub struct GpuAllocConfig {
    /// Minimum page size for device-local heaps (default: 64 MB)
    pub device_local_page_size: DeviceSize,

    /// Minimum page size for host-visible heaps (default: 16 MB)
    pub host_visible_page_size: DeviceSize,

    /// Minimum size of a pooled native buffer (default: 1 MB)
    pub buffer_allocation_size: DeviceSize,

    /// Frames an empty page waits before being destroyed
    pub page_cooldown_frames: u64,

    /// Frames an idle staging buffer waits before being destroyed
    pub staging_free_frames: u64,

    /// Number of scratch slots, one per frame in flight
    pub frames_in_flight: usize,

    /// Initial size of each scratch tape (default: 256 KB)
    pub scratch_initial_size: DeviceSize,

    /// Usage of the scratch tapes
    pub scratch_usage: BufferUsage,

    /// Timeout used by blocking fence waits, in nanoseconds
    pub default_fence_timeout_ns: u64,
}

impl Default for GpuAllocConfig {
    fn default() -> Self {
        Self {
            device_local_page_size: mb(64),
            host_visible_page_size: mb(16),
            buffer_allocation_size: mb(1),
            page_cooldown_frames: DEFAULT_PAGE_COOLDOWN_FRAMES,
            staging_free_frames: 10,
            frames_in_flight: 3,
            scratch_initial_size: kb(256),
            scratch_usage: BufferUsage::UNIFORM_BUFFER
                | BufferUsage::VERTEX_BUFFER
                | BufferUsage::INDEX_BUFFER,
            default_fence_timeout_ns: 1_000_000_000,
        }
    }
}

impl GpuAllocConfig {
    /// Create a minimal config for testing or constrained environments.
    pub fn minimal() -> Self {
        Self {
            device_local_page_size: mb(1),
            host_visible_page_size: kb(256),
            buffer_allocation_size: kb(64),
            page_cooldown_frames: 2,
            staging_free_frames: 2,
            frames_in_flight: 2,
            scratch_initial_size: kb(16),
            ..Self::default()
        }
    }

    /// Create a config for large scenes that favour fewer, bigger containers.
    pub fn high_performance() -> Self {
        Self {
            device_local_page_size: mb(256),
            host_visible_page_size: mb(64),
            buffer_allocation_size: mb(4),
            frames_in_flight: 3,
            scratch_initial_size: mb(4),
            ..Self::default()
        }
    }

    /// Builder pattern: set the device-local page size.
    pub fn with_device_local_page_size(mut self, size: DeviceSize) -> Self {
        self.device_local_page_size = size;
        self
    }

    /// Builder pattern: set the host-visible page size.
    pub fn with_host_visible_page_size(mut self, size: DeviceSize) -> Self {
        self.host_visible_page_size = size;
        self
    }

    /// Builder pattern: set the pooled buffer size.
    pub fn with_buffer_allocation_size(mut self, size: DeviceSize) -> Self {
        self.buffer_allocation_size = size;
        self
    }

    /// Builder pattern: set the page cooldown.
    pub fn with_page_cooldown_frames(mut self, frames: u64) -> Self {
        self.page_cooldown_frames = frames;
        self
    }

    /// Builder pattern: set the staging idle lifetime.
    pub fn with_staging_free_frames(mut self, frames: u64) -> Self {
        self.staging_free_frames = frames;
        self
    }

    /// Builder pattern: set the number of frames in flight (at least 1).
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    /// Builder pattern: set the initial scratch tape size.
    pub fn with_scratch_initial_size(mut self, size: DeviceSize) -> Self {
        self.scratch_initial_size = size;
        self
    }

    /// Builder pattern: set the scratch tape usage.
    pub fn with_scratch_usage(mut self, usage: BufferUsage) -> Self {
        self.scratch_usage = usage;
        self
    }

    /// Builder pattern: set the blocking fence timeout.
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.default_fence_timeout_ns = timeout_ns;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let default = GpuAllocConfig::default();
        let minimal = GpuAllocConfig::minimal();
        let fast = GpuAllocConfig::high_performance();

        assert!(minimal.device_local_page_size < default.device_local_page_size);
        assert!(fast.device_local_page_size > default.device_local_page_size);
        assert_eq!(default.page_cooldown_frames, DEFAULT_PAGE_COOLDOWN_FRAMES);
    }

    #[test]
    fn test_builders() {
        let config = GpuAllocConfig::minimal()
            .with_frames_in_flight(0)
            .with_page_cooldown_frames(7)
            .with_buffer_allocation_size(kb(8));
        assert_eq!(config.frames_in_flight, 1);
        assert_eq!(config.page_cooldown_frames, 7);
        assert_eq!(config.buffer_allocation_size, 8192);
    }
}
