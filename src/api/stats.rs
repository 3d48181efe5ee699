//! Allocation statistics.

use crate::allocators::{
    BufferPoolStats, FenceStats, HeapUsage, ResourceHeapStats, ScratchStats, StagingStats,
};
use crate::gpu::DeviceSize;
use crate::util::size::format_bytes;

/// A point-in-time view of every pool in a [`GpuMemory`](crate::GpuMemory).
#[derive(Debug, Clone, Default)]
pub struct GpuMemoryStats {
    /// Frame the snapshot was taken in.
    pub frame: u64,

    /// Raw device usage per heap.
    pub heaps: Vec<HeapUsage>,

    /// Live raw device allocations.
    pub device_allocation_count: u32,

    /// Resource heaps that own at least one page.
    pub resource_heaps: Vec<ResourceHeapStats>,

    pub buffer_pool: BufferPoolStats,

    pub staging: StagingStats,

    pub fences: FenceStats,

    /// Native objects waiting in the deferred deletion queue.
    pub deferred_deletions: usize,

    pub scratch: ScratchStats,
}

impl GpuMemoryStats {
    /// Bytes of raw device memory in use across every heap.
    pub fn total_device_bytes(&self) -> DeviceSize {
        self.heaps.iter().map(|h| h.used_bytes).sum()
    }

    /// Bytes held by pages and pooled buffers but not handed out.
    pub fn reserved_unused_bytes(&self) -> DeviceSize {
        let pages: DeviceSize = self
            .resource_heaps
            .iter()
            .map(|h| h.reserved_bytes.saturating_sub(h.live_bytes))
            .sum();
        pages
            + self
                .buffer_pool
                .reserved_bytes
                .saturating_sub(self.buffer_pool.live_bytes)
    }

    /// Fraction of pooled bytes not handed out, 0.0 when nothing is pooled.
    pub fn fragmentation_ratio(&self) -> f64 {
        let reserved: DeviceSize = self.resource_heaps.iter().map(|h| h.reserved_bytes).sum::<DeviceSize>()
            + self.buffer_pool.reserved_bytes;
        if reserved == 0 {
            return 0.0;
        }
        self.reserved_unused_bytes() as f64 / reserved as f64
    }
}

impl std::fmt::Display for GpuMemoryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "GPU Memory Statistics (frame {}):", self.frame)?;
        writeln!(
            f,
            "  Device:        {} in {} allocations",
            format_bytes(self.total_device_bytes()),
            self.device_allocation_count
        )?;
        for heap in &self.heaps {
            writeln!(
                f,
                "    heap {}{}: {} / {} (peak {})",
                heap.heap_index,
                if heap.device_local { " [device-local]" } else { "" },
                format_bytes(heap.used_bytes),
                format_bytes(heap.heap_size),
                format_bytes(heap.peak_bytes),
            )?;
        }
        for heap in &self.resource_heaps {
            writeln!(
                f,
                "  Pages type {}: {} used / {} free, {} live of {} ({} suballocations)",
                heap.memory_type_index,
                heap.used_pages,
                heap.free_pages,
                format_bytes(heap.live_bytes),
                format_bytes(heap.reserved_bytes),
                heap.live_suballocations,
            )?;
        }
        writeln!(
            f,
            "  Buffers:       {} buffers, {} live of {} ({} suballocations)",
            self.buffer_pool.buffers,
            format_bytes(self.buffer_pool.live_bytes),
            format_bytes(self.buffer_pool.reserved_bytes),
            self.buffer_pool.live_suballocations,
        )?;
        writeln!(
            f,
            "  Staging:       {} used ({}), {} pending ({}), {} free ({}), peak {}",
            self.staging.used_buffers,
            format_bytes(self.staging.used_bytes),
            self.staging.pending_buffers,
            format_bytes(self.staging.pending_bytes),
            self.staging.free_buffers,
            format_bytes(self.staging.free_bytes),
            format_bytes(self.staging.peak_used_bytes),
        )?;
        writeln!(
            f,
            "  Scratch:       slot {}/{}, {} used, {} of tape",
            self.scratch.current_slot,
            self.scratch.slots,
            format_bytes(self.scratch.used_bytes),
            format_bytes(self.scratch.tape_bytes),
        )?;
        writeln!(
            f,
            "  Fences:        {} in use, {} pooled, {} retiring",
            self.fences.in_use, self.fences.free, self.fences.retiring
        )?;
        writeln!(f, "  Deferred:      {} pending", self.deferred_deletions)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragmentation_ratio() {
        let mut stats = GpuMemoryStats::default();
        assert_eq!(stats.fragmentation_ratio(), 0.0);

        stats.resource_heaps.push(ResourceHeapStats {
            memory_type_index: 0,
            used_pages: 1,
            free_pages: 0,
            reserved_bytes: 1000,
            live_bytes: 250,
            live_suballocations: 2,
        });
        stats.buffer_pool.reserved_bytes = 1000;
        stats.buffer_pool.live_bytes = 750;

        assert_eq!(stats.reserved_unused_bytes(), 1000);
        assert!((stats.fragmentation_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_display_lists_heaps() {
        let stats = GpuMemoryStats {
            heaps: vec![HeapUsage {
                heap_index: 0,
                device_local: true,
                heap_size: 1 << 30,
                used_bytes: 1 << 20,
                peak_bytes: 1 << 20,
                allocation_count: 1,
            }],
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.contains("heap 0 [device-local]"));
        assert!(text.contains("Deferred:"));
    }
}
