//! # gpualloc
//!
//! GPU memory and transient-resource allocation for graphics backends.
//!
//! ## Features
//!
//! - Free-list suballocation of large device memory pages
//! - Pooled buffers classified by usage and memory properties
//! - Fence-gated staging and readback buffers
//! - Per-frame scratch tapes, one per frame in flight
//! - Deferred destruction of native objects until the GPU catches up
//! - Memory-type fallback, heap accounting and leak diagnostics
//!
//! Nothing is destroyed while in-flight GPU work may still use it: every
//! delayed release records the fence counter its command buffer will reach
//! and waits for it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gpualloc::{BufferUsage, DummyDevice, GpuAllocConfig, GpuMemory, MemoryPropertyFlags};
//!
//! let memory = GpuMemory::new(Arc::new(DummyDevice::new()), GpuAllocConfig::default())?;
//! let cmd = memory.create_cmd_buffer();
//!
//! // Frame loop
//! let upload = memory.acquire_staging_buffer(1024)?;
//! upload.write(0, &[1, 2, 3, 4])?;
//! let _fence = memory.submit(&cmd)?;
//! memory.release_staging_buffer(Some(&cmd), upload);
//! memory.tick();
//! # Ok::<(), gpualloc::GpuAllocError>(())
//! ```

pub mod allocators;
pub mod api;
pub mod diagnostics;
pub mod gpu;

mod core;
#[allow(dead_code)]
mod sync;
#[allow(dead_code)]
mod util;

#[cfg(feature = "debug")]
pub(crate) mod debug;

// Re-export public API at crate root for convenience
pub use api::config::{GpuAllocConfig, DEFAULT_PAGE_COOLDOWN_FRAMES};
pub use api::context::GpuMemory;
pub use api::stats::GpuMemoryStats;
pub use crate::core::FrameClock;

pub use allocators::{
    BufferPool, BufferPoolStats, BufferSuballocation, CmdBuffer, DeferredDeletionQueue,
    DeferredPayload, DeviceMemoryAllocation, DeviceMemoryManager, Fence, FenceManager, FenceState,
    FenceStats, FrameScratchAllocator, FreeListAllocation, FreeListAllocator, FreeRange,
    HeapManager, HeapUsage, PageSuballocation, ResourceHeap, ResourceHeapStats, ScratchAllocation,
    ScratchStats, StagingBuffer, StagingManager, StagingStats,
};

pub use gpu::{
    BufferHandle, BufferUsage, DeviceLimits, DeviceMemoryHandle, DeviceSize, DummyDevice,
    FenceHandle, GpuAllocError, GpuDevice, GpuMemoryIntent, MemoryHeap, MemoryProperties,
    MemoryPropertyFlags, MemoryRequirements, MemoryType, NativeHandle,
};

// Diagnostics
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, CollectingSink};
pub use diagnostics::{StrictMode, set_strict_mode, StrictModeGuard};
pub use diagnostics::{MemoryEvent, ProfilerHooks};
pub use diagnostics::{GA001, GA002, GA101, GA102, GA103, GA301, GA401, GA402, GA403, GA404, GA901};

#[cfg(feature = "gpu-vulkan")]
pub use gpu::vulkan::AshDevice;
