//! Allocation backends.
//!
//! Everything that owns device memory or native objects lives here. These
//! are the only modules that contain `unsafe` code.

pub(crate) mod arena;
pub mod buffer_pool;
pub mod cmd_buffer;
pub mod deferred;
pub mod device_memory;
pub mod fence;
pub mod frame;
pub(crate) mod free_list;
pub mod resource_heap;
pub mod staging;

pub use buffer_pool::{BufferPool, BufferPoolStats, BufferSuballocation};
pub use cmd_buffer::CmdBuffer;
pub use deferred::{DeferredDeletionQueue, DeferredPayload};
pub use device_memory::{DeviceMemoryAllocation, DeviceMemoryManager, HeapUsage};
pub use fence::{Fence, FenceManager, FenceState, FenceStats};
pub use frame::{FrameScratchAllocator, ScratchAllocation, ScratchStats};
pub use free_list::{FreeListAllocation, FreeListAllocator, FreeRange};
pub use resource_heap::{HeapManager, PageSuballocation, ResourceHeap, ResourceHeapStats};
pub use staging::{StagingBuffer, StagingManager, StagingStats};
