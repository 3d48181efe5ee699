//! Device abstraction.
//!
//! The allocators only talk to the GPU through [`GpuDevice`]. Two
//! implementations ship with the crate:
//! - [`DummyDevice`]: RAM-backed, always available, used by the tests
//! - `vulkan::AshDevice`: via the `ash` crate (enable the `gpu-vulkan` feature)

pub mod traits;
pub use traits::{
    BufferHandle, BufferUsage, DeviceLimits, DeviceMemoryHandle, DeviceSize, FenceHandle,
    GpuAllocError, GpuDevice, GpuMemoryIntent, MemoryHeap, MemoryPropertyFlags,
    MemoryProperties, MemoryRequirements, MemoryType, NativeHandle,
};

pub mod dummy;
pub use dummy::DummyDevice;

#[cfg(feature = "gpu-vulkan")]
pub mod vulkan;
