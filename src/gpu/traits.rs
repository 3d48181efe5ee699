//! GPU device contract and shared types.
//!
//! This module defines the interface the allocator expects from a native
//! graphics device WITHOUT pulling in any backend-specific dependencies, so
//! every pool depends on traits, not implementations.

use std::fmt;
use std::ptr::NonNull;

/// Byte sizes and offsets on the device.
pub type DeviceSize = u64;

/// Errors that can occur during GPU allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuAllocError {
    /// The driver refused a raw memory allocation.
    OutOfDeviceMemory,
    /// The allocation would exceed the size reported for a device heap.
    HeapExhausted { heap_index: u32 },
    /// No memory type satisfies the requested properties.
    NoSuitableMemoryType,
    /// Zero or otherwise unusable size.
    InvalidSize,
    /// Host mapping of device memory failed.
    MappingFailed,
    /// Backend-specific error (opaque).
    Backend(String),
}

impl fmt::Display for GpuAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuAllocError::OutOfDeviceMemory => write!(f, "GPU out of device memory"),
            GpuAllocError::HeapExhausted { heap_index } => {
                write!(f, "device heap {} exhausted", heap_index)
            }
            GpuAllocError::NoSuitableMemoryType => {
                write!(f, "no memory type matches the requested properties")
            }
            GpuAllocError::InvalidSize => write!(f, "Invalid allocation size"),
            GpuAllocError::MappingFailed => write!(f, "Failed to map device memory"),
            GpuAllocError::Backend(msg) => write!(f, "Backend error: {}", msg),
        }
    }
}

impl std::error::Error for GpuAllocError {}

impl GpuAllocError {
    /// True for errors that mean "this heap is full", which a caller may
    /// answer by trying another memory type.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, GpuAllocError::OutOfDeviceMemory | GpuAllocError::HeapExhausted { .. })
    }
}

macro_rules! flag_ops {
    ($name:ident) => {
        impl $name {
            /// No bits set.
            pub const fn empty() -> Self {
                Self { bits: 0 }
            }

            /// Build from raw backend bits.
            pub const fn from_raw(bits: u32) -> Self {
                Self { bits }
            }

            /// Raw backend bits.
            pub const fn as_raw(&self) -> u32 {
                self.bits
            }

            /// True if every bit of `other` is set in `self`.
            pub const fn contains(&self, other: Self) -> bool {
                self.bits & other.bits == other.bits
            }

            /// True if any bit of `other` is set in `self`.
            pub const fn intersects(&self, other: Self) -> bool {
                self.bits & other.bits != 0
            }

            /// True if no bits are set.
            pub const fn is_empty(&self) -> bool {
                self.bits == 0
            }

            /// `self` with the bits of `other` cleared.
            pub const fn without(&self, other: Self) -> Self {
                Self { bits: self.bits & !other.bits }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self { bits: self.bits | rhs.bits }
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.bits |= rhs.bits;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self { bits: self.bits & rhs.bits }
            }
        }
    };
}

/// Buffer usage flags. Bit values match Vulkan's `VkBufferUsageFlagBits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferUsage {
    pub bits: u32,
}

impl BufferUsage {
    pub const TRANSFER_SRC: Self = Self { bits: 0x0001 };
    pub const TRANSFER_DST: Self = Self { bits: 0x0002 };
    pub const UNIFORM_TEXEL_BUFFER: Self = Self { bits: 0x0004 };
    pub const STORAGE_TEXEL_BUFFER: Self = Self { bits: 0x0008 };
    pub const UNIFORM_BUFFER: Self = Self { bits: 0x0010 };
    pub const STORAGE_BUFFER: Self = Self { bits: 0x0020 };
    pub const INDEX_BUFFER: Self = Self { bits: 0x0040 };
    pub const VERTEX_BUFFER: Self = Self { bits: 0x0080 };
    pub const INDIRECT_BUFFER: Self = Self { bits: 0x0100 };
}

flag_ops!(BufferUsage);

/// Memory property flags. Bit values match Vulkan's `VkMemoryPropertyFlagBits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryPropertyFlags {
    pub bits: u32,
}

impl MemoryPropertyFlags {
    pub const DEVICE_LOCAL: Self = Self { bits: 0x0001 };
    pub const HOST_VISIBLE: Self = Self { bits: 0x0002 };
    pub const HOST_COHERENT: Self = Self { bits: 0x0004 };
    pub const HOST_CACHED: Self = Self { bits: 0x0008 };
    pub const LAZILY_ALLOCATED: Self = Self { bits: 0x0010 };
}

flag_ops!(MemoryPropertyFlags);

/// GPU memory intent - expresses WHAT the memory will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuMemoryIntent {
    /// GPU-only access, fastest for shaders.
    DeviceOnly,
    /// CPU writes every frame, GPU reads (upload heap).
    HostVisible,
    /// CPU reads back what the GPU wrote (download heap).
    HostCached,
    /// Temporary CPU→GPU transfer buffer.
    Staging,
    /// Temporary GPU→CPU transfer buffer.
    Readback,
}

impl GpuMemoryIntent {
    /// Memory properties requested for this intent.
    pub fn memory_properties(&self) -> MemoryPropertyFlags {
        match self {
            GpuMemoryIntent::DeviceOnly => MemoryPropertyFlags::DEVICE_LOCAL,
            GpuMemoryIntent::HostVisible | GpuMemoryIntent::Staging => {
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT
            }
            GpuMemoryIntent::HostCached | GpuMemoryIntent::Readback => {
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED
            }
        }
    }

    /// Whether allocations with this intent are persistently mapped.
    pub fn wants_mapped(&self) -> bool {
        !matches!(self, GpuMemoryIntent::DeviceOnly)
    }
}

/// Raw device memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceMemoryHandle(pub u64);

/// Raw buffer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Raw fence object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FenceHandle(pub u64);

/// Every native object kind that can be handed to deferred deletion.
///
/// Destruction dispatches with an exhaustive `match` on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeHandle {
    Buffer(BufferHandle),
    BufferView(u64),
    Image(u64),
    ImageView(u64),
    Pipeline(u64),
    PipelineLayout(u64),
    Sampler(u64),
    ShaderModule(u64),
    Framebuffer(u64),
    RenderPass(u64),
    DescriptorSetLayout(u64),
    QueryPool(u64),
    Semaphore(u64),
    Event(u64),
    Fence(FenceHandle),
    DeviceMemory(DeviceMemoryHandle),
}

impl NativeHandle {
    /// Short name of the handle kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            NativeHandle::Buffer(_) => "buffer",
            NativeHandle::BufferView(_) => "buffer view",
            NativeHandle::Image(_) => "image",
            NativeHandle::ImageView(_) => "image view",
            NativeHandle::Pipeline(_) => "pipeline",
            NativeHandle::PipelineLayout(_) => "pipeline layout",
            NativeHandle::Sampler(_) => "sampler",
            NativeHandle::ShaderModule(_) => "shader module",
            NativeHandle::Framebuffer(_) => "framebuffer",
            NativeHandle::RenderPass(_) => "render pass",
            NativeHandle::DescriptorSetLayout(_) => "descriptor set layout",
            NativeHandle::QueryPool(_) => "query pool",
            NativeHandle::Semaphore(_) => "semaphore",
            NativeHandle::Event(_) => "event",
            NativeHandle::Fence(_) => "fence",
            NativeHandle::DeviceMemory(_) => "device memory",
        }
    }
}

/// Size/alignment/type requirements reported for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    /// Bit `i` set means memory type `i` may back the resource.
    pub memory_type_bits: u32,
}

/// One memory type exposed by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

/// One physical memory heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: DeviceSize,
    pub device_local: bool,
}

/// Memory types and heaps reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
}

impl MemoryProperties {
    /// First memory type allowed by `type_bits` that has all of `properties`.
    pub fn find_memory_type(&self, type_bits: u32, properties: MemoryPropertyFlags) -> Option<u32> {
        self.find_memory_type_excluding(type_bits, properties, None)
    }

    /// Same as [`find_memory_type`](Self::find_memory_type) but skips `exclude`.
    pub fn find_memory_type_excluding(
        &self,
        type_bits: u32,
        properties: MemoryPropertyFlags,
        exclude: Option<u32>,
    ) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .take(32)
            .find(|(index, memory_type)| {
                let index = *index as u32;
                type_bits & (1 << index) != 0
                    && Some(index) != exclude
                    && memory_type.property_flags.contains(properties)
            })
            .map(|(index, _)| index as u32)
    }

    /// Properties of a memory type.
    pub fn type_properties(&self, memory_type_index: u32) -> MemoryPropertyFlags {
        self.memory_types
            .get(memory_type_index as usize)
            .map(|t| t.property_flags)
            .unwrap_or_default()
    }

    /// Heap backing a memory type.
    pub fn heap_index(&self, memory_type_index: u32) -> Option<u32> {
        self.memory_types
            .get(memory_type_index as usize)
            .map(|t| t.heap_index)
    }
}

/// Device limits the allocator honours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Advisory cap on simultaneous raw allocations.
    pub max_memory_allocation_count: u32,
    pub min_uniform_buffer_offset_alignment: DeviceSize,
    pub min_storage_buffer_offset_alignment: DeviceSize,
    pub min_texel_buffer_offset_alignment: DeviceSize,
    /// Flush/invalidate granularity for non-coherent memory.
    pub non_coherent_atom_size: DeviceSize,
    pub buffer_image_granularity: DeviceSize,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        // Vulkan's guaranteed minimums.
        Self {
            max_memory_allocation_count: 4096,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 256,
            min_texel_buffer_offset_alignment: 256,
            non_coherent_atom_size: 256,
            buffer_image_granularity: 131072,
        }
    }
}

impl DeviceLimits {
    /// Minimum bind-offset alignment for a buffer of the given usage.
    pub fn buffer_offset_alignment(&self, usage: BufferUsage) -> DeviceSize {
        let mut alignment = 1;
        if usage.intersects(BufferUsage::UNIFORM_BUFFER) {
            alignment = alignment.max(self.min_uniform_buffer_offset_alignment);
        }
        if usage.intersects(BufferUsage::STORAGE_BUFFER) {
            alignment = alignment.max(self.min_storage_buffer_offset_alignment);
        }
        if usage.intersects(BufferUsage::UNIFORM_TEXEL_BUFFER | BufferUsage::STORAGE_TEXEL_BUFFER) {
            alignment = alignment.max(self.min_texel_buffer_offset_alignment);
        }
        alignment
    }
}

/// The native device as seen by the allocator.
///
/// Implementations must be thread-safe: pools call into the device from
/// whichever thread releases or allocates. No method is called while a pool
/// lock is held, except the cheap, non-blocking ones (`fence_status`,
/// `memory_properties`, `limits`).
pub trait GpuDevice: Send + Sync {
    /// Memory types and heaps.
    fn memory_properties(&self) -> &MemoryProperties;

    /// Alignment and count limits.
    fn limits(&self) -> &DeviceLimits;

    /// Allocate raw memory of the given type.
    fn allocate_memory(&self, size: DeviceSize, memory_type_index: u32) -> Result<DeviceMemoryHandle, GpuAllocError>;

    /// Return raw memory to the driver.
    fn free_memory(&self, memory: DeviceMemoryHandle);

    /// Map `[offset, offset + size)` of host-visible memory.
    fn map_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<NonNull<u8>, GpuAllocError>;

    /// Unmap previously mapped memory.
    fn unmap_memory(&self, memory: DeviceMemoryHandle);

    /// Make host writes visible to the device (non-coherent memory only).
    fn flush_mapped_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<(), GpuAllocError>;

    /// Make device writes visible to the host (non-coherent memory only).
    fn invalidate_mapped_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<(), GpuAllocError>;

    /// Create an unbound buffer and report its memory requirements.
    fn create_buffer(&self, size: DeviceSize, usage: BufferUsage) -> Result<(BufferHandle, MemoryRequirements), GpuAllocError>;

    /// Bind a buffer to memory at `offset`.
    fn bind_buffer_memory(&self, buffer: BufferHandle, memory: DeviceMemoryHandle, offset: DeviceSize) -> Result<(), GpuAllocError>;

    /// Destroy a buffer.
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Create a fence, optionally already signaled.
    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, GpuAllocError>;

    /// Destroy a fence.
    fn destroy_fence(&self, fence: FenceHandle);

    /// Non-blocking status query; `true` when signaled.
    fn fence_status(&self, fence: FenceHandle) -> Result<bool, GpuAllocError>;

    /// Block up to `timeout_ns`; `Ok(false)` on timeout.
    fn wait_for_fence(&self, fence: FenceHandle, timeout_ns: u64) -> Result<bool, GpuAllocError>;

    /// Return a fence to the unsignaled state.
    fn reset_fence(&self, fence: FenceHandle) -> Result<(), GpuAllocError>;

    /// Destroy any native object.
    fn destroy_object(&self, handle: NativeHandle) {
        match handle {
            NativeHandle::Buffer(buffer) => self.destroy_buffer(buffer),
            NativeHandle::Fence(fence) => self.destroy_fence(fence),
            NativeHandle::DeviceMemory(memory) => self.free_memory(memory),
            NativeHandle::BufferView(_)
            | NativeHandle::Image(_)
            | NativeHandle::ImageView(_)
            | NativeHandle::Pipeline(_)
            | NativeHandle::PipelineLayout(_)
            | NativeHandle::Sampler(_)
            | NativeHandle::ShaderModule(_)
            | NativeHandle::Framebuffer(_)
            | NativeHandle::RenderPass(_)
            | NativeHandle::DescriptorSetLayout(_)
            | NativeHandle::QueryPool(_)
            | NativeHandle::Semaphore(_)
            | NativeHandle::Event(_) => self.destroy_other(handle),
        }
    }

    /// Destroy object kinds the allocator itself never creates.
    fn destroy_other(&self, handle: NativeHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> MemoryProperties {
        MemoryProperties {
            memory_types: vec![
                MemoryType { property_flags: MemoryPropertyFlags::DEVICE_LOCAL, heap_index: 0 },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: MemoryPropertyFlags::HOST_VISIBLE
                        | MemoryPropertyFlags::HOST_COHERENT
                        | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap { size: 1 << 30, device_local: true },
                MemoryHeap { size: 1 << 28, device_local: false },
            ],
        }
    }

    #[test]
    fn test_find_memory_type() {
        let props = props();
        assert_eq!(props.find_memory_type(!0, MemoryPropertyFlags::DEVICE_LOCAL), Some(0));
        assert_eq!(props.find_memory_type(!0, MemoryPropertyFlags::HOST_VISIBLE), Some(1));
        assert_eq!(
            props.find_memory_type(!0, MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED),
            Some(2)
        );
        // Type bits restrict the candidates.
        assert_eq!(props.find_memory_type(0b100, MemoryPropertyFlags::HOST_VISIBLE), Some(2));
        assert_eq!(props.find_memory_type(0b001, MemoryPropertyFlags::HOST_VISIBLE), None);
        assert_eq!(
            props.find_memory_type_excluding(!0, MemoryPropertyFlags::HOST_VISIBLE, Some(1)),
            Some(2)
        );
    }

    #[test]
    fn test_buffer_offset_alignment() {
        let limits = DeviceLimits {
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            min_texel_buffer_offset_alignment: 16,
            ..DeviceLimits::default()
        };
        assert_eq!(limits.buffer_offset_alignment(BufferUsage::VERTEX_BUFFER), 1);
        assert_eq!(limits.buffer_offset_alignment(BufferUsage::STORAGE_BUFFER), 64);
        assert_eq!(
            limits.buffer_offset_alignment(BufferUsage::UNIFORM_BUFFER | BufferUsage::STORAGE_BUFFER),
            256
        );
    }

    #[test]
    fn test_destroy_object_routes_every_kind() {
        use crate::gpu::DummyDevice;

        let device = DummyDevice::new();
        let fence = device.create_fence(false).unwrap();
        let (buffer, _) = device.create_buffer(64, BufferUsage::VERTEX_BUFFER).unwrap();
        device.destroy_object(NativeHandle::Fence(fence));
        device.destroy_object(NativeHandle::Buffer(buffer));
        assert_eq!(device.live_fence_count(), 0);
        assert_eq!(device.live_buffer_count(), 0);

        for handle in [
            NativeHandle::BufferView(1),
            NativeHandle::Image(2),
            NativeHandle::RenderPass(3),
            NativeHandle::Event(4),
        ] {
            device.destroy_object(handle);
            assert!(device.was_destroyed(handle));
        }
    }

    #[test]
    fn test_flag_ops() {
        let flags = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED;
        assert!(flags.contains(MemoryPropertyFlags::HOST_CACHED));
        assert!(!flags.contains(MemoryPropertyFlags::DEVICE_LOCAL));
        assert_eq!(flags.without(MemoryPropertyFlags::HOST_CACHED), MemoryPropertyFlags::HOST_VISIBLE);
    }

    #[test]
    fn test_intent_properties() {
        assert!(!GpuMemoryIntent::DeviceOnly.wants_mapped());
        assert!(GpuMemoryIntent::Readback
            .memory_properties()
            .contains(MemoryPropertyFlags::HOST_CACHED));
    }
}
