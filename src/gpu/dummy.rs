//! Dummy GPU device for testing.
//!
//! Host-visible memory is backed by heap storage so mapped pointers are real
//! and writable; device-local memory only records its size. Fences are
//! signaled by the test, which stands in for GPU progress.

use std::collections::HashMap;
use std::ptr::NonNull;

use super::traits::*;
use crate::sync::mutex::Mutex;

struct DummyMemory {
    size: DeviceSize,
    memory_type_index: u32,
    /// Present for host-visible memory types.
    data: Option<Box<[u8]>>,
    mapped: bool,
}

struct DummyBufferInfo {
    size: DeviceSize,
    usage: BufferUsage,
    bound: Option<(DeviceMemoryHandle, DeviceSize)>,
}

#[derive(Default)]
struct DummyState {
    next_handle: u64,
    memory: HashMap<DeviceMemoryHandle, DummyMemory>,
    buffers: HashMap<BufferHandle, DummyBufferInfo>,
    fences: HashMap<FenceHandle, bool>,
    destroyed: Vec<NativeHandle>,
    fail_allocations: u32,
    flush_count: u64,
    invalidate_count: u64,
}

impl DummyState {
    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// A RAM-backed device that needs no GPU.
pub struct DummyDevice {
    properties: MemoryProperties,
    limits: DeviceLimits,
    state: Mutex<DummyState>,
}

impl DummyDevice {
    /// Three memory types: device-local, host-visible coherent, and
    /// host-visible coherent cached.
    pub fn new() -> Self {
        let properties = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
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
                MemoryHeap { size: 256 << 20, device_local: false },
            ],
        };

        let limits = DeviceLimits {
            max_memory_allocation_count: 4096,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 64,
            min_texel_buffer_offset_alignment: 16,
            non_coherent_atom_size: 64,
            buffer_image_granularity: 1024,
        };

        Self::with_properties(properties, limits)
    }

    /// A device with custom memory layout and limits.
    pub fn with_properties(properties: MemoryProperties, limits: DeviceLimits) -> Self {
        Self {
            properties,
            limits,
            state: Mutex::new(DummyState::default()),
        }
    }

    /// Simulate the GPU finishing the work guarded by `fence`.
    pub fn signal_fence(&self, fence: FenceHandle) {
        if let Some(signaled) = self.state.lock().fences.get_mut(&fence) {
            *signaled = true;
        }
    }

    /// Make the next `count` raw allocations fail with `OutOfDeviceMemory`.
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().fail_allocations = count;
    }

    /// Every object destroyed so far, in order.
    pub fn destroyed_objects(&self) -> Vec<NativeHandle> {
        self.state.lock().destroyed.clone()
    }

    /// True if `handle` has been destroyed.
    pub fn was_destroyed(&self, handle: NativeHandle) -> bool {
        self.state.lock().destroyed.contains(&handle)
    }

    /// Number of raw memory objects currently allocated.
    pub fn live_memory_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Number of buffers currently alive.
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Number of fences currently alive.
    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    /// Size and usage a buffer was created with.
    pub fn buffer_info(&self, buffer: BufferHandle) -> Option<(DeviceSize, BufferUsage)> {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|info| (info.size, info.usage))
    }

    /// Memory type a raw allocation was made from.
    pub fn memory_type_of(&self, memory: DeviceMemoryHandle) -> Option<u32> {
        self.state
            .lock()
            .memory
            .get(&memory)
            .map(|m| m.memory_type_index)
    }

    /// Number of flush and invalidate calls observed.
    pub fn flush_invalidate_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.flush_count, state.invalidate_count)
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for DummyDevice {
    fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn allocate_memory(&self, size: DeviceSize, memory_type_index: u32) -> Result<DeviceMemoryHandle, GpuAllocError> {
        if size == 0 {
            return Err(GpuAllocError::InvalidSize);
        }
        let host_visible = self
            .properties
            .type_properties(memory_type_index)
            .contains(MemoryPropertyFlags::HOST_VISIBLE);

        let mut state = self.state.lock();
        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;
            return Err(GpuAllocError::OutOfDeviceMemory);
        }

        let data = if host_visible {
            let len = usize::try_from(size).map_err(|_| GpuAllocError::OutOfDeviceMemory)?;
            Some(vec![0u8; len].into_boxed_slice())
        } else {
            None
        };

        let handle = DeviceMemoryHandle(state.next());
        state.memory.insert(
            handle,
            DummyMemory {
                size,
                memory_type_index,
                data,
                mapped: false,
            },
        );
        Ok(handle)
    }

    fn free_memory(&self, memory: DeviceMemoryHandle) {
        let mut state = self.state.lock();
        let removed = state.memory.remove(&memory);
        debug_assert!(removed.is_some(), "dummy device: unknown memory {:?}", memory);
    }

    fn map_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<NonNull<u8>, GpuAllocError> {
        let mut state = self.state.lock();
        let entry = state.memory.get_mut(&memory).ok_or(GpuAllocError::MappingFailed)?;
        if offset.saturating_add(size) > entry.size {
            return Err(GpuAllocError::MappingFailed);
        }
        let data = entry.data.as_mut().ok_or(GpuAllocError::MappingFailed)?;
        entry.mapped = true;
        // SAFETY: offset + size is within the boxed slice checked above.
        let ptr = unsafe { data.as_mut_ptr().add(offset as usize) };
        NonNull::new(ptr).ok_or(GpuAllocError::MappingFailed)
    }

    fn unmap_memory(&self, memory: DeviceMemoryHandle) {
        if let Some(entry) = self.state.lock().memory.get_mut(&memory) {
            entry.mapped = false;
        }
    }

    fn flush_mapped_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<(), GpuAllocError> {
        let mut state = self.state.lock();
        let entry = state
            .memory
            .get(&memory)
            .ok_or_else(|| GpuAllocError::Backend("flush of unknown memory".to_string()))?;
        if !entry.mapped || offset.saturating_add(size) > entry.size {
            return Err(GpuAllocError::Backend("flush outside a mapped range".to_string()));
        }
        state.flush_count += 1;
        Ok(())
    }

    fn invalidate_mapped_memory(&self, memory: DeviceMemoryHandle, offset: DeviceSize, size: DeviceSize) -> Result<(), GpuAllocError> {
        let mut state = self.state.lock();
        let entry = state
            .memory
            .get(&memory)
            .ok_or_else(|| GpuAllocError::Backend("invalidate of unknown memory".to_string()))?;
        if !entry.mapped || offset.saturating_add(size) > entry.size {
            return Err(GpuAllocError::Backend("invalidate outside a mapped range".to_string()));
        }
        state.invalidate_count += 1;
        Ok(())
    }

    fn create_buffer(&self, size: DeviceSize, usage: BufferUsage) -> Result<(BufferHandle, MemoryRequirements), GpuAllocError> {
        if size == 0 {
            return Err(GpuAllocError::InvalidSize);
        }
        let alignment = self.limits.buffer_offset_alignment(usage).max(16);
        let requirements = MemoryRequirements {
            size: crate::util::layout::checked_align_up_any(size, alignment).ok_or(GpuAllocError::InvalidSize)?,
            alignment,
            memory_type_bits: (1u32 << self.properties.memory_types.len()) - 1,
        };

        let mut state = self.state.lock();
        let handle = BufferHandle(state.next());
        state.buffers.insert(
            handle,
            DummyBufferInfo {
                size,
                usage,
                bound: None,
            },
        );
        Ok((handle, requirements))
    }

    fn bind_buffer_memory(&self, buffer: BufferHandle, memory: DeviceMemoryHandle, offset: DeviceSize) -> Result<(), GpuAllocError> {
        let mut state = self.state.lock();
        if !state.memory.contains_key(&memory) {
            return Err(GpuAllocError::Backend("bind to unknown memory".to_string()));
        }
        let info = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuAllocError::Backend("bind of unknown buffer".to_string()))?;
        info.bound = Some((memory, offset));
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        let removed = state.buffers.remove(&buffer);
        debug_assert!(removed.is_some(), "dummy device: unknown buffer {:?}", buffer);
        state.destroyed.push(NativeHandle::Buffer(buffer));
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceHandle, GpuAllocError> {
        let mut state = self.state.lock();
        let handle = FenceHandle(state.next());
        state.fences.insert(handle, signaled);
        Ok(handle)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.destroyed.push(NativeHandle::Fence(fence));
    }

    fn fence_status(&self, fence: FenceHandle) -> Result<bool, GpuAllocError> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuAllocError::Backend("status of unknown fence".to_string()))
    }

    fn wait_for_fence(&self, fence: FenceHandle, _timeout_ns: u64) -> Result<bool, GpuAllocError> {
        // Nothing else can signal while we block, so a wait is a status poll.
        self.fence_status(fence)
    }

    fn reset_fence(&self, fence: FenceHandle) -> Result<(), GpuAllocError> {
        match self.state.lock().fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(GpuAllocError::Backend("reset of unknown fence".to_string())),
        }
    }

    fn destroy_other(&self, handle: NativeHandle) {
        self.state.lock().destroyed.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_visible_memory_is_writable() {
        let device = DummyDevice::new();
        let memory = device.allocate_memory(256, 1).unwrap();
        let ptr = device.map_memory(memory, 0, 256).unwrap();

        unsafe {
            ptr.as_ptr().write(0xAB);
            assert_eq!(*ptr.as_ptr(), 0xAB);
        }

        device.unmap_memory(memory);
        device.free_memory(memory);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn test_device_local_cannot_map() {
        let device = DummyDevice::new();
        let memory = device.allocate_memory(256, 0).unwrap();
        assert_eq!(device.map_memory(memory, 0, 256), Err(GpuAllocError::MappingFailed));
    }

    #[test]
    fn test_fence_lifecycle() {
        let device = DummyDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert_eq!(device.fence_status(fence), Ok(false));

        device.signal_fence(fence);
        assert_eq!(device.wait_for_fence(fence, 0), Ok(true));

        device.reset_fence(fence).unwrap();
        assert_eq!(device.fence_status(fence), Ok(false));

        device.destroy_fence(fence);
        assert!(device.was_destroyed(NativeHandle::Fence(fence)));
    }

    #[test]
    fn test_injected_failure() {
        let device = DummyDevice::new();
        device.fail_next_allocations(1);
        assert_eq!(device.allocate_memory(64, 0), Err(GpuAllocError::OutOfDeviceMemory));
        assert!(device.allocate_memory(64, 0).is_ok());
    }

    #[test]
    fn test_destroy_object_dispatch() {
        let device = DummyDevice::new();
        let (buffer, _) = device.create_buffer(64, BufferUsage::VERTEX_BUFFER).unwrap();
        device.destroy_object(NativeHandle::Buffer(buffer));
        device.destroy_object(NativeHandle::Sampler(7));

        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(
            device.destroyed_objects(),
            vec![NativeHandle::Buffer(buffer), NativeHandle::Sampler(7)]
        );
    }
}
