//! Pooled native buffers.
//!
//! Small buffers are carved out of large native buffers, each bound to its own
//! device allocation. A request only reuses a buffer created with exactly the
//! same usage and memory properties. Unlike pages, a buffer that empties out is
//! destroyed straight away.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocators::arena::{SlotArena, SlotId};
use crate::allocators::device_memory::{
    copy_from_mapped, copy_to_mapped, DeviceMemoryAllocation, DeviceMemoryManager,
};
use crate::allocators::free_list::{FreeListAllocation, FreeListAllocator};
use crate::gpu::{
    BufferHandle, BufferUsage, DeviceSize, GpuAllocError, MemoryPropertyFlags, MemoryRequirements,
};
use crate::sync::mutex::Mutex;
use crate::util::layout::checked_align_up_any;

struct BufferAllocation {
    buffer: BufferHandle,
    memory: DeviceMemoryAllocation,
    allocator: FreeListAllocator,
    usage: BufferUsage,
    properties: MemoryPropertyFlags,
    live_suballocations: u32,
}

impl BufferAllocation {
    fn matches(&self, usage: BufferUsage, properties: MemoryPropertyFlags) -> bool {
        self.usage == usage && self.properties == properties
    }
}

#[derive(Default)]
struct PoolState {
    buffers: SlotArena<BufferAllocation>,
    shut_down: bool,
}

struct PoolInner {
    dmm: Arc<DeviceMemoryManager>,
    buffer_allocation_size: DeviceSize,
    state: Mutex<PoolState>,
}

/// Occupancy of the buffer pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub buffers: usize,
    /// Bytes of buffer space held by the pool.
    pub reserved_bytes: DeviceSize,
    /// Bytes handed out, alignment padding included.
    pub live_bytes: DeviceSize,
    pub live_suballocations: u32,
}

/// Pool of suballocated native buffers.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(dmm: Arc<DeviceMemoryManager>, buffer_allocation_size: DeviceSize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                dmm,
                buffer_allocation_size,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Suballocate `size` bytes of a buffer with `usage` backed by memory with
    /// `properties`.
    ///
    /// The alignment is raised to the device's bind-offset alignment for the
    /// usage class.
    pub fn allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        usage: BufferUsage,
        properties: MemoryPropertyFlags,
    ) -> Result<BufferSuballocation, GpuAllocError> {
        if size == 0 {
            return Err(GpuAllocError::InvalidSize);
        }
        let alignment = alignment
            .max(self.inner.dmm.limits().buffer_offset_alignment(usage))
            .max(1);
        let aligned_size = checked_align_up_any(size, alignment).ok_or(GpuAllocError::InvalidSize)?;

        {
            let mut state = self.inner.state.lock();
            for id in state.buffers.ids() {
                let Some(buffer) = state.buffers.get_mut(id) else { continue };
                if !buffer.matches(usage, properties) {
                    continue;
                }
                if let Some(placed) = buffer.allocator.try_allocate(aligned_size, alignment) {
                    return Ok(self.make_suballocation(&mut state, id, placed, size));
                }
            }
        }

        let buffer_size = aligned_size.max(self.inner.buffer_allocation_size);
        let mut allocation = self.create_buffer_allocation(buffer_size, usage, properties)?;

        let mut state = self.inner.state.lock();
        let placed = allocation.allocator.try_allocate(aligned_size, alignment);
        let id = state.buffers.insert(allocation);
        match placed {
            Some(placed) => Ok(self.make_suballocation(&mut state, id, placed, size)),
            None => Err(GpuAllocError::Backend("fresh buffer rejected its first suballocation".to_string())),
        }
    }

    fn create_buffer_allocation(
        &self,
        buffer_size: DeviceSize,
        usage: BufferUsage,
        properties: MemoryPropertyFlags,
    ) -> Result<BufferAllocation, GpuAllocError> {
        let dmm = &self.inner.dmm;
        let device = dmm.device();
        let (buffer, requirements) = device.create_buffer(buffer_size, usage)?;

        let mut memory = match allocate_with_fallback(dmm, &requirements, properties) {
            Ok(memory) => memory,
            Err(err) => {
                device.destroy_buffer(buffer);
                return Err(err);
            }
        };
        if let Err(err) = device.bind_buffer_memory(buffer, memory.handle(), 0) {
            device.destroy_buffer(buffer);
            dmm.free(memory);
            return Err(err);
        }
        if memory.can_map() {
            if let Err(err) = dmm.map(&mut memory) {
                device.destroy_buffer(buffer);
                dmm.free(memory);
                return Err(err);
            }
        }

        Ok(BufferAllocation {
            buffer,
            memory,
            allocator: FreeListAllocator::new(buffer_size),
            usage,
            properties,
            live_suballocations: 0,
        })
    }

    fn make_suballocation(
        &self,
        state: &mut PoolState,
        id: SlotId,
        placed: FreeListAllocation,
        size: DeviceSize,
    ) -> BufferSuballocation {
        let (buffer, usage, mapped, coherent) = match state.buffers.get_mut(id) {
            Some(b) => {
                b.live_suballocations += 1;
                (b.buffer, b.usage, b.memory.mapped_ptr_at(placed.offset), b.memory.is_coherent())
            }
            None => (BufferHandle(0), BufferUsage::empty(), None, true),
        };
        BufferSuballocation {
            inner: Arc::new(BufferSubInner {
                pool: self.inner.clone(),
                owner: id,
                buffer,
                usage,
                offset: placed.offset,
                size,
                range_offset: placed.range_offset,
                allocated_size: placed.allocated_size,
                mapped,
                coherent,
            }),
        }
    }

    /// Destroy every buffer. Buffers with live suballocations are reported;
    /// their handles become inert.
    pub fn deinit(&self) {
        let (buffers, live) = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            let buffers = state.buffers.drain();
            let live: u32 = buffers.iter().map(|b| b.live_suballocations).sum();
            (buffers, live)
        };
        if live > 0 {
            crate::ga_emit_ctx!(GA401, "buffer pool: {} live suballocation(s)", live);
        }
        for buffer in buffers {
            self.inner.destroy(buffer);
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let state = self.inner.state.lock();
        let mut stats = BufferPoolStats {
            buffers: state.buffers.len(),
            ..BufferPoolStats::default()
        };
        for (_, buffer) in state.buffers.iter() {
            stats.reserved_bytes += buffer.allocator.capacity();
            stats.live_bytes += buffer.allocator.live_bytes();
            stats.live_suballocations += buffer.live_suballocations;
        }
        stats
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.inner.state.lock().shut_down {
            self.deinit();
        }
    }
}

/// Allocate memory for `requirements`, dropping `HOST_CACHED` and trying a
/// different memory type when the preferred one is missing or full.
///
/// The fallback changes the memory's caching behaviour, so it is reported.
pub(crate) fn allocate_with_fallback(
    dmm: &DeviceMemoryManager,
    requirements: &MemoryRequirements,
    properties: MemoryPropertyFlags,
) -> Result<DeviceMemoryAllocation, GpuAllocError> {
    let preferred = dmm.memory_type_from_properties(requirements.memory_type_bits, properties);
    let err = match preferred {
        Some(memory_type) => match dmm.alloc(requirements.size, memory_type) {
            Ok(memory) => return Ok(memory),
            Err(err) if err.is_exhaustion() => err,
            Err(err) => return Err(err),
        },
        None => GpuAllocError::NoSuitableMemoryType,
    };

    if !properties.contains(MemoryPropertyFlags::HOST_CACHED) {
        return Err(err);
    }
    let relaxed = properties.without(MemoryPropertyFlags::HOST_CACHED);
    let Some(memory_type) =
        dmm.memory_type_from_properties_excluding(requirements.memory_type_bits, relaxed, preferred)
    else {
        return Err(err);
    };
    crate::ga_emit_ctx!(
        GA301,
        "{} bytes: {} -> memory type {}",
        requirements.size,
        err,
        memory_type
    );
    dmm.alloc(requirements.size, memory_type)
}

/// Create a native buffer with its own persistently mapped memory.
pub(crate) fn create_mapped_buffer(
    dmm: &DeviceMemoryManager,
    size: DeviceSize,
    usage: BufferUsage,
    properties: MemoryPropertyFlags,
) -> Result<(BufferHandle, DeviceMemoryAllocation), GpuAllocError> {
    let device = dmm.device();
    let (buffer, requirements) = device.create_buffer(size, usage)?;

    let mut memory = match allocate_with_fallback(dmm, &requirements, properties) {
        Ok(memory) => memory,
        Err(err) => {
            device.destroy_buffer(buffer);
            return Err(err);
        }
    };
    let bound = device
        .bind_buffer_memory(buffer, memory.handle(), 0)
        .and_then(|()| dmm.map(&mut memory).map(|_| ()));
    if let Err(err) = bound {
        device.destroy_buffer(buffer);
        dmm.free(memory);
        return Err(err);
    }
    Ok((buffer, memory))
}

impl PoolInner {
    fn destroy(&self, allocation: BufferAllocation) {
        self.dmm.device().destroy_buffer(allocation.buffer);
        self.dmm.free(allocation.memory);
    }

    fn release(&self, sub: &BufferSubInner) {
        let emptied = {
            let mut state = self.state.lock();
            if !state.buffers.contains(sub.owner) {
                let shut_down = state.shut_down;
                drop(state);
                if !shut_down {
                    crate::ga_assert!(false, GA102, "buffer {:?}", sub.buffer);
                }
                return;
            }
            let Some(buffer) = state.buffers.get_mut(sub.owner) else {
                return;
            };

            #[cfg(feature = "debug")]
            {
                if let Some(base) = buffer.memory.mapped_ptr_at(sub.range_offset) {
                    // SAFETY: the range belongs to the handle being dropped.
                    unsafe { crate::debug::poison::poison_freed(base.as_ptr(), sub.allocated_size as usize) };
                }
            }

            buffer.allocator.free(sub.range_offset, sub.allocated_size);
            buffer.live_suballocations -= 1;
            if buffer.live_suballocations == 0 && buffer.allocator.is_empty() {
                state.buffers.remove(sub.owner)
            } else {
                None
            }
        };
        if let Some(allocation) = emptied {
            self.destroy(allocation);
        }
    }
}

struct BufferSubInner {
    pool: Arc<PoolInner>,
    owner: SlotId,
    buffer: BufferHandle,
    usage: BufferUsage,
    offset: DeviceSize,
    size: DeviceSize,
    range_offset: DeviceSize,
    allocated_size: DeviceSize,
    mapped: Option<NonNull<u8>>,
    coherent: bool,
}

// SAFETY: `mapped` points at this suballocation's own range of a persistently
// mapped buffer, which outlives the handle.
unsafe impl Send for BufferSubInner {}
unsafe impl Sync for BufferSubInner {}

impl Drop for BufferSubInner {
    fn drop(&mut self) {
        self.pool.release(self);
    }
}

/// A range of a pooled native buffer. Clones share the range; the last drop
/// returns it.
#[derive(Clone)]
pub struct BufferSuballocation {
    inner: Arc<BufferSubInner>,
}

impl BufferSuballocation {
    /// Native buffer to bind.
    pub fn buffer(&self) -> BufferHandle {
        self.inner.buffer
    }

    /// Offset into [`buffer`](Self::buffer) to bind at.
    pub fn offset(&self) -> DeviceSize {
        self.inner.offset
    }

    /// Requested size.
    pub fn size(&self) -> DeviceSize {
        self.inner.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    /// CPU pointer to the start of the range on host-visible buffers.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.inner.mapped
    }

    /// Copy `data` into the range at `offset`.
    pub fn write(&self, offset: DeviceSize, data: &[u8]) -> Result<(), GpuAllocError> {
        copy_to_mapped(self.inner.mapped, self.inner.size, offset, data)
    }

    /// Copy from the range at `offset` into `out`.
    pub fn read(&self, offset: DeviceSize, out: &mut [u8]) -> Result<(), GpuAllocError> {
        copy_from_mapped(self.inner.mapped, self.inner.size, offset, out)
    }

    /// Flush CPU writes to the whole range. No-op on coherent memory.
    pub fn flush(&self) -> Result<(), GpuAllocError> {
        self.sync_range(false)
    }

    /// Invalidate the whole range before a CPU read. No-op on coherent memory.
    pub fn invalidate(&self) -> Result<(), GpuAllocError> {
        self.sync_range(true)
    }

    fn sync_range(&self, invalidate: bool) -> Result<(), GpuAllocError> {
        if self.inner.coherent || self.inner.mapped.is_none() {
            return Ok(());
        }
        let pool = &self.inner.pool;
        let state = pool.state.lock();
        let buffer = state
            .buffers
            .get(self.inner.owner)
            .ok_or(GpuAllocError::MappingFailed)?;
        // The buffer is bound at offset 0, so buffer offsets are memory offsets.
        if invalidate {
            pool.dmm.invalidate(&buffer.memory, self.inner.offset, self.inner.size)
        } else {
            pool.dmm.flush(&buffer.memory, self.inner.offset, self.inner.size)
        }
    }
}

impl std::fmt::Debug for BufferSuballocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSuballocation")
            .field("buffer", &self.inner.buffer)
            .field("offset", &self.inner.offset)
            .field("size", &self.inner.size)
            .field("usage", &self.inner.usage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ProfilerHooks;
    use crate::gpu::{DeviceLimits, DummyDevice, MemoryHeap, MemoryProperties, MemoryType};

    const VISIBLE: MemoryPropertyFlags = MemoryPropertyFlags::HOST_VISIBLE;

    fn pool_on(device: Arc<DummyDevice>, buffer_size: DeviceSize) -> BufferPool {
        let dmm = Arc::new(DeviceMemoryManager::new(device, Arc::new(ProfilerHooks::new())));
        BufferPool::new(dmm, buffer_size)
    }

    #[test]
    fn test_suballocations_share_a_buffer() {
        let device = Arc::new(DummyDevice::new());
        let pool = pool_on(device.clone(), 4096);

        let a = pool.allocate(100, 4, BufferUsage::VERTEX_BUFFER, VISIBLE).unwrap();
        let b = pool.allocate(100, 4, BufferUsage::VERTEX_BUFFER, VISIBLE).unwrap();
        assert_eq!(a.buffer(), b.buffer());
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 100);
        assert_eq!(device.live_buffer_count(), 1);
        assert_eq!(device.buffer_info(a.buffer()).map(|(size, _)| size), Some(4096));
    }

    #[test]
    fn test_class_mismatch_gets_new_buffer() {
        let device = Arc::new(DummyDevice::new());
        let pool = pool_on(device.clone(), 4096);

        let vertex = pool.allocate(64, 4, BufferUsage::VERTEX_BUFFER, VISIBLE).unwrap();
        let index = pool.allocate(64, 4, BufferUsage::INDEX_BUFFER, VISIBLE).unwrap();
        let local = pool
            .allocate(64, 4, BufferUsage::VERTEX_BUFFER, MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        assert_ne!(vertex.buffer(), index.buffer());
        assert_ne!(vertex.buffer(), local.buffer());
        assert_eq!(pool.stats().buffers, 3);
        assert!(local.mapped_ptr().is_none());
    }

    #[test]
    fn test_usage_alignment_applies() {
        let device = Arc::new(DummyDevice::new());
        let pool = pool_on(device, 4096);

        let _first = pool.allocate(10, 1, BufferUsage::UNIFORM_BUFFER, VISIBLE).unwrap();
        let second = pool.allocate(10, 1, BufferUsage::UNIFORM_BUFFER, VISIBLE).unwrap();
        assert_eq!(second.offset(), 256);

        let _s1 = pool.allocate(10, 1, BufferUsage::STORAGE_BUFFER, VISIBLE).unwrap();
        let s2 = pool.allocate(10, 1, BufferUsage::STORAGE_BUFFER, VISIBLE).unwrap();
        assert_eq!(s2.offset() % 64, 0);
    }

    #[test]
    fn test_empty_buffer_destroyed_immediately() {
        let device = Arc::new(DummyDevice::new());
        let pool = pool_on(device.clone(), 4096);

        let a = pool.allocate(128, 4, BufferUsage::VERTEX_BUFFER, VISIBLE).unwrap();
        let buffer = a.buffer();
        let clone = a.clone();
        drop(a);
        assert_eq!(device.live_buffer_count(), 1);

        drop(clone);
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.live_memory_count(), 0);
        assert!(device.was_destroyed(crate::gpu::NativeHandle::Buffer(buffer)));
        assert_eq!(pool.stats(), BufferPoolStats::default());
    }

    #[test]
    fn test_large_request_exceeds_default_size() {
        let device = Arc::new(DummyDevice::new());
        let pool = pool_on(device.clone(), 1024);
        let big = pool.allocate(10_000, 4, BufferUsage::STORAGE_BUFFER, VISIBLE).unwrap();
        assert_eq!(device.buffer_info(big.buffer()).map(|(size, _)| size), Some(10_048));
    }

    #[test]
    fn test_mapped_write_read() {
        let device = Arc::new(DummyDevice::new());
        let pool = pool_on(device, 4096);
        let a = pool.allocate(16, 4, BufferUsage::VERTEX_BUFFER, VISIBLE).unwrap();
        a.write(0, &[9; 16]).unwrap();
        let mut out = [0u8; 16];
        a.read(0, &mut out).unwrap();
        assert_eq!(out, [9; 16]);
        assert!(a.flush().is_ok());
    }

    fn uncached_device() -> Arc<DummyDevice> {
        let props = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: 1 << 30,
                    device_local: true,
                },
                MemoryHeap {
                    size: 1 << 28,
                    device_local: false,
                },
            ],
        };
        Arc::new(DummyDevice::with_properties(props, DeviceLimits::default()))
    }

    #[test]
    fn test_cached_falls_back_when_missing() {
        let device = uncached_device();
        let pool = pool_on(device.clone(), 4096);
        let cached = VISIBLE | MemoryPropertyFlags::HOST_CACHED;

        let a = pool.allocate(64, 4, BufferUsage::TRANSFER_DST, cached).unwrap();
        assert!(a.mapped_ptr().is_some());

        // Reuse is keyed on the requested class, not the memory it landed in.
        let b = pool.allocate(64, 4, BufferUsage::TRANSFER_DST, cached).unwrap();
        assert_eq!(a.buffer(), b.buffer());
    }

    #[test]
    fn test_cached_falls_back_when_heap_full() {
        let props = MemoryProperties {
            memory_types: vec![
                MemoryType {
                    property_flags: VISIBLE | MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                    heap_index: 1,
                },
            ],
            memory_heaps: vec![
                MemoryHeap {
                    size: 4096,
                    device_local: false,
                },
                MemoryHeap {
                    size: 1 << 20,
                    device_local: false,
                },
            ],
        };
        let device = Arc::new(DummyDevice::with_properties(props, DeviceLimits::default()));
        let dmm = DeviceMemoryManager::new(device.clone(), Arc::new(ProfilerHooks::new()));

        let requirements = MemoryRequirements {
            size: 8192,
            alignment: 16,
            memory_type_bits: 0b11,
        };
        let memory =
            allocate_with_fallback(&dmm, &requirements, VISIBLE | MemoryPropertyFlags::HOST_CACHED).unwrap();
        assert_eq!(memory.memory_type_index(), 1);
        dmm.free(memory);
    }

    #[test]
    fn test_no_fallback_without_cached() {
        let device = uncached_device();
        let dmm = DeviceMemoryManager::new(device, Arc::new(ProfilerHooks::new()));
        let requirements = MemoryRequirements {
            size: 64,
            alignment: 16,
            memory_type_bits: 0b01,
        };
        assert_eq!(
            allocate_with_fallback(&dmm, &requirements, VISIBLE).unwrap_err(),
            GpuAllocError::NoSuitableMemoryType
        );
    }
}
