//! Tracked raw device memory.
//!
//! Every pool gets its memory from here. The manager keeps per-heap usage,
//! watches the device's allocation-count limit and refuses allocations that
//! would overrun a heap's reported size.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::diagnostics::{MemoryEvent, ProfilerHooks};
use crate::gpu::{
    DeviceLimits, DeviceMemoryHandle, DeviceSize, GpuAllocError, GpuDevice, MemoryPropertyFlags,
    MemoryProperties,
};
use crate::sync::mutex::Mutex;
use crate::util::layout::{align_down, checked_align_up_any};

/// One raw device allocation.
///
/// Owned by exactly one container. There is no `Drop`: the memory is only
/// returned through [`DeviceMemoryManager::free`], which consumes it.
#[derive(Debug)]
pub struct DeviceMemoryAllocation {
    handle: DeviceMemoryHandle,
    size: DeviceSize,
    memory_type_index: u32,
    heap_index: u32,
    properties: MemoryPropertyFlags,
    mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapped pointer refers to driver-owned memory that stays valid
// until `unmap`, which requires `&mut self`. Concurrent writers always target
// disjoint suballocated ranges.
unsafe impl Send for DeviceMemoryAllocation {}
unsafe impl Sync for DeviceMemoryAllocation {}

impl DeviceMemoryAllocation {
    pub fn handle(&self) -> DeviceMemoryHandle {
        self.handle
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn heap_index(&self) -> u32 {
        self.heap_index
    }

    /// Whether the memory type is host visible.
    pub fn can_map(&self) -> bool {
        self.properties.contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.properties.contains(MemoryPropertyFlags::HOST_COHERENT)
    }

    pub fn is_cached(&self) -> bool {
        self.properties.contains(MemoryPropertyFlags::HOST_CACHED)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Base of the persistent mapping.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Mapped address of `offset`, if mapped and in bounds.
    pub fn mapped_ptr_at(&self, offset: DeviceSize) -> Option<NonNull<u8>> {
        let base = self.mapped?;
        if offset >= self.size {
            return None;
        }
        // SAFETY: offset is within the mapped allocation.
        Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) })
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write(&self, offset: DeviceSize, data: &[u8]) -> Result<(), GpuAllocError> {
        copy_to_mapped(self.mapped, self.size, offset, data)
    }

    /// Copy from the mapping at `offset` into `out`.
    pub fn read(&self, offset: DeviceSize, out: &mut [u8]) -> Result<(), GpuAllocError> {
        copy_from_mapped(self.mapped, self.size, offset, out)
    }
}

fn mapped_window(
    base: Option<NonNull<u8>>,
    window: DeviceSize,
    offset: DeviceSize,
    len: usize,
) -> Result<NonNull<u8>, GpuAllocError> {
    let base = base.ok_or(GpuAllocError::MappingFailed)?;
    let end = offset
        .checked_add(len as DeviceSize)
        .ok_or(GpuAllocError::InvalidSize)?;
    if end > window {
        return Err(GpuAllocError::InvalidSize);
    }
    // SAFETY: offset + len <= window, and the caller's window lies inside the mapping.
    Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) })
}

/// Bounds-checked copy into a mapped window of `window` bytes starting at `base`.
pub(crate) fn copy_to_mapped(
    base: Option<NonNull<u8>>,
    window: DeviceSize,
    offset: DeviceSize,
    data: &[u8],
) -> Result<(), GpuAllocError> {
    let dst = mapped_window(base, window, offset, data.len())?;
    // SAFETY: mapped_window validated the destination; the source is a
    // separate Rust slice.
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
    Ok(())
}

/// Bounds-checked copy out of a mapped window.
pub(crate) fn copy_from_mapped(
    base: Option<NonNull<u8>>,
    window: DeviceSize,
    offset: DeviceSize,
    out: &mut [u8],
) -> Result<(), GpuAllocError> {
    let src = mapped_window(base, window, offset, out.len())?;
    // SAFETY: as in copy_to_mapped, with source and destination swapped.
    unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len()) };
    Ok(())
}

/// Usage of one memory heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub heap_index: u32,
    pub device_local: bool,
    pub heap_size: DeviceSize,
    pub used_bytes: DeviceSize,
    pub peak_bytes: DeviceSize,
    pub allocation_count: u32,
}

struct LiveAllocation {
    size: DeviceSize,
    heap_index: u32,
}

struct ManagerState {
    heaps: Vec<HeapUsage>,
    live: HashMap<DeviceMemoryHandle, LiveAllocation>,
    allocation_count: u32,
    over_count_limit: bool,
}

/// Tracked wrapper over the device's raw allocate/free.
pub struct DeviceMemoryManager {
    device: Arc<dyn GpuDevice>,
    hooks: Arc<ProfilerHooks>,
    state: Mutex<ManagerState>,
    #[cfg(feature = "debug")]
    traces: crate::debug::backtrace::BacktraceTracker,
}

impl DeviceMemoryManager {
    pub fn new(device: Arc<dyn GpuDevice>, hooks: Arc<ProfilerHooks>) -> Self {
        let heaps = device
            .memory_properties()
            .memory_heaps
            .iter()
            .enumerate()
            .map(|(index, heap)| HeapUsage {
                heap_index: index as u32,
                device_local: heap.device_local,
                heap_size: heap.size,
                ..HeapUsage::default()
            })
            .collect();

        Self {
            device,
            hooks,
            state: Mutex::new(ManagerState {
                heaps,
                live: HashMap::new(),
                allocation_count: 0,
                over_count_limit: false,
            }),
            #[cfg(feature = "debug")]
            traces: crate::debug::backtrace::BacktraceTracker::new(),
        }
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn memory_properties(&self) -> &MemoryProperties {
        self.device.memory_properties()
    }

    pub fn limits(&self) -> &DeviceLimits {
        self.device.limits()
    }

    pub fn hooks(&self) -> &Arc<ProfilerHooks> {
        &self.hooks
    }

    /// Allocate `size` bytes of memory type `memory_type_index`.
    ///
    /// The heap budget is reserved before the device call so concurrent
    /// allocations cannot jointly overrun a heap.
    pub fn alloc(&self, size: DeviceSize, memory_type_index: u32) -> Result<DeviceMemoryAllocation, GpuAllocError> {
        if size == 0 {
            return Err(GpuAllocError::InvalidSize);
        }
        let props = self.device.memory_properties();
        let heap_index = props
            .heap_index(memory_type_index)
            .ok_or(GpuAllocError::NoSuitableMemoryType)?;
        let properties = props.type_properties(memory_type_index);
        let count_limit = self.device.limits().max_memory_allocation_count;

        let crossed_limit = {
            let mut state = self.state.lock();
            let heap = &mut state.heaps[heap_index as usize];
            match heap.used_bytes.checked_add(size) {
                Some(total) if total <= heap.heap_size => {}
                _ => return Err(GpuAllocError::HeapExhausted { heap_index }),
            }
            heap.used_bytes += size;
            heap.allocation_count += 1;
            heap.peak_bytes = heap.peak_bytes.max(heap.used_bytes);

            state.allocation_count += 1;
            if state.allocation_count > count_limit && !state.over_count_limit {
                state.over_count_limit = true;
                Some(state.allocation_count)
            } else {
                None
            }
        };
        if let Some(count) = crossed_limit {
            crate::ga_emit_ctx!(GA001, "{} allocations, device limit {}", count, count_limit);
        }

        let handle = match self.device.allocate_memory(size, memory_type_index) {
            Ok(handle) => handle,
            Err(err) => {
                self.release_accounting(heap_index, size);
                crate::ga_emit_ctx!(
                    GA002,
                    "{} bytes of type {} (heap {}): {}",
                    size,
                    memory_type_index,
                    heap_index,
                    err
                );
                return Err(err);
            }
        };

        self.state
            .lock()
            .live
            .insert(handle, LiveAllocation { size, heap_index });

        #[cfg(feature = "debug")]
        self.traces.record_alloc(handle.0, size, memory_type_index);

        self.hooks.emit(MemoryEvent::Alloc {
            handle: handle.0,
            size,
            memory_type_index,
        });

        Ok(DeviceMemoryAllocation {
            handle,
            size,
            memory_type_index,
            heap_index,
            properties,
            mapped: None,
        })
    }

    /// Return an allocation to the device.
    ///
    /// The allocation must still be tracked; a second free of the same handle
    /// is reported and ignored.
    pub fn free(&self, mut allocation: DeviceMemoryAllocation) {
        let tracked = self.state.lock().live.remove(&allocation.handle);
        let Some(live) = tracked else {
            crate::ga_assert!(false, GA101, "device memory 0x{:x}", allocation.handle.0);
            return;
        };
        self.release_accounting(live.heap_index, live.size);

        if let Some(_ptr) = allocation.mapped.take() {
            #[cfg(feature = "debug")]
            {
                // SAFETY: the whole mapping belongs to this allocation and no
                // suballocation of it is live any more.
                unsafe { crate::debug::poison::poison_freed(_ptr.as_ptr(), allocation.size as usize) };
            }
            self.device.unmap_memory(allocation.handle);
        }
        self.device.free_memory(allocation.handle);

        #[cfg(feature = "debug")]
        self.traces.record_free(allocation.handle.0);

        self.hooks.emit(MemoryEvent::Free {
            handle: allocation.handle.0,
            size: allocation.size,
            memory_type_index: allocation.memory_type_index,
        });
    }

    fn release_accounting(&self, heap_index: u32, size: DeviceSize) {
        let count_limit = self.device.limits().max_memory_allocation_count;
        let mut state = self.state.lock();
        let heap = &mut state.heaps[heap_index as usize];
        heap.used_bytes -= size;
        heap.allocation_count -= 1;
        state.allocation_count -= 1;
        if state.allocation_count <= count_limit {
            state.over_count_limit = false;
        }
    }

    /// Persistently map a host-visible allocation. Mapping twice returns the
    /// existing pointer.
    pub fn map(&self, allocation: &mut DeviceMemoryAllocation) -> Result<NonNull<u8>, GpuAllocError> {
        if let Some(ptr) = allocation.mapped {
            return Ok(ptr);
        }
        if !allocation.can_map() {
            return Err(GpuAllocError::MappingFailed);
        }
        let ptr = self.device.map_memory(allocation.handle, 0, allocation.size)?;
        allocation.mapped = Some(ptr);
        Ok(ptr)
    }

    pub fn unmap(&self, allocation: &mut DeviceMemoryAllocation) {
        if allocation.mapped.take().is_some() {
            self.device.unmap_memory(allocation.handle);
        }
    }

    /// Make CPU writes in `[offset, offset + size)` visible to the device.
    /// A no-op on coherent or unmapped memory.
    pub fn flush(&self, allocation: &DeviceMemoryAllocation, offset: DeviceSize, size: DeviceSize) -> Result<(), GpuAllocError> {
        match self.non_coherent_range(allocation, offset, size) {
            Some((start, len)) => self.device.flush_mapped_memory(allocation.handle, start, len),
            None => Ok(()),
        }
    }

    /// Make device writes in `[offset, offset + size)` visible to the CPU.
    /// A no-op on coherent or unmapped memory.
    pub fn invalidate(&self, allocation: &DeviceMemoryAllocation, offset: DeviceSize, size: DeviceSize) -> Result<(), GpuAllocError> {
        match self.non_coherent_range(allocation, offset, size) {
            Some((start, len)) => self.device.invalidate_mapped_memory(allocation.handle, start, len),
            None => Ok(()),
        }
    }

    /// Range widened to `non_coherent_atom_size`, clamped to the allocation end.
    fn non_coherent_range(
        &self,
        allocation: &DeviceMemoryAllocation,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Option<(DeviceSize, DeviceSize)> {
        if allocation.is_coherent() || !allocation.is_mapped() || size == 0 {
            return None;
        }
        let atom = self.device.limits().non_coherent_atom_size.max(1);
        let start = align_down(offset, atom);
        let end = checked_align_up_any(offset.saturating_add(size), atom)
            .unwrap_or(DeviceSize::MAX)
            .min(allocation.size);
        Some((start, end.saturating_sub(start)))
    }

    /// First memory type allowed by `type_bits` that has every flag in
    /// `properties`.
    pub fn memory_type_from_properties(&self, type_bits: u32, properties: MemoryPropertyFlags) -> Option<u32> {
        self.memory_properties().find_memory_type(type_bits, properties)
    }

    /// Like [`memory_type_from_properties`], skipping `exclude`.
    ///
    /// [`memory_type_from_properties`]: DeviceMemoryManager::memory_type_from_properties
    pub fn memory_type_from_properties_excluding(
        &self,
        type_bits: u32,
        properties: MemoryPropertyFlags,
        exclude: Option<u32>,
    ) -> Option<u32> {
        self.memory_properties()
            .find_memory_type_excluding(type_bits, properties, exclude)
    }

    /// Snapshot of every heap.
    pub fn heap_usage(&self) -> Vec<HeapUsage> {
        self.state.lock().heaps.clone()
    }

    /// Number of live raw allocations.
    pub fn allocation_count(&self) -> u32 {
        self.state.lock().allocation_count
    }

    /// Bytes allocated across all heaps.
    pub fn total_used_bytes(&self) -> DeviceSize {
        self.state.lock().heaps.iter().map(|h| h.used_bytes).sum()
    }

    /// Set the frame stamped on leak records.
    #[allow(unused_variables)]
    pub fn set_frame(&self, frame: u64) {
        #[cfg(feature = "debug")]
        self.traces.set_frame(frame);
    }

    /// Report allocations still alive. Returns how many there were.
    pub fn report_leaks(&self) -> usize {
        let (count, bytes) = {
            let state = self.state.lock();
            (state.live.len(), state.live.values().map(|l| l.size).sum::<DeviceSize>())
        };
        if count == 0 {
            return 0;
        }
        crate::ga_emit_ctx!(
            GA403,
            "{} allocation(s), {}",
            count,
            crate::util::size::format_bytes(bytes)
        );
        #[cfg(feature = "debug")]
        {
            if let Some(report) = self.traces.leak_report() {
                crate::ga_emit_ctx!(GA403, "{}", report);
            }
        }
        count
    }
}
