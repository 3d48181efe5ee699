//! Page pools over raw device memory.
//!
//! A [`ResourceHeap`] serves one memory type. It carves pages out of
//! [`DeviceMemoryManager`] allocations and hands out ranges of them through
//! reference-counted [`PageSuballocation`] handles. Pages that empty out sit in
//! a free list for a cooldown before their memory is returned, so a resource
//! that is recreated every few frames does not churn the driver.
//!
//! [`HeapManager`] owns one heap per memory type and picks the type for a
//! request.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocators::arena::{SlotArena, SlotId};
use crate::allocators::device_memory::{
    copy_from_mapped, copy_to_mapped, DeviceMemoryAllocation, DeviceMemoryManager,
};
use crate::allocators::free_list::FreeListAllocator;
use crate::api::config::GpuAllocConfig;
use crate::core::FrameClock;
use crate::gpu::{
    DeviceMemoryHandle, DeviceSize, GpuAllocError, GpuMemoryIntent, MemoryPropertyFlags,
    MemoryRequirements,
};
use crate::sync::mutex::Mutex;
use crate::util::layout::checked_align_up_any;

struct Page {
    memory: DeviceMemoryAllocation,
    allocator: FreeListAllocator,
    live_suballocations: u32,
    freed_frame: u64,
}

impl Page {
    fn is_mapped(&self) -> bool {
        self.memory.is_mapped()
    }
}

#[derive(Default)]
struct HeapState {
    pages: SlotArena<Page>,
    used: Vec<SlotId>,
    free: Vec<SlotId>,
    shut_down: bool,
}

struct HeapInner {
    dmm: Arc<DeviceMemoryManager>,
    clock: Arc<FrameClock>,
    memory_type_index: u32,
    page_size: DeviceSize,
    cooldown_frames: u64,
    state: Mutex<HeapState>,
}

/// Pool of pages for one memory type.
pub struct ResourceHeap {
    inner: Arc<HeapInner>,
}

/// Occupancy of one heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceHeapStats {
    pub memory_type_index: u32,
    pub used_pages: usize,
    pub free_pages: usize,
    /// Bytes of device memory held by pages.
    pub reserved_bytes: DeviceSize,
    /// Bytes handed out, alignment padding included.
    pub live_bytes: DeviceSize,
    pub live_suballocations: u32,
}

impl ResourceHeap {
    pub fn new(
        dmm: Arc<DeviceMemoryManager>,
        clock: Arc<FrameClock>,
        memory_type_index: u32,
        page_size: DeviceSize,
        cooldown_frames: u64,
    ) -> Self {
        Self {
            inner: Arc::new(HeapInner {
                dmm,
                clock,
                memory_type_index,
                page_size,
                cooldown_frames,
                state: Mutex::new(HeapState::default()),
            }),
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.inner.memory_type_index
    }

    pub fn page_size(&self) -> DeviceSize {
        self.inner.page_size
    }

    /// Suballocate `size` bytes at `alignment`.
    ///
    /// Tries used pages first, then cooling pages, and only then asks for a new
    /// page of `max(size, page_size)`. Only the last step can fail.
    pub fn allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        wants_mapped: bool,
    ) -> Result<PageSuballocation, GpuAllocError> {
        if size == 0 {
            return Err(GpuAllocError::InvalidSize);
        }
        let alignment = alignment.max(1);
        let aligned_size = checked_align_up_any(size, alignment).ok_or(GpuAllocError::InvalidSize)?;

        {
            let mut state = self.inner.state.lock();
            if let Some(sub) = self.try_existing(&mut state, size, aligned_size, alignment, wants_mapped) {
                return Ok(sub);
            }
        }

        let page_size = aligned_size.max(self.inner.page_size);
        let mut memory = self.inner.dmm.alloc(page_size, self.inner.memory_type_index)?;
        if wants_mapped {
            if let Err(err) = self.inner.dmm.map(&mut memory) {
                self.inner.dmm.free(memory);
                return Err(err);
            }
        }

        let mut state = self.inner.state.lock();
        let mut page = Page {
            allocator: FreeListAllocator::new(page_size),
            memory,
            live_suballocations: 0,
            freed_frame: 0,
        };
        let placed = page.allocator.try_allocate(aligned_size, alignment);
        let id = state.pages.insert(page);
        state.used.push(id);
        match placed {
            Some(placed) => Ok(self.make_suballocation(&mut state, id, placed, size)),
            // Unreachable: offset 0 is aligned and the page holds aligned_size.
            None => Err(GpuAllocError::Backend("fresh page rejected its first suballocation".to_string())),
        }
    }

    fn try_existing(
        &self,
        state: &mut HeapState,
        size: DeviceSize,
        aligned_size: DeviceSize,
        alignment: DeviceSize,
        wants_mapped: bool,
    ) -> Option<PageSuballocation> {
        for index in 0..state.used.len() {
            let id = state.used[index];
            let Some(page) = state.pages.get_mut(id) else { continue };
            if page.is_mapped() != wants_mapped {
                continue;
            }
            if let Some(placed) = page.allocator.try_allocate(aligned_size, alignment) {
                return Some(self.make_suballocation(state, id, placed, size));
            }
        }

        for index in 0..state.free.len() {
            let id = state.free[index];
            let Some(page) = state.pages.get_mut(id) else { continue };
            if page.is_mapped() != wants_mapped {
                continue;
            }
            if let Some(placed) = page.allocator.try_allocate(aligned_size, alignment) {
                state.free.swap_remove(index);
                state.used.push(id);
                return Some(self.make_suballocation(state, id, placed, size));
            }
        }
        None
    }

    fn make_suballocation(
        &self,
        state: &mut HeapState,
        id: SlotId,
        placed: crate::allocators::free_list::FreeListAllocation,
        size: DeviceSize,
    ) -> PageSuballocation {
        let (memory, mapped, coherent) = match state.pages.get_mut(id) {
            Some(page) => {
                page.live_suballocations += 1;
                (
                    page.memory.handle(),
                    page.memory.mapped_ptr_at(placed.offset),
                    page.memory.is_coherent(),
                )
            }
            None => (DeviceMemoryHandle(0), None, true),
        };
        PageSuballocation {
            inner: Arc::new(PageSubInner {
                heap: self.inner.clone(),
                page: id,
                memory,
                offset: placed.offset,
                size,
                range_offset: placed.range_offset,
                allocated_size: placed.allocated_size,
                mapped,
                coherent,
            }),
        }
    }

    /// Destroy at most one free page whose cooldown has expired. Returns
    /// whether a page was destroyed.
    pub fn release_freed_pages(&self) -> bool {
        let page = {
            let mut state = self.inner.state.lock();
            let expired = state.free.iter().position(|&id| {
                state
                    .pages
                    .get(id)
                    .is_some_and(|p| self.inner.clock.frames_since(p.freed_frame) >= self.inner.cooldown_frames)
            });
            match expired {
                Some(index) => {
                    let id = state.free.swap_remove(index);
                    state.pages.remove(id)
                }
                None => None,
            }
        };
        match page {
            Some(page) => {
                self.inner.dmm.free(page.memory);
                true
            }
            None => false,
        }
    }

    /// Destroy every free page regardless of cooldown. Returns how many.
    pub fn release_all_freed_pages(&self) -> usize {
        let pages: Vec<Page> = {
            let mut state = self.inner.state.lock();
            let ids = std::mem::take(&mut state.free);
            ids.into_iter().filter_map(|id| state.pages.remove(id)).collect()
        };
        let count = pages.len();
        for page in pages {
            self.inner.dmm.free(page.memory);
        }
        count
    }

    /// Destroy every page. Pages that still have live suballocations are
    /// reported; their handles become inert.
    pub fn deinit(&self) {
        let (pages, live) = {
            let mut state = self.inner.state.lock();
            state.shut_down = true;
            state.used.clear();
            state.free.clear();
            let pages = state.pages.drain();
            let live: u32 = pages.iter().map(|p| p.live_suballocations).sum();
            (pages, live)
        };
        if live > 0 {
            crate::ga_emit_ctx!(
                GA401,
                "memory type {}: {} live suballocation(s)",
                self.inner.memory_type_index,
                live
            );
        }
        for page in pages {
            self.inner.dmm.free(page.memory);
        }
    }

    pub fn stats(&self) -> ResourceHeapStats {
        let state = self.inner.state.lock();
        let mut stats = ResourceHeapStats {
            memory_type_index: self.inner.memory_type_index,
            used_pages: state.used.len(),
            free_pages: state.free.len(),
            ..ResourceHeapStats::default()
        };
        for (_, page) in state.pages.iter() {
            stats.reserved_bytes += page.allocator.capacity();
            stats.live_bytes += page.allocator.live_bytes();
            stats.live_suballocations += page.live_suballocations;
        }
        stats
    }
}

impl Drop for ResourceHeap {
    fn drop(&mut self) {
        if !self.inner.state.lock().shut_down {
            self.deinit();
        }
    }
}

impl HeapInner {
    fn release(&self, sub: &PageSubInner) {
        let mut state = self.state.lock();
        if !state.pages.contains(sub.page) {
            let shut_down = state.shut_down;
            drop(state);
            if !shut_down {
                crate::ga_assert!(false, GA102, "page {:?} of memory type {}", sub.page, self.memory_type_index);
            }
            return;
        }
        let Some(page) = state.pages.get_mut(sub.page) else {
            return;
        };

        #[cfg(feature = "debug")]
        {
            if let Some(base) = page.memory.mapped_ptr_at(sub.range_offset) {
                // SAFETY: the range was handed out by this page and its handle
                // is being dropped, so nobody else writes it.
                unsafe { crate::debug::poison::poison_freed(base.as_ptr(), sub.allocated_size as usize) };
            }
        }

        page.allocator.free(sub.range_offset, sub.allocated_size);
        page.live_suballocations -= 1;

        if page.live_suballocations == 0 && page.allocator.is_empty() {
            page.freed_frame = self.clock.current();
            if let Some(index) = state.used.iter().position(|&id| id == sub.page) {
                state.used.swap_remove(index);
                state.free.push(sub.page);
            }
        }
    }
}

struct PageSubInner {
    heap: Arc<HeapInner>,
    page: SlotId,
    memory: DeviceMemoryHandle,
    offset: DeviceSize,
    size: DeviceSize,
    range_offset: DeviceSize,
    allocated_size: DeviceSize,
    mapped: Option<NonNull<u8>>,
    coherent: bool,
}

// SAFETY: `mapped` points at this suballocation's own range of a persistently
// mapped page, which outlives the handle.
unsafe impl Send for PageSubInner {}
unsafe impl Sync for PageSubInner {}

impl Drop for PageSubInner {
    fn drop(&mut self) {
        self.heap.release(self);
    }
}

/// A range of one page. Clones share the range; the last drop returns it.
#[derive(Clone)]
pub struct PageSuballocation {
    inner: Arc<PageSubInner>,
}

impl PageSuballocation {
    /// Memory to bind the resource to.
    pub fn memory(&self) -> DeviceMemoryHandle {
        self.inner.memory
    }

    /// Aligned offset to bind at.
    pub fn offset(&self) -> DeviceSize {
        self.inner.offset
    }

    /// Requested size.
    pub fn size(&self) -> DeviceSize {
        self.inner.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.inner.heap.memory_type_index
    }

    /// CPU pointer to the start of the range on mapped pages.
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
        let heap = &self.inner.heap;
        let state = heap.state.lock();
        let page = state.pages.get(self.inner.page).ok_or(GpuAllocError::MappingFailed)?;
        if invalidate {
            heap.dmm.invalidate(&page.memory, self.inner.offset, self.inner.size)
        } else {
            heap.dmm.flush(&page.memory, self.inner.offset, self.inner.size)
        }
    }
}

impl std::fmt::Debug for PageSuballocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageSuballocation")
            .field("memory", &self.inner.memory)
            .field("offset", &self.inner.offset)
            .field("size", &self.inner.size)
            .field("memory_type_index", &self.inner.heap.memory_type_index)
            .finish()
    }
}

/// One [`ResourceHeap`] per memory type.
pub struct HeapManager {
    dmm: Arc<DeviceMemoryManager>,
    heaps: Vec<ResourceHeap>,
}

impl HeapManager {
    /// Create a heap for every memory type. Device-local-only types use the
    /// device-local page size, everything host visible the smaller one.
    pub fn new(dmm: Arc<DeviceMemoryManager>, clock: Arc<FrameClock>, config: &GpuAllocConfig) -> Self {
        let heaps = dmm
            .memory_properties()
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, memory_type)| {
                let page_size = if memory_type.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
                    config.host_visible_page_size
                } else {
                    config.device_local_page_size
                };
                ResourceHeap::new(
                    dmm.clone(),
                    clock.clone(),
                    index as u32,
                    page_size,
                    config.page_cooldown_frames,
                )
            })
            .collect();
        Self { dmm, heaps }
    }

    /// Heap for one memory type.
    pub fn heap(&self, memory_type_index: u32) -> Option<&ResourceHeap> {
        self.heaps.get(memory_type_index as usize)
    }

    /// Suballocate memory satisfying `requirements` with every flag in
    /// `properties`.
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        properties: MemoryPropertyFlags,
        wants_mapped: bool,
    ) -> Result<PageSuballocation, GpuAllocError> {
        let memory_type = self
            .dmm
            .memory_type_from_properties(requirements.memory_type_bits, properties)
            .ok_or(GpuAllocError::NoSuitableMemoryType)?;
        let heap = self.heap(memory_type).ok_or(GpuAllocError::NoSuitableMemoryType)?;
        heap.allocate(requirements.size, requirements.alignment, wants_mapped)
    }

    /// Suballocate for a usage intent: device-local, upload or download.
    ///
    /// Download memory falls back to uncached host-visible memory on devices
    /// without a cached type.
    pub fn allocate_for_intent(
        &self,
        requirements: &MemoryRequirements,
        intent: GpuMemoryIntent,
    ) -> Result<PageSuballocation, GpuAllocError> {
        let properties = intent.memory_properties();
        match self.allocate_memory(requirements, properties, intent.wants_mapped()) {
            Err(GpuAllocError::NoSuitableMemoryType)
                if properties.contains(MemoryPropertyFlags::HOST_CACHED) =>
            {
                crate::ga_emit_ctx!(GA301, "{:?} memory of {} bytes", intent, requirements.size);
                let fallback = properties.without(MemoryPropertyFlags::HOST_CACHED)
                    | MemoryPropertyFlags::HOST_COHERENT;
                self.allocate_memory(requirements, fallback, intent.wants_mapped())
            }
            other => other,
        }
    }

    /// Destroy at most one expired free page per heap. Returns how many were
    /// destroyed.
    pub fn release_freed_pages(&self) -> usize {
        self.heaps.iter().filter(|h| h.release_freed_pages()).count()
    }

    /// Destroy every free page now.
    pub fn release_all_freed_pages(&self) -> usize {
        self.heaps.iter().map(|h| h.release_all_freed_pages()).sum()
    }

    /// Destroy every page of every heap.
    pub fn deinit(&self) {
        for heap in &self.heaps {
            heap.deinit();
        }
    }

    /// Per-heap occupancy, skipping heaps that never allocated.
    pub fn stats(&self) -> Vec<ResourceHeapStats> {
        self.heaps
            .iter()
            .map(|h| h.stats())
            .filter(|s| s.used_pages + s.free_pages > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ProfilerHooks;
    use crate::gpu::DummyDevice;

    fn setup(page_size: DeviceSize, cooldown: u64) -> (Arc<DummyDevice>, Arc<FrameClock>, ResourceHeap) {
        let device = Arc::new(DummyDevice::new());
        let dmm = Arc::new(DeviceMemoryManager::new(device.clone(), Arc::new(ProfilerHooks::new())));
        let clock = Arc::new(FrameClock::new());
        let heap = ResourceHeap::new(dmm, clock.clone(), 0, page_size, cooldown);
        (device, clock, heap)
    }

    #[test]
    fn test_page_reuse_scenario() {
        let (device, _clock, heap) = setup(1024, 20);

        let first = heap.allocate(100, 16, false).unwrap();
        assert_eq!(first.offset(), 0);
        let second = heap.allocate(50, 16, false).unwrap();
        assert_eq!(second.offset(), 112);
        assert_eq!(heap.stats().live_bytes, 112 + 64);

        drop(first);
        let third = heap.allocate(112, 16, false).unwrap();
        assert_eq!(third.offset(), 0);
        assert_eq!(third.memory(), second.memory());
        assert_eq!(device.live_memory_count(), 1);
    }

    #[test]
    fn test_clone_keeps_range_alive() {
        let (_device, _clock, heap) = setup(1024, 20);
        let a = heap.allocate(256, 16, false).unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(heap.stats().live_suballocations, 1);
        drop(b);
        let stats = heap.stats();
        assert_eq!(stats.live_suballocations, 0);
        assert_eq!((stats.used_pages, stats.free_pages), (0, 1));
    }

    #[test]
    fn test_oversized_request_gets_own_page() {
        let (_device, _clock, heap) = setup(1024, 20);
        let small = heap.allocate(64, 16, false).unwrap();
        let big = heap.allocate(4000, 256, false).unwrap();
        assert_ne!(small.memory(), big.memory());
        assert_eq!(big.offset(), 0);
        assert_eq!(heap.stats().reserved_bytes, 1024 + 4096);
    }

    #[test]
    fn test_cooldown_then_one_page_per_call() {
        let (device, clock, heap) = setup(1024, 3);
        let a = heap.allocate(1024, 16, false).unwrap();
        let b = heap.allocate(1024, 16, false).unwrap();
        drop(a);
        drop(b);
        assert_eq!(heap.stats().free_pages, 2);

        clock.advance();
        clock.advance();
        assert!(!heap.release_freed_pages());

        clock.advance();
        assert!(heap.release_freed_pages());
        assert_eq!(heap.stats().free_pages, 1);
        assert!(heap.release_freed_pages());
        assert!(!heap.release_freed_pages());
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn test_free_page_is_revived() {
        let (device, _clock, heap) = setup(1024, 20);
        drop(heap.allocate(512, 16, false).unwrap());
        assert_eq!(heap.stats().free_pages, 1);

        let again = heap.allocate(128, 16, false).unwrap();
        assert_eq!(again.offset(), 0);
        let stats = heap.stats();
        assert_eq!((stats.used_pages, stats.free_pages), (1, 0));
        assert_eq!(device.live_memory_count(), 1);
    }

    #[test]
    fn test_mapped_state_must_match() {
        let device = Arc::new(DummyDevice::new());
        let dmm = Arc::new(DeviceMemoryManager::new(device.clone(), Arc::new(ProfilerHooks::new())));
        let heap = ResourceHeap::new(dmm, Arc::new(FrameClock::new()), 1, 1024, 20);

        let mapped = heap.allocate(64, 16, true).unwrap();
        let unmapped = heap.allocate(64, 16, false).unwrap();
        assert_ne!(mapped.memory(), unmapped.memory());
        assert!(mapped.mapped_ptr().is_some());
        assert!(unmapped.mapped_ptr().is_none());

        mapped.write(0, b"page").unwrap();
        let mut out = [0u8; 4];
        mapped.read(0, &mut out).unwrap();
        assert_eq!(&out, b"page");
        assert!(mapped.write(62, b"page").is_err());
    }

    #[test]
    fn test_release_all_and_deinit() {
        let (device, _clock, heap) = setup(1024, 20);
        drop(heap.allocate(64, 16, false).unwrap());
        assert_eq!(heap.release_all_freed_pages(), 1);

        let live = heap.allocate(64, 16, false).unwrap();
        heap.deinit();
        assert_eq!(device.live_memory_count(), 0);
        // Late drop after shutdown is inert.
        drop(live);
    }

    #[test]
    fn test_heap_manager_intents() {
        let device = Arc::new(DummyDevice::new());
        let dmm = Arc::new(DeviceMemoryManager::new(device.clone(), Arc::new(ProfilerHooks::new())));
        let config = GpuAllocConfig::minimal();
        let manager = HeapManager::new(dmm, Arc::new(FrameClock::new()), &config);

        let requirements = MemoryRequirements {
            size: 1000,
            alignment: 256,
            memory_type_bits: !0,
        };
        let local = manager.allocate_for_intent(&requirements, GpuMemoryIntent::DeviceOnly).unwrap();
        assert_eq!(local.memory_type_index(), 0);
        assert!(local.mapped_ptr().is_none());

        let upload = manager.allocate_for_intent(&requirements, GpuMemoryIntent::HostVisible).unwrap();
        assert_eq!(upload.memory_type_index(), 1);
        assert!(upload.mapped_ptr().is_some());

        let download = manager.allocate_for_intent(&requirements, GpuMemoryIntent::HostCached).unwrap();
        assert_eq!(download.memory_type_index(), 2);

        assert_eq!(
            manager.heap(0).map(|h| h.page_size()),
            Some(config.device_local_page_size)
        );
        assert_eq!(manager.stats().len(), 3);

        let restricted = MemoryRequirements {
            memory_type_bits: 0b100,
            ..requirements
        };
        assert_eq!(
            manager
                .allocate_for_intent(&restricted, GpuMemoryIntent::DeviceOnly)
                .unwrap_err(),
            GpuAllocError::NoSuitableMemoryType
        );
    }
}
