//! Per-frame scratch allocator.
//!
//! Each frame-in-flight slot owns a mapped "tape" buffer that is bump
//! allocated and rewound when the slot comes around again, by which time the
//! GPU has finished with the frame that used it. A full tape is retired to the
//! slot's superseded list and replaced by a bigger one; retired tapes are
//! destroyed on the slot's next reset.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::allocators::buffer_pool::create_mapped_buffer;
use crate::allocators::device_memory::{DeviceMemoryAllocation, DeviceMemoryManager};
use crate::gpu::{BufferHandle, BufferUsage, DeviceSize, GpuAllocError, MemoryPropertyFlags};
use crate::sync::mutex::Mutex;
use crate::util::layout::checked_align_up_any;

struct Tape {
    buffer: BufferHandle,
    memory: DeviceMemoryAllocation,
    capacity: DeviceSize,
    head: DeviceSize,
}

impl Tape {
    fn bump(&mut self, size: DeviceSize, alignment: DeviceSize) -> Option<DeviceSize> {
        let aligned = checked_align_up_any(self.head, alignment)?;
        let end = aligned.checked_add(size)?;
        if end > self.capacity {
            return None;
        }
        self.head = end;
        Some(aligned)
    }
}

#[derive(Default)]
struct Slot {
    active: Option<Tape>,
    superseded: Vec<Tape>,
}

struct FrameState {
    slots: Vec<Slot>,
    current: usize,
}

/// One scratch allocation. Valid until its slot is reset.
#[derive(Debug, Clone, Copy)]
pub struct ScratchAllocation {
    ptr: NonNull<u8>,
    buffer: BufferHandle,
    bind_offset: DeviceSize,
    size: DeviceSize,
}

// SAFETY: the pointer targets mapped device memory owned by the allocator.
unsafe impl Send for ScratchAllocation {}
unsafe impl Sync for ScratchAllocation {}

impl ScratchAllocation {
    /// CPU address of the first byte.
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Buffer to bind.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Offset into [`buffer`](Self::buffer) to bind at.
    pub fn bind_offset(&self) -> DeviceSize {
        self.bind_offset
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Copy `data` into the allocation at `offset`.
    ///
    /// # Safety
    ///
    /// The slot this allocation came from must not have been reset since.
    pub unsafe fn write(&self, offset: DeviceSize, data: &[u8]) -> Result<(), GpuAllocError> {
        crate::allocators::device_memory::copy_to_mapped(Some(self.ptr), self.size, offset, data)
    }
}

/// Scratch usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchStats {
    pub slots: usize,
    pub current_slot: usize,
    /// Bytes of tape held across all slots, superseded tapes included.
    pub tape_bytes: DeviceSize,
    /// Bytes bumped in the current slot's active tape.
    pub used_bytes: DeviceSize,
}

/// Bump allocator with one tape per frame in flight.
pub struct FrameScratchAllocator {
    dmm: Arc<DeviceMemoryManager>,
    usage: BufferUsage,
    initial_size: DeviceSize,
    min_alignment: DeviceSize,
    state: Mutex<FrameState>,
}

impl FrameScratchAllocator {
    pub fn new(
        dmm: Arc<DeviceMemoryManager>,
        frames_in_flight: usize,
        initial_size: DeviceSize,
        usage: BufferUsage,
    ) -> Self {
        let min_alignment = dmm.limits().min_uniform_buffer_offset_alignment.max(1);
        let slots = (0..frames_in_flight.max(1)).map(|_| Slot::default()).collect();
        Self {
            dmm,
            usage,
            initial_size,
            min_alignment,
            state: Mutex::new(FrameState { slots, current: 0 }),
        }
    }

    /// Bump-allocate from the current slot.
    ///
    /// The alignment is at least the device's uniform-buffer offset alignment.
    /// When the tape is full it is replaced by one at least twice as big;
    /// earlier allocations stay valid until the slot is reset.
    pub fn alloc(&self, size: DeviceSize, alignment: DeviceSize) -> Result<ScratchAllocation, GpuAllocError> {
        if size == 0 {
            return Err(GpuAllocError::InvalidSize);
        }
        let alignment = alignment.max(self.min_alignment);
        let aligned_size = checked_align_up_any(size, alignment).ok_or(GpuAllocError::InvalidSize)?;

        let tape_size = {
            let mut state = self.state.lock();
            let current = state.current;
            let slot = &mut state.slots[current];
            if let Some(tape) = slot.active.as_mut() {
                if let Some(allocation) = Self::bump(tape, size, alignment) {
                    return Ok(allocation);
                }
            }
            let previous = slot.active.as_ref().map_or(0, |t| t.capacity);
            previous
                .saturating_mul(2)
                .max(self.initial_size)
                .max(aligned_size)
        };

        let mut tape = self.create_tape(tape_size)?;
        let allocation = Self::bump(&mut tape, size, alignment)
            .ok_or_else(|| GpuAllocError::Backend("fresh tape rejected its first allocation".to_string()))?;

        let mut state = self.state.lock();
        let current = state.current;
        let slot = &mut state.slots[current];
        if let Some(old) = slot.active.replace(tape) {
            slot.superseded.push(old);
        }
        Ok(allocation)
    }

    fn bump(tape: &mut Tape, size: DeviceSize, alignment: DeviceSize) -> Option<ScratchAllocation> {
        let offset = tape.bump(size, alignment)?;
        let ptr = tape.memory.mapped_ptr_at(offset)?;
        Some(ScratchAllocation {
            ptr,
            buffer: tape.buffer,
            bind_offset: offset,
            size,
        })
    }

    fn create_tape(&self, capacity: DeviceSize) -> Result<Tape, GpuAllocError> {
        let properties = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        let (buffer, memory) = create_mapped_buffer(&self.dmm, capacity, self.usage, properties)?;
        Ok(Tape {
            buffer,
            memory,
            capacity,
            head: 0,
        })
    }

    fn destroy_tape(&self, tape: Tape) {
        self.dmm.device().destroy_buffer(tape.buffer);
        self.dmm.free(tape.memory);
    }

    /// Rewind `slot` and destroy its superseded tapes.
    pub fn reset_slot(&self, slot: usize) {
        let superseded = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(slot) else {
                return;
            };
            if let Some(tape) = slot.active.as_mut() {
                tape.head = 0;
            }
            std::mem::take(&mut slot.superseded)
        };
        for tape in superseded {
            self.destroy_tape(tape);
        }
    }

    /// Rotate to the next slot and reset it. Returns the new slot index.
    pub fn advance_frame(&self) -> usize {
        let next = {
            let mut state = self.state.lock();
            state.current = (state.current + 1) % state.slots.len();
            state.current
        };
        self.reset_slot(next);
        next
    }

    pub fn current_slot(&self) -> usize {
        self.state.lock().current
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn stats(&self) -> ScratchStats {
        let state = self.state.lock();
        let tape_bytes = state
            .slots
            .iter()
            .flat_map(|s| s.active.iter().chain(s.superseded.iter()))
            .map(|t| t.capacity)
            .sum();
        ScratchStats {
            slots: state.slots.len(),
            current_slot: state.current,
            tape_bytes,
            used_bytes: state.slots[state.current].active.as_ref().map_or(0, |t| t.head),
        }
    }

    /// Destroy every tape.
    pub fn deinit(&self) {
        let tapes: Vec<Tape> = {
            let mut state = self.state.lock();
            state
                .slots
                .iter_mut()
                .flat_map(|s| s.active.take().into_iter().chain(std::mem::take(&mut s.superseded)))
                .collect()
        };
        for tape in tapes {
            self.destroy_tape(tape);
        }
    }
}

impl Drop for FrameScratchAllocator {
    fn drop(&mut self) {
        self.deinit();
    }
}
