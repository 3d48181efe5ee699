//! First-fit free-list sub-allocator over a `[0, capacity)` byte range.
//!
//! Free ranges are kept sorted by offset, never overlapping and never
//! adjacent: every free merges with its neighbours.
//!
//! The allocator knows nothing about device memory. Pages and buffer
//! allocations each own one and translate its offsets.

use crate::gpu::DeviceSize;
use crate::util::layout::checked_align_up_any;

/// One hole in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

impl FreeRange {
    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> DeviceSize {
        self.offset + self.size
    }
}

/// Result of a successful allocation.
///
/// `offset` is the aligned, bindable offset. The span actually consumed is
/// `[range_offset, range_offset + allocated_size)` and is what goes back to
/// [`FreeListAllocator::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListAllocation {
    pub offset: DeviceSize,
    pub range_offset: DeviceSize,
    pub allocated_size: DeviceSize,
}

impl FreeListAllocation {
    /// Bytes lost to alignment at the front of the span.
    #[inline]
    pub const fn padding(&self) -> DeviceSize {
        self.offset - self.range_offset
    }
}

/// First-fit free list with alignment and coalescing.
#[derive(Debug, Clone)]
pub struct FreeListAllocator {
    capacity: DeviceSize,
    ranges: Vec<FreeRange>,
    live_bytes: DeviceSize,
}

impl FreeListAllocator {
    /// A container with one free range spanning `capacity` bytes.
    pub fn new(capacity: DeviceSize) -> Self {
        let ranges = if capacity > 0 {
            vec![FreeRange { offset: 0, size: capacity }]
        } else {
            Vec::new()
        };
        Self {
            capacity,
            ranges,
            live_bytes: 0,
        }
    }

    /// Find the first range that fits `size` bytes at `alignment`.
    ///
    /// Consumes `[range.offset, aligned + size)` from that range, shrinking it
    /// in place or removing it when exactly used up. Returns `None` when no
    /// single range fits; callers then open a new container.
    pub fn try_allocate(&mut self, size: DeviceSize, alignment: DeviceSize) -> Option<FreeListAllocation> {
        if size == 0 {
            return None;
        }
        let alignment = alignment.max(1);

        for index in 0..self.ranges.len() {
            let range = self.ranges[index];
            let Some(aligned) = checked_align_up_any(range.offset, alignment) else {
                continue;
            };
            let Some(end) = aligned.checked_add(size) else {
                continue;
            };
            if end > range.end() {
                continue;
            }

            let consumed = end - range.offset;
            if consumed == range.size {
                self.ranges.remove(index);
            } else {
                let slot = &mut self.ranges[index];
                slot.offset = end;
                slot.size -= consumed;
            }
            self.live_bytes += consumed;

            return Some(FreeListAllocation {
                offset: aligned,
                range_offset: range.offset,
                allocated_size: consumed,
            });
        }
        None
    }

    /// Give `[range_offset, range_offset + allocated_size)` back.
    ///
    /// The span must be one previously returned by [`try_allocate`]. Freeing a
    /// span that overlaps a free range is a programmer error; it is reported
    /// and ignored.
    ///
    /// [`try_allocate`]: FreeListAllocator::try_allocate
    pub fn free(&mut self, range_offset: DeviceSize, allocated_size: DeviceSize) {
        if allocated_size == 0 {
            return;
        }
        let end = range_offset + allocated_size;

        // First range that starts after the freed span.
        let index = self.ranges.partition_point(|r| r.offset < range_offset);

        let overlaps_prev = index > 0 && self.ranges[index - 1].end() > range_offset;
        let overlaps_next = index < self.ranges.len() && self.ranges[index].offset < end;
        let out_of_bounds = end > self.capacity;
        if overlaps_prev || overlaps_next || out_of_bounds {
            crate::ga_assert!(
                false,
                GA103,
                "free [{}, {}) against capacity {} with {} free range(s)",
                range_offset,
                end,
                self.capacity,
                self.ranges.len()
            );
            return;
        }

        self.live_bytes -= allocated_size;

        let merge_prev = index > 0 && self.ranges[index - 1].end() == range_offset;
        let merge_next = index < self.ranges.len() && self.ranges[index].offset == end;

        match (merge_prev, merge_next) {
            (true, true) => {
                let next = self.ranges.remove(index);
                self.ranges[index - 1].size += allocated_size + next.size;
            }
            (true, false) => {
                self.ranges[index - 1].size += allocated_size;
            }
            (false, true) => {
                let next = &mut self.ranges[index];
                next.offset = range_offset;
                next.size += allocated_size;
            }
            (false, false) => {
                self.ranges.insert(
                    index,
                    FreeRange {
                        offset: range_offset,
                        size: allocated_size,
                    },
                );
            }
        }
    }

    /// Total bytes managed.
    #[inline]
    pub fn capacity(&self) -> DeviceSize {
        self.capacity
    }

    /// Bytes currently handed out, alignment padding included.
    #[inline]
    pub fn live_bytes(&self) -> DeviceSize {
        self.live_bytes
    }

    /// Bytes in free ranges.
    #[inline]
    pub fn free_bytes(&self) -> DeviceSize {
        self.capacity - self.live_bytes
    }

    /// The free ranges, sorted by offset.
    pub fn ranges(&self) -> &[FreeRange] {
        &self.ranges
    }

    /// True when a single free range spans the whole container.
    pub fn is_empty(&self) -> bool {
        matches!(self.ranges.as_slice(), [r] if r.offset == 0 && r.size == self.capacity)
    }

    /// Size of the biggest hole.
    pub fn largest_free_range(&self) -> DeviceSize {
        self.ranges.iter().map(|r| r.size).max().unwrap_or(0)
    }

    /// Verify ordering, bounds, non-adjacency and byte accounting.
    pub fn check_invariants(&self) -> bool {
        let mut free = 0;
        let mut prev_end: Option<DeviceSize> = None;
        for range in &self.ranges {
            if range.size == 0 || range.end() > self.capacity {
                return false;
            }
            if let Some(prev_end) = prev_end {
                if range.offset <= prev_end {
                    return false;
                }
            }
            prev_end = Some(range.end());
            free += range.size;
        }
        free + self.live_bytes == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(list: &FreeListAllocator) -> Vec<(DeviceSize, DeviceSize)> {
        list.ranges().iter().map(|r| (r.offset, r.size)).collect()
    }

    #[test]
    fn test_basic_allocation() {
        let mut list = FreeListAllocator::new(1024);
        assert!(list.is_empty());

        let a = list.try_allocate(100, 1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.allocated_size, 100);
        assert_eq!(list.live_bytes(), 100);
        assert_eq!(ranges(&list), vec![(100, 924)]);
        assert!(list.check_invariants());
    }

    #[test]
    fn test_alignment_padding_is_consumed() {
        let mut list = FreeListAllocator::new(1024);
        list.try_allocate(10, 1).unwrap();

        let a = list.try_allocate(16, 64).unwrap();
        assert_eq!(a.offset, 64);
        assert_eq!(a.range_offset, 10);
        assert_eq!(a.allocated_size, 70);
        assert_eq!(a.padding(), 54);
        assert_eq!(a.offset % 64, 0);
        assert!(list.check_invariants());
    }

    #[test]
    fn test_exact_fit_removes_range() {
        let mut list = FreeListAllocator::new(256);
        let a = list.try_allocate(256, 16).unwrap();
        assert_eq!(a.offset, 0);
        assert!(list.ranges().is_empty());
        assert_eq!(list.free_bytes(), 0);
        assert!(list.try_allocate(1, 1).is_none());
        list.free(a.range_offset, a.allocated_size);
        assert!(list.is_empty());
    }

    #[test]
    fn test_round_trip_restores_empty() {
        let mut list = FreeListAllocator::new(4096);
        let allocs: Vec<_> = [(100, 16), (7, 4), (512, 256), (33, 1), (64, 64)]
            .iter()
            .map(|&(size, align)| list.try_allocate(size, align).unwrap())
            .collect();
        assert!(list.check_invariants());

        for a in allocs.iter().rev() {
            list.free(a.range_offset, a.allocated_size);
            assert!(list.check_invariants());
        }
        assert!(list.is_empty());
        assert_eq!(list.live_bytes(), 0);
    }

    #[test]
    fn test_coalesce_either_order() {
        for reverse in [false, true] {
            let mut list = FreeListAllocator::new(300);
            let a = list.try_allocate(100, 1).unwrap();
            let b = list.try_allocate(100, 1).unwrap();
            let c = list.try_allocate(100, 1).unwrap();

            let mut order = vec![a, c, b];
            if reverse {
                order.reverse();
            }
            for alloc in order {
                list.free(alloc.range_offset, alloc.allocated_size);
                assert!(list.check_invariants());
            }
            assert_eq!(ranges(&list), vec![(0, 300)]);
        }
    }

    #[test]
    fn test_adjacent_frees_merge() {
        let mut list = FreeListAllocator::new(100);
        let a = list.try_allocate(10, 1).unwrap();
        let b = list.try_allocate(10, 1).unwrap();
        let _c = list.try_allocate(80, 1).unwrap();

        list.free(b.range_offset, b.allocated_size);
        assert_eq!(ranges(&list), vec![(10, 10)]);
        list.free(a.range_offset, a.allocated_size);
        assert_eq!(ranges(&list), vec![(0, 20)]);
    }

    #[test]
    fn test_fragmentation_rejects_large_request() {
        let mut list = FreeListAllocator::new(100);
        let a = list.try_allocate(10, 1).unwrap();
        let _b = list.try_allocate(40, 1).unwrap();
        let c = list.try_allocate(10, 1).unwrap();
        let _d = list.try_allocate(40, 1).unwrap();
        list.free(a.range_offset, a.allocated_size);
        list.free(c.range_offset, c.allocated_size);

        assert_eq!(ranges(&list), vec![(0, 10), (50, 10)]);
        assert_eq!(list.free_bytes(), 20);
        assert_eq!(list.largest_free_range(), 10);
        assert!(list.try_allocate(15, 1).is_none());
        assert!(list.check_invariants());
    }

    #[test]
    fn test_page_reuse_scenario() {
        // 1024-byte page, requests rounded to the 16-byte alignment.
        let mut list = FreeListAllocator::new(1024);
        let first = list.try_allocate(112, 16).unwrap();
        assert_eq!((first.range_offset, first.allocated_size), (0, 112));

        let second = list.try_allocate(64, 16).unwrap();
        assert_eq!((second.offset, second.allocated_size), (112, 64));

        list.free(first.range_offset, first.allocated_size);
        let third = list.try_allocate(96, 16).unwrap();
        assert_eq!(third.offset, 0);
        assert!(list.check_invariants());
    }

    #[test]
    fn test_zero_capacity_and_zero_size() {
        let mut list = FreeListAllocator::new(0);
        assert!(list.try_allocate(1, 1).is_none());
        assert!(list.check_invariants());

        let mut list = FreeListAllocator::new(64);
        assert!(list.try_allocate(0, 1).is_none());
        assert!(list.is_empty());
    }
}
