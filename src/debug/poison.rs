//! Memory poisoning for debugging.
//!
//! Host-visible ranges are filled with a known pattern when they are given
//! back, so a CPU write through a stale pointer shows up in captures.

/// Pattern used to poison freed memory.
pub const FREED_PATTERN: u8 = 0xCD;

/// Poison a region of mapped memory with the freed pattern.
///
/// # Safety
///
/// The memory region must be valid, mapped and writable, and no other
/// suballocation may overlap it.
pub unsafe fn poison_freed(ptr: *mut u8, size: usize) {
    std::ptr::write_bytes(ptr, FREED_PATTERN, size);
}

/// Returns true if every byte matches the freed pattern.
pub fn is_freed_poison(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == FREED_PATTERN)
}
