//! Alignment helpers for device offsets.
//!
//! Device sizes are `u64` regardless of the host pointer width.

/// Align an offset down to the given power-of-two alignment.
#[inline]
pub const fn align_down(offset: u64, align: u64) -> u64 {
    offset & !(align - 1)
}

/// Align an offset up to an alignment that may not be a power of two, or
/// `None` if the result does not fit.
///
/// Some devices report texel-buffer alignments like 12 or 24.
#[inline]
pub const fn checked_align_up_any(offset: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        return Some(offset);
    }
    let rem = offset % align;
    if rem == 0 {
        Some(offset)
    } else {
        offset.checked_add(align - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(checked_align_up_any(0, 16), Some(0));
        assert_eq!(checked_align_up_any(1, 16), Some(16));
        assert_eq!(checked_align_up_any(100, 16), Some(112));
        assert_eq!(checked_align_up_any(112, 16), Some(112));
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0, 64), 0);
        assert_eq!(align_down(65, 64), 64);
        assert_eq!(align_down(127, 64), 64);
    }

    #[test]
    fn test_non_power_of_two() {
        assert_eq!(checked_align_up_any(13, 12), Some(24));
        assert_eq!(checked_align_up_any(24, 12), Some(24));
        assert_eq!(checked_align_up_any(5, 1), Some(5));
    }

    #[test]
    fn test_checked_align_overflow() {
        assert_eq!(checked_align_up_any(100, 16), Some(112));
        assert_eq!(checked_align_up_any(13, 12), Some(24));
        assert_eq!(checked_align_up_any(u64::MAX - 8, 1), Some(u64::MAX - 8));
        assert_eq!(checked_align_up_any(u64::MAX - 8, 256), None);
        assert_eq!(checked_align_up_any(u64::MAX - 8, 12), None);
        assert_eq!(checked_align_up_any(u64::MAX - 15, 16), Some(u64::MAX - 15));
    }
}
