//! Branchless Primitives - size classing and alignment arithmetic.
//!
//! Pure functions with no dependency on allocator state. None of them
//! branch on their input, so their cost is the same for every request.

/// Upper bound (inclusive) of each recyclable size class, in bytes.
pub const CLASS_LIMITS: [usize; 4] = [16, 64, 256, 1024];

/// Number of size classes that own a free list.
pub const FREE_LIST_CLASSES: usize = 4;

/// A size class bucketing requests for free-list reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum SizeClass {
    /// 1..=16 bytes
    Tiny = 0,
    /// 17..=64 bytes
    Small = 1,
    /// 65..=256 bytes
    Medium = 2,
    /// 257..=1024 bytes
    Large = 3,
    /// Anything bigger. Never recycled through a free list.
    Huge = 4,
}

impl SizeClass {
    /// Decode a class from its header byte. Unknown values map to `None`.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SizeClass::Tiny),
            1 => Some(SizeClass::Small),
            2 => Some(SizeClass::Medium),
            3 => Some(SizeClass::Large),
            4 => Some(SizeClass::Huge),
            _ => None,
        }
    }

    /// Index of this class's free list, or `None` for huge blocks.
    #[inline]
    pub const fn free_list(self) -> Option<usize> {
        match self {
            SizeClass::Huge => None,
            other => Some(other as usize),
        }
    }

    /// Returns true if blocks of this class are recycled through a free list.
    #[inline]
    pub const fn is_recyclable(self) -> bool {
        !matches!(self, SizeClass::Huge)
    }
}

/// Classify a request size.
///
/// Each of the four "fits" predicates contributes one bit; the lowest set
/// bit is the smallest class that covers `size`. Bit 4 is always set so a
/// request that fits nowhere lands in [`SizeClass::Huge`].
#[inline]
pub fn size_class(size: usize) -> SizeClass {
    let fits = (size <= CLASS_LIMITS[0]) as u32
        | ((size <= CLASS_LIMITS[1]) as u32) << 1
        | ((size <= CLASS_LIMITS[2]) as u32) << 2
        | ((size <= CLASS_LIMITS[3]) as u32) << 3
        | 1 << 4;
    CLASS_TABLE[fits.trailing_zeros() as usize]
}

const CLASS_TABLE: [SizeClass; 5] = [
    SizeClass::Tiny,
    SizeClass::Small,
    SizeClass::Medium,
    SizeClass::Large,
    SizeClass::Huge,
];

/// Round `size` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two; this is checked once when the
/// configuration is validated, not here.
#[inline(always)]
pub const fn align_up(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

/// Returns true if `value` is a power of two.
///
/// Zero passes this check; callers reject zero separately.
#[inline(always)]
pub const fn is_power_of_two(value: usize) -> bool {
    value & value.wrapping_sub(1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_boundaries() {
        assert_eq!(size_class(1), SizeClass::Tiny);
        assert_eq!(size_class(16), SizeClass::Tiny);
        assert_eq!(size_class(17), SizeClass::Small);
        assert_eq!(size_class(64), SizeClass::Small);
        assert_eq!(size_class(65), SizeClass::Medium);
        assert_eq!(size_class(256), SizeClass::Medium);
        assert_eq!(size_class(257), SizeClass::Large);
        assert_eq!(size_class(1024), SizeClass::Large);
        assert_eq!(size_class(1025), SizeClass::Huge);
        assert_eq!(size_class(usize::MAX), SizeClass::Huge);
    }

    #[test]
    fn test_size_class_matches_naive_scan() {
        for size in 1..4096 {
            let naive = CLASS_LIMITS
                .iter()
                .position(|&limit| size <= limit)
                .unwrap_or(4);
            assert_eq!(size_class(size) as usize, naive, "size {}", size);
        }
    }

    #[test]
    fn test_class_roundtrip() {
        for raw in 0..5u8 {
            let class = SizeClass::from_u8(raw).unwrap();
            assert_eq!(class as u8, raw);
        }
        assert_eq!(SizeClass::from_u8(5), None);
        assert_eq!(SizeClass::Huge.free_list(), None);
        assert_eq!(SizeClass::Large.free_list(), Some(3));
        assert!(!SizeClass::Huge.is_recyclable());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(48, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(48, 16), 48);
        assert_eq!(align_up(49, 16), 64);
    }

    #[test]
    fn test_is_power_of_two() {
        for shift in 0..63 {
            assert!(is_power_of_two(1usize << shift));
        }
        assert!(!is_power_of_two(3));
        assert!(!is_power_of_two(48));
        assert!(!is_power_of_two(100));
    }
}
