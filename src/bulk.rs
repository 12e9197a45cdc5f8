//! Bulk Memory - cache-line-aware fill/copy and advisory prefetch.
//!
//! Every operation has a wide-vector fast path and a portable fallback.
//! The observable result is identical on both paths; only the instruction
//! mix differs. On x86_64 the fast path uses SSE2, which is part of the
//! baseline ISA, so no runtime feature detection is needed.

/// Cache line size assumed throughout the crate.
pub const CACHE_LINE: usize = 64;

/// Width of one vector store on the fast path.
pub const VECTOR_WIDTH: usize = 16;

/// Smallest fill worth taking the vector path for.
pub const VECTOR_FILL_MIN: usize = CACHE_LINE;

/// Smallest copy that bypasses the cache with non-temporal stores.
pub const STREAM_COPY_MIN: usize = 4096;

/// Which path a bulk operation took.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkPath {
    /// Byte-wise / `copy_from_slice` fallback
    Scalar,
    /// Aligned vector stores through the cache
    Vector,
    /// Non-temporal vector stores followed by a store fence
    Streaming,
}

/// One cache line worth of a repeated byte, kept 64-byte aligned so the
/// vector path can load it with aligned loads.
#[repr(C, align(64))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FillPattern {
    bytes: [u8; CACHE_LINE],
}

const _: () = assert!(std::mem::size_of::<FillPattern>() == CACHE_LINE);

impl FillPattern {
    /// The all-zero pattern.
    pub const ZERO: Self = Self::splat(0);

    /// Pattern written over freed payloads when poisoning is enabled.
    pub const POISON: Self = Self::splat(0xDD);

    /// Broadcast `value` across a full cache line.
    #[inline]
    pub const fn splat(value: u8) -> Self {
        Self { bytes: [value; CACHE_LINE] }
    }

    /// The repeated byte.
    #[inline]
    pub const fn value(&self) -> u8 {
        self.bytes[0]
    }
}

impl std::fmt::Debug for FillPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FillPattern({:#04x})", self.value())
    }
}

/// Fill `dst` with `value`.
#[inline]
pub fn fill(dst: &mut [u8], value: u8) -> BulkPath {
    fill_pattern(dst, &FillPattern::splat(value))
}

/// Fill `dst` with a precomputed pattern.
///
/// Takes the vector path when `dst` is at least [`VECTOR_FILL_MIN`] bytes
/// and 16-byte aligned: whole cache lines are written with vector stores and
/// the remainder byte-wise. Otherwise falls back to a byte fill.
pub fn fill_pattern(dst: &mut [u8], pattern: &FillPattern) -> BulkPath {
    #[cfg(target_arch = "x86_64")]
    {
        let len = dst.len();
        if len >= VECTOR_FILL_MIN && (dst.as_ptr() as usize) % VECTOR_WIDTH == 0 {
            let body = len & !(CACHE_LINE - 1);
            // SAFETY: `body <= len`, the destination is 16-byte aligned and
            // the pattern is 64-byte aligned by construction.
            unsafe { x86::fill_lines(dst.as_mut_ptr(), body, pattern) };
            fill_scalar(&mut dst[body..], pattern.value());
            return BulkPath::Vector;
        }
    }
    fill_scalar(dst, pattern.value());
    BulkPath::Scalar
}

#[inline]
fn fill_scalar(dst: &mut [u8], value: u8) {
    for byte in dst.iter_mut() {
        *byte = value;
    }
}

/// Copy `src` into `dst`.
///
/// Copies of at least [`STREAM_COPY_MIN`] bytes with both operands 16-byte
/// aligned use non-temporal stores and fence before returning, so they do
/// not evict the rest of the working set. Everything else is an ordinary
/// copy.
///
/// # Panics
/// Panics if the slices differ in length, like `copy_from_slice`.
#[inline]
pub fn copy(dst: &mut [u8], src: &[u8]) -> BulkPath {
    copy_with(dst, src, true)
}

/// Copy `src` into `dst`, taking the non-temporal path only if `streaming`
/// allows it.
///
/// # Panics
/// Panics if the slices differ in length, like `copy_from_slice`.
pub fn copy_with(dst: &mut [u8], src: &[u8], streaming: bool) -> BulkPath {
    assert_eq!(dst.len(), src.len(), "bulk copy length mismatch");

    #[cfg(target_arch = "x86_64")]
    {
        let len = src.len();
        let aligned = (dst.as_ptr() as usize | src.as_ptr() as usize) % VECTOR_WIDTH == 0;
        if streaming && len >= STREAM_COPY_MIN && aligned {
            let body = len & !(CACHE_LINE - 1);
            // SAFETY: both operands are 16-byte aligned, `body <= len`, and
            // `&mut`/`&` guarantee the ranges do not overlap.
            unsafe { x86::stream_lines(dst.as_mut_ptr(), src.as_ptr(), body) };
            dst[body..].copy_from_slice(&src[body..]);
            return BulkPath::Streaming;
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = streaming;
    dst.copy_from_slice(src);
    BulkPath::Scalar
}

/// Prefetch locality, mirroring the 0-3 temporal-locality hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Locality {
    /// Use once, do not pollute the cache
    NonTemporal = 0,
    /// Keep in outer cache levels only
    Low = 1,
    /// Keep in L2
    Moderate = 2,
    /// Keep in L1
    High = 3,
}

impl Locality {
    /// Map a 0-3 temporal-locality hint onto a prefetch locality.
    #[inline]
    pub const fn from_hint(hint: u8) -> Self {
        match hint {
            0 => Locality::NonTemporal,
            1 => Locality::Low,
            2 => Locality::Moderate,
            _ => Locality::High,
        }
    }
}

/// Advisory prefetch of the cache line containing `addr`.
///
/// Prefetch instructions never fault, so any address is accepted.
/// A no-op on targets without a prefetch instruction.
#[inline(always)]
pub fn prefetch(addr: *const u8, locality: Locality) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint and cannot fault on any address.
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_NTA, _MM_HINT_T0, _MM_HINT_T1, _MM_HINT_T2};
        let p = addr as *const i8;
        match locality {
            Locality::High => _mm_prefetch(p, _MM_HINT_T0),
            Locality::Moderate => _mm_prefetch(p, _MM_HINT_T1),
            Locality::Low => _mm_prefetch(p, _MM_HINT_T2),
            Locality::NonTemporal => _mm_prefetch(p, _MM_HINT_NTA),
        }
    }

    #[cfg(target_arch = "aarch64")]
    // SAFETY: prfm is a hint and cannot fault on any address.
    unsafe {
        match locality {
            Locality::High | Locality::Moderate => {
                std::arch::asm!("prfm pldl1keep, [{}]", in(reg) addr, options(nostack, preserves_flags));
            }
            Locality::Low => {
                std::arch::asm!("prfm pldl2keep, [{}]", in(reg) addr, options(nostack, preserves_flags));
            }
            Locality::NonTemporal => {
                std::arch::asm!("prfm pldl1strm, [{}]", in(reg) addr, options(nostack, preserves_flags));
            }
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    let _ = (addr, locality);
}

/// Prefetch every cache line overlapping `[start, start + len)`.
///
/// Returns the number of lines hinted.
#[inline]
pub fn prefetch_range(start: *const u8, len: usize, locality: Locality) -> usize {
    if len == 0 {
        return 0;
    }
    let first = start as usize & !(CACHE_LINE - 1);
    let end = start as usize + len;
    let mut line = first;
    let mut count = 0;
    while line < end {
        prefetch(line as *const u8, locality);
        line += CACHE_LINE;
        count += 1;
    }
    count
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::{FillPattern, CACHE_LINE, VECTOR_WIDTH};
    use std::arch::x86_64::{
        __m128i, _mm_load_si128, _mm_sfence, _mm_store_si128, _mm_stream_si128,
    };

    /// Write `len` bytes (a multiple of the cache line) with aligned stores.
    ///
    /// # Safety
    /// `dst` must be 16-byte aligned and valid for `len` bytes of writes.
    #[inline]
    pub(super) unsafe fn fill_lines(dst: *mut u8, len: usize, pattern: &FillPattern) {
        debug_assert_eq!(len % CACHE_LINE, 0);
        let v = _mm_load_si128(pattern as *const FillPattern as *const __m128i);
        let mut offset = 0;
        while offset < len {
            let line = dst.add(offset);
            _mm_store_si128(line as *mut __m128i, v);
            _mm_store_si128(line.add(VECTOR_WIDTH) as *mut __m128i, v);
            _mm_store_si128(line.add(2 * VECTOR_WIDTH) as *mut __m128i, v);
            _mm_store_si128(line.add(3 * VECTOR_WIDTH) as *mut __m128i, v);
            offset += CACHE_LINE;
        }
    }

    /// Copy `len` bytes (a multiple of the cache line) with non-temporal
    /// stores, then fence.
    ///
    /// # Safety
    /// Both pointers must be 16-byte aligned, valid for `len` bytes, and the
    /// ranges must not overlap.
    #[inline]
    pub(super) unsafe fn stream_lines(dst: *mut u8, src: *const u8, len: usize) {
        debug_assert_eq!(len % CACHE_LINE, 0);
        let mut offset = 0;
        while offset < len {
            let s = src.add(offset) as *const __m128i;
            let d = dst.add(offset) as *mut __m128i;
            let a = _mm_load_si128(s);
            let b = _mm_load_si128(s.add(1));
            let c = _mm_load_si128(s.add(2));
            let e = _mm_load_si128(s.add(3));
            _mm_stream_si128(d, a);
            _mm_stream_si128(d.add(1), b);
            _mm_stream_si128(d.add(2), c);
            _mm_stream_si128(d.add(3), e);
            offset += CACHE_LINE;
        }
        _mm_sfence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(64))]
    struct Aligned([u8; 8192]);

    fn aligned() -> Box<Aligned> {
        Box::new(Aligned([0u8; 8192]))
    }

    #[test]
    fn test_fill_pattern_size() {
        assert_eq!(std::mem::size_of::<FillPattern>(), 64);
        assert_eq!(std::mem::align_of::<FillPattern>(), 64);
        assert_eq!(FillPattern::POISON.value(), 0xDD);
    }

    #[test]
    fn test_fill_matches_naive_on_every_offset() {
        let mut buf = aligned();
        for start in 0..20 {
            for len in [0usize, 1, 15, 63, 64, 65, 200, 1000] {
                buf.0.iter_mut().for_each(|b| *b = 0x11);
                fill(&mut buf.0[start..start + len], 0xAB);
                for (i, b) in buf.0.iter().enumerate().take(start + len + 64) {
                    let expected = if i >= start && i < start + len { 0xAB } else { 0x11 };
                    assert_eq!(*b, expected, "start {} len {} byte {}", start, len, i);
                }
            }
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_fill_takes_vector_path_when_aligned() {
        let mut buf = aligned();
        assert_eq!(fill(&mut buf.0[..200], 7), BulkPath::Vector);
        assert_eq!(fill(&mut buf.0[1..201], 7), BulkPath::Scalar);
        assert_eq!(fill(&mut buf.0[..32], 7), BulkPath::Scalar);
    }

    #[test]
    fn test_copy_matches_naive() {
        let mut src = aligned();
        for (i, b) in src.0.iter_mut().enumerate() {
            *b = (i * 31 % 251) as u8;
        }
        for &(offset, len) in &[(0usize, 8000usize), (3, 5000), (0, 100), (16, 4096)] {
            let mut dst = aligned();
            copy(&mut dst.0[offset..offset + len], &src.0[offset..offset + len]);
            assert_eq!(&dst.0[offset..offset + len], &src.0[offset..offset + len]);
            assert!(dst.0[..offset].iter().all(|&b| b == 0));
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_copy_streams_large_aligned() {
        let src = aligned();
        let mut dst = aligned();
        assert_eq!(copy(&mut dst.0[..], &src.0[..]), BulkPath::Streaming);
        assert_eq!(copy(&mut dst.0[..100], &src.0[..100]), BulkPath::Scalar);
        assert_eq!(copy(&mut dst.0[1..5001], &src.0[1..5001]), BulkPath::Scalar);
    }

    #[test]
    fn test_copy_without_streaming_stays_cached() {
        let mut src = aligned();
        src.0.iter_mut().for_each(|b| *b = 0x5A);
        let mut dst = aligned();
        assert_eq!(copy_with(&mut dst.0[..], &src.0[..], false), BulkPath::Scalar);
        assert!(dst.0.iter().all(|&b| b == 0x5A));
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn test_copy_length_mismatch_panics() {
        let mut dst = [0u8; 4];
        copy(&mut dst, &[1, 2, 3]);
    }

    #[test]
    fn test_prefetch_range_counts_lines() {
        let buf = aligned();
        let base = buf.0.as_ptr();
        assert_eq!(prefetch_range(base, 0, Locality::High), 0);
        assert_eq!(prefetch_range(base, 1, Locality::High), 1);
        assert_eq!(prefetch_range(base, 128, Locality::Low), 2);
        // Straddles a line boundary
        assert_eq!(prefetch_range(unsafe { base.add(60) }, 8, Locality::Moderate), 2);
    }

    #[test]
    fn test_locality_from_hint() {
        assert_eq!(Locality::from_hint(0), Locality::NonTemporal);
        assert_eq!(Locality::from_hint(3), Locality::High);
        assert_eq!(Locality::from_hint(9), Locality::High);
    }
}
