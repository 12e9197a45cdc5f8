//! Backing Memory - the region an arena carves its sub-arenas from.
//!
//! Memory is acquired once through a [`BackingProvider`] and released once
//! when the [`Region`] drops. Providers are injectable so the allocator core
//! can run without NUMA hardware or huge pages; every platform-specific
//! request degrades to an ordinary mapping when it cannot be honoured.

use std::alloc::Layout;
use std::fmt;
use std::io;
use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::branchless::align_up;
use crate::error::Result;

/// Every region base is aligned to this many bytes.
pub const REGION_ALIGN: usize = 4096;

/// Huge page granularity requested when `huge_pages` is set.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// What the arena asks of its backing memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegionOptions {
    /// Prefer huge pages
    pub huge_pages: bool,
    /// Prefer this NUMA node
    pub numa_node: Option<u32>,
}

/// A raw block of memory handed out by a provider.
///
/// Plain data: ownership is tracked by [`Region`], not by this type.
#[derive(Clone, Copy, Debug)]
pub struct RawRegion {
    ptr: NonNull<u8>,
    len: usize,
    huge: bool,
    numa_bound: bool,
}

impl RawRegion {
    /// Describe memory obtained by a provider.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes, aligned to
    /// [`REGION_ALIGN`], and zero-initialised.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, huge: bool, numa_bound: bool) -> Self {
        Self { ptr, len, huge, numa_bound }
    }

    /// Base pointer.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for a zero-length region.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Source of backing memory for an arena.
pub trait BackingProvider: Send {
    /// Short name for logs and stats.
    fn name(&self) -> &'static str;

    /// Acquire at least `size` bytes of zeroed memory aligned to
    /// [`REGION_ALIGN`]. Requests the provider cannot honour (huge pages,
    /// NUMA binding) fall back to ordinary memory rather than failing.
    fn acquire(&self, size: usize, options: &RegionOptions) -> Result<RawRegion>;

    /// Return memory to the system.
    ///
    /// # Safety
    /// `region` must come from `acquire` on this provider and must not be
    /// used afterward.
    unsafe fn release(&self, region: RawRegion) -> Result<()>;
}

/// Portable provider backed by the global allocator.
///
/// Ignores huge-page and NUMA requests.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapProvider;

impl HeapProvider {
    fn layout(size: usize) -> Result<Layout> {
        Layout::from_size_align(align_up(size.max(1), REGION_ALIGN), REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e).into())
    }
}

impl BackingProvider for HeapProvider {
    fn name(&self) -> &'static str {
        "heap"
    }

    fn acquire(&self, size: usize, _options: &RegionOptions) -> Result<RawRegion> {
        let layout = Self::layout(size)?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "global allocator returned null")
        })?;
        // SAFETY: fresh zeroed allocation of `layout.size()` bytes, aligned.
        Ok(unsafe { RawRegion::new(ptr, layout.size(), false, false) })
    }

    unsafe fn release(&self, region: RawRegion) -> Result<()> {
        let layout = Self::layout(region.len)?;
        std::alloc::dealloc(region.ptr.as_ptr(), layout);
        Ok(())
    }
}

/// Provider backed by anonymous memory mappings.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapProvider;

#[cfg(unix)]
impl MmapProvider {
    fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            REGION_ALIGN
        }
    }

    fn map(len: usize, extra_flags: libc::c_int) -> io::Result<NonNull<u8>> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
    }

    #[cfg(target_os = "linux")]
    fn map_huge(len: usize) -> io::Result<NonNull<u8>> {
        Self::map(len, libc::MAP_HUGETLB)
    }

    #[cfg(not(target_os = "linux"))]
    fn map_huge(_len: usize) -> io::Result<NonNull<u8>> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "huge pages unsupported"))
    }
}

#[cfg(unix)]
impl BackingProvider for MmapProvider {
    fn name(&self) -> &'static str {
        "mmap"
    }

    fn acquire(&self, size: usize, options: &RegionOptions) -> Result<RawRegion> {
        let mut huge = false;
        let mut mapping = None;

        if options.huge_pages {
            let len = align_up(size.max(1), HUGE_PAGE_SIZE);
            match Self::map_huge(len) {
                Ok(ptr) => {
                    huge = true;
                    mapping = Some((ptr, len));
                }
                Err(err) => warn!(size, error = %err, "huge pages unavailable, using ordinary mapping"),
            }
        }

        let (ptr, len) = match mapping {
            Some(found) => found,
            None => {
                let len = align_up(size.max(1), Self::page_size().max(REGION_ALIGN));
                (Self::map(len, 0)?, len)
            }
        };

        let numa_bound = match options.numa_node {
            Some(node) => match bind_to_node(ptr, len, node) {
                Ok(()) => true,
                Err(err) => {
                    warn!(node, error = %err, "NUMA binding unavailable, memory left unbound");
                    false
                }
            },
            None => false,
        };

        // SAFETY: fresh anonymous mapping, zero-filled and page-aligned.
        Ok(unsafe { RawRegion::new(ptr, len, huge, numa_bound) })
    }

    unsafe fn release(&self, region: RawRegion) -> Result<()> {
        if libc::munmap(region.ptr.as_ptr().cast(), region.len) != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

/// Prefer `node` for every page of the mapping.
#[cfg(target_os = "linux")]
fn bind_to_node(ptr: NonNull<u8>, len: usize, node: u32) -> io::Result<()> {
    const MPOL_PREFERRED: libc::c_long = 1;
    let bits = std::mem::size_of::<libc::c_ulong>() * 8;
    let words = node as usize / bits + 1;
    let mut mask = vec![0 as libc::c_ulong; words];
    mask[node as usize / bits] |= 1 << (node as usize % bits);

    // SAFETY: the range is a live mapping owned by the caller and the mask
    // buffer outlives the call. The kernel reads `maxnode - 1` bits.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr.as_ptr(),
            len as libc::c_ulong,
            MPOL_PREFERRED,
            mask.as_ptr(),
            (words * bits + 1) as libc::c_ulong,
            0 as libc::c_uint,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn bind_to_node(_ptr: NonNull<u8>, _len: usize, _node: u32) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "NUMA binding unsupported"))
}

/// NUMA node of the CPU the calling thread is running on (0 if unknown).
pub fn current_numa_node() -> u32 {
    #[cfg(target_os = "linux")]
    {
        let mut cpu: libc::c_uint = 0;
        let mut node: libc::c_uint = 0;
        // SAFETY: both out-pointers are valid; the cache argument may be null.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_getcpu,
                &mut cpu as *mut libc::c_uint,
                &mut node as *mut libc::c_uint,
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == 0 {
            return node;
        }
    }
    0
}

/// The provider used by [`crate::Arena::new`]: anonymous mappings on unix,
/// the global allocator elsewhere.
pub fn default_provider() -> Box<dyn BackingProvider> {
    #[cfg(unix)]
    {
        Box::new(MmapProvider)
    }
    #[cfg(not(unix))]
    {
        Box::new(HeapProvider)
    }
}

/// Exclusively owned backing memory, exposed as a byte slice.
///
/// All header and payload access goes through offsets into this slice, so
/// bounds are checked by ordinary indexing.
pub struct Region {
    raw: RawRegion,
    provider: Box<dyn BackingProvider>,
}

// SAFETY: the region is the sole owner of its memory; moving it to another
// thread moves that ownership with it.
unsafe impl Send for Region {}

impl Region {
    /// Acquire `size` bytes from `provider`.
    pub fn new(size: usize, options: RegionOptions, provider: Box<dyn BackingProvider>) -> Result<Self> {
        let raw = provider.acquire(size, &options)?;
        debug_assert!(raw.len >= size);
        debug_assert_eq!(raw.ptr.as_ptr() as usize % REGION_ALIGN, 0);
        debug!(
            provider = provider.name(),
            requested = size,
            len = raw.len,
            huge = raw.huge,
            numa_bound = raw.numa_bound,
            "region acquired"
        );
        Ok(Self { raw, provider })
    }

    /// Length in bytes (may exceed the requested size).
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len
    }

    /// Returns true for a zero-length region.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.len == 0
    }

    /// Absolute address of offset 0.
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.raw.ptr.as_ptr() as usize
    }

    /// Whether the region ended up on huge pages.
    #[inline]
    pub fn is_huge(&self) -> bool {
        self.raw.huge
    }

    /// Whether a NUMA preference was applied.
    #[inline]
    pub fn is_numa_bound(&self) -> bool {
        self.raw.numa_bound
    }

    /// Name of the provider that owns the memory.
    #[inline]
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// The whole region.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `raw` is valid for `len` bytes for as long as `self` lives,
        // and `&self` forbids concurrent mutation.
        unsafe { std::slice::from_raw_parts(self.raw.ptr.as_ptr(), self.raw.len) }
    }

    /// The whole region, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.raw.ptr.as_ptr(), self.raw.len) }
    }

    /// Touch one byte per page so the OS maps every page now rather than
    /// on first use in the hot path.
    pub fn prefault(&mut self) {
        let bytes = self.as_mut_slice();
        for page in (0..bytes.len()).step_by(REGION_ALIGN) {
            // SAFETY: `page < len`; volatile so the store is not elided.
            unsafe { std::ptr::write_volatile(bytes.as_mut_ptr().add(page), 0) };
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `raw` came from this provider and is never used again.
        if let Err(err) = unsafe { self.provider.release(self.raw) } {
            warn!(provider = self.provider.name(), error = %err, "failed to release region");
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("provider", &self.provider.name())
            .field("len", &self.raw.len)
            .field("huge", &self.raw.huge)
            .field("numa_bound", &self.raw.numa_bound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_heap_region_is_aligned_and_zeroed() {
        let region = Region::new(5000, RegionOptions::default(), Box::new(HeapProvider)).unwrap();
        assert_eq!(region.base_addr() % REGION_ALIGN, 0);
        assert!(region.len() >= 5000);
        assert!(region.as_slice().iter().all(|&b| b == 0));
        assert_eq!(region.provider_name(), "heap");
        assert!(!region.is_huge());
    }

    #[test]
    fn test_region_write_read() {
        let mut region = Region::new(4096, RegionOptions::default(), Box::new(HeapProvider)).unwrap();
        region.as_mut_slice()[100] = 42;
        region.prefault();
        assert_eq!(region.as_slice()[100], 42);
        assert_eq!(region.as_slice()[0], 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_mmap_region_with_fallbacks() {
        let options = RegionOptions {
            huge_pages: true,
            numa_node: Some(current_numa_node()),
        };
        let mut region = Region::new(10_000, options, Box::new(MmapProvider)).unwrap();
        assert_eq!(region.base_addr() % REGION_ALIGN, 0);
        assert!(region.len() >= 10_000);
        region.as_mut_slice()[9_999] = 7;
        assert_eq!(region.as_slice()[9_999], 7);
    }

    /// Counts acquisitions and releases to verify single release on drop.
    struct CountingProvider {
        released: Arc<AtomicUsize>,
    }

    impl BackingProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn acquire(&self, size: usize, options: &RegionOptions) -> Result<RawRegion> {
            HeapProvider.acquire(size, options)
        }

        unsafe fn release(&self, region: RawRegion) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            HeapProvider.release(region)
        }
    }

    #[test]
    fn test_region_released_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let provider = CountingProvider { released: Arc::clone(&released) };
        let region = Region::new(2048, RegionOptions::default(), Box::new(provider)).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(region);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
