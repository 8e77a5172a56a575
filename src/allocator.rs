use std::{
    alloc::{GlobalAlloc, Layout},
    array, cmp,
    ptr::{self, NonNull},
    sync::{Mutex, MutexGuard},
};

use crate::{
    align::MAX_ALIGN,
    bin::BinAllocator,
    cache::PageCache,
    freelist::FreeListAllocator,
    header::{AllocationTag, RegionKind},
    huge::HugeAllocator,
    platform::page_size,
    realloc::ResizePolicy,
    AllocError, AllocResult,
};

/// This is the engine that puts everything together. Once you've read
/// [`crate::header`], [`crate::bin`], [`crate::freelist`] and
/// [`crate::huge`], this is where requests get routed:
///
/// ```text
///                 +-------------------------------------------+
///                 |                 Allocator                 |
///                 +-------------------------------------------+
///                   |                   |                   |
///     size <= MAX_BIN_SIZE   size < page_size / 2       otherwise
///                   |                   |                   |
///                   v                   v                   v
///     +------------------+  +-------------------+  +---------------+
///     | 1 | 2 | 4 |...|N |  | Chunk -> Chunk    |  | Huge -> Huge  |
///     +------------------+  +-------------------+  +---------------+
///                   |                   |                   |
///                   +---------+---------+                   |
///                             v                             |
///                      +-----------+                        |
///                      | PageCache |                        |
///                      +-----------+                        |
///                             |                             |
///                             +--------------+--------------+
///                                            v
///                                       mmap/munmap
/// ```
///
/// `BINS` is the number of bin size classes, so the largest bin slot is
/// `2^(BINS - 1)` bytes. `CACHE` is the number of pages kept around for bins
/// and chunks.
///
/// This struct is not thread safe and it needs mutable borrows to operate,
/// so sharing it requires some container like [`Mutex`]. See [`Binloc`] for
/// that.
///
/// # Drop
///
/// Dropping the allocator returns every region to the kernel, including
/// those that still hold live allocations.
pub struct Allocator<const BINS: usize = 8, const CACHE: usize = 4> {
    /// Small fixed size allocations.
    bins: BinAllocator<BINS>,
    /// Medium allocations.
    free_list: FreeListAllocator,
    /// Everything else.
    huge: HugeAllocator,
    /// Pages shared by `bins` and `free_list`.
    cache: PageCache<CACHE>,
    policy: ResizePolicy,
}

// Regions are owned by exactly one allocator, the raw pointers inside are
// never shared with anything else.
unsafe impl<const BINS: usize, const CACHE: usize> Send for Allocator<BINS, CACHE> {}

/// Snapshot of what an [`Allocator`] currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stats<const BINS: usize = 8> {
    /// Live bins of each size class.
    pub bins: [usize; BINS],
    /// Live free list chunks.
    pub chunks: usize,
    /// Live huge regions.
    pub huge_regions: usize,
    /// Pages waiting in the cache.
    pub cached_pages: usize,
}

impl<const BINS: usize> Stats<BINS> {
    /// Live bins across all classes.
    pub fn total_bins(&self) -> usize {
        self.bins.iter().sum()
    }
}

impl<const BINS: usize, const CACHE: usize> Allocator<BINS, CACHE> {
    /// Largest request served by bins.
    pub const MAX_BIN_SIZE: usize = BinAllocator::<BINS>::MAX_SIZE;

    const VALID: () = assert!(
        BINS >= 1 && BINS <= 10 && CACHE >= 1,
        "BINS must be in 1..=10 and CACHE at least 1"
    );

    /// Builds an allocator with the [`ResizePolicy::Exact`] policy. Nothing
    /// is mapped until the first allocation.
    pub const fn new() -> Self {
        Self::with_resize_policy(ResizePolicy::Exact)
    }

    /// Builds an allocator that decides in place resizes with `policy`.
    pub const fn with_resize_policy(policy: ResizePolicy) -> Self {
        let () = Self::VALID;

        Self {
            bins: BinAllocator::new(),
            free_list: FreeListAllocator::new(),
            huge: HugeAllocator::new(),
            cache: PageCache::new(),
            policy,
        }
    }

    /// Returns an address where `size` bytes can be safely written. Zero
    /// sized requests still get a unique pointer of the smallest class.
    /// Pointers are aligned to `min(size.next_power_of_two(), 16)` in bins and
    /// to 16 otherwise.
    pub fn allocate(&mut self, size: usize) -> AllocResult {
        // SAFETY: the cache is always our own and the size checks below
        // satisfy the preconditions of each sub-allocator.
        unsafe {
            if size <= Self::MAX_BIN_SIZE {
                self.bins.allocate(size, &mut self.cache)
            } else if size < page_size() / 2 {
                self.free_list.allocate(size, &mut self.cache)
            } else {
                self.huge.allocate(size)
            }
        }
    }

    /// Like [`Allocator::allocate`] but the returned address is a multiple of
    /// `align`, which must be a power of two.
    ///
    /// Up to 16 bytes of alignment, small requests are bumped to `align`
    /// bytes so that they land in a bin slot at least as big. Stronger
    /// alignments always get an aligned huge region, whatever their size.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> AllocResult {
        if !align.is_power_of_two() {
            return Err(AllocError::UnsupportedAlignment { align });
        }

        if align > MAX_ALIGN {
            return self.huge.allocate_aligned(size, align);
        }

        self.allocate(cmp::max(size, align))
    }

    /// Allocates `count * size` bytes initialized to zero.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> AllocResult {
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::SizeOverflow { count, size })?;

        let address = self.allocate(total)?;
        // SAFETY: we've just allocated at least `total` bytes.
        unsafe { address.as_ptr().write_bytes(0, total) };

        Ok(address)
    }

    /// Gives the memory at `address` back. Null is ignored.
    ///
    /// # Safety
    ///
    /// `address` must be null or a pointer returned by this allocator that
    /// hasn't been freed yet.
    pub unsafe fn free(&mut self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        match RegionKind::of(address) {
            RegionKind::Bin(bin) => self.bins.free(address, bin, &mut self.cache),
            RegionKind::FreeList(chunk) => self.free_list.free(address, chunk, &mut self.cache),
            RegionKind::Huge(region) => self.huge.free(region),
        }
    }

    /// Changes the size of the allocation at `address`, moving it if needed.
    /// Returns the pointer that owns the contents now:
    ///
    /// - null `address` behaves like [`Allocator::allocate`],
    /// - `new_size == 0` frees `address` and returns `None`,
    /// - if the [`ResizePolicy`] accepts the new size the pointer stays,
    /// - otherwise the first `min(old, new)` bytes are copied to a new
    ///   allocation and the old one is freed.
    ///
    /// On error the old allocation is left untouched.
    ///
    /// # Safety
    ///
    /// Same as [`Allocator::free`].
    pub unsafe fn resize(
        &mut self,
        address: *mut u8,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(address) = NonNull::new(address) else {
            return self.allocate(new_size).map(Some);
        };

        if new_size == 0 {
            self.free(address.as_ptr());
            return Ok(None);
        }

        let current = self.size_of(address);

        if self.policy.keeps_in_place(current, new_size) {
            return Ok(Some(address));
        }

        let new_address = self.allocate(new_size)?;
        self.relocate(address, new_address, cmp::min(current, new_size));

        Ok(Some(new_address))
    }

    /// [`Allocator::resize`] for memory obtained from
    /// [`Allocator::allocate_aligned`]. The result keeps the alignment.
    ///
    /// # Safety
    ///
    /// `address` must be a live allocation of this allocator aligned to
    /// `align`.
    pub unsafe fn resize_aligned(
        &mut self,
        address: NonNull<u8>,
        new_size: usize,
        align: usize,
    ) -> AllocResult {
        let current = self.size_of(address);

        if current == new_size {
            return Ok(address);
        }

        let new_address = self.allocate_aligned(new_size, align)?;
        self.relocate(address, new_address, cmp::min(current, new_size));

        Ok(new_address)
    }

    /// Logical size of the allocation at `address`: the slot size for bins,
    /// the block capacity for the free list and the exact requested size for
    /// huge regions.
    ///
    /// # Safety
    ///
    /// `address` must be a live allocation of this allocator.
    pub unsafe fn size_of(&self, address: NonNull<u8>) -> usize {
        match RegionKind::of(address) {
            RegionKind::Bin(bin) => BinAllocator::<BINS>::slot_size(bin),
            RegionKind::FreeList(_) => FreeListAllocator::block_size(address),
            RegionKind::Huge(region) => HugeAllocator::size_of(region),
        }
    }

    /// Sub-allocator that owns `address`.
    ///
    /// # Safety
    ///
    /// `address` must be a live allocation of this allocator.
    pub unsafe fn tag_of(&self, address: NonNull<u8>) -> AllocationTag {
        RegionKind::of(address).tag()
    }

    /// Current policy for [`Allocator::resize`].
    pub fn resize_policy(&self) -> ResizePolicy {
        self.policy
    }

    pub fn stats(&self) -> Stats<BINS> {
        Stats {
            bins: array::from_fn(|class| self.bins.bins_in_class(class)),
            chunks: self.free_list.chunks(),
            huge_regions: self.huge.len(),
            cached_pages: self.cache.len(),
        }
    }

    /// Copies `count` bytes from `old` to `new` and frees `old`.
    unsafe fn relocate(&mut self, old: NonNull<u8>, new: NonNull<u8>, count: usize) {
        ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), count);
        self.free(old.as_ptr());
    }
}

impl<const BINS: usize, const CACHE: usize> Default for Allocator<BINS, CACHE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BINS: usize, const CACHE: usize> Drop for Allocator<BINS, CACHE> {
    fn drop(&mut self) {
        // Pooled pages are unmapped when the cache itself is dropped, right
        // after this.
        unsafe {
            self.bins.release_all();
            self.free_list.release_all();
            self.huge.release_all();
        }
    }
}

/// Thread safe wrapper around [`Allocator`]. It exposes the classic C
/// allocation functions, which return null on failure, and implements
/// [`GlobalAlloc`].
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// use binloc::Binloc;
///
/// let binloc = Binloc::with_default_config();
///
/// unsafe {
///     let address = binloc.malloc(100);
///     assert!(!address.is_null());
///     assert!(binloc.size_of(address) >= 100);
///
///     let address = binloc.realloc(address, 5000);
///     assert_eq!(binloc.size_of(address), 5000);
///
///     binloc.free(address);
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use binloc::Binloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Binloc = Binloc::with_default_config();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
///
/// Any power of two alignment works. Alignments above 16 bytes get a huge
/// region of their own, so they cost at least a page each.
pub struct Binloc<const BINS: usize = 8, const CACHE: usize = 4> {
    /// One lock for the whole engine. Requests are short and never block on
    /// anything but `mmap`, so finer grained locking hasn't been worth it.
    allocator: Mutex<Allocator<BINS, CACHE>>,
}

impl Binloc {
    /// 8 bin classes (1 to 128 bytes) and 4 cached pages.
    pub const fn with_default_config() -> Self {
        Self::new()
    }
}

impl<const BINS: usize, const CACHE: usize> Binloc<BINS, CACHE> {
    pub const fn new() -> Self {
        Self::with_resize_policy(ResizePolicy::Exact)
    }

    pub const fn with_resize_policy(policy: ResizePolicy) -> Self {
        Self {
            allocator: Mutex::new(Allocator::with_resize_policy(policy)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Allocator<BINS, CACHE>>, AllocError> {
        self.allocator.lock().map_err(|_| AllocError::Poisoned)
    }

    /// Allocates `size` bytes, null on failure.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        into_raw(self.lock().and_then(|mut allocator| allocator.allocate(size)))
    }

    /// Allocates `count * size` zeroed bytes, null on failure or overflow.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        into_raw(self.lock().and_then(|mut allocator| allocator.zero_allocate(count, size)))
    }

    /// See [`Allocator::resize`]. Returns null when `size` is zero and on
    /// failure, in which case `address` is still valid.
    ///
    /// # Safety
    ///
    /// `address` must be null or a live pointer returned by this instance.
    pub unsafe fn realloc(&self, address: *mut u8, size: usize) -> *mut u8 {
        match self.lock().and_then(|mut allocator| allocator.resize(address, size)) {
            Ok(Some(address)) => address.as_ptr(),
            Ok(None) | Err(_) => ptr::null_mut(),
        }
    }

    /// Releases `address`. Null is ignored.
    ///
    /// # Safety
    ///
    /// `address` must be null or a live pointer returned by this instance.
    pub unsafe fn free(&self, address: *mut u8) {
        if let Ok(mut allocator) = self.lock() {
            allocator.free(address);
        }
    }

    /// See [`Allocator::size_of`]. Zero for null.
    ///
    /// # Safety
    ///
    /// `address` must be null or a live pointer returned by this instance.
    pub unsafe fn size_of(&self, address: *mut u8) -> usize {
        match (NonNull::new(address), self.lock()) {
            (Some(address), Ok(allocator)) => allocator.size_of(address),
            _ => 0,
        }
    }

    pub fn stats(&self) -> Result<Stats<BINS>, AllocError> {
        self.lock().map(|allocator| allocator.stats())
    }
}

impl Default for Binloc {
    fn default() -> Self {
        Binloc::with_default_config()
    }
}

fn into_raw(result: AllocResult) -> *mut u8 {
    match result {
        Ok(address) => address.as_ptr(),
        Err(_) => ptr::null_mut(),
    }
}

unsafe impl<const BINS: usize, const CACHE: usize> GlobalAlloc for Binloc<BINS, CACHE> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        into_raw(
            self.lock()
                .and_then(|mut allocator| allocator.allocate_aligned(layout.size(), layout.align())),
        )
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        self.free(address)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let address = self.alloc(layout);
        if !address.is_null() {
            address.write_bytes(0, layout.size());
        }
        address
    }

    unsafe fn realloc(&self, address: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(address) = NonNull::new(address) else {
            return ptr::null_mut();
        };

        into_raw(
            self.lock()
                .and_then(|mut allocator| allocator.resize_aligned(address, new_size, layout.align())),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync,
        thread::{self, ThreadId},
    };

    use super::*;
    use crate::{bin::bin_layout, header::region_start};

    #[test]
    fn routes_by_size() {
        let mut allocator = Allocator::<8, 4>::new();
        let page = page_size();

        let cases = [
            (0, AllocationTag::Bin),
            (1, AllocationTag::Bin),
            (128, AllocationTag::Bin),
            (129, AllocationTag::FreeList),
            (page / 2 - 1, AllocationTag::FreeList),
            (page / 2, AllocationTag::Huge),
            (page, AllocationTag::Huge),
            (10 * page, AllocationTag::Huge),
        ];

        for (size, tag) in cases {
            let address = allocator.allocate(size).unwrap();
            unsafe {
                assert_eq!(allocator.tag_of(address), tag, "size {size}");
                // Classification doesn't change anything.
                assert_eq!(allocator.tag_of(address), tag, "size {size}");
                assert!(allocator.size_of(address) >= size);
                allocator.free(address.as_ptr());
            }
        }

        let stats = allocator.stats();
        assert_eq!(stats.total_bins(), 0);
        assert_eq!(stats.chunks, 0);
        assert_eq!(stats.huge_regions, 0);
    }

    #[test]
    fn max_bin_size_follows_bins() {
        assert_eq!(Allocator::<1, 1>::MAX_BIN_SIZE, 1);
        assert_eq!(Allocator::<4, 1>::MAX_BIN_SIZE, 8);
        assert_eq!(Allocator::<8, 4>::MAX_BIN_SIZE, 128);
        assert_eq!(Allocator::<10, 4>::MAX_BIN_SIZE, 512);

        let mut allocator = Allocator::<4, 2>::new();
        let address = allocator.allocate(9).unwrap();
        unsafe {
            assert_eq!(allocator.tag_of(address), AllocationTag::FreeList);
            allocator.free(address.as_ptr());
        }
    }

    #[test]
    fn page_sized_request_is_huge_with_exact_size() {
        let mut allocator = Allocator::<8, 4>::new();

        let address = allocator.allocate(page_size()).unwrap();
        unsafe {
            assert_eq!(allocator.tag_of(address), AllocationTag::Huge);
            assert_eq!(allocator.size_of(address), page_size());
            assert_eq!(allocator.stats().huge_regions, 1);
            allocator.free(address.as_ptr());
        }
        assert_eq!(allocator.stats().huge_regions, 0);
    }

    #[test]
    fn eight_small_allocations_share_a_bin() {
        let mut allocator = Allocator::<8, 4>::new();

        macro_rules! verify_number_of_bins_per_class {
            ($expected:expr) => {
                assert_eq!(allocator.stats().bins, $expected);
            };
        }

        let addresses: Vec<_> = (0..8).map(|_| allocator.allocate(4).unwrap()).collect();
        verify_number_of_bins_per_class!([0, 0, 1, 0, 0, 0, 0, 0]);

        let base = addresses[0].as_ptr() as usize;
        for (i, address) in addresses.iter().enumerate() {
            assert_eq!(address.as_ptr() as usize, base + 4 * i);
            assert_eq!(region_start(*address), region_start(addresses[0]));
        }

        // First allocation mapped CACHE + 1 pages, kept CACHE of them and
        // used the extra one for the bin.
        assert_eq!(allocator.stats().cached_pages, 4);

        // A chunk takes one page out of the pool.
        let block = allocator.allocate(200).unwrap();
        assert_eq!(allocator.stats().cached_pages, 3);

        unsafe {
            for address in addresses {
                allocator.free(address.as_ptr());
            }

            verify_number_of_bins_per_class!([0; 8]);
            assert_eq!(allocator.stats().cached_pages, 4);

            allocator.free(block.as_ptr());
        }
    }

    #[test]
    fn bins_of_every_class() {
        let mut allocator = Allocator::<8, 4>::new();

        let addresses: Vec<_> = (0..8).map(|class| allocator.allocate(1 << class).unwrap()).collect();
        assert_eq!(allocator.stats().bins, [1; 8]);

        unsafe {
            for (class, address) in addresses.iter().enumerate() {
                assert_eq!(allocator.size_of(*address), 1 << class);
            }
            for address in addresses {
                allocator.free(address.as_ptr());
            }
        }

        assert_eq!(allocator.stats().total_bins(), 0);
    }

    #[test]
    fn bin_reclaimed_after_last_free() {
        let mut allocator = Allocator::<8, 4>::new();
        let (slots, _) = bin_layout(32);

        let addresses: Vec<_> = (0..slots + 1).map(|_| allocator.allocate(32).unwrap()).collect();
        assert_eq!(allocator.stats().bins[5], 2);

        unsafe {
            allocator.free(addresses[slots].as_ptr());
            assert_eq!(allocator.stats().bins[5], 1);

            for address in &addresses[..slots] {
                allocator.free(address.as_ptr());
            }
        }

        assert_eq!(allocator.stats().bins[5], 0);
    }

    #[test]
    fn resize() {
        let mut allocator = Allocator::<8, 4>::new();

        unsafe {
            // Null behaves like allocate.
            let address = allocator.resize(ptr::null_mut(), 10).unwrap().unwrap();
            assert_eq!(allocator.size_of(address), 16);
            address.as_ptr().write_bytes(7, 16);

            // Same logical size keeps the pointer.
            assert_eq!(allocator.resize(address.as_ptr(), 16), Ok(Some(address)));

            // Growing moves and copies everything.
            let grown = allocator.resize(address.as_ptr(), 1000).unwrap().unwrap();
            assert_ne!(grown, address);
            assert_eq!(allocator.tag_of(grown), AllocationTag::FreeList);
            assert!(std::slice::from_raw_parts(grown.as_ptr(), 16).iter().all(|byte| *byte == 7));

            // Shrinking moves too with the default policy.
            let shrunk = allocator.resize(grown.as_ptr(), 900).unwrap().unwrap();
            assert_ne!(shrunk, grown);

            let huge = allocator.resize(shrunk.as_ptr(), 3 * page_size()).unwrap().unwrap();
            assert_eq!(allocator.size_of(huge), 3 * page_size());
            assert!(std::slice::from_raw_parts(huge.as_ptr(), 16).iter().all(|byte| *byte == 7));

            // Zero frees.
            assert_eq!(allocator.resize(huge.as_ptr(), 0), Ok(None));
        }

        let stats = allocator.stats();
        assert_eq!(stats.total_bins() + stats.chunks + stats.huge_regions, 0);
    }

    #[test]
    fn half_shrink_keeps_pointer() {
        let mut allocator = Allocator::<8, 4>::with_resize_policy(ResizePolicy::HalfShrink);
        assert_eq!(allocator.resize_policy(), ResizePolicy::HalfShrink);

        unsafe {
            let address = allocator.allocate(1000).unwrap();
            let current = allocator.size_of(address);

            let same = allocator.resize(address.as_ptr(), current / 2 + 1).unwrap().unwrap();
            assert_eq!(same, address);

            let moved = allocator.resize(same.as_ptr(), current / 2).unwrap().unwrap();
            assert_ne!(moved, address);

            allocator.free(moved.as_ptr());
        }
    }

    #[test]
    fn zero_allocate() {
        let mut allocator = Allocator::<8, 4>::new();

        unsafe {
            // Dirty some memory so that it gets reused. The second block keeps
            // the chunk alive.
            let dirty = allocator.allocate(200).unwrap();
            let keep = allocator.allocate(300).unwrap();
            dirty.as_ptr().write_bytes(0xFF, 200);
            allocator.free(dirty.as_ptr());

            let address = allocator.zero_allocate(25, 8).unwrap();
            assert_eq!(address, dirty);
            assert!(std::slice::from_raw_parts(address.as_ptr(), 200).iter().all(|byte| *byte == 0));
            allocator.free(address.as_ptr());
            allocator.free(keep.as_ptr());
        }

        assert_eq!(
            allocator.zero_allocate(usize::MAX, 2),
            Err(AllocError::SizeOverflow {
                count: usize::MAX,
                size: 2
            })
        );
    }

    #[test]
    fn aligned_allocations() {
        let mut allocator = Allocator::<8, 4>::new();
        let page = page_size();

        let cases = [
            (1, 1, AllocationTag::Bin),
            (1, 16, AllocationTag::Bin),
            (3, 4, AllocationTag::Bin),
            (24, 8, AllocationTag::Bin),
            (200, 8, AllocationTag::FreeList),
            (200, 16, AllocationTag::FreeList),
            (1000, 16, AllocationTag::FreeList),
            (5000, 16, AllocationTag::Huge),
            (8, 32, AllocationTag::Huge),
            (512, 128, AllocationTag::Huge),
            (100, page / 2, AllocationTag::Huge),
            (4096, page, AllocationTag::Huge),
            (1, 2 * page, AllocationTag::Huge),
            (3 * page, 4 * page, AllocationTag::Huge),
        ];

        for (size, align, tag) in cases {
            let address = allocator.allocate_aligned(size, align).unwrap();
            assert_eq!(address.as_ptr() as usize % align, 0, "size {size} align {align}");
            unsafe {
                assert_eq!(allocator.tag_of(address), tag, "size {size} align {align}");
                assert!(allocator.size_of(address) >= size);
                address.as_ptr().write_bytes(0x3C, size);
                allocator.free(address.as_ptr());
            }
        }

        let stats = allocator.stats();
        assert_eq!((stats.total_bins(), stats.chunks, stats.huge_regions), (0, 0, 0));

        assert_eq!(
            allocator.allocate_aligned(8, 24),
            Err(AllocError::UnsupportedAlignment { align: 24 })
        );
    }

    #[test]
    fn resize_keeps_alignment() {
        let mut allocator = Allocator::<8, 4>::new();
        let page = page_size();

        for align in [16, 64, page, 2 * page] {
            unsafe {
                let address = allocator.allocate_aligned(200, align).unwrap();
                address.as_ptr().write_bytes(7, 200);

                let grown = allocator.resize_aligned(address, 3 * page, align).unwrap();
                assert_eq!(grown.as_ptr() as usize % align, 0, "align {align}");
                assert!(std::slice::from_raw_parts(grown.as_ptr(), 200).iter().all(|byte| *byte == 7));

                let shrunk = allocator.resize_aligned(grown, 50, align).unwrap();
                assert_eq!(shrunk.as_ptr() as usize % align, 0, "align {align}");
                assert!(std::slice::from_raw_parts(shrunk.as_ptr(), 50).iter().all(|byte| *byte == 7));

                allocator.free(shrunk.as_ptr());
            }
        }

        let stats = allocator.stats();
        assert_eq!((stats.total_bins(), stats.chunks, stats.huge_regions), (0, 0, 0));
    }

    #[test]
    fn free_null_is_noop() {
        let mut allocator = Allocator::<8, 4>::new();
        unsafe { allocator.free(ptr::null_mut()) };
        assert_eq!(allocator.stats().cached_pages, 0);
    }

    #[test]
    fn drop_releases_live_allocations() {
        let mut allocator = Allocator::<8, 4>::new();

        for size in [8, 300, 1000, 5 * page_size()] {
            let address = allocator.allocate(size).unwrap();
            unsafe { address.as_ptr().write_bytes(1, size) };
        }

        let stats = allocator.stats();
        assert_eq!((stats.total_bins(), stats.chunks, stats.huge_regions), (1, 1, 1));
        drop(allocator);
    }

    #[test]
    fn c_interface() {
        let binloc = Binloc::with_default_config();

        unsafe {
            let address = binloc.malloc(8);
            assert!(!address.is_null());
            address.write_bytes(69, 8);

            let zeroed = binloc.calloc(10, 10);
            assert!((0..100).all(|i| *zeroed.add(i) == 0));
            assert!(binloc.calloc(usize::MAX, usize::MAX).is_null());

            let address = binloc.realloc(address, 64);
            assert!((0..8).all(|i| *address.add(i) == 69));
            assert_eq!(binloc.size_of(address), 64);

            assert!(binloc.realloc(address, 0).is_null());
            binloc.free(zeroed);
            binloc.free(ptr::null_mut());
            assert_eq!(binloc.size_of(ptr::null_mut()), 0);
        }

        let stats = binloc.stats().unwrap();
        assert_eq!(stats.total_bins() + stats.chunks + stats.huge_regions, 0);
    }

    #[test]
    fn global_alloc_interface() {
        let binloc = Binloc::with_default_config();

        unsafe {
            let layout = Layout::array::<u64>(300).unwrap();
            let address = GlobalAlloc::alloc_zeroed(&binloc, layout);
            assert_eq!(address as usize % 8, 0);
            assert!((0..layout.size()).all(|i| *address.add(i) == 0));

            address.write_bytes(42, layout.size());
            let grown = GlobalAlloc::realloc(&binloc, address, layout, 2 * page_size());
            assert!((0..layout.size()).all(|i| *grown.add(i) == 42));

            GlobalAlloc::dealloc(&binloc, grown, Layout::from_size_align(2 * page_size(), 8).unwrap());

            // std needs these for channels and cache padded types.
            for (size, align) in [(512, 128), (64, 64), (4096, 4096), (100, 2 * page_size())] {
                let layout = Layout::from_size_align(size, align).unwrap();
                let address = GlobalAlloc::alloc(&binloc, layout);
                assert!(!address.is_null(), "{layout:?}");
                assert_eq!(address as usize % align, 0, "{layout:?}");
                address.write_bytes(1, size);

                let grown = GlobalAlloc::realloc(&binloc, address, layout, 2 * size);
                assert_eq!(grown as usize % align, 0, "{layout:?}");
                assert_eq!(*grown.add(size - 1), 1);
                GlobalAlloc::dealloc(&binloc, grown, Layout::from_size_align(2 * size, align).unwrap());
            }
        }

        verify_everything_is_released(binloc);
    }

    fn verify_everything_is_released<const BINS: usize, const CACHE: usize>(binloc: Binloc<BINS, CACHE>) {
        let stats = binloc.stats().unwrap();
        assert_eq!(stats.total_bins(), 0);
        assert_eq!(stats.chunks, 0);
        assert_eq!(stats.huge_regions, 0);
    }

    /// All the threads allocate at the same time, wait for each other and then
    /// free at the same time.
    #[test]
    fn multiple_threads_synchronized_allocs_and_frees() {
        let binloc = Binloc::with_default_config();

        let num_threads = 8;

        let barrier = sync::Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| unsafe {
                    let num_elements = 1024;
                    let addr = binloc
                        .malloc(num_elements * std::mem::size_of::<ThreadId>())
                        .cast::<ThreadId>();
                    let id = thread::current().id();

                    for i in 0..num_elements {
                        addr.add(i).write(id);
                    }

                    barrier.wait();

                    // Check memory corruption.
                    for i in 0..num_elements {
                        assert_eq!(*addr.add(i), id);
                    }

                    binloc.free(addr.cast());
                });
            }
        });

        verify_everything_is_released(binloc);
    }

    /// Threads allocate and free interchangeably, going through every
    /// sub-allocator.
    #[test]
    fn multiple_threads_unsynchronized_allocs_and_frees() {
        let binloc = Binloc::with_default_config();

        let num_threads = 8;

        let barrier = sync::Barrier::new(num_threads);

        thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| unsafe {
                    let sizes = [1, 16, 100, 256, 1024, 2048, 4096, 8192];

                    // Miri is really slow, but we don't need as many operations
                    // to find bugs with it.
                    let num_allocs = if cfg!(miri) { 20 } else { 1000 };

                    for size in sizes {
                        barrier.wait();
                        for _ in 0..num_allocs {
                            let addr = binloc.malloc(size);
                            assert!(!addr.is_null());

                            for i in 0..size {
                                *addr.add(i) = (i % 256) as u8;
                            }
                            for i in 0..size {
                                assert_eq!(*addr.add(i), (i % 256) as u8);
                            }

                            binloc.free(addr);
                        }
                    }
                });
            }
        });

        verify_everything_is_released(binloc);
    }
}
