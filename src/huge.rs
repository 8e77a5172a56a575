use std::{cmp, mem, ptr::NonNull};

use log::debug;

use crate::{
    align::{align_up, MAX_ALIGN},
    header::{at_offset, AllocationTag},
    list::{LinkedList, Node},
    platform::{self, page_size, pages_for, Mapping},
    AllocError, AllocResult,
};

/// Header size padded so that the returned pointer is aligned to
/// [`MAX_ALIGN`].
pub(crate) const HUGE_HEADER_SIZE: usize = align_up(mem::size_of::<Node<HugeRegion>>(), MAX_ALIGN);

/// Dedicated mapping for one large allocation:
///
/// ```text
/// +------------------+ <- page start
/// | Node<HugeRegion> |
/// | padding          |
/// +------------------+ <- pointer handed out
/// | size bytes       |
/// |       ...        |
/// +------------------+
/// | unused tail      |
/// +------------------+ <- mapping end, page aligned
/// ```
///
/// Alignments below a page only grow the padding. From a page up, the
/// mapping gets `align / page_size` extra pages, the pointer is the first
/// aligned address past the first page, and the header takes the page right
/// before it:
///
/// ```text
/// +------------------+ <- mapping start
/// | unused head      |
/// +------------------+ <- region start, pointer minus one page
/// | Node<HugeRegion> |
/// +------------------+ <- pointer handed out, aligned to `align`
/// | size bytes       |
/// +------------------+
/// ```
#[repr(C)]
pub(crate) struct HugeRegion {
    /// Always [`AllocationTag::Huge`].
    pub(crate) tag: AllocationTag,
    /// Bytes the caller asked for.
    size: usize,
    mapping: Mapping,
}

/// Serves allocations of half a page or more straight from the kernel. They
/// never go through the page cache because every request needs a different
/// number of pages.
pub(crate) struct HugeAllocator {
    regions: LinkedList<HugeRegion>,
}

impl HugeAllocator {
    pub const fn new() -> Self {
        Self {
            regions: LinkedList::new(),
        }
    }

    /// Number of live regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn allocate(&mut self, size: usize) -> AllocResult {
        self.allocate_aligned(size, MAX_ALIGN)
    }

    /// Maps a region whose content is aligned to `align`, which must be a
    /// power of two.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> AllocResult {
        let align = cmp::max(align, MAX_ALIGN);
        let page = page_size();

        let pages = if align < page {
            size.checked_add(align_up(HUGE_HEADER_SIZE, align)).map(pages_for)
        } else {
            pages_for(cmp::max(size, 1)).checked_add(align / page)
        }
        .ok_or(AllocError::OutOfMemory { length: usize::MAX })?;

        let mapping = platform::map(pages)?;
        let start = mapping.address().as_ptr() as usize;

        // Offsets of the header and the content from the mapping start.
        let (header, content) = if align < page {
            (0, align_up(HUGE_HEADER_SIZE, align))
        } else {
            let content = align_up(start + page, align) - start;
            (content - page, content)
        };

        debug_assert!(size == 0 || mapping.contains(start + content + size - 1));

        let region = HugeRegion {
            tag: AllocationTag::Huge,
            size,
            mapping,
        };

        unsafe {
            let header = at_offset::<u8>(mapping.address(), header);
            debug!("huge region of {size} bytes at {header:?}, {} pages", mapping.pages());
            self.regions.push_front(region, header);
            Ok(at_offset(mapping.address(), content))
        }
    }

    /// Unmaps the region.
    ///
    /// # Safety
    ///
    /// `region` must be a live region of this allocator.
    pub unsafe fn free(&mut self, region: NonNull<Node<HugeRegion>>) {
        let mapping = region.as_ref().data.mapping;
        self.regions.remove(region);
        debug!("releasing huge region at {:?}", mapping.address());
        platform::unmap(mapping);
    }

    /// Exact size requested when `region` was allocated.
    ///
    /// # Safety
    ///
    /// `region` must be a live region.
    #[inline]
    pub unsafe fn size_of(region: NonNull<Node<HugeRegion>>) -> usize {
        region.as_ref().data.size
    }

    pub unsafe fn release_all(&mut self) {
        for region in self.regions.iter() {
            platform::unmap(region.as_ref().data.mapping);
        }
        self.regions = LinkedList::new();
    }
}
