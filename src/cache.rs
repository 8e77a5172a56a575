use log::debug;

use crate::{
    platform::{self, Mapping, PARTIAL_RELEASE},
    AllocError,
};

/// Small pool of single pages shared by the bin and free list allocators.
/// Bins and chunks come and go all the time in workloads that allocate and
/// free in bursts, and without the pool every one of them would cost an
/// `mmap` and a `munmap` call.
///
/// ```text
///              retrieve_page()                         store_page()
///                    ^                                      |
///                    |                                      v
/// +--------+--------+--------+--------+    full? ----> munmap right away
/// | page 0 |  None  | page 2 |  None  |
/// +--------+--------+--------+--------+
///     \_________ CAPACITY slots ______/
/// ```
///
/// When the pool runs dry we map `CAPACITY + 1` pages with one call, keep
/// `CAPACITY` of them and hand out the extra one.
pub(crate) struct PageCache<const CAPACITY: usize> {
    pages: [Option<Mapping>; CAPACITY],
}

impl<const CAPACITY: usize> PageCache<CAPACITY> {
    /// Creates an empty cache. Nothing is mapped until the first
    /// [`PageCache::retrieve_page`].
    pub const fn new() -> Self {
        Self {
            pages: [None; CAPACITY],
        }
    }

    /// Number of pooled pages.
    pub fn len(&self) -> usize {
        self.pages.iter().filter(|page| page.is_some()).count()
    }

    /// Hands out one page, refilling the pool if it's empty.
    pub fn retrieve_page(&mut self) -> Result<Mapping, AllocError> {
        match self.pages.iter_mut().find_map(Option::take) {
            Some(page) => Ok(page),
            None => self.refill(),
        }
    }

    /// Takes a page back. If there's no room for it, it goes back to the
    /// kernel instead.
    ///
    /// # Safety
    ///
    /// `page` must be a single page mapping that nobody uses anymore.
    pub unsafe fn store_page(&mut self, page: Mapping) {
        debug_assert_eq!(page.pages(), 1);

        match self.pages.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => *slot = Some(page),
            None => platform::unmap(page),
        }
    }

    fn refill(&mut self) -> Result<Mapping, AllocError> {
        debug!("page cache is empty, mapping {} pages", CAPACITY + 1);

        if !PARTIAL_RELEASE {
            // Pages have to be returned exactly as they were requested on
            // this platform, so request them one by one.
            for slot in &mut self.pages {
                *slot = Some(platform::map(1)?);
            }
            return platform::map(1);
        }

        let mapping = platform::map(CAPACITY + 1)?;
        let mut pages = mapping.into_pages();

        for (slot, page) in self.pages.iter_mut().zip(pages.by_ref()) {
            *slot = Some(page);
        }

        pages.next().ok_or(AllocError::OutOfMemory {
            length: mapping.length(),
        })
    }
}

impl<const CAPACITY: usize> Drop for PageCache<CAPACITY> {
    fn drop(&mut self) {
        for page in self.pages.iter_mut().filter_map(Option::take) {
            unsafe { platform::unmap(page) };
        }
    }
}
