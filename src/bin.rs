use std::{cmp, mem, ptr::NonNull};

use log::debug;

use crate::{
    align::{align_up, ceil_log2, MAX_ALIGN},
    bitvec::BitVector,
    cache::PageCache,
    header::{at_offset, AllocationTag},
    list::{LinkedList, Node},
    platform::{self, page_size, Mapping},
    AllocError, AllocResult, Pointer,
};

/// Complete bin header size in bytes, list links included.
pub(crate) const BIN_HEADER_SIZE: usize = mem::size_of::<Node<Bin>>();

/// How many bins of a class we look at before giving up and mapping a new
/// one.
const BIN_SCAN_LIMIT: usize = 3;

/// One page dedicated to slots of a single size. The header is the first
/// thing in the page, followed by the bit vector words and then the slots:
///
/// ```text
/// +------------------+  <- page start (tag lives here)
/// | Node<Bin>        |
/// +------------------+
/// | bit vector words |
/// +------------------+
/// | padding          |  <- up to min(slot_size, 16) alignment
/// +------------------+  <- slot_base
/// | slot 0           |
/// | slot 1           |
/// | ...              |
/// | slot N - 1       |
/// +------------------+
/// | unused tail      |
/// +------------------+  <- page end
/// ```
#[repr(C)]
pub(crate) struct Bin {
    /// Always [`AllocationTag::Bin`].
    pub(crate) tag: AllocationTag,
    /// The page this bin lives in.
    mapping: Mapping,
    /// Address of slot 0.
    slot_base: NonNull<u8>,
    /// Size of every slot, a power of two.
    slot_size: usize,
    /// Marked bits are slots in use.
    bits: BitVector,
}

/// Number of slots that fit in a page for `slot_size` byte slots and the
/// offset of the first slot from the start of the page.
///
/// The bit vector lives between the header and the slots and its length
/// depends on the number of slots, so we can't just divide. Start from an
/// overestimate and shrink until everything fits, then grow back one slot at
/// a time, since the shrinking step may remove more slots than necessary.
pub(crate) fn bin_layout(slot_size: usize) -> (usize, usize) {
    let page = page_size();
    let align = cmp::min(slot_size, MAX_ALIGN);

    let offset_for = |slots: usize| align_up(BIN_HEADER_SIZE + BitVector::size_for(slots), align);
    let fits = |slots: usize| offset_for(slots) + slots * slot_size <= page;

    let mut slots = (page - BIN_HEADER_SIZE) / slot_size;

    while !fits(slots) {
        slots = page.saturating_sub(offset_for(slots)) / slot_size;
    }

    while fits(slots + 1) {
        slots += 1;
    }

    (slots, offset_for(slots))
}

/// Allocator for objects of `1, 2, 4, ..., 2^(BINS - 1)` bytes. Every size
/// class keeps its own list of bins:
///
/// ```text
///             +-----+    +-----+    +-----+
/// classes[0]: | Bin | -> | Bin | -> | Bin |       1 byte slots
///             +-----+    +-----+    +-----+
///             +-----+
/// classes[1]: | Bin |                             2 byte slots
///             +-----+
///
/// ...
///             +-----+    +-----+
/// classes[N]: | Bin | -> | Bin |                  2^N byte slots
///             +-----+    +-----+
/// ```
///
/// A bin is created when its class has no room left and goes back to the
/// [`PageCache`] as soon as its last slot is freed.
pub(crate) struct BinAllocator<const BINS: usize> {
    /// Bins of each size class, most recently created first.
    classes: [LinkedList<Bin>; BINS],
    /// Last bin we allocated from in each class.
    recent: [Pointer<Node<Bin>>; BINS],
}

impl<const BINS: usize> BinAllocator<BINS> {
    /// Largest size served by this allocator.
    pub const MAX_SIZE: usize = 1 << (BINS - 1);

    pub const fn new() -> Self {
        const CLASS: LinkedList<Bin> = LinkedList::new();
        Self {
            classes: [CLASS; BINS],
            recent: [None; BINS],
        }
    }

    /// Size class index for `size`. Zero goes to the smallest class.
    #[inline]
    pub fn class_of(size: usize) -> usize {
        ceil_log2(size)
    }

    /// Number of live bins in `class`.
    pub fn bins_in_class(&self, class: usize) -> usize {
        self.classes.get(class).map_or(0, LinkedList::len)
    }

    /// Returns a slot that can hold `size` bytes.
    ///
    /// # Safety
    ///
    /// `size` must not exceed [`Self::MAX_SIZE`]. The cache must be the one
    /// this allocator always uses.
    pub unsafe fn allocate<const CACHE: usize>(
        &mut self,
        size: usize,
        cache: &mut PageCache<CACHE>,
    ) -> AllocResult {
        let class = Self::class_of(size);
        debug_assert!(class < BINS);

        // Most of the time the bin we used last still has room.
        if let Some(address) = self.recent[class].and_then(|bin| Self::take_slot(bin)) {
            return Ok(address);
        }

        let bin = match self.roomiest_bin(class) {
            Some(bin) => bin,
            None => self.new_bin(class, cache)?,
        };

        self.recent[class] = Some(bin);

        match Self::take_slot(bin) {
            Some(address) => Ok(address),
            // A bin with free slots always yields one.
            None => unreachable!("bin at {bin:?} reported free slots but had none"),
        }
    }

    /// Releases the slot at `address`. If that was the last used slot in the
    /// bin, the whole page goes back to the cache.
    ///
    /// # Safety
    ///
    /// `address` must be a live slot of `bin`, which must belong to this
    /// allocator.
    pub unsafe fn free<const CACHE: usize>(
        &mut self,
        address: NonNull<u8>,
        mut bin: NonNull<Node<Bin>>,
        cache: &mut PageCache<CACHE>,
    ) {
        let data = &mut bin.as_mut().data;
        let index = (address.as_ptr() as usize - data.slot_base.as_ptr() as usize) / data.slot_size;
        data.bits.unmark(index);

        if !data.bits.all_unmarked() {
            return;
        }

        let class = Self::class_of(data.slot_size);
        let mapping = data.mapping;

        if self.recent[class] == Some(bin) {
            self.recent[class] = bin.as_ref().next;
        }

        self.classes[class].remove(bin);
        debug!("bin of {} byte slots at {:?} is empty, releasing it", 1 << class, mapping.address());
        cache.store_page(mapping);
    }

    /// Usable size of every slot in `bin`.
    ///
    /// # Safety
    ///
    /// `bin` must point to a live bin.
    #[inline]
    pub unsafe fn slot_size(bin: NonNull<Node<Bin>>) -> usize {
        bin.as_ref().data.slot_size
    }

    /// Unmaps every bin, used or not. Pointers into them become dangling.
    pub unsafe fn release_all(&mut self) {
        for class in &mut self.classes {
            for bin in class.iter() {
                platform::unmap(bin.as_ref().data.mapping);
            }
            *class = LinkedList::new();
        }
        self.recent = [None; BINS];
    }

    /// Looks at the first [`BIN_SCAN_LIMIT`] bins of `class` and returns the
    /// one with the most free slots, or the first one with more than a quarter
    /// of its slots free. Full bins are never returned.
    unsafe fn roomiest_bin(&self, class: usize) -> Pointer<Node<Bin>> {
        let mut best = None;
        let mut best_free = 0;

        for bin in self.classes[class].iter().take(BIN_SCAN_LIMIT) {
            let bits = &bin.as_ref().data.bits;

            if bits.free() > best_free {
                best = Some(bin);
                best_free = bits.free();

                if best_free > bits.len() / 4 {
                    break;
                }
            }
        }

        best
    }

    /// Marks the first free slot of `bin` as used and returns its address.
    unsafe fn take_slot(mut bin: NonNull<Node<Bin>>) -> Pointer<u8> {
        let data = &mut bin.as_mut().data;
        let index = data.bits.find_first_free()?;
        data.bits.mark(index);

        Some(at_offset(data.slot_base, index * data.slot_size))
    }

    /// Turns a page from the cache into an empty bin for `class` and links it
    /// at the head of the class list.
    unsafe fn new_bin<const CACHE: usize>(
        &mut self,
        class: usize,
        cache: &mut PageCache<CACHE>,
    ) -> Result<NonNull<Node<Bin>>, AllocError> {
        let mapping = cache.retrieve_page()?;
        let page = mapping.address();
        let slot_size = 1 << class;
        let (slots, offset) = bin_layout(slot_size);

        let bits = BitVector::new(at_offset(page, BIN_HEADER_SIZE), slots);

        let bin = Bin {
            tag: AllocationTag::Bin,
            mapping,
            slot_base: at_offset(page, offset),
            slot_size,
            bits,
        };

        debug!("new bin of {slot_size} byte slots at {page:?} with {slots} slots");

        Ok(self.classes[class].push_front(bin, page))
    }
}
