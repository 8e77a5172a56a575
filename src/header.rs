//! Metadata recovery. This is the only place where we turn user pointers back
//! into headers, so every trick that depends on memory layout lives here.
//!
//! Each sub-allocator hands out memory from page aligned regions, and every
//! region starts with a header whose first word is an [`AllocationTag`]:
//!
//! ```text
//! page aligned        +--------------------+ <- RegionKind::of masks the user
//! region start  ----> | tag (usize)        |    pointer down to this address
//!                     +--------------------+
//!                     | rest of the header |
//!                     +--------------------+
//!                     |        ...         |
//!                     | user pointer  ---> | somewhere inside the first page
//!                     |        ...         |
//!                     +--------------------+
//! ```
//!
//! Bins and chunks are exactly one page long. Huge regions can be longer, but
//! the only pointer they hand out sits after their header, which is still
//! inside the first page. So masking any pointer we've issued with
//! `!(page_size - 1)` lands on the tag of the region that owns it.
//!
//! The one exception is a huge region aligned to a page or more. Its pointer
//! is a page start itself, so the header goes in the page right before it:
//!
//! ```text
//!                     +--------------------+ <- region start
//!                     | tag (usize)        |
//!                     | rest of the header |
//!                     +--------------------+ <- user pointer, page aligned
//!                     |        ...         |
//! ```
//!
//! No other pointer we hand out is page aligned, since bins, chunks and
//! ordinary huge regions always put their header first. So a page aligned
//! pointer always means "look one page back".

use std::{fmt, mem, ptr::NonNull};

use static_assertions::{const_assert, const_assert_eq};

use crate::{
    bin::{Bin, BIN_HEADER_SIZE},
    freelist::{self, Chunk, BLOCK_HEADER_SIZE, CHUNK_HEADER_SIZE, MIN_BLOCK_SIZE},
    huge::{HugeRegion, HUGE_HEADER_SIZE},
    list::Node,
    platform::{page_size, page_start},
};

/// Smallest page size we can run on.
const MIN_PAGE_SIZE: usize = 4096;

/// Identifies the sub-allocator that owns a region. Values are arbitrary but
/// non-zero, so a zeroed page never passes as a valid region.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocationTag {
    Bin = 0x4269_6E00,
    FreeList = 0x4672_6565,
    Huge = 0x4875_6765,
}

impl TryFrom<usize> for AllocationTag {
    type Error = usize;

    fn try_from(raw: usize) -> Result<Self, Self::Error> {
        match raw {
            raw if raw == Self::Bin as usize => Ok(Self::Bin),
            raw if raw == Self::FreeList as usize => Ok(Self::FreeList),
            raw if raw == Self::Huge as usize => Ok(Self::Huge),
            raw => Err(raw),
        }
    }
}

impl fmt::Display for AllocationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bin => "bin",
            Self::FreeList => "free list",
            Self::Huge => "huge",
        };
        f.write_str(name)
    }
}

// The tag has to be the very first word of every region.
const_assert_eq!(mem::offset_of!(Node<Bin>, data), 0);
const_assert_eq!(mem::offset_of!(Bin, tag), 0);
const_assert_eq!(mem::offset_of!(Node<Chunk>, data), 0);
const_assert_eq!(mem::offset_of!(Chunk, tag), 0);
const_assert_eq!(mem::offset_of!(Node<HugeRegion>, data), 0);
const_assert_eq!(mem::offset_of!(HugeRegion, tag), 0);
const_assert_eq!(mem::size_of::<AllocationTag>(), mem::size_of::<usize>());

// Headers must leave room for content in the smallest page we support.
const_assert!(BIN_HEADER_SIZE < MIN_PAGE_SIZE / 2);
const_assert!(CHUNK_HEADER_SIZE < MIN_PAGE_SIZE / 2);
const_assert!(HUGE_HEADER_SIZE < MIN_PAGE_SIZE / 2);
// Freeing the smallest block must leave room for the free list link.
const_assert!(MIN_BLOCK_SIZE <= BLOCK_HEADER_SIZE + freelist::ALIGNMENT);
// Every header is non-empty, so content never starts at a page boundary.
const_assert!(BIN_HEADER_SIZE > 0 && CHUNK_HEADER_SIZE > 0 && HUGE_HEADER_SIZE > 0);

/// Region that owns a pointer, decoded from its tag. Matching on this is how
/// the allocator dispatches `free`, `resize` and `size_of`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RegionKind {
    Bin(NonNull<Node<Bin>>),
    FreeList(NonNull<Node<Chunk>>),
    Huge(NonNull<Node<HugeRegion>>),
}

impl RegionKind {
    /// Finds the region that contains `address` and decodes its tag.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this allocator and not freed yet.
    ///
    /// # Panics
    ///
    /// Panics if the word at the start of the page is not a valid tag. That
    /// means either the precondition above was broken or the header got
    /// overwritten, and carrying on would corrupt memory.
    pub unsafe fn of(address: NonNull<u8>) -> Self {
        let start = region_start(address);
        let raw = start.cast::<usize>().as_ptr().read();

        match AllocationTag::try_from(raw) {
            Ok(AllocationTag::Bin) => Self::Bin(start.cast()),
            Ok(AllocationTag::FreeList) => Self::FreeList(start.cast()),
            Ok(AllocationTag::Huge) => Self::Huge(start.cast()),
            Err(raw) => panic!("corrupted region header at {start:?}: unknown tag {raw:#x}"),
        }
    }

    /// Tag stored in the region header.
    pub fn tag(&self) -> AllocationTag {
        match self {
            Self::Bin(_) => AllocationTag::Bin,
            Self::FreeList(_) => AllocationTag::FreeList,
            Self::Huge(_) => AllocationTag::Huge,
        }
    }
}

/// Start of the region header that owns `address`. That's the page that
/// contains `address`, or the previous one if `address` is page aligned.
#[inline]
pub(crate) fn region_start(address: NonNull<u8>) -> NonNull<u8> {
    let start = page_start(address.as_ptr() as usize);
    let offset = match address.as_ptr() as usize - start {
        0 => page_size(),
        offset => offset,
    };
    // Going back keeps the provenance of `address`. It can't produce null
    // because the zero page is never mapped for us, and page aligned
    // pointers only come from huge regions that own the page before them.
    unsafe { NonNull::new_unchecked(address.as_ptr().sub(offset)) }
}

/// Returns a pointer to an `H` given an address that points right after a
/// valid `H`.
///
/// ```text
/// +-------------+
/// |      H      | <- Returned address points here.
/// +-------------+
/// |   Content   | <- Given address should point here.
/// +-------------+
/// ```
///
/// # Safety
///
/// `address` must point exactly to the first byte after an `H`.
#[inline]
pub(crate) unsafe fn header_before<H>(address: NonNull<u8>) -> NonNull<H> {
    NonNull::new_unchecked(address.as_ptr().cast::<H>().sub(1))
}

/// Returns the address right after `header`. Inverse of [`header_before`].
///
/// # Safety
///
/// `header` must be valid and followed by memory of the same allocation.
#[inline]
pub(crate) unsafe fn content_after<H>(header: NonNull<H>) -> NonNull<u8> {
    NonNull::new_unchecked(header.as_ptr().add(1)).cast()
}

/// `base + offset` as a typed pointer.
///
/// # Safety
///
/// The result must stay inside the region that `base` points to and be
/// properly aligned for `T`.
#[inline]
pub(crate) unsafe fn at_offset<T>(base: NonNull<u8>, offset: usize) -> NonNull<T> {
    NonNull::new_unchecked(base.as_ptr().add(offset)).cast()
}
