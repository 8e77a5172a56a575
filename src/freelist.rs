use std::{cmp, mem, ptr::NonNull};

use log::debug;
use static_assertions::const_assert_eq;

use crate::{
    align::{align_down, align_up, MAX_ALIGN},
    cache::PageCache,
    header::{at_offset, content_after, header_before, AllocationTag},
    list::{LinkedList, Node},
    platform::{self, page_size, Mapping},
    AllocError, AllocResult, Pointer,
};

/// Payloads are aligned to this and block sizes are multiples of it.
pub(crate) const ALIGNMENT: usize = MAX_ALIGN;

/// Bytes in front of every payload.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Smallest block that can be linked in a free list. Splits that would leave
/// less than this behind hand out the whole block instead.
pub(crate) const MIN_BLOCK_SIZE: usize = mem::size_of::<FreeBlock>();

/// Offset of the first block in a chunk. Chosen so that the payload right
/// after the block header is aligned. Since every block size is a multiple of
/// [`ALIGNMENT`], all the payloads that follow are aligned too.
pub(crate) const CHUNK_HEADER_SIZE: usize =
    align_up(mem::size_of::<Node<Chunk>>() + BLOCK_HEADER_SIZE, ALIGNMENT) - BLOCK_HEADER_SIZE;

/// One page carved into variable sized blocks:
///
/// ```text
/// +-------------+------+-----------+------+-----------+------+---------+
/// | Node<Chunk> | size |  payload  | size |   free    | size | payload |
/// +-------------+------+-----------+------+-----------+------+---------+
///               ^                  ^                  ^
///               |                  |                  |
///             block              block    free ---> block
/// ```
///
/// Blocks tile the area after the header, except for a tail shorter than
/// [`ALIGNMENT`] when the page doesn't divide evenly. Only the free ones are
/// linked, sorted by address, so neighbours can be merged on free.
#[repr(C)]
pub(crate) struct Chunk {
    /// Always [`AllocationTag::FreeList`].
    pub(crate) tag: AllocationTag,
    mapping: Mapping,
    /// Lowest free block of this chunk.
    free: Pointer<FreeBlock>,
}

/// Header of a block in use. `size` counts the header itself.
#[repr(C)]
pub(crate) struct BlockHeader {
    size: usize,
}

/// A block that nobody uses. The header is the same, the payload stores the
/// link to the next free block.
#[repr(C)]
pub(crate) struct FreeBlock {
    size: usize,
    next: Pointer<FreeBlock>,
}

// Used and free blocks share the size word.
const_assert_eq!(mem::offset_of!(FreeBlock, size), mem::offset_of!(BlockHeader, size));
const_assert_eq!((CHUNK_HEADER_SIZE + BLOCK_HEADER_SIZE) % ALIGNMENT, 0);
const_assert_eq!(MIN_BLOCK_SIZE % ALIGNMENT, 0);

/// Bytes available for blocks in one chunk, headers included.
#[inline]
pub(crate) fn chunk_capacity() -> usize {
    align_down(page_size() - CHUNK_HEADER_SIZE, ALIGNMENT)
}

/// First fit allocator for requests too large for bins but smaller than half
/// a page. Each chunk keeps its own free list:
///
/// ```text
///          +-------+      +-------+      +-------+
/// chunks:  | Chunk | ---> | Chunk | ---> | Chunk |
///          +-------+      +-------+      +-------+
///              |              |              |
///              v              v              v
///            Free           Free           Free
///              |              |
///              v              v
///            Free           Free
/// ```
pub(crate) struct FreeListAllocator {
    chunks: LinkedList<Chunk>,
}

impl FreeListAllocator {
    pub const fn new() -> Self {
        Self {
            chunks: LinkedList::new(),
        }
    }

    /// Number of live chunks.
    pub fn chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Returns a block with at least `size` usable bytes, aligned to
    /// [`ALIGNMENT`].
    ///
    /// # Safety
    ///
    /// The cache must be the one this allocator always uses.
    pub unsafe fn allocate<const CACHE: usize>(
        &mut self,
        size: usize,
        cache: &mut PageCache<CACHE>,
    ) -> AllocResult {
        let limit = chunk_capacity() - BLOCK_HEADER_SIZE;

        if size > limit {
            return Err(AllocError::RequestTooLarge { size, limit });
        }

        let needed = align_up(cmp::max(BLOCK_HEADER_SIZE + size, MIN_BLOCK_SIZE), ALIGNMENT);

        for chunk in self.chunks.iter() {
            if let Some(address) = Self::carve(chunk, needed) {
                return Ok(address);
            }
        }

        let chunk = self.new_chunk(cache)?;

        match Self::carve(chunk, needed) {
            Some(address) => Ok(address),
            None => unreachable!("fresh chunk at {chunk:?} can't fit {needed} bytes"),
        }
    }

    /// Gives the block at `address` back to its chunk, merging it with
    /// adjacent free blocks. Empty chunks go back to the cache.
    ///
    /// # Safety
    ///
    /// `address` must be a live allocation of this allocator that belongs to
    /// `chunk`.
    pub unsafe fn free<const CACHE: usize>(
        &mut self,
        address: NonNull<u8>,
        mut chunk: NonNull<Node<Chunk>>,
        cache: &mut PageCache<CACHE>,
    ) {
        let mut block = header_before::<BlockHeader>(address).cast::<FreeBlock>();

        // Free blocks around the one we are releasing.
        let mut prev: Pointer<FreeBlock> = None;
        let mut next = chunk.as_ref().data.free;

        while let Some(current) = next {
            if current > block {
                break;
            }
            prev = Some(current);
            next = current.as_ref().next;
        }

        block.as_mut().next = next;

        if let Some(next) = next {
            if Self::end_of(block) == next.cast() {
                block.as_mut().size += next.as_ref().size;
                block.as_mut().next = next.as_ref().next;
            }
        }

        match prev {
            Some(mut prev) if Self::end_of(prev) == block.cast() => {
                prev.as_mut().size += block.as_ref().size;
                prev.as_mut().next = block.as_ref().next;
            }
            Some(mut prev) => prev.as_mut().next = Some(block),
            None => chunk.as_mut().data.free = Some(block),
        }

        if Self::is_empty(chunk) {
            let mapping = chunk.as_ref().data.mapping;
            self.chunks.remove(chunk);
            debug!("chunk at {:?} is empty, releasing it", mapping.address());
            cache.store_page(mapping);
        }
    }

    /// Usable bytes of the block at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be a live allocation of this allocator.
    #[inline]
    pub unsafe fn block_size(address: NonNull<u8>) -> usize {
        header_before::<BlockHeader>(address).as_ref().size - BLOCK_HEADER_SIZE
    }

    /// Unmaps every chunk. Pointers into them become dangling.
    pub unsafe fn release_all(&mut self) {
        for chunk in self.chunks.iter() {
            platform::unmap(chunk.as_ref().data.mapping);
        }
        self.chunks = LinkedList::new();
    }

    /// First fit search in the free list of `chunk`. `needed` includes the
    /// block header.
    unsafe fn carve(mut chunk: NonNull<Node<Chunk>>, needed: usize) -> Pointer<u8> {
        let mut prev: Pointer<FreeBlock> = None;
        let mut current = chunk.as_ref().data.free;

        while let Some(mut block) = current {
            let size = block.as_ref().size;

            if size < needed {
                prev = current;
                current = block.as_ref().next;
                continue;
            }

            // Either split or take the whole block, the rest of the free
            // list follows whatever replaces it.
            let replacement = if size - needed >= MIN_BLOCK_SIZE {
                let rest = at_offset::<FreeBlock>(block.cast(), needed);
                rest.as_ptr().write(FreeBlock {
                    size: size - needed,
                    next: block.as_ref().next,
                });
                block.as_mut().size = needed;
                Some(rest)
            } else {
                block.as_ref().next
            };

            match prev {
                Some(mut prev) => prev.as_mut().next = replacement,
                None => chunk.as_mut().data.free = replacement,
            }

            return Some(content_after(block.cast::<BlockHeader>()));
        }

        None
    }

    /// Address right after the last byte of `block`.
    #[inline]
    unsafe fn end_of(block: NonNull<FreeBlock>) -> NonNull<u8> {
        at_offset(block.cast(), block.as_ref().size)
    }

    /// `true` if the chunk holds a single free block spanning the whole
    /// usable area.
    unsafe fn is_empty(chunk: NonNull<Node<Chunk>>) -> bool {
        chunk
            .as_ref()
            .data
            .free
            .is_some_and(|block| block.as_ref().size == chunk_capacity())
    }

    /// Links a fresh chunk made of one free block.
    unsafe fn new_chunk<const CACHE: usize>(
        &mut self,
        cache: &mut PageCache<CACHE>,
    ) -> Result<NonNull<Node<Chunk>>, AllocError> {
        let mapping = cache.retrieve_page()?;
        let page = mapping.address();

        let block = at_offset::<FreeBlock>(page, CHUNK_HEADER_SIZE);
        block.as_ptr().write(FreeBlock {
            size: chunk_capacity(),
            next: None,
        });

        let chunk = Chunk {
            tag: AllocationTag::FreeList,
            mapping,
            free: Some(block),
        };

        debug!("new chunk at {page:?} with {} usable bytes", chunk_capacity());

        Ok(self.chunks.push_front(chunk, page))
    }
}
