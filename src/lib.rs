//! General purpose memory allocator that talks to the kernel directly.
//!
//! Requests are routed by size to one of three sub-allocators:
//!
//! ```text
//!              size <= MAX_BIN_SIZE      size < PAGE_SIZE / 2       otherwise
//!                       |                         |                     |
//!                       v                         v                     v
//!              +-----------------+      +-------------------+   +---------------+
//!              |  BinAllocator   |      | FreeListAllocator |   | HugeAllocator |
//!              +-----------------+      +-------------------+   +---------------+
//!                       |                         |                     |
//!                       +------------+------------+                     |
//!                                    v                                  |
//!                             +-------------+                           |
//!                             |  PageCache  |                           |
//!                             +-------------+                           |
//!                                    |                                  |
//!                                    +----------------+-----------------+
//!                                                     v
//!                                              mmap / munmap
//! ```
//!
//! Every region handed out by a sub-allocator is page aligned and starts with
//! a tag, so freeing a pointer only requires masking it down to its page and
//! reading that tag. Any power of two alignment is supported through
//! [`Allocator::allocate_aligned`], which is what [`Binloc`] uses as a
//! global allocator.

use std::ptr::NonNull;

mod align;
mod allocator;
mod bin;
mod bitvec;
mod cache;
mod error;
mod freelist;
mod header;
mod huge;
mod list;
mod platform;
mod realloc;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for allocation return types.
pub type AllocResult = Result<NonNull<u8>, AllocError>;

pub use allocator::{Allocator, Binloc, Stats};
pub use bitvec::BitVector;
pub use error::AllocError;
pub use header::AllocationTag;
pub use platform::page_size;
pub use realloc::ResizePolicy;
