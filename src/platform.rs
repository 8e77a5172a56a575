use std::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;

use crate::{align::align_down, AllocError, Pointer};

/// Abstraction for platform specific memory handling. The allocator only needs
/// to request pages of memory and return them back when they are no longer in
/// use, but it doesn't care about the APIs offered by the underlying kernel or
/// libraries.
trait PlatformSpecificMemory {
    /// Whether a sub-range of a previous request can be returned on its own.
    /// `munmap` allows that, but allocators built on top of a single
    /// `(address, length)` bookkeeping entry don't.
    const PARTIAL_RELEASE: bool;

    /// Requests a page aligned memory region from the kernel where `length`
    /// bytes can be written safely.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Attempts to return `length` bytes starting from `address` to the
    /// underlying kernel.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// See [`PlatformSpecificMemory::PARTIAL_RELEASE`].
pub(crate) const PARTIAL_RELEASE: bool = <Platform as PlatformSpecificMemory>::PARTIAL_RELEASE;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time. Zero means we haven't
/// asked yet.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Virtual memory page size in bytes. The kernel is only asked once, the
/// value is cached for the rest of the process.
#[inline]
pub fn page_size() -> usize {
    let mut size = PAGE_SIZE.load(Ordering::Relaxed);

    if size == 0 {
        size = unsafe { Platform::page_size() };
        PAGE_SIZE.store(size, Ordering::Relaxed);
    }

    size
}

/// Number of pages needed to hold `bytes`, rounded up.
#[inline]
pub(crate) fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(page_size())
}

/// Address of the first byte of the page that contains `address`.
#[inline]
pub(crate) fn page_start(address: usize) -> usize {
    align_down(address, page_size())
}

/// Memory obtained from the kernel with one call. Both fields are multiples of
/// [`page_size`]. Whoever holds a [`Mapping`] owns the pages it describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Mapping {
    address: NonNull<u8>,
    length: usize,
}

impl Mapping {
    /// First byte of the mapping, page aligned.
    #[inline]
    pub fn address(&self) -> NonNull<u8> {
        self.address
    }

    /// Length in bytes.
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Length in pages.
    #[inline]
    pub fn pages(&self) -> usize {
        self.length / page_size()
    }

    /// Whether `address` points inside this mapping.
    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        let start = self.address.as_ptr() as usize;
        start <= address && address < start + self.length
    }

    /// Splits a multi-page mapping into single page mappings. Only valid
    /// when [`PARTIAL_RELEASE`] holds, otherwise the pieces could not be
    /// returned to the kernel independently.
    pub fn into_pages(self) -> impl Iterator<Item = Mapping> {
        debug_assert!(PARTIAL_RELEASE || self.pages() == 1);
        let page = page_size();

        (0..self.pages()).map(move |i| Mapping {
            // SAFETY: `i * page < length`, so the offset stays inside the
            // mapping and can't wrap to null.
            address: unsafe { NonNull::new_unchecked(self.address.as_ptr().add(i * page)) },
            length: page,
        })
    }
}

/// Maps `pages` fresh pages, readable and writable.
pub(crate) fn map(pages: usize) -> Result<Mapping, AllocError> {
    let length = pages
        .checked_mul(page_size())
        .ok_or(AllocError::OutOfMemory { length: usize::MAX })?;

    match unsafe { Platform::request_memory(length) } {
        Some(address) => {
            trace!("mapped {pages} pages at {address:?}");
            Ok(Mapping { address, length })
        }
        None => Err(AllocError::OutOfMemory { length }),
    }
}

/// Returns `mapping` to the kernel.
///
/// # Safety
///
/// `mapping` must come from [`map`] (or [`Mapping::into_pages`]) and nothing
/// may access its memory afterwards.
pub(crate) unsafe fn unmap(mapping: Mapping) {
    trace!("unmapping {} pages at {:?}", mapping.pages(), mapping.address);
    Platform::return_memory(mapping.address, mapping.length);
}

#[cfg(all(unix, not(miri)))]
mod unix {
    use std::ptr::{self, NonNull};

    use log::warn;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        const PARTIAL_RELEASE: bool = true;

        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Memory protection. Read-Write only.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            // Memory should be private to our process and not mapped to any file.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // For all the configuration options that `mmap` accepts see
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
                libc::MAP_FAILED => None,
                address => NonNull::new(address.cast()),
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.as_ptr().cast(), length) != 0 {
                // The pages are still mapped, all we lose is address space.
                warn!("munmap({address:?}, {length}) failed, leaking the region");
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(any(miri, not(unix)))]
mod fallback {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we use the global allocator to mock
    //! low level memory management. The same code serves targets without
    //! `mmap`. Leaked regions show up as leaks in Miri's report.

    use std::{alloc, ptr::NonNull};

    use log::warn;

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> Option<alloc::Layout> {
        alloc::Layout::from_size_align(length, page_size()).ok()
    }

    impl PlatformSpecificMemory for Platform {
        const PARTIAL_RELEASE: bool = false;

        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)?))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            match to_layout(length) {
                Some(layout) => alloc::dealloc(address.as_ptr(), layout),
                None => warn!("cannot return {length} bytes at {address:?}"),
            }
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
