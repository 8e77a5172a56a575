/// Everything that can go wrong while serving a request. Only
/// [`AllocError::OutOfMemory`] depends on the state of the machine, the rest
/// are caused by the request itself.
///
/// Passing a pointer that this allocator never handed out is not an error
/// variant: it's a safety precondition of every function that accepts one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("out of memory: the kernel refused to map {length} bytes")]
    OutOfMemory { length: usize },
    #[error("size overflow: {count} elements of {size} bytes")]
    SizeOverflow { count: usize, size: usize },
    #[error("request of {size} bytes does not fit in a chunk of {limit} usable bytes")]
    RequestTooLarge { size: usize, limit: usize },
    #[error("unsupported alignment {align}: not a power of two")]
    UnsupportedAlignment { align: usize },
    #[error("allocator lock is poisoned")]
    Poisoned,
}
