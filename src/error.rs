use std::io;

use thiserror::Error;

/// Failures reported by a [`crate::PageSource`].
#[derive(Error, Debug)]
pub enum PageError {
    #[error("could not map {pages} page(s)")]
    MapFailed {
        pages: usize,
        #[source]
        source: io::Error,
    },

    #[error("could not unmap {pages} page(s) at {base:#x}")]
    UnmapFailed {
        base: usize,
        pages: usize,
        #[source]
        source: io::Error,
    },

    #[error("page size is unavailable on this platform")]
    PageSizeUnavailable,
}

/// Errors returned by [`crate::Allocator`].
///
/// None of them leave the allocator in an inconsistent state. Everything but
/// [`AllocError::UnmapFailed`] is reported before any bookkeeping changes.
#[derive(Error, Debug)]
pub enum AllocError {
    /// Zero, or too large to describe with headers and whole pages.
    #[error("invalid allocation size: {0}")]
    InvalidSize(usize),

    #[error("out of memory")]
    OutOfMemory(#[source] PageError),

    #[error("double free of {0:#x}")]
    DoubleFree(usize),

    /// The pointer is not inside any arena currently owned by the allocator.
    #[error("pointer {0:#x} was not handed out by this allocator")]
    UnknownPointer(usize),

    /// The chunk was released and its arena dropped from the allocator, but
    /// the mapping could not be returned and is leaked.
    #[error("arena at {base:#x} was released but its mapping leaked")]
    UnmapFailed {
        base: usize,
        #[source]
        source: PageError,
    },
}

impl AllocError {
    /// Whether the request may succeed once memory is released or the
    /// system is under less pressure.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, AllocError::OutOfMemory(_))
    }
}
