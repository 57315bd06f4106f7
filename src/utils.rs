//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

use std::mem;

/// Machine word size. Headers and payloads are always multiples of it.
pub(crate) const WORD_SIZE: usize = mem::size_of::<usize>();

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// Used to round requested sizes to the machine word so that every chunk
/// header we carve after a payload is itself word aligned.
pub(crate) const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Number of pages of `page_size` bytes needed to hold `bytes`.
pub(crate) const fn pages_for(bytes: usize, page_size: usize) -> usize {
    bytes.div_ceil(page_size)
}
