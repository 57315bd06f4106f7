use std::{mem, ptr::NonNull};
use crate::{arena::Arena, list::Node};


/// Header size of a chunk. We need to add the overhead introduced by our
/// [`Node`] structure since a `Chunk` always lives inside a node of its
/// arena's chunk list.
pub(crate) const CHUNK_HEADER_SIZE: usize = mem::size_of::<Node<Chunk>>();

/// One allocation unit inside an [`Arena`]. The fields are the chunk's
/// metadata, the payload handed to the user is placed right after this header.
///
/// The following diagram represents this structure ignoring that the chunk will be
/// wrapped inside a [`Node`]
///
/// ```text
/// +---------------------+ <------+ <- chunk address
/// |        size         |        |
/// +---------------------+        |
/// |    is_free (1b)     |        | -> Header (CHUNK_HEADER_SIZE)
/// +---------------------+        |
/// |        arena        |        |
/// +---------------------+ <------+ <- user pointer
/// |       Payload       |        |
/// |         ...         |        | -> `size` bytes
/// |         ...         |        |
/// +---------------------+ <------+ <- next chunk (or end of arena)
/// ```
///
/// Every header size is a multiple of the machine word and payload sizes are
/// rounded to the word as well, so headers and user pointers are always
/// word aligned.
pub(crate) struct Chunk {
    /// Payload size in bytes, header excluded.
    pub size: usize,
    /// Flag to tell whether the chunk is free or not.
    pub is_free: bool,
    /// Arena which the chunk belongs to. Only used to find our way back
    /// from a user pointer, the chunk never owns the arena.
    pub arena: NonNull<Node<Arena>>,
}

// Address translation. Nothing else in the crate does arithmetic on chunk
// addresses.
impl Chunk {
    /// Returns the pointer handed to the user for `node`.
    #[inline]
    pub(crate) fn user_ptr(node: NonNull<Node<Chunk>>) -> NonNull<u8> {
        unsafe { node.cast::<u8>().add(CHUNK_HEADER_SIZE) }
    }

    /// Recovers the chunk header from a pointer returned by [`Chunk::user_ptr`].
    ///
    /// **SAFETY**: `ptr` must have been produced by [`Chunk::user_ptr`].
    #[inline]
    pub(crate) unsafe fn from_user_ptr(ptr: NonNull<u8>) -> NonNull<Node<Chunk>> {
        unsafe { ptr.sub(CHUNK_HEADER_SIZE).cast() }
    }

    /// Address right past the payload of `node`. For every chunk but the
    /// last one of an arena this is where the next header lives.
    ///
    /// **SAFETY**: `node` must point to a live chunk header.
    #[inline]
    pub(crate) unsafe fn end(node: NonNull<Node<Chunk>>) -> NonNull<u8> {
        unsafe { Self::user_ptr(node).add(node.as_ref().data.size) }
    }
}
