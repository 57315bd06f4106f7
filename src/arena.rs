use std::{mem, ptr::NonNull};
use crate::{chunk::{CHUNK_HEADER_SIZE, Chunk}, list::{Link, List, Node}};


/// This is the overhead size introduced by the [`Arena`] header in bytes.
/// The header is represented as a [`Node`]. See [`List`] for more detail.
pub(crate) const ARENA_HEADER_SIZE: usize = mem::size_of::<Node<Arena>>();

/// Metadata of one mapping obtained from the page source. As every other
/// header, this is written at the very start of the mapping as a
/// [`Node<Arena>`] linked into the allocator's arena list.
///
/// Mappings are page granular and we cannot assume they are adjacent, so
/// each arena is subdivided into a list of [`Chunk`] that never leaves it:
///
/// ```text
/// +-----------------------------------------------+      +-----------------------------------------------+
/// |       | +-------+    +-------+    +-------+   |      |       | +-------+    +-------+    +-------+   |
/// | Arena | | Chunk | -> | Chunk | -> | Chunk |   | ---> | Arena | | Chunk | -> | Chunk | -> | Chunk |   |
/// |       | +-------+    +-------+    +-------+   |      |       | +-------+    +-------+    +-------+   |
/// +-----------------------------------------------+      +-----------------------------------------------+
/// ```
///
/// Chunks are kept in address order: the head of [`Arena::chunks`] is the
/// chunk right after the arena header and every `next` is the physically
/// following chunk, except for the last one which wraps around to the head.
pub(crate) struct Arena {
    /// Bytes mapped for this arena, header included. Always a multiple of
    /// the page size.
    pub size: usize,
    /// Chunks carved out of this arena. Never empty while the arena is mapped.
    pub chunks: List<Chunk>,
}

impl Arena {
    /// Initializes a freshly mapped region of `size` bytes at `base` and
    /// inserts it at the front of `arenas`. The arena starts with a single
    /// free chunk spanning all the usable space, which is returned.
    ///
    /// **SAFETY**: `base` must be valid for reads and writes of `size` bytes,
    /// word aligned, and `size` must fit both headers.
    pub(crate) unsafe fn create(
        arenas: &mut List<Arena>,
        base: NonNull<u8>,
        size: usize,
    ) -> NonNull<Node<Chunk>> {
        debug_assert!(size >= ARENA_HEADER_SIZE + CHUNK_HEADER_SIZE);

        unsafe {
            let mut arena = arenas.push_front(
                Arena {
                    size,
                    chunks: List::new(),
                },
                base,
            );

            // First Node<Chunk> right after Node<Arena>
            let chunk_addr = base.add(ARENA_HEADER_SIZE);

            arena.as_mut().data.chunks.push_front(
                Chunk {
                    size: size - ARENA_HEADER_SIZE - CHUNK_HEADER_SIZE,
                    is_free: true,
                    arena,
                },
                chunk_addr,
            )
        }
    }

    /// Start of the mapping that holds `node`.
    #[inline]
    pub(crate) fn base(node: NonNull<Node<Arena>>) -> NonNull<u8> {
        node.cast()
    }

    /// Tells whether `ptr` falls inside the payload area of the arena, that
    /// is, somewhere a user pointer could live.
    pub(crate) fn contains(node: NonNull<Node<Arena>>, ptr: NonNull<u8>) -> bool {
        let base = Self::base(node).as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        let size = unsafe { node.as_ref().data.size };

        addr >= base + ARENA_HEADER_SIZE + CHUNK_HEADER_SIZE && addr < base + size
    }

    /// Returns the first free chunk that can hold `needed` bytes, in list order.
    pub(crate) fn find_free_chunk(&self, needed: usize) -> Link<Node<Chunk>> {
        let found = self.chunks.iter().find(|node| {
            let chunk = unsafe { &node.as_ref().data };
            chunk.is_free && chunk.size >= needed
        });

        if let Some(node) = found {
            log::trace!("first fit for {needed} byte(s): chunk {node:p}");
        }

        found
    }

    /// Shrinks `node` to `needed` bytes and carves a new free chunk out of
    /// the rest, but only if the rest is worth more than a header plus
    /// `min_split_payload` bytes. Otherwise the chunk is left as is.
    ///
    /// **SAFETY**: `node` must be a chunk of this arena with at least
    /// `needed` bytes of payload, and `needed` must be word aligned.
    pub(crate) unsafe fn split(
        &mut self,
        mut node: NonNull<Node<Chunk>>,
        needed: usize,
        min_split_payload: usize,
    ) {
        unsafe {
            let remainder = node.as_ref().data.size - needed;

            if remainder.saturating_sub(CHUNK_HEADER_SIZE) <= min_split_payload {
                return;
            }

            let arena = node.as_ref().data.arena;
            node.as_mut().data.size = needed;

            let addr = Chunk::end(node);

            self.chunks.insert_after(
                node,
                Chunk {
                    size: remainder - CHUNK_HEADER_SIZE,
                    is_free: true,
                    arena,
                },
                addr,
            );

            log::trace!(
                "split chunk {:p}: {} byte(s) used, {} byte(s) left free at {:p}",
                node, needed, remainder - CHUNK_HEADER_SIZE, addr,
            );
        }
    }

    /// Tries to merge the given chunk `node` with the previous one on the
    /// list. This can be performed if that previous chunk is free.
    ///
    /// On success `node` is updated to point to the merged chunk.
    pub(crate) fn merge_with_prev(&mut self, node: &mut NonNull<Node<Chunk>>) {
        // The head is the lowest chunk, its `prev` wraps around to the last one.
        if self.chunks.first() == Some(*node) {
            return;
        }

        unsafe {
            let mut prev = node.as_ref().prev;

            if !prev.as_ref().data.is_free {
                return;
            }

            debug_assert_eq!(Chunk::end(prev), node.cast::<u8>());
            debug_assert_eq!(prev.as_ref().data.arena, node.as_ref().data.arena);

            // We need to cover the header and the actual content of the chunk
            prev.as_mut().data.size += CHUNK_HEADER_SIZE + node.as_ref().data.size;

            // The chunk is absorbed so it leaves the list
            self.chunks.remove(*node);

            log::trace!("merged chunk {:p} into previous {:p}", *node, prev);

            // The current chunk is now its previous one
            *node = prev;
        }
    }

    /// Tries to merge the given chunk `node` with the next one on the
    /// list. This can be performed if that next chunk is free.
    pub(crate) fn merge_with_next(&mut self, node: &mut NonNull<Node<Chunk>>) {
        unsafe {
            let next = node.as_ref().next;

            // Wrapping around to the head means `node` is the last chunk.
            if self.chunks.first() == Some(next) || !next.as_ref().data.is_free {
                return;
            }

            debug_assert_eq!(Chunk::end(*node), next.cast::<u8>());
            debug_assert_eq!(next.as_ref().data.arena, node.as_ref().data.arena);

            node.as_mut().data.size += CHUNK_HEADER_SIZE + next.as_ref().data.size;

            self.chunks.remove(next);

            log::trace!("merged next chunk {:p} into {:p}", next, *node);
        }
    }

    /// An arena can be given back to the page source once it is a single
    /// free chunk again.
    pub(crate) fn is_reclaimable(&self) -> bool {
        match self.chunks.first() {
            Some(head) => unsafe { Node::is_alone(head) && head.as_ref().data.is_free },
            None => true,
        }
    }

    /// Sum of the payload of every free chunk.
    pub(crate) fn free_bytes(&self) -> usize {
        self.chunks
            .iter()
            .map(|node| unsafe { &node.as_ref().data })
            .filter(|chunk| chunk.is_free)
            .map(|chunk| chunk.size)
            .sum()
    }
}
