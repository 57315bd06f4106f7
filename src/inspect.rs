//! Read-only snapshots of the allocator's bookkeeping, meant for debugging
//! and tests. Nothing here is needed to allocate or release memory.

use std::{fmt, ptr::NonNull};

use crate::{arena::Arena, chunk::Chunk, list::Node};

/// Copy of one chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Address of the header.
    pub addr: usize,
    /// Address handed out to the user for this chunk.
    pub user_ptr: usize,
    pub payload_size: usize,
    pub is_free: bool,
    /// Header addresses of the list neighbours. Equal to `addr` when the
    /// chunk is alone in its arena.
    pub prev: usize,
    pub next: usize,
}

/// Copy of one arena header and all of its chunks, in list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaInfo {
    pub base: usize,
    pub total_size: usize,
    pub chunks: Vec<ChunkInfo>,
}

impl ChunkInfo {
    pub(crate) fn of(node: NonNull<Node<Chunk>>) -> Self {
        let (chunk, prev, next) = unsafe {
            let node = node.as_ref();
            (&node.data, node.prev, node.next)
        };

        Self {
            addr: node.as_ptr() as usize,
            user_ptr: Chunk::user_ptr(node).as_ptr() as usize,
            payload_size: chunk.size,
            is_free: chunk.is_free,
            prev: prev.as_ptr() as usize,
            next: next.as_ptr() as usize,
        }
    }
}

impl ArenaInfo {
    pub(crate) fn of(node: NonNull<Node<Arena>>) -> Self {
        let arena = unsafe { &node.as_ref().data };

        Self {
            base: Arena::base(node).as_ptr() as usize,
            total_size: arena.size,
            chunks: arena.chunks.iter().map(ChunkInfo::of).collect(),
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| chunk.is_free)
            .map(|chunk| chunk.payload_size)
            .sum()
    }
}

impl fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {:#x} [{}] {} byte(s) at {:#x}, prev {:#x}, next {:#x}",
            self.addr,
            if self.is_free { "free" } else { "used" },
            self.payload_size,
            self.user_ptr,
            self.prev,
            self.next,
        )
    }
}

impl fmt::Display for ArenaInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "arena {:#x}: {} byte(s), {} chunk(s)",
            self.base,
            self.total_size,
            self.chunks.len()
        )?;

        for chunk in &self.chunks {
            writeln!(f, "  {chunk}")?;
        }

        Ok(())
    }
}
