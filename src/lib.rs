//! # arenalloc
//!
//! A general purpose allocator that manages its heap directly on top of page
//! mappings obtained from the operating system (or any other
//! [`PageSource`]), without delegating to a platform allocator.
//!
//! Pages come in as arenas which are subdivided into chunks. Every piece
//! of metadata lives inside the mapped memory itself:
//!
//! ```text
//!   Arena list (circular, newest first)
//!
//!   +---------------------------------------------+      +---------------------------------+
//!   |       | +-------+------+  +-------+------+   |      |       | +-------+-------------+ |
//!   | Arena | | Chunk | used |  | Chunk | free |   | ---> | Arena | | Chunk |    free     | |
//!   |       | +-------+------+  +-------+------+   |      |       | +-------+-------------+ |
//!   +---------------------------------------------+      +---------------------------------+
//!                       ^
//!                       +-- user pointer (chunk header + CHUNK_HEADER_SIZE)
//! ```
//!
//! Allocation is first-fit over every arena, splitting oversized chunks.
//! Release coalesces with free neighbours inside the same arena and gives the
//! whole arena back to the page source once it is a single free chunk again.
//!
//! The allocator is single threaded. It is [`Send`], so callers sharing one
//! instance across threads wrap it in a lock such as [`std::sync::Mutex`].
//!
//! ```rust
//! use arenalloc::{Allocator, OsPages};
//!
//! let mut allocator = Allocator::new(OsPages::new());
//!
//! let ptr = allocator.allocate(64).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(7, 64);
//!     allocator.release(ptr).unwrap();
//! }
//!
//! assert_eq!(allocator.arena_count(), 0);
//! ```

mod arena;
mod chunk;
mod config;
mod error;
mod inspect;
mod kernel;
mod list;
mod utils;

use std::ptr::NonNull;

use crate::{
    arena::{ARENA_HEADER_SIZE, Arena},
    chunk::{CHUNK_HEADER_SIZE, Chunk},
    list::{List, Node},
    utils::{WORD_SIZE, align, pages_for},
};

pub use crate::{
    config::{Config, MIN_SPLIT_PAYLOAD},
    error::{AllocError, PageError},
    inspect::{ArenaInfo, ChunkInfo},
    kernel::{OsPages, PageSource},
};

/// Bytes of metadata an arena spends on itself and on its first chunk.
pub const ARENA_OVERHEAD: usize = ARENA_HEADER_SIZE + CHUNK_HEADER_SIZE;

/// Bytes of metadata in front of every user pointer.
pub const CHUNK_OVERHEAD: usize = CHUNK_HEADER_SIZE;

/// Largest request we accept. Anything above can't be described in whole
/// pages plus headers without overflowing.
const MAX_REQUEST: usize = isize::MAX as usize - ARENA_OVERHEAD;

/// Handle to a heap made of page mappings.
///
/// Dropping the allocator returns every arena to the page source, which
/// invalidates any pointer still handed out.
pub struct Allocator<P: PageSource = OsPages> {
    /// Circular list of arenas, most recently mapped first.
    arenas: List<Arena>,
    /// Page size of `source`, asked for once on the first mapping.
    page_size: Option<usize>,
    config: Config,
    source: P,
}

// The allocator exclusively owns every arena, so moving it to another thread
// moves all of its memory along with it.
unsafe impl<P: PageSource + Send> Send for Allocator<P> {}

impl<P: PageSource> Allocator<P> {
    /// Creates an empty allocator on top of `source`. Nothing is mapped yet.
    pub const fn new(source: P) -> Self {
        Self::with_config(source, Config::new())
    }

    /// Same as [`Allocator::new`] with explicit tunables.
    pub const fn with_config(source: P, config: Config) -> Self {
        Self {
            arenas: List::new(),
            page_size: None,
            config,
            source,
        }
    }

    /// Returns a pointer to at least `size` writable bytes.
    ///
    /// The payload reserved is `size` rounded up to the machine word, so the
    /// pointer is word aligned. Nothing stronger is guaranteed.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 || size > MAX_REQUEST {
            return Err(AllocError::InvalidSize(size));
        }

        let needed = align(size, WORD_SIZE);

        let mut chunk = match self.find_free_chunk(needed) {
            Some(chunk) => chunk,
            None => self.grow(needed)?,
        };

        unsafe {
            let mut arena = chunk.as_ref().data.arena;

            arena
                .as_mut()
                .data
                .split(chunk, needed, self.config.min_split_payload);

            chunk.as_mut().data.is_free = false;
        }

        Ok(Chunk::user_ptr(chunk))
    }

    /// Gives back a pointer obtained from [`Allocator::allocate`].
    ///
    /// The chunk is merged with its free neighbours and, if that leaves its
    /// arena completely free, the arena is unmapped. An
    /// [`AllocError::UnmapFailed`] still means the pointer was released.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Allocator::allocate`] on this same allocator.
    /// Releasing it twice is detected as long as its arena is still mapped,
    /// and reported as [`AllocError::UnknownPointer`] afterwards.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr.as_ptr() as usize;

        // Never read a header outside our own mappings.
        if !self.arenas.iter().any(|arena| Arena::contains(arena, ptr)) {
            log::warn!("release of unknown pointer {addr:#x}");
            return Err(AllocError::UnknownPointer(addr));
        }

        unsafe {
            let mut node = Chunk::from_user_ptr(ptr);

            if node.as_ref().data.is_free {
                log::warn!("double free of {addr:#x}");
                return Err(AllocError::DoubleFree(addr));
            }

            node.as_mut().data.is_free = true;

            let mut arena = node.as_ref().data.arena;
            debug_assert!(Arena::contains(arena, ptr));

            let region = &mut arena.as_mut().data;
            region.merge_with_prev(&mut node);
            region.merge_with_next(&mut node);

            if region.is_reclaimable() {
                return self.reclaim(arena);
            }
        }

        Ok(())
    }

    /// Unmaps every arena, whether or not its chunks were released. The first
    /// unmap failure is returned after all the others have been attempted.
    ///
    /// Every pointer handed out so far becomes dangling.
    pub fn release_all(&mut self) -> Result<(), AllocError> {
        let mut result = Ok(());

        while let Some(arena) = self.arenas.first() {
            if let Err(err) = unsafe { self.reclaim(arena) } {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// First-fit over every arena, newest arena first.
    fn find_free_chunk(&self, needed: usize) -> Option<NonNull<Node<Chunk>>> {
        self.arenas
            .iter()
            .find_map(|arena| unsafe { arena.as_ref().data.find_free_chunk(needed) })
    }

    /// Maps a new arena big enough for `needed` bytes of payload and returns
    /// its only chunk.
    ///
    /// If we don't have any free chunk we can use on our arenas, there is no
    /// way we can allocate the requested size without asking for more pages.
    fn grow(&mut self, needed: usize) -> Result<NonNull<Node<Chunk>>, AllocError> {
        let page_size = self.cached_page_size().map_err(AllocError::OutOfMemory)?;

        // What we really need to map is the requested size plus the overhead
        // introduced by our allocator's data structures.
        let pages = pages_for(needed + ARENA_OVERHEAD, page_size);
        let size = pages
            .checked_mul(page_size)
            .ok_or(AllocError::InvalidSize(needed))?;

        let base = self.source.map_pages(pages).map_err(AllocError::OutOfMemory)?;

        log::debug!("mapped arena {base:p}: {pages} page(s), {size} byte(s)");

        Ok(unsafe { Arena::create(&mut self.arenas, base, size) })
    }

    /// Unlinks `arena` and gives its pages back. The arena is considered gone
    /// even if the page source refuses to unmap it.
    unsafe fn reclaim(&mut self, arena: NonNull<Node<Arena>>) -> Result<(), AllocError> {
        let base = Arena::base(arena);
        let size = unsafe { arena.as_ref().data.size };
        // An arena exists, so the page size is known.
        let pages = size / self.page_size.unwrap_or(size);

        unsafe { self.arenas.remove(arena) };

        log::debug!("unmapping arena {base:p}: {pages} page(s)");

        unsafe { self.source.unmap_pages(base, pages) }.map_err(|source| {
            log::warn!("arena {base:p} leaked: {source}");

            AllocError::UnmapFailed {
                base: base.as_ptr() as usize,
                source,
            }
        })
    }

    fn cached_page_size(&mut self) -> Result<usize, PageError> {
        if let Some(page_size) = self.page_size {
            return Ok(page_size);
        }

        let page_size = self.source.page_size()?;
        debug_assert_eq!(page_size % WORD_SIZE, 0);
        self.page_size = Some(page_size);

        Ok(page_size)
    }

    /// Number of arenas currently mapped.
    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    /// Payload bytes sitting in free chunks.
    pub fn free_bytes(&self) -> usize {
        self.arenas
            .iter()
            .map(|arena| unsafe { arena.as_ref().data.free_bytes() })
            .sum()
    }

    /// Payload bytes currently handed out, including word rounding and
    /// leftovers too small to split.
    pub fn used_bytes(&self) -> usize {
        self.arenas
            .iter()
            .flat_map(|arena| unsafe { arena.as_ref().data.chunks.iter() })
            .map(|chunk| unsafe { &chunk.as_ref().data })
            .filter(|chunk| !chunk.is_free)
            .map(|chunk| chunk.size)
            .sum()
    }

    /// Page size of the source, known once the first arena has been mapped.
    pub fn page_size(&self) -> Option<usize> {
        self.page_size
    }

    /// Tunables this allocator was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The page source arenas are mapped from.
    pub fn source(&self) -> &P {
        &self.source
    }

    /// Snapshot of every arena and chunk, in search order.
    pub fn arenas(&self) -> Vec<ArenaInfo> {
        self.arenas.iter().map(ArenaInfo::of).collect()
    }
}

impl Default for Allocator<OsPages> {
    fn default() -> Self {
        Self::new(OsPages::new())
    }
}

impl<P: PageSource> Drop for Allocator<P> {
    fn drop(&mut self) {
        // Failures were already logged by `reclaim`.
        let _ = self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::testing::{TEST_PAGE_SIZE, TestPages};

    const PAGE: usize = TEST_PAGE_SIZE;

    fn allocator() -> Allocator<TestPages> {
        let _ = env_logger::builder().is_test(true).try_init();

        Allocator::new(TestPages::default())
    }

    fn chunks(allocator: &Allocator<TestPages>, arena: usize) -> Vec<(usize, bool)> {
        allocator.arenas()[arena]
            .chunks
            .iter()
            .map(|chunk| (chunk.payload_size, chunk.is_free))
            .collect()
    }

    #[test]
    fn zero_and_absurd_sizes_are_rejected() {
        let mut allocator = allocator();

        assert!(matches!(allocator.allocate(0), Err(AllocError::InvalidSize(0))));
        assert!(matches!(
            allocator.allocate(usize::MAX),
            Err(AllocError::InvalidSize(usize::MAX))
        ));
        assert_eq!(allocator.source().map_calls, 0);
        assert_eq!(allocator.arena_count(), 0);
    }

    #[test]
    fn every_size_in_a_page_round_trips() {
        let mut allocator = allocator();

        for size in 1..=PAGE - ARENA_OVERHEAD {
            let ptr = allocator.allocate(size).unwrap();

            unsafe {
                let bytes = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = (i % 251) as u8;
                }
                for (i, byte) in bytes.iter().enumerate() {
                    assert_eq!(*byte, (i % 251) as u8);
                }

                allocator.release(ptr).unwrap();
            }

            assert_eq!(allocator.arena_count(), 0);
        }

        assert_eq!(allocator.source().mapped_pages(), 0);
    }

    #[test]
    fn single_page_split_then_coalesce_and_unmap() {
        let mut allocator = allocator();

        let ptr = allocator.allocate(104).unwrap();

        assert_eq!(allocator.source().map_calls, 1);
        assert_eq!(allocator.source().mapped_pages(), 1);
        assert_eq!(allocator.page_size(), Some(PAGE));

        let arenas = allocator.arenas();
        assert_eq!(arenas.len(), 1);
        assert_eq!(arenas[0].total_size, PAGE);
        assert_eq!(arenas[0].chunks[0].user_ptr, ptr.as_ptr() as usize);
        assert_eq!(
            chunks(&allocator, 0),
            vec![(104, false), (PAGE - ARENA_HEADER_SIZE - 2 * CHUNK_HEADER_SIZE - 104, true)]
        );

        unsafe { allocator.release(ptr).unwrap() };

        assert_eq!(allocator.arena_count(), 0);
        assert_eq!(allocator.source().unmap_calls, 1);
        assert!(allocator.source().mapped.is_empty());
    }

    #[test]
    fn requests_are_rounded_to_the_word() {
        let mut allocator = allocator();

        let ptr = allocator.allocate(100).unwrap();

        assert_eq!(ptr.as_ptr() as usize % WORD_SIZE, 0);
        assert_eq!(chunks(&allocator, 0)[0], (align(100, WORD_SIZE), false));
        assert_eq!(allocator.used_bytes(), align(100, WORD_SIZE));
    }

    #[test]
    fn blocks_from_one_arena_do_not_overlap() {
        let mut allocator = allocator();

        let a = allocator.allocate(100).unwrap().as_ptr() as usize;
        let b = allocator.allocate(200).unwrap().as_ptr() as usize;

        assert_eq!(allocator.arena_count(), 1);
        assert!(a + 100 <= b || b + 200 <= a);
    }

    #[test]
    fn double_free_is_reported_without_side_effects() {
        let mut allocator = allocator();

        let a = allocator.allocate(64).unwrap();
        let _b = allocator.allocate(64).unwrap();

        unsafe {
            allocator.release(a).unwrap();
            let free = allocator.free_bytes();
            let layout = allocator.arenas();

            assert!(matches!(
                allocator.release(a),
                Err(AllocError::DoubleFree(addr)) if addr == a.as_ptr() as usize
            ));
            assert_eq!(allocator.free_bytes(), free);
            assert_eq!(allocator.arenas(), layout);
        }
    }

    #[test]
    fn adjacent_siblings_coalesce_in_either_order() {
        for reversed in [false, true] {
            let mut allocator = allocator();

            let a = allocator.allocate(64).unwrap();
            let b = allocator.allocate(128).unwrap();
            // Keeps `b` from merging with the free tail of the arena.
            let _c = allocator.allocate(32).unwrap();

            unsafe {
                if reversed {
                    allocator.release(b).unwrap();
                    allocator.release(a).unwrap();
                } else {
                    allocator.release(a).unwrap();
                    allocator.release(b).unwrap();
                }
            }

            let layout = chunks(&allocator, 0);
            assert_eq!(layout[0], (64 + 128 + CHUNK_HEADER_SIZE, true));
            assert_eq!(layout[1], (32, false));
            assert_eq!(layout.len(), 3);
        }
    }

    #[test]
    fn releasing_last_chunk_unmaps_and_next_allocation_maps_again() {
        let mut allocator = allocator();

        // Too big to share a page, so each one gets its own arena.
        let big = 3000;
        let _first = allocator.allocate(big).unwrap();
        let _second = allocator.allocate(big).unwrap();
        let third = allocator.allocate(big).unwrap();
        assert_eq!(allocator.arena_count(), 3);

        unsafe { allocator.release(third).unwrap() };
        assert_eq!(allocator.arena_count(), 2);

        allocator.allocate(big).unwrap();
        assert_eq!(allocator.arena_count(), 3);
        assert_eq!(allocator.source().map_calls, 4);
    }

    #[test]
    fn large_requests_map_enough_whole_pages() {
        let mut allocator = allocator();
        let size = 3 * PAGE;

        let ptr = allocator.allocate(size).unwrap();

        let arena = &allocator.arenas()[0];
        assert_eq!(arena.total_size, pages_for(size + ARENA_OVERHEAD, PAGE) * PAGE);
        assert_eq!(arena.total_size % PAGE, 0);
        assert!(arena.total_size >= size + ARENA_OVERHEAD);
        assert_eq!(allocator.source().mapped_pages(), 4);

        unsafe {
            ptr.as_ptr().write_bytes(1, size);
            allocator.release(ptr).unwrap();
        }
        assert_eq!(allocator.source().mapped_pages(), 0);
    }

    #[test]
    fn first_fit_searches_newest_arena_first() {
        let mut allocator = allocator();

        // Both arenas keep a free tail big enough for the next request.
        allocator.allocate(3000).unwrap();
        allocator.allocate(3000).unwrap();

        let small = allocator.allocate(64).unwrap();

        let newest = &allocator.arenas()[0];
        assert!(newest.chunks.iter().any(|c| c.user_ptr == small.as_ptr() as usize));
        assert_eq!(allocator.source().map_calls, 2);
    }

    #[test]
    fn space_for_free_chunk_is_reused() {
        let mut allocator = allocator();

        let first = allocator.allocate(32).unwrap();
        let _ = allocator.allocate(64).unwrap();
        let _ = allocator.allocate(64).unwrap();

        unsafe { allocator.release(first).unwrap() };

        let second = allocator.allocate(16).unwrap();

        assert_eq!(first, second);
        assert_eq!(allocator.source().map_calls, 1);
    }

    #[test]
    fn map_failure_is_out_of_memory() {
        let mut allocator = allocator();
        allocator.source.fail_map = true;

        let err = allocator.allocate(64).unwrap_err();

        assert!(matches!(err, AllocError::OutOfMemory(PageError::MapFailed { pages: 1, .. })));
        assert_eq!(allocator.arena_count(), 0);

        allocator.source.fail_map = false;
        assert!(allocator.allocate(64).is_ok());
    }

    #[test]
    fn missing_page_size_is_out_of_memory() {
        let mut allocator = allocator();
        allocator.source.no_page_size = true;

        assert!(matches!(
            allocator.allocate(8),
            Err(AllocError::OutOfMemory(PageError::PageSizeUnavailable))
        ));
        assert_eq!(allocator.page_size(), None);
        assert_eq!(allocator.source().map_calls, 0);
    }

    #[test]
    fn unmap_failure_is_reported_and_arena_abandoned() {
        let mut allocator = allocator();

        let ptr = allocator.allocate(64).unwrap();
        allocator.source.fail_unmap = true;

        let err = unsafe { allocator.release(ptr) }.unwrap_err();

        assert!(matches!(err, AllocError::UnmapFailed { .. }));
        assert_eq!(allocator.arena_count(), 0);
        // The mapping leaked.
        assert_eq!(allocator.source().mapped_pages(), 1);

        // The pointer is gone from our bookkeeping.
        assert!(matches!(
            unsafe { allocator.release(ptr) },
            Err(AllocError::UnknownPointer(_))
        ));
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let mut allocator = allocator();
        let _keep = allocator.allocate(64).unwrap();

        let mut local = [0u8; 64];
        let foreign = NonNull::new(local.as_mut_ptr()).unwrap();

        assert!(matches!(
            unsafe { allocator.release(foreign) },
            Err(AllocError::UnknownPointer(_))
        ));
        assert_eq!(allocator.arena_count(), 1);
    }

    #[test]
    fn release_after_arena_is_gone_is_unknown() {
        let mut allocator = allocator();

        let ptr = allocator.allocate(64).unwrap();
        unsafe {
            allocator.release(ptr).unwrap();

            assert!(matches!(allocator.release(ptr), Err(AllocError::UnknownPointer(_))));
        }
    }

    #[test]
    fn high_split_threshold_hands_out_whole_chunk() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = Config::default().with_min_split_payload(PAGE);
        let mut allocator = Allocator::with_config(TestPages::default(), config);

        allocator.allocate(64).unwrap();

        assert_eq!(chunks(&allocator, 0), vec![(PAGE - ARENA_OVERHEAD, false)]);
        assert_eq!(allocator.free_bytes(), 0);
    }

    #[test]
    fn unbounded_split_threshold_does_not_overflow() {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = Config { min_split_payload: usize::MAX };
        let mut allocator = Allocator::with_config(TestPages::default(), config);

        let ptr = allocator.allocate(64).unwrap();

        assert_eq!(chunks(&allocator, 0), vec![(PAGE - ARENA_OVERHEAD, false)]);
        unsafe { allocator.release(ptr).unwrap() };
        assert_eq!(allocator.arena_count(), 0);
    }

    /// xorshift64, enough to shuffle sizes and release order reproducibly.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, n: usize) -> usize {
            (self.next() % n as u64) as usize
        }
    }

    fn assert_layout(allocator: &Allocator<TestPages>, live: &[NonNull<u8>]) {
        for arena in allocator.arenas() {
            let chunks = &arena.chunks;

            let covered: usize = chunks
                .iter()
                .map(|chunk| CHUNK_HEADER_SIZE + chunk.payload_size)
                .sum();
            assert_eq!(covered, arena.total_size - ARENA_HEADER_SIZE);

            assert_eq!(chunks[0].addr, arena.base + ARENA_HEADER_SIZE);
            for pair in chunks.windows(2) {
                assert_eq!(pair[0].user_ptr + pair[0].payload_size, pair[1].addr);
                assert!(!(pair[0].is_free && pair[1].is_free), "free neighbours left unmerged");
            }
            let last = chunks[chunks.len() - 1];
            assert_eq!(last.user_ptr + last.payload_size, arena.base + arena.total_size);

            assert!(!(chunks.len() == 1 && chunks[0].is_free), "empty arena kept mapped");
        }

        let used: Vec<usize> = allocator
            .arenas()
            .iter()
            .flat_map(|arena| arena.chunks.clone())
            .filter(|chunk| !chunk.is_free)
            .map(|chunk| chunk.user_ptr)
            .collect();
        assert_eq!(used.len(), live.len());
        assert!(live.iter().all(|ptr| used.contains(&(ptr.as_ptr() as usize))));
    }

    #[test]
    fn layout_holds_across_mixed_allocations_and_releases() {
        let mut allocator = allocator();
        let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
        let mut live: Vec<NonNull<u8>> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.below(3) != 0 {
                // Mostly small requests, now and then one that spans pages.
                let size = match rng.below(10) {
                    0 => 1 + rng.below(3 * PAGE),
                    _ => 1 + rng.below(512),
                };
                let ptr = allocator.allocate(size).unwrap();
                unsafe { ptr.as_ptr().write_bytes(0x5C, size) };
                live.push(ptr);
            } else {
                let ptr = live.swap_remove(rng.below(live.len()));
                unsafe { allocator.release(ptr).unwrap() };
            }

            assert_layout(&allocator, &live);
        }

        while let Some(ptr) = live.pop() {
            unsafe { allocator.release(ptr).unwrap() };
            assert_layout(&allocator, &live);
        }

        assert_eq!(allocator.arena_count(), 0);
        assert!(allocator.source().mapped.is_empty());
    }

    #[test]
    fn release_all_unmaps_everything() {
        let mut allocator = allocator();

        allocator.allocate(3000).unwrap();
        allocator.allocate(3000).unwrap();
        allocator.allocate(64).unwrap();

        allocator.release_all().unwrap();

        assert_eq!(allocator.arena_count(), 0);
        assert!(allocator.source().mapped.is_empty());
        assert_eq!(allocator.source().unmap_calls, 2);
    }
}
