use crate::utils::{WORD_SIZE, align};

/// Default for [`Config::min_split_payload`]: two machine words.
pub const MIN_SPLIT_PAYLOAD: usize = 2 * WORD_SIZE;

/// Tunables of the [`crate::Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// A free chunk is only split when the leftover is larger than a chunk
    /// header plus this many bytes. Smaller leftovers stay attached to the
    /// allocation as internal fragmentation.
    pub min_split_payload: usize,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            min_split_payload: MIN_SPLIT_PAYLOAD,
        }
    }

    /// Sets the split threshold, rounded up to the word size. Values past
    /// `isize::MAX` are clamped, no chunk can be that large anyway.
    pub fn with_min_split_payload(mut self, bytes: usize) -> Self {
        self.min_split_payload = align(bytes.min(isize::MAX as usize), WORD_SIZE);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
