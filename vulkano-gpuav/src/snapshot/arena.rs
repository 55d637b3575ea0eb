/// A growable linear allocator of `u32` words, holding the binding snapshots of one recording.
///
/// Allocations never fail: when the arena is full, its storage grows to at least twice its
/// previous size. Offsets that were handed out stay valid until the arena is reset.
#[derive(Clone, Debug)]
pub struct SnapshotArena {
    words: Vec<u32>,
    initial_words: usize,
}

impl SnapshotArena {
    /// Creates an arena with room for `initial_words` words before it needs to grow.
    pub fn new(initial_words: u32) -> Self {
        let initial_words = initial_words as usize;

        Self {
            words: Vec::with_capacity(initial_words),
            initial_words,
        }
    }

    /// Forgets all allocations. The storage is kept.
    #[inline]
    pub fn reset(&mut self) {
        self.words.clear();
    }

    /// Returns the number of words that are allocated.
    #[inline]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Returns whether nothing is allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Returns the number of words that can be allocated before the arena grows.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.capacity()
    }

    /// Allocates `len` zeroed words, and returns the offset of the first one.
    pub fn alloc(&mut self, len: usize) -> u32 {
        let offset = self.words.len();
        let end = offset + len;

        if end > self.words.capacity() {
            let new_capacity = end
                .max(self.words.capacity() * 2)
                .max(self.initial_words);
            tracing::debug!(
                old_capacity = self.words.capacity(),
                new_capacity,
                "growing binding snapshot arena",
            );
            self.words.reserve_exact(new_capacity - offset);
        }

        self.words.resize(end, 0);

        offset as u32
    }

    /// Returns the allocated words.
    #[inline]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Returns the allocated words.
    #[inline]
    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }
}
