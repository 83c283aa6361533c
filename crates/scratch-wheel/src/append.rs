//! Growable vector for a single appending writer and many readers.
//!
//! Capacity is fixed at construction (the wheel sizes it to the most blocks
//! a file can hold), so elements never move: the spine holds lazily
//! allocated chunks and readers reach a published element through two
//! pointer hops with no locks. `count` is published with Release and read
//! with Acquire, which orders the element write before its visibility.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

const CHUNK: usize = 512;

pub struct AppendList<T> {
    chunks: Box<[OnceLock<Box<[OnceLock<T>]>>]>,
    capacity: usize,
    count: AtomicU32,
}

impl<T> AppendList<T> {
    /// List accepting at most `capacity` elements.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let spine_len = capacity.div_ceil(CHUNK);
        Self {
            chunks: (0..spine_len).map(|_| OnceLock::new()).collect(),
            capacity,
            count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of appended elements. Pairs with the Release in `push`.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Append an element and return its index.
    ///
    /// Single-writer: callers serialize appends (the file writer appends
    /// under its reservation mutex). Panics when the capacity is exhausted —
    /// the wheel sizes the list so this cannot happen for well-formed files.
    pub fn push(&self, value: T) -> u32 {
        let index = self.count.load(Ordering::Relaxed) as usize;
        assert!(index < self.capacity, "append list is full");

        let chunk = self.chunks[index / CHUNK]
            .get_or_init(|| (0..CHUNK).map(|_| OnceLock::new()).collect());
        let stored = chunk[index % CHUNK].set(value).is_ok();
        debug_assert!(stored, "append slot written twice");

        self.count.store(index as u32 + 1, Ordering::Release);
        index as u32
    }

    /// Element at `index`, or `None` when it has not been published yet.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&T> {
        if index >= self.count() {
            return None;
        }
        let index = index as usize;
        self.chunks[index / CHUNK].get()?[index % CHUNK].get()
    }
}

impl<T> std::fmt::Debug for AppendList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendList")
            .field("count", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
