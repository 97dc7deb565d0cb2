//! Memory-region key allocation.
//!
//! A single process-wide atomic counter hands out keys in blocks of 256.
//! Each connection owns a thread-local [`KeySource`] that draws from its
//! own block and only touches the shared atomic when its block is
//! exhausted, which keeps atomic traffic off the hot path while still
//! guaranteeing that no two key-sources in the process ever hand out the
//! same key.

use std::sync::atomic::{AtomicU64, Ordering};

const BLOCK_SIZE: u64 = 256;

/// The process-wide pool every [`KeySource`] draws blocks from.
static NEXT_KEY_POOL: AtomicU64 = AtomicU64::new(1);

/// A thread-local block allocator of memory-region keys.
pub struct KeySource {
    next_key: u64,
    block_end: u64,
}

impl KeySource {
    /// Creates a key source with an empty block; its first `next` call
    /// will draw a fresh block from the process-wide pool.
    pub fn new() -> Self {
        KeySource { next_key: 0, block_end: 0 }
    }

    /// Returns the next key, strictly greater than every key this source
    /// has previously returned.
    pub fn next(&mut self) -> u64 {
        if self.next_key == self.block_end {
            self.next_key = NEXT_KEY_POOL.fetch_add(BLOCK_SIZE, Ordering::Relaxed);
            self.block_end = self.next_key + BLOCK_SIZE;
        }
        let key = self.next_key;
        self.next_key += 1;
        key
    }
}

impl Default for KeySource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_from_one_source_are_strictly_increasing() {
        let mut source = KeySource::new();
        let mut previous = source.next();
        for _ in 0..1000 {
            let key = source.next();
            assert!(key > previous);
            previous = key;
        }
    }

    #[test]
    fn keys_never_collide_across_sources() {
        let mut a = KeySource::new();
        let mut b = KeySource::new();
        let mut seen = HashSet::new();
        for _ in 0..512 {
            assert!(seen.insert(a.next()));
            assert!(seen.insert(b.next()));
        }
    }
}
