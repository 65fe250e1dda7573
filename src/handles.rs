//! LRU cache of read-only segment file handles.

use std::fs::File;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use lru::LruCache;

use crate::segment;
use crate::Result;

/// Default cap on open read descriptors.
pub const DEFAULT_HANDLE_CACHE: usize = 256;

pub struct HandleCache {
    root: PathBuf,
    cache: LruCache<u64, File>,
}

impl HandleCache {
    pub fn new(root: PathBuf, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self {
            root,
            cache: LruCache::new(capacity),
        }
    }

    /// Fetch the read handle for `id`, opening it on a miss. Eviction
    /// of the least-recently-used descriptor happens implicitly.
    pub fn get(&mut self, id: u64) -> Result<&mut File> {
        if !self.cache.contains(&id) {
            let file = segment::open_read(&self.root, id)?;
            self.cache.put(id, file);
        }
        Ok(self.cache.get_mut(&id).expect("handle just inserted"))
    }

    /// Drop the cached handle for `id`, if any. Compaction calls this
    /// before rewriting a file.
    pub fn evict(&mut self, id: u64) {
        self.cache.pop(&id);
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
