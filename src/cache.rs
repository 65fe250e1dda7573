//! In-memory message payload cache.
//!
//! A byte-bounded LRU keyed by message id. Each entry carries its own
//! reference count, roughly the number of deliveries still expected;
//! a fetch decrements it and the entry goes away at zero. Messages
//! referenced by more than one queue are cached eagerly since they are
//! likely to be delivered again. Releasing a key that is not cached is
//! a silent no-op.

use lru::LruCache;

use crate::record::MsgId;

/// Default payload cache budget (10 MiB).
pub const DEFAULT_CACHE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheInfo {
    pub entries: usize,
    pub bytes: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    payload: Vec<u8>,
    refcount: u64,
}

pub struct MessageCache {
    entries: LruCache<MsgId, CacheEntry>,
    bytes: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Insert a payload under a key that must not be cached yet.
    ///
    /// # Panics
    ///
    /// Panics if the key is already present; that is a programming
    /// error in the caller. Payloads larger than the whole budget are
    /// silently not cached.
    pub fn insert_new(&mut self, id: MsgId, payload: Vec<u8>, refcount: u64) {
        if self.entries.contains(&id) {
            panic!("message {id} already cached");
        }
        if payload.len() > self.capacity {
            return;
        }
        self.bytes += payload.len();
        self.entries.put(id, CacheEntry { payload, refcount });
        while self.bytes > self.capacity {
            match self.entries.pop_lru() {
                Some((_, entry)) => self.bytes -= entry.payload.len(),
                None => break,
            }
        }
    }

    /// Bump the expected-delivery count of a cached entry, if present.
    pub fn bump(&mut self, id: &MsgId) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.refcount += 1;
        }
    }

    /// Fetch a payload, decrementing its refcount. The entry is dropped
    /// once no further deliveries are expected.
    pub fn fetch(&mut self, id: &MsgId) -> Option<Vec<u8>> {
        match self.entries.get_mut(id) {
            Some(entry) => {
                self.hits += 1;
                let payload = entry.payload.clone();
                entry.refcount = entry.refcount.saturating_sub(1);
                if entry.refcount == 0 {
                    self.bytes -= payload.len();
                    self.entries.pop(id);
                }
                Some(payload)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Read a payload without touching its refcount.
    pub fn peek(&self, id: &MsgId) -> Option<Vec<u8>> {
        self.entries.peek(id).map(|entry| entry.payload.clone())
    }

    pub fn contains(&self, id: &MsgId) -> bool {
        self.entries.contains(id)
    }

    /// Drop an entry outright (the message died).
    pub fn remove(&mut self, id: &MsgId) {
        if let Some(entry) = self.entries.pop(id) {
            self.bytes -= entry.payload.len();
        }
    }

    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            entries: self.entries.len(),
            bytes: self.bytes,
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}
