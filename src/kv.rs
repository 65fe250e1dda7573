//! Pluggable transactional key/value table.
//!
//! The queue-entry table needs atomicity across multiple rows (tx
//! commit, purge, requeue), so the store talks to storage through this
//! small interface instead of a concrete engine. The shipped backend is
//! a sled tree; batches lower onto `sled::Batch`, which applies
//! atomically, and `flush` is the durability barrier.

use crate::{Error, Result};

enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of writes applied atomically by [`KvTable::commit`].
#[derive(Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub trait KvTable: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    /// All rows whose key starts with `prefix`, in key order.
    fn match_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// The first row whose key starts with `prefix`.
    fn first_in_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
    fn begin_write(&self) -> WriteBatch {
        WriteBatch::default()
    }
    fn commit(&self, batch: WriteBatch) -> Result<()>;
    /// Durability barrier: block until committed rows reach stable
    /// storage.
    fn flush(&self) -> Result<()>;
}

/// Queue-entry table backed by a sled tree.
pub struct SledTable {
    tree: sled::Tree,
}

impl SledTable {
    pub fn open(db: &sled::Db, name: &str) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(name)?,
        })
    }
}

impl KvTable for SledTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key)?.map(|value| value.to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.tree.remove(key)?;
        Ok(())
    }

    fn match_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows = Vec::new();
        for entry in self.tree.scan_prefix(prefix) {
            let (key, value) = entry?;
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    fn first_in_prefix(&self, prefix: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.tree.scan_prefix(prefix).next() {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }

    fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut lowered = sled::Batch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => lowered.insert(key, value),
                BatchOp::Delete(key) => lowered.remove(key),
            }
        }
        self.tree.apply_batch(lowered)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.tree.flush().map_err(Error::Index)?;
        Ok(())
    }
}
