//! Message location index.
//!
//! Maps a message id to its physical location, reference count and
//! persistence flag. Two backends exist: an in-memory hash table for
//! low-latency operation and a disk-resident table for low-memory
//! operation. The coordinator swaps between them atomically by copying
//! every entry, clearing the source and flipping the selector.

use std::collections::HashMap;

use crate::record::MsgId;
use crate::{Error, Result};

/// Sled tree holding the disk-resident backend.
pub const DISK_INDEX_TREE: &str = "msg_locations";

const LOC_BYTES: usize = 33;

/// Physical location of a live message.
///
/// Invariant: `refcount >= 1` for every present key; a dead message has
/// no entry at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgLoc {
    pub segment: u64,
    pub offset: u64,
    pub size: u64,
    pub refcount: u64,
    pub is_persistent: bool,
}

/// Backend selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexMode {
    Ram,
    Disk,
}

pub trait LocationIndex: Send {
    fn get(&self, id: &MsgId) -> Result<Option<MsgLoc>>;
    fn insert(&mut self, id: MsgId, loc: MsgLoc) -> Result<()>;
    /// Insert failing with [`Error::DuplicateId`] if the key exists.
    fn insert_new(&mut self, id: MsgId, loc: MsgLoc) -> Result<()>;
    fn delete(&mut self, id: &MsgId) -> Result<()>;
    /// All entries located in `segment`. Used only by compaction and
    /// recovery.
    fn match_by_segment(&self, segment: u64) -> Result<Vec<(MsgId, MsgLoc)>>;
    /// Every entry, in unspecified order. Used by the backend swap.
    fn entries(&self) -> Result<Vec<(MsgId, MsgLoc)>>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn clear(&mut self) -> Result<()>;
}

/// Copy every entry of `from` into `to`, clear `from`, and return `to`
/// as the active backend.
pub fn swap_backend(
    mut from: Box<dyn LocationIndex>,
    mut to: Box<dyn LocationIndex>,
) -> Result<Box<dyn LocationIndex>> {
    for (id, loc) in from.entries()? {
        to.insert(id, loc)?;
    }
    from.clear()?;
    Ok(to)
}

/// Low-latency backend: a plain hash table.
#[derive(Default)]
pub struct RamIndex {
    entries: HashMap<MsgId, MsgLoc>,
}

impl RamIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocationIndex for RamIndex {
    fn get(&self, id: &MsgId) -> Result<Option<MsgLoc>> {
        Ok(self.entries.get(id).copied())
    }

    fn insert(&mut self, id: MsgId, loc: MsgLoc) -> Result<()> {
        self.entries.insert(id, loc);
        Ok(())
    }

    fn insert_new(&mut self, id: MsgId, loc: MsgLoc) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(Error::DuplicateId);
        }
        self.entries.insert(id, loc);
        Ok(())
    }

    fn delete(&mut self, id: &MsgId) -> Result<()> {
        self.entries.remove(id);
        Ok(())
    }

    fn match_by_segment(&self, segment: u64) -> Result<Vec<(MsgId, MsgLoc)>> {
        Ok(self
            .entries
            .iter()
            .filter(|(_, loc)| loc.segment == segment)
            .map(|(id, loc)| (*id, *loc))
            .collect())
    }

    fn entries(&self) -> Result<Vec<(MsgId, MsgLoc)>> {
        Ok(self.entries.iter().map(|(id, loc)| (*id, *loc)).collect())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Low-memory backend: a sled tree with fixed 33-byte values.
pub struct DiskIndex {
    tree: sled::Tree,
    len: usize,
}

impl DiskIndex {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree(DISK_INDEX_TREE)?;
        let len = tree.len();
        Ok(Self { tree, len })
    }
}

fn encode_loc(loc: &MsgLoc) -> [u8; LOC_BYTES] {
    let mut buf = [0u8; LOC_BYTES];
    buf[0..8].copy_from_slice(&loc.segment.to_be_bytes());
    buf[8..16].copy_from_slice(&loc.offset.to_be_bytes());
    buf[16..24].copy_from_slice(&loc.size.to_be_bytes());
    buf[24..32].copy_from_slice(&loc.refcount.to_be_bytes());
    buf[32] = loc.is_persistent as u8;
    buf
}

fn decode_loc(value: &[u8]) -> Result<MsgLoc> {
    if value.len() != LOC_BYTES {
        return Err(Error::Corrupt("location entry size mismatch"));
    }
    Ok(MsgLoc {
        segment: u64::from_be_bytes(value[0..8].try_into().expect("slice length")),
        offset: u64::from_be_bytes(value[8..16].try_into().expect("slice length")),
        size: u64::from_be_bytes(value[16..24].try_into().expect("slice length")),
        refcount: u64::from_be_bytes(value[24..32].try_into().expect("slice length")),
        is_persistent: value[32] != 0,
    })
}

fn decode_id(key: &[u8]) -> Result<MsgId> {
    let bytes: [u8; 16] = key
        .try_into()
        .map_err(|_| Error::Corrupt("location key size mismatch"))?;
    Ok(MsgId::from_bytes(bytes))
}

impl LocationIndex for DiskIndex {
    fn get(&self, id: &MsgId) -> Result<Option<MsgLoc>> {
        match self.tree.get(id.as_bytes())? {
            Some(value) => Ok(Some(decode_loc(&value)?)),
            None => Ok(None),
        }
    }

    fn insert(&mut self, id: MsgId, loc: MsgLoc) -> Result<()> {
        if self
            .tree
            .insert(id.as_bytes(), &encode_loc(&loc)[..])?
            .is_none()
        {
            self.len += 1;
        }
        Ok(())
    }

    fn insert_new(&mut self, id: MsgId, loc: MsgLoc) -> Result<()> {
        if self.tree.get(id.as_bytes())?.is_some() {
            return Err(Error::DuplicateId);
        }
        self.tree.insert(id.as_bytes(), &encode_loc(&loc)[..])?;
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, id: &MsgId) -> Result<()> {
        if self.tree.remove(id.as_bytes())?.is_some() {
            self.len -= 1;
        }
        Ok(())
    }

    fn match_by_segment(&self, segment: u64) -> Result<Vec<(MsgId, MsgLoc)>> {
        let mut matches = Vec::new();
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            let loc = decode_loc(&value)?;
            if loc.segment == segment {
                matches.push((decode_id(&key)?, loc));
            }
        }
        Ok(matches)
    }

    fn entries(&self) -> Result<Vec<(MsgId, MsgLoc)>> {
        let mut entries = Vec::new();
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            entries.push((decode_id(&key)?, decode_loc(&value)?));
        }
        Ok(entries)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn clear(&mut self) -> Result<()> {
        self.tree.clear()?;
        self.len = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loc(segment: u64, refcount: u64) -> MsgLoc {
        MsgLoc {
            segment,
            offset: 64,
            size: 128,
            refcount,
            is_persistent: true,
        }
    }

    #[test]
    fn ram_insert_new_rejects_duplicates() {
        let mut index = RamIndex::new();
        index.insert_new(MsgId::from(1u128), loc(0, 1)).expect("insert");
        let err = index.insert_new(MsgId::from(1u128), loc(0, 1)).unwrap_err();
        assert!(matches!(err, Error::DuplicateId));
    }

    #[test]
    fn disk_round_trip_and_segment_match() {
        let dir = TempDir::new().expect("tempdir");
        let db = sled::Config::default()
            .path(dir.path().join("tables"))
            .open()
            .expect("sled open");
        let mut index = DiskIndex::open(&db).expect("open");

        index.insert_new(MsgId::from(1u128), loc(0, 2)).expect("insert");
        index.insert_new(MsgId::from(2u128), loc(3, 1)).expect("insert");
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&MsgId::from(1u128)).expect("get"), Some(loc(0, 2)));

        let in_seg3 = index.match_by_segment(3).expect("match");
        assert_eq!(in_seg3, vec![(MsgId::from(2u128), loc(3, 1))]);

        index.delete(&MsgId::from(1u128)).expect("delete");
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&MsgId::from(1u128)).expect("get"), None);
    }

    #[test]
    fn swap_moves_entries_and_clears_source() {
        let dir = TempDir::new().expect("tempdir");
        let db = sled::Config::default()
            .path(dir.path().join("tables"))
            .open()
            .expect("sled open");

        let mut ram: Box<dyn LocationIndex> = Box::new(RamIndex::new());
        ram.insert_new(MsgId::from(1u128), loc(0, 1)).expect("insert");
        ram.insert_new(MsgId::from(2u128), loc(1, 3)).expect("insert");

        let disk: Box<dyn LocationIndex> = Box::new(DiskIndex::open(&db).expect("open"));
        let active = swap_backend(ram, disk).expect("swap");
        assert_eq!(active.len(), 2);
        assert_eq!(active.get(&MsgId::from(2u128)).expect("get"), Some(loc(1, 3)));
    }
}
