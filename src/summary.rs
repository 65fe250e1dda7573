//! Per-segment summary index.
//!
//! Tracks, for every existing segment, its valid bytes, the byte length
//! of its hole-free prefix, and links to its neighbours. The links form
//! a doubly-linked list ordered by segment number so the compactor can
//! find neighbours in O(1).
//!
//! Invariant: `contiguous_prefix <= valid_bytes <= segment size`.

use std::collections::BTreeMap;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegSummary {
    pub valid_bytes: u64,
    pub contiguous_prefix: u64,
    pub left: Option<u64>,
    pub right: Option<u64>,
}

#[derive(Default)]
pub struct SummaryIndex {
    segments: BTreeMap<u64, SegSummary>,
}

impl SummaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: u64) -> Option<SegSummary> {
        self.segments.get(&id).copied()
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut SegSummary> {
        self.segments.get_mut(&id)
    }

    pub fn insert(&mut self, id: u64, summary: SegSummary) {
        self.segments.insert(id, summary);
    }

    pub fn remove(&mut self, id: u64) -> Option<SegSummary> {
        self.segments.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, SegSummary)> + '_ {
        self.segments.iter().map(|(id, summary)| (*id, *summary))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn last(&self) -> Option<u64> {
        self.segments.keys().next_back().copied()
    }

    /// Link `id` as the new rightmost segment.
    pub fn append_segment(&mut self, id: u64) {
        let left = self.last();
        if let Some(left_id) = left {
            if let Some(left_summary) = self.segments.get_mut(&left_id) {
                left_summary.right = Some(id);
            }
        }
        self.segments.insert(
            id,
            SegSummary {
                valid_bytes: 0,
                contiguous_prefix: 0,
                left,
                right: None,
            },
        );
    }

    /// Account for an appended record of `bytes` (framing included) at
    /// `offset`. The contiguous prefix only grows while the segment has
    /// no holes below the append position.
    pub fn record_append(&mut self, id: u64, offset: u64, bytes: u64) -> Result<()> {
        let summary = self
            .segments
            .get_mut(&id)
            .ok_or(Error::Corrupt("summary row missing for append"))?;
        summary.valid_bytes += bytes;
        if summary.contiguous_prefix == offset {
            summary.contiguous_prefix = offset + bytes;
        }
        Ok(())
    }

    /// Account for a record of `bytes` (framing included) at `offset`
    /// becoming a hole.
    pub fn record_hole(&mut self, id: u64, offset: u64, bytes: u64) -> Result<()> {
        let summary = self
            .segments
            .get_mut(&id)
            .ok_or(Error::Corrupt("summary row missing for hole"))?;
        summary.valid_bytes = summary
            .valid_bytes
            .checked_sub(bytes)
            .ok_or(Error::Corrupt("hole larger than valid bytes"))?;
        if offset < summary.contiguous_prefix {
            summary.contiguous_prefix = offset;
        }
        Ok(())
    }

    /// Remove `id`, patching its neighbours' links.
    pub fn unlink(&mut self, id: u64) -> Result<SegSummary> {
        let summary = self
            .segments
            .remove(&id)
            .ok_or(Error::Corrupt("summary row missing for unlink"))?;
        if let Some(left) = summary.left {
            if let Some(left_summary) = self.segments.get_mut(&left) {
                left_summary.right = summary.right;
            }
        }
        if let Some(right) = summary.right {
            if let Some(right_summary) = self.segments.get_mut(&right) {
                right_summary.left = summary.left;
            }
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_links_form_a_list() {
        let mut index = SummaryIndex::new();
        index.append_segment(0);
        index.append_segment(1);
        index.append_segment(2);

        assert_eq!(index.lookup(0).expect("seg 0").left, None);
        assert_eq!(index.lookup(0).expect("seg 0").right, Some(1));
        assert_eq!(index.lookup(1).expect("seg 1").left, Some(0));
        assert_eq!(index.lookup(1).expect("seg 1").right, Some(2));
        assert_eq!(index.lookup(2).expect("seg 2").right, None);
    }

    #[test]
    fn unlink_patches_neighbours() {
        let mut index = SummaryIndex::new();
        index.append_segment(0);
        index.append_segment(1);
        index.append_segment(2);

        index.unlink(1).expect("unlink");
        assert_eq!(index.lookup(0).expect("seg 0").right, Some(2));
        assert_eq!(index.lookup(2).expect("seg 2").left, Some(0));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn holes_shrink_the_contiguous_prefix() {
        let mut index = SummaryIndex::new();
        index.append_segment(0);
        index.record_append(0, 0, 100).expect("append");
        index.record_append(0, 100, 50).expect("append");
        index.record_append(0, 150, 25).expect("append");
        assert_eq!(index.lookup(0).expect("seg 0").valid_bytes, 175);
        assert_eq!(index.lookup(0).expect("seg 0").contiguous_prefix, 175);

        index.record_hole(0, 100, 50).expect("hole");
        let summary = index.lookup(0).expect("seg 0");
        assert_eq!(summary.valid_bytes, 125);
        assert_eq!(summary.contiguous_prefix, 100);

        // A hole above the prefix leaves it alone.
        index.record_hole(0, 150, 25).expect("hole");
        assert_eq!(index.lookup(0).expect("seg 0").contiguous_prefix, 100);
    }

    #[test]
    fn appends_after_a_hole_do_not_extend_the_prefix() {
        let mut index = SummaryIndex::new();
        index.append_segment(0);
        index.record_append(0, 0, 100).expect("append");
        index.record_hole(0, 0, 100).expect("hole");
        index.record_append(0, 100, 40).expect("append");

        let summary = index.lookup(0).expect("seg 0");
        assert_eq!(summary.valid_bytes, 40);
        assert_eq!(summary.contiguous_prefix, 0);
    }
}
