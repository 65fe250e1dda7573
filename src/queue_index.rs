//! Queue sequence index.
//!
//! Two stores cooperate here: the durable queue-entry table (a row per
//! `(queue, seq)` holding the message id and delivered flag, kept in a
//! transactional [`KvTable`]) and the in-memory `QueueSeq` map holding
//! each queue's half-open `[read_seq, write_seq)` range. Rows for
//! delivered-but-unacked messages sit below `read_seq` until they are
//! acked; recovery and requeue rewind `read_seq` over them so they are
//! delivered again.
//!
//! Row key: `be_u32(len(queue)) || queue_bytes || be_u64(seq)`.
//! Row value: `id_bytes || u8(delivered)`.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::kv::{KvTable, WriteBatch};
use crate::record::{MsgId, ID_BYTES};
use crate::{Error, Result};

const ENTRY_BYTES: usize = ID_BYTES + 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueSeq {
    pub read_seq: u64,
    pub write_seq: u64,
}

impl QueueSeq {
    pub fn len(&self) -> u64 {
        self.write_seq - self.read_seq
    }

    pub fn is_empty(&self) -> bool {
        self.read_seq == self.write_seq
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub msg_id: MsgId,
    pub delivered: bool,
}

fn queue_prefix(queue: &str) -> Vec<u8> {
    let name = queue.as_bytes();
    let mut key = Vec::with_capacity(4 + name.len());
    key.extend_from_slice(&(name.len() as u32).to_be_bytes());
    key.extend_from_slice(name);
    key
}

fn entry_key(queue: &str, seq: u64) -> Vec<u8> {
    let mut key = queue_prefix(queue);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decode_row_key(key: &[u8]) -> Result<(String, u64)> {
    if key.len() < 12 {
        return Err(Error::Corrupt("queue row key too short"));
    }
    let name_len = u32::from_be_bytes(key[0..4].try_into().expect("slice length")) as usize;
    if key.len() != 4 + name_len + 8 {
        return Err(Error::Corrupt("queue row key size mismatch"));
    }
    let name = std::str::from_utf8(&key[4..4 + name_len])
        .map_err(|_| Error::Corrupt("queue name is not utf-8"))?;
    let seq = u64::from_be_bytes(key[4 + name_len..].try_into().expect("slice length"));
    Ok((name.to_string(), seq))
}

fn decode_key_seq(key: &[u8]) -> Result<u64> {
    if key.len() < 8 {
        return Err(Error::Corrupt("queue row key too short"));
    }
    Ok(u64::from_be_bytes(
        key[key.len() - 8..].try_into().expect("slice length"),
    ))
}

fn encode_entry(entry: &QueueEntry) -> [u8; ENTRY_BYTES] {
    let mut buf = [0u8; ENTRY_BYTES];
    buf[0..ID_BYTES].copy_from_slice(entry.msg_id.as_bytes());
    buf[ID_BYTES] = entry.delivered as u8;
    buf
}

fn decode_entry(value: &[u8]) -> Result<QueueEntry> {
    if value.len() != ENTRY_BYTES {
        return Err(Error::Corrupt("queue row value size mismatch"));
    }
    let mut id = [0u8; ID_BYTES];
    id.copy_from_slice(&value[0..ID_BYTES]);
    Ok(QueueEntry {
        msg_id: MsgId::from_bytes(id),
        delivered: value[ID_BYTES] != 0,
    })
}

pub struct QueueIndex {
    table: Box<dyn KvTable>,
    seqs: HashMap<String, QueueSeq>,
}

impl QueueIndex {
    pub fn open(table: Box<dyn KvTable>) -> Self {
        Self {
            table,
            seqs: HashMap::new(),
        }
    }

    pub fn sequences(&self, queue: &str) -> Option<QueueSeq> {
        self.seqs.get(queue).copied()
    }

    pub fn length(&self, queue: &str) -> u64 {
        self.seqs.get(queue).map(QueueSeq::len).unwrap_or(0)
    }

    pub fn queue_count(&self) -> usize {
        self.seqs.len()
    }

    pub fn flush(&self) -> Result<()> {
        self.table.flush()
    }

    /// Assign the next write seq to `id` and durably insert its row.
    pub fn publish(&mut self, queue: &str, id: &MsgId, delivered: bool) -> Result<u64> {
        let seq = self.seqs.get(queue).map(|s| s.write_seq).unwrap_or(0);
        let entry = QueueEntry {
            msg_id: *id,
            delivered,
        };
        self.table.put(&entry_key(queue, seq), &encode_entry(&entry))?;
        self.seqs.entry(queue.to_string()).or_default().write_seq = seq + 1;
        Ok(seq)
    }

    /// Advance `read_seq` over the head row and return it, marking it
    /// delivered if it was not already. The returned tuple is
    /// `(seq, entry, remaining, redelivered)`.
    pub fn next_entry(&mut self, queue: &str) -> Result<Option<(u64, QueueEntry, u64, bool)>> {
        let seqs = match self.seqs.get(queue).copied() {
            Some(seqs) if !seqs.is_empty() => seqs,
            _ => return Ok(None),
        };
        let seq = seqs.read_seq;
        let key = entry_key(queue, seq);
        let value = self
            .table
            .get(&key)?
            .ok_or(Error::Corrupt("queue row missing inside sequence range"))?;
        let mut entry = decode_entry(&value)?;
        let redelivered = entry.delivered;
        if !entry.delivered {
            entry.delivered = true;
            self.table.put(&key, &encode_entry(&entry))?;
        }
        let seqs = self.seqs.get_mut(queue).expect("queue present");
        seqs.read_seq += 1;
        let remaining = seqs.len();
        Ok(Some((seq, entry, remaining, redelivered)))
    }

    pub fn get(&self, queue: &str, seq: u64) -> Result<Option<QueueEntry>> {
        match self.table.get(&entry_key(queue, seq))? {
            Some(value) => Ok(Some(decode_entry(&value)?)),
            None => Ok(None),
        }
    }

    pub fn begin_write(&self) -> WriteBatch {
        self.table.begin_write()
    }

    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.table.commit(batch)
    }

    /// Stage deletion of an acked row.
    pub fn stage_ack(&self, batch: &mut WriteBatch, queue: &str, seq: u64) {
        batch.delete(entry_key(queue, seq));
    }

    /// Stage rows for a transactional publish, assigning seq ids in the
    /// given order. The write sequence is only advanced by
    /// [`QueueIndex::advance_write`] once the batch has committed.
    pub fn stage_publishes(
        &self,
        batch: &mut WriteBatch,
        queue: &str,
        ids: &[MsgId],
        delivered: bool,
    ) {
        let mut seq = self.seqs.get(queue).map(|s| s.write_seq).unwrap_or(0);
        for id in ids {
            let entry = QueueEntry {
                msg_id: *id,
                delivered,
            };
            batch.put(entry_key(queue, seq), encode_entry(&entry).to_vec());
            seq += 1;
        }
    }

    pub fn advance_write(&mut self, queue: &str, n: u64) {
        let seqs = self.seqs.entry(queue.to_string()).or_default();
        seqs.write_seq += n;
    }

    /// Move the given delivered entries to the tail, preserving their
    /// order relative to newly published messages. `read_seq` rewinds
    /// to the smallest resident row afterwards so delivered-but-unacked
    /// rows that were not requeued come back first.
    pub fn requeue(&mut self, queue: &str, entries: &[(MsgId, u64, bool)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut write = self.seqs.get(queue).map(|s| s.write_seq).unwrap_or(0);
        let mut batch = self.table.begin_write();
        for (id, old_seq, delivered) in entries {
            batch.delete(entry_key(queue, *old_seq));
            let entry = QueueEntry {
                msg_id: *id,
                delivered: *delivered,
            };
            batch.put(entry_key(queue, write), encode_entry(&entry).to_vec());
            write += 1;
        }
        self.table.commit(batch)?;

        let first = self.first_seq(queue)?;
        let seqs = self.seqs.entry(queue.to_string()).or_default();
        seqs.write_seq = write;
        if let Some(min_seq) = first {
            if min_seq < seqs.read_seq {
                seqs.read_seq = min_seq;
            }
        }
        Ok(())
    }

    /// Move the next `n` rows (clamped to the queue length) from the
    /// head to the tail, advancing both sequences by the count moved.
    pub fn requeue_next_n(&mut self, queue: &str, n: u64) -> Result<u64> {
        let seqs = match self.seqs.get(queue).copied() {
            Some(seqs) => seqs,
            None => return Ok(0),
        };
        let n = n.min(seqs.len());
        if n == 0 {
            return Ok(0);
        }
        let mut batch = self.table.begin_write();
        for i in 0..n {
            let key = entry_key(queue, seqs.read_seq + i);
            let value = self
                .table
                .get(&key)?
                .ok_or(Error::Corrupt("queue row missing inside sequence range"))?;
            batch.delete(key);
            batch.put(entry_key(queue, seqs.write_seq + i), value);
        }
        self.table.commit(batch)?;
        let seqs = self.seqs.get_mut(queue).expect("queue present");
        seqs.read_seq += n;
        seqs.write_seq += n;
        Ok(n)
    }

    /// Remove every row of the queue, leaving the sequences equal. The
    /// removed rows are returned so the caller can release references.
    pub fn purge(&mut self, queue: &str) -> Result<Vec<(u64, QueueEntry)>> {
        let rows = self.rows(queue)?;
        if !rows.is_empty() {
            let mut batch = self.table.begin_write();
            for (seq, _) in &rows {
                batch.delete(entry_key(queue, *seq));
            }
            self.table.commit(batch)?;
        }
        if let Some(seqs) = self.seqs.get_mut(queue) {
            seqs.read_seq = seqs.write_seq;
        }
        Ok(rows)
    }

    /// Purge plus removal of the queue's sequence row.
    pub fn delete_queue(&mut self, queue: &str) -> Result<Vec<(u64, QueueEntry)>> {
        let rows = self.purge(queue)?;
        self.seqs.remove(queue);
        Ok(rows)
    }

    /// Every row of the queue in seq order, delivered-but-unacked rows
    /// included.
    pub fn rows(&self, queue: &str) -> Result<Vec<(u64, QueueEntry)>> {
        let prefix = queue_prefix(queue);
        let mut rows = Vec::new();
        for (key, value) in self.table.match_prefix(&prefix)? {
            rows.push((decode_key_seq(&key)?, decode_entry(&value)?));
        }
        Ok(rows)
    }

    fn first_seq(&self, queue: &str) -> Result<Option<u64>> {
        match self.table.first_in_prefix(&queue_prefix(queue))? {
            Some((key, _)) => Ok(Some(decode_key_seq(&key)?)),
            None => Ok(None),
        }
    }

    // ---- recovery ----

    /// Every row in the table as `(queue, seq, entry)`.
    pub fn all_rows(&self) -> Result<Vec<(String, u64, QueueEntry)>> {
        let mut rows = Vec::new();
        for (key, value) in self.table.match_prefix(&[])? {
            let (queue, seq) = decode_row_key(&key)?;
            rows.push((queue, seq, decode_entry(&value)?));
        }
        Ok(rows)
    }

    /// Delete every row of queues not in `durable`. Returns the number
    /// of rows removed.
    pub fn drop_queues_except(&mut self, durable: &HashSet<String>) -> Result<usize> {
        let mut batch = self.table.begin_write();
        let mut removed = 0;
        for (queue, seq, _) in self.all_rows()? {
            if !durable.contains(&queue) {
                self.stage_ack(&mut batch, &queue, seq);
                removed += 1;
            }
        }
        if removed > 0 {
            self.table.commit(batch)?;
        }
        Ok(removed)
    }

    /// Number of rows referencing each message id.
    pub fn ref_counts(&self) -> Result<HashMap<MsgId, u64>> {
        let mut counts = HashMap::new();
        for (_, _, entry) in self.all_rows()? {
            *counts.entry(entry.msg_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Delete rows whose message id is not in `live` (messages lost to
    /// a crash). Returns the number of rows removed.
    pub fn retain_live(&mut self, live: &HashSet<MsgId>) -> Result<usize> {
        let mut batch = self.table.begin_write();
        let mut removed = 0;
        for (queue, seq, entry) in self.all_rows()? {
            if !live.contains(&entry.msg_id) {
                self.stage_ack(&mut batch, &queue, seq);
                removed += 1;
            }
        }
        if removed > 0 {
            self.table.commit(batch)?;
        }
        Ok(removed)
    }

    /// Rebuild the in-memory sequences from the surviving rows:
    /// `read_seq = min(seq)`, `write_seq = max(seq) + 1`, then close
    /// gaps by shifting rows so `(seq - read_seq)` is dense.
    pub fn rebuild_seqs(&mut self) -> Result<()> {
        self.seqs.clear();
        let mut by_queue: BTreeMap<String, Vec<(u64, QueueEntry)>> = BTreeMap::new();
        for (queue, seq, entry) in self.all_rows()? {
            by_queue.entry(queue).or_default().push((seq, entry));
        }

        for (queue, rows) in by_queue {
            let read_seq = rows[0].0;
            let dense: HashSet<u64> = (0..rows.len() as u64).map(|i| read_seq + i).collect();
            let mut batch = self.table.begin_write();
            let mut moved = false;
            for (i, (seq, entry)) in rows.iter().enumerate() {
                let target = read_seq + i as u64;
                if *seq != target {
                    batch.put(entry_key(&queue, target), encode_entry(entry).to_vec());
                    moved = true;
                }
                if *seq != target && !dense.contains(seq) {
                    batch.delete(entry_key(&queue, *seq));
                }
            }
            if moved {
                self.table.commit(batch)?;
            }
            self.seqs.insert(
                queue,
                QueueSeq {
                    read_seq,
                    write_seq: read_seq + rows.len() as u64,
                },
            );
        }
        Ok(())
    }
}
