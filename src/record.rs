//! On-disk record framing.
//!
//! Every stored message is framed as
//!
//! ```text
//! be_u64(total_size) || be_u64(id_size) || id_bytes || payload || u8(terminator)
//! ```
//!
//! where `total_size = id_size + len(payload)` and the terminator byte
//! encodes the persistence flag. The 17 framing bytes (two length
//! prefixes plus the terminator) are excluded from the `size` recorded
//! in the location index.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};

use crate::{Error, Result};

/// Framing overhead per record: two 8-byte length prefixes plus the
/// terminator byte.
pub const FRAMING: u64 = 17;

/// Terminator for a persistent record.
pub const TERM_PERSISTENT: u8 = 0xFE;

/// Terminator for a transient record.
pub const TERM_TRANSIENT: u8 = 0xFF;

/// Width of a message identifier on disk.
pub const ID_BYTES: usize = 16;

/// Globally-unique message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgId([u8; ID_BYTES]);

impl MsgId {
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }
}

impl From<u128> for MsgId {
    fn from(value: u128) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MsgId({self})")
    }
}

/// A fully-read record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: MsgId,
    pub payload: Vec<u8>,
    pub is_persistent: bool,
}

/// A record located by the recovery scan. `total_size` excludes framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedRecord {
    pub id: MsgId,
    pub is_persistent: bool,
    pub total_size: u64,
    pub offset: u64,
}

/// Encode a record frame for `id` and `payload`.
pub fn encode_record(id: &MsgId, payload: &[u8], persistent: bool) -> Vec<u8> {
    let total_size = (ID_BYTES + payload.len()) as u64;
    let mut buf = Vec::with_capacity(total_size as usize + FRAMING as usize);
    buf.extend_from_slice(&total_size.to_be_bytes());
    buf.extend_from_slice(&(ID_BYTES as u64).to_be_bytes());
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(payload);
    buf.push(if persistent { TERM_PERSISTENT } else { TERM_TRANSIENT });
    buf
}

/// Read and verify one record at an absolute offset.
///
/// `total_size` is the size recorded in the location index (id plus
/// payload, excluding framing). Any mismatch between the frame on disk
/// and the expected size is segment corruption and fatal for this
/// record.
pub fn read_record(file: &mut File, offset: u64, total_size: u64) -> Result<Record> {
    file.seek(SeekFrom::Start(offset))?;
    let mut frame = vec![0u8; total_size as usize + FRAMING as usize];
    file.read_exact(&mut frame)?;

    let stored_total = u64::from_be_bytes(frame[0..8].try_into().expect("slice length"));
    let id_size = u64::from_be_bytes(frame[8..16].try_into().expect("slice length"));
    if stored_total != total_size {
        return Err(Error::Corrupt("record size prefix mismatch"));
    }
    if id_size != ID_BYTES as u64 || id_size > stored_total {
        return Err(Error::Corrupt("record id size mismatch"));
    }

    let mut id = [0u8; ID_BYTES];
    id.copy_from_slice(&frame[16..16 + ID_BYTES]);
    let payload = frame[16 + ID_BYTES..16 + total_size as usize].to_vec();
    let is_persistent = match frame[16 + total_size as usize] {
        TERM_PERSISTENT => true,
        TERM_TRANSIENT => false,
        _ => return Err(Error::Corrupt("record terminator mismatch")),
    };

    Ok(Record {
        id: MsgId::from_bytes(id),
        payload,
        is_persistent,
    })
}

/// Forward scan used at recovery.
///
/// Walks the file from offset 0. At each position the two length
/// prefixes are read; if either is zero, or the terminator is not one
/// of the two sentinels, the scanner skips `total_size + FRAMING` bytes
/// and continues. Well-framed records are returned in ascending offset
/// order. Payloads are not materialized.
pub fn scan_records(file: &mut File) -> Result<Vec<ScannedRecord>> {
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(&mut *file);
    let mut records = Vec::new();
    let mut offset = 0u64;

    let mut pos = 0u64;
    while offset + FRAMING <= len {
        if pos != offset {
            reader.seek_relative((offset - pos) as i64)?;
            pos = offset;
        }
        let mut prefix = [0u8; 16];
        reader.read_exact(&mut prefix)?;
        pos += 16;
        let total_size = u64::from_be_bytes(prefix[0..8].try_into().expect("slice length"));
        let id_size = u64::from_be_bytes(prefix[8..16].try_into().expect("slice length"));

        let next = total_size
            .checked_add(FRAMING)
            .and_then(|frame| offset.checked_add(frame));
        if total_size == 0 || id_size == 0 {
            offset = match next {
                Some(next) => next,
                None => break,
            };
            continue;
        }
        let end = match next {
            Some(end) if end <= len => end,
            _ => break,
        };
        if id_size != ID_BYTES as u64 || id_size > total_size {
            offset = end;
            continue;
        }

        let mut id = [0u8; ID_BYTES];
        reader.read_exact(&mut id)?;
        pos += ID_BYTES as u64;
        reader.seek_relative((end - 1 - pos) as i64)?;
        let mut term = [0u8; 1];
        reader.read_exact(&mut term)?;
        pos = end;
        match term[0] {
            TERM_PERSISTENT | TERM_TRANSIENT => records.push(ScannedRecord {
                id: MsgId::from_bytes(id),
                is_persistent: term[0] == TERM_PERSISTENT,
                total_size,
                offset,
            }),
            _ => {}
        }
        offset = end;
    }

    Ok(records)
}
