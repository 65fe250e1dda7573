//! Segment file I/O.
//!
//! Segments are append-only files named by a monotonically-increasing
//! decimal integer with a `.rdq` extension. Compaction writes `.rdt`
//! temp files next to them. Appends go through a buffered writer owned
//! by the coordinator; durability comes from the group-commit fsync,
//! tracked here as `last_sync`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::record::{self, MsgId, FRAMING};
use crate::Result;

/// Extension of a live segment file.
pub const SEGMENT_EXT: &str = "rdq";

/// Extension of a compaction temp file.
pub const TEMP_EXT: &str = "rdt";

/// Default soft size cap per segment (256 MiB).
pub const DEFAULT_SEGMENT_CAP: u64 = 256 * 1024 * 1024;

pub fn segment_filename(id: u64) -> String {
    format!("{id:09}.{SEGMENT_EXT}")
}

pub fn temp_filename(id: u64) -> String {
    format!("{id:09}.{TEMP_EXT}")
}

pub fn segment_path(root: &Path, id: u64) -> PathBuf {
    root.join(segment_filename(id))
}

pub fn temp_path(root: &Path, id: u64) -> PathBuf {
    root.join(temp_filename(id))
}

/// Parse a segment filename. Zero padding is optional.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    parse_numbered(name, SEGMENT_EXT)
}

/// Parse a compaction temp filename.
pub fn parse_temp_filename(name: &str) -> Option<u64> {
    parse_numbered(name, TEMP_EXT)
}

fn parse_numbered(name: &str, ext: &str) -> Option<u64> {
    let base = name.strip_suffix(ext)?.strip_suffix('.')?;
    if base.is_empty() || !base.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    base.parse::<u64>().ok()
}

/// Discover segment and temp file ids in a directory, each sorted
/// ascending.
pub fn discover(dir: &Path) -> Result<(Vec<u64>, Vec<u64>)> {
    let mut segments = Vec::new();
    let mut temps = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if let Some(id) = parse_segment_filename(name) {
            segments.push(id);
        } else if let Some(id) = parse_temp_filename(name) {
            temps.push(id);
        }
    }

    segments.sort_unstable();
    temps.sort_unstable();
    Ok((segments, temps))
}

/// Open a read-only handle on a segment.
pub fn open_read(root: &Path, id: u64) -> Result<File> {
    Ok(File::open(segment_path(root, id))?)
}

/// Compaction primitive: set the file length to `low`, preallocate up
/// to `high`, and return a write handle positioned at `low`.
pub fn truncate_and_extend(path: &Path, low: u64, high: u64) -> Result<File> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.set_len(low)?;
    file.set_len(high)?;
    file.seek(SeekFrom::Start(low))?;
    Ok(file)
}

/// The current append segment.
///
/// Writes accumulate in the OS buffer behind a `BufWriter`; `sync`
/// flushes and fsyncs, advancing `last_sync`. The file is preallocated
/// to the soft cap on creation to avoid fragmentation, with the write
/// position reset to zero.
pub struct AppendSegment {
    id: u64,
    writer: BufWriter<File>,
    append_offset: u64,
    last_sync: u64,
    dirty: bool,
    cap: u64,
}

impl AppendSegment {
    /// Create a fresh segment preallocated to `cap`.
    pub fn create(root: &Path, id: u64, cap: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(segment_path(root, id))?;
        file.set_len(cap)?;
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(0))?;
        Ok(Self {
            id,
            writer,
            append_offset: 0,
            last_sync: 0,
            dirty: false,
            cap,
        })
    }

    /// Reopen an existing segment for append at `offset`.
    ///
    /// Everything below `offset` already survived a restart, so it
    /// counts as synced. The preallocation is restored if a previous
    /// truncation shrank the file.
    pub fn open_at(root: &Path, id: u64, cap: u64, offset: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(segment_path(root, id))?;
        if file.metadata()?.len() < cap {
            file.set_len(cap)?;
        }
        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            id,
            writer,
            append_offset: offset,
            last_sync: offset,
            dirty: false,
            cap,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn append_offset(&self) -> u64 {
        self.append_offset
    }

    pub fn last_sync(&self) -> u64 {
        self.last_sync
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Whether a record of `total_size` payload-and-id bytes still fits
    /// under the soft cap.
    pub fn has_room(&self, total_size: u64) -> bool {
        self.append_offset + total_size + FRAMING <= self.cap
    }

    /// Append one record, returning its offset and `total_size`.
    pub fn append(&mut self, id: &MsgId, payload: &[u8], persistent: bool) -> Result<(u64, u64)> {
        let frame = record::encode_record(id, payload, persistent);
        let offset = self.append_offset;
        self.writer.write_all(&frame)?;
        self.append_offset += frame.len() as u64;
        self.dirty = true;
        Ok((offset, frame.len() as u64 - FRAMING))
    }

    /// Flush buffered writes and fsync, advancing the last-sync offset.
    pub fn sync(&mut self) -> Result<u64> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.last_sync = self.append_offset;
        self.dirty = false;
        Ok(self.last_sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn segment_naming() {
        assert_eq!(segment_filename(0), "000000000.rdq");
        assert_eq!(segment_filename(42), "000000042.rdq");
        assert_eq!(temp_filename(42), "000000042.rdt");

        assert_eq!(parse_segment_filename("000000042.rdq"), Some(42));
        assert_eq!(parse_segment_filename("7.rdq"), Some(7));
        assert_eq!(parse_segment_filename("000000042.rdt"), None);
        assert_eq!(parse_segment_filename("abc.rdq"), None);
        assert_eq!(parse_temp_filename("000000042.rdt"), Some(42));
    }

    #[test]
    fn discover_classifies_files() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(segment_path(dir.path(), 0), b"").expect("write");
        std::fs::write(segment_path(dir.path(), 5), b"").expect("write");
        std::fs::write(temp_path(dir.path(), 5), b"").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"").expect("write");

        let (segments, temps) = discover(dir.path()).expect("discover");
        assert_eq!(segments, vec![0, 5]);
        assert_eq!(temps, vec![5]);
    }

    #[test]
    fn create_preallocates_and_appends_from_zero() {
        let dir = TempDir::new().expect("tempdir");
        let mut seg = AppendSegment::create(dir.path(), 0, 4096).expect("create");
        assert_eq!(
            std::fs::metadata(segment_path(dir.path(), 0))
                .expect("metadata")
                .len(),
            4096
        );

        let id = MsgId::from(1u128);
        let (offset, size) = seg.append(&id, b"payload", true).expect("append");
        assert_eq!(offset, 0);
        assert_eq!(size, 16 + 7);
        assert!(seg.is_dirty());

        seg.sync().expect("sync");
        assert!(!seg.is_dirty());
        assert_eq!(seg.last_sync(), size + FRAMING);

        let mut file = open_read(dir.path(), 0).expect("open");
        let rec = record::read_record(&mut file, offset, size).expect("read");
        assert_eq!(rec.payload, b"payload");
        assert!(rec.is_persistent);
    }

    #[test]
    fn truncate_and_extend_repositions() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("000000000.rdq");
        std::fs::write(&path, vec![7u8; 128]).expect("write");

        let file = truncate_and_extend(&path, 64, 256).expect("truncate");
        assert_eq!(file.metadata().expect("metadata").len(), 256);
        let data = std::fs::read(&path).expect("read");
        assert_eq!(&data[..64], &vec![7u8; 64][..]);
        assert_eq!(&data[64..], &vec![0u8; 192][..]);
    }
}
