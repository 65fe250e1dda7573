//! Store configuration and the persisted meta file.
//!
//! Most settings are per-process, but record placement depends on the
//! segment cap, so the cap is recorded in `depot.meta.json` inside the
//! store directory and re-opening with a conflicting cap is refused.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::DEFAULT_CACHE_BYTES;
use crate::handles::DEFAULT_HANDLE_CACHE;
use crate::msg_index::IndexMode;
use crate::segment::DEFAULT_SEGMENT_CAP;
use crate::{Error, Result};

pub const META_FILE: &str = "depot.meta.json";
pub const META_VERSION: u32 = 1;

const MIN_SEGMENT_CAP: u64 = 128;

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub dir: PathBuf,
    /// Soft size cap per segment file.
    pub segment_cap: u64,
    /// Group-commit interval.
    pub sync_interval: Duration,
    /// Interval between memory reports.
    pub report_interval: Duration,
    /// Cap on open read descriptors.
    pub handle_cache_size: usize,
    /// Payload cache budget in bytes.
    pub message_cache_bytes: usize,
    /// Initial location-index backend.
    pub index_mode: IndexMode,
    /// Queues whose rows survive a restart. Queues outside this set are
    /// removed entirely during recovery.
    pub durable_queues: HashSet<String>,
}

impl StoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_cap: DEFAULT_SEGMENT_CAP,
            sync_interval: Duration::from_millis(5),
            report_interval: Duration::from_secs(1),
            handle_cache_size: DEFAULT_HANDLE_CACHE,
            message_cache_bytes: DEFAULT_CACHE_BYTES,
            index_mode: IndexMode::Ram,
            durable_queues: HashSet::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_cap < MIN_SEGMENT_CAP {
            return Err(Error::Unsupported("segment cap too small"));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::Unsupported("sync interval must be nonzero"));
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub version: u32,
    pub segment_cap: u64,
}

/// Load the meta file, writing it first if the directory is fresh.
/// A recorded segment cap that differs from the configured one is an
/// error since existing record placement depends on it.
pub fn load_or_init_meta(dir: &Path, segment_cap: u64) -> Result<StoreMeta> {
    let path = dir.join(META_FILE);
    if path.exists() {
        let data = std::fs::read(&path)?;
        let meta: StoreMeta = serde_json::from_slice(&data)?;
        if meta.version != META_VERSION {
            return Err(Error::Unsupported("unknown store meta version"));
        }
        if meta.segment_cap != segment_cap {
            return Err(Error::Unsupported("segment cap differs from store meta"));
        }
        return Ok(meta);
    }

    let meta = StoreMeta {
        version: META_VERSION,
        segment_cap,
    };
    write_meta(&path, &meta)?;
    Ok(meta)
}

fn write_meta(path: &Path, meta: &StoreMeta) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(meta)?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
