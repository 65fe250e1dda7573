use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index error: {0}")]
    Index(#[from] sled::Error),
    #[error("corrupt metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("message id already present")]
    DuplicateId,
    #[error("sync failed: {0}")]
    SyncFailed(String),
    #[error("store is stopped")]
    Stopped,
}

impl Error {
    /// Errors the coordinator cannot continue from. Record-level
    /// corruption is not among them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Index(_) | Error::SyncFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
