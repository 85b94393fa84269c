use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("cannot read {}: {source}", path.display())]
    FileUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("index snapshot is corrupt: {0}")]
    IndexCorrupt(String),

    #[error("another index update is in flight, retry in {}ms", retry_after.as_millis())]
    ConcurrentUpdateConflict { retry_after: Duration },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence error: {0:#}")]
    Persist(anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    /// Short machine-readable kind, used by the HTTP and CLI layers.
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryError::InvalidQuery(_) => "invalid_query",
            MemoryError::FileUnreadable { .. } => "file_unreadable",
            MemoryError::IndexCorrupt(_) => "index_corrupt",
            MemoryError::ConcurrentUpdateConflict { .. } => "update_conflict",
            MemoryError::Config(_) => "config",
            MemoryError::Persist(_) => "persist",
            MemoryError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_carries_retry_hint() {
        let err = MemoryError::ConcurrentUpdateConflict { retry_after: Duration::from_millis(250) };
        assert_eq!(err.kind(), "update_conflict");
        assert!(err.to_string().contains("250ms"));
    }
}
