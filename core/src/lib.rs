//! Local BM25 retrieval over Markdown memory files.

pub mod bm25;
pub mod chunker;
pub mod config;
pub mod error;
pub mod index;
pub mod persist;
pub mod scan;
pub mod service;
pub mod store;
pub mod synonyms;
pub mod tokenizer;
pub mod watcher;

pub use bm25::{Bm25Params, Bm25Scorer};
pub use config::MemoryConfig;
pub use error::{MemoryError, MemoryResult};
pub use index::{ChunkId, ChunkRecord, FileKey, FileStamp, IndexSnapshot};
pub use scan::{ChangeKind, FileChange};
pub use service::{HealthReport, MemoryService, SearchHit};
pub use store::{IndexHealth, IndexStats, IndexStore, UpdateSummary};
pub use synonyms::{SynonymExpander, SynonymTable};
pub use watcher::{WatcherHandle, WatcherPhase, WatcherStatus};
