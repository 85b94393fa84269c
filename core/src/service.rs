//! The facade the CLI and HTTP server talk to.

use crate::bm25::Bm25Scorer;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::index::{ChunkRecord, FileKey};
use crate::scan::FileChange;
use crate::store::{IndexHealth, IndexStats, IndexStore, UpdateSummary};
use crate::synonyms::{SynonymExpander, SynonymTable};
use crate::watcher::{spawn_watcher, WatcherHandle};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub file: FileKey,
    pub heading_path: Vec<String>,
    pub start_line: usize,
    pub end_line: usize,
    pub excerpt: String,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub index: IndexHealth,
    pub document_count: usize,
    pub warning: Option<String>,
}

pub struct MemoryService {
    config: MemoryConfig,
    store: Arc<IndexStore>,
    expander: SynonymExpander,
    scorer: Bm25Scorer,
    health: RwLock<IndexHealth>,
    /// Store generation right after open; anything newer was published by an update.
    opened_at: u64,
}

impl MemoryService {
    /// Validate the config, build the synonym table and open the store.
    pub fn open(config: MemoryConfig) -> MemoryResult<Self> {
        config.validate().map_err(|e| MemoryError::Config(format!("{e:#}")))?;
        let table = load_synonyms(&config)?;
        let (store, health) = IndexStore::open(&config);
        info!(
            workspace = %config.workspace.display(),
            synonyms = table.len(),
            index = ?health,
            "memory service ready"
        );
        let opened_at = store.generation();
        Ok(Self {
            scorer: Bm25Scorer::new(config.bm25),
            expander: SynonymExpander::new(table, store.tokenizer().clone()),
            store: Arc::new(store),
            health: RwLock::new(health),
            opened_at,
            config,
        })
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// Rank chunks for `query`. A blank query, or one without a single
    /// searchable term, is rejected; `top_k == 0` yields nothing.
    pub fn search(&self, query: &str, top_k: usize) -> MemoryResult<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(MemoryError::InvalidQuery("query is empty".into()));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let terms = self.store.tokenizer().tokenize(query);
        if terms.is_empty() {
            return Err(MemoryError::InvalidQuery(format!("no searchable terms in {query:?}")));
        }
        let expanded = self.expander.expand_all(&terms);
        if let Some(warning) = self.index_health().warning() {
            warn!(%warning, "searching an index that is not ready");
        }

        let snapshot = self.store.snapshot();
        let top_k = top_k.min(self.config.search.max_top_k);
        let ranked = self.scorer.rank(&snapshot, &expanded, top_k);
        debug!(query, terms = expanded.len(), hits = ranked.len(), "search");

        let hits = ranked
            .into_iter()
            .filter_map(|scored| {
                let chunk = snapshot.chunks.get(&scored.chunk_id)?;
                Some(SearchHit {
                    chunk_id: scored.chunk_id,
                    file: chunk.file.clone(),
                    heading_path: chunk.heading_path.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    excerpt: excerpt(chunk, self.config.search.preview_chars),
                    score: scored.score,
                    matched_terms: scored.matched_terms,
                })
            })
            .collect();
        Ok(hits)
    }

    pub fn update(&self, incremental: bool) -> MemoryResult<UpdateSummary> {
        let summary = self.store.update(incremental)?;
        self.mark_ready();
        Ok(summary)
    }

    pub fn rebuild(&self) -> MemoryResult<UpdateSummary> {
        self.update(false)
    }

    pub fn stats(&self) -> IndexStats {
        self.store.stats()
    }

    pub fn check(&self) -> Vec<FileChange> {
        self.store.check()
    }

    pub fn health(&self) -> HealthReport {
        let index = self.index_health();
        let warning = index.warning();
        HealthReport {
            status: if matches!(index, IndexHealth::Degraded { .. }) { "degraded" } else { "ok" },
            document_count: self.store.snapshot().num_chunks(),
            index,
            warning,
        }
    }

    /// Re-read the synonym configuration and swap the table in. Returns the entry count.
    pub fn reload_synonyms(&self) -> MemoryResult<usize> {
        let table = load_synonyms(&self.config)?;
        let len = table.len();
        self.expander.reload(table);
        info!(entries = len, "synonyms reloaded");
        Ok(len)
    }

    pub fn expander(&self) -> &SynonymExpander {
        &self.expander
    }

    /// Start the background watcher for this service's store.
    pub fn spawn_watcher(&self) -> WatcherHandle {
        spawn_watcher(self.store.clone(), &self.config.watcher)
    }

    fn mark_ready(&self) {
        let mut health = self.health.write();
        if *health != IndexHealth::Ready {
            *health = IndexHealth::Ready;
        }
    }

    /// Health as opened, until a snapshot is published from any path (CLI,
    /// HTTP or the watcher); the index is ready from then on.
    fn index_health(&self) -> IndexHealth {
        if self.store.generation() > self.opened_at {
            self.mark_ready();
        }
        self.health.read().clone()
    }
}

fn load_synonyms(config: &MemoryConfig) -> MemoryResult<SynonymTable> {
    let path = config.synonyms_path();
    SynonymTable::from_config(&config.synonyms, path.as_deref()).map_err(|e| MemoryError::Config(format!("{e:#}")))
}

fn excerpt(chunk: &ChunkRecord, max_chars: usize) -> String {
    let mut chars = chunk.text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
