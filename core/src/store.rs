use crate::chunker::chunk_markdown;
use crate::config::{MemoryConfig, WorkspaceLayout};
use crate::error::{MemoryError, MemoryResult};
use crate::index::{chunk_id, ChunkRecord, FileKey, IndexSnapshot};
use crate::persist::{self, IndexPaths, LoadError, MetaFile};
use crate::scan::{self, ChangeKind, ChangeSet, FileChange};
use crate::tokenizer::Tokenizer;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

const MIN_RETRY_AFTER: Duration = Duration::from_millis(100);

/// How the store came up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IndexHealth {
    Ready,
    /// No snapshot on disk yet.
    Missing,
    /// The snapshot was corrupt and has been rebuilt from the memory files.
    Rebuilt { reason: String },
    /// The snapshot is unusable and could not be rebuilt; searches see an empty index.
    Degraded { reason: String },
}

impl IndexHealth {
    pub fn warning(&self) -> Option<String> {
        match self {
            IndexHealth::Ready => None,
            IndexHealth::Missing => Some("index has not been built yet".into()),
            IndexHealth::Rebuilt { reason } => Some(format!("index was rebuilt after corruption: {reason}")),
            IndexHealth::Degraded { reason } => Some(format!("index unavailable: {reason}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateSummary {
    pub files_added: usize,
    pub files_changed: usize,
    pub files_removed: usize,
    /// Unreadable files left out of this pass.
    pub skipped: Vec<FileKey>,
    pub chunks_indexed: usize,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl UpdateSummary {
    pub fn is_noop(&self) -> bool {
        self.files_added == 0 && self.files_changed == 0 && self.files_removed == 0
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub file_count: usize,
    /// Indexed chunks.
    pub document_count: usize,
    pub term_count: usize,
    pub posting_count: usize,
    pub average_chunk_length: f64,
    /// Bytes of the snapshot file.
    pub index_size: u64,
    pub last_update: Option<String>,
}

pub(crate) fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now).format(&Rfc3339).unwrap_or_default()
}

/// Owns the published snapshot and serializes every change to it.
pub struct IndexStore {
    layout: WorkspaceLayout,
    paths: IndexPaths,
    tokenizer: Tokenizer,
    verify_hash: bool,
    update_wait: Duration,
    current: RwLock<Arc<IndexSnapshot>>,
    writer: Mutex<()>,
    /// Snapshots published since the store was created.
    generation: AtomicU64,
}

impl IndexStore {
    /// A store with an empty in-memory snapshot; nothing is read from disk.
    pub fn new(config: &MemoryConfig) -> Self {
        let layout = config.layout();
        Self {
            paths: IndexPaths::new(&layout.index_dir),
            layout,
            tokenizer: Tokenizer::new(&config.tokenizer),
            verify_hash: config.watcher.verify_hash,
            update_wait: config.update_wait(),
            current: RwLock::new(Arc::new(IndexSnapshot::default())),
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Load the persisted snapshot. A corrupt one is rebuilt from the memory files.
    pub fn open(config: &MemoryConfig) -> (Self, IndexHealth) {
        let store = Self::new(config);
        let health = match persist::load_snapshot(&store.paths) {
            Ok(snapshot) => {
                info!(chunks = snapshot.num_chunks(), terms = snapshot.terms.len(), "loaded index snapshot");
                *store.current.write() = Arc::new(snapshot);
                IndexHealth::Ready
            }
            Err(LoadError::Missing) => {
                info!(path = %store.paths.snapshot().display(), "no index snapshot yet");
                IndexHealth::Missing
            }
            Err(LoadError::Corrupt(reason)) => store.recover(MemoryError::IndexCorrupt(reason)),
            Err(LoadError::Io(e)) => store.recover(MemoryError::Io(e)),
        };
        (store, health)
    }

    fn recover(&self, cause: MemoryError) -> IndexHealth {
        warn!(error = %cause, "index snapshot unusable, rebuilding");
        match self.rebuild() {
            Ok(summary) => {
                info!(files = summary.files_added, chunks = summary.chunks_indexed, "index rebuilt");
                IndexHealth::Rebuilt { reason: cause.to_string() }
            }
            Err(e) => {
                error!(error = %e, "index rebuild failed, serving an empty index");
                IndexHealth::Degraded { reason: format!("{cause}; rebuild failed: {e}") }
            }
        }
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    pub fn paths(&self) -> &IndexPaths {
        &self.paths
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn verify_hash(&self) -> bool {
        self.verify_hash
    }

    /// The currently published snapshot. Holders keep it alive across later swaps.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn lock_writer(&self) -> MemoryResult<MutexGuard<'_, ()>> {
        self.writer.try_lock_for(self.update_wait).ok_or(MemoryError::ConcurrentUpdateConflict {
            retry_after: self.update_wait.max(MIN_RETRY_AFTER),
        })
    }

    /// Re-chunk every memory file into a fresh snapshot and publish it.
    pub fn rebuild(&self) -> MemoryResult<UpdateSummary> {
        let _guard = self.lock_writer()?;
        let start = Instant::now();
        let previous = self.snapshot();
        let created_at = if previous.created_at.is_empty() { now_rfc3339() } else { previous.created_at.clone() };
        let mut next = IndexSnapshot::new(created_at);
        let mut summary = UpdateSummary::default();

        for path in scan::discover(&self.layout) {
            let key = self.layout.key_for(&path);
            let (content, stamp) = match scan::read_stamped(&path) {
                Ok(read) => read,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable memory file");
                    summary.skipped.push(key);
                    continue;
                }
            };
            match previous.files.get(&key) {
                None => summary.files_added += 1,
                Some(old) if old.stamp.hash != stamp.hash => summary.files_changed += 1,
                Some(_) => {}
            }
            let chunks = self.build_chunks(&key, &content);
            summary.chunks_indexed += chunks.len();
            next.insert_file(stamp, &key, chunks);
        }
        summary.files_removed = previous
            .files
            .keys()
            .filter(|k| !next.files.contains_key(*k) && !summary.skipped.contains(*k))
            .count();

        next.updated_at = now_rfc3339();
        self.publish(next)?;
        summary.duration = start.elapsed();
        info!(
            added = summary.files_added,
            changed = summary.files_changed,
            removed = summary.files_removed,
            chunks = summary.chunks_indexed,
            "full rebuild complete"
        );
        Ok(summary)
    }

    /// Incremental update against the files on disk, or a full rebuild.
    pub fn update(&self, incremental: bool) -> MemoryResult<UpdateSummary> {
        if !incremental {
            return self.rebuild();
        }
        let guard = self.lock_writer()?;
        let start = Instant::now();
        let current = self.snapshot();
        let changes = scan::detect_changes(&self.layout, &current.file_stamps(), self.verify_hash);
        self.apply_locked(&guard, &current, &changes, start)
    }

    /// Apply a change set computed elsewhere (by the watcher). Each entry is
    /// re-checked against the current snapshot, so stale or repeated sets are harmless.
    pub fn apply_changes(&self, changes: &ChangeSet) -> MemoryResult<UpdateSummary> {
        let guard = self.lock_writer()?;
        let start = Instant::now();
        let current = self.snapshot();
        self.apply_locked(&guard, &current, changes, start)
    }

    fn apply_locked(
        &self,
        _guard: &MutexGuard<'_, ()>,
        current: &IndexSnapshot,
        changes: &ChangeSet,
        start: Instant,
    ) -> MemoryResult<UpdateSummary> {
        let mut next = current.clone();
        let mut dirty = false;
        let mut summary = UpdateSummary { skipped: changes.unreadable.clone(), ..Default::default() };
        for key in &changes.unreadable {
            dirty |= next.remove_file(key).is_some();
        }

        for change in &changes.changes {
            let path = self.layout.path_for(&change.key);
            if change.kind == ChangeKind::Removed {
                if path.exists() {
                    debug!(file = %change.key, "listed as removed but still on disk");
                    continue;
                }
                if let Some(chunks) = next.remove_file(&change.key) {
                    info!(file = %change.key, chunks, "removed deleted memory file");
                    summary.files_removed += 1;
                    dirty = true;
                }
                continue;
            }
            dirty |= self.reindex_file(&mut next, &change.key, &path, &mut summary);
        }

        if dirty {
            next.updated_at = now_rfc3339();
            if next.created_at.is_empty() {
                next.created_at = next.updated_at.clone();
            }
            self.publish(next)?;
        }
        summary.duration = start.elapsed();
        if !summary.is_noop() {
            info!(
                added = summary.files_added,
                changed = summary.files_changed,
                removed = summary.files_removed,
                skipped = summary.skipped.len(),
                "incremental update complete"
            );
        }
        Ok(summary)
    }

    /// Bring one file of `next` up to date with the disk. Returns whether `next` changed.
    fn reindex_file(&self, next: &mut IndexSnapshot, key: &str, path: &Path, summary: &mut UpdateSummary) -> bool {
        let (content, stamp) = match scan::read_stamped(path) {
            Ok(read) => read,
            Err(MemoryError::FileUnreadable { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                let removed = next.remove_file(key).is_some();
                if removed {
                    summary.files_removed += 1;
                }
                return removed;
            }
            Err(e) => {
                // Same outcome as a rebuild: the file is skipped and its old chunks go.
                warn!(error = %e, "skipping unreadable memory file");
                summary.skipped.push(key.to_string());
                return next.remove_file(key).is_some();
            }
        };
        let previous_hash = next.files.get(key).map(|f| f.stamp.hash.clone());
        match previous_hash {
            Some(hash) if hash == stamp.hash => next.refresh_stamp(key, stamp),
            previous => {
                let chunks = self.build_chunks(key, &content);
                debug!(file = %key, chunks = chunks.len(), "indexed memory file");
                summary.chunks_indexed += chunks.len();
                if previous.is_some() {
                    summary.files_changed += 1;
                } else {
                    summary.files_added += 1;
                }
                next.insert_file(stamp, key, chunks);
                true
            }
        }
    }

    fn build_chunks(&self, key: &str, content: &str) -> Vec<ChunkRecord> {
        chunk_markdown(content)
            .into_iter()
            .map(|raw| {
                let terms = self.tokenizer.term_frequencies(&raw.text);
                let token_count = terms.values().sum();
                let mut hash = persist::sha256_hex(raw.text.as_bytes());
                hash.truncate(16);
                ChunkRecord {
                    id: chunk_id(key, raw.ordinal),
                    file: key.to_string(),
                    ordinal: raw.ordinal,
                    heading_path: raw.heading_path,
                    text: raw.text,
                    start_line: raw.start_line,
                    end_line: raw.end_line,
                    token_count,
                    hash,
                    terms,
                }
            })
            .collect()
    }

    /// Persist `next`, then make it the published snapshot. A failed write
    /// leaves the previous snapshot in place.
    fn publish(&self, next: IndexSnapshot) -> MemoryResult<()> {
        persist::save_snapshot(&self.paths, &next).map_err(MemoryError::Persist)?;
        let meta = MetaFile {
            version: next.version,
            file_count: next.files.len(),
            chunk_count: next.num_chunks(),
            term_count: next.terms.len(),
            created_at: next.created_at.clone(),
            updated_at: next.updated_at.clone(),
        };
        if let Err(e) = persist::save_meta(&self.paths, &meta) {
            warn!(error = %e, "failed to write index meta");
        }
        *self.current.write() = Arc::new(next);
        self.generation.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Files that differ from the published snapshot. Mutates nothing.
    pub fn check(&self) -> Vec<FileChange> {
        let current = self.snapshot();
        let changes = scan::detect_changes(&self.layout, &current.file_stamps(), true);
        changes.content_changes().cloned().collect()
    }

    pub fn stats(&self) -> IndexStats {
        let snap = self.snapshot();
        IndexStats {
            file_count: snap.files.len(),
            document_count: snap.num_chunks(),
            term_count: snap.terms.len(),
            posting_count: snap.posting_count(),
            average_chunk_length: snap.avg_chunk_len(),
            index_size: persist::snapshot_size(&self.paths),
            last_update: Some(snap.updated_at.clone()).filter(|s| !s.is_empty()),
        }
    }

    /// Keys of every indexed file.
    pub fn indexed_files(&self) -> BTreeSet<FileKey> {
        self.snapshot().files.keys().cloned().collect()
    }
}
