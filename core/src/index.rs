use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ChunkId = String;
pub type FileKey = String;

pub const SNAPSHOT_VERSION: u32 = 1;

/// What the scanner knows about a file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub mtime_ns: u64,
    pub size: u64,
    /// SHA-256 hex of the content; empty when not hashed yet.
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub key: FileKey,
    pub stamp: FileStamp,
    pub chunk_ids: Vec<ChunkId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub file: FileKey,
    pub ordinal: usize,
    pub heading_path: Vec<String>,
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
    pub token_count: u32,
    /// First 16 hex chars of the text's SHA-256.
    pub hash: String,
    pub terms: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TermEntry {
    pub postings: BTreeMap<ChunkId, u32>,
}

impl TermEntry {
    pub fn df(&self) -> usize { self.postings.len() }
}

/// Immutable-once-published index: files, chunks and the inverted index over them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub version: u32,
    pub created_at: String,
    pub updated_at: String,
    pub files: BTreeMap<FileKey, FileRecord>,
    pub chunks: BTreeMap<ChunkId, ChunkRecord>,
    pub terms: BTreeMap<String, TermEntry>,
    pub total_tokens: u64,
}

impl Default for IndexSnapshot {
    fn default() -> Self { Self::new(String::new()) }
}

pub fn chunk_id(file: &str, ordinal: usize) -> ChunkId {
    format!("{file}#{ordinal}")
}

impl IndexSnapshot {
    pub fn new(created_at: String) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            updated_at: created_at.clone(),
            created_at,
            files: BTreeMap::new(),
            chunks: BTreeMap::new(),
            terms: BTreeMap::new(),
            total_tokens: 0,
        }
    }

    pub fn num_chunks(&self) -> usize { self.chunks.len() }

    pub fn avg_chunk_len(&self) -> f64 {
        if self.chunks.is_empty() {
            0.0
        } else {
            self.total_tokens as f64 / self.chunks.len() as f64
        }
    }

    pub fn df(&self, term: &str) -> usize {
        self.terms.get(term).map(TermEntry::df).unwrap_or(0)
    }

    pub fn posting_count(&self) -> usize {
        self.terms.values().map(TermEntry::df).sum()
    }

    pub fn file_stamps(&self) -> BTreeMap<FileKey, FileStamp> {
        self.files.iter().map(|(k, f)| (k.clone(), f.stamp.clone())).collect()
    }

    /// Insert a file and its chunks, replacing any previous version of it.
    pub fn insert_file(&mut self, stamp: FileStamp, key: &str, chunks: Vec<ChunkRecord>) {
        self.remove_file(key);
        let mut chunk_ids = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            for (term, tf) in &chunk.terms {
                self.terms.entry(term.clone()).or_default().postings.insert(chunk.id.clone(), *tf);
            }
            self.total_tokens += chunk.token_count as u64;
            chunk_ids.push(chunk.id.clone());
            self.chunks.insert(chunk.id.clone(), chunk);
        }
        self.files.insert(key.to_string(), FileRecord { key: key.to_string(), stamp, chunk_ids });
    }

    /// Remove a file, its chunks and their postings. Terms left without postings go too.
    /// Returns the number of chunks removed, or `None` if the file was not indexed.
    pub fn remove_file(&mut self, key: &str) -> Option<usize> {
        let record = self.files.remove(key)?;
        for id in &record.chunk_ids {
            let Some(chunk) = self.chunks.remove(id) else { continue };
            self.total_tokens -= chunk.token_count as u64;
            for term in chunk.terms.keys() {
                if let Some(entry) = self.terms.get_mut(term) {
                    entry.postings.remove(id);
                    if entry.postings.is_empty() {
                        self.terms.remove(term);
                    }
                }
            }
        }
        Some(record.chunk_ids.len())
    }

    /// Update the stored stamp of an indexed file without touching its chunks.
    pub fn refresh_stamp(&mut self, key: &str, stamp: FileStamp) -> bool {
        match self.files.get_mut(key) {
            Some(record) if record.stamp != stamp => {
                record.stamp = stamp;
                true
            }
            _ => false,
        }
    }

    /// Check the structural invariants a loaded snapshot must satisfy.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != SNAPSHOT_VERSION {
            return Err(format!("unsupported snapshot version {}", self.version));
        }
        let mut tokens = 0u64;
        let mut postings = 0usize;
        for (key, file) in &self.files {
            if &file.key != key {
                return Err(format!("file record {key} carries key {}", file.key));
            }
            for id in &file.chunk_ids {
                match self.chunks.get(id) {
                    Some(chunk) if &chunk.file == key => {}
                    _ => return Err(format!("file {key} lists missing chunk {id}")),
                }
            }
        }
        for (id, chunk) in &self.chunks {
            if !self.files.get(&chunk.file).is_some_and(|f| f.chunk_ids.contains(id)) {
                return Err(format!("chunk {id} has no owning file"));
            }
            tokens += chunk.token_count as u64;
            for (term, tf) in &chunk.terms {
                if self.terms.get(term).and_then(|e| e.postings.get(id)) != Some(tf) {
                    return Err(format!("chunk {id} term {term:?} missing from postings"));
                }
            }
            postings += chunk.terms.len();
        }
        for (term, entry) in &self.terms {
            if entry.postings.is_empty() {
                return Err(format!("term {term:?} has no postings"));
            }
            if entry.postings.keys().any(|id| !self.chunks.contains_key(id)) {
                return Err(format!("term {term:?} references a missing chunk"));
            }
        }
        if postings != self.posting_count() {
            return Err("posting count does not match chunk term vectors".into());
        }
        if tokens != self.total_tokens {
            return Err(format!("total_tokens {} does not match chunks ({tokens})", self.total_tokens));
        }
        Ok(())
    }
}
