use crate::index::{FileKey, FileStamp, IndexSnapshot, SNAPSHOT_VERSION};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = *b"MDX1";

/// Human-readable summary written next to the snapshot.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u32,
    pub file_count: usize,
    pub chunk_count: usize,
    pub term_count: usize,
    pub created_at: String,
    pub updated_at: String,
}

/// Last state the watcher observed, per file.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherState {
    /// Unix milliseconds.
    pub last_check: i64,
    pub files: BTreeMap<FileKey, FileStamp>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 4],
    version: u32,
    checksum: String,
    payload: Vec<u8>,
}

pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn snapshot(&self) -> PathBuf { self.root.join("index.bin") }
    pub fn meta(&self) -> PathBuf { self.root.join("meta.json") }
    pub fn watcher(&self) -> PathBuf { self.root.join("watcher.json") }
}

/// Why a snapshot could not be loaded.
#[derive(Debug)]
pub enum LoadError {
    Missing,
    Corrupt(String),
    Io(std::io::Error),
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Write `bytes` to a sibling temp file, sync it, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().context("target path has no parent directory")?;
    create_dir_all(dir)?;
    let file_name = path.file_name().context("target path has no file name")?.to_string_lossy();
    let tmp = dir.join(format!(".{file_name}.tmp"));
    {
        let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

pub fn save_snapshot(paths: &IndexPaths, snapshot: &IndexSnapshot) -> Result<u64> {
    let payload = bincode::serialize(snapshot)?;
    let envelope = Envelope { magic: MAGIC, version: SNAPSHOT_VERSION, checksum: sha256_hex(&payload), payload };
    let bytes = bincode::serialize(&envelope)?;
    write_atomic(&paths.snapshot(), &bytes)?;
    Ok(bytes.len() as u64)
}

pub fn load_snapshot(paths: &IndexPaths) -> Result<IndexSnapshot, LoadError> {
    let mut f = match File::open(paths.snapshot()) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(LoadError::Missing),
        Err(e) => return Err(LoadError::Io(e)),
    };
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).map_err(LoadError::Io)?;
    decode_snapshot(&buf).map_err(|e| LoadError::Corrupt(format!("{e:#}")))
}

fn decode_snapshot(buf: &[u8]) -> Result<IndexSnapshot> {
    let envelope: Envelope = bincode::deserialize(buf).context("undecodable envelope")?;
    if envelope.magic != MAGIC {
        bail!("bad magic bytes");
    }
    if envelope.version != SNAPSHOT_VERSION {
        bail!("unsupported snapshot version {}", envelope.version);
    }
    if sha256_hex(&envelope.payload) != envelope.checksum {
        bail!("checksum mismatch");
    }
    let snapshot: IndexSnapshot = bincode::deserialize(&envelope.payload).context("undecodable payload")?;
    snapshot.validate().map_err(anyhow::Error::msg)?;
    Ok(snapshot)
}

pub fn snapshot_size(paths: &IndexPaths) -> u64 {
    fs::metadata(paths.snapshot()).map(|m| m.len()).unwrap_or(0)
}

pub fn save_meta(paths: &IndexPaths, meta: &MetaFile) -> Result<()> {
    let json = serde_json::to_string_pretty(meta)?;
    write_atomic(&paths.meta(), json.as_bytes())
}

pub fn save_watcher_state(paths: &IndexPaths, state: &WatcherState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)?;
    write_atomic(&paths.watcher(), json.as_bytes())
}

/// Missing or unreadable state starts the watcher from scratch.
pub fn load_watcher_state(paths: &IndexPaths) -> Option<WatcherState> {
    let raw = fs::read_to_string(paths.watcher()).ok()?;
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(error = %e, "discarding unreadable watcher state");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_survives_save_and_load() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        let snap = IndexSnapshot::new("2024-01-01T00:00:00Z".into());
        let size = save_snapshot(&paths, &snap).unwrap();
        assert_eq!(size, snapshot_size(&paths));
        assert_eq!(load_snapshot(&paths).unwrap(), snap);
        // no temp file left behind
        assert!(!dir.path().join(".index.bin.tmp").exists());
    }

    #[test]
    fn missing_and_corrupt_are_distinguished() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        assert!(matches!(load_snapshot(&paths), Err(LoadError::Missing)));

        fs::write(paths.snapshot(), b"definitely not bincode").unwrap();
        assert!(matches!(load_snapshot(&paths), Err(LoadError::Corrupt(_))));
    }

    #[test]
    fn flipped_payload_byte_fails_checksum() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        save_snapshot(&paths, &IndexSnapshot::new("t".into())).unwrap();
        let mut bytes = fs::read(paths.snapshot()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(paths.snapshot(), &bytes).unwrap();
        match load_snapshot(&paths) {
            Err(LoadError::Corrupt(msg)) => assert!(msg.contains("checksum") || msg.contains("undecodable")),
            other => panic!("expected corrupt snapshot, got {other:?}"),
        }
    }

    #[test]
    fn watcher_state_round_trip() {
        let dir = tempdir().unwrap();
        let paths = IndexPaths::new(dir.path());
        assert!(load_watcher_state(&paths).is_none());
        let mut state = WatcherState { last_check: 42, ..Default::default() };
        state.files.insert("memory/a.md".into(), FileStamp { mtime_ns: 7, size: 3, hash: "abc".into() });
        save_watcher_state(&paths, &state).unwrap();
        assert_eq!(load_watcher_state(&paths), Some(state));
    }
}
