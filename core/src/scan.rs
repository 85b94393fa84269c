//! Discovery of memory files and detection of what changed since a known state.

use crate::config::WorkspaceLayout;
use crate::error::MemoryError;
use crate::index::{FileKey, FileStamp};
use crate::persist::sha256_hex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
    /// Timestamp moved but the content hash did not.
    Touched,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub key: FileKey,
    pub kind: ChangeKind,
    /// Stamp observed on disk; `None` for removals.
    #[serde(skip)]
    pub stamp: Option<FileStamp>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changes: Vec<FileChange>,
    pub unreadable: Vec<FileKey>,
}

impl ChangeSet {
    /// Added, modified and removed files; touches are left out.
    pub fn content_changes(&self) -> impl Iterator<Item = &FileChange> {
        self.changes.iter().filter(|c| c.kind != ChangeKind::Touched)
    }

    pub fn has_content_changes(&self) -> bool {
        self.content_changes().next().is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

fn is_markdown(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("md" | "markdown"))
}

/// Every memory file of the workspace, sorted and de-duplicated.
pub fn discover(layout: &WorkspaceLayout) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    if layout.memory_dir.is_dir() {
        for entry in WalkDir::new(&layout.memory_dir).follow_links(true).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() && is_markdown(entry.path()) => {
                    found.insert(entry.into_path());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping unreadable directory entry"),
            }
        }
    } else {
        debug!(dir = %layout.memory_dir.display(), "memory directory does not exist");
    }
    for extra in &layout.extra_files {
        if extra.is_file() {
            found.insert(extra.clone());
        }
    }
    found.into_iter().collect()
}

/// (mtime in ns, size) of a file.
pub fn stat(path: &Path) -> std::io::Result<(u64, u64)> {
    let meta = std::fs::metadata(path)?;
    let mtime_ns = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    Ok((mtime_ns, meta.len()))
}

/// Read a file as UTF-8 and stamp it with its mtime, size and content hash.
pub fn read_stamped(path: &Path) -> Result<(String, FileStamp), MemoryError> {
    let unreadable = |source| MemoryError::FileUnreadable { path: path.to_path_buf(), source };
    let (mtime_ns, size) = stat(path).map_err(unreadable)?;
    let bytes = std::fs::read(path).map_err(unreadable)?;
    let hash = sha256_hex(&bytes);
    let content = String::from_utf8(bytes)
        .map_err(|e| unreadable(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Ok((content, FileStamp { mtime_ns, size, hash }))
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    Ok(sha256_hex(&std::fs::read(path)?))
}

/// Compare the files on disk against `known`. With `verify_hash`, a file whose
/// mtime or size moved is hashed and reported as [`ChangeKind::Touched`] when the
/// content is the same.
pub fn detect_changes(layout: &WorkspaceLayout, known: &BTreeMap<FileKey, FileStamp>, verify_hash: bool) -> ChangeSet {
    let mut set = ChangeSet::default();
    let mut seen = BTreeSet::new();

    for path in discover(layout) {
        let key = layout.key_for(&path);
        seen.insert(key.clone());
        let (mtime_ns, size) = match stat(&path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot stat memory file");
                set.unreadable.push(key);
                continue;
            }
        };
        let previous = known.get(&key);
        if let Some(prev) = previous {
            if prev.mtime_ns == mtime_ns && prev.size == size {
                continue;
            }
        }
        let hash = if verify_hash {
            match hash_file(&path) {
                Ok(h) => h,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot hash memory file");
                    set.unreadable.push(key);
                    continue;
                }
            }
        } else {
            String::new()
        };
        let kind = match previous {
            None => ChangeKind::Added,
            Some(prev) if verify_hash && prev.hash == hash => ChangeKind::Touched,
            Some(_) => ChangeKind::Modified,
        };
        set.changes.push(FileChange { key, kind, stamp: Some(FileStamp { mtime_ns, size, hash }) });
    }

    for key in known.keys() {
        if !seen.contains(key) {
            set.changes.push(FileChange { key: key.clone(), kind: ChangeKind::Removed, stamp: None });
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovers_markdown_and_extra_files() {
        let dir = tempdir().unwrap();
        let layout = MemoryConfig::for_workspace(dir.path()).layout();
        fs::create_dir_all(layout.memory_dir.join("nested")).unwrap();
        fs::write(layout.memory_dir.join("a.md"), "a").unwrap();
        fs::write(layout.memory_dir.join("nested/b.markdown"), "b").unwrap();
        fs::write(layout.memory_dir.join("notes.txt"), "skip").unwrap();
        fs::write(dir.path().join("MEMORY.md"), "root").unwrap();

        let keys: Vec<String> = discover(&layout).iter().map(|p| layout.key_for(p)).collect();
        assert_eq!(keys, vec!["MEMORY.md", "memory/a.md", "memory/nested/b.markdown"]);
    }

    #[test]
    fn classifies_added_modified_removed_and_touched() {
        let dir = tempdir().unwrap();
        let layout = MemoryConfig::for_workspace(dir.path()).layout();
        fs::create_dir_all(&layout.memory_dir).unwrap();
        let same = layout.memory_dir.join("same.md");
        let edited = layout.memory_dir.join("edited.md");
        let fresh = layout.memory_dir.join("fresh.md");
        fs::write(&same, "unchanged").unwrap();
        fs::write(&edited, "after edit").unwrap();
        fs::write(&fresh, "new").unwrap();

        let mut known = BTreeMap::new();
        let (_, same_stamp) = read_stamped(&same).unwrap();
        // pretend an older mtime: content is identical, so only a touch
        known.insert("memory/same.md".to_string(), FileStamp { mtime_ns: 1, ..same_stamp });
        known.insert("memory/edited.md".to_string(), FileStamp { mtime_ns: 1, size: 3, hash: "old".into() });
        known.insert("memory/gone.md".to_string(), FileStamp { mtime_ns: 1, size: 1, hash: "x".into() });

        let set = detect_changes(&layout, &known, true);
        let kinds: BTreeMap<&str, ChangeKind> = set.changes.iter().map(|c| (c.key.as_str(), c.kind)).collect();
        assert_eq!(kinds["memory/same.md"], ChangeKind::Touched);
        assert_eq!(kinds["memory/edited.md"], ChangeKind::Modified);
        assert_eq!(kinds["memory/fresh.md"], ChangeKind::Added);
        assert_eq!(kinds["memory/gone.md"], ChangeKind::Removed);
        assert_eq!(set.content_changes().count(), 3);
    }

    #[test]
    fn unchanged_stamp_is_not_reported() {
        let dir = tempdir().unwrap();
        let layout = MemoryConfig::for_workspace(dir.path()).layout();
        fs::create_dir_all(&layout.memory_dir).unwrap();
        let path = layout.memory_dir.join("a.md");
        fs::write(&path, "hello").unwrap();
        let (_, stamp) = read_stamped(&path).unwrap();
        let known = BTreeMap::from([("memory/a.md".to_string(), stamp)]);
        assert!(detect_changes(&layout, &known, true).is_empty());
    }
}
