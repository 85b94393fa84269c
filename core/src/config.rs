use crate::bm25::Bm25Params;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    /// Root that file keys are made relative to.
    pub workspace: PathBuf,
    /// Directory holding the Markdown memory files, relative to `workspace` unless absolute.
    pub memory_dir: PathBuf,
    /// Individual files indexed alongside `memory_dir` (e.g. a top-level MEMORY.md).
    pub extra_files: Vec<PathBuf>,
    /// Where `index.bin`, `meta.json` and `watcher.json` live.
    pub index_dir: PathBuf,
    pub log_level: String,
    /// How long a writer waits for the in-flight update before giving up.
    pub update_wait_ms: u64,
    pub bm25: Bm25Params,
    pub tokenizer: TokenizerConfig,
    pub synonyms: SynonymConfig,
    pub search: SearchConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TokenizerConfig {
    pub min_gram: usize,
    pub max_gram: usize,
    pub min_latin_len: usize,
    pub extra_stopwords: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SynonymConfig {
    /// Start from the built-in table before merging `path`.
    pub builtin: bool,
    /// Optional JSON or TOML file of `key = [equivalents]`.
    pub path: Option<PathBuf>,
    /// Make every mapping bidirectional.
    pub symmetric: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub preview_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Hash content when mtime/size moved, so a bare `touch` is not a change.
    pub verify_hash: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            memory_dir: PathBuf::from("memory"),
            extra_files: vec![PathBuf::from("MEMORY.md")],
            index_dir: PathBuf::from(".memory-index"),
            log_level: "info".into(),
            update_wait_ms: 2_000,
            bm25: Bm25Params::default(),
            tokenizer: TokenizerConfig::default(),
            synonyms: SynonymConfig::default(),
            search: SearchConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self { min_gram: 2, max_gram: 4, min_latin_len: 2, extra_stopwords: Vec::new() }
    }
}

impl Default for SynonymConfig {
    fn default() -> Self {
        Self { builtin: true, path: None, symmetric: false }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { default_top_k: 5, max_top_k: 100, preview_chars: 200 }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 30, verify_hash: true }
    }
}

impl MemoryConfig {
    /// Config rooted at `workspace` with every other setting at its default.
    pub fn for_workspace(workspace: impl Into<PathBuf>) -> Self {
        Self { workspace: workspace.into(), ..Self::default() }
    }

    /// Load from a TOML file when it exists, then apply env overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MemoryConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply MEMDEX_WORKSPACE and MEMDEX_LOG_LEVEL.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MEMDEX_WORKSPACE") {
            self.workspace = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("MEMDEX_LOG_LEVEL") {
            self.log_level = val;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.tokenizer;
        if t.min_gram == 0 || t.min_gram > t.max_gram {
            anyhow::bail!("tokenizer gram widths must satisfy 1 <= min_gram <= max_gram (got {}..={})", t.min_gram, t.max_gram);
        }
        if self.bm25.k1.is_nan() || self.bm25.k1 < 0.0 || !(0.0..=1.0).contains(&self.bm25.b) {
            anyhow::bail!("bm25 parameters out of range: k1 = {}, b = {}", self.bm25.k1, self.bm25.b);
        }
        if self.search.max_top_k == 0 {
            anyhow::bail!("search.max_top_k must be at least 1");
        }
        Ok(())
    }

    pub fn update_wait(&self) -> Duration {
        Duration::from_millis(self.update_wait_ms)
    }

    pub fn layout(&self) -> WorkspaceLayout {
        WorkspaceLayout::new(self)
    }

    /// Synonym file path resolved against the workspace.
    pub fn synonyms_path(&self) -> Option<PathBuf> {
        self.synonyms.path.as_ref().map(|p| resolve(&self.workspace, p))
    }
}

/// Resolved on-disk locations for one workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub workspace: PathBuf,
    pub memory_dir: PathBuf,
    pub extra_files: Vec<PathBuf>,
    pub index_dir: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(config: &MemoryConfig) -> Self {
        let workspace = config.workspace.clone();
        Self {
            memory_dir: resolve(&workspace, &config.memory_dir),
            extra_files: config.extra_files.iter().map(|p| resolve(&workspace, p)).collect(),
            index_dir: resolve(&workspace, &config.index_dir),
            workspace,
        }
    }

    /// Stable key for a file: its path relative to the workspace, with forward slashes.
    pub fn key_for(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.workspace).unwrap_or(path);
        let mut key = String::new();
        for component in rel.components() {
            match component {
                Component::Prefix(prefix) => key.push_str(&prefix.as_os_str().to_string_lossy()),
                Component::RootDir => key.push('/'),
                Component::CurDir => {}
                part => {
                    if !key.is_empty() && !key.ends_with('/') {
                        key.push('/');
                    }
                    key.push_str(&part.as_os_str().to_string_lossy());
                }
            }
        }
        key
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let candidate = Path::new(key);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.workspace.join(candidate)
        }
    }
}

fn resolve(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MemoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bm25.k1, 1.5);
        assert_eq!(config.bm25.b, 0.75);
        assert_eq!(config.tokenizer.min_gram, 2);
        assert_eq!(config.tokenizer.max_gram, 4);
        assert_eq!(config.search.default_top_k, 5);
        assert!(!config.synonyms.symmetric);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
workspace = "/srv/ws"
update_wait_ms = 50

[bm25]
k1 = 1.2

[tokenizer]
max_gram = 3
extra_stopwords = ["todo"]

[synonyms]
symmetric = true
"#;
        let config: MemoryConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workspace, PathBuf::from("/srv/ws"));
        assert_eq!(config.bm25.k1, 1.2);
        // unset fields keep their defaults
        assert_eq!(config.bm25.b, 0.75);
        assert_eq!(config.tokenizer.min_gram, 2);
        assert_eq!(config.tokenizer.max_gram, 3);
        assert!(config.synonyms.symmetric);
        assert_eq!(config.update_wait(), Duration::from_millis(50));
    }

    #[test]
    fn rejects_inverted_gram_range() {
        let mut config = MemoryConfig::default();
        config.tokenizer.min_gram = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn layout_keys_are_workspace_relative() {
        let config = MemoryConfig::for_workspace("/srv/ws");
        let layout = config.layout();
        assert_eq!(layout.memory_dir, PathBuf::from("/srv/ws/memory"));
        assert_eq!(layout.key_for(Path::new("/srv/ws/memory/2024-01-01.md")), "memory/2024-01-01.md");
        assert_eq!(layout.path_for("MEMORY.md"), PathBuf::from("/srv/ws/MEMORY.md"));
    }

    #[test]
    #[cfg(unix)]
    fn outside_files_keep_a_single_leading_slash() {
        let mut config = MemoryConfig::for_workspace("/srv/ws");
        config.extra_files = vec![PathBuf::from("/etc/notes/x.md")];
        let layout = config.layout();
        let key = layout.key_for(&layout.extra_files[0]);
        assert_eq!(key, "/etc/notes/x.md");
        assert_eq!(layout.path_for(&key), PathBuf::from("/etc/notes/x.md"));
    }
}
