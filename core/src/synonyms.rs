//! Query-time synonym expansion.
//!
//! A [`SynonymTable`] is immutable once built. The [`SynonymExpander`] compiles it
//! with the index tokenizer, holds the result behind an `Arc` and swaps in a new
//! one on [`SynonymExpander::reload`]. Phrase keys and values therefore match the
//! words and CJK n-grams the index is built from; stop-words in them are dropped.
//! Mappings are directional: `a -> [b]` expands `a` to `b` but not `b` to `a`,
//! unless the table was built with [`SynonymTable::into_symmetric`].

use crate::config::SynonymConfig;
use crate::tokenizer::{normalize, Tokenizer};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const BUILTIN: &[(&str, &[&str])] = &[
    ("小蝎子", &["用户", "主人", "朋友"]),
    ("用户", &["小蝎子", "主人", "朋友"]),
    ("小飞棍", &["我", "助手", "AI", "ai"]),
    ("我", &["小飞棍", "助手"]),
    ("记忆", &["记录", "日志", "笔记"]),
    ("记录", &["记忆", "日志"]),
    ("文件", &["文档", "资料"]),
    ("文档", &["文件", "资料"]),
    ("user", &["human", "person", "friend"]),
    ("ai", &["assistant", "bot", "agent"]),
    ("memory", &["record", "log", "note"]),
    ("file", &["document", "doc"]),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynonymTable {
    entries: BTreeMap<String, Vec<String>>,
}

impl SynonymTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (key, values) in BUILTIN {
            table.insert(key, values.iter().copied());
        }
        table
    }

    /// Build from a JSON (`.json`) or TOML (anything else) file of `key = [values]`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read synonym file {}", path.display()))?;
        let map: BTreeMap<String, Vec<String>> = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&raw).context("failed to parse synonym JSON")?
        } else {
            toml::from_str(&raw).context("failed to parse synonym TOML")?
        };
        let mut table = Self::empty();
        for (key, values) in map {
            table.insert(&key, values.iter().map(String::as_str));
        }
        Ok(table)
    }

    /// Assemble the table described by `config`.
    pub fn from_config(config: &SynonymConfig, path: Option<&Path>) -> Result<Self> {
        let mut table = if config.builtin { Self::builtin() } else { Self::empty() };
        if let Some(path) = path {
            table.merge(Self::load(path)?);
        }
        if config.symmetric {
            table = table.into_symmetric();
        }
        Ok(table)
    }

    /// Add equivalents for `key`, keeping first-seen order and dropping duplicates.
    pub fn insert<'a>(&mut self, key: &str, values: impl IntoIterator<Item = &'a str>) {
        let key = normalize(key.trim());
        if key.is_empty() {
            return;
        }
        let entry = self.entries.entry(key.clone()).or_default();
        for value in values {
            let value = normalize(value.trim());
            if !value.is_empty() && value != key && !entry.contains(&value) {
                entry.push(value);
            }
        }
    }

    pub fn merge(&mut self, other: SynonymTable) {
        for (key, values) in other.entries {
            self.insert(&key, values.iter().map(String::as_str));
        }
    }

    /// Add the reverse of every mapping.
    pub fn into_symmetric(self) -> Self {
        let mut out = self.clone();
        for (key, values) in &self.entries {
            for value in values {
                out.insert(value, [key.as_str()]);
            }
        }
        out
    }

    pub fn lookup(&self, term: &str) -> &[String] {
        self.entries.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One table entry rewritten into index terms.
#[derive(Debug, Clone)]
struct Rule {
    /// Terms of the key; all must be in the query for the rule to fire.
    key_terms: BTreeSet<String>,
    terms: Vec<String>,
}

/// A [`SynonymTable`] passed through the tokenizer, so every key and
/// equivalent is expressed in the same terms the index holds.
#[derive(Debug, Clone, Default)]
pub struct CompiledSynonyms {
    table: Arc<SynonymTable>,
    rules: Vec<Rule>,
}

impl CompiledSynonyms {
    pub fn compile(table: SynonymTable, tokenizer: &Tokenizer) -> Self {
        let mut rules = Vec::with_capacity(table.len());
        for (key, values) in &table.entries {
            let key_terms: BTreeSet<String> = tokenizer.tokenize(key).into_iter().collect();
            if key_terms.is_empty() {
                debug!(key = %key, "synonym key has no searchable terms, ignored");
                continue;
            }
            let mut terms = Vec::new();
            for value in values {
                let value_terms = tokenizer.tokenize(value);
                if value_terms.is_empty() {
                    debug!(key = %key, value = %value, "synonym has no searchable terms, ignored");
                }
                for term in value_terms {
                    if !key_terms.contains(&term) && !terms.contains(&term) {
                        terms.push(term);
                    }
                }
            }
            if !terms.is_empty() {
                rules.push(Rule { key_terms, terms });
            }
        }
        Self { table: Arc::new(table), rules }
    }

    pub fn table(&self) -> &Arc<SynonymTable> {
        &self.table
    }

    /// Number of entries that expand to at least one index term.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// `terms` plus the equivalents of every key fully contained in them.
    pub fn expand_terms(&self, terms: &BTreeSet<String>) -> BTreeSet<String> {
        let mut out = terms.clone();
        for rule in &self.rules {
            if rule.key_terms.is_subset(terms) {
                out.extend(rule.terms.iter().cloned());
            }
        }
        out
    }
}

pub struct SynonymExpander {
    tokenizer: Tokenizer,
    compiled: RwLock<Arc<CompiledSynonyms>>,
}

impl SynonymExpander {
    pub fn new(table: SynonymTable, tokenizer: Tokenizer) -> Self {
        let compiled = CompiledSynonyms::compile(table, &tokenizer);
        Self { tokenizer, compiled: RwLock::new(Arc::new(compiled)) }
    }

    pub fn table(&self) -> Arc<SynonymTable> {
        self.compiled.read().table().clone()
    }

    pub fn compiled(&self) -> Arc<CompiledSynonyms> {
        self.compiled.read().clone()
    }

    /// Terms of `text` plus their mapped equivalents.
    pub fn expand(&self, text: &str) -> BTreeSet<String> {
        self.expand_all(&self.tokenizer.tokenize(text))
    }

    pub fn expand_all<'a>(&self, terms: impl IntoIterator<Item = &'a String>) -> BTreeSet<String> {
        let terms: BTreeSet<String> = terms.into_iter().cloned().collect();
        self.compiled().expand_terms(&terms)
    }

    /// Replace the table; searches already holding the old one finish with it.
    pub fn reload(&self, table: SynonymTable) {
        let compiled = CompiledSynonyms::compile(table, &self.tokenizer);
        *self.compiled.write() = Arc::new(compiled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_is_directional() {
        let mut table = SynonymTable::empty();
        table.insert("cat", ["feline"]);
        let expander = SynonymExpander::new(table, Tokenizer::default());
        assert_eq!(expander.expand("cat"), BTreeSet::from(["cat".to_string(), "feline".to_string()]));
        assert_eq!(expander.expand("feline"), BTreeSet::from(["feline".to_string()]));
    }

    #[test]
    fn symmetric_table_adds_reverse_edges() {
        let mut table = SynonymTable::empty();
        table.insert("cat", ["feline"]);
        let table = table.into_symmetric();
        assert_eq!(table.lookup("feline"), ["cat".to_string()]);
    }

    #[test]
    fn builtin_values_are_normalized() {
        let table = SynonymTable::builtin();
        // "AI" and "ai" collapse to one entry
        assert_eq!(table.lookup("小飞棍"), ["我".to_string(), "助手".to_string(), "ai".to_string()]);
        assert!(table.lookup("小蝎子").contains(&"用户".to_string()));
    }

    #[test]
    fn reload_swaps_table() {
        let expander = SynonymExpander::new(SynonymTable::empty(), Tokenizer::default());
        assert_eq!(expander.expand("dog").len(), 1);
        let mut table = SynonymTable::empty();
        table.insert("dog", ["hound"]);
        expander.reload(table);
        assert!(expander.expand("dog").contains("hound"));
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synonyms.toml");
        std::fs::write(&path, "Rust = [\"rustlang\", \"ferris\"]\n").unwrap();
        let table = SynonymTable::load(&path).unwrap();
        assert_eq!(table.lookup("rust"), ["rustlang".to_string(), "ferris".to_string()]);
    }

    fn terms(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn phrase_values_expand_to_their_terms() {
        let mut table = SynonymTable::empty();
        table.insert("ml", ["machine learning"]);
        let expander = SynonymExpander::new(table, Tokenizer::default());
        assert_eq!(expander.expand("ml"), terms(&["learning", "machine", "ml"]));
    }

    #[test]
    fn long_cjk_values_become_ngrams() {
        let mut table = SynonymTable::empty();
        table.insert("ai", ["人工智能助手"]);
        let expanded = SynonymExpander::new(table, Tokenizer::default()).expand("ai");
        assert!(expanded.contains("人工智能"));
        assert!(expanded.contains("助手"));
        assert!(!expanded.contains("人工智能助手"));
    }

    #[test]
    fn stopword_values_are_dropped() {
        let expander = SynonymExpander::new(SynonymTable::builtin(), Tokenizer::default());
        let out = expander.expand("小飞棍");
        assert!(!out.contains("我"));
        assert!(out.contains("助手"));
        let compiled = expander.compiled();
        // a key that is only a stop-word can never fire
        assert!(compiled.rule_count() < SynonymTable::builtin().len());
    }

    #[test]
    fn phrase_key_needs_all_its_terms() {
        let mut table = SynonymTable::empty();
        table.insert("machine learning", ["ml"]);
        let expander = SynonymExpander::new(table, Tokenizer::default());
        assert!(expander.expand("machine learning basics").contains("ml"));
        assert!(!expander.expand("machine parts").contains("ml"));
    }
}
