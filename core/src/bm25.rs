use crate::index::{ChunkId, ChunkRecord, IndexSnapshot};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Bm25Params {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Length normalization, 0 (none) to 1 (full).
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

/// ln((N - df + 0.5) / (df + 0.5) + 1); never negative.
pub fn idf(num_chunks: usize, df: usize) -> f64 {
    let n = num_chunks as f64;
    let df = df as f64;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

/// Contribution of one term to one chunk.
pub fn term_score(params: Bm25Params, tf: u32, df: usize, num_chunks: usize, chunk_len: u32, avg_len: f64) -> f64 {
    if tf == 0 {
        return 0.0;
    }
    let tf = tf as f64;
    let avg = if avg_len > 0.0 { avg_len } else { 1.0 };
    let norm = params.k1 * (1.0 - params.b + params.b * (chunk_len as f64 / avg));
    idf(num_chunks, df) * (tf * (params.k1 + 1.0)) / (tf + norm)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: ChunkId,
    pub score: f64,
    pub matched_terms: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Bm25Scorer {
    params: Bm25Params,
}

impl Bm25Scorer {
    pub fn new(params: Bm25Params) -> Self {
        Self { params }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    /// Score of `chunk` for a set of distinct query terms.
    pub fn score(&self, snapshot: &IndexSnapshot, terms: &BTreeSet<String>, chunk: &ChunkRecord) -> f64 {
        let n = snapshot.num_chunks();
        let avg = snapshot.avg_chunk_len();
        terms
            .iter()
            .filter_map(|t| chunk.terms.get(t).map(|tf| (t, *tf)))
            .map(|(t, tf)| term_score(self.params, tf, snapshot.df(t), n, chunk.token_count, avg))
            .sum()
    }

    /// Chunks matching any of `terms`, best first. Ties go to the more recently
    /// modified file, then to the earlier chunk in the file, then to the chunk id.
    pub fn rank(&self, snapshot: &IndexSnapshot, terms: &BTreeSet<String>, top_k: usize) -> Vec<ScoredChunk> {
        if top_k == 0 || snapshot.chunks.is_empty() {
            return Vec::new();
        }
        let n = snapshot.num_chunks();
        let avg = snapshot.avg_chunk_len();
        let mut acc: HashMap<&str, ScoredChunk> = HashMap::new();

        // BTreeSet iteration keeps the float summation order fixed.
        for term in terms {
            let Some(entry) = snapshot.terms.get(term) else { continue };
            let df = entry.df();
            for (chunk_id, tf) in &entry.postings {
                let Some(chunk) = snapshot.chunks.get(chunk_id) else { continue };
                let contrib = term_score(self.params, *tf, df, n, chunk.token_count, avg);
                let slot = acc.entry(chunk_id.as_str()).or_insert_with(|| ScoredChunk {
                    chunk_id: chunk_id.clone(),
                    score: 0.0,
                    matched_terms: Vec::new(),
                });
                slot.score += contrib;
                slot.matched_terms.push(term.clone());
            }
        }

        let mut scored: Vec<ScoredChunk> = acc.into_values().collect();
        scored.sort_by(|a, b| compare(snapshot, a, b));
        scored.truncate(top_k);
        scored
    }
}

fn compare(snapshot: &IndexSnapshot, a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    let key = |s: &ScoredChunk| {
        let chunk = snapshot.chunks.get(&s.chunk_id);
        let mtime = chunk
            .and_then(|c| snapshot.files.get(&c.file))
            .map(|f| f.stamp.mtime_ns)
            .unwrap_or(0);
        (mtime, chunk.map(|c| c.ordinal).unwrap_or(usize::MAX))
    };
    let (a_mtime, a_ord) = key(a);
    let (b_mtime, b_ord) = key(b);
    b.score
        .total_cmp(&a.score)
        .then_with(|| b_mtime.cmp(&a_mtime))
        .then_with(|| a_ord.cmp(&b_ord))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{chunk_id, FileStamp};
    use std::collections::BTreeMap;

    fn add(snap: &mut IndexSnapshot, file: &str, mtime_ns: u64, chunks: &[&[(&str, u32)]]) {
        let records = chunks
            .iter()
            .enumerate()
            .map(|(ordinal, terms)| {
                let terms: BTreeMap<String, u32> = terms.iter().map(|(t, f)| (t.to_string(), *f)).collect();
                ChunkRecord {
                    id: chunk_id(file, ordinal),
                    file: file.to_string(),
                    ordinal,
                    heading_path: vec![],
                    text: String::new(),
                    start_line: 1,
                    end_line: 1,
                    token_count: terms.values().sum(),
                    hash: String::new(),
                    terms,
                }
            })
            .collect();
        snap.insert_file(FileStamp { mtime_ns, size: 0, hash: String::new() }, file, records);
    }

    fn terms(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn idf_is_positive_even_for_common_terms() {
        assert!(idf(2, 2) > 0.0);
        assert!(idf(10, 1) > idf(10, 5));
    }

    #[test]
    fn score_grows_with_term_frequency() {
        let p = Bm25Params::default();
        let mut last = 0.0;
        for tf in 1..20 {
            let s = term_score(p, tf, 3, 10, 12, 10.0);
            assert!(s >= last, "tf {tf} scored {s} < {last}");
            last = s;
        }
        assert_eq!(term_score(p, 0, 3, 10, 12, 10.0), 0.0);
    }

    #[test]
    fn matches_reference_formula() {
        let p = Bm25Params { k1: 1.2, b: 0.5 };
        let expected = ((4.0 - 1.0 + 0.5) / 1.5 + 1.0f64).ln() * (2.0 * 2.2) / (2.0 + 1.2 * (0.5 + 0.5 * (6.0 / 4.0)));
        assert!((term_score(p, 2, 1, 4, 6, 4.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn rank_orders_by_score_then_recency_then_ordinal() {
        let mut snap = IndexSnapshot::default();
        add(&mut snap, "old.md", 100, &[&[("cats", 1), ("x", 1)], &[("cats", 1), ("y", 1)]]);
        add(&mut snap, "new.md", 200, &[&[("cats", 1), ("z", 1)]]);
        add(&mut snap, "best.md", 50, &[&[("cats", 3), ("w", 1)]]);

        let ranked = Bm25Scorer::default().rank(&snap, &terms(&["cats"]), 10);
        let ids: Vec<&str> = ranked.iter().map(|s| s.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["best.md#0", "new.md#0", "old.md#0", "old.md#1"]);
        assert_eq!(ranked[0].matched_terms, vec!["cats".to_string()]);
    }

    #[test]
    fn rank_respects_top_k_and_misses() {
        let mut snap = IndexSnapshot::default();
        add(&mut snap, "a.md", 1, &[&[("cats", 1)], &[("cats", 2)]]);
        let scorer = Bm25Scorer::default();
        assert_eq!(scorer.rank(&snap, &terms(&["cats"]), 1).len(), 1);
        assert!(scorer.rank(&snap, &terms(&["cats"]), 0).is_empty());
        assert!(scorer.rank(&snap, &terms(&["fish"]), 5).is_empty());
    }

    #[test]
    fn score_agrees_with_rank() {
        let mut snap = IndexSnapshot::default();
        add(&mut snap, "a.md", 1, &[&[("cats", 2), ("dogs", 1)], &[("dogs", 1)]]);
        let scorer = Bm25Scorer::default();
        let q = terms(&["cats", "dogs"]);
        let ranked = scorer.rank(&snap, &q, 5);
        let chunk = &snap.chunks["a.md#0"];
        assert_eq!(ranked[0].chunk_id, "a.md#0");
        assert!((ranked[0].score - scorer.score(&snap, &q, chunk)).abs() < 1e-12);
    }
}
