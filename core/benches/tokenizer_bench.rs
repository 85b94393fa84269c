use criterion::{criterion_group, criterion_main, Criterion};
use memdex_core::chunker::chunk_markdown;
use memdex_core::tokenizer::Tokenizer;

const NOTE: &str = "# 2024-03-02\n\n## 今天\n用户问起记忆系统的索引方式，我们讨论了 BM25 和分词。\n\n## Work\nRefactored the watcher so scans never overlap; the indexer applies change sets in order.\n";

fn bench_tokenize(c: &mut Criterion) {
    let text = NOTE.repeat(64);
    let tokenizer = Tokenizer::default();
    c.bench_function("tokenize_note", |b| b.iter(|| tokenizer.tokenize(&text)));
    c.bench_function("chunk_note", |b| b.iter(|| chunk_markdown(&text)));
}

criterion_group!(benches, bench_tokenize);
criterion_main!(benches);
