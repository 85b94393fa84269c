use crate::config::TokenizerConfig;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use unicode_normalization::UnicodeNormalization;

lazy_static! {
    static ref RE: Regex = Regex::new(r"(?u)(?P<latin>\p{Latin}+)|(?P<cjk>[\p{Han}\p{Hiragana}\p{Katakana}\p{Hangul}]+)")
        .expect("valid regex");
    static ref STOPWORDS: HashSet<&'static str> = {
        let words: &[&str] = &[
            // english
            "the","and","or","but","in","on","at","to","for","of","with","by",
            "is","are","was","were","be","been","an","as","it","its","this","that",
            // chinese
            "的","了","在","是","我","有","和","就","不","人","都","一","一个","上","也","很",
            "到","说","要","去","你","会","着","没有","看","好","自己","这","那","个",
            "能","可以","把","让","给","被","跟","对","向","从",
        ];
        words.iter().copied().collect()
    };
}

fn is_builtin_stopword(token: &str) -> bool { STOPWORDS.contains(token) }

/// NFKC + lowercase, the normal form shared by indexing, queries and synonyms.
pub fn normalize(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

/// Splits text into index terms: Latin words and overlapping CJK n-grams.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    min_gram: usize,
    max_gram: usize,
    min_latin_len: usize,
    extra_stopwords: HashSet<String>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(&TokenizerConfig::default())
    }
}

impl Tokenizer {
    pub fn new(config: &TokenizerConfig) -> Self {
        let min_gram = config.min_gram.max(1);
        Self {
            min_gram,
            max_gram: config.max_gram.max(min_gram),
            min_latin_len: config.min_latin_len.max(1),
            extra_stopwords: config.extra_stopwords.iter().map(|w| normalize(w)).collect(),
        }
    }

    fn is_stopword(&self, token: &str) -> bool {
        is_builtin_stopword(token) || self.extra_stopwords.contains(token)
    }

    /// Terms in occurrence order; repeated terms are kept so callers can count them.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let normalized = normalize(text);
        let mut tokens = Vec::new();
        for caps in RE.captures_iter(&normalized) {
            if let Some(word) = caps.name("latin") {
                let word = word.as_str();
                if word.chars().count() >= self.min_latin_len && !self.is_stopword(word) {
                    tokens.push(word.to_string());
                }
            } else if let Some(run) = caps.name("cjk") {
                self.push_ngrams(run.as_str(), &mut tokens);
            }
        }
        tokens
    }

    fn push_ngrams(&self, run: &str, out: &mut Vec<String>) {
        let chars: Vec<char> = run.chars().collect();
        if chars.len() < self.min_gram {
            if !self.is_stopword(run) {
                out.push(run.to_string());
            }
            return;
        }
        for start in 0..chars.len() {
            for width in self.min_gram..=self.max_gram {
                if start + width > chars.len() {
                    break;
                }
                let gram: String = chars[start..start + width].iter().collect();
                if !self.is_stopword(&gram) {
                    out.push(gram);
                }
            }
        }
    }

    pub fn term_frequencies(&self, text: &str) -> BTreeMap<String, u32> {
        let mut freqs = BTreeMap::new();
        for token in self.tokenize(text) {
            *freqs.entry(token).or_insert(0) += 1;
        }
        freqs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_tokenize() {
        let t = Tokenizer::default().tokenize("Cats are GREAT, cats!");
        assert_eq!(t, vec!["cats", "great", "cats"]);
    }

    #[test]
    fn cjk_runs_become_overlapping_grams() {
        let t = Tokenizer::default().tokenize("小蝎子");
        assert_eq!(t, vec!["小蝎", "小蝎子", "蝎子"]);
    }

    #[test]
    fn short_cjk_run_is_kept_whole() {
        let t = Tokenizer::default().tokenize("猫 and 的");
        assert_eq!(t, vec!["猫"]);
    }

    #[test]
    fn mixed_script_splits_at_boundaries() {
        let t = Tokenizer::default().tokenize("用户likes记忆");
        assert_eq!(t, vec!["用户", "likes", "记忆"]);
    }

    #[test]
    fn extra_stopwords_are_normalized() {
        let config = TokenizerConfig { extra_stopwords: vec!["TODO".into()], ..TokenizerConfig::default() };
        let t = Tokenizer::new(&config).tokenize("todo fix parser");
        assert_eq!(t, vec!["fix", "parser"]);
    }
}
