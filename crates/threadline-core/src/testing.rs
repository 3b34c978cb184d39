//! Deterministic test doubles for the tokenizer and embedding seams.
//!
//! These let the full index → search pipeline run without a model: the
//! [`HashingBackend`] embeds text as a hashed bag of words, so texts that
//! share vocabulary are close in cosine space.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::EmbeddingBackend;
use crate::error::BackendAttempt;
use crate::tokenize::TokenCounter;

/// One token per whitespace-separated word.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenCounter;

impl TokenCounter for WordTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        let mut seen = 0;
        let mut in_word = false;
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                in_word = false;
            } else if !in_word {
                if seen == max_tokens {
                    return text[..i].trim_end();
                }
                seen += 1;
                in_word = true;
            }
        }
        text
    }

    fn tail<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        if max_tokens == 0 {
            return "";
        }
        let starts: Vec<usize> = text
            .char_indices()
            .filter(|&(i, c)| {
                !c.is_whitespace() && text[..i].chars().next_back().map_or(true, char::is_whitespace)
            })
            .map(|(i, _)| i)
            .collect();
        if starts.len() <= max_tokens {
            return text;
        }
        &text[starts[starts.len() - max_tokens]..]
    }
}

/// One token per character; text without separators exercises hard splits.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharTokenCounter;

impl TokenCounter for CharTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }

    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        match text.char_indices().nth(max_tokens) {
            Some((i, _)) => &text[..i],
            None => text,
        }
    }

    fn tail<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        let n = text.chars().count();
        if n <= max_tokens {
            return text;
        }
        match text.char_indices().nth(n - max_tokens) {
            Some((i, _)) => &text[i..],
            None => "",
        }
    }
}

/// Feature-hashed bag-of-words embedding.
///
/// Vectors are L2-normalized and depend only on the lowercase alphanumeric
/// words of the input, so they are bit-stable across calls and processes.
#[derive(Debug)]
pub struct HashingBackend {
    name: String,
    model: String,
    dims: usize,
    max_seq_len: usize,
    calls: AtomicUsize,
}

impl HashingBackend {
    pub fn new(name: &str, model: &str, dims: usize) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            dims,
            max_seq_len: 512,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_max_seq_len(mut self, max_seq_len: usize) -> Self {
        self.max_seq_len = max_seq_len;
        self
    }

    /// Number of `embed` calls served so far.
    pub fn embed_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = (fnv1a(&word.to_lowercase()) % self.dims as u64) as usize;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl EmbeddingBackend for HashingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    async fn probe(&self) -> std::result::Result<(), BackendAttempt> {
        Ok(())
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    async fn token_counter(&self) -> Result<Arc<dyn TokenCounter>> {
        Ok(Arc::new(WordTokenCounter))
    }
}
