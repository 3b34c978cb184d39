//! Model tokenizers for chunk sizing.
//!
//! Chunks are measured with the embedding model's own tokenizer, loaded
//! from the model's `tokenizer.json` on Hugging Face and cached on disk.
//! The same cache holds model files for the tract backend.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use threadline_core::tokenize::{snap_to_char_boundary, TokenCounter};

/// Model cache root: `$THREADLINE_CACHE_DIR` or `~/.cache/threadline/models`.
pub fn cache_dir() -> Result<PathBuf> {
    let dir = match std::env::var_os("THREADLINE_CACHE_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => {
            let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(base)
                .join(".cache")
                .join("threadline")
                .join("models")
        }
    };
    std::fs::create_dir_all(&dir).map_err(|e| anyhow!("Create cache dir: {}", e))?;
    Ok(dir)
}

/// Directory for one Hugging Face repo inside the cache.
pub fn repo_cache_dir(repo: &str) -> Result<PathBuf> {
    Ok(cache_dir()?.join(repo.replace('/', "--")))
}

/// Fetch `path` from a Hugging Face repo unless it is already cached.
///
/// Blocking; call from `spawn_blocking` inside async code.
pub fn download_to_cache(repo: &str, path: &str, cache_path: &Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!(
        "https://huggingface.co/{}/resolve/main/{}",
        repo,
        path.replace(' ', "%20")
    );
    debug!(%url, "downloading model file");
    let resp = reqwest::blocking::get(&url)
        .map_err(|e| anyhow!("Download {}: {}", url, e))?
        .error_for_status()
        .map_err(|e| anyhow!("Download {}: {}", url, e))?;
    let bytes = resp.bytes().map_err(|e| anyhow!("Read body: {}", e))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| anyhow!("Create cache parent: {}", e))?;
    }
    // Write then rename so a torn download never looks cached.
    let partial = cache_path.with_extension("partial");
    std::fs::write(&partial, &bytes).map_err(|e| anyhow!("Write cache: {}", e))?;
    std::fs::rename(&partial, cache_path).map_err(|e| anyhow!("Write cache: {}", e))?;
    Ok(())
}

/// [`TokenCounter`] backed by a Hugging Face `tokenizers` tokenizer.
pub struct HfTokenCounter {
    tokenizer: tokenizers::Tokenizer,
    /// Tokens the post-processor adds around every input (`[CLS]`, `[SEP]`, ...).
    special: usize,
}

impl HfTokenCounter {
    /// Load `tokenizer.json` for `repo`, downloading it on first use. Blocking.
    pub fn load(repo: &str) -> Result<Self> {
        let path = repo_cache_dir(repo)?.join("tokenizer.json");
        download_to_cache(repo, "tokenizer.json", &path)?;
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Load tokenizer {}: {}", path.display(), e))?;
        Self::new(tokenizer)
    }

    pub fn new(mut tokenizer: tokenizers::Tokenizer) -> Result<Self> {
        // Counting must see the whole text, not the model's input window.
        tokenizer
            .with_truncation(None)
            .map_err(|e| anyhow!("Disable truncation: {}", e))?;
        tokenizer.with_padding(None);
        let special = tokenizer
            .encode("", true)
            .map(|enc| enc.get_ids().len())
            .map_err(|e| anyhow!("Tokenize: {}", e))?;
        Ok(Self { tokenizer, special })
    }

    /// Byte spans of the content tokens of `text`, special tokens excluded.
    fn content_offsets(&self, text: &str) -> Option<Vec<(usize, usize)>> {
        match self.tokenizer.encode(text, false) {
            Ok(enc) => Some(enc.get_offsets().to_vec()),
            Err(e) => {
                warn!(error = %e, "tokenizer failed; treating text as unsplittable");
                None
            }
        }
    }
}

impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, true) {
            Ok(enc) => enc.get_ids().len(),
            Err(e) => {
                // Every token covers at least one byte.
                warn!(error = %e, "tokenizer failed; using byte length as an upper bound");
                text.len() + self.special
            }
        }
    }

    fn truncate<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        if self.count(text) <= max_tokens {
            return text;
        }
        let Some(offsets) = self.content_offsets(text) else {
            return "";
        };
        let mut budget = max_tokens.saturating_sub(self.special).min(offsets.len());
        while budget > 0 {
            let end = snap_to_char_boundary(text, offsets[budget - 1].1);
            let prefix = &text[..end];
            // Re-tokenizing a cut word can change the count.
            if self.count(prefix) <= max_tokens {
                return prefix;
            }
            budget -= 1;
        }
        ""
    }

    fn tail<'a>(&self, text: &'a str, max_tokens: usize) -> &'a str {
        if max_tokens == 0 {
            return "";
        }
        let Some(offsets) = self.content_offsets(text) else {
            return "";
        };
        if offsets.len() <= max_tokens {
            return text;
        }
        let start = snap_to_char_boundary(text, offsets[offsets.len() - max_tokens].0);
        &text[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const WORD_TOKENIZER: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": {"type": "BertProcessing", "sep": ["[SEP]", 2], "cls": ["[CLS]", 1]},
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "[CLS]": 1, "[SEP]": 2, "alpha": 3, "beta": 4},
            "unk_token": "[UNK]"
        }
    }"#;

    fn counter() -> HfTokenCounter {
        HfTokenCounter::new(tokenizers::Tokenizer::from_str(WORD_TOKENIZER).unwrap()).unwrap()
    }

    #[test]
    fn test_count_includes_special_tokens() {
        let c = counter();
        assert_eq!(c.special, 2);
        assert_eq!(c.count("alpha beta gamma delta"), 6);
    }

    #[test]
    fn test_truncate_respects_budget() {
        let c = counter();
        let text = "alpha beta gamma delta";
        assert_eq!(c.truncate(text, 4), "alpha beta");
        assert_eq!(c.truncate(text, 6), text);
        assert!(c.count(c.truncate(text, 5)) <= 5);
    }

    #[test]
    fn test_tail_takes_content_tokens() {
        let c = counter();
        let text = "alpha beta gamma delta";
        assert_eq!(c.tail(text, 2), "gamma delta");
        assert_eq!(c.tail(text, 0), "");
        assert_eq!(c.tail(text, 10), text);
    }
}
