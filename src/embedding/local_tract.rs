//! Tract-based local embedding engine (fallback for musl and Intel Mac).
//!
//! Pure-Rust path: loads the ONNX model with tract-onnx, tokenizes with the
//! tokenizers crate, mean-pools and L2-normalizes. Loading happens once per
//! backend; inference runs on the blocking pool. No ONNX Runtime or system deps.
#![cfg_attr(
    all(feature = "local-embeddings-fastembed", feature = "local-embeddings-tract"),
    allow(dead_code)
)]

use anyhow::{anyhow, bail, Result};
use tract_onnx::prelude::*;

use super::tokenizer::{download_to_cache, repo_cache_dir};

/// Model manifest: name -> (repo, onnx path in repo, tokenizer path in repo, dims, max tokens).
fn model_manifest(
    model_name: &str,
) -> Result<(&'static str, &'static str, &'static str, usize, usize)> {
    match model_name {
        "all-minilm-l6-v2" => Ok((
            "sentence-transformers/all-MiniLM-L6-v2",
            "onnx/model.onnx",
            "tokenizer.json",
            384,
            256,
        )),
        _ => bail!(
            "Tract backend supports only all-minilm-l6-v2 for now. Requested: '{}'",
            model_name
        ),
    }
}

/// Whether the tract engine can serve `model_name`.
pub fn supports(model_name: &str) -> bool {
    model_manifest(model_name).is_ok()
}

type RunFn = Box<dyn Fn(TVec<TValue>) -> TractResult<TVec<TValue>> + Send + Sync>;

/// A loaded ONNX model plus its tokenizer.
pub struct TractModel {
    run: RunFn,
    tokenizer: tokenizers::Tokenizer,
    dims: usize,
    max_len: usize,
}

impl TractModel {
    /// Download (first use) and load the model. Blocking.
    pub fn load(model_name: &str) -> Result<Self> {
        let (repo, onnx_rel, tokenizer_rel, dims, max_len) = model_manifest(model_name)?;
        let dir = repo_cache_dir(repo)?;
        let onnx_path = dir.join(onnx_rel);
        let tokenizer_path = dir.join(tokenizer_rel);
        download_to_cache(repo, onnx_rel, &onnx_path)?;
        download_to_cache(repo, tokenizer_rel, &tokenizer_path)?;

        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Load tokenizer: {}", e))?;

        let plan = tract_onnx::onnx()
            .model_for_path(&onnx_path)
            .map_err(|e| anyhow!("Load ONNX: {}", e))?
            .into_optimized()
            .map_err(|e| anyhow!("Optimize: {}", e))?
            .into_runnable()
            .map_err(|e| anyhow!("Build tract runnable: {}", e))?;

        Ok(Self {
            run: Box::new(move |inputs| plan.run(inputs)),
            tokenizer,
            dims,
            max_len,
        })
    }

    /// Embed `texts` in batches of `batch_size`. Blocking.
    pub fn embed(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(batch_size.max(1)) {
            let encodings: Vec<_> = chunk
                .iter()
                .map(|s| {
                    self.tokenizer
                        .encode(s.as_str(), true)
                        .map_err(|e| anyhow!("Tokenize: {}", e))
                })
                .collect::<Result<Vec<_>>>()?;

            let seq_len = encodings
                .iter()
                .map(|e| e.get_ids().len())
                .max()
                .unwrap_or(1)
                .clamp(1, self.max_len);

            let rows = encodings.len();
            let mut input_ids = vec![0i64; rows * seq_len];
            let mut attention_mask = vec![0i64; rows * seq_len];
            let token_type_ids = vec![0i64; rows * seq_len];

            for (i, enc) in encodings.iter().enumerate() {
                for (j, &id) in enc.get_ids().iter().take(seq_len).enumerate() {
                    input_ids[i * seq_len + j] = id as i64;
                    attention_mask[i * seq_len + j] = 1;
                }
            }

            let shape = (rows, seq_len);
            let ids: Tensor = ndarray::Array2::from_shape_vec(shape, input_ids)
                .map_err(|e| anyhow!("Input ids shape: {}", e))?
                .into();
            let mask: Tensor = ndarray::Array2::from_shape_vec(shape, attention_mask.clone())
                .map_err(|e| anyhow!("Attention mask shape: {}", e))?
                .into();
            let types: Tensor = ndarray::Array2::from_shape_vec(shape, token_type_ids)
                .map_err(|e| anyhow!("Token type ids shape: {}", e))?
                .into();

            let outputs = (self.run)(tvec!(ids.into(), mask.into(), types.into()))?;
            let output = outputs
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("No output tensor"))?;
            let view = output
                .to_array_view::<f32>()
                .map_err(|e| anyhow!("Output to array: {}", e))?;

            // [batch, dims] is already pooled; [batch, seq, dims] is last_hidden_state.
            match view.shape() {
                [batch, _] => {
                    for i in 0..*batch {
                        let row: Vec<f32> = view.slice(ndarray::s![i, ..]).iter().copied().collect();
                        all_embeddings.push(normalize_l2(row));
                    }
                }
                [batch, seq, _] => {
                    for i in 0..*batch {
                        let mut sum = vec![0f32; self.dims];
                        let mut count = 0f32;
                        for j in 0..(*seq).min(seq_len) {
                            if attention_mask[i * seq_len + j] == 0 {
                                continue;
                            }
                            for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().enumerate().take(self.dims) {
                                sum[k] += v;
                            }
                            count += 1.0;
                        }
                        if count > 0.0 {
                            for x in &mut sum {
                                *x /= count;
                            }
                        }
                        all_embeddings.push(normalize_l2(sum));
                    }
                }
                other => bail!("Unexpected output shape: {:?}", other),
            }
        }

        Ok(all_embeddings)
    }
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
