use std::fs::File;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder};
use serde::Deserialize;
use tokenizers::{PaddingParams, PaddingStrategy, TruncationParams};
use tracing::info;

use crate::adapter::{merge_opt, LoraAdapter};
use crate::config::ModelFiles;
use crate::embed::EmbeddingProvider;
use crate::error::{RagError, Result};

// ---------------------------------------------------------------------------
// Config (read from the checkpoint's config.json)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl BertConfig {
    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

// ---------------------------------------------------------------------------
// Layer norm (with bias)
// ---------------------------------------------------------------------------

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(vb: VarBuilder, hidden_size: usize, eps: f64) -> Result<Self> {
        let weight = vb.get(hidden_size, "weight")?;
        let bias = vb.get(hidden_size, "bias")?;
        Ok(Self { weight, bias, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x_dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let diff = x.broadcast_sub(&mean)?;
        let var = diff.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        let normed = diff.broadcast_div(&std)?;
        let out = normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        Ok(out.to_dtype(x_dtype)?)
    }
}

/// Dense layer whose weight may carry a merged adapter delta.
fn linear(
    in_dim: usize,
    out_dim: usize,
    vb: VarBuilder,
    module: &str,
    adapter: Option<&LoraAdapter>,
) -> Result<Linear> {
    let weight = vb.get((out_dim, in_dim), "weight")?;
    let weight = merge_opt(adapter, module, weight)?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

// ---------------------------------------------------------------------------
// Self-attention (separate Q/K/V with biases, padding mask)
// ---------------------------------------------------------------------------

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl BertSelfAttention {
    fn load(
        vb: VarBuilder,
        path: &str,
        config: &BertConfig,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let attn_vb = vb.pp("attention");
        let self_vb = attn_vb.pp("self");

        let attn = format!("{path}.attention.self");
        let query = linear(h, h, self_vb.pp("query"), &format!("{attn}.query"), adapter)?;
        let key = linear(h, h, self_vb.pp("key"), &format!("{attn}.key"), adapter)?;
        let value = linear(h, h, self_vb.pp("value"), &format!("{attn}.value"), adapter)?;
        let output = linear(
            h,
            h,
            attn_vb.pp("output").pp("dense"),
            &format!("{path}.attention.output.dense"),
            adapter,
        )?;
        let output_norm = LayerNorm::load(
            attn_vb.pp("output").pp("LayerNorm"),
            h,
            config.layer_norm_eps,
        )?;

        Ok(Self {
            query,
            key,
            value,
            output,
            output_norm,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        Ok(x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// `mask` is additive, shaped (batch, 1, 1, seq): 0 for real tokens,
    /// large negative for padding.
    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = self.split_heads(&self.query.forward(x)?, batch, seq_len)?;
        let k = self.split_heads(&self.key.forward(x)?, batch, seq_len)?;
        let v = self.split_heads(&self.value.forward(x)?, batch, seq_len)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn_weights = q.matmul(&k.t()?)?.affine(1.0 / scale, 0.0)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_out = attn_weights.matmul(&v)?;

        let attn_out = attn_out.transpose(1, 2)?.contiguous()?.reshape((
            batch,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;

        let attn_out = self.output.forward(&attn_out)?;

        // Residual + post-norm
        let x = (x + attn_out)?;
        self.output_norm.forward(&x)
    }
}

// ---------------------------------------------------------------------------
// FFN (up + GELU + down, with biases) + post-norm
// ---------------------------------------------------------------------------

struct BertFfn {
    up: Linear,
    down: Linear,
    output_norm: LayerNorm,
}

impl BertFfn {
    fn load(
        vb: VarBuilder,
        path: &str,
        config: &BertConfig,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Self> {
        let up = linear(
            config.hidden_size,
            config.intermediate_size,
            vb.pp("intermediate").pp("dense"),
            &format!("{path}.intermediate.dense"),
            adapter,
        )?;
        let down = linear(
            config.intermediate_size,
            config.hidden_size,
            vb.pp("output").pp("dense"),
            &format!("{path}.output.dense"),
            adapter,
        )?;
        let output_norm = LayerNorm::load(
            vb.pp("output").pp("LayerNorm"),
            config.hidden_size,
            config.layer_norm_eps,
        )?;
        Ok(Self {
            up,
            down,
            output_norm,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.up.forward(x)?.gelu_erf()?;
        let h = self.down.forward(&h)?;

        // Residual + post-norm
        let x = (x + h)?;
        self.output_norm.forward(&x)
    }
}

struct BertLayer {
    attention: BertSelfAttention,
    ffn: BertFfn,
}

impl BertLayer {
    fn load(
        vb: VarBuilder,
        path: &str,
        config: &BertConfig,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Self> {
        let attention = BertSelfAttention::load(vb.clone(), path, config, adapter)?;
        let ffn = BertFfn::load(vb, path, config, adapter)?;
        Ok(Self { attention, ffn })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = self.attention.forward(x, mask)?;
        self.ffn.forward(&x)
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

struct BertEncoder {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    embedding_norm: LayerNorm,
    layers: Vec<BertLayer>,
    config: BertConfig,
}

impl BertEncoder {
    fn load(
        weights: &Path,
        config: BertConfig,
        device: &Device,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Self> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        // bert-base style checkpoints nest everything under "bert.",
        // sentence-transformers exports do not.
        let vb = if vb.contains_tensor("bert.embeddings.word_embeddings.weight") {
            vb.pp("bert")
        } else {
            vb
        };

        let emb_vb = vb.pp("embeddings");
        let h = config.hidden_size;
        let word_embeddings = Embedding::new(
            emb_vb
                .pp("word_embeddings")
                .get((config.vocab_size, h), "weight")?,
            h,
        );
        let position_embeddings = Embedding::new(
            emb_vb
                .pp("position_embeddings")
                .get((config.max_position_embeddings, h), "weight")?,
            h,
        );
        let token_type_embeddings = Embedding::new(
            emb_vb
                .pp("token_type_embeddings")
                .get((config.type_vocab_size, h), "weight")?,
            h,
        );
        let embedding_norm = LayerNorm::load(emb_vb.pp("LayerNorm"), h, config.layer_norm_eps)?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(BertLayer::load(
                vb.pp("encoder").pp("layer").pp(i.to_string()),
                &format!("encoder.layer.{i}"),
                &config,
                adapter,
            )?);
        }

        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            embedding_norm,
            layers,
            config,
        })
    }

    /// `input_ids` and `attention_mask` are (batch, seq). Returns (batch, hidden),
    /// mean-pooled over unmasked tokens and L2-normalised.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_position_embeddings {
            return Err(RagError::Config(format!(
                "input length {seq_len} exceeds max {}",
                self.config.max_position_embeddings
            )));
        }
        let device = input_ids.device();

        let word_emb = self.word_embeddings.forward(input_ids)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, device)?;
        let pos_emb = self.position_embeddings.forward(&position_ids)?;
        let token_type_ids = input_ids.zeros_like()?;
        let type_emb = self.token_type_embeddings.forward(&token_type_ids)?;

        let mut hidden = word_emb.broadcast_add(&pos_emb)?.add(&type_emb)?;
        hidden = self.embedding_norm.forward(&hidden)?;

        let mask = attention_mask.to_dtype(DType::F32)?;
        // 1 -> 0, 0 -> -10000
        let additive = mask.affine(10_000.0, -10_000.0)?.unsqueeze(1)?.unsqueeze(1)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &additive)?;
        }

        mean_pool_normalize(&hidden, &mask)
    }
}

/// Masked mean pooling followed by L2 normalisation. `hidden` is (batch, seq, dim),
/// `mask` is (batch, seq) of 0/1 floats.
pub(crate) fn mean_pool_normalize(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let expanded = mask.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&expanded)?.sum(1)?;
    let counts = expanded.sum(1)?.clamp(1e-9f32, f32::MAX)?;
    let pooled = summed.broadcast_div(&counts)?;

    let norms = pooled
        .sqr()?
        .sum_keepdim(1)?
        .sqrt()?
        .clamp(1e-12f32, f32::MAX)?;
    Ok(pooled.broadcast_div(&norms)?)
}

// ---------------------------------------------------------------------------
// Public BertEmbeddingProvider
// ---------------------------------------------------------------------------

/// Retriever: BERT-family encoder with optional merged LoRA adapter.
pub struct BertEmbeddingProvider {
    encoder: BertEncoder,
    tokenizer: tokenizers::Tokenizer,
    device: Device,
}

impl BertEmbeddingProvider {
    pub fn load(
        model_dir: &Path,
        adapter_dir: Option<&Path>,
        max_length: usize,
        device: &Device,
    ) -> Result<Self> {
        let files = ModelFiles::from_dir(model_dir)?;
        let config: BertConfig = serde_json::from_reader(File::open(&files.config)?)?;

        let adapter = adapter_dir
            .map(|dir| LoraAdapter::load(dir, device))
            .transpose()?;
        let encoder = BertEncoder::load(&files.weights, config, device, adapter.as_ref())?;
        if let Some(adapter) = &adapter {
            adapter.report_unmerged();
        }

        let mut tokenizer =
            tokenizers::Tokenizer::from_file(&files.tokenizer).map_err(RagError::tokenizer)?;
        let max_length = max_length.min(encoder.config.max_position_embeddings);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(RagError::tokenizer)?;
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        info!(
            model = %model_dir.display(),
            adapter = %adapter_dir.map(|p| p.display().to_string()).unwrap_or_default(),
            dim = encoder.config.hidden_size,
            max_length,
            "loaded retriever"
        );

        Ok(Self {
            encoder,
            tokenizer,
            device: device.clone(),
        })
    }
}

impl EmbeddingProvider for BertEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text])?;
        out.pop()
            .ok_or_else(|| RagError::Tokenizer("empty embedding batch".to_string()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(RagError::tokenizer)?;

        let seq_len = encodings.iter().map(|e| e.len()).max().unwrap_or(0);
        let mut ids = Vec::with_capacity(texts.len() * seq_len);
        let mut mask = Vec::with_capacity(texts.len() * seq_len);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }

        let input_ids = Tensor::from_vec(ids, (texts.len(), seq_len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (texts.len(), seq_len), &self.device)?;
        let pooled = self.encoder.forward(&input_ids, &attention_mask)?;
        Ok(pooled.to_device(&Device::Cpu)?.to_vec2::<f32>()?)
    }

    fn dim(&self) -> usize {
        self.encoder.config.hidden_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn model_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .unwrap()
            .parent()
            .unwrap()
            .join("models/retriever")
    }

    #[test]
    fn mean_pooling_ignores_padding() {
        let device = Device::Cpu;
        // batch 1, seq 3, dim 2; last token is padding
        let hidden = Tensor::new(&[[[1f32, 0.0], [3.0, 0.0], [100.0, 100.0]]], &device).unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &device).unwrap();

        let pooled = mean_pool_normalize(&hidden, &mask).unwrap();
        let v = pooled.to_vec2::<f32>().unwrap();
        assert!((v[0][0] - 1.0).abs() < 1e-6);
        assert!(v[0][1].abs() < 1e-6);
    }

    #[test]
    fn pooled_rows_are_unit_length() {
        let device = Device::Cpu;
        let hidden = Tensor::new(
            &[[[3f32, 4.0], [3.0, 4.0]], [[0.5, 0.5], [1.5, -0.5]]],
            &device,
        )
        .unwrap();
        let mask = Tensor::ones((2, 2), DType::F32, &device).unwrap();

        let pooled = mean_pool_normalize(&hidden, &mask).unwrap();
        for row in pooled.to_vec2::<f32>().unwrap() {
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn bert_embed_batch_matches_single() {
        let dir = model_dir();
        if ModelFiles::from_dir(&dir).is_err() {
            eprintln!("Skipping: retriever checkpoint not found in {}", dir.display());
            return;
        }

        let provider = BertEmbeddingProvider::load(&dir, None, 128, &Device::Cpu).unwrap();
        let texts = ["How do I reset my password?", "Paris is the capital of France."];
        let batch = provider.embed_batch(&texts).unwrap();
        let single = provider.embed(texts[0]).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].len(), provider.dim());
        let diff: f32 = batch[0]
            .iter()
            .zip(single.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max);
        assert!(diff < 1e-4, "padding changed the embedding by {diff}");
    }
}
