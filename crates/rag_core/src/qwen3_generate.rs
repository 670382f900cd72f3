use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::adapter::{merge_opt, LoraAdapter};
use crate::config::ModelFiles;
use crate::error::{RagError, Result};
use crate::generation::{sample_top_k, SamplingConfig, TextGenerator};

/// Fallback stop tokens when config.json names none.
const EOS_CANDIDATES: [&str; 3] = ["<|endoftext|>", "<|im_end|>", "</s>"];

// ---------------------------------------------------------------------------
// Config (read from the checkpoint's config.json)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Qwen3Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    #[serde(default)]
    head_dim: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    eos_token_id: Option<TokenIds>,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f32 {
    1_000_000.0
}

impl Qwen3Config {
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    fn eos_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(TokenIds::One(id)) => vec![*id],
            Some(TokenIds::Many(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }
}

fn linear_no_bias(
    in_dim: usize,
    out_dim: usize,
    vb: VarBuilder,
    module: &str,
    adapter: Option<&LoraAdapter>,
) -> Result<Linear> {
    let weight = vb.get((out_dim, in_dim), "weight")?;
    let weight = merge_opt(adapter, module, weight)?;
    Ok(Linear::new(weight, None))
}

// ---------------------------------------------------------------------------
// SwiGLU MLP
// ---------------------------------------------------------------------------

struct Qwen3Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Qwen3Mlp {
    fn load(
        vb: VarBuilder,
        path: &str,
        config: &Qwen3Config,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        let proj = |in_dim: usize, out_dim: usize, name: &str| {
            linear_no_bias(in_dim, out_dim, vb.pp(name), &format!("{path}.{name}"), adapter)
        };
        Ok(Self {
            gate_proj: proj(h, i, "gate_proj")?,
            up_proj: proj(h, i, "up_proj")?,
            down_proj: proj(i, h, "down_proj")?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

// ---------------------------------------------------------------------------
// GQA attention with per-head Q/K RMSNorm and a causal mask
// ---------------------------------------------------------------------------

struct Qwen3Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Qwen3Attention {
    fn load(
        vb: VarBuilder,
        path: &str,
        config: &Qwen3Config,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Self> {
        let head_dim = config.head_dim();
        let q_dim = config.num_attention_heads * head_dim;
        let kv_dim = config.num_key_value_heads * head_dim;
        let h = config.hidden_size;

        let proj = |in_dim: usize, out_dim: usize, name: &str| {
            linear_no_bias(in_dim, out_dim, vb.pp(name), &format!("{path}.{name}"), adapter)
        };
        let q_proj = proj(h, q_dim, "q_proj")?;
        let k_proj = proj(h, kv_dim, "k_proj")?;
        let v_proj = proj(h, kv_dim, "v_proj")?;
        let o_proj = proj(q_dim, h, "o_proj")?;

        let q_norm = candle_nn::rms_norm(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?;
        let k_norm = candle_nn::rms_norm(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((batch, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = apply_rope(&self.q_norm.forward(&q.contiguous()?)?, cos, sin)?;
        let k = apply_rope(&self.k_norm.forward(&k.contiguous()?)?, cos, sin)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v.contiguous()?, n_rep)?;

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

        Ok(self.o_proj.forward(&attn_out)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// (seq, seq) additive mask: 0 on and below the diagonal, -inf above it.
pub(crate) fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?)
}

// ---------------------------------------------------------------------------
// Transformer layer (pre-norm)
// ---------------------------------------------------------------------------

struct Qwen3Layer {
    input_layernorm: RmsNorm,
    self_attn: Qwen3Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Qwen3Mlp,
}

impl Qwen3Layer {
    fn load(
        vb: VarBuilder,
        index: usize,
        config: &Qwen3Config,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Self> {
        let path = format!("layers.{index}");
        Ok(Self {
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            self_attn: Qwen3Attention::load(
                vb.pp("self_attn"),
                &format!("{path}.self_attn"),
                config,
                adapter,
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
            mlp: Qwen3Mlp::load(vb.pp("mlp"), &format!("{path}.mlp"), config, adapter)?,
        })
    }

    fn forward(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let hidden = self.input_layernorm.forward(x)?;
        let hidden = self.self_attn.forward(&hidden, cos, sin, mask)?;
        let x = (x + hidden)?;

        let hidden = self.post_attention_layernorm.forward(&x)?;
        let hidden = self.mlp.forward(&hidden)?;
        Ok((x + hidden)?)
    }
}

// ---------------------------------------------------------------------------
// RoPE (NeoX half-split)
// ---------------------------------------------------------------------------

fn precompute_rope(
    head_dim: usize,
    max_len: usize,
    freq_base: f32,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let half_dim = head_dim / 2;
    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| 1.0f32 / freq_base.powf(i as f32 / half_dim as f32))
        .collect();
    let freqs = Tensor::new(freqs.as_slice(), device)?;

    let positions: Vec<f32> = (0..max_len).map(|i| i as f32).collect();
    let positions = Tensor::new(positions.as_slice(), device)?;

    let angles = positions
        .unsqueeze(1)?
        .broadcast_mul(&freqs.unsqueeze(0)?)?;
    Ok((angles.cos()?, angles.sin()?))
}

fn apply_rope(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (_b, _h, seq_len, head_dim) = x.dims4()?;
    let half = head_dim / 2;

    let cos = cos.i(..seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.i(..seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

    let x1 = x.narrow(3, 0, half)?;
    let x2 = x.narrow(3, half, half)?;

    let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
    let rotated_x2 = (x1.broadcast_mul(&sin)? + x2.broadcast_mul(&cos)?)?;

    Ok(Tensor::cat(&[&rotated_x1, &rotated_x2], 3)?)
}

// ---------------------------------------------------------------------------
// Causal LM
// ---------------------------------------------------------------------------

struct Qwen3CausalLm {
    embed_tokens: Embedding,
    layers: Vec<Qwen3Layer>,
    norm: RmsNorm,
    lm_head: Linear,
    rope_cos: Tensor,
    rope_sin: Tensor,
    config: Qwen3Config,
}

impl Qwen3CausalLm {
    fn load(
        weights: &Path,
        config: Qwen3Config,
        device: &Device,
        adapter: Option<&LoraAdapter>,
    ) -> Result<Self> {
        let root = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        // *ForCausalLM checkpoints nest the decoder under "model.", bare exports do not.
        let vb = if root.contains_tensor("model.embed_tokens.weight") {
            root.pp("model")
        } else {
            root.clone()
        };

        let embed_weight = vb
            .pp("embed_tokens")
            .get((config.vocab_size, config.hidden_size), "weight")?;
        let embed_tokens = Embedding::new(embed_weight.clone(), config.hidden_size);

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(Qwen3Layer::load(vb.pp(format!("layers.{i}")), i, &config, adapter)?);
        }

        let norm = candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings || !root.contains_tensor("lm_head.weight") {
            Linear::new(embed_weight, None)
        } else {
            linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                root.pp("lm_head"),
                "lm_head",
                adapter,
            )?
        };

        let (rope_cos, rope_sin) = precompute_rope(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
        )?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope_cos,
            rope_sin,
            config,
        })
    }

    /// Logits for the token following `token_ids`.
    fn next_token_logits(&self, token_ids: &[u32]) -> Result<Vec<f32>> {
        let device = self.rope_cos.device();
        let seq_len = token_ids.len();
        if seq_len == 0 {
            return Err(RagError::Generation("empty prompt".to_string()));
        }
        if seq_len > self.config.max_position_embeddings {
            return Err(RagError::Generation(format!(
                "input length {seq_len} exceeds max {}",
                self.config.max_position_embeddings
            )));
        }

        let ids = Tensor::new(token_ids, device)?.unsqueeze(0)?;
        let mut hidden = self.embed_tokens.forward(&ids)?;
        let mask = causal_mask(seq_len, device)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &self.rope_cos, &self.rope_sin, &mask)?;
        }

        let last = self.norm.forward(&hidden.narrow(1, seq_len - 1, 1)?)?;
        let logits = self.lm_head.forward(&last)?.squeeze(0)?.squeeze(0)?;
        Ok(logits.to_dtype(DType::F32)?.to_device(&Device::Cpu)?.to_vec1::<f32>()?)
    }
}

// ---------------------------------------------------------------------------
// Public Qwen3Generator
// ---------------------------------------------------------------------------

/// Generator: Qwen3 causal LM with optional merged LoRA adapter.
pub struct Qwen3Generator {
    model: Qwen3CausalLm,
    tokenizer: tokenizers::Tokenizer,
    eos_ids: HashSet<u32>,
}

impl Qwen3Generator {
    pub fn load(model_dir: &Path, adapter_dir: Option<&Path>, device: &Device) -> Result<Self> {
        let files = ModelFiles::from_dir(model_dir)?;
        let config: Qwen3Config = serde_json::from_reader(File::open(&files.config)?)?;

        let adapter = adapter_dir
            .map(|dir| LoraAdapter::load(dir, device))
            .transpose()?;
        let model = Qwen3CausalLm::load(&files.weights, config, device, adapter.as_ref())?;
        if let Some(adapter) = &adapter {
            adapter.report_unmerged();
        }

        let tokenizer =
            tokenizers::Tokenizer::from_file(&files.tokenizer).map_err(RagError::tokenizer)?;

        let mut eos_ids: HashSet<u32> = model.config.eos_ids().into_iter().collect();
        if eos_ids.is_empty() {
            eos_ids.extend(EOS_CANDIDATES.iter().filter_map(|t| tokenizer.token_to_id(t)));
        }
        if eos_ids.is_empty() {
            warn!("no end-of-sequence token found; generation stops at max length only");
        }

        info!(
            model = %model_dir.display(),
            adapter = %adapter_dir.map(|p| p.display().to_string()).unwrap_or_default(),
            layers = model.config.num_hidden_layers,
            "loaded generator"
        );

        Ok(Self {
            model,
            tokenizer,
            eos_ids,
        })
    }

    fn sample_sequence(
        &self,
        prompt_ids: &[u32],
        max_length: usize,
        top_k: usize,
        seed: u64,
    ) -> Result<String> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tokens = prompt_ids.to_vec();
        let mut generated = Vec::new();

        while tokens.len() < max_length {
            let logits = self.model.next_token_logits(&tokens)?;
            let next = sample_top_k(&logits, top_k, &mut rng)?;
            if self.eos_ids.contains(&next) {
                break;
            }
            tokens.push(next);
            generated.push(next);
        }

        self.tokenizer
            .decode(&generated, true)
            .map_err(RagError::tokenizer)
    }
}

impl TextGenerator for Qwen3Generator {
    fn generate(&self, prompt: &str, sampling: &SamplingConfig) -> Result<Vec<String>> {
        sampling.validate()?;
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(RagError::tokenizer)?;
        let prompt_ids = encoding.get_ids();
        let max_length = sampling.max_length.min(self.model.config.max_position_embeddings);

        if prompt_ids.len() >= max_length {
            warn!(
                prompt_tokens = prompt_ids.len(),
                max_length, "prompt fills the generation budget; returning empty answers"
            );
            return Ok(vec![String::new(); sampling.num_return_sequences]);
        }

        (0..sampling.num_return_sequences)
            .map(|n| {
                let text = self.sample_sequence(
                    prompt_ids,
                    max_length,
                    sampling.top_k,
                    sampling.seed.wrapping_add(n as u64),
                )?;
                debug!(sequence = n, chars = text.len(), "generated sequence");
                Ok(text)
            })
            .collect()
    }
}
