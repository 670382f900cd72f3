//! LoRA adapters merged into frozen base weights at load time.
//!
//! An adapter directory contains `adapter_config.json` and
//! `adapter_model.safetensors`. For every targeted linear layer the merged
//! weight is `W + (lora_alpha / r) * B @ A`, after which the adapter itself is
//! no longer needed.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{RagError, Result};

const CONFIG_FILE: &str = "adapter_config.json";
const WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Prefixes stripped from tensor names so that keys line up with the module
/// paths the model loaders use (`encoder.layer.0.attention.self.query`,
/// `layers.3.self_attn.q_proj`, ...).
const WRAPPER_PREFIXES: [&str; 1] = ["base_model.model."];
const ARCH_PREFIXES: [&str; 2] = ["bert.", "model."];

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TargetModules {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    target_modules: Option<TargetModules>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl AdapterConfig {
    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    pub fn target_modules(&self) -> Vec<String> {
        match &self.target_modules {
            Some(TargetModules::One(m)) => vec![m.clone()],
            Some(TargetModules::Many(ms)) => ms.clone(),
            None => Vec::new(),
        }
    }
}

pub struct LoraAdapter {
    config: AdapterConfig,
    deltas: HashMap<String, Tensor>,
    merged: RefCell<HashSet<String>>,
}

fn normalize_module_path(key: &str) -> String {
    let mut path = key;
    for prefix in WRAPPER_PREFIXES {
        path = path.strip_prefix(prefix).unwrap_or(path);
    }
    for prefix in ARCH_PREFIXES {
        path = path.strip_prefix(prefix).unwrap_or(path);
    }
    path.to_string()
}

/// Splits `<module>.lora_A[.<adapter name>].weight` into (module, is_a).
fn split_lora_key(key: &str) -> Option<(String, bool)> {
    let stem = key.strip_suffix(".weight")?;
    for (marker, is_a) in [(".lora_A", true), (".lora_B", false)] {
        if let Some(pos) = stem.rfind(marker) {
            let rest = &stem[pos + marker.len()..];
            if rest.is_empty() || (rest.starts_with('.') && !rest[1..].contains('.')) {
                return Some((normalize_module_path(&stem[..pos]), is_a));
            }
        }
    }
    None
}

impl LoraAdapter {
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let weights_path = dir.join(WEIGHTS_FILE);
        if !config_path.exists() || !weights_path.exists() {
            return Err(RagError::Config(format!(
                "adapter directory {} must contain {CONFIG_FILE} and {WEIGHTS_FILE}",
                dir.display()
            )));
        }

        let config: AdapterConfig = serde_json::from_reader(File::open(&config_path)?)?;
        if config.r == 0 {
            return Err(RagError::Config(format!(
                "adapter {}: rank r must be > 0",
                dir.display()
            )));
        }

        let tensors = candle_core::safetensors::load(&weights_path, device)?;
        let adapter = Self::from_tensors(config, tensors)?;
        info!(
            path = %dir.display(),
            modules = adapter.deltas.len(),
            scaling = adapter.config.scaling(),
            "loaded LoRA adapter"
        );
        Ok(adapter)
    }

    pub fn from_tensors(config: AdapterConfig, tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut pairs: HashMap<String, (Option<Tensor>, Option<Tensor>)> = HashMap::new();
        for (key, tensor) in tensors {
            match split_lora_key(&key) {
                Some((module, true)) => pairs.entry(module).or_default().0 = Some(tensor),
                Some((module, false)) => pairs.entry(module).or_default().1 = Some(tensor),
                None => debug!(key = %key, "ignoring non-LoRA adapter tensor"),
            }
        }

        let scaling = config.scaling();
        let mut deltas = HashMap::with_capacity(pairs.len());
        for (module, pair) in pairs {
            let (a, b) = match pair {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(RagError::Config(format!(
                        "adapter module {module} is missing its lora_A or lora_B tensor"
                    )))
                }
            };
            let a = a.to_dtype(DType::F32)?;
            let b = b.to_dtype(DType::F32)?;
            let mut delta = b.matmul(&a)?.affine(scaling, 0.0)?;
            if config.fan_in_fan_out {
                delta = delta.t()?.contiguous()?;
            }
            deltas.insert(module, delta);
        }

        if deltas.is_empty() {
            return Err(RagError::Config(
                "adapter contains no lora_A/lora_B tensor pairs".to_string(),
            ));
        }

        Ok(Self {
            config,
            deltas,
            merged: RefCell::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Returns `weight` with the adapter delta for `module` added, or
    /// `weight` unchanged when the adapter does not touch that module.
    pub fn merge(&self, module: &str, weight: Tensor) -> Result<Tensor> {
        let Some(delta) = self.deltas.get(module) else {
            return Ok(weight);
        };
        if delta.dims() != weight.dims() {
            return Err(RagError::Config(format!(
                "adapter delta for {module} has shape {:?}, base weight has {:?}",
                delta.dims(),
                weight.dims()
            )));
        }
        let delta = delta.to_device(weight.device())?.to_dtype(weight.dtype())?;
        self.merged.borrow_mut().insert(module.to_string());
        Ok((weight + delta)?)
    }

    /// Warn about adapter modules no layer asked for. Call once after the model is built.
    pub fn report_unmerged(&self) -> usize {
        let merged = self.merged.borrow();
        let mut missing: Vec<&str> = self
            .deltas
            .keys()
            .filter(|m| !merged.contains(*m))
            .map(String::as_str)
            .collect();
        missing.sort_unstable();
        for module in &missing {
            warn!(module = %module, "adapter targets a module the model does not have");
        }
        for target in self.unmatched_targets() {
            warn!(target = %target, "adapter target_modules entry matched no merged layer");
        }
        missing.len()
    }

    /// Entries of `target_modules` that name no merged module path, either
    /// exactly or as its last dotted segment.
    pub fn unmatched_targets(&self) -> Vec<String> {
        let merged = self.merged.borrow();
        self.config
            .target_modules()
            .into_iter()
            .filter(|target| {
                let suffix = format!(".{target}");
                !merged
                    .iter()
                    .any(|m| m == target || m.ends_with(&suffix))
            })
            .collect()
    }
}

/// Optional adapter: merging through `None` is the identity.
pub(crate) fn merge_opt(
    adapter: Option<&LoraAdapter>,
    module: &str,
    weight: Tensor,
) -> Result<Tensor> {
    match adapter {
        Some(adapter) => adapter.merge(module, weight),
        None => Ok(weight),
    }
}
