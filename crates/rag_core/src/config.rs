use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

pub const DEFAULT_EMBEDDING_DIM: usize = 1024;
pub const DEFAULT_MAX_LENGTH: usize = 128;
pub const DEFAULT_BATCH_SIZE: usize = 8;
pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_THRESHOLD: f32 = 0.0;
pub const DEFAULT_LABEL_PREFIX: &str = "cat";
pub const DEFAULT_QUERY_COLUMN: &str = "query";
pub const DEFAULT_PASSAGE_COLUMN: &str = "passage";
pub const DEFAULT_ANSWER_COLUMN: &str = "answer";

/// Column names used to pull examples out of a dataset file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetColumns {
    pub query: String,
    pub passage: String,
    pub answer: String,
    /// Every column whose name starts with this prefix holds a ground-truth label.
    pub label_prefix: String,
}

impl Default for DatasetColumns {
    fn default() -> Self {
        Self {
            query: DEFAULT_QUERY_COLUMN.to_string(),
            passage: DEFAULT_PASSAGE_COLUMN.to_string(),
            answer: DEFAULT_ANSWER_COLUMN.to_string(),
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Results scoring below this are dropped. 0.0 accepts everything the index returns.
    pub threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    #[default]
    Hnsw,
    Flat,
}

impl FromStr for IndexKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hnsw" => Ok(IndexKind::Hnsw),
            "flat" | "exact" => Ok(IndexKind::Flat),
            other => Err(format!("unknown index kind '{other}' (expected hnsw or flat)")),
        }
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKind::Hnsw => f.write_str("hnsw"),
            IndexKind::Flat => f.write_str("flat"),
        }
    }
}

/// Compute device selector as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceSpec {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn to_device(self) -> Result<Device> {
        let device = match self {
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceSpec::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| format!("invalid device ordinal in '{s}'"))?;
                (kind.to_string(), ordinal)
            }
            None => (s.clone(), 0),
        };
        match kind.as_str() {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(ordinal)),
            "metal" | "mps" => Ok(DeviceSpec::Metal(ordinal)),
            _ => Err(format!("unknown device '{s}' (expected cpu, cuda[:N] or metal[:N])")),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Cpu => f.write_str("cpu"),
            DeviceSpec::Cuda(n) => write!(f, "cuda:{n}"),
            DeviceSpec::Metal(n) => write!(f, "metal:{n}"),
        }
    }
}

/// Files of a pretrained checkpoint directory laid out the way the Hugging Face hub ships them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

impl ModelFiles {
    pub fn from_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(RagError::Config(format!(
                "model directory not found: {}",
                dir.display()
            )));
        }
        let files = Self {
            config: dir.join("config.json"),
            weights: dir.join("model.safetensors"),
            tokenizer: dir.join("tokenizer.json"),
        };
        for path in [&files.config, &files.weights, &files.tokenizer] {
            if !path.exists() {
                return Err(RagError::Config(format!(
                    "missing model file: {}",
                    path.display()
                )));
            }
        }
        Ok(files)
    }
}

/// Everything a run needs, handed to each stage at construction.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub dataset_path: PathBuf,
    pub columns: DatasetColumns,
    pub embed_dim: usize,
    pub max_length: usize,
    pub retriever_model: Option<PathBuf>,
    pub retriever_adapter: Option<PathBuf>,
    pub generator_model: Option<PathBuf>,
    pub generator_adapter: Option<PathBuf>,
    pub batch_size: usize,
    pub device: DeviceSpec,
    pub index: IndexKind,
    pub retrieval: RetrievalConfig,
}

impl RunConfig {
    pub fn new(dataset_path: impl Into<PathBuf>) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            columns: DatasetColumns::default(),
            embed_dim: DEFAULT_EMBEDDING_DIM,
            max_length: DEFAULT_MAX_LENGTH,
            retriever_model: None,
            retriever_adapter: None,
            generator_model: None,
            generator_adapter: None,
            batch_size: DEFAULT_BATCH_SIZE,
            device: DeviceSpec::Cpu,
            index: IndexKind::Hnsw,
            retrieval: RetrievalConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(RagError::Config("batch size must be > 0".to_string()));
        }
        if self.retrieval.top_k == 0 {
            return Err(RagError::Config("top-k must be > 0".to_string()));
        }
        if self.embed_dim == 0 {
            return Err(RagError::Config("embedding dimension must be > 0".to_string()));
        }
        if self.max_length == 0 {
            return Err(RagError::Config("max length must be > 0".to_string()));
        }
        if self.retriever_adapter.is_some() && self.retriever_model.is_none() {
            return Err(RagError::Config(
                "a retriever adapter requires a retriever model".to_string(),
            ));
        }
        if self.generator_adapter.is_some() && self.generator_model.is_none() {
            return Err(RagError::Config(
                "a generator adapter requires a generator model".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_specs() {
        assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
        assert_eq!("cuda".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(0));
        assert_eq!("CUDA:2".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cuda(2));
        assert_eq!("metal".parse::<DeviceSpec>().unwrap(), DeviceSpec::Metal(0));
        assert!("tpu".parse::<DeviceSpec>().is_err());
        assert!("cuda:x".parse::<DeviceSpec>().is_err());
    }

    #[test]
    fn parses_index_kind() {
        assert_eq!("hnsw".parse::<IndexKind>().unwrap(), IndexKind::Hnsw);
        assert_eq!("Flat".parse::<IndexKind>().unwrap(), IndexKind::Flat);
        assert!("ivf".parse::<IndexKind>().is_err());
    }

    #[test]
    fn validate_rejects_zero_batch_and_orphan_adapter() {
        let mut config = RunConfig::new("data.jsonl");
        assert!(config.validate().is_ok());

        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(RagError::Config(_))));

        config.batch_size = 4;
        config.retriever_adapter = Some(PathBuf::from("adapter"));
        assert!(matches!(config.validate(), Err(RagError::Config(_))));
    }

    #[test]
    fn model_files_require_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelFiles::from_dir(dir.path()).is_err());

        for name in ["config.json", "model.safetensors", "tokenizer.json"] {
            std::fs::write(dir.path().join(name), b"{}").unwrap();
        }
        let files = ModelFiles::from_dir(dir.path()).unwrap();
        assert_eq!(files.weights, dir.path().join("model.safetensors"));
    }
}
