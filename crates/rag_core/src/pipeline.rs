//! Wiring between a [`RunConfig`] and the stages it drives.
//!
//! Models are loaded here at the start of a run and owned by the caller for
//! its duration.

use candle_core::Device;
use tracing::info;

use crate::batch::{embed_passages, EmbeddingMatrix};
use crate::bert_embed::BertEmbeddingProvider;
use crate::config::RunConfig;
use crate::dataset::{examples_from_records, load_records};
use crate::embed::{EmbeddingProvider, HashEmbeddingProvider};
use crate::error::{RagError, Result};
use crate::generation::TextGenerator;
use crate::index::{build_index, VectorIndex};
use crate::model::Example;
use crate::pool::PassagePool;
use crate::qwen3_generate::Qwen3Generator;

/// Examples and the deduplicated passage pool drawn from one dataset.
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub examples: Vec<Example>,
    pub pool: PassagePool,
}

pub fn prepare_dataset(config: &RunConfig) -> Result<PreparedDataset> {
    let records = load_records(&config.dataset_path, &config.columns)?;
    let pool = PassagePool::from_records(&records)?;
    let examples = examples_from_records(&records);
    if examples.is_empty() {
        return Err(RagError::Data(format!(
            "no examples in {}",
            config.dataset_path.display()
        )));
    }
    info!(
        records = records.len(),
        examples = examples.len(),
        passages = pool.len(),
        "prepared dataset"
    );
    Ok(PreparedDataset { examples, pool })
}

/// BERT retriever when a model directory is configured, otherwise the hashing embedder.
pub fn load_embedder(config: &RunConfig, device: &Device) -> Result<Box<dyn EmbeddingProvider>> {
    let embedder: Box<dyn EmbeddingProvider> = match &config.retriever_model {
        Some(dir) => Box::new(BertEmbeddingProvider::load(
            dir,
            config.retriever_adapter.as_deref(),
            config.max_length,
            device,
        )?),
        None => Box::new(HashEmbeddingProvider::new(config.embed_dim)),
    };
    if embedder.dim() != config.embed_dim {
        return Err(RagError::Config(format!(
            "retriever produces {}-dimensional embeddings but the embedding dimension is set to {}",
            embedder.dim(),
            config.embed_dim
        )));
    }
    Ok(embedder)
}

pub fn load_generator(config: &RunConfig, device: &Device) -> Result<Box<dyn TextGenerator>> {
    let dir = config
        .generator_model
        .as_deref()
        .ok_or_else(|| RagError::Config("answer generation needs a generator model".to_string()))?;
    Ok(Box::new(Qwen3Generator::load(
        dir,
        config.generator_adapter.as_deref(),
        device,
    )?))
}

/// Short name for reports.
pub fn retriever_name(config: &RunConfig) -> String {
    config
        .retriever_model
        .as_ref()
        .map(|p| {
            p.file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string())
        })
        .unwrap_or_else(|| "hash".to_string())
}

/// Embed the pool in batches and build the configured index over it.
pub fn embed_and_index<E>(
    embedder: &E,
    pool: &PassagePool,
    config: &RunConfig,
) -> Result<(EmbeddingMatrix, Box<dyn VectorIndex>)>
where
    E: EmbeddingProvider + ?Sized,
{
    let matrix = embed_passages(embedder, &pool.texts(), config.batch_size)?;
    let index = build_index(config.index, &matrix)?;
    Ok((matrix, index))
}

/// A saved matrix can only be searched with the embedder that produced it.
pub fn check_matrix_dim(matrix: &EmbeddingMatrix, embedder_dim: usize) -> Result<()> {
    if matrix.dim() != embedder_dim {
        return Err(RagError::Config(format!(
            "index embeddings have dimension {}, retriever produces {embedder_dim}",
            matrix.dim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexKind;
    use std::fs;
    use std::path::PathBuf;

    fn write_dataset(dir: &std::path::Path) -> PathBuf {
        let path = dir.join("test.jsonl");
        fs::write(
            &path,
            concat!(
                "{\"query\":\"how do I pay my invoice\",\"passage\":\"Invoices are paid by card\",\"answer\":\"by card\",\"cat\":\"billing\"}\n",
                "{\"query\":\"reset password\",\"passage\":\"Reset your password on the login page\",\"answer\":\"login page\",\"cat\":\"login\"}\n",
                "{\"query\":\"invoice due date\",\"passage\":\"Invoices are paid by card\",\"answer\":\"monthly\",\"cat\":\"billing\"}\n",
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn hash_pipeline_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RunConfig::new(write_dataset(dir.path()));
        config.embed_dim = 128;
        config.index = IndexKind::Flat;
        config.retrieval.top_k = 1;

        let data = prepare_dataset(&config).unwrap();
        assert_eq!(data.examples.len(), 3);
        assert_eq!(data.pool.len(), 2);

        let embedder = load_embedder(&config, &Device::Cpu).unwrap();
        let (matrix, index) = embed_and_index(&embedder, &data.pool, &config).unwrap();
        assert!(matrix.is_fully_populated());
        assert_eq!(index.len(), 2);
        assert_eq!(retriever_name(&config), "hash");
    }

    #[test]
    fn directory_dataset_resolves_test_file() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let config = RunConfig::new(dir.path());
        assert_eq!(prepare_dataset(&config).unwrap().examples.len(), 3);
    }

    #[test]
    fn generator_requires_model() {
        let config = RunConfig::new("unused.jsonl");
        assert!(matches!(
            load_generator(&config, &Device::Cpu),
            Err(RagError::Config(_))
        ));
    }

    #[test]
    fn matrix_dimension_must_match_embedder() {
        let matrix = EmbeddingMatrix::from_rows(&[vec![1.0, 0.0]]).unwrap();
        assert!(check_matrix_dim(&matrix, 2).is_ok());
        assert!(check_matrix_dim(&matrix, 3).is_err());
    }
}
