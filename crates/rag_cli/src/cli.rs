use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rag_core::{
    DatasetColumns, DeviceSpec, IndexKind, RetrievalConfig, RunConfig, SamplingConfig,
    DEFAULT_ANSWER_COLUMN, DEFAULT_BATCH_SIZE, DEFAULT_EMBEDDING_DIM,
    DEFAULT_GENERATION_MAX_LENGTH, DEFAULT_GENERATION_TOP_K, DEFAULT_LABEL_PREFIX,
    DEFAULT_MAX_LENGTH, DEFAULT_PASSAGE_COLUMN, DEFAULT_QUERY_COLUMN, DEFAULT_SEED,
    DEFAULT_THRESHOLD, DEFAULT_TOP_K,
};

#[derive(Debug, Parser)]
#[command(name = "rag")]
#[command(about = "Evaluate retrieval and answer generation over a question/passage dataset")]
pub struct Cli {
    /// Report format on stdout: text or json.
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Embed every unique passage and save the index file.
    Embed {
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        retriever: RetrieverArgs,
        /// Where to write the passage index (JSON Lines).
        #[arg(long)]
        index_file: PathBuf,
    },
    /// Score retrieval with precision, recall and hit rate.
    Eval {
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        retriever: RetrieverArgs,
        #[command(flatten)]
        search: SearchArgs,
        /// Reuse a passage index written by `rag embed` instead of re-embedding.
        #[arg(long)]
        index_file: Option<PathBuf>,
        /// Exit with an error when the hit rate falls below this value.
        #[arg(long, env = "RAG_MIN_HIT_RATE")]
        min_hit_rate: Option<f64>,
        /// Print one line per example.
        #[arg(long)]
        per_example: bool,
    },
    /// Retrieve, generate an answer per query, and score the answers.
    Generate {
        #[command(flatten)]
        dataset: DatasetArgs,
        #[command(flatten)]
        retriever: RetrieverArgs,
        #[command(flatten)]
        search: SearchArgs,
        #[command(flatten)]
        generator: GeneratorArgs,
        #[arg(long)]
        index_file: Option<PathBuf>,
    },
    /// Print the top-K passages for one question.
    Query {
        #[command(flatten)]
        retriever: RetrieverArgs,
        #[command(flatten)]
        search: SearchArgs,
        #[arg(long)]
        index_file: PathBuf,
        #[arg(long)]
        question: String,
    },
}

#[derive(Debug, Args)]
pub struct DatasetArgs {
    /// Dataset file (.jsonl, .csv, .parquet) or a directory holding test.<ext>.
    #[arg(long, env = "RAG_DATASET")]
    pub dataset: PathBuf,
    #[arg(long, default_value = DEFAULT_QUERY_COLUMN)]
    pub query_column: String,
    #[arg(long, default_value = DEFAULT_PASSAGE_COLUMN)]
    pub passage_column: String,
    #[arg(long, default_value = DEFAULT_ANSWER_COLUMN)]
    pub answer_column: String,
    /// Columns starting with this prefix hold ground-truth labels.
    #[arg(long, default_value = DEFAULT_LABEL_PREFIX)]
    pub label_prefix: String,
}

impl DatasetArgs {
    fn columns(&self) -> DatasetColumns {
        DatasetColumns {
            query: self.query_column.clone(),
            passage: self.passage_column.clone(),
            answer: self.answer_column.clone(),
            label_prefix: self.label_prefix.clone(),
        }
    }
}

#[derive(Debug, Args)]
pub struct RetrieverArgs {
    /// Retriever checkpoint directory (config.json, model.safetensors, tokenizer.json).
    /// Without it a token-hashing embedder is used.
    #[arg(long, env = "RAG_RETRIEVER_MODEL")]
    pub retriever_model: Option<PathBuf>,
    /// LoRA adapter directory merged into the retriever.
    #[arg(long, env = "RAG_RETRIEVER_ADAPTER")]
    pub retriever_adapter: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIM)]
    pub embed_dim: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_LENGTH)]
    pub max_length: usize,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// cpu, cuda, cuda:N or metal.
    #[arg(long, env = "RAG_DEVICE", default_value = "cpu")]
    pub device: DeviceSpec,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,
    /// Drop results scoring below this. 0 keeps everything.
    #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
    pub threshold: f32,
    /// hnsw or flat.
    #[arg(long, default_value = "hnsw")]
    pub index: IndexKind,
}

#[derive(Debug, Args)]
pub struct GeneratorArgs {
    /// Generator checkpoint directory.
    #[arg(long, env = "RAG_GENERATOR_MODEL")]
    pub generator_model: PathBuf,
    #[arg(long, env = "RAG_GENERATOR_ADAPTER")]
    pub generator_adapter: Option<PathBuf>,
    /// Prompt plus generated tokens.
    #[arg(long, default_value_t = DEFAULT_GENERATION_MAX_LENGTH)]
    pub gen_max_length: usize,
    #[arg(long, default_value_t = DEFAULT_GENERATION_TOP_K)]
    pub gen_top_k: usize,
    #[arg(long, default_value_t = 1)]
    pub num_return_sequences: usize,
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,
}

impl GeneratorArgs {
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            top_k: self.gen_top_k,
            num_return_sequences: self.num_return_sequences,
            max_length: self.gen_max_length,
            seed: self.seed,
        }
    }
}

pub fn run_config(
    dataset: Option<&DatasetArgs>,
    retriever: &RetrieverArgs,
    search: Option<&SearchArgs>,
) -> RunConfig {
    let mut config = RunConfig::new(dataset.map(|d| d.dataset.clone()).unwrap_or_default());
    if let Some(dataset) = dataset {
        config.columns = dataset.columns();
    }
    config.retriever_model = retriever.retriever_model.clone();
    config.retriever_adapter = retriever.retriever_adapter.clone();
    config.embed_dim = retriever.embed_dim;
    config.max_length = retriever.max_length;
    config.batch_size = retriever.batch_size;
    config.device = retriever.device;
    if let Some(search) = search {
        config.index = search.index;
        config.retrieval = RetrievalConfig {
            top_k: search.top_k,
            threshold: search.threshold,
        };
    }
    config
}
