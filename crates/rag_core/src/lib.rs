pub mod adapter;
pub mod batch;
pub mod bert_embed;
pub mod config;
pub mod dataset;
pub mod embed;
pub mod error;
pub mod eval;
pub mod generation;
pub mod index;
pub mod metrics;
pub mod model;
pub mod orchestration;
pub mod pipeline;
pub mod pool;
pub mod qwen3_generate;
pub mod retrieval;
pub mod storage;

pub use adapter::{AdapterConfig, LoraAdapter};
pub use batch::{embed_passages, EmbeddingMatrix};
pub use bert_embed::BertEmbeddingProvider;
pub use config::{
    DatasetColumns, DeviceSpec, IndexKind, ModelFiles, RetrievalConfig, RunConfig,
    DEFAULT_ANSWER_COLUMN, DEFAULT_BATCH_SIZE, DEFAULT_EMBEDDING_DIM, DEFAULT_LABEL_PREFIX,
    DEFAULT_MAX_LENGTH, DEFAULT_PASSAGE_COLUMN, DEFAULT_QUERY_COLUMN, DEFAULT_THRESHOLD,
    DEFAULT_TOP_K,
};
pub use dataset::{examples_from_records, load_records};
pub use embed::{EmbeddingProvider, HashEmbeddingProvider};
pub use error::{RagError, Result};
pub use eval::{evaluate_retrieval, ExampleOutcome, RetrievalSummary};
pub use generation::{
    evaluate_generation, evaluate_generation_with, format_prompt, GenerationOutcome,
    GenerationSummary, SamplingConfig, TextGenerator, DEFAULT_GENERATION_MAX_LENGTH, DEFAULT_GENERATION_TOP_K, DEFAULT_SEED,
};
pub use index::{build_index, FlatIndex, HnswIndex, VectorIndex};
pub use metrics::{exact_match, score_retrieval, token_f1, ExampleScore, ScoreAccumulator};
pub use model::{DatasetRecord, Example, Passage, RetrievedPassage};
pub use orchestration::{EvaluationRun, RunStatus};
pub use pipeline::{
    check_matrix_dim, embed_and_index, load_embedder, load_generator, prepare_dataset,
    retriever_name, PreparedDataset,
};
pub use pool::PassagePool;
pub use qwen3_generate::Qwen3Generator;
pub use retrieval::{cosine_similarity, nearest_neighbours};
pub use storage::{load_index_jsonl, save_index_jsonl};
