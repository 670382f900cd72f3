use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RetrievalConfig;
use crate::embed::EmbeddingProvider;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::metrics::{score_retrieval, RetrievalAverages, ScoreAccumulator};
use crate::model::{Example, RetrievedPassage};
use crate::pool::PassagePool;
use crate::retrieval::nearest_neighbours;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleOutcome {
    pub example: usize,
    pub query: String,
    pub retrieved: Vec<RetrievedPassage>,
    pub precision: f64,
    pub recall: f64,
    pub hit: bool,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSummary {
    pub top_k: usize,
    pub threshold: f32,
    pub total: usize,
    pub hits: usize,
    pub precision: f64,
    pub recall: f64,
    pub hit_rate: f64,
    pub outcomes: Vec<ExampleOutcome>,
}

impl RetrievalSummary {
    fn from_parts(
        config: &RetrievalConfig,
        averages: RetrievalAverages,
        outcomes: Vec<ExampleOutcome>,
    ) -> Self {
        Self {
            top_k: config.top_k,
            threshold: config.threshold,
            total: averages.examples,
            hits: averages.hits,
            precision: averages.precision,
            recall: averages.recall,
            hit_rate: averages.hit_rate,
            outcomes,
        }
    }

    pub fn total_latency_ms(&self) -> f64 {
        self.outcomes.iter().map(|o| o.latency_ms).sum()
    }
}

/// Embed every query, retrieve from `index`, and score against each example's own labels.
pub fn evaluate_retrieval<E>(
    embedder: &E,
    index: &dyn VectorIndex,
    pool: &PassagePool,
    examples: &[Example],
    config: &RetrievalConfig,
) -> Result<RetrievalSummary>
where
    E: EmbeddingProvider + ?Sized,
{
    let mut accumulator = ScoreAccumulator::new();
    let mut outcomes = Vec::with_capacity(examples.len());

    for (i, example) in examples.iter().enumerate() {
        let start = Instant::now();
        let query_embedding = embedder.embed(&example.query)?;
        let retrieved = nearest_neighbours(index, pool, &query_embedding, config)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let labels: Vec<&str> = retrieved.iter().map(|r| r.label.as_str()).collect();
        let score = score_retrieval(&labels, &example.correct_labels);
        accumulator.add(&score);
        debug!(
            example = i,
            retrieved = labels.len(),
            precision = score.precision,
            recall = score.recall,
            hit = score.hit,
            "scored example"
        );

        outcomes.push(ExampleOutcome {
            example: i,
            query: example.query.clone(),
            retrieved,
            precision: score.precision,
            recall: score.recall,
            hit: score.hit,
            latency_ms,
        });
    }

    let averages = accumulator.averages();
    info!(
        examples = averages.examples,
        precision = averages.precision,
        recall = averages.recall,
        hit_rate = averages.hit_rate,
        "retrieval evaluation finished"
    );
    Ok(RetrievalSummary::from_parts(config, averages, outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::embed_passages;
    use crate::config::IndexKind;
    use crate::index::{build_index, FlatIndex};
    use crate::model::Passage;
    use std::collections::{BTreeSet, HashMap};

    /// Fixed text -> vector table.
    struct TableEmbedder(HashMap<&'static str, Vec<f32>>);

    impl EmbeddingProvider for TableEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(self.0.get(text).cloned().unwrap_or_else(|| vec![0.0, 0.0, 1.0]))
        }

        fn dim(&self) -> usize {
            3
        }
    }

    fn clustered() -> (TableEmbedder, PassagePool) {
        let embedder = TableEmbedder(HashMap::from([
            ("passage A", vec![1.0, 0.05, 0.0]),
            ("passage B", vec![0.0, 1.0, 0.05]),
            ("passage C", vec![0.05, 0.0, 1.0]),
            ("query Q", vec![0.98, 0.1, 0.0]),
            ("query R", vec![0.1, 0.95, 0.0]),
        ]));
        let pool = PassagePool::from_passages(
            ["A", "B", "C"]
                .iter()
                .enumerate()
                .map(|(id, l)| Passage {
                    id,
                    label: l.to_string(),
                    text: format!("passage {l}"),
                })
                .collect(),
        )
        .unwrap();
        (embedder, pool)
    }

    fn example(query: &str, labels: &[&str]) -> Example {
        Example {
            query: query.to_string(),
            answer: String::new(),
            correct_labels: labels.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        }
    }

    #[test]
    fn nearest_cluster_scores_perfectly_at_k1() {
        let (embedder, pool) = clustered();
        let matrix = embed_passages(&embedder, &pool.texts(), 2).unwrap();
        let config = RetrievalConfig {
            top_k: 1,
            threshold: 0.0,
        };

        for kind in [IndexKind::Flat, IndexKind::Hnsw] {
            let index = build_index(kind, &matrix).unwrap();
            let summary =
                evaluate_retrieval(&embedder, index.as_ref(), &pool, &[example("query Q", &["A"])], &config)
                    .unwrap();

            assert_eq!(summary.total, 1);
            assert_eq!(summary.precision, 1.0);
            assert_eq!(summary.recall, 1.0);
            assert_eq!(summary.hit_rate, 1.0);
            assert_eq!(summary.outcomes[0].retrieved[0].label, "A");
        }
    }

    #[test]
    fn aggregates_over_examples() {
        let (embedder, pool) = clustered();
        let matrix = embed_passages(&embedder, &pool.texts(), 8).unwrap();
        let index = FlatIndex::build(&matrix).unwrap();
        let config = RetrievalConfig {
            top_k: 2,
            threshold: 0.0,
        };
        let examples = [
            // retrieves A then B: p = 0.5, r = 1
            example("query Q", &["A"]),
            // retrieves B then A: p = 0, r = 0
            example("query R", &["C"]),
            // no ground truth: recall 0 by convention
            example("query Q", &[]),
        ];

        let summary = evaluate_retrieval(&embedder, &index, &pool, &examples, &config).unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.hits, 1);
        assert!((summary.precision - 0.5 / 3.0).abs() < 1e-9);
        assert!((summary.recall - 1.0 / 3.0).abs() < 1e-9);
        assert!((summary.hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!(summary.outcomes.iter().all(|o| o.retrieved.len() == 2));
    }

    #[test]
    fn no_examples_yields_zeros() {
        let (embedder, pool) = clustered();
        let matrix = embed_passages(&embedder, &pool.texts(), 8).unwrap();
        let index = FlatIndex::build(&matrix).unwrap();

        let summary =
            evaluate_retrieval(&embedder, &index, &pool, &[], &RetrievalConfig::default()).unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.hit_rate, 0.0);
        assert_eq!(summary.total_latency_ms(), 0.0);
    }
}
