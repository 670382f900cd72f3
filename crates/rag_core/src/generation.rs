use std::time::Instant;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RetrievalConfig;
use crate::embed::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::eval::RetrievalSummary;
use crate::index::VectorIndex;
use crate::metrics::{exact_match, token_f1};
use crate::model::Example;
use crate::pool::PassagePool;
use crate::retrieval::nearest_neighbours;

pub const DEFAULT_GENERATION_TOP_K: usize = 10;
pub const DEFAULT_GENERATION_MAX_LENGTH: usize = 200;
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sample among the k most likely tokens. 0 or 1 means greedy.
    pub top_k: usize,
    pub num_return_sequences: usize,
    /// Prompt plus generated tokens.
    pub max_length: usize,
    pub seed: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_GENERATION_TOP_K,
            num_return_sequences: 1,
            max_length: DEFAULT_GENERATION_MAX_LENGTH,
            seed: DEFAULT_SEED,
        }
    }
}

impl SamplingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_return_sequences == 0 {
            return Err(RagError::Config(
                "num_return_sequences must be > 0".to_string(),
            ));
        }
        if self.max_length == 0 {
            return Err(RagError::Config("generation max length must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Produces continuations of a prompt. Returned strings exclude the prompt.
pub trait TextGenerator {
    fn generate(&self, prompt: &str, sampling: &SamplingConfig) -> Result<Vec<String>>;
}

impl TextGenerator for Box<dyn TextGenerator> {
    fn generate(&self, prompt: &str, sampling: &SamplingConfig) -> Result<Vec<String>> {
        (**self).generate(prompt, sampling)
    }
}

pub fn format_prompt(query: &str, passage: &str) -> String {
    format!("#query# {query} #passage# {passage} #answer# ")
}

/// Pick a token id from `logits`, restricted to the `top_k` highest.
pub fn sample_top_k<R: Rng + ?Sized>(logits: &[f32], top_k: usize, rng: &mut R) -> Result<u32> {
    if logits.is_empty() {
        return Err(RagError::Generation("empty logits".to_string()));
    }

    let mut ranked: Vec<(usize, f32)> = logits
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .collect();
    if ranked.is_empty() {
        return Err(RagError::Generation("all logits are non-finite".to_string()));
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    if top_k <= 1 {
        return Ok(ranked[0].0 as u32);
    }
    ranked.truncate(top_k);

    let max = ranked[0].1;
    let weights: Vec<f32> = ranked.iter().map(|(_, l)| (l - max).exp()).collect();
    let dist = WeightedIndex::new(&weights)
        .map_err(|e| RagError::Generation(format!("sampling weights: {e}")))?;
    Ok(ranked[dist.sample(rng)].0 as u32)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutcome {
    pub example: usize,
    pub query: String,
    pub passage_id: Option<usize>,
    pub expected: String,
    pub generated: Vec<String>,
    pub exact_match: bool,
    pub f1: f64,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub total: usize,
    pub exact_matches: usize,
    pub exact_match_rate: f64,
    pub mean_f1: f64,
    pub outcomes: Vec<GenerationOutcome>,
}

/// For every example: retrieve the best passage, prompt the generator, score
/// its best sequence against the reference answer.
pub fn evaluate_generation<E, G>(
    embedder: &E,
    index: &dyn VectorIndex,
    pool: &PassagePool,
    examples: &[Example],
    retrieval: &RetrievalConfig,
    generator: &G,
    sampling: &SamplingConfig,
) -> Result<GenerationSummary>
where
    E: EmbeddingProvider + ?Sized,
    G: TextGenerator + ?Sized,
{
    generate_and_score(pool, examples, generator, sampling, |example| {
        let query_embedding = embedder.embed(&example.query)?;
        Ok(nearest_neighbours(index, pool, &query_embedding, retrieval)?
            .into_iter()
            .next()
            .map(|r| r.passage_id))
    })
}

/// Same as [`evaluate_generation`], but takes each example's passage from an
/// earlier retrieval run over the same examples instead of embedding the
/// queries again.
pub fn evaluate_generation_with<G>(
    retrieval: &RetrievalSummary,
    pool: &PassagePool,
    examples: &[Example],
    generator: &G,
    sampling: &SamplingConfig,
) -> Result<GenerationSummary>
where
    G: TextGenerator + ?Sized,
{
    if retrieval.outcomes.len() != examples.len() {
        return Err(RagError::Data(format!(
            "retrieval covers {} examples, generation was given {}",
            retrieval.outcomes.len(),
            examples.len()
        )));
    }
    let mut outcomes = retrieval.outcomes.iter();
    generate_and_score(pool, examples, generator, sampling, |_| {
        Ok(outcomes
            .next()
            .and_then(|o| o.retrieved.first())
            .map(|r| r.passage_id))
    })
}

fn generate_and_score<G, F>(
    pool: &PassagePool,
    examples: &[Example],
    generator: &G,
    sampling: &SamplingConfig,
    mut top_passage: F,
) -> Result<GenerationSummary>
where
    G: TextGenerator + ?Sized,
    F: FnMut(&Example) -> Result<Option<usize>>,
{
    sampling.validate()?;
    let mut outcomes = Vec::with_capacity(examples.len());

    for (i, example) in examples.iter().enumerate() {
        let start = Instant::now();
        let passage = top_passage(example)?.and_then(|id| pool.get(id));
        let prompt = format_prompt(&example.query, passage.map(|p| p.text.as_str()).unwrap_or(""));

        let generated = generator.generate(&prompt, sampling)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let exact = generated.iter().any(|g| exact_match(g, &example.answer));
        let f1 = generated
            .iter()
            .map(|g| token_f1(g, &example.answer))
            .fold(0.0, f64::max);
        debug!(example = i, exact, f1, "scored generated answer");

        outcomes.push(GenerationOutcome {
            example: i,
            query: example.query.clone(),
            passage_id: passage.map(|p| p.id),
            expected: example.answer.clone(),
            generated,
            exact_match: exact,
            f1,
            latency_ms,
        });
    }

    let total = outcomes.len();
    let exact_matches = outcomes.iter().filter(|o| o.exact_match).count();
    let (exact_match_rate, mean_f1) = if total == 0 {
        (0.0, 0.0)
    } else {
        (
            exact_matches as f64 / total as f64,
            outcomes.iter().map(|o| o.f1).sum::<f64>() / total as f64,
        )
    };
    info!(total, exact_matches, mean_f1, "generation evaluation finished");

    Ok(GenerationSummary {
        total,
        exact_matches,
        exact_match_rate,
        mean_f1,
        outcomes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::embed_passages;
    use crate::embed::HashEmbeddingProvider;
    use crate::eval::evaluate_retrieval;
    use crate::index::FlatIndex;
    use crate::model::Passage;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::{Cell, RefCell};

    /// Answers with the first word after "#passage#", and remembers prompts.
    struct FirstPassageWord {
        prompts: RefCell<Vec<String>>,
    }

    impl TextGenerator for FirstPassageWord {
        fn generate(&self, prompt: &str, _sampling: &SamplingConfig) -> Result<Vec<String>> {
            self.prompts.borrow_mut().push(prompt.to_string());
            let word = prompt
                .split("#passage#")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .unwrap_or("")
                .to_string();
            Ok(vec![word])
        }
    }

    #[test]
    fn prompt_layout() {
        assert_eq!(
            format_prompt("who?", "Ada wrote it."),
            "#query# who? #passage# Ada wrote it. #answer# "
        );
    }

    #[test]
    fn greedy_picks_argmax() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_top_k(&[0.1, 3.0, 2.0], 1, &mut rng).unwrap(), 1);
        assert_eq!(sample_top_k(&[0.1, 3.0, 2.0], 0, &mut rng).unwrap(), 1);
    }

    #[test]
    fn top_k_never_samples_outside_the_top() {
        let mut rng = StdRng::seed_from_u64(7);
        let logits = [5.0, 4.9, -10.0, 4.8, f32::NEG_INFINITY];
        for _ in 0..200 {
            let id = sample_top_k(&logits, 2, &mut rng).unwrap();
            assert!(id == 0 || id == 1, "sampled {id}");
        }
    }

    #[test]
    fn sampling_is_reproducible_with_seed() {
        let logits: Vec<f32> = (0..50).map(|i| (i as f32 * 0.37).sin()).collect();
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..20)
                .map(|_| sample_top_k(&logits, 10, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(3), draw(3));
    }

    #[test]
    fn empty_logits_error() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample_top_k(&[], 5, &mut rng).is_err());
    }

    #[test]
    fn evaluates_generated_answers_against_reference() {
        let embedder = HashEmbeddingProvider::new(256);
        let pool = PassagePool::from_passages(vec![
            Passage {
                id: 0,
                label: "paris".into(),
                text: "Paris is the capital of France".into(),
            },
            Passage {
                id: 1,
                label: "everest".into(),
                text: "Everest is the highest mountain".into(),
            },
        ])
        .unwrap();
        let matrix = embed_passages(&embedder, &pool.texts(), 8).unwrap();
        let index = FlatIndex::build(&matrix).unwrap();
        let examples = vec![
            Example {
                query: "capital of France".into(),
                answer: "Paris".into(),
                correct_labels: ["paris".to_string()].into(),
            },
            Example {
                query: "highest mountain".into(),
                answer: "Mount Everest".into(),
                correct_labels: ["everest".to_string()].into(),
            },
        ];
        let generator = FirstPassageWord {
            prompts: RefCell::new(Vec::new()),
        };

        let summary = evaluate_generation(
            &embedder,
            &index,
            &pool,
            &examples,
            &RetrievalConfig::default(),
            &generator,
            &SamplingConfig::default(),
        )
        .unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.exact_matches, 1);
        assert!((summary.exact_match_rate - 0.5).abs() < 1e-12);
        // second example: "Everest" vs "Mount Everest" -> p 1, r 0.5
        assert!((summary.outcomes[1].f1 - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.outcomes[0].passage_id, Some(0));
        assert!(generator.prompts.borrow()[0].starts_with("#query# capital of France #passage# Paris"));
    }

    /// Embeds by counting calls, so a second pass over the queries shows up.
    struct CountingEmbedder {
        inner: HashEmbeddingProvider,
        calls: Cell<usize>,
    }

    impl EmbeddingProvider for CountingEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.set(self.calls.get() + 1);
            self.inner.embed(text)
        }

        fn dim(&self) -> usize {
            self.inner.dim()
        }
    }

    #[test]
    fn reuses_retrieval_results_without_embedding_again() {
        let embedder = CountingEmbedder {
            inner: HashEmbeddingProvider::new(128),
            calls: Cell::new(0),
        };
        let pool = PassagePool::from_passages(vec![
            Passage {
                id: 0,
                label: "rome".into(),
                text: "Rome is the capital of Italy".into(),
            },
            Passage {
                id: 1,
                label: "nile".into(),
                text: "Nile is the longest river".into(),
            },
        ])
        .unwrap();
        let matrix = embed_passages(&embedder.inner, &pool.texts(), 8).unwrap();
        let index = FlatIndex::build(&matrix).unwrap();
        let examples = vec![
            Example {
                query: "longest river".into(),
                answer: "Nile".into(),
                correct_labels: ["nile".to_string()].into(),
            },
            Example {
                query: "capital of Italy".into(),
                answer: "Rome".into(),
                correct_labels: ["rome".to_string()].into(),
            },
        ];
        let config = RetrievalConfig::default();
        let retrieval = evaluate_retrieval(&embedder, &index, &pool, &examples, &config).unwrap();
        assert_eq!(embedder.calls.get(), 2);

        let generator = FirstPassageWord {
            prompts: RefCell::new(Vec::new()),
        };
        let summary = evaluate_generation_with(
            &retrieval,
            &pool,
            &examples,
            &generator,
            &SamplingConfig::default(),
        )
        .unwrap();

        assert_eq!(embedder.calls.get(), 2);
        assert_eq!(summary.exact_matches, 2);
        assert_eq!(summary.outcomes[0].passage_id, Some(1));
        assert_eq!(summary.outcomes[1].passage_id, Some(0));

        let err = evaluate_generation_with(
            &retrieval,
            &pool,
            &examples[..1],
            &generator,
            &SamplingConfig::default(),
        );
        assert!(matches!(err, Err(RagError::Data(_))));
    }

    #[test]
    fn zero_sequences_is_config_error() {
        let sampling = SamplingConfig {
            num_return_sequences: 0,
            ..SamplingConfig::default()
        };
        assert!(matches!(sampling.validate(), Err(RagError::Config(_))));
    }
}
