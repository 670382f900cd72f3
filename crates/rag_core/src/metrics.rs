//! Retrieval and answer scoring.
//!
//! Conventions for degenerate inputs: an empty retrieved list has precision 0,
//! an empty ground-truth set has recall 0, and an empty corpus averages to 0.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExampleScore {
    pub precision: f64,
    pub recall: f64,
    pub hit: bool,
}

/// Score retrieved labels against the correct ones. Both sides are treated as sets.
pub fn score_retrieval<S: AsRef<str>>(retrieved: &[S], correct: &BTreeSet<String>) -> ExampleScore {
    let retrieved: BTreeSet<&str> = retrieved.iter().map(|s| s.as_ref()).collect();
    let overlap = retrieved
        .iter()
        .filter(|label| correct.contains(**label))
        .count();

    let precision = if retrieved.is_empty() {
        0.0
    } else {
        overlap as f64 / retrieved.len() as f64
    };
    let recall = if correct.is_empty() {
        0.0
    } else {
        overlap as f64 / correct.len() as f64
    };

    ExampleScore {
        precision,
        recall,
        hit: overlap > 0,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalAverages {
    pub examples: usize,
    pub hits: usize,
    pub precision: f64,
    pub recall: f64,
    pub hit_rate: f64,
}

/// Running sums over examples.
#[derive(Debug, Clone, Default)]
pub struct ScoreAccumulator {
    precision_sum: f64,
    recall_sum: f64,
    hits: usize,
    examples: usize,
}

impl ScoreAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, score: &ExampleScore) {
        self.precision_sum += score.precision;
        self.recall_sum += score.recall;
        self.hits += usize::from(score.hit);
        self.examples += 1;
    }

    pub fn averages(&self) -> RetrievalAverages {
        if self.examples == 0 {
            return RetrievalAverages::default();
        }
        let m = self.examples as f64;
        RetrievalAverages {
            examples: self.examples,
            hits: self.hits,
            precision: self.precision_sum / m,
            recall: self.recall_sum / m,
            hit_rate: self.hits as f64 / m,
        }
    }
}

/// Lower-case, drop punctuation and the articles a/an/the, collapse whitespace.
pub fn normalize_answer(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect();
    lowered
        .split_whitespace()
        .filter(|w| !matches!(*w, "a" | "an" | "the"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn exact_match(prediction: &str, truth: &str) -> bool {
    normalize_answer(prediction) == normalize_answer(truth)
}

/// Bag-of-tokens F1 between normalised strings. Two empty strings score 1.
pub fn token_f1(prediction: &str, truth: &str) -> f64 {
    let pred = normalize_answer(prediction);
    let gold = normalize_answer(truth);
    let pred_tokens: Vec<&str> = pred.split_whitespace().collect();
    let gold_tokens: Vec<&str> = gold.split_whitespace().collect();

    if pred_tokens.is_empty() || gold_tokens.is_empty() {
        return if pred_tokens.is_empty() && gold_tokens.is_empty() {
            1.0
        } else {
            0.0
        };
    }

    let mut gold_counts: HashMap<&str, usize> = HashMap::new();
    for t in &gold_tokens {
        *gold_counts.entry(*t).or_default() += 1;
    }
    let mut common = 0usize;
    for t in &pred_tokens {
        if let Some(count) = gold_counts.get_mut(t) {
            if *count > 0 {
                *count -= 1;
                common += 1;
            }
        }
    }
    if common == 0 {
        return 0.0;
    }

    let precision = common as f64 / pred_tokens.len() as f64;
    let recall = common as f64 / gold_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(labels: &[&str]) -> BTreeSet<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn partial_overlap() {
        let score = score_retrieval(&["A", "B", "C", "D"], &set(&["A", "E"]));
        assert!((score.precision - 0.25).abs() < 1e-12);
        assert!((score.recall - 0.5).abs() < 1e-12);
        assert!(score.hit);
    }

    #[test]
    fn empty_retrieved_has_zero_precision() {
        let score = score_retrieval::<&str>(&[], &set(&["A"]));
        assert_eq!(score.precision, 0.0);
        assert_eq!(score.recall, 0.0);
        assert!(!score.hit);
    }

    #[test]
    fn empty_ground_truth_has_zero_recall() {
        let score = score_retrieval(&["A"], &BTreeSet::new());
        assert_eq!(score.recall, 0.0);
        assert_eq!(score.precision, 0.0);
        assert!(!score.hit);
    }

    #[test]
    fn duplicate_retrieved_labels_count_once() {
        let score = score_retrieval(&["A", "A", "B"], &set(&["A"]));
        assert!((score.precision - 0.5).abs() < 1e-12);
        assert_eq!(score.recall, 1.0);
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let cases: [(&[&str], &[&str]); 4] = [
            (&["A"], &["A"]),
            (&["A", "B"], &["B", "C", "D"]),
            (&["X", "Y"], &["A"]),
            (&["A", "B", "C"], &["A", "B", "C"]),
        ];
        for (retrieved, correct) in cases {
            let s = score_retrieval(retrieved, &set(correct));
            assert!((0.0..=1.0).contains(&s.precision));
            assert!((0.0..=1.0).contains(&s.recall));
        }
    }

    #[test]
    fn averages_are_order_independent_means() {
        let scores = [
            ExampleScore { precision: 1.0, recall: 0.5, hit: true },
            ExampleScore { precision: 0.0, recall: 0.0, hit: false },
            ExampleScore { precision: 0.5, recall: 1.0, hit: true },
        ];

        let mut forward = ScoreAccumulator::new();
        scores.iter().for_each(|s| forward.add(s));
        let mut backward = ScoreAccumulator::new();
        scores.iter().rev().for_each(|s| backward.add(s));

        let a = forward.averages();
        assert_eq!(a, backward.averages());
        assert!((a.precision - 0.5).abs() < 1e-12);
        assert!((a.recall - 0.5).abs() < 1e-12);
        assert!((a.hit_rate - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(a.hits, 2);
    }

    #[test]
    fn empty_corpus_averages_to_zero() {
        assert_eq!(ScoreAccumulator::new().averages(), RetrievalAverages::default());
    }

    #[test]
    fn exact_match_ignores_case_punctuation_and_articles() {
        assert!(exact_match("The Eiffel Tower!", "eiffel tower"));
        assert!(exact_match("  an  apple ", "Apple."));
        assert!(!exact_match("Paris, France", "Paris"));
    }

    #[test]
    fn token_f1_counts_overlap() {
        assert_eq!(token_f1("Paris", "Paris"), 1.0);
        assert_eq!(token_f1("London", "Paris"), 0.0);
        let f1 = token_f1("in Paris France", "Paris");
        // precision 1/3, recall 1
        assert!((f1 - 0.5).abs() < 1e-12);
        assert_eq!(token_f1("", "the"), 1.0);
    }
}
