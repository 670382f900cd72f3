use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eval::RetrievalSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    LoadingModels,
    Evaluating,
    Completed,
    Failed,
}

/// Lifecycle of one evaluation run, from model loading to the hit-rate gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRun {
    pub run_id: String,
    pub dataset: String,
    pub retriever: String,
    pub top_k: usize,
    pub min_hit_rate: Option<f64>,
    pub status: RunStatus,
    pub requested_at: DateTime<Utc>,
    pub models_ready_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_examples: Option<usize>,
    pub hits: Option<usize>,
    pub hit_rate: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub error: Option<String>,
}

impl EvaluationRun {
    pub fn start(
        run_id: impl Into<String>,
        dataset: impl Into<String>,
        retriever: impl Into<String>,
        top_k: usize,
        min_hit_rate: Option<f64>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            dataset: dataset.into(),
            retriever: retriever.into(),
            top_k,
            min_hit_rate,
            status: RunStatus::LoadingModels,
            requested_at: Utc::now(),
            models_ready_at: None,
            completed_at: None,
            total_examples: None,
            hits: None,
            hit_rate: None,
            precision: None,
            recall: None,
            error: None,
        }
    }

    pub fn on_models_ready(&mut self) {
        if self.status != RunStatus::LoadingModels {
            return;
        }
        self.status = RunStatus::Evaluating;
        self.models_ready_at = Some(Utc::now());
    }

    pub fn on_models_failed(&mut self, reason: impl Into<String>) {
        if self.status != RunStatus::LoadingModels {
            return;
        }
        self.status = RunStatus::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn on_eval_completed(&mut self, summary: &RetrievalSummary) {
        if self.status != RunStatus::Evaluating {
            return;
        }
        self.total_examples = Some(summary.total);
        self.hits = Some(summary.hits);
        self.hit_rate = Some(summary.hit_rate);
        self.precision = Some(summary.precision);
        self.recall = Some(summary.recall);
        self.completed_at = Some(Utc::now());

        if self.meets_threshold() {
            self.status = RunStatus::Completed;
            self.error = None;
        } else {
            self.status = RunStatus::Failed;
            self.error = Some("hit_rate_below_required".to_string());
        }
    }

    /// True when no gate is set, or the measured hit rate reaches it.
    pub fn meets_threshold(&self) -> bool {
        match self.min_hit_rate {
            None => true,
            Some(required) => self.hit_rate.unwrap_or(0.0) >= required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(hits: usize, total: usize) -> RetrievalSummary {
        let hit_rate = if total == 0 { 0.0 } else { hits as f64 / total as f64 };
        RetrievalSummary {
            top_k: 5,
            threshold: 0.0,
            total,
            hits,
            precision: 0.2,
            recall: hit_rate,
            hit_rate,
            outcomes: Vec::new(),
        }
    }

    #[test]
    fn completes_when_gate_is_met() {
        let mut run = EvaluationRun::start("r1", "data.jsonl", "hash", 5, Some(0.5));
        run.on_models_ready();
        assert_eq!(run.status, RunStatus::Evaluating);

        run.on_eval_completed(&summary(3, 4));
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.meets_threshold());
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn fails_below_gate() {
        let mut run = EvaluationRun::start("r2", "data.jsonl", "hash", 5, Some(0.9));
        run.on_models_ready();
        run.on_eval_completed(&summary(1, 4));

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("hit_rate_below_required"));
        assert!(!run.meets_threshold());
    }

    #[test]
    fn no_gate_always_passes() {
        let mut run = EvaluationRun::start("r3", "data.jsonl", "hash", 5, None);
        run.on_models_ready();
        run.on_eval_completed(&summary(0, 4));
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[test]
    fn model_failure_is_terminal() {
        let mut run = EvaluationRun::start("r4", "data.jsonl", "bert", 5, None);
        run.on_models_failed("retriever checkpoint missing");
        run.on_models_ready();
        run.on_eval_completed(&summary(4, 4));

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("retriever checkpoint missing"));
        assert!(run.total_examples.is_none());
    }
}
