use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// One row of the input dataset after column selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub query: String,
    pub passage: String,
    pub answer: String,
    /// Label column name -> value, only for label-prefixed columns with a non-empty value.
    pub labels: BTreeMap<String, String>,
}

impl DatasetRecord {
    /// Label of the lexicographically first label column, if any.
    pub fn primary_label(&self) -> Option<&str> {
        self.labels.values().next().map(String::as_str)
    }
}

/// A query with its reference answer and the labels of the passages that answer it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub query: String,
    pub answer: String,
    pub correct_labels: BTreeSet<String>,
}

impl From<&DatasetRecord> for Example {
    fn from(record: &DatasetRecord) -> Self {
        Self {
            query: record.query.clone(),
            answer: record.answer.clone(),
            correct_labels: record.labels.values().cloned().collect(),
        }
    }
}

/// A unique passage. `id` is its row in the embedding matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: usize,
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub passage_id: usize,
    pub label: String,
    pub score: f32,
}
