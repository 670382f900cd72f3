use std::collections::HashSet;

use crate::error::{RagError, Result};
use crate::model::{DatasetRecord, Passage};

/// Unique passages in first-seen order. Position in the pool is the passage id
/// and the row of the embedding matrix, so the pool doubles as the identity map.
#[derive(Debug, Clone, Default)]
pub struct PassagePool {
    passages: Vec<Passage>,
}

impl PassagePool {
    /// Deduplicate passages by text; the first record carrying a text wins.
    pub fn from_records(records: &[DatasetRecord]) -> Result<Self> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(records.len());
        let mut passages = Vec::new();

        for record in records {
            if !seen.insert(record.passage.as_str()) {
                continue;
            }
            let label = record
                .primary_label()
                .map(str::to_string)
                .unwrap_or_else(|| record.passage.clone());
            passages.push(Passage {
                id: passages.len(),
                label,
                text: record.passage.clone(),
            });
        }

        Self::from_passages(passages)
    }

    /// Rows must be numbered 0..N-1 in order.
    pub fn from_passages(passages: Vec<Passage>) -> Result<Self> {
        if passages.is_empty() {
            return Err(RagError::Data("passage pool is empty".to_string()));
        }
        if let Some((row, p)) = passages.iter().enumerate().find(|(row, p)| p.id != *row) {
            return Err(RagError::Data(format!(
                "passage at row {row} has id {}; ids must be contiguous from 0",
                p.id
            )));
        }
        Ok(Self { passages })
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Passage> {
        self.passages.get(id)
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn texts(&self) -> Vec<&str> {
        self.passages.iter().map(|p| p.text.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(passage: &str, label: Option<&str>) -> DatasetRecord {
        let mut labels = BTreeMap::new();
        if let Some(label) = label {
            labels.insert("cat".to_string(), label.to_string());
        }
        DatasetRecord {
            query: format!("q-{passage}"),
            passage: passage.to_string(),
            answer: String::new(),
            labels,
        }
    }

    #[test]
    fn keeps_first_occurrence_of_duplicate_passages() {
        let records = vec![
            record("alpha", Some("A")),
            record("beta", Some("B")),
            record("alpha", Some("A2")),
            record("gamma", None),
        ];

        let pool = PassagePool::from_records(&records).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.texts(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(pool.get(0).unwrap().label, "A");
        assert_eq!(pool.get(2).unwrap().label, "gamma");
        for (row, passage) in pool.passages().iter().enumerate() {
            assert_eq!(passage.id, row);
        }
    }

    #[test]
    fn empty_pool_is_rejected() {
        assert!(matches!(
            PassagePool::from_records(&[]),
            Err(RagError::Data(_))
        ));
    }

    #[test]
    fn non_contiguous_ids_are_rejected() {
        let passages = vec![Passage {
            id: 3,
            label: "x".into(),
            text: "x".into(),
        }];
        assert!(PassagePool::from_passages(passages).is_err());
    }
}
