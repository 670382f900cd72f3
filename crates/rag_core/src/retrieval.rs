use crate::config::RetrievalConfig;
use crate::error::{RagError, Result};
use crate::index::VectorIndex;
use crate::model::RetrievedPassage;
use crate::pool::PassagePool;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let (dot, na, nb) = a
        .iter()
        .zip(b.iter())
        .fold((0.0f32, 0.0f32, 0.0f32), |(d, aa, bb), (x, y)| {
            (d + (x * y), aa + (x * x), bb + (y * y))
        });

    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na.sqrt() * nb.sqrt())
    }
}

/// Top-k passages for a query embedding, resolved through the pool.
///
/// A threshold of 0.0 or below disables filtering, so negative cosine scores
/// are still returned; a positive threshold drops every result scoring below it.
pub fn nearest_neighbours(
    index: &dyn VectorIndex,
    pool: &PassagePool,
    query_embedding: &[f32],
    config: &RetrievalConfig,
) -> Result<Vec<RetrievedPassage>> {
    let hits = index.search(query_embedding, config.top_k)?;

    hits.into_iter()
        .filter(|(_, score)| config.threshold <= 0.0 || *score >= config.threshold)
        .map(|(row, score)| {
            let passage = pool.get(row).ok_or_else(|| {
                RagError::Index(format!(
                    "index returned row {row} but the pool has {} passages",
                    pool.len()
                ))
            })?;
            Ok(RetrievedPassage {
                passage_id: passage.id,
                label: passage.label.clone(),
                score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::EmbeddingMatrix;
    use crate::index::FlatIndex;
    use crate::model::Passage;

    fn pool(labels: &[&str]) -> PassagePool {
        PassagePool::from_passages(
            labels
                .iter()
                .enumerate()
                .map(|(id, l)| Passage {
                    id,
                    label: l.to_string(),
                    text: format!("text {l}"),
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn cosine_works_for_unit_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&a, &c) - 0.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[test]
    fn maps_rows_to_labels_in_rank_order() {
        let matrix =
            EmbeddingMatrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.8, 0.6]]).unwrap();
        let index = FlatIndex::build(&matrix).unwrap();
        let pool = pool(&["A", "B", "C"]);
        let config = RetrievalConfig {
            top_k: 2,
            threshold: 0.0,
        };

        let results = nearest_neighbours(&index, &pool, &[1.0, 0.0], &config).unwrap();
        let labels: Vec<&str> = results.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["A", "C"]);
    }

    #[test]
    fn positive_threshold_filters_low_scores() {
        let matrix = EmbeddingMatrix::from_rows(&[vec![1.0, 0.0], vec![-1.0, 0.1]]).unwrap();
        let index = FlatIndex::build(&matrix).unwrap();
        let pool = pool(&["A", "B"]);

        let all = nearest_neighbours(
            &index,
            &pool,
            &[1.0, 0.0],
            &RetrievalConfig {
                top_k: 5,
                threshold: 0.0,
            },
        )
        .unwrap();
        assert_eq!(all.len(), 2);

        let filtered = nearest_neighbours(
            &index,
            &pool,
            &[1.0, 0.0],
            &RetrievalConfig {
                top_k: 5,
                threshold: 0.5,
            },
        )
        .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].label, "A");
    }
}
