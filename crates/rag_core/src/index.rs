use hnsw_rs::prelude::*;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::batch::EmbeddingMatrix;
use crate::config::IndexKind;
use crate::error::{RagError, Result};
use crate::retrieval::cosine_similarity;

/// Links per node above layer 0. hnsw_rs doubles this for the base layer.
const HNSW_MAX_CONNECTIONS: usize = 16;
const HNSW_MAX_LAYERS: usize = 16;
const HNSW_EF_CONSTRUCTION: usize = 200;
/// Search beam width floor; the actual width is max(k * 2, this).
const MIN_EF_SEARCH: usize = 64;

/// Read-only similarity index over passage rows.
pub trait VectorIndex {
    /// Up to `k` `(row_id, score)` pairs, highest score first.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>>;

    fn len(&self) -> usize;

    fn dim(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_query(query: &[f32], dim: usize) -> Result<()> {
    if query.len() != dim {
        return Err(RagError::Index(format!(
            "query has dimension {}, index expects {dim}",
            query.len()
        )));
    }
    Ok(())
}

fn check_matrix(matrix: &EmbeddingMatrix) -> Result<()> {
    if matrix.rows() == 0 {
        return Err(RagError::Index("cannot build an index over zero passages".to_string()));
    }
    if let Some(row) = matrix.first_unfilled_row() {
        return Err(RagError::Index(format!(
            "embedding matrix row {row} was never written"
        )));
    }
    Ok(())
}

/// Exact cosine scan over every row.
pub struct FlatIndex {
    rows: Vec<Vec<f32>>,
    dim: usize,
}

impl FlatIndex {
    pub fn build(matrix: &EmbeddingMatrix) -> Result<Self> {
        check_matrix(matrix)?;
        Ok(Self {
            rows: matrix.iter_rows().collect(),
            dim: matrix.dim(),
        })
    }
}

impl VectorIndex for FlatIndex {
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        check_query(query, self.dim)?;
        let mut scored: Vec<(usize, f32)> = self
            .rows
            .par_iter()
            .enumerate()
            .map(|(id, row)| (id, cosine_similarity(query, row)))
            .collect();

        // ties broken by row id so results are stable
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Approximate index: HNSW graph with cosine distance.
///
/// Zero-norm rows stay out of the graph: hnsw_rs puts them at distance 0
/// from everything, while their cosine similarity is 0. They are scored 0
/// at search time instead, as [`FlatIndex`] does.
pub struct HnswIndex {
    inner: Hnsw<'static, f32, DistCosine>,
    /// Rows in the graph.
    inserted: usize,
    zero_rows: Vec<usize>,
    len: usize,
    dim: usize,
}

fn is_zero(v: &[f32]) -> bool {
    v.iter().all(|x| *x == 0.0)
}

impl HnswIndex {
    pub fn build(matrix: &EmbeddingMatrix) -> Result<Self> {
        check_matrix(matrix)?;
        let len = matrix.rows();
        let inner = Hnsw::<f32, DistCosine>::new(
            HNSW_MAX_CONNECTIONS,
            len,
            HNSW_MAX_LAYERS,
            HNSW_EF_CONSTRUCTION,
            DistCosine {},
        );
        let mut zero_rows = Vec::new();
        for (id, row) in matrix.iter_rows().enumerate() {
            if is_zero(&row) {
                zero_rows.push(id);
            } else {
                inner.insert_slice((row.as_slice(), id));
            }
        }
        if !zero_rows.is_empty() {
            warn!(rows = zero_rows.len(), "zero-norm passage embeddings kept out of the graph");
        }
        Ok(Self {
            inner,
            inserted: len - zero_rows.len(),
            zero_rows,
            len,
            dim: matrix.dim(),
        })
    }
}

impl VectorIndex for HnswIndex {
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>> {
        check_query(query, self.dim)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let k = k.min(self.len);
        if is_zero(query) {
            // every row scores 0, ties go to the lowest ids
            return Ok((0..k).map(|id| (id, 0.0)).collect());
        }

        let graph_k = k.min(self.inserted);
        let mut results: Vec<(usize, f32)> = if graph_k == 0 {
            Vec::new()
        } else {
            let ef_search = (graph_k * 2).max(MIN_EF_SEARCH);
            self.inner
                .search(query, graph_k, ef_search)
                .into_iter()
                // cosine distance = 1 - cosine similarity
                .map(|n| (n.d_id, 1.0 - n.distance))
                .collect()
        };
        results.extend(self.zero_rows.iter().map(|&id| (id, 0.0)));
        results.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Build the index once all passage rows are embedded.
pub fn build_index(kind: IndexKind, matrix: &EmbeddingMatrix) -> Result<Box<dyn VectorIndex>> {
    let index: Box<dyn VectorIndex> = match kind {
        IndexKind::Hnsw => Box::new(HnswIndex::build(matrix)?),
        IndexKind::Flat => Box::new(FlatIndex::build(matrix)?),
    };
    info!(kind = %kind, rows = index.len(), dim = index.dim(), "built passage index");
    Ok(index)
}
