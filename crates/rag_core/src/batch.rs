use std::time::Instant;

use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::embed::EmbeddingProvider;
use crate::error::{RagError, Result};

/// Dense (N, D) passage embeddings. Row `i` belongs to passage id `i`.
#[derive(Debug, Clone)]
pub struct EmbeddingMatrix {
    data: DMatrix<f32>,
    filled: Vec<bool>,
}

impl EmbeddingMatrix {
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            data: DMatrix::zeros(rows, dim),
            filled: vec![false; rows],
        }
    }

    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        let mut matrix = Self::zeros(rows.len(), dim);
        matrix.write_rows(0, rows)?;
        Ok(matrix)
    }

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn dim(&self) -> usize {
        self.data.ncols()
    }

    pub fn row(&self, i: usize) -> Vec<f32> {
        self.data.row(i).iter().copied().collect()
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = Vec<f32>> + '_ {
        (0..self.rows()).map(|i| self.row(i))
    }

    /// Write `values` into rows `start..start + values.len()`.
    pub fn write_rows(&mut self, start: usize, values: &[Vec<f32>]) -> Result<()> {
        let end = start + values.len();
        if end > self.rows() {
            return Err(RagError::Index(format!(
                "rows {start}..{end} out of bounds for matrix with {} rows",
                self.rows()
            )));
        }
        for (offset, value) in values.iter().enumerate() {
            if value.len() != self.dim() {
                return Err(RagError::Index(format!(
                    "row {} has dimension {}, expected {}",
                    start + offset,
                    value.len(),
                    self.dim()
                )));
            }
            let row = start + offset;
            for (col, x) in value.iter().enumerate() {
                self.data[(row, col)] = *x;
            }
            self.filled[row] = true;
        }
        Ok(())
    }

    pub fn is_fully_populated(&self) -> bool {
        self.filled.iter().all(|f| *f)
    }

    pub fn first_unfilled_row(&self) -> Option<usize> {
        self.filled.iter().position(|f| !*f)
    }
}

/// Embed `texts` in contiguous batches of at most `batch_size`, preserving order.
pub fn embed_passages<E>(embedder: &E, texts: &[&str], batch_size: usize) -> Result<EmbeddingMatrix>
where
    E: EmbeddingProvider + ?Sized,
{
    if batch_size == 0 {
        return Err(RagError::Config("batch size must be > 0".to_string()));
    }

    let num_passages = texts.len();
    let num_batches = num_passages.div_ceil(batch_size);
    let mut matrix = EmbeddingMatrix::zeros(num_passages, embedder.dim());
    let start_time = Instant::now();

    for (step, batch) in texts.chunks(batch_size).enumerate() {
        let embeddings = embedder.embed_batch(batch)?;
        if embeddings.len() != batch.len() {
            return Err(RagError::Index(format!(
                "batch {step}: embedder returned {} vectors for {} passages",
                embeddings.len(),
                batch.len()
            )));
        }

        let start_index = step * batch_size;
        let end_index = (start_index + batch_size).min(num_passages);
        matrix.write_rows(start_index, &embeddings[..end_index - start_index])?;
        debug!(step = step + 1, num_batches, start_index, end_index, "embedded batch");
    }

    info!(
        passages = num_passages,
        dim = matrix.dim(),
        batches = num_batches,
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "embedded passage pool"
    );
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbeddingProvider;
    use std::cell::RefCell;

    /// Records batch sizes and returns a one-hot vector per position.
    struct RecordingEmbedder {
        dim: usize,
        batches: RefCell<Vec<usize>>,
    }

    impl EmbeddingProvider for RecordingEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0; self.dim];
            v[text.len() % self.dim] = 1.0;
            Ok(v)
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            self.batches.borrow_mut().push(texts.len());
            texts.iter().map(|t| self.embed(t)).collect()
        }

        fn dim(&self) -> usize {
            self.dim
        }
    }

    #[test]
    fn last_partial_batch_is_clamped() {
        let texts: Vec<String> = (0..10).map(|i| "x".repeat(i + 1)).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let embedder = RecordingEmbedder {
            dim: 16,
            batches: RefCell::new(Vec::new()),
        };

        let matrix = embed_passages(&embedder, &refs, 8).unwrap();

        assert_eq!(*embedder.batches.borrow(), vec![8, 2]);
        assert_eq!(matrix.rows(), 10);
        assert!(matrix.is_fully_populated());
        for row in matrix.iter_rows() {
            assert!(row.iter().any(|x| *x != 0.0), "found an all-zero row");
        }
        assert_eq!(matrix.row(9), embedder.embed(refs[9]).unwrap());
    }

    #[test]
    fn order_matches_input() {
        let embedder = HashEmbeddingProvider::new(32);
        let texts = ["alpha beta", "gamma", "delta epsilon", "zeta"];

        let matrix = embed_passages(&embedder, &texts, 3).unwrap();
        for (i, text) in texts.iter().enumerate() {
            assert_eq!(matrix.row(i), embedder.embed(text).unwrap());
        }
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let embedder = HashEmbeddingProvider::new(8);
        assert!(matches!(
            embed_passages(&embedder, &["a"], 0),
            Err(RagError::Config(_))
        ));
    }

    #[test]
    fn write_out_of_bounds_is_rejected() {
        let mut matrix = EmbeddingMatrix::zeros(2, 2);
        assert!(matrix.write_rows(1, &[vec![1.0, 0.0], vec![0.0, 1.0]]).is_err());
        assert_eq!(matrix.first_unfilled_row(), Some(0));
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let mut matrix = EmbeddingMatrix::zeros(1, 3);
        assert!(matrix.write_rows(0, &[vec![1.0]]).is_err());
        assert!(!matrix.is_fully_populated());
    }
}
