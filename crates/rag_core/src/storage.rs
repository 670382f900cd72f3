use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::batch::EmbeddingMatrix;
use crate::error::{RagError, Result};
use crate::model::Passage;
use crate::pool::PassagePool;

/// One line of a persisted passage index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexedPassage {
    id: usize,
    label: String,
    text: String,
    embedding: Vec<f32>,
}

pub fn save_index_jsonl(path: &Path, pool: &PassagePool, matrix: &EmbeddingMatrix) -> Result<()> {
    if pool.len() != matrix.rows() {
        return Err(RagError::Index(format!(
            "pool has {} passages but the matrix has {} rows",
            pool.len(),
            matrix.rows()
        )));
    }

    let mut writer = BufWriter::new(File::create(path)?);
    for passage in pool.passages() {
        let line = serde_json::to_string(&IndexedPassage {
            id: passage.id,
            label: passage.label.clone(),
            text: passage.text.clone(),
            embedding: matrix.row(passage.id),
        })?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    info!(path = %path.display(), passages = pool.len(), dim = matrix.dim(), "saved passage index");
    Ok(())
}

pub fn load_index_jsonl(path: &Path) -> Result<(PassagePool, EmbeddingMatrix)> {
    let reader = BufReader::new(File::open(path)?);
    let mut passages = Vec::new();
    let mut rows = Vec::new();

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: IndexedPassage = serde_json::from_str(&line).map_err(|e| {
            RagError::Data(format!("{} line {}: {e}", path.display(), n + 1))
        })?;
        if let Some(first) = rows.first().map(Vec::len) {
            if entry.embedding.len() != first {
                return Err(RagError::Data(format!(
                    "{} line {}: embedding has dimension {}, expected {first}",
                    path.display(),
                    n + 1,
                    entry.embedding.len()
                )));
            }
        }
        rows.push(entry.embedding);
        passages.push(Passage {
            id: entry.id,
            label: entry.label,
            text: entry.text,
        });
    }

    let pool = PassagePool::from_passages(passages)?;
    let matrix = EmbeddingMatrix::from_rows(&rows)?;
    info!(
        path = %path.display(),
        passages = pool.len(),
        dim = matrix.dim(),
        "loaded passage index"
    );
    Ok((pool, matrix))
}
