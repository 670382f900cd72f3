use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::datatypes::DataType;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::DatasetColumns;
use crate::error::{RagError, Result};
use crate::model::{DatasetRecord, Example};

const SPLIT_FILE_STEM: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    JsonLines,
    Csv,
    Parquet,
}

impl Format {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "jsonl" | "ndjson" => Ok(Format::JsonLines),
            "csv" => Ok(Format::Csv),
            "parquet" => Ok(Format::Parquet),
            other => Err(RagError::Config(format!(
                "unsupported dataset format '.{other}' (expected .jsonl, .csv or .parquet)"
            ))),
        }
    }
}

/// A directory is resolved to its `test.{jsonl,csv,parquet}` split.
fn resolve_dataset_file(path: &Path) -> Result<PathBuf> {
    if !path.is_dir() {
        if !path.exists() {
            return Err(RagError::Config(format!(
                "dataset not found: {}",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }

    ["jsonl", "csv", "parquet"]
        .iter()
        .map(|ext| path.join(format!("{SPLIT_FILE_STEM}.{ext}")))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| {
            RagError::Config(format!(
                "no {stem}.jsonl, {stem}.csv or {stem}.parquet in {}",
                path.display(),
                stem = SPLIT_FILE_STEM
            ))
        })
}

fn is_label_column(name: &str, columns: &DatasetColumns) -> bool {
    name.starts_with(&columns.label_prefix)
        && name != columns.query
        && name != columns.passage
        && name != columns.answer
}

/// Load every row of the dataset at `path`, keeping only the configured columns.
pub fn load_records(path: &Path, columns: &DatasetColumns) -> Result<Vec<DatasetRecord>> {
    let file = resolve_dataset_file(path)?;
    let records = match Format::from_path(&file)? {
        Format::JsonLines => read_jsonl(&file, columns)?,
        Format::Csv => read_csv(&file, columns)?,
        Format::Parquet => read_parquet(&file, columns)?,
    };

    if records.is_empty() {
        return Err(RagError::Data(format!(
            "dataset {} has no rows",
            file.display()
        )));
    }

    info!(path = %file.display(), rows = records.len(), "loaded dataset");
    Ok(records)
}

pub fn examples_from_records(records: &[DatasetRecord]) -> Vec<Example> {
    records.iter().map(Example::from).collect()
}

fn json_value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn read_jsonl(path: &Path, columns: &DatasetColumns) -> Result<Vec<DatasetRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: serde_json::Map<String, Value> = serde_json::from_str(&line)?;

        let field = |name: &str| -> Result<String> {
            let value = row.get(name).ok_or_else(|| {
                RagError::Data(format!("line {}: missing column '{name}'", line_no + 1))
            })?;
            Ok(json_value_to_string(value).unwrap_or_default())
        };

        let labels = row
            .iter()
            .filter(|(name, _)| is_label_column(name, columns))
            .filter_map(|(name, value)| {
                json_value_to_string(value)
                    .filter(|v| !v.is_empty())
                    .map(|v| (name.clone(), v))
            })
            .collect();

        records.push(DatasetRecord {
            query: field(&columns.query)?,
            passage: field(&columns.passage)?,
            answer: field(&columns.answer)?,
            labels,
        });
    }

    debug!(path = %path.display(), rows = records.len(), "read jsonl");
    Ok(records)
}

fn read_csv(path: &Path, columns: &DatasetColumns) -> Result<Vec<DatasetRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let position = |name: &str| -> Result<usize> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| RagError::Data(format!("missing column '{name}'")))
    };
    let query_idx = position(&columns.query)?;
    let passage_idx = position(&columns.passage)?;
    let answer_idx = position(&columns.answer)?;
    let label_idx: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| is_label_column(name, columns))
        .map(|(i, name)| (i, name.to_string()))
        .collect();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let cell = |i: usize| row.get(i).unwrap_or("").to_string();

        let labels: BTreeMap<String, String> = label_idx
            .iter()
            .filter_map(|(i, name)| {
                let value = cell(*i);
                (!value.is_empty()).then(|| (name.clone(), value))
            })
            .collect();

        records.push(DatasetRecord {
            query: cell(query_idx),
            passage: cell(passage_idx),
            answer: cell(answer_idx),
            labels,
        });
    }

    debug!(path = %path.display(), rows = records.len(), "read csv");
    Ok(records)
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<arrow::array::ArrayRef> {
    let column = batch
        .column_by_name(name)
        .ok_or_else(|| RagError::Data(format!("missing column '{name}'")))?;
    Ok(arrow::compute::cast(column, &DataType::Utf8)?)
}

fn read_parquet(path: &Path, columns: &DatasetColumns) -> Result<Vec<DatasetRecord>> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let label_names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .filter(|name| is_label_column(name, columns))
        .collect();
    let reader = builder.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;

        let query = string_column(&batch, &columns.query)?;
        let passage = string_column(&batch, &columns.passage)?;
        let answer = string_column(&batch, &columns.answer)?;
        let labels = label_names
            .iter()
            .map(|name| Ok((name.clone(), string_column(&batch, name)?)))
            .collect::<Result<Vec<_>>>()?;

        let query = query.as_string::<i32>();
        let passage = passage.as_string::<i32>();
        let answer = answer.as_string::<i32>();

        let value = |arr: &arrow::array::StringArray, i: usize| -> Option<String> {
            arr.is_valid(i).then(|| arr.value(i).to_string())
        };

        for i in 0..batch.num_rows() {
            let row_labels = labels
                .iter()
                .filter_map(|(name, col)| {
                    value(col.as_string::<i32>(), i)
                        .filter(|v| !v.is_empty())
                        .map(|v| (name.clone(), v))
                })
                .collect();

            records.push(DatasetRecord {
                query: value(query, i).unwrap_or_default(),
                passage: value(passage, i).unwrap_or_default(),
                answer: value(answer, i).unwrap_or_default(),
                labels: row_labels,
            });
        }
    }

    debug!(path = %path.display(), rows = records.len(), "read parquet");
    Ok(records)
}
