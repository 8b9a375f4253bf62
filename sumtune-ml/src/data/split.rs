//! In-memory dataset splits with index selection and seeded proportional splitting.

use crate::error::TuneError;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;

/// Tolerance applied before rounding the carved size up, so `0.1 * 30` yields 3, not 4.
const SIZE_EPSILON: f64 = 1e-9;

/// Rows of one named split. Every row has one cell per column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSplit {
    columns: Vec<String>,
    rows: Vec<Vec<serde_json::Value>>,
}

impl DataSplit {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, serde_json::Value::Null);
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Build from JSON objects; columns come from the first object.
    pub fn from_records(records: Vec<serde_json::Value>) -> Self {
        let columns: Vec<String> = match records.first() {
            Some(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
            Some(_) => vec!["value".to_string()],
            None => return Self::default(),
        };
        let rows = records
            .iter()
            .map(|item| match item {
                serde_json::Value::Object(_) => columns
                    .iter()
                    .map(|col| item.get(col).cloned().unwrap_or(serde_json::Value::Null))
                    .collect(),
                other => vec![other.clone()],
            })
            .collect();
        Self::new(columns, rows)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Rows in `range`, clamped to the split's length. Order is preserved.
    pub fn select(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        Self {
            columns: self.columns.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// Keep at most the first `n` rows.
    pub fn truncate(&mut self, n: usize) {
        self.rows.truncate(n);
    }

    /// Seeded random split into `(train, test)`.
    ///
    /// The test side holds `ceil(test_size * len)` rows taken from the front of a seeded
    /// permutation; the train side holds the rest.
    pub fn train_test_split(&self, test_size: f64, seed: u64) -> Result<(Self, Self), TuneError> {
        if !(test_size > 0.0 && test_size < 1.0) {
            return Err(TuneError::invalid_input(format!(
                "test_size must be strictly between 0 and 1, got {test_size}"
            )));
        }
        let n = self.rows.len();
        let n_test = test_split_size(test_size, n);
        if n_test == 0 || n_test >= n {
            return Err(TuneError::invalid_input(format!(
                "test_size {test_size} over {n} rows leaves an empty split"
            )));
        }

        let mut permutation: Vec<usize> = (0..n).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        permutation.shuffle(&mut rng);

        let pick = |indices: &[usize]| Self {
            columns: self.columns.clone(),
            rows: indices.iter().map(|&i| self.rows[i].clone()).collect(),
        };
        let test = pick(&permutation[..n_test]);
        let train = pick(&permutation[n_test..]);
        Ok((train, test))
    }

    /// Column values as strings. Null or non-string cells are rejected.
    pub fn string_column(&self, name: &str) -> Result<Vec<String>, TuneError> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| {
                TuneError::dataset(format!(
                    "column '{name}' not found (available: {})",
                    self.columns.join(", ")
                ))
            })?;
        self.rows
            .iter()
            .enumerate()
            .map(|(row, cells)| match &cells[idx] {
                serde_json::Value::String(s) => Ok(s.clone()),
                other => Err(TuneError::dataset(format!(
                    "column '{name}' row {row}: expected a string, got {other}"
                ))),
            })
            .collect()
    }
}

/// Rows in the test side of a `test_size` split over `n` rows.
pub fn test_split_size(test_size: f64, n: usize) -> usize {
    let raw = test_size * n as f64 - SIZE_EPSILON;
    raw.ceil().max(0.0) as usize
}

/// Named splits of one dataset, e.g. `train` / `validation` / `test`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetDict {
    splits: BTreeMap<String, DataSplit>,
}

impl DatasetDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_split(mut self, name: impl Into<String>, split: DataSplit) -> Self {
        self.splits.insert(name.into(), split);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, split: DataSplit) -> Option<DataSplit> {
        self.splits.insert(name.into(), split)
    }

    pub fn remove(&mut self, name: &str) -> Option<DataSplit> {
        self.splits.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&DataSplit> {
        self.splits.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut DataSplit> {
        self.splits.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.splits.contains_key(name)
    }

    pub fn split_names(&self) -> Vec<&str> {
        self.splits.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.splits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }
}
