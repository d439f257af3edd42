//! In-memory table representation shared by every layer.
//!
//! A [`DataBatch`] is fully materialised: each layer loads one, transforms
//! it and writes it back to parquet before the next layer starts.

pub mod columnar;
pub mod schema;

pub use columnar::{FileMetadata, read_file_metadata, read_parquet, write_parquet};
pub use schema::{ColumnSchema, ColumnType, SchemaDefinition, infer_column_type, infer_schema};

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A table of row-major cells with one declared type per column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBatch {
    pub columns: Vec<String>,
    pub dtypes: Vec<ColumnType>,
    pub rows: Vec<Vec<Value>>,
}

impl DataBatch {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            dtypes: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Build a batch with explicit column types.
    pub fn new(columns: Vec<String>, dtypes: Vec<ColumnType>, rows: Vec<Vec<Value>>) -> Result<Self> {
        if columns.len() != dtypes.len() {
            return Err(PipelineError::source_read(format!(
                "{} columns but {} types",
                columns.len(),
                dtypes.len()
            )));
        }
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(PipelineError::source_read(format!(
                "row {i} has {} cells, expected {}",
                row.len(),
                columns.len()
            )));
        }
        Ok(Self {
            columns,
            dtypes,
            rows,
        })
    }

    /// Build a batch and infer each column's type from its values.
    ///
    /// Short rows are padded with nulls.
    pub fn from_rows(columns: Vec<String>, mut rows: Vec<Vec<Value>>) -> Self {
        for row in &mut rows {
            row.resize(columns.len(), Value::Null);
        }
        let dtypes = infer_schema(&columns, &rows)
            .columns
            .into_iter()
            .map(|c| c.dtype)
            .collect();
        Self {
            columns,
            dtypes,
            rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Index of `name`, or `MissingColumn`.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| PipelineError::missing_column(name))
    }

    pub fn dtype(&self, name: &str) -> Option<ColumnType> {
        self.column_index(name).map(|i| self.dtypes[i])
    }

    /// Cell at (`row`, `column`).
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// All values of one column, top to bottom.
    pub fn column_values(&self, column: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(column)?;
        Some(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Set every cell of `column` to `value`, appending the column if absent.
    pub fn set_constant_column(&mut self, column: &str, dtype: ColumnType, value: Value) {
        match self.column_index(column) {
            Some(idx) => {
                self.dtypes[idx] = dtype;
                for row in &mut self.rows {
                    row[idx] = value.clone();
                }
            }
            None => {
                self.columns.push(column.to_string());
                self.dtypes.push(dtype);
                for row in &mut self.rows {
                    row.push(value.clone());
                }
            }
        }
    }

    /// Append a column computed per row.
    pub fn push_column(&mut self, column: &str, dtype: ColumnType, values: Vec<Value>) -> Result<()> {
        if values.len() != self.rows.len() {
            return Err(PipelineError::invalid_transform(format!(
                "column '{column}' has {} values for {} rows",
                values.len(),
                self.rows.len()
            )));
        }
        self.columns.push(column.to_string());
        self.dtypes.push(dtype);
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
        Ok(())
    }

    /// Remove a column if present; returns whether it existed.
    pub fn drop_column(&mut self, column: &str) -> bool {
        let Some(idx) = self.column_index(column) else {
            return false;
        };
        self.columns.remove(idx);
        self.dtypes.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        true
    }

    /// Schema with nullability derived from the current values.
    pub fn schema(&self) -> SchemaDefinition {
        let columns = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| ColumnSchema {
                name: name.clone(),
                dtype: self.dtypes[i],
                nullable: self.rows.iter().any(|r| r[i].is_null()),
                description: None,
            })
            .collect();
        SchemaDefinition { columns }
    }
}
