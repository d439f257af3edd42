//! Per-row provenance columns.
//!
//! Every persisted table carries `source_file`, `ingested_at`, `batch_id` and
//! `layer` on every row. `source_file` and `batch_id` are set once at
//! ingestion; `layer` and `ingested_at` are refreshed at each promotion.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::frame::columnar::{
    META_BATCH_ID, META_DOMAIN, META_LAYER, META_SOURCE_FILE, META_TABLE, format_timestamp,
};
use crate::frame::{ColumnType, DataBatch, FileMetadata};
use crate::layer::Layer;

pub const SOURCE_FILE: &str = "source_file";
pub const INGESTED_AT: &str = "ingested_at";
pub const BATCH_ID: &str = "batch_id";
pub const LAYER: &str = "layer";

pub const PROVENANCE_COLUMNS: [&str; 4] = [SOURCE_FILE, INGESTED_AT, BATCH_ID, LAYER];

pub fn is_provenance_column(name: &str) -> bool {
    PROVENANCE_COLUMNS.contains(&name)
}

fn provenance_type(column: &str) -> ColumnType {
    if column == INGESTED_AT {
        ColumnType::DateTime
    } else {
        ColumnType::String
    }
}

fn set(batch: &mut DataBatch, column: &str, value: &str) {
    batch.set_constant_column(column, provenance_type(column), Value::String(value.to_string()));
}

/// Attach all four provenance columns to a freshly read table.
///
/// A source column already named like a provenance column is a
/// [`PipelineError::ProvenanceCollision`]; source values are never replaced.
pub fn stamp_new(mut batch: DataBatch, source_file: &str, batch_id: &str, layer: Layer) -> Result<DataBatch> {
    if let Some(column) = PROVENANCE_COLUMNS.into_iter().find(|c| batch.has_column(c)) {
        let existing = batch.dtype(column).unwrap_or(ColumnType::Unknown);
        return Err(PipelineError::ProvenanceCollision {
            column: column.to_string(),
            existing: existing.to_string(),
        });
    }
    let now = format_timestamp(&Utc::now());
    set(&mut batch, SOURCE_FILE, source_file);
    set(&mut batch, INGESTED_AT, &now);
    set(&mut batch, BATCH_ID, batch_id);
    set(&mut batch, LAYER, layer.as_str());
    Ok(batch)
}

/// Move a table to `layer`, keeping `source_file` and `batch_id`.
pub fn restamp_layer(batch: DataBatch, layer: Layer) -> Result<DataBatch> {
    let provenance = Provenance::from_batch(&batch)?.ok_or_else(|| {
        PipelineError::missing_provenance("cannot restamp a table with no rows or provenance")
    })?;
    restamp_with(batch, &provenance, layer)
}

/// Stamp `batch` with a previously captured [`Provenance`].
///
/// Provenance columns a transform dropped (an aggregate or a select) are
/// appended again.
pub fn restamp_with(mut batch: DataBatch, provenance: &Provenance, layer: Layer) -> Result<DataBatch> {
    let now = format_timestamp(&Utc::now());
    set(&mut batch, SOURCE_FILE, &provenance.source_file);
    set(&mut batch, INGESTED_AT, &now);
    set(&mut batch, BATCH_ID, &provenance.batch_id);
    set(&mut batch, LAYER, layer.as_str());
    Ok(batch)
}

/// The run-level provenance of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_file: String,
    pub batch_id: String,
    /// Domain label carried in file metadata; not a row column.
    #[serde(default)]
    pub domain: Option<String>,
}

impl Provenance {
    /// Read provenance from the first row.
    ///
    /// Returns `Ok(None)` for a table with no rows. A table with rows but no
    /// provenance columns is an error.
    pub fn from_batch(batch: &DataBatch) -> Result<Option<Self>> {
        if batch.row_count() == 0 {
            return Ok(None);
        }
        let text = |column: &str| -> Result<String> {
            batch
                .value(0, column)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| PipelineError::missing_provenance(format!("column '{column}' is absent or null")))
        };
        Ok(Some(Self {
            source_file: text(SOURCE_FILE)?,
            batch_id: text(BATCH_ID)?,
            domain: None,
        }))
    }

    pub fn from_metadata(metadata: &FileMetadata) -> Option<Self> {
        Some(Self {
            source_file: metadata.get(META_SOURCE_FILE)?.clone(),
            batch_id: metadata.get(META_BATCH_ID)?.clone(),
            domain: metadata.get(META_DOMAIN).cloned(),
        })
    }

    /// Provenance of a loaded layer file: row columns first, file metadata
    /// as a fallback for empty tables.
    pub fn resolve(batch: &DataBatch, metadata: &FileMetadata) -> Result<Self> {
        let from_meta = Self::from_metadata(metadata);
        match Self::from_batch(batch)? {
            Some(mut p) => {
                p.domain = from_meta.and_then(|m| m.domain);
                Ok(p)
            }
            None => from_meta.ok_or_else(|| {
                PipelineError::missing_provenance("empty table without provenance metadata")
            }),
        }
    }

    /// File metadata to write alongside a table at `layer`.
    pub fn to_metadata(&self, table: &str, layer: Layer) -> FileMetadata {
        let mut metadata = FileMetadata::new();
        metadata.insert(META_TABLE.to_string(), table.to_string());
        metadata.insert(META_LAYER.to_string(), layer.as_str().to_string());
        metadata.insert(META_BATCH_ID.to_string(), self.batch_id.clone());
        metadata.insert(META_SOURCE_FILE.to_string(), self.source_file.clone());
        if let Some(domain) = &self.domain {
            metadata.insert(META_DOMAIN.to_string(), domain.clone());
        }
        metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn raw() -> DataBatch {
        DataBatch::from_rows(
            vec!["code".into(), "title".into()],
            vec![
                vec![json!("00000"), json!("All occupations")],
                vec![json!("21231"), json!("Software engineers")],
            ],
        )
    }

    #[test]
    fn test_stamp_new_appends_all_columns() {
        let stamped = stamp_new(raw(), "noc.csv", "b-1", Layer::Staged).unwrap();
        assert_eq!(
            stamped.columns,
            vec!["code", "title", "source_file", "ingested_at", "batch_id", "layer"]
        );
        assert_eq!(stamped.dtype(INGESTED_AT), Some(ColumnType::DateTime));
        assert_eq!(stamped.value(1, LAYER), Some(&json!("staged")));
        assert_eq!(stamped.value(0, "code"), Some(&json!("00000")));
    }

    #[test]
    fn test_stamp_new_type_collision() {
        let batch = DataBatch::from_rows(vec!["batch_id".into()], vec![vec![json!(7)]]);
        let err = stamp_new(batch, "f.csv", "b", Layer::Staged).unwrap_err();
        assert!(matches!(err, PipelineError::ProvenanceCollision { ref column, .. } if column == "batch_id"));
    }

    #[test]
    fn test_stamp_new_rejects_same_typed_source_column() {
        let batch = DataBatch::from_rows(
            vec!["code".into(), "layer".into()],
            vec![vec![json!("1"), json!("foundation")], vec![json!("2"), json!("advanced")]],
        );
        let err = stamp_new(batch, "teer.csv", "b", Layer::Staged).unwrap_err();
        match err {
            PipelineError::ProvenanceCollision { column, existing } => {
                assert_eq!(column, "layer");
                assert_eq!(existing, "string");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_restamp_layer_keeps_identity() {
        let stamped = stamp_new(raw(), "noc.csv", "b-1", Layer::Staged).unwrap();
        let moved = restamp_layer(stamped.clone(), Layer::Bronze).unwrap();
        assert_eq!(moved.columns, stamped.columns);
        assert_eq!(moved.value(0, BATCH_ID), Some(&json!("b-1")));
        assert_eq!(moved.value(0, SOURCE_FILE), Some(&json!("noc.csv")));
        assert_eq!(moved.value(0, LAYER), Some(&json!("bronze")));
    }

    #[test]
    fn test_restamp_with_readds_dropped_columns() {
        let provenance = Provenance {
            source_file: "noc.csv".into(),
            batch_id: "b-1".into(),
            domain: None,
        };
        let restamped = restamp_with(raw(), &provenance, Layer::Gold).unwrap();
        for column in PROVENANCE_COLUMNS {
            assert!(restamped.has_column(column), "{column} missing");
        }
    }

    #[test]
    fn test_resolve_falls_back_to_metadata() {
        let provenance = Provenance {
            source_file: "noc.csv".into(),
            batch_id: "b-1".into(),
            domain: Some("occupations".into()),
        };
        let metadata = provenance.to_metadata("noc", Layer::Silver);
        let empty = DataBatch::empty();
        assert_eq!(Provenance::resolve(&empty, &metadata).unwrap(), provenance);
        assert!(Provenance::resolve(&empty, &FileMetadata::new()).is_err());
        assert!(restamp_layer(empty, Layer::Gold).is_err());
    }
}
