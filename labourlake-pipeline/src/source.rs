//! Source readers for the staged layer.
//!
//! The staged layer is the only place arbitrary file formats enter the
//! pipeline. Format is chosen by file extension; everything downstream reads
//! parquet.

use crate::error::{PipelineError, Result};
use crate::frame::{ColumnType, DataBatch, columnar};
use arrow::datatypes::{DataType, Field, Schema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek};
use std::path::Path;
use std::sync::Arc;

/// Recognised source formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    Csv,
    Tsv,
    Json,
    Jsonl,
    Parquet,
    Excel,
}

impl SourceFormat {
    /// Pick a format from the file extension (case-insensitive).
    pub fn detect(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(SourceFormat::Csv),
            "tsv" => Ok(SourceFormat::Tsv),
            "json" => Ok(SourceFormat::Json),
            "jsonl" | "ndjson" => Ok(SourceFormat::Jsonl),
            "parquet" | "pq" => Ok(SourceFormat::Parquet),
            "xlsx" | "xlsm" | "xls" | "ods" => Ok(SourceFormat::Excel),
            _ => Err(PipelineError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension,
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFormat::Csv => "csv",
            SourceFormat::Tsv => "tsv",
            SourceFormat::Json => "json",
            SourceFormat::Jsonl => "jsonl",
            SourceFormat::Parquet => "parquet",
            SourceFormat::Excel => "excel",
        }
    }

    /// Reader for this format.
    pub fn reader(&self) -> Box<dyn SourceReader> {
        match self {
            SourceFormat::Csv => Box::new(CsvSource { delimiter: b',' }),
            SourceFormat::Tsv => Box::new(CsvSource { delimiter: b'\t' }),
            SourceFormat::Json => Box::new(JsonSource),
            SourceFormat::Jsonl => Box::new(JsonlSource),
            SourceFormat::Parquet => Box::new(ParquetSource),
            SourceFormat::Excel => Box::new(ExcelSource),
        }
    }
}

/// Trait for loading a whole source file into memory.
pub trait SourceReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<DataBatch>;
}

/// Detect the format of `path` and read it.
pub fn read_source(path: &Path) -> Result<DataBatch> {
    let format = SourceFormat::detect(path)?;
    tracing::debug!(path = %path.display(), format = format.as_str(), "Reading source");
    format.reader().read(path)
}

// ---------------------------------------------------------------------------
// CsvSource
// ---------------------------------------------------------------------------

/// Delimited text. Every column is read as a string so values reach the
/// staged layer exactly as written.
pub struct CsvSource {
    pub delimiter: u8,
}

impl SourceReader for CsvSource {
    fn read(&self, path: &Path) -> Result<DataBatch> {
        let mut file = File::open(path)?;
        let format = arrow::csv::reader::Format::default()
            .with_header(true)
            .with_delimiter(self.delimiter);
        let (inferred, _) = format.infer_schema(&mut file, None)?;
        file.rewind()?;

        let fields: Vec<Field> = inferred
            .fields()
            .iter()
            .map(|f| Field::new(f.name(), DataType::Utf8, true))
            .collect();
        if fields.is_empty() {
            return Err(PipelineError::source_read(format!(
                "{} has no header row",
                path.display()
            )));
        }
        let schema = Arc::new(Schema::new(fields));

        let reader = arrow::csv::ReaderBuilder::new(schema.clone())
            .with_header(true)
            .with_delimiter(self.delimiter)
            .build(file)?;
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        columnar::from_record_batches(&schema, &batches)
    }
}

// ---------------------------------------------------------------------------
// JsonSource / JsonlSource
// ---------------------------------------------------------------------------

/// A JSON document holding an array of objects, or a single object.
pub struct JsonSource;

impl SourceReader for JsonSource {
    fn read(&self, path: &Path) -> Result<DataBatch> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        let items = match value {
            Value::Array(arr) => arr,
            Value::Object(_) => vec![value],
            _ => {
                return Err(PipelineError::source_read(
                    "JSON must be an array or object",
                ));
            }
        };
        Ok(objects_to_batch(items))
    }
}

/// JSON Lines: one JSON object per line.
pub struct JsonlSource;

impl SourceReader for JsonlSource {
    fn read(&self, path: &Path) -> Result<DataBatch> {
        let reader = BufReader::new(File::open(path)?);
        let mut items = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line).map_err(|e| {
                PipelineError::source_read(format!(
                    "{} line {}: {e}",
                    path.display(),
                    line_no + 1
                ))
            })?;
            items.push(value);
        }
        Ok(objects_to_batch(items))
    }
}

/// Columns in first-seen key order across all items; missing keys are null.
/// Non-object items land in a single `value` column.
fn objects_to_batch(items: Vec<Value>) -> DataBatch {
    let mut columns: Vec<String> = Vec::new();
    for item in &items {
        match item {
            Value::Object(map) => {
                for key in map.keys() {
                    if !columns.iter().any(|c| c == key) {
                        columns.push(key.clone());
                    }
                }
            }
            _ => {
                if !columns.iter().any(|c| c == "value") {
                    columns.push("value".to_string());
                }
            }
        }
    }

    let rows = items
        .into_iter()
        .map(|item| match item {
            Value::Object(mut map) => columns
                .iter()
                .map(|col| map.remove(col).unwrap_or(Value::Null))
                .collect(),
            other => columns
                .iter()
                .map(|col| {
                    if col == "value" {
                        other.clone()
                    } else {
                        Value::Null
                    }
                })
                .collect(),
        })
        .collect();

    DataBatch::from_rows(columns, rows)
}

// ---------------------------------------------------------------------------
// ParquetSource
// ---------------------------------------------------------------------------

pub struct ParquetSource;

impl SourceReader for ParquetSource {
    fn read(&self, path: &Path) -> Result<DataBatch> {
        let (batch, _) = columnar::read_parquet(path)?;
        Ok(batch)
    }
}

// ---------------------------------------------------------------------------
// ExcelSource
// ---------------------------------------------------------------------------

/// First worksheet of a workbook; the first row is the header and cells are
/// read as strings.
pub struct ExcelSource;

impl SourceReader for ExcelSource {
    fn read(&self, path: &Path) -> Result<DataBatch> {
        use calamine::{Data, Reader, open_workbook_auto};

        let mut workbook = open_workbook_auto(path)
            .map_err(|e| PipelineError::source_read(format!("{}: {e}", path.display())))?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| PipelineError::source_read(format!("{} has no worksheets", path.display())))?
            .map_err(|e| PipelineError::source_read(format!("{}: {e}", path.display())))?;

        let mut rows_iter = range.rows();
        let header = rows_iter.next().ok_or_else(|| {
            PipelineError::source_read(format!("{} has no header row", path.display()))
        })?;
        let columns: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(i, cell)| match cell {
                Data::Empty => format!("column_{}", i + 1),
                other => other.to_string().trim().to_string(),
            })
            .collect();

        let rows: Vec<Vec<Value>> = rows_iter
            .map(|row| {
                row.iter()
                    .map(|cell| match cell {
                        Data::Empty => Value::Null,
                        Data::String(s) => Value::String(s.clone()),
                        other => Value::String(other.to_string()),
                    })
                    .collect()
            })
            .filter(|row: &Vec<Value>| row.iter().any(|v| !v.is_null()))
            .collect();

        let dtypes = vec![ColumnType::String; columns.len()];
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(columns.len(), Value::Null);
                row
            })
            .collect();
        DataBatch::new(columns, dtypes, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_detect_formats() {
        assert_eq!(
            SourceFormat::detect(Path::new("noc.CSV")).unwrap(),
            SourceFormat::Csv
        );
        assert_eq!(
            SourceFormat::detect(Path::new("a.ndjson")).unwrap(),
            SourceFormat::Jsonl
        );
        assert_eq!(
            SourceFormat::detect(Path::new("cops.xlsx")).unwrap(),
            SourceFormat::Excel
        );
        assert_eq!(
            SourceFormat::detect(Path::new("x.pq")).unwrap(),
            SourceFormat::Parquet
        );
    }

    #[test]
    fn test_detect_unsupported() {
        let err = SourceFormat::detect(Path::new("notes.txt")).unwrap_err();
        match err {
            PipelineError::UnsupportedFormat { extension, .. } => assert_eq!(extension, "txt"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(SourceFormat::detect(Path::new("no_extension")).is_err());
    }

    #[test]
    fn test_csv_keeps_values_verbatim() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("noc.csv");
        std::fs::write(
            &path,
            "code,title,teer\n00010,\"Legislators, senior\",0\n21231,Software engineers,1\n",
        )
        .unwrap();

        let batch = read_source(&path).unwrap();
        assert_eq!(batch.columns, vec!["code", "title", "teer"]);
        assert_eq!(batch.dtypes, vec![ColumnType::String; 3]);
        assert_eq!(batch.row_count(), 2);
        assert_eq!(batch.value(0, "code"), Some(&json!("00010")));
        assert_eq!(batch.value(0, "title"), Some(&json!("Legislators, senior")));
        assert_eq!(batch.value(1, "teer"), Some(&json!("1")));
    }

    #[test]
    fn test_tsv_delimiter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oasis.tsv");
        std::fs::write(&path, "code\tskill\n21231\tProgramming\n").unwrap();

        let batch = read_source(&path).unwrap();
        assert_eq!(batch.columns, vec!["code", "skill"]);
        assert_eq!(batch.value(0, "skill"), Some(&json!("Programming")));
    }

    #[test]
    fn test_json_array_union_of_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cops.json");
        std::fs::write(
            &path,
            r#"[{"code": "21231", "openings": 1200}, {"code": "41200", "region": "ON"}]"#,
        )
        .unwrap();

        let batch = read_source(&path).unwrap();
        assert_eq!(batch.columns, vec!["code", "openings", "region"]);
        assert_eq!(batch.dtypes[1], ColumnType::Integer);
        assert_eq!(batch.value(1, "openings"), Some(&Value::Null));
        assert_eq!(batch.value(1, "region"), Some(&json!("ON")));
    }

    #[test]
    fn test_json_scalar_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "42").unwrap();
        assert!(read_source(&path).is_err());
    }

    #[test]
    fn test_jsonl_skips_blank_lines_and_reports_bad_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("caf.jsonl");
        std::fs::write(&path, "{\"id\": 1}\n\n{\"id\": 2}\n").unwrap();
        let batch = read_source(&path).unwrap();
        assert_eq!(batch.row_count(), 2);

        std::fs::write(&path, "{\"id\": 1}\nnot json\n").unwrap();
        let err = read_source(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_parquet_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prior.parquet");
        let batch = DataBatch::from_rows(vec!["n".into()], vec![vec![json!(1)], vec![json!(2)]]);
        columnar::write_parquet(&path, &batch, &Default::default(), 3).unwrap();

        let loaded = read_source(&path).unwrap();
        assert_eq!(loaded, batch);
    }

    #[test]
    fn test_excel_first_sheet_as_strings() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/cops_outlook.xlsx");
        let batch = read_source(&path).unwrap();

        assert_eq!(batch.columns, vec!["code", "column_2", "outlook"]);
        assert_eq!(batch.dtypes, vec![ColumnType::String; 3]);
        // Row 3 of the sheet is blank and is skipped.
        assert_eq!(batch.row_count(), 2);
        assert_eq!(batch.value(0, "code"), Some(&json!("00010")));
        assert_eq!(batch.value(0, "column_2"), Some(&json!("7")));
        assert_eq!(batch.value(0, "outlook"), Some(&json!("Good")));
        assert_eq!(batch.value(1, "code"), Some(&json!("Legislators")));
        assert_eq!(batch.value(1, "column_2"), Some(&json!(null)));
        assert_eq!(batch.value(1, "outlook"), Some(&json!(null)));
    }

    #[test]
    fn test_excel_unreadable_workbook() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.xlsx");
        std::fs::write(&path, b"not a zip archive").unwrap();
        let err = read_source(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Source(_)), "{err}");
    }
}
