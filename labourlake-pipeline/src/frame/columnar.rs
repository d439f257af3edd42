//! Parquet encoding/decoding for layer tables.
//!
//! Every layer output is a single ZSTD-compressed parquet file. Column types
//! are carried in arrow field metadata so `json`, `null` and `unknown`
//! columns survive a round trip, and run-level facts (table, layer, batch,
//! source file, domain) are stored as file key/value metadata so they can be
//! recovered even from an empty table.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::compute::{CastOptions, cast_with_options};
use arrow::datatypes::{
    DataType, Field, Float64Type, Int64Type, Schema, TimeUnit, TimestampMicrosecondType, UInt64Type,
};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{DateTime, SecondsFormat, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::metadata::ParquetMetaData;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde_json::Value;

use super::DataBatch;
use super::schema::ColumnType;
use crate::error::{PipelineError, Result};

/// Parquet file-level key/value metadata owned by labourlake.
pub type FileMetadata = BTreeMap<String, String>;

/// Prefix of every key/value entry labourlake writes.
pub const META_PREFIX: &str = "labourlake.";
pub const META_TABLE: &str = "labourlake.table";
pub const META_LAYER: &str = "labourlake.layer";
pub const META_BATCH_ID: &str = "labourlake.batch_id";
pub const META_SOURCE_FILE: &str = "labourlake.source_file";
pub const META_DOMAIN: &str = "labourlake.domain";

/// Field metadata key holding the labourlake column type.
const FIELD_DTYPE: &str = "labourlake.dtype";

const UTC: &str = "UTC";

fn arrow_type(dtype: ColumnType) -> DataType {
    match dtype {
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::DateTime => DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
        ColumnType::String | ColumnType::Json | ColumnType::Null | ColumnType::Unknown => {
            DataType::Utf8
        }
    }
}

fn column_type_for(field: &Field) -> ColumnType {
    if let Some(dtype) = field
        .metadata()
        .get(FIELD_DTYPE)
        .and_then(|name| ColumnType::from_name(name))
    {
        return dtype;
    }
    match field.data_type() {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => ColumnType::Integer,
        DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => ColumnType::Float,
        DataType::Boolean => ColumnType::Boolean,
        DataType::Timestamp(_, _) => ColumnType::DateTime,
        DataType::Null => ColumnType::Null,
        _ => ColumnType::String,
    }
}

/// Render a timestamp the way every `date_time` cell is held in memory.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn cast_error(column: &str, value: &Value, target: ColumnType) -> PipelineError {
    PipelineError::CastFailed {
        column: column.to_string(),
        value: value.to_string(),
        target: target.to_string(),
    }
}

// -2^63 and 2^63: the floats whose integer values fit in an i64.
const I64_LOWER: f64 = -9_223_372_036_854_775_808.0;
const I64_UPPER: f64 = 9_223_372_036_854_775_808.0;

pub(crate) fn cell_i64(column: &str, v: &Value) -> Result<Option<i64>> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= I64_LOWER && *f < I64_UPPER)
                    .map(|f| f as i64)
            })
            .map(Some)
            .ok_or_else(|| cast_error(column, v, ColumnType::Integer)),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| cast_error(column, v, ColumnType::Integer)),
        _ => Err(cast_error(column, v, ColumnType::Integer)),
    }
}

pub(crate) fn cell_f64(column: &str, v: &Value) -> Result<Option<f64>> {
    match v {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| cast_error(column, v, ColumnType::Float)),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| cast_error(column, v, ColumnType::Float)),
        _ => Err(cast_error(column, v, ColumnType::Float)),
    }
}

pub(crate) fn cell_bool(column: &str, v: &Value) -> Result<Option<bool>> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Some(true)),
            "false" => Ok(Some(false)),
            _ => Err(cast_error(column, v, ColumnType::Boolean)),
        },
        _ => Err(cast_error(column, v, ColumnType::Boolean)),
    }
}

fn cell_micros(column: &str, v: &Value) -> Result<Option<i64>> {
    match v {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| Some(dt.with_timezone(&Utc).timestamp_micros()))
            .map_err(|_| cast_error(column, v, ColumnType::DateTime)),
        _ => Err(cast_error(column, v, ColumnType::DateTime)),
    }
}

fn cell_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn build_array(batch: &DataBatch, idx: usize) -> Result<ArrayRef> {
    let column = batch.columns[idx].as_str();
    let cells = batch.rows.iter().map(|r| &r[idx]);
    let array: ArrayRef = match batch.dtypes[idx] {
        ColumnType::Integer => Arc::new(
            cells
                .map(|v| cell_i64(column, v))
                .collect::<Result<Int64Array>>()?,
        ),
        ColumnType::Float => Arc::new(
            cells
                .map(|v| cell_f64(column, v))
                .collect::<Result<Float64Array>>()?,
        ),
        ColumnType::Boolean => Arc::new(
            cells
                .map(|v| cell_bool(column, v))
                .collect::<Result<BooleanArray>>()?,
        ),
        ColumnType::DateTime => {
            let micros = cells
                .map(|v| cell_micros(column, v))
                .collect::<Result<Vec<Option<i64>>>>()?;
            Arc::new(TimestampMicrosecondArray::from(micros).with_timezone(UTC))
        }
        ColumnType::Json => Arc::new(
            cells
                .map(|v| (!v.is_null()).then(|| v.to_string()))
                .collect::<StringArray>(),
        ),
        ColumnType::String | ColumnType::Null | ColumnType::Unknown => {
            Arc::new(cells.map(cell_string).collect::<StringArray>())
        }
    };
    Ok(array)
}

/// Convert a batch to a single arrow record batch.
pub fn to_record_batch(batch: &DataBatch) -> Result<RecordBatch> {
    let fields: Vec<Field> = batch
        .columns
        .iter()
        .zip(&batch.dtypes)
        .map(|(name, dtype)| {
            Field::new(name, arrow_type(*dtype), true).with_metadata(HashMap::from([(
                FIELD_DTYPE.to_string(),
                dtype.as_str().to_string(),
            )]))
        })
        .collect();
    let arrays = (0..batch.column_count())
        .map(|idx| build_array(batch, idx))
        .collect::<Result<Vec<_>>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(batch.row_count()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        arrays,
        &options,
    )?)
}

/// Cast that fails on overflow instead of producing nulls.
fn strict_cast(array: &ArrayRef, to: &DataType) -> Result<ArrayRef> {
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    Ok(cast_with_options(array.as_ref(), to, &options)?)
}

fn column_values(array: &ArrayRef, dtype: ColumnType) -> Result<Vec<Value>> {
    let n = array.len();
    let values = match dtype {
        ColumnType::Integer => {
            let cast_array = strict_cast(array, &DataType::Int64)?;
            let ints = cast_array.as_primitive::<Int64Type>();
            (0..n)
                .map(|i| {
                    if ints.is_null(i) {
                        Value::Null
                    } else {
                        Value::from(ints.value(i))
                    }
                })
                .collect()
        }
        ColumnType::Float => {
            let cast_array = strict_cast(array, &DataType::Float64)?;
            let floats = cast_array.as_primitive::<Float64Type>();
            (0..n)
                .map(|i| {
                    if floats.is_null(i) {
                        Value::Null
                    } else {
                        serde_json::Number::from_f64(floats.value(i))
                            .map(Value::Number)
                            .unwrap_or(Value::Null)
                    }
                })
                .collect()
        }
        ColumnType::Boolean => {
            let cast_array = strict_cast(array, &DataType::Boolean)?;
            let bools = cast_array.as_boolean();
            (0..n)
                .map(|i| {
                    if bools.is_null(i) {
                        Value::Null
                    } else {
                        Value::Bool(bools.value(i))
                    }
                })
                .collect()
        }
        ColumnType::DateTime => {
            let cast_array = strict_cast(
                array,
                &DataType::Timestamp(TimeUnit::Microsecond, Some(UTC.into())),
            )?;
            let stamps = cast_array.as_primitive::<TimestampMicrosecondType>();
            (0..n)
                .map(|i| {
                    if stamps.is_null(i) {
                        Value::Null
                    } else {
                        DateTime::from_timestamp_micros(stamps.value(i))
                            .map(|dt| Value::String(format_timestamp(&dt)))
                            .unwrap_or(Value::Null)
                    }
                })
                .collect()
        }
        ColumnType::Json => {
            let cast_array = strict_cast(array, &DataType::Utf8)?;
            let strings = cast_array.as_string::<i32>();
            (0..n)
                .map(|i| {
                    if strings.is_null(i) {
                        Value::Null
                    } else {
                        let raw = strings.value(i);
                        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
                    }
                })
                .collect()
        }
        ColumnType::String | ColumnType::Null | ColumnType::Unknown => {
            let cast_array = strict_cast(array, &DataType::Utf8)?;
            let strings = cast_array.as_string::<i32>();
            (0..n)
                .map(|i| {
                    if strings.is_null(i) {
                        Value::Null
                    } else {
                        Value::String(strings.value(i).to_string())
                    }
                })
                .collect()
        }
    };
    Ok(values)
}

/// Append the rows of an arrow record batch to `rows`.
pub fn append_record_batch(
    record_batch: &RecordBatch,
    dtypes: &[ColumnType],
    rows: &mut Vec<Vec<Value>>,
) -> Result<()> {
    let start = rows.len();
    rows.extend((0..record_batch.num_rows()).map(|_| Vec::with_capacity(dtypes.len())));
    for (col_idx, dtype) in dtypes.iter().enumerate() {
        let values = column_values(record_batch.column(col_idx), *dtype)?;
        for (offset, value) in values.into_iter().enumerate() {
            rows[start + offset].push(value);
        }
    }
    Ok(())
}

/// True when an unsigned column holds a value an `i64` cannot.
fn exceeds_i64(batches: &[RecordBatch], idx: usize) -> bool {
    batches.iter().any(|batch| {
        batch
            .column(idx)
            .as_primitive_opt::<UInt64Type>()
            .is_some_and(|values| values.iter().flatten().any(|v| v > i64::MAX as u64))
    })
}

/// Convert arrow record batches sharing one schema into a [`DataBatch`].
///
/// A foreign `UInt64` column with values beyond `i64` is read as strings.
pub fn from_record_batches(schema: &Schema, batches: &[RecordBatch]) -> Result<DataBatch> {
    let columns: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
    let dtypes: Vec<ColumnType> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(idx, field)| match column_type_for(field) {
            ColumnType::Integer
                if field.data_type() == &DataType::UInt64 && exceeds_i64(batches, idx) =>
            {
                ColumnType::String
            }
            dtype => dtype,
        })
        .collect();
    let mut rows = Vec::new();
    for record_batch in batches {
        append_record_batch(record_batch, &dtypes, &mut rows)?;
    }
    DataBatch::new(columns, dtypes, rows)
}

fn writer_properties(metadata: &FileMetadata, zstd_level: i32) -> Result<WriterProperties> {
    let created_by = KeyValue {
        key: format!("{META_PREFIX}created_by"),
        value: Some(format!("labourlake-pipeline {}", env!("CARGO_PKG_VERSION"))),
    };
    let mut key_values = vec![created_by];
    key_values.extend(
        metadata
            .iter()
            .filter(|(k, _)| k.starts_with(META_PREFIX))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: Some(v.clone()),
            }),
    );
    Ok(WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::try_new(zstd_level)?))
        .set_key_value_metadata(Some(key_values))
        .build())
}

/// Write `batch` to `path` as one ZSTD parquet file.
///
/// The file is written to a temporary sibling and renamed into place; the
/// last writer to rename wins.
pub fn write_parquet(
    path: &Path,
    batch: &DataBatch,
    metadata: &FileMetadata,
    zstd_level: i32,
) -> Result<()> {
    let record_batch = to_record_batch(batch)?;
    let props = writer_properties(metadata, zstd_level)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = labourlake_core::persistence::temp_sibling(path);
    let written = (|| -> Result<()> {
        let file = File::create(&tmp)?;
        let mut writer = ArrowWriter::try_new(file, record_batch.schema(), Some(props))?;
        writer.write(&record_batch)?;
        writer.close()?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    })();
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}

fn labourlake_metadata(meta: &ParquetMetaData) -> FileMetadata {
    meta.file_metadata()
        .key_value_metadata()
        .map(|kvs| {
            kvs.iter()
                .filter(|kv| kv.key.starts_with(META_PREFIX))
                .filter_map(|kv| kv.value.clone().map(|v| (kv.key.clone(), v)))
                .collect()
        })
        .unwrap_or_default()
}

/// Only the labourlake key/value metadata of a parquet file.
pub fn read_file_metadata(path: &Path) -> Result<FileMetadata> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    Ok(labourlake_metadata(builder.metadata()))
}

/// Read a parquet file written by [`write_parquet`] (or any flat parquet
/// file) along with its labourlake key/value metadata.
pub fn read_parquet(path: &Path) -> Result<(DataBatch, FileMetadata)> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let metadata = labourlake_metadata(builder.metadata());
    let schema = builder.schema().clone();
    let reader = builder.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    let batch = from_record_batches(&schema, &batches)?;
    Ok((batch, metadata))
}
