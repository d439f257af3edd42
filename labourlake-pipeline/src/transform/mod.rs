//! Layer transforms.
//!
//! Transforms are a closed set of tagged operations rather than arbitrary
//! callbacks, so a transform list can be validated against a layer before any
//! data is touched and its names stay stable in transition logs.

pub mod aggregate;
pub mod expr;

pub use aggregate::{AggFunc, Aggregation};
pub use expr::{ArithOp, Expr, Predicate};

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::frame::columnar::{cast_error, cell_bool, cell_f64, cell_i64, format_timestamp};
use crate::frame::{ColumnType, DataBatch, infer_column_type};
use crate::layer::Layer;
use crate::provenance::is_provenance_column;

/// A single transformation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    Rename {
        from: String,
        to: String,
    },
    /// Several renames applied at once against the input columns, so swaps
    /// and would-be chains resolve as one mapping.
    RenameColumns {
        columns: BTreeMap<String, String>,
    },
    Cast {
        column: String,
        to: ColumnType,
    },
    Filter {
        /// Name recorded in the transition log instead of the rendered
        /// predicate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        predicate: Predicate,
    },
    FillNull {
        column: String,
        value: Value,
    },
    DropNulls {
        columns: Vec<String>,
    },
    Deduplicate {
        #[serde(default)]
        columns: Option<Vec<String>>,
    },
    Trim {
        column: String,
    },
    Derive {
        column: String,
        expr: Expr,
        #[serde(default)]
        dtype: Option<ColumnType>,
    },
    Select {
        columns: Vec<String>,
    },
    SortBy {
        column: String,
        #[serde(default = "default_ascending")]
        ascending: bool,
    },
    Aggregate {
        #[serde(default)]
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
}

fn default_ascending() -> bool {
    true
}

impl TransformOp {
    pub fn rename(from: impl Into<String>, to: impl Into<String>) -> Self {
        TransformOp::Rename {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn cast(column: impl Into<String>, to: ColumnType) -> Self {
        TransformOp::Cast {
            column: column.into(),
            to,
        }
    }

    pub fn filter(predicate: Predicate) -> Self {
        TransformOp::Filter {
            label: None,
            predicate,
        }
    }

    pub fn labelled_filter(label: impl Into<String>, predicate: Predicate) -> Self {
        TransformOp::Filter {
            label: Some(label.into()),
            predicate,
        }
    }

    pub fn derive(column: impl Into<String>, expr: Expr) -> Self {
        TransformOp::Derive {
            column: column.into(),
            expr,
            dtype: None,
        }
    }

    /// The serde tag of this op.
    pub fn kind(&self) -> &'static str {
        match self {
            TransformOp::Rename { .. } => "rename",
            TransformOp::RenameColumns { .. } => "rename_columns",
            TransformOp::Cast { .. } => "cast",
            TransformOp::Filter { .. } => "filter",
            TransformOp::FillNull { .. } => "fill_null",
            TransformOp::DropNulls { .. } => "drop_nulls",
            TransformOp::Deduplicate { .. } => "deduplicate",
            TransformOp::Trim { .. } => "trim",
            TransformOp::Derive { .. } => "derive",
            TransformOp::Select { .. } => "select",
            TransformOp::SortBy { .. } => "sort_by",
            TransformOp::Aggregate { .. } => "aggregate",
        }
    }

    /// Stable, human-readable name recorded in `transforms_applied`.
    pub fn name(&self) -> String {
        match self {
            TransformOp::Rename { from, to } => format!("rename({from} -> {to})"),
            TransformOp::RenameColumns { columns } => {
                let pairs: Vec<String> = columns.iter().map(|(from, to)| format!("{from} -> {to}")).collect();
                format!("rename({})", pairs.join(", "))
            }
            TransformOp::Cast { column, to } => format!("cast({column}: {to})"),
            TransformOp::Filter {
                label: Some(label), ..
            } => label.clone(),
            TransformOp::Filter {
                label: None,
                predicate,
            } => format!("filter({predicate})"),
            TransformOp::FillNull { column, value } => format!("fill_null({column} = {value})"),
            TransformOp::DropNulls { columns } => format!("drop_nulls({})", columns.join(", ")),
            TransformOp::Deduplicate { columns: None } => "deduplicate".to_string(),
            TransformOp::Deduplicate {
                columns: Some(columns),
            } => format!("deduplicate({})", columns.join(", ")),
            TransformOp::Trim { column } => format!("trim({column})"),
            TransformOp::Derive { column, expr, .. } => format!("derive({column} = {expr})"),
            TransformOp::Select { columns } => format!("select({})", columns.join(", ")),
            TransformOp::SortBy { column, ascending } => {
                format!("sort_by({column} {})", if *ascending { "asc" } else { "desc" })
            }
            TransformOp::Aggregate {
                group_by,
                aggregations,
            } => {
                let aggs: Vec<String> = aggregations.iter().map(Aggregation::name).collect();
                format!("aggregate(by [{}]: {})", group_by.join(", "), aggs.join(", "))
            }
        }
    }

    /// Columns this op writes to.
    fn written_columns(&self) -> Vec<&str> {
        match self {
            TransformOp::Rename { from, to } => vec![from.as_str(), to.as_str()],
            TransformOp::RenameColumns { columns } => columns
                .iter()
                .flat_map(|(from, to)| [from.as_str(), to.as_str()])
                .collect(),
            TransformOp::Cast { column, .. }
            | TransformOp::FillNull { column, .. }
            | TransformOp::Trim { column }
            | TransformOp::Derive { column, .. } => vec![column.as_str()],
            TransformOp::Aggregate { aggregations, .. } => {
                aggregations.iter().map(|a| a.alias.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn apply(&self, batch: DataBatch) -> Result<DataBatch> {
        match self {
            TransformOp::Rename { from, to } => {
                rename_columns(batch, &BTreeMap::from([(from.clone(), to.clone())]))
            }
            TransformOp::RenameColumns { columns } => rename_columns(batch, columns),
            TransformOp::Cast { column, to } => cast_column(batch, column, *to),
            TransformOp::Filter { predicate, .. } => {
                let mut batch = batch;
                let compiled = predicate.compile(&batch)?;
                batch.rows.retain(|row| compiled.matches(row));
                Ok(batch)
            }
            TransformOp::FillNull { column, value } => {
                let mut batch = batch;
                let idx = batch.require_column(column)?;
                for row in &mut batch.rows {
                    if row[idx].is_null() {
                        row[idx] = value.clone();
                    }
                }
                Ok(batch)
            }
            TransformOp::DropNulls { columns } => {
                let mut batch = batch;
                let idx = if columns.is_empty() {
                    (0..batch.column_count()).collect()
                } else {
                    columns
                        .iter()
                        .map(|c| batch.require_column(c))
                        .collect::<Result<Vec<_>>>()?
                };
                batch.rows.retain(|row| idx.iter().all(|i| !row[*i].is_null()));
                Ok(batch)
            }
            TransformOp::Deduplicate { columns } => deduplicate(batch, columns.as_deref()),
            TransformOp::Trim { column } => {
                let mut batch = batch;
                let idx = batch.require_column(column)?;
                for row in &mut batch.rows {
                    if let Value::String(s) = &row[idx] {
                        let trimmed = s.trim();
                        if trimmed.len() != s.len() {
                            row[idx] = Value::String(trimmed.to_string());
                        }
                    }
                }
                Ok(batch)
            }
            TransformOp::Derive {
                column,
                expr,
                dtype,
            } => derive(batch, column, expr, *dtype),
            TransformOp::Select { columns } => select(batch, columns),
            TransformOp::SortBy { column, ascending } => {
                let mut batch = batch;
                let idx = batch.require_column(column)?;
                batch.rows.sort_by(|a, b| {
                    let ordering = match (a[idx].is_null(), b[idx].is_null()) {
                        (true, true) => std::cmp::Ordering::Equal,
                        (true, false) => return std::cmp::Ordering::Greater,
                        (false, true) => return std::cmp::Ordering::Less,
                        (false, false) => expr::compare_values(&a[idx], &b[idx])
                            .unwrap_or(std::cmp::Ordering::Equal),
                    };
                    if *ascending { ordering } else { ordering.reverse() }
                });
                Ok(batch)
            }
            TransformOp::Aggregate {
                group_by,
                aggregations,
            } => aggregate::aggregate(&batch, group_by, aggregations),
        }
    }
}

/// Op kinds a layer accepts.
pub fn allowed_ops(layer: Layer) -> &'static [&'static str] {
    match layer {
        Layer::Bronze => &["rename", "rename_columns", "cast"],
        Layer::Silver => &["filter", "fill_null", "drop_nulls", "deduplicate", "trim", "cast"],
        Layer::Gold => &[
            "derive",
            "aggregate",
            "select",
            "sort_by",
            "rename",
            "rename_columns",
            "cast",
        ],
        Layer::External | Layer::Staged => &[],
    }
}

/// Check every op against `layer` and the provenance contract.
pub fn validate_ops(ops: &[TransformOp], layer: Layer) -> Result<()> {
    let allowed = allowed_ops(layer);
    for op in ops {
        if !allowed.contains(&op.kind()) {
            return Err(PipelineError::invalid_transform(format!(
                "'{}' is not allowed at the {layer} layer",
                op.kind()
            )));
        }
        if let Some(column) = op.written_columns().into_iter().find(|c| is_provenance_column(c)) {
            return Err(PipelineError::invalid_transform(format!(
                "{} writes provenance column '{column}'",
                op.name()
            )));
        }
    }
    Ok(())
}

/// Apply `ops` in order and return the names of the ops applied.
pub fn apply_ops(mut batch: DataBatch, ops: &[TransformOp]) -> Result<(DataBatch, Vec<String>)> {
    let mut names = Vec::with_capacity(ops.len());
    for op in ops {
        let rows_before = batch.row_count();
        batch = op.apply(batch)?;
        let name = op.name();
        tracing::debug!(
            transform = %name,
            rows_in = rows_before,
            rows_out = batch.row_count(),
            "Applied transform"
        );
        names.push(name);
    }
    Ok((batch, names))
}

/// Rename every key of `mapping` to its value in one step.
///
/// Every source must exist, targets must be distinct, and no target may
/// land on a column that keeps its name.
fn rename_columns(mut batch: DataBatch, mapping: &BTreeMap<String, String>) -> Result<DataBatch> {
    let mut renamed = batch.columns.clone();
    for (from, to) in mapping {
        renamed[batch.require_column(from)?] = to.clone();
    }
    let mut seen = HashSet::new();
    for (idx, name) in renamed.iter().enumerate() {
        if !seen.insert(name.as_str()) {
            let original = &batch.columns[idx];
            return Err(PipelineError::invalid_transform(if mapping.contains_key(original) {
                format!("cannot rename '{original}' to existing column '{name}'")
            } else {
                format!("column '{name}' would appear twice after renaming")
            }));
        }
    }
    batch.columns = renamed;
    Ok(batch)
}

fn parse_timestamp(column: &str, v: &Value) -> Result<Value> {
    let Value::String(s) = v else {
        return Err(cast_error(column, v, ColumnType::DateTime));
    };
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(Value::String(format_timestamp(&dt.with_timezone(&Utc))));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Value::String(format_timestamp(&naive.and_utc())))
        .ok_or_else(|| cast_error(column, v, ColumnType::DateTime))
}

/// Strictly convert one cell to `target`.
pub fn cast_value(column: &str, v: &Value, target: ColumnType) -> Result<Value> {
    if v.is_null() || v.as_str().is_some_and(|s| s.trim().is_empty()) {
        return Ok(Value::Null);
    }
    let cast = match target {
        ColumnType::Integer => cell_i64(column, v)?.map(Value::from),
        ColumnType::Float => cell_f64(column, v)?
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        ColumnType::Boolean => cell_bool(column, v)?.map(Value::Bool),
        ColumnType::String => Some(match v {
            Value::String(s) => Value::String(s.clone()),
            other => Value::String(other.to_string()),
        }),
        ColumnType::DateTime => Some(parse_timestamp(column, v)?),
        ColumnType::Json => Some(match v {
            Value::String(s) => {
                serde_json::from_str(s).map_err(|_| cast_error(column, v, ColumnType::Json))?
            }
            other => other.clone(),
        }),
        ColumnType::Null | ColumnType::Unknown => {
            return Err(PipelineError::invalid_transform(format!(
                "cannot cast '{column}' to {target}"
            )));
        }
    };
    Ok(cast.unwrap_or(Value::Null))
}

fn cast_column(mut batch: DataBatch, column: &str, target: ColumnType) -> Result<DataBatch> {
    let idx = batch.require_column(column)?;
    for row in &mut batch.rows {
        row[idx] = cast_value(column, &row[idx], target)?;
    }
    batch.dtypes[idx] = target;
    Ok(batch)
}

fn deduplicate(mut batch: DataBatch, columns: Option<&[String]>) -> Result<DataBatch> {
    let idx: Vec<usize> = match columns {
        Some(cols) => cols
            .iter()
            .map(|c| batch.require_column(c))
            .collect::<Result<_>>()?,
        None => (0..batch.column_count())
            .filter(|i| !is_provenance_column(&batch.columns[*i]))
            .collect(),
    };
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(batch.rows.len());
    for row in batch.rows {
        let key: Vec<&Value> = idx.iter().map(|i| &row[*i]).collect();
        if seen.insert(serde_json::to_string(&key)?) {
            kept.push(row);
        }
    }
    batch.rows = kept;
    Ok(batch)
}

fn derive(mut batch: DataBatch, column: &str, expr: &Expr, dtype: Option<ColumnType>) -> Result<DataBatch> {
    let compiled = expr.compile(&batch)?;
    let mut values: Vec<Value> = batch.rows.iter().map(|row| compiled.eval(row)).collect();
    let dtype = match dtype {
        Some(target) => {
            for v in &mut values {
                *v = cast_value(column, v, target)?;
            }
            target
        }
        None => infer_column_type(&values),
    };
    match batch.column_index(column) {
        Some(idx) => {
            for (row, v) in batch.rows.iter_mut().zip(values) {
                row[idx] = v;
            }
            batch.dtypes[idx] = dtype;
        }
        None => batch.push_column(column, dtype, values)?,
    }
    Ok(batch)
}

fn select(batch: DataBatch, columns: &[String]) -> Result<DataBatch> {
    let idx = columns
        .iter()
        .map(|c| batch.require_column(c))
        .collect::<Result<Vec<_>>>()?;
    let dtypes = idx.iter().map(|i| batch.dtypes[*i]).collect();
    let rows = batch
        .rows
        .into_iter()
        .map(|row| idx.iter().map(|i| row[*i].clone()).collect())
        .collect();
    DataBatch::new(columns.to_vec(), dtypes, rows)
}

/// Rename/cast directive for the bronze layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDirective {
    #[serde(default)]
    pub renames: BTreeMap<String, String>,
    #[serde(default)]
    pub casts: BTreeMap<String, ColumnType>,
}

impl SchemaDirective {
    pub fn with_rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames.insert(from.into(), to.into());
        self
    }

    pub fn with_cast(mut self, column: impl Into<String>, to: ColumnType) -> Self {
        self.casts.insert(column.into(), to);
        self
    }

    /// One rename of every mapped column, then all casts in key order.
    /// Cast keys name post-rename columns.
    pub fn to_ops(&self) -> Vec<TransformOp> {
        let renames = (!self.renames.is_empty()).then(|| TransformOp::RenameColumns {
            columns: self.renames.clone(),
        });
        let casts = self
            .casts
            .iter()
            .map(|(column, to)| TransformOp::cast(column, *to));
        renames.into_iter().chain(casts).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn noc() -> DataBatch {
        DataBatch::from_rows(
            vec!["code".into(), "title".into(), "teer".into(), "layer".into()],
            vec![
                vec![json!("00010"), json!(" Legislators "), json!("0"), json!("silver")],
                vec![json!("21231"), json!("Software engineers"), json!("1"), json!("silver")],
                vec![json!("21231"), json!("Software engineers"), json!("1"), json!("silver")],
                vec![json!("41200"), Value::Null, json!(""), json!("silver")],
            ],
        )
    }

    #[test]
    fn test_filter_and_names() {
        let op = TransformOp::filter(Predicate::ne("code", "00010"));
        assert_eq!(op.name(), "filter(code != \"00010\")");
        let (out, names) = apply_ops(noc(), &[op]).unwrap();
        assert_eq!(out.row_count(), 3);
        assert_eq!(names, vec!["filter(code != \"00010\")"]);

        let labelled = TransformOp::labelled_filter("keep_teer_1", Predicate::eq("teer", 1));
        assert_eq!(labelled.name(), "keep_teer_1");
        assert_eq!(labelled.apply(noc()).unwrap().row_count(), 2);
    }

    #[test]
    fn test_cast_is_strict() {
        let out = TransformOp::cast("teer", ColumnType::Integer)
            .apply(noc())
            .unwrap();
        assert_eq!(out.dtype("teer"), Some(ColumnType::Integer));
        assert_eq!(out.rows[0][2], json!(0));
        assert_eq!(out.rows[3][2], Value::Null);

        let err = TransformOp::cast("title", ColumnType::Integer)
            .apply(noc())
            .unwrap_err();
        assert!(matches!(err, PipelineError::CastFailed { .. }));
    }

    #[test]
    fn test_cast_value_dates() {
        assert_eq!(
            cast_value("d", &json!("2024-03-01"), ColumnType::DateTime).unwrap(),
            json!("2024-03-01T00:00:00.000000Z")
        );
        assert!(cast_value("d", &json!("March"), ColumnType::DateTime).is_err());
    }

    #[test]
    fn test_dedup_trim_fill_drop() {
        let ops = vec![
            TransformOp::Trim {
                column: "title".into(),
            },
            TransformOp::Deduplicate { columns: None },
            TransformOp::FillNull {
                column: "title".into(),
                value: json!("Unknown"),
            },
            TransformOp::DropNulls {
                columns: vec!["teer".into()],
            },
        ];
        let (out, names) = apply_ops(noc(), &ops).unwrap();
        assert_eq!(out.row_count(), 3);
        assert_eq!(out.rows[0][1], json!("Legislators"));
        assert_eq!(out.rows[2][1], json!("Unknown"));
        assert_eq!(names[1], "deduplicate");
    }

    #[test]
    fn test_derive_select_sort() {
        let ops = vec![
            TransformOp::derive(
                "major_group",
                Expr::Substring {
                    expr: Box::new(Expr::col("code")),
                    start: 0,
                    length: Some(2),
                },
            ),
            TransformOp::Select {
                columns: vec!["major_group".into(), "code".into()],
            },
            TransformOp::SortBy {
                column: "code".into(),
                ascending: false,
            },
        ];
        let (out, _) = apply_ops(noc(), &ops).unwrap();
        assert_eq!(out.columns, vec!["major_group", "code"]);
        assert_eq!(out.rows[0], vec![json!("41"), json!("41200")]);
        assert_eq!(out.rows[3], vec![json!("00"), json!("00010")]);
    }

    #[test]
    fn test_rename_rejects_existing_target() {
        let err = TransformOp::rename("code", "title").apply(noc()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransform(_)));
    }

    #[test]
    fn test_directive_swaps_columns() {
        let directive = SchemaDirective::default()
            .with_rename("code", "title")
            .with_rename("title", "code");
        let (out, _) = apply_ops(noc(), &directive.to_ops()).unwrap();
        assert_eq!(out.columns, vec!["title", "code", "teer", "layer"]);
        assert_eq!(out.value(0, "title"), Some(&json!("00010")));
        assert_eq!(out.value(0, "code"), Some(&json!(" Legislators ")));
    }

    #[test]
    fn test_directive_renames_do_not_chain() {
        let batch = DataBatch::from_rows(vec!["a".into(), "z".into()], vec![vec![json!(1), json!(2)]]);
        let directive = SchemaDirective::default().with_rename("a", "b").with_rename("b", "c");
        let err = apply_ops(batch.clone(), &directive.to_ops()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { ref column } if column == "b"));

        let onto_kept = SchemaDirective::default().with_rename("a", "z");
        assert!(matches!(
            apply_ops(batch.clone(), &onto_kept.to_ops()).unwrap_err(),
            PipelineError::InvalidTransform(_)
        ));

        let merged = TransformOp::RenameColumns {
            columns: BTreeMap::from([("a".into(), "y".into()), ("z".into(), "y".into())]),
        };
        assert!(merged.apply(batch).unwrap_err().to_string().contains("appear twice"));
    }

    #[test]
    fn test_validate_ops_per_layer() {
        let filter = TransformOp::filter(Predicate::eq("code", "1"));
        assert!(validate_ops(std::slice::from_ref(&filter), Layer::Silver).is_ok());
        assert!(validate_ops(std::slice::from_ref(&filter), Layer::Bronze).is_err());
        assert!(validate_ops(&[TransformOp::derive("x", Expr::lit(1))], Layer::Silver).is_err());
        assert!(validate_ops(&[TransformOp::derive("x", Expr::lit(1))], Layer::Gold).is_ok());

        let err = validate_ops(&[TransformOp::rename("layer", "stage")], Layer::Bronze).unwrap_err();
        assert!(err.to_string().contains("provenance column 'layer'"));
    }

    #[test]
    fn test_schema_directive_ops_and_serde() {
        let directive = SchemaDirective::default()
            .with_rename("Code", "code")
            .with_rename("Title", "title")
            .with_cast("teer", ColumnType::Integer);
        let names: Vec<String> = directive.to_ops().iter().map(TransformOp::name).collect();
        assert_eq!(
            names,
            vec!["rename(Code -> code, Title -> title)", "cast(teer: integer)"]
        );

        let json = json!({"renames": {"Code": "code"}, "casts": {"teer": "integer"}});
        let parsed: SchemaDirective = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.casts.get("teer"), Some(&ColumnType::Integer));
    }

    #[test]
    fn test_op_serde_tag() {
        let op: TransformOp = serde_json::from_value(json!({
            "op": "filter",
            "predicate": {"kind": "ne", "column": "code", "value": "00000"}
        }))
        .unwrap();
        assert_eq!(op, TransformOp::filter(Predicate::ne("code", "00000")));
        assert_eq!(op.kind(), "filter");
    }
}
