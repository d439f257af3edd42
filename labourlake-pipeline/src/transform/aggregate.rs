//! Group-by aggregation for gold tables.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::expr::compare_values;
use crate::error::{PipelineError, Result};
use crate::frame::{ColumnType, DataBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    CountDistinct,
    Sum,
    Mean,
    Min,
    Max,
    First,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::CountDistinct => "count_distinct",
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::First => "first",
        }
    }
}

/// One output column of an aggregate. `column` may only be omitted for
/// `count`, which then counts rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    #[serde(default)]
    pub column: Option<String>,
    pub func: AggFunc,
    pub alias: String,
}

impl Aggregation {
    pub fn new(column: Option<&str>, func: AggFunc, alias: impl Into<String>) -> Self {
        Self {
            column: column.map(str::to_string),
            func,
            alias: alias.into(),
        }
    }

    pub fn name(&self) -> String {
        format!(
            "{}({}) as {}",
            self.func.as_str(),
            self.column.as_deref().unwrap_or("*"),
            self.alias
        )
    }
}

struct Bound {
    idx: Option<usize>,
    func: AggFunc,
    dtype: ColumnType,
}

fn output_type(func: AggFunc, input: Option<ColumnType>) -> ColumnType {
    match (func, input) {
        (AggFunc::Count | AggFunc::CountDistinct, _) => ColumnType::Integer,
        (AggFunc::Mean, _) => ColumnType::Float,
        (AggFunc::Sum, Some(ColumnType::Integer)) => ColumnType::Integer,
        (AggFunc::Sum, _) => ColumnType::Float,
        (_, Some(dtype)) => dtype,
        (_, None) => ColumnType::Unknown,
    }
}

fn numbers<'a>(rows: impl Iterator<Item = &'a Value>) -> Vec<f64> {
    rows.filter_map(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
    .collect()
}

fn reduce(bound: &Bound, rows: &[&Vec<Value>]) -> Value {
    let Some(idx) = bound.idx else {
        return Value::from(rows.len() as u64);
    };
    let cells = || rows.iter().map(|r| &r[idx]).filter(|v| !v.is_null());
    match bound.func {
        AggFunc::Count => Value::from(cells().count() as u64),
        AggFunc::CountDistinct => {
            let distinct: HashSet<String> = cells().map(|v| v.to_string()).collect();
            Value::from(distinct.len() as u64)
        }
        AggFunc::Sum if bound.dtype == ColumnType::Integer => {
            let total = cells()
                .filter_map(Value::as_i64)
                .try_fold(0i64, |acc, v| acc.checked_add(v));
            total.map(Value::from).unwrap_or(Value::Null)
        }
        AggFunc::Sum => {
            let values = numbers(cells());
            if values.is_empty() {
                Value::Null
            } else {
                float(values.iter().sum())
            }
        }
        AggFunc::Mean => {
            let values = numbers(cells());
            if values.is_empty() {
                Value::Null
            } else {
                float(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        AggFunc::Min => extreme(cells(), Ordering::Less),
        AggFunc::Max => extreme(cells(), Ordering::Greater),
        AggFunc::First => cells().next().cloned().unwrap_or(Value::Null),
    }
}

fn extreme<'a>(cells: impl Iterator<Item = &'a Value>, want: Ordering) -> Value {
    cells
        .fold(None::<&Value>, |best, v| match best {
            Some(b) if compare_values(v, b) != Some(want) => Some(b),
            _ => Some(v),
        })
        .cloned()
        .unwrap_or(Value::Null)
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Group `batch` by `group_by` and reduce each group.
///
/// Groups appear in first-seen order. Columns not named in `group_by` or an
/// aggregation are dropped.
pub fn aggregate(batch: &DataBatch, group_by: &[String], aggregations: &[Aggregation]) -> Result<DataBatch> {
    if aggregations.is_empty() && group_by.is_empty() {
        return Err(PipelineError::invalid_transform(
            "aggregate needs at least one group column or aggregation",
        ));
    }
    let key_idx = group_by
        .iter()
        .map(|c| batch.require_column(c))
        .collect::<Result<Vec<_>>>()?;
    let bound = aggregations
        .iter()
        .map(|agg| {
            let idx = match (&agg.column, agg.func) {
                (Some(c), _) => Some(batch.require_column(c)?),
                (None, AggFunc::Count) => None,
                (None, func) => {
                    return Err(PipelineError::invalid_transform(format!(
                        "{} requires a column",
                        func.as_str()
                    )));
                }
            };
            Ok(Bound {
                idx,
                func: agg.func,
                dtype: output_type(agg.func, idx.map(|i| batch.dtypes[i])),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut order: Vec<Vec<Value>> = Vec::new();
    let mut groups: HashMap<String, Vec<&Vec<Value>>> = HashMap::new();
    for row in &batch.rows {
        let key: Vec<Value> = key_idx.iter().map(|i| row[*i].clone()).collect();
        let fingerprint = serde_json::to_string(&key)?;
        let members = groups.entry(fingerprint).or_insert_with(|| {
            order.push(key.clone());
            Vec::new()
        });
        members.push(row);
    }

    let mut columns: Vec<String> = group_by.to_vec();
    let mut dtypes: Vec<ColumnType> = key_idx.iter().map(|i| batch.dtypes[*i]).collect();
    for (agg, b) in aggregations.iter().zip(&bound) {
        columns.push(agg.alias.clone());
        dtypes.push(b.dtype);
    }

    let mut rows = Vec::with_capacity(order.len());
    for key in order {
        let fingerprint = serde_json::to_string(&key)?;
        let members = groups.get(&fingerprint).map(Vec::as_slice).unwrap_or(&[]);
        let mut row = key;
        row.extend(bound.iter().map(|b| reduce(b, members)));
        rows.push(row);
    }
    DataBatch::new(columns, dtypes, rows)
}
