//! Column types and schema inference for tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Float,
    String,
    Boolean,
    DateTime,
    Json,
    Null,
    Unknown,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
            ColumnType::DateTime => "date_time",
            ColumnType::Json => "json",
            ColumnType::Null => "null",
            ColumnType::Unknown => "unknown",
        }
    }

    /// Inverse of [`ColumnType::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "integer" => Some(ColumnType::Integer),
            "float" => Some(ColumnType::Float),
            "string" => Some(ColumnType::String),
            "boolean" => Some(ColumnType::Boolean),
            "date_time" => Some(ColumnType::DateTime),
            "json" => Some(ColumnType::Json),
            "null" => Some(ColumnType::Null),
            "unknown" => Some(ColumnType::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema definition for a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub columns: Vec<ColumnSchema>,
}

impl SchemaDefinition {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Schema for a single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub dtype: ColumnType,
    pub nullable: bool,
    pub description: Option<String>,
}

/// Infer column type from a sample of values.
///
/// Integers mixed with floats widen to float; any other mix of kinds falls
/// back to string. Integers outside the `i64` range also make the column a
/// string column, so their digits survive.
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a serde_json::Value>) -> ColumnType {
    let mut has_int = false;
    let mut has_wide_int = false;
    let mut has_float = false;
    let mut has_bool = false;
    let mut has_string = false;
    let mut has_nested = false;

    for v in values {
        match v {
            serde_json::Value::Null => {}
            serde_json::Value::Number(n) => {
                if n.is_f64() {
                    has_float = true;
                } else if n.is_i64() {
                    has_int = true;
                } else {
                    has_wide_int = true;
                }
            }
            serde_json::Value::Bool(_) => has_bool = true,
            serde_json::Value::String(_) => has_string = true,
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => has_nested = true,
        }
    }

    if has_wide_int {
        return ColumnType::String;
    }
    let numeric = has_int || has_float;
    let kinds = [numeric, has_bool, has_string, has_nested]
        .iter()
        .filter(|k| **k)
        .count();

    match kinds {
        0 => ColumnType::Null,
        1 if has_float => ColumnType::Float,
        1 if has_int => ColumnType::Integer,
        1 if has_bool => ColumnType::Boolean,
        1 if has_nested => ColumnType::Json,
        _ => ColumnType::String,
    }
}

/// Infer a schema from column names and row-major values.
pub fn infer_schema(columns: &[String], rows: &[Vec<serde_json::Value>]) -> SchemaDefinition {
    let schema_columns = columns
        .iter()
        .enumerate()
        .map(|(i, col_name)| {
            let values = rows.iter().filter_map(|row| row.get(i));
            let dtype = infer_column_type(values);
            let nullable = rows
                .iter()
                .any(|row| row.get(i).is_none_or(|v| v.is_null()));
            ColumnSchema {
                name: col_name.clone(),
                dtype,
                nullable,
                description: None,
            }
        })
        .collect();

    SchemaDefinition {
        columns: schema_columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_column_type_int() {
        let values = [json!(1), json!(2), json!(3)];
        assert_eq!(infer_column_type(&values), ColumnType::Integer);
    }

    #[test]
    fn test_infer_column_type_widens_to_float() {
        let values = [json!(1), json!(2.5), serde_json::Value::Null];
        assert_eq!(infer_column_type(&values), ColumnType::Float);
    }

    #[test]
    fn test_infer_column_type_mixed_falls_back_to_string() {
        let values = [json!("a"), json!(2)];
        assert_eq!(infer_column_type(&values), ColumnType::String);
        let values = [json!(true), json!(2)];
        assert_eq!(infer_column_type(&values), ColumnType::String);
    }

    #[test]
    fn test_infer_column_type_out_of_range_integer_is_string() {
        let values = [json!(1), json!(u64::MAX)];
        assert_eq!(infer_column_type(&values), ColumnType::String);
        assert_eq!(infer_column_type(&[json!(i64::MAX)]), ColumnType::Integer);
    }

    #[test]
    fn test_infer_column_type_nested_and_null() {
        assert_eq!(
            infer_column_type(&[json!({"a": 1}), json!([1, 2])]),
            ColumnType::Json
        );
        assert_eq!(
            infer_column_type(&[serde_json::Value::Null]),
            ColumnType::Null
        );
    }

    #[test]
    fn test_infer_schema() {
        let columns = vec!["noc_code".to_string(), "teer".to_string()];
        let rows = vec![
            vec![json!("21231"), json!(1)],
            vec![json!("41200"), serde_json::Value::Null],
        ];
        let schema = infer_schema(&columns, &rows);
        assert_eq!(schema.columns.len(), 2);
        assert_eq!(schema.columns[0].dtype, ColumnType::String);
        assert!(!schema.columns[0].nullable);
        assert_eq!(schema.columns[1].dtype, ColumnType::Integer);
        assert!(schema.columns[1].nullable);
        assert_eq!(schema.names(), vec!["noc_code", "teer"]);
    }
}
