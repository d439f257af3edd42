//! Row predicates and derived-column expressions.
//!
//! Both are plain data so transform lists can be stored as JSON, inspected
//! before they run, and rendered into stable names for transition logs.

use crate::error::{PipelineError, Result};
use crate::frame::DataBatch;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Compare two cells.
///
/// Numbers compare numerically, strings lexically, and a number against a
/// numeric string compares numerically. Nulls and unrelated kinds do not
/// compare.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::String(y)) => x.as_f64()?.partial_cmp(&y.trim().parse::<f64>().ok()?),
        (Value::String(x), Value::Number(y)) => x.trim().parse::<f64>().ok()?.partial_cmp(&y.as_f64()?),
        _ => None,
    }
}

fn render_value(v: &Value) -> String {
    v.to_string()
}

/// A row filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Eq { column: String, value: Value },
    Ne { column: String, value: Value },
    Gt { column: String, value: Value },
    Ge { column: String, value: Value },
    Lt { column: String, value: Value },
    Le { column: String, value: Value },
    In { column: String, values: Vec<Value> },
    IsNull { column: String },
    NotNull { column: String },
    StartsWith { column: String, prefix: String },
    Matches { column: String, pattern: String },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Ne {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Resolve column names and regexes against `batch`.
    pub fn compile(&self, batch: &DataBatch) -> Result<CompiledPredicate> {
        let compiled = match self {
            Predicate::Eq { column, value } => {
                CompiledPredicate::Compare(batch.require_column(column)?, Cmp::Eq, value.clone())
            }
            Predicate::Ne { column, value } => {
                CompiledPredicate::Compare(batch.require_column(column)?, Cmp::Ne, value.clone())
            }
            Predicate::Gt { column, value } => {
                CompiledPredicate::Compare(batch.require_column(column)?, Cmp::Gt, value.clone())
            }
            Predicate::Ge { column, value } => {
                CompiledPredicate::Compare(batch.require_column(column)?, Cmp::Ge, value.clone())
            }
            Predicate::Lt { column, value } => {
                CompiledPredicate::Compare(batch.require_column(column)?, Cmp::Lt, value.clone())
            }
            Predicate::Le { column, value } => {
                CompiledPredicate::Compare(batch.require_column(column)?, Cmp::Le, value.clone())
            }
            Predicate::In { column, values } => {
                CompiledPredicate::In(batch.require_column(column)?, values.clone())
            }
            Predicate::IsNull { column } => CompiledPredicate::IsNull(batch.require_column(column)?),
            Predicate::NotNull { column } => {
                CompiledPredicate::Not(Box::new(CompiledPredicate::IsNull(batch.require_column(column)?)))
            }
            Predicate::StartsWith { column, prefix } => {
                CompiledPredicate::StartsWith(batch.require_column(column)?, prefix.clone())
            }
            Predicate::Matches { column, pattern } => {
                let re = Regex::new(pattern).map_err(|e| {
                    PipelineError::invalid_transform(format!("bad pattern '{pattern}': {e}"))
                })?;
                CompiledPredicate::Matches(batch.require_column(column)?, re)
            }
            Predicate::And { predicates } => CompiledPredicate::And(
                predicates
                    .iter()
                    .map(|p| p.compile(batch))
                    .collect::<Result<_>>()?,
            ),
            Predicate::Or { predicates } => CompiledPredicate::Or(
                predicates
                    .iter()
                    .map(|p| p.compile(batch))
                    .collect::<Result<_>>()?,
            ),
            Predicate::Not { predicate } => CompiledPredicate::Not(Box::new(predicate.compile(batch)?)),
        };
        Ok(compiled)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Eq { column, value } => write!(f, "{column} == {}", render_value(value)),
            Predicate::Ne { column, value } => write!(f, "{column} != {}", render_value(value)),
            Predicate::Gt { column, value } => write!(f, "{column} > {}", render_value(value)),
            Predicate::Ge { column, value } => write!(f, "{column} >= {}", render_value(value)),
            Predicate::Lt { column, value } => write!(f, "{column} < {}", render_value(value)),
            Predicate::Le { column, value } => write!(f, "{column} <= {}", render_value(value)),
            Predicate::In { column, values } => {
                let rendered: Vec<String> = values.iter().map(render_value).collect();
                write!(f, "{column} in [{}]", rendered.join(", "))
            }
            Predicate::IsNull { column } => write!(f, "{column} is null"),
            Predicate::NotNull { column } => write!(f, "{column} is not null"),
            Predicate::StartsWith { column, prefix } => write!(f, "{column} starts with {prefix:?}"),
            Predicate::Matches { column, pattern } => write!(f, "{column} ~ /{pattern}/"),
            Predicate::And { predicates } => {
                let parts: Vec<String> = predicates.iter().map(|p| format!("({p})")).collect();
                write!(f, "{}", parts.join(" and "))
            }
            Predicate::Or { predicates } => {
                let parts: Vec<String> = predicates.iter().map(|p| format!("({p})")).collect();
                write!(f, "{}", parts.join(" or "))
            }
            Predicate::Not { predicate } => write!(f, "not ({predicate})"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A predicate bound to column indices.
#[derive(Debug)]
pub enum CompiledPredicate {
    Compare(usize, Cmp, Value),
    In(usize, Vec<Value>),
    IsNull(usize),
    StartsWith(usize, String),
    Matches(usize, Regex),
    And(Vec<CompiledPredicate>),
    Or(Vec<CompiledPredicate>),
    Not(Box<CompiledPredicate>),
}

impl CompiledPredicate {
    /// Evaluate against one row. Comparisons with a null cell are false.
    pub fn matches(&self, row: &[Value]) -> bool {
        match self {
            CompiledPredicate::Compare(idx, cmp, value) => {
                let Some(ordering) = compare_values(&row[*idx], value) else {
                    return false;
                };
                match cmp {
                    Cmp::Eq => ordering == Ordering::Equal,
                    Cmp::Ne => ordering != Ordering::Equal,
                    Cmp::Gt => ordering == Ordering::Greater,
                    Cmp::Ge => ordering != Ordering::Less,
                    Cmp::Lt => ordering == Ordering::Less,
                    Cmp::Le => ordering != Ordering::Greater,
                }
            }
            CompiledPredicate::In(idx, values) => values
                .iter()
                .any(|v| compare_values(&row[*idx], v) == Some(Ordering::Equal)),
            CompiledPredicate::IsNull(idx) => row[*idx].is_null(),
            CompiledPredicate::StartsWith(idx, prefix) => {
                row[*idx].as_str().is_some_and(|s| s.starts_with(prefix.as_str()))
            }
            CompiledPredicate::Matches(idx, re) => row[*idx].as_str().is_some_and(|s| re.is_match(s)),
            CompiledPredicate::And(parts) => parts.iter().all(|p| p.matches(row)),
            CompiledPredicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
            CompiledPredicate::Not(inner) => !inner.matches(row),
        }
    }
}

/// Arithmetic operator for [`Expr::Arith`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    fn symbol(&self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
        }
    }
}

/// Expression producing one value per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Column(String),
    Literal(Value),
    Concat {
        parts: Vec<Expr>,
        #[serde(default)]
        separator: String,
    },
    Upper(Box<Expr>),
    Lower(Box<Expr>),
    Trim(Box<Expr>),
    /// Character-based substring; `start` is zero-based.
    Substring {
        expr: Box<Expr>,
        start: usize,
        #[serde(default)]
        length: Option<usize>,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Coalesce(Vec<Expr>),
    When {
        predicate: Predicate,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn compile(&self, batch: &DataBatch) -> Result<CompiledExpr> {
        let compiled = match self {
            Expr::Column(name) => CompiledExpr::Column(batch.require_column(name)?),
            Expr::Literal(v) => CompiledExpr::Literal(v.clone()),
            Expr::Concat { parts, separator } => CompiledExpr::Concat(
                parts
                    .iter()
                    .map(|p| p.compile(batch))
                    .collect::<Result<_>>()?,
                separator.clone(),
            ),
            Expr::Upper(inner) => CompiledExpr::Upper(Box::new(inner.compile(batch)?)),
            Expr::Lower(inner) => CompiledExpr::Lower(Box::new(inner.compile(batch)?)),
            Expr::Trim(inner) => CompiledExpr::Trim(Box::new(inner.compile(batch)?)),
            Expr::Substring {
                expr,
                start,
                length,
            } => CompiledExpr::Substring(Box::new(expr.compile(batch)?), *start, *length),
            Expr::Arith { op, left, right } => CompiledExpr::Arith(
                *op,
                Box::new(left.compile(batch)?),
                Box::new(right.compile(batch)?),
            ),
            Expr::Coalesce(parts) => CompiledExpr::Coalesce(
                parts
                    .iter()
                    .map(|p| p.compile(batch))
                    .collect::<Result<_>>()?,
            ),
            Expr::When {
                predicate,
                then,
                otherwise,
            } => CompiledExpr::When(
                predicate.compile(batch)?,
                Box::new(then.compile(batch)?),
                Box::new(otherwise.compile(batch)?),
            ),
        };
        Ok(compiled)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column(name) => write!(f, "{name}"),
            Expr::Literal(v) => write!(f, "{}", render_value(v)),
            Expr::Concat { parts, separator } => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "concat({}; sep={separator:?})", rendered.join(", "))
            }
            Expr::Upper(inner) => write!(f, "upper({inner})"),
            Expr::Lower(inner) => write!(f, "lower({inner})"),
            Expr::Trim(inner) => write!(f, "trim({inner})"),
            Expr::Substring {
                expr,
                start,
                length,
            } => match length {
                Some(len) => write!(f, "substring({expr}, {start}, {len})"),
                None => write!(f, "substring({expr}, {start})"),
            },
            Expr::Arith { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Coalesce(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                write!(f, "coalesce({})", rendered.join(", "))
            }
            Expr::When {
                predicate,
                then,
                otherwise,
            } => write!(f, "when({predicate}, {then}, {otherwise})"),
        }
    }
}

/// An expression bound to column indices.
#[derive(Debug)]
pub enum CompiledExpr {
    Column(usize),
    Literal(Value),
    Concat(Vec<CompiledExpr>, String),
    Upper(Box<CompiledExpr>),
    Lower(Box<CompiledExpr>),
    Trim(Box<CompiledExpr>),
    Substring(Box<CompiledExpr>, usize, Option<usize>),
    Arith(ArithOp, Box<CompiledExpr>, Box<CompiledExpr>),
    Coalesce(Vec<CompiledExpr>),
    When(CompiledPredicate, Box<CompiledExpr>, Box<CompiledExpr>),
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn map_text(v: Value, f: impl Fn(&str) -> String) -> Value {
    as_text(&v).map(|s| Value::String(f(&s))).unwrap_or(Value::Null)
}

impl CompiledExpr {
    /// Evaluate against one row. Null inputs propagate to a null output,
    /// except inside `coalesce` and `concat` (which skips nulls).
    pub fn eval(&self, row: &[Value]) -> Value {
        match self {
            CompiledExpr::Column(idx) => row[*idx].clone(),
            CompiledExpr::Literal(v) => v.clone(),
            CompiledExpr::Concat(parts, separator) => {
                let texts: Vec<String> = parts.iter().filter_map(|p| as_text(&p.eval(row))).collect();
                if texts.is_empty() {
                    Value::Null
                } else {
                    Value::String(texts.join(separator))
                }
            }
            CompiledExpr::Upper(inner) => map_text(inner.eval(row), |s| s.to_uppercase()),
            CompiledExpr::Lower(inner) => map_text(inner.eval(row), |s| s.to_lowercase()),
            CompiledExpr::Trim(inner) => map_text(inner.eval(row), |s| s.trim().to_string()),
            CompiledExpr::Substring(inner, start, length) => map_text(inner.eval(row), |s| {
                let chars = s.chars().skip(*start);
                match length {
                    Some(len) => chars.take(*len).collect(),
                    None => chars.collect(),
                }
            }),
            CompiledExpr::Arith(op, left, right) => {
                let (l, r) = (left.eval(row), right.eval(row));
                let (Some(a), Some(b)) = (as_number(&l), as_number(&r)) else {
                    return Value::Null;
                };
                if let (Some(x), Some(y)) = (l.as_i64(), r.as_i64()) {
                    let exact = match op {
                        ArithOp::Add => x.checked_add(y),
                        ArithOp::Sub => x.checked_sub(y),
                        ArithOp::Mul => x.checked_mul(y),
                        ArithOp::Div => None,
                    };
                    if let Some(v) = exact {
                        return Value::from(v);
                    }
                }
                match op {
                    ArithOp::Add => float_value(a + b),
                    ArithOp::Sub => float_value(a - b),
                    ArithOp::Mul => float_value(a * b),
                    ArithOp::Div if b == 0.0 => Value::Null,
                    ArithOp::Div => float_value(a / b),
                }
            }
            CompiledExpr::Coalesce(parts) => parts
                .iter()
                .map(|p| p.eval(row))
                .find(|v| !v.is_null())
                .unwrap_or(Value::Null),
            CompiledExpr::When(predicate, then, otherwise) => {
                if predicate.matches(row) {
                    then.eval(row)
                } else {
                    otherwise.eval(row)
                }
            }
        }
    }
}

fn float_value(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch() -> DataBatch {
        DataBatch::from_rows(
            vec!["code".into(), "title".into(), "openings".into()],
            vec![
                vec![json!("00000"), json!("  All occupations "), json!(1000)],
                vec![json!("21231"), json!("Software engineers"), json!(250)],
                vec![json!("41200"), Value::Null, Value::Null],
            ],
        )
    }

    #[test]
    fn test_compare_values_mixed_numeric() {
        assert_eq!(compare_values(&json!(5), &json!("5")), Some(Ordering::Equal));
        assert_eq!(compare_values(&json!("10"), &json!(9.5)), Some(Ordering::Greater));
        assert_eq!(compare_values(&json!("abc"), &json!(1)), None);
        assert_eq!(compare_values(&Value::Null, &json!(1)), None);
    }

    #[test]
    fn test_ne_excludes_nulls() {
        let b = batch();
        let pred = Predicate::ne("openings", 250).compile(&b).unwrap();
        let kept: Vec<bool> = b.rows.iter().map(|r| pred.matches(r)).collect();
        assert_eq!(kept, vec![true, false, false]);
    }

    #[test]
    fn test_compound_predicates() {
        let b = batch();
        let pred = Predicate::And {
            predicates: vec![
                Predicate::NotNull {
                    column: "title".into(),
                },
                Predicate::Matches {
                    column: "code".into(),
                    pattern: "^2".into(),
                },
            ],
        };
        let compiled = pred.compile(&b).unwrap();
        let kept: Vec<bool> = b.rows.iter().map(|r| compiled.matches(r)).collect();
        assert_eq!(kept, vec![false, true, false]);
        assert_eq!(pred.to_string(), "(title is not null) and (code ~ /^2/)");
    }

    #[test]
    fn test_compile_reports_missing_column_and_bad_regex() {
        let b = batch();
        assert!(matches!(
            Predicate::eq("nope", 1).compile(&b),
            Err(PipelineError::MissingColumn { .. })
        ));
        let bad = Predicate::Matches {
            column: "code".into(),
            pattern: "(".into(),
        };
        assert!(matches!(
            bad.compile(&b),
            Err(PipelineError::InvalidTransform(_))
        ));
    }

    #[test]
    fn test_expr_eval() {
        let b = batch();
        let label = Expr::Concat {
            parts: vec![Expr::col("code"), Expr::Trim(Box::new(Expr::col("title")))],
            separator: " - ".into(),
        }
        .compile(&b)
        .unwrap();
        assert_eq!(label.eval(&b.rows[0]), json!("00000 - All occupations"));
        assert_eq!(label.eval(&b.rows[2]), json!("41200"));

        let half = Expr::Arith {
            op: ArithOp::Div,
            left: Box::new(Expr::col("openings")),
            right: Box::new(Expr::lit(2)),
        }
        .compile(&b)
        .unwrap();
        assert_eq!(half.eval(&b.rows[1]), json!(125.0));
        assert_eq!(half.eval(&b.rows[2]), Value::Null);

        let major = Expr::Substring {
            expr: Box::new(Expr::col("code")),
            start: 0,
            length: Some(1),
        }
        .compile(&b)
        .unwrap();
        assert_eq!(major.eval(&b.rows[1]), json!("2"));
    }

    #[test]
    fn test_expr_serde_shape() {
        let expr = Expr::Upper(Box::new(Expr::col("title")));
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json, json!({"upper": {"column": "title"}}));
        let back: Expr = serde_json::from_value(json).unwrap();
        assert_eq!(back, expr);
    }
}
