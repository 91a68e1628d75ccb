//! Typed cell values and their rendering as SQL literals.
//!
//! Rows reach the insert pipeline already converted, so the only decision left
//! is how each value is written into a multi-row `VALUES` list.

use chrono::NaiveDate;
use thiserror::Error;

use crate::db::Backend;

/// A converted cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

#[derive(Debug, Error, PartialEq)]
pub enum LiteralError {
    #[error("Non-finite float {0} cannot be rendered as a SQL literal")]
    NonFinite(f64),
}

impl Value {
    /// True for values that carry no data: NULL, NaN, and blank text
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(f) => f.is_nan(),
            Value::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Render this value as a SQL literal for the given backend
    pub fn to_sql_literal(&self, backend: Backend) -> Result<String, LiteralError> {
        match self {
            Value::Null => Ok("NULL".to_string()),
            Value::Float(f) if f.is_nan() => Ok("NULL".to_string()),
            Value::Float(f) if f.is_infinite() => Err(LiteralError::NonFinite(*f)),
            Value::Float(f) => Ok(f.to_string()),
            Value::Integer(i) => Ok(i.to_string()),
            Value::Text(s) => Ok(quote_string(s, backend)),
            Value::Date(d) => Ok(format!("'{}'", d.format("%Y-%m-%d"))),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

fn quote_string(s: &str, backend: Backend) -> String {
    let mut escaped = s.replace('\'', "''");
    // MySQL treats backslash as an escape character inside string literals
    if backend == Backend::MySql {
        escaped = escaped.replace('\\', "\\\\");
    }
    format!("'{escaped}'")
}

/// Render one row as a parenthesised tuple: `('a', 1, NULL)`
pub fn render_row(values: &[Value], backend: Backend) -> Result<String, LiteralError> {
    let literals = values
        .iter()
        .map(|v| v.to_sql_literal(backend))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!("({})", literals.join(", ")))
}
