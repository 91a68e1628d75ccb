//! Per-column conversion of raw text cells into typed values.
//!
//! Every conversion tolerates blank or missing input and returns the sentinel
//! supplied by the caller instead of failing.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::value::Value;
use crate::db::schema::SqlType;

pub const DEFAULT_DATE_FORMAT: &str = "%Y%m%d";

/// Width that subject person numbers are zero-padded to
pub const SPN_WIDTH: usize = 8;

#[derive(Debug, Error, PartialEq)]
pub enum ConversionError {
    #[error("Cannot convert '{value}' to {target}: {reason}")]
    Invalid {
        value: String,
        target: &'static str,
        reason: String,
    },

    #[error("Required column '{0}' is missing from the source file")]
    MissingColumn(String),
}

/// How a raw column value is converted before insertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversion {
    Text,
    Integer,
    Float,
    Date {
        #[serde(default = "default_date_format")]
        format: String,
    },
    /// Subject person number: trimmed text left-padded with zeros
    Spn,
}

fn default_date_format() -> String {
    DEFAULT_DATE_FORMAT.to_string()
}

impl Conversion {
    /// The conversion used when a column does not name one explicitly
    pub fn for_type(sql_type: &SqlType) -> Self {
        match sql_type {
            SqlType::SmallInt | SqlType::Integer | SqlType::BigInt => Conversion::Integer,
            SqlType::Real | SqlType::DoublePrecision => Conversion::Float,
            SqlType::Date => Conversion::Date {
                format: default_date_format(),
            },
            SqlType::Text | SqlType::Varchar(_) => Conversion::Text,
        }
    }

    pub fn date(format: &str) -> Self {
        Conversion::Date {
            format: format.to_string(),
        }
    }

    /// Convert a raw cell, returning `sentinel` for blank or missing input
    pub fn apply(&self, raw: Option<&str>, sentinel: Value) -> Result<Value, ConversionError> {
        let trimmed = match raw.map(str::trim) {
            None | Some("") => return Ok(sentinel),
            Some(t) => t,
        };

        match self {
            Conversion::Text => Ok(Value::Text(trimmed.to_string())),
            Conversion::Integer => parse_integer(trimmed).map(Value::Integer),
            Conversion::Float => trimmed
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| invalid(trimmed, "float", e)),
            Conversion::Date { format } => NaiveDate::parse_from_str(trimmed, format)
                .map(Value::Date)
                .map_err(|e| invalid(trimmed, "date", e)),
            Conversion::Spn => Ok(Value::Text(format!("{:0>width$}", trimmed, width = SPN_WIDTH))),
        }
    }
}

/// Integers may arrive as decimal text (`"12.0"`); the fraction is truncated
fn parse_integer(value: &str) -> Result<i64, ConversionError> {
    if let Ok(i) = value.parse::<i64>() {
        return Ok(i);
    }
    let f = value
        .parse::<f64>()
        .map_err(|e| invalid(value, "integer", e))?;
    if !f.is_finite() || f.abs() >= i64::MAX as f64 {
        return Err(invalid(value, "integer", "out of range"));
    }
    Ok(f.trunc() as i64)
}

fn invalid(value: &str, target: &'static str, reason: impl ToString) -> ConversionError {
    ConversionError::Invalid {
        value: value.to_string(),
        target,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_input_returns_sentinel() {
        for conversion in [
            Conversion::Text,
            Conversion::Integer,
            Conversion::Float,
            Conversion::date(DEFAULT_DATE_FORMAT),
            Conversion::Spn,
        ] {
            assert_eq!(conversion.apply(None, Value::Null), Ok(Value::Null));
            assert_eq!(conversion.apply(Some("   "), Value::Null), Ok(Value::Null));
            assert_eq!(
                conversion.apply(Some(""), Value::Integer(-1)),
                Ok(Value::Integer(-1))
            );
        }
    }

    #[test]
    fn test_integer_conversion() {
        assert_eq!(Conversion::Integer.apply(Some(" 42 "), Value::Null), Ok(Value::Integer(42)));
        assert_eq!(Conversion::Integer.apply(Some("12.0"), Value::Null), Ok(Value::Integer(12)));
        assert!(Conversion::Integer.apply(Some("abc"), Value::Null).is_err());
    }

    #[test]
    fn test_date_conversion() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        assert_eq!(
            Conversion::date(DEFAULT_DATE_FORMAT).apply(Some("20240105"), Value::Null),
            Ok(Value::Date(expected))
        );
        assert_eq!(
            Conversion::date("%m/%d/%Y").apply(Some("01/05/2024"), Value::Null),
            Ok(Value::Date(expected))
        );
        assert!(
            Conversion::date(DEFAULT_DATE_FORMAT)
                .apply(Some("2024-13-40"), Value::Null)
                .is_err()
        );
    }

    #[test]
    fn test_spn_is_zero_padded() {
        assert_eq!(
            Conversion::Spn.apply(Some("12345"), Value::Null),
            Ok(Value::from("00012345"))
        );
        assert_eq!(
            Conversion::Spn.apply(Some("123456789"), Value::Null),
            Ok(Value::from("123456789"))
        );
    }

    #[test]
    fn test_default_conversion_for_type() {
        assert_eq!(Conversion::for_type(&SqlType::BigInt), Conversion::Integer);
        assert_eq!(Conversion::for_type(&SqlType::Varchar(8)), Conversion::Text);
        assert_eq!(
            Conversion::for_type(&SqlType::Date),
            Conversion::date(DEFAULT_DATE_FORMAT)
        );
    }

    #[test]
    fn test_deserialize_conversion() {
        let c: Conversion = serde_json::from_str(r#"{"kind":"date"}"#).unwrap();
        assert_eq!(c, Conversion::date(DEFAULT_DATE_FORMAT));
        let c: Conversion = serde_json::from_str(r#"{"kind":"spn"}"#).unwrap();
        assert_eq!(c, Conversion::Spn);
    }
}
