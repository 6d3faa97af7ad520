//! Typed cell values and column types
//!
//! Every cell flowing through the loader is a [`Value`]. Equality is exact:
//! `Null` equals `Null`, floats compare by bit pattern, and values of
//! different variants are never equal. This is the comparison the SCD2
//! loader uses for change detection.

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Logical column type of a batch column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Text,
    Date,
    Timestamp,
    Uuid,
}

impl ColumnType {
    /// SQL type name used when generating DDL
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
            ColumnType::Date => "DATE",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Uuid => "UUID",
        }
    }

    /// Whether `value` may be stored in a column of this type
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (ColumnType::Boolean, Value::Bool(_))
                | (ColumnType::Integer, Value::Int(_))
                | (ColumnType::Float, Value::Float(_))
                | (ColumnType::Float, Value::Int(_))
                | (ColumnType::Text, Value::Text(_))
                | (ColumnType::Date, Value::Date(_))
                | (ColumnType::Timestamp, Value::Timestamp(_))
                | (ColumnType::Uuid, Value::Uuid(_))
        )
    }
}

impl std::str::FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bool" | "boolean" => Ok(ColumnType::Boolean),
            "int" | "integer" | "bigint" => Ok(ColumnType::Integer),
            "float" | "double" | "numeric" => Ok(ColumnType::Float),
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            "date" => Ok(ColumnType::Date),
            "timestamp" | "datetime" => Ok(ColumnType::Timestamp),
            "uuid" => Ok(ColumnType::Uuid),
            _ => Err(format!("Unknown column type: {}", s)),
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Uuid => "uuid",
        };
        write!(f, "{}", name)
    }
}

/// A single cell value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Uuid(Uuid),
    Text(String),
}

/// Drop sub-microsecond digits
pub fn truncate_to_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// Convert a JSON value into a cell of the given column type
    pub fn from_json(json: &serde_json::Value, column_type: ColumnType) -> Result<Self, String> {
        use serde_json::Value as Json;

        if json.is_null() {
            return Ok(Value::Null);
        }

        let converted = match (column_type, json) {
            (ColumnType::Boolean, Json::Bool(b)) => Some(Value::Bool(*b)),
            (ColumnType::Integer, Json::Number(n)) => n.as_i64().map(Value::Int),
            (ColumnType::Float, Json::Number(n)) => n.as_f64().map(Value::Float),
            (ColumnType::Text, Json::String(s)) => Some(Value::Text(s.clone())),
            (ColumnType::Text, Json::Number(n)) => Some(Value::Text(n.to_string())),
            (ColumnType::Date, Json::String(s)) => {
                NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().map(Value::Date)
            }
            (ColumnType::Timestamp, Json::String(s)) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| Value::Timestamp(t.with_timezone(&Utc))),
            (ColumnType::Uuid, Json::String(s)) => Uuid::parse_str(s).ok().map(Value::Uuid),
            _ => None,
        };

        converted.ok_or_else(|| format!("cannot read {} as {}", json, column_type))
    }

    /// Normalize a value to a column type
    ///
    /// Backends hand back what the driver reports (integers for float
    /// columns holding whole numbers, text for UUID columns, and so on).
    /// Timestamps are cut to the microsecond precision both stores keep.
    /// Values that cannot be converted are returned unchanged and will
    /// compare unequal.
    pub fn coerce_to(self, column_type: ColumnType) -> Value {
        match (column_type, self) {
            (ColumnType::Timestamp, Value::Timestamp(t)) => Value::Timestamp(truncate_to_micros(t)),
            (ColumnType::Float, Value::Int(i)) => Value::Float(i as f64),
            (ColumnType::Integer, Value::Float(f)) if f.fract() == 0.0 => Value::Int(f as i64),
            (ColumnType::Boolean, Value::Int(i)) => Value::Bool(i != 0),
            (ColumnType::Uuid, Value::Text(s)) => match Uuid::parse_str(&s) {
                Ok(u) => Value::Uuid(u),
                Err(_) => Value::Text(s),
            },
            (ColumnType::Text, Value::Uuid(u)) => Value::Text(u.to_string()),
            (ColumnType::Timestamp, Value::Text(s)) => match DateTime::parse_from_rfc3339(&s) {
                Ok(t) => Value::Timestamp(truncate_to_micros(t.with_timezone(&Utc))),
                Err(_) => Value::Text(s),
            },
            (ColumnType::Date, Value::Timestamp(t)) => Value::Date(t.date_naive()),
            (ColumnType::Date, Value::Text(s)) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                Ok(d) => Value::Date(d),
                Err(_) => Value::Text(s),
            },
            (_, other) => other,
        }
    }

    /// Render the value for display output
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Timestamp(t) => t.to_rfc3339(),
            Value::Date(d) => d.to_string(),
            Value::Uuid(u) => u.to_string(),
            Value::Text(s) => s.clone(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Timestamp(t) => t.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Uuid(u) => u.hash(state),
            Value::Text(s) => s.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Value::Timestamp(t)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_null_equals_null() {
        assert_eq!(Value::Null, Value::Null);
        assert_ne!(Value::Null, Value::Text(String::new()));
    }

    #[test]
    fn test_float_equality_is_exact() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
        assert_ne!(Value::Float(1.5), Value::Float(1.5000001));
    }

    #[test]
    fn test_variants_never_cross_compare() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Text("1".to_string()));
    }

    #[test]
    fn test_values_usable_as_set_keys() {
        let mut keys = HashSet::new();
        assert!(keys.insert(Value::Int(1)));
        assert!(keys.insert(Value::Text("1".to_string())));
        assert!(!keys.insert(Value::Int(1)));
    }

    #[test]
    fn test_from_json_typed() {
        let ts = Value::from_json(
            &serde_json::json!("2024-03-01T10:00:00Z"),
            ColumnType::Timestamp,
        )
        .unwrap();
        assert!(matches!(ts, Value::Timestamp(_)));

        assert_eq!(
            Value::from_json(&serde_json::json!(42), ColumnType::Integer).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            Value::from_json(&serde_json::Value::Null, ColumnType::Text).unwrap(),
            Value::Null
        );
        assert!(Value::from_json(&serde_json::json!("abc"), ColumnType::Integer).is_err());
    }

    #[test]
    fn test_coerce_store_values() {
        let id = Uuid::new_v4();
        assert_eq!(
            Value::Text(id.to_string()).coerce_to(ColumnType::Uuid),
            Value::Uuid(id)
        );
        assert_eq!(Value::Int(3).coerce_to(ColumnType::Float), Value::Float(3.0));
        assert_eq!(Value::Null.coerce_to(ColumnType::Float), Value::Null);
        assert_eq!(
            Value::Text("not-a-uuid".into()).coerce_to(ColumnType::Uuid),
            Value::Text("not-a-uuid".into())
        );
    }

    #[test]
    fn test_coerce_truncates_timestamps_to_micros() {
        let nanos = DateTime::parse_from_rfc3339("2024-01-15T08:30:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let micros = DateTime::parse_from_rfc3339("2024-01-15T08:30:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);

        assert_eq!(
            Value::Timestamp(nanos).coerce_to(ColumnType::Timestamp),
            Value::Timestamp(micros)
        );
        assert_eq!(
            Value::Text("2024-01-15T08:30:00.123456789Z".into()).coerce_to(ColumnType::Timestamp),
            Value::Timestamp(micros)
        );
    }

    #[test]
    fn test_column_type_from_str() {
        assert_eq!(
            "integer".parse::<ColumnType>().unwrap(),
            ColumnType::Integer
        );
        assert_eq!("VARCHAR".parse::<ColumnType>().unwrap(), ColumnType::Text);
        assert!("blob".parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_column_type_accepts() {
        assert!(ColumnType::Text.accepts(&Value::Null));
        assert!(ColumnType::Float.accepts(&Value::Int(3)));
        assert!(!ColumnType::Integer.accepts(&Value::Text("3".to_string())));
    }
}
