//! Typed columns and the declared shape of raw records.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    Json,
    StringList,
    IntList,
}

impl ColumnType {
    /// Coerce a transform result into a datum of this type.
    ///
    /// Never fails: values that cannot be represented become [`Datum::Null`].
    pub fn coerce(self, value: Value) -> Datum {
        if value.is_null() {
            return Datum::Null;
        }
        let datum = match self {
            ColumnType::Bool => coerce_bool(&value).map(Datum::Bool),
            ColumnType::Int => coerce_int(&value).map(Datum::Int),
            ColumnType::Float => coerce_float(&value).map(Datum::Float),
            ColumnType::String => Some(Datum::String(coerce_string(value))),
            ColumnType::Timestamp => value
                .as_str()
                .and_then(parse_timestamp)
                .map(Datum::Timestamp),
            ColumnType::Json => Some(Datum::Json(value)),
            ColumnType::StringList => Some(Datum::StringList(match value {
                Value::Array(items) => items
                    .into_iter()
                    .filter(|v| !v.is_null())
                    .map(coerce_string)
                    .collect(),
                other => vec![coerce_string(other)],
            })),
            ColumnType::IntList => match value {
                Value::Array(items) => Some(Datum::IntList(
                    items.iter().filter_map(coerce_int).collect(),
                )),
                other => coerce_int(&other).map(|n| Datum::IntList(vec![n])),
            },
        };
        datum.unwrap_or(Datum::Null)
    }
}

fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Parse RFC 3339, or the offset-less form the compute and block storage
/// APIs emit (`2024-01-31T12:00:00.000000`), which is taken as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
    StringList(Vec<String>),
    IntList(Vec<i64>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Datum::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// One declared field of a record: the serialized key it is read from,
/// the column name it is published under, and its column type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub key: &'static str,
    pub name: &'static str,
    pub ty: ColumnType,
}

/// The declared shape of a record type.
///
/// Default columns for a table are derived from this, one per field.
/// Nested records are declared as a single `Json` field; their structure
/// is only surfaced through explicit columns or relation tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shape {
    fields: Vec<Field>,
}

impl Shape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field published under its own key.
    pub fn field(self, key: &'static str, ty: ColumnType) -> Self {
        self.field_as(key, key, ty)
    }

    /// Declare a field published under a different column name.
    pub fn field_as(mut self, key: &'static str, name: &'static str, ty: ColumnType) -> Self {
        self.fields.push(Field { key, name, ty });
        self
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }
}

/// A raw item type a collector can emit.
///
/// Items are serialized once on emission; transform chains navigate the
/// serialized form, so field paths use serialized keys.
pub trait Record: Serialize + Send + Sync + 'static {
    /// Declared fields, used to derive default columns.
    fn shape() -> Shape;
}

impl Record for Value {
    fn shape() -> Shape {
        Shape::new()
    }
}

impl Record for () {
    fn shape() -> Shape {
        Shape::new()
    }
}

/// A batch of records, typically unnested into one row per element.
impl<T: Record> Record for Vec<T> {
    fn shape() -> Shape {
        T::shape()
    }
}
