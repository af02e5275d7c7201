//! Value algebra for dataset documents.
//!
//! Every solver output is a value in this algebra: a scalar, a sequence, or
//! an order-preserving map. Scalars cover the types the coercion layer can
//! produce, including naive (timezone-less) chrono values. `Key` is the
//! hashable projection of scalar values used for grouping, keying and
//! entity-id lookup.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A flat record produced from one result row: column name -> value.
pub type RecordMap = IndexMap<String, Value>;

/// Recursive document value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Raw column bytes, kept until the connection encoding decodes them.
    Bytes(Vec<u8>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    Seq(Vec<Value>),
    Map(RecordMap),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view used by `query.filter` and id matching. Strings are
    /// parsed, floats with no fractional part are accepted.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    /// Stringification used by coercion, translation lookups and SQL
    /// literals. Dates render in ISO-8601 so they survive a re-parse.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.6f")),
            Value::Seq(_) | Value::Map(_) => {
                let rendered = serde_json::to_string(self).unwrap_or_default();
                write!(f, "{}", rendered)
            }
        }
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

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<serde_json::Value> for Value {
    /// Conversion for JSON/JSONB columns and JSON-shaped fixtures.
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Map(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Identifier of a business entity: the id half of (EntityType, EntityId).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Str(String),
}

impl EntityId {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            EntityId::Int(i) => Some(*i),
            EntityId::Str(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(i) => write!(f, "{}", i),
            EntityId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for EntityId {
    fn from(i: i64) -> Self {
        EntityId::Int(i)
    }
}

impl From<i32> for EntityId {
    fn from(i: i32) -> Self {
        EntityId::Int(i.into())
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId::Str(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        EntityId::Str(s)
    }
}

/// One hashable component of a grouping/inner key.
///
/// Floats participate by bit pattern; integral floats are normalized to
/// `Int` so a `1.0` group column matches an id of `1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
}

impl KeyPart {
    pub fn from_value(value: &Value) -> KeyPart {
        match value {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(i) => KeyPart::Int(*i),
            Value::Float(f) if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) => {
                KeyPart::Int(*f as i64)
            }
            Value::Float(f) => KeyPart::Float(f.to_bits()),
            Value::Str(s) => KeyPart::Str(s.clone()),
            Value::Bytes(b) => KeyPart::Str(String::from_utf8_lossy(b).into_owned()),
            Value::Date(d) => KeyPart::Date(*d),
            Value::DateTime(dt) => KeyPart::DateTime(*dt),
            Value::Time(t) => KeyPart::Time(*t),
            // Composite values never key sanely; fall back to the rendering.
            other => KeyPart::Str(other.to_string()),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "null"),
            KeyPart::Bool(b) => write!(f, "{}", b),
            KeyPart::Int(i) => write!(f, "{}", i),
            KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            KeyPart::Str(s) => write!(f, "{}", s),
            KeyPart::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            KeyPart::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.6f")),
            KeyPart::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.6f")),
        }
    }
}

/// Grouping / inner / lookup key: one part per declared key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(Vec<KeyPart>);

impl Key {
    pub fn single(part: KeyPart) -> Key {
        Key(vec![part])
    }

    pub fn from_value(value: &Value) -> Key {
        Key::single(KeyPart::from_value(value))
    }

    pub fn from_values<'a>(values: impl Iterator<Item = &'a Value>) -> Key {
        Key(values.map(KeyPart::from_value).collect())
    }

    pub fn from_entity_id(id: &EntityId) -> Key {
        match id {
            EntityId::Int(i) => Key::single(KeyPart::Int(*i)),
            EntityId::Str(s) => Key::single(KeyPart::Str(s.clone())),
        }
    }

    pub fn text(s: &str) -> Key {
        Key::single(KeyPart::Str(s.to_string()))
    }

    pub fn row_number(n: usize) -> Key {
        Key::single(KeyPart::Int(n as i64))
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl fmt::Display for Key {
    /// A single part renders bare; composite keys join their parts with `:`
    /// when a keyed result is flattened into a document map.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                write!(f, ":")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}
