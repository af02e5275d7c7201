//! Type coercion for loosely-typed result rows.
//!
//! Coercion runs only when the recipe's database is marked `loosetypes`,
//! and works in two modes:
//!
//! - **bulk**: an attribute named after the target type maps to a list of
//!   columns, always coerced best-effort:
//!
//!   ```yaml
//!   query.coerce:
//!       boolean:  [ "boolColumn1", "boolColumn2" ]
//!       datetime: [ "datetimeColumn1" ]
//!   ```
//!
//! - **per-column**: a column name maps to a target type and a mode:
//!
//!   ```yaml
//!   query.coerce:
//!       boolColumn1:
//!           type: boolean
//!           mode: ok-or-fail    # ok-or-none or best
//!   ```
//!
//! `best` keeps the original value on failure, `ok-or-none` / `ok-or-null`
//! yields null, `ok-or-fail` raises a runtime error that ends the dataset.
//! Type names double as reserved bulk attribute names, so a column cannot
//! be called `bool`, `int`, `date`, ...

use indexmap::IndexMap;
use serde::Deserialize;

use super::iso8601;
use crate::error::DatasetError;
use crate::value::{RecordMap, Value};

/// The `query.coerce` recipe attribute.
pub type CoerceSpec = IndexMap<String, CoerceRule>;

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CoerceRule {
    /// Bulk form: the attribute name is the type, the value lists columns.
    Bulk(Vec<String>),
    /// Per-column form.
    Column {
        #[serde(rename = "type")]
        target: Option<String>,
        #[serde(default)]
        mode: Option<String>,
    },
}

/// The closed set of coercion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoerceType {
    Bool,
    Int,
    Float,
    Text,
    Date,
    DateTime,
    Time,
}

impl CoerceType {
    /// Accepts every alias the recipe language knows.
    pub fn parse(name: &str) -> Option<CoerceType> {
        match name {
            "bool" | "boolean" => Some(CoerceType::Bool),
            "int" | "integer" | "long" => Some(CoerceType::Int),
            "float" | "double" => Some(CoerceType::Float),
            "string" | "str" => Some(CoerceType::Text),
            "date" => Some(CoerceType::Date),
            "datetime" => Some(CoerceType::DateTime),
            "time" => Some(CoerceType::Time),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            CoerceType::Bool => "boolean",
            CoerceType::Int => "int",
            CoerceType::Float => "float",
            CoerceType::Text => "string",
            CoerceType::Date => "date",
            CoerceType::DateTime => "datetime",
            CoerceType::Time => "time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoerceMode {
    #[default]
    Best,
    OkOrNull,
    OkOrFail,
}

impl CoerceMode {
    /// Unrecognized modes fall through to best effort.
    pub fn parse(name: &str) -> CoerceMode {
        match name {
            "ok-or-none" | "ok-or-null" => CoerceMode::OkOrNull,
            "ok-or-fail" => CoerceMode::OkOrFail,
            _ => CoerceMode::Best,
        }
    }
}

/// Apply a coercion spec to a record in place. Null values are skipped.
pub fn perform_coercion(record: &mut RecordMap, spec: &CoerceSpec) -> Result<(), DatasetError> {
    for (attribute, rule) in spec {
        match (CoerceType::parse(attribute), rule) {
            // Bulk: the attribute names the type, always best effort.
            (Some(target), CoerceRule::Bulk(columns)) => {
                for column in columns {
                    let Some(value) = record.get(column) else {
                        continue;
                    };
                    if value.is_null() {
                        continue;
                    }
                    let coerced = coerce_value(value, target, CoerceMode::Best)?;
                    record.insert(column.clone(), coerced);
                }
            }
            (Some(_), CoerceRule::Column { .. }) => {
                return Err(DatasetError::Configuration(format!(
                    "[{}] is a reserved bulk coercion name and cannot be a column",
                    attribute
                )));
            }
            // Per-column: the attribute is the column name.
            (None, CoerceRule::Column { target, mode }) => {
                let target_name = target.as_deref().unwrap_or("string");
                let target = CoerceType::parse(target_name).ok_or_else(|| {
                    DatasetError::Configuration(format!(
                        "type [{}] is unknown, don't know how to coerce",
                        target_name
                    ))
                })?;
                let mode = mode
                    .as_deref()
                    .map(CoerceMode::parse)
                    .unwrap_or_default();
                let Some(value) = record.get(attribute) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                let coerced = coerce_value(value, target, mode)?;
                record.insert(attribute.clone(), coerced);
            }
            (None, CoerceRule::Bulk(_)) => {
                return Err(DatasetError::Configuration(format!(
                    "coercion for column [{}] must give a type, not a column list",
                    attribute
                )));
            }
        }
    }
    Ok(())
}

/// Coerce a single value, handling failure according to mode.
pub fn coerce_value(
    value: &Value,
    target: CoerceType,
    mode: CoerceMode,
) -> Result<Value, DatasetError> {
    match target {
        CoerceType::Bool => coerce_bool(value, mode),
        CoerceType::Int => coerce_int(value, mode),
        CoerceType::Float => coerce_float(value, mode),
        CoerceType::Text => Ok(Value::Str(value.to_string())),
        CoerceType::Date => coerce_date(value, mode),
        CoerceType::DateTime => coerce_datetime(value, mode),
        CoerceType::Time => coerce_time(value, mode),
    }
}

fn fallback(value: &Value, target: CoerceType, mode: CoerceMode) -> Result<Value, DatasetError> {
    match mode {
        CoerceMode::Best => Ok(value.clone()),
        CoerceMode::OkOrNull => Ok(Value::Null),
        CoerceMode::OkOrFail => Err(DatasetError::Runtime(format!(
            "cannot coerce value [{}] to type [{}]",
            value,
            target.name()
        ))),
    }
}

fn coerce_bool(value: &Value, mode: CoerceMode) -> Result<Value, DatasetError> {
    let truth = match value {
        Value::Bool(b) => Some(*b),
        Value::Int(1) => Some(true),
        Value::Int(0) => Some(false),
        Value::Float(f) if *f == 1.0 => Some(true),
        Value::Float(f) if *f == 0.0 => Some(false),
        Value::Str(s) => match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    };
    match truth {
        Some(b) => Ok(Value::Bool(b)),
        None => fallback(value, CoerceType::Bool, mode),
    }
}

fn coerce_int(value: &Value, mode: CoerceMode) -> Result<Value, DatasetError> {
    let parsed = match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        // Native floats truncate; float *strings* do not parse as ints.
        Value::Float(f) if f.is_finite() => Some(*f as i64),
        Value::Str(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(i) => Ok(Value::Int(i)),
        None => fallback(value, CoerceType::Int, mode),
    }
}

fn coerce_float(value: &Value, mode: CoerceMode) -> Result<Value, DatasetError> {
    let parsed = match value {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::Str(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(f) => Ok(Value::Float(f)),
        None => fallback(value, CoerceType::Float, mode),
    }
}

fn coerce_date(value: &Value, mode: CoerceMode) -> Result<Value, DatasetError> {
    let parts = iso8601::parse_datetime(&value.to_string());
    let date = parts.and_then(|p| {
        chrono::NaiveDate::from_ymd_opt(p.year?, p.month?, p.day?)
    });
    match date {
        Some(d) => Ok(Value::Date(d)),
        None => fallback(value, CoerceType::Date, mode),
    }
}

fn coerce_datetime(value: &Value, mode: CoerceMode) -> Result<Value, DatasetError> {
    let parts = iso8601::parse_datetime(&value.to_string());
    let datetime = parts.and_then(|p| {
        // Missing time fields default to midnight; the timezone literal is
        // parsed but never applied (naive local time).
        let date = chrono::NaiveDate::from_ymd_opt(p.year?, p.month?, p.day?)?;
        date.and_hms_micro_opt(
            p.hour.unwrap_or(0),
            p.minute.unwrap_or(0),
            p.second.unwrap_or(0),
            p.fraction.unwrap_or(0),
        )
    });
    match datetime {
        Some(dt) => Ok(Value::DateTime(dt)),
        None => fallback(value, CoerceType::DateTime, mode),
    }
}

fn coerce_time(value: &Value, mode: CoerceMode) -> Result<Value, DatasetError> {
    let parts = iso8601::parse_time(&value.to_string());
    let time = parts.and_then(|p| {
        chrono::NaiveTime::from_hms_micro_opt(
            p.hour?,
            p.minute.unwrap_or(0),
            p.second.unwrap_or(0),
            p.fraction.unwrap_or(0),
        )
    });
    match time {
        Some(t) => Ok(Value::Time(t)),
        None => fallback(value, CoerceType::Time, mode),
    }
}
