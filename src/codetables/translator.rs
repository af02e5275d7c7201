//! Code → description projection onto records.
//!
//! For each translated field `f` with list name `L`, two sibling fields are
//! emitted: `f._list = L` and `f._desc = <description>`. When the list has
//! no entry for the code (or the list itself is unknown), the untranslated
//! value passes through as the description, so translation never fails and
//! applying it twice is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use super::CodeTableCache;
use crate::value::{RecordMap, Value};

struct PreparedField {
    field: String,
    list_name: String,
    data: Arc<HashMap<String, String>>,
}

/// A translation description with every referenced list resolved once.
pub struct PreparedTranslation {
    fields: Vec<PreparedField>,
}

/// Resolve each (field → list name) pair against the cache.
pub async fn prepare(
    cache: &CodeTableCache,
    description: &IndexMap<String, String>,
) -> PreparedTranslation {
    let mut fields = Vec::with_capacity(description.len());
    for (field, list_name) in description {
        let data = cache.translation(list_name).await;
        fields.push(PreparedField {
            field: field.clone(),
            list_name: list_name.clone(),
            data,
        });
    }
    PreparedTranslation { fields }
}

/// Translate a single record in place. Fields absent from the record are
/// ignored.
pub fn translate_record(prepared: &PreparedTranslation, record: &mut RecordMap) {
    for entry in &prepared.fields {
        let Some(value) = record.get(&entry.field) else {
            continue;
        };
        let described = match entry.data.get(&value.to_string()) {
            Some(description) => Value::Str(description.clone()),
            None => value.clone(),
        };
        record.insert(
            format!("{}._list", entry.field),
            Value::Str(entry.list_name.clone()),
        );
        record.insert(format!("{}._desc", entry.field), described);
    }
}

/// Translate a record or a sequence of records in place; any other value is
/// left untouched.
pub async fn translate(
    cache: &CodeTableCache,
    description: &IndexMap<String, String>,
    data: &mut Value,
) {
    let prepared = prepare(cache, description).await;
    match data {
        Value::Map(record) => translate_record(&prepared, record),
        Value::Seq(items) => {
            for item in items {
                if let Value::Map(record) = item {
                    translate_record(&prepared, record);
                }
            }
        }
        _ => {}
    }
}
