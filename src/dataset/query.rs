//! SQL builder: macro expansion over the recipe's query template.
//!
//! Macros have the form `{{GROUP:VAR}}` with groups `ID` (generated
//! primary-key predicates), `VAR` (recipe-local variables) and `CONFIG`
//! (configuration by dotted key). Unknown groups and missing names expand
//! to the empty string; a `{{` with no closing `}}` stops substitution and
//! passes through so the database reports the broken statement.
//!
//! Building is deterministic: the same recipe and inputs produce
//! byte-identical SQL.

use std::collections::HashMap;

use super::recipe::Recipe;
use crate::config::{scalar_string, Config};
use crate::db::string_literal;
use crate::error::DatasetError;
use crate::value::EntityId;

/// Spans narrower than this use the BETWEEN form of an id predicate.
const BETWEEN_SPAN: i64 = 1000;

/// Expand the recipe's SQL template for one entity type and id batch.
pub fn build_sql(
    recipe: &Recipe,
    entity_type: &str,
    ids: &[EntityId],
    config: &Config,
) -> Result<String, DatasetError> {
    let template = recipe.sql.as_deref().unwrap_or_default();
    let prefix = match &recipe.prefix {
        Some(prefix) => format!("{}.", prefix),
        None => String::new(),
    };
    let pks = build_pks(recipe, &prefix, entity_type, ids);

    let mut sql = template.to_string();
    while let Some(start) = sql.find("{{") {
        let Some(length) = sql[start..].find("}}") else {
            // Malformed macro; let the statement fail downstream.
            break;
        };
        let name = sql[start + 2..start + length].to_string();
        let Some((group, var)) = name.split_once(':') else {
            return Err(DatasetError::Configuration(format!(
                "invalid macro [{{{{{}}}}}] in query.sql",
                name
            )));
        };

        let value = match group {
            "ID" => pks.get(var).cloned().unwrap_or_default(),
            "VAR" => recipe
                .vars
                .get(var)
                .and_then(scalar_string)
                .unwrap_or_default(),
            "CONFIG" => config.get_str(var).unwrap_or_default(),
            _ => String::new(),
        };

        let token = format!("{{{{{}}}}}", name);
        sql = sql.replace(&token, &value);
    }

    // Left-trim every line and rejoin: Oracle 9i mishandles statements past
    // 13-16 kb, and leading indentation is most of that weight.
    let trimmed: Vec<&str> = sql.split('\n').map(str::trim_start).collect();
    Ok(trimmed.join("\n"))
}

/// Primary-key predicates for the `ID` macro group: `name` (IN list),
/// `name#BETWEEN` (range when all ids are integers spanning < 1000, else
/// the IN form) and `ID:EntityType` (reachable as `{{ID:ID:EntityType}}`).
fn build_pks(
    recipe: &Recipe,
    prefix: &str,
    entity_type: &str,
    ids: &[EntityId],
) -> HashMap<String, String> {
    let mut pks = HashMap::new();

    let id_list = ids.iter().map(id_literal).collect::<Vec<_>>().join(", ");
    let int_ids: Option<Vec<i64>> = ids.iter().map(EntityId::as_int).collect();
    let span = int_ids.as_ref().and_then(|ints| {
        let min = ints.iter().min()?;
        let max = ints.iter().max()?;
        Some((*min, *max))
    });

    for name in &recipe.id_columns {
        let in_form = format!(" {}{} IN ({}) ", prefix, name, id_list);
        let between = match span {
            Some((min, max)) if max - min < BETWEEN_SPAN => {
                format!("{}{} BETWEEN {} AND {}", prefix, name, min, max)
            }
            _ => in_form.clone(),
        };
        pks.insert(name.clone(), in_form);
        pks.insert(format!("{}#BETWEEN", name), between);
    }
    pks.insert(
        "ID:EntityType".to_string(),
        format!(" {}EntityType = {} ", prefix, string_literal(entity_type)),
    );
    pks
}

fn id_literal(id: &EntityId) -> String {
    match id {
        EntityId::Int(i) => i.to_string(),
        EntityId::Str(s) => string_literal(s),
    }
}
