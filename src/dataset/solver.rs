//! Dataset solver: execute one recipe over an id batch.
//!
//! A recipe node either runs a built SQL statement or delegates to a named
//! procedure. Query results stream through a per-row pipeline (encoding
//! decode, filter, coercion, augment merge, code translation, post hooks)
//! and land in an accumulator shaped by the recipe's output mode:
//!
//! | format | group | key | result shape            |
//! |--------|-------|-----|-------------------------|
//! | `list` | any   | any | rows in fetch order     |
//! | none   | no    | no  | row number -> row       |
//! | none   | no    | yes | key -> row              |
//! | none   | yes   | no  | group -> rows           |
//! | none   | yes   | yes | group -> (key -> row)   |
//!
//! Augments are sub-recipes solved over the same id batch before the main
//! query; each parent row picks its slice by join key, group key or inner
//! key, falling back to the augment's `__all__` slot.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;

use super::hooks::PostOutcome;
use super::query::build_sql;
use super::recipe::Recipe;
use super::{coercion, DatasetEngine};
use crate::codetables::translator::{self, PreparedTranslation};
use crate::db::ConnectionSet;
use crate::error::DatasetError;
use crate::value::{EntityId, Key, RecordMap, Value};

/// Augment recursion bound; the recipe grammar is acyclic by construction,
/// this keeps a damaged repository from recursing without end.
const MAX_AUGMENT_DEPTH: usize = 8;

/// Key of the slot that broadcasts a static result to every row and id.
const ALL_SLOT: &str = "__all__";

/// Raw solver output, before per-id distribution.
#[derive(Debug, Clone)]
pub enum SolveOutput {
    /// `query.output: list`, rows in fetch order.
    List(Vec<Value>),
    /// Keyed rows; group and static outputs land here too.
    Map(IndexMap<Key, Value>),
}

impl SolveOutput {
    pub fn empty() -> SolveOutput {
        SolveOutput::Map(IndexMap::new())
    }

    pub fn get(&self, key: &Key) -> Option<&Value> {
        match self {
            SolveOutput::Map(map) => map.get(key),
            SolveOutput::List(_) => None,
        }
    }

    fn all_slot(&self) -> Option<&Value> {
        self.get(&Key::text(ALL_SLOT))
    }

    /// Flatten into a document value; map keys render through `Key`.
    pub fn into_value(self) -> Value {
        match self {
            SolveOutput::List(rows) => Value::Seq(rows),
            SolveOutput::Map(map) => Value::Map(
                map.into_iter()
                    .map(|(key, value)| (key.to_string(), value))
                    .collect(),
            ),
        }
    }
}

/// One solving pass: borrows the engine's services and the batch-owned
/// connection set.
pub(crate) struct Solver<'e> {
    pub engine: &'e DatasetEngine,
    pub connections: &'e mut ConnectionSet,
}

impl<'e> Solver<'e> {
    /// Solve a top-level recipe. `single` recipes merge their augments into
    /// one document and broadcast it to every requested id.
    pub async fn solve(
        &mut self,
        recipe: &Recipe,
        entity_type: &str,
        dataset_name: &str,
        ids: &[EntityId],
    ) -> Result<SolveOutput, DatasetError> {
        let main = self
            .solve_node(recipe, entity_type, dataset_name, ids, 0)
            .await?;

        if !recipe.single {
            return Ok(main.unwrap_or_else(SolveOutput::empty));
        }

        let partial = self
            .solve_augments(recipe.augment.as_ref(), entity_type, dataset_name, ids, 0)
            .await?;

        let mut document = match main {
            Some(output) => output.into_value(),
            None if partial.is_empty() => Value::Null,
            None => Value::Map(RecordMap::new()),
        };
        if !partial.is_empty() {
            let Value::Map(fields) = &mut document else {
                return Err(DatasetError::Runtime(format!(
                    "single dataset [{}/{}] cannot merge augments into a list result",
                    entity_type, dataset_name
                )));
            };
            for (attribute, output) in partial {
                fields.insert(attribute, output.into_value());
            }
        }

        let broadcast = ids
            .iter()
            .map(|id| (Key::from_entity_id(id), document.clone()))
            .collect();
        Ok(SolveOutput::Map(broadcast))
    }

    /// Dispatch one node: query, procedure, or nothing (augment-only).
    fn solve_node<'a>(
        &'a mut self,
        recipe: &'a Recipe,
        entity_type: &'a str,
        dataset_name: &'a str,
        ids: &'a [EntityId],
        depth: usize,
    ) -> BoxFuture<'a, Result<Option<SolveOutput>, DatasetError>> {
        async move {
            if recipe.sql.is_some() {
                self.solve_query(recipe, entity_type, dataset_name, ids, depth)
                    .await
                    .map(Some)
            } else if recipe.code_name.is_some() {
                self.solve_code(recipe, entity_type, dataset_name, ids)
                    .map(Some)
            } else {
                Ok(None)
            }
        }
        .boxed()
    }

    /// Solve a set of augment sub-recipes in declaration order.
    async fn solve_augments(
        &mut self,
        augments: Option<&IndexMap<String, Recipe>>,
        entity_type: &str,
        dataset_name: &str,
        ids: &[EntityId],
        depth: usize,
    ) -> Result<IndexMap<String, SolveOutput>, DatasetError> {
        let mut solved = IndexMap::new();
        let Some(augments) = augments else {
            return Ok(solved);
        };
        if depth >= MAX_AUGMENT_DEPTH {
            return Err(DatasetError::Configuration(format!(
                "augments nest deeper than {} in [{}/{}]",
                MAX_AUGMENT_DEPTH, entity_type, dataset_name
            )));
        }

        for (attribute, sub) in augments {
            let started = Instant::now();
            let output = self
                .solve_node(sub, entity_type, dataset_name, ids, depth + 1)
                .await?;
            tracing::debug!(
                entity_type,
                dataset_name,
                augment = %attribute,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "solved augment"
            );
            solved.insert(attribute.clone(), output.unwrap_or_else(SolveOutput::empty));
        }
        Ok(solved)
    }

    async fn solve_query(
        &mut self,
        recipe: &Recipe,
        entity_type: &str,
        dataset_name: &str,
        ids: &[EntityId],
        depth: usize,
    ) -> Result<SolveOutput, DatasetError> {
        // Augments first, over the full batch.
        let augments = self
            .solve_augments(recipe.query_augment.as_ref(), entity_type, dataset_name, ids, depth)
            .await?;
        let join_keys: HashMap<&str, &[String]> = recipe
            .query_augment
            .iter()
            .flat_map(|m| m.iter())
            .filter_map(|(attribute, sub)| {
                sub.join_key
                    .as_deref()
                    .map(|columns| (attribute.as_str(), columns))
            })
            .collect();

        let columns = recipe.columns.as_ref().ok_or_else(|| {
            DatasetError::Configuration(format!(
                "query.columns not present in [{}/{}]",
                entity_type, dataset_name
            ))
        })?;
        let group_idx = column_indexes(&recipe.group, columns, "query.group", entity_type, dataset_name)?;
        let mut key_idx = column_indexes(&recipe.key, columns, "query.key", entity_type, dataset_name)?;

        // When grouping, the group columns are a prefix of the key columns
        // and drop out of the inner key.
        if !group_idx.is_empty() && !key_idx.is_empty() {
            for g in &group_idx {
                if key_idx.first() == Some(g) {
                    key_idx.remove(0);
                    if key_idx.is_empty() {
                        break;
                    }
                } else {
                    break;
                }
            }
        }

        let post = recipe.post_hooks();
        let format_list = recipe.output.as_deref() == Some("list");
        let filter_ids: HashSet<i64> = ids.iter().filter_map(EntityId::as_int).collect();

        let database = recipe
            .database
            .as_deref()
            .or(self.engine.default_database());
        let loose = self.engine.broker().loose_types(database);
        let encoding = self.engine.broker().encoding(database);
        let coerce = if loose { recipe.coerce.as_ref() } else { None };

        let translation: Option<PreparedTranslation> = match &recipe.translate {
            Some(description) => {
                Some(translator::prepare(self.engine.codetables(), description).await)
            }
            None => None,
        };

        let sql = build_sql(recipe, entity_type, ids, self.engine.config())?;
        let connection = self.connections.get(database).await?;
        let started = Instant::now();
        let result = connection.query(&sql).await?;
        tracing::debug!(
            entity_type,
            dataset_name,
            rows = result.rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "executed dataset query"
        );

        let mut list_acc: Vec<Value> = Vec::new();
        let mut map_acc: IndexMap<Key, Value> = IndexMap::new();
        let mut first_row: Option<Value> = None;
        let mut row_number: usize = 0;

        for raw in &result.rows {
            if raw.len() < columns.len() {
                return Err(DatasetError::Configuration(format!(
                    "query returned fewer columns than query.columns states for [{}/{}]",
                    entity_type, dataset_name
                )));
            }

            let mut record: RecordMap = columns
                .iter()
                .enumerate()
                .map(|(i, name)| (name.clone(), decode(raw[i].clone(), encoding.as_deref())))
                .collect();

            // Filter: the column's integer value must be a requested id.
            if let Some(filter) = &recipe.filter {
                match record.get(filter).and_then(Value::as_int) {
                    Some(id) if filter_ids.contains(&id) => {}
                    _ => continue,
                }
            }

            if let Some(spec) = coerce {
                coercion::perform_coercion(&mut record, spec)?;
            }

            // Group and inner keys come from the raw row, by column index.
            let g_key = (!group_idx.is_empty())
                .then(|| Key::from_values(group_idx.iter().map(|i| &raw[*i])));
            let k_key = (!key_idx.is_empty())
                .then(|| Key::from_values(key_idx.iter().map(|i| &raw[*i])));

            for (attribute, output) in &augments {
                let payload = resolve_augment(
                    output,
                    join_keys.get(attribute.as_str()).copied(),
                    &record,
                    g_key.as_ref(),
                    k_key.as_ref(),
                )?;
                record.insert(attribute.clone(), payload.unwrap_or(Value::Null));
            }

            if let Some(prepared) = &translation {
                translator::translate_record(prepared, &mut record);
            }

            let mut dropped = false;
            for name in &post {
                let hook = self.engine.post_hooks().resolve(name)?;
                let current = std::mem::take(&mut record);
                match hook(current)? {
                    PostOutcome::Row(next) => record = next,
                    PostOutcome::Drop => {
                        dropped = true;
                        break;
                    }
                }
            }
            if dropped {
                continue;
            }

            let row = Value::Map(record);
            if first_row.is_none() {
                first_row = Some(row.clone());
            }

            if format_list {
                list_acc.push(row);
            } else if let Some(g_key) = g_key {
                match (k_key, map_acc.entry(g_key)) {
                    (Some(k_key), entry) => {
                        let slot = entry.or_insert_with(|| Value::Map(RecordMap::new()));
                        if let Value::Map(inner) = slot {
                            inner.insert(k_key.to_string(), row);
                        }
                    }
                    (None, entry) => {
                        let slot = entry.or_insert_with(|| Value::Seq(Vec::new()));
                        if let Value::Seq(rows) = slot {
                            rows.push(row);
                        }
                    }
                }
            } else if let Some(k_key) = k_key {
                map_acc.insert(k_key, row);
            } else {
                map_acc.insert(Key::row_number(row_number), row);
            }
            row_number += 1;
        }

        if recipe.static_first {
            let first = first_row.ok_or_else(|| {
                DatasetError::Runtime(format!(
                    "static dataset [{}/{}] produced no rows",
                    entity_type, dataset_name
                ))
            })?;
            let mut stat = IndexMap::new();
            stat.insert(Key::text(ALL_SLOT), first);
            return Ok(SolveOutput::Map(stat));
        }

        Ok(if format_list {
            SolveOutput::List(list_acc)
        } else {
            SolveOutput::Map(map_acc)
        })
    }

    /// Procedure mode: look the function up and expect (id → value) back.
    fn solve_code(
        &self,
        recipe: &Recipe,
        entity_type: &str,
        dataset_name: &str,
        ids: &[EntityId],
    ) -> Result<SolveOutput, DatasetError> {
        let qualified = recipe.code_name.as_deref().unwrap_or_default();
        let procedure = self.engine.procedures().resolve(qualified)?;
        let mut produced = procedure(recipe, entity_type, dataset_name, ids)?;

        let map = ids
            .iter()
            .filter_map(|id| {
                produced
                    .remove(id)
                    .map(|value| (Key::from_entity_id(id), value))
            })
            .collect();
        Ok(SolveOutput::Map(map))
    }
}

/// Pick the augment payload for one parent row; first non-null wins.
fn resolve_augment(
    output: &SolveOutput,
    join_columns: Option<&[String]>,
    record: &RecordMap,
    g_key: Option<&Key>,
    k_key: Option<&Key>,
) -> Result<Option<Value>, DatasetError> {
    // By declared join key, built from the (coerced) record.
    if let Some(columns) = join_columns {
        let mut parts = Vec::with_capacity(columns.len());
        for column in columns {
            let value = record.get(column).ok_or_else(|| {
                DatasetError::Configuration(format!(
                    "join.key column [{}] not present in parent row",
                    column
                ))
            })?;
            parts.push(value);
        }
        let join = Key::from_values(parts.into_iter());
        if let Some(found) = output.get(&join) {
            return Ok(Some(found.clone()));
        }
    }

    // By group key, then by inner key, each falling back to __all__.
    if let Some(g_key) = g_key {
        if let Some(found) = output.get(g_key).or_else(|| output.all_slot()) {
            return Ok(Some(found.clone()));
        }
    }
    if let Some(k_key) = k_key {
        if let Some(found) = output.get(k_key).or_else(|| output.all_slot()) {
            return Ok(Some(found.clone()));
        }
    }
    Ok(None)
}

/// Decode raw column bytes through the connection's declared encoding.
fn decode(value: Value, encoding: Option<&str>) -> Value {
    let Value::Bytes(bytes) = value else {
        return value;
    };
    match encoding {
        Some(label) if !label.eq_ignore_ascii_case("utf-8") && !label.eq_ignore_ascii_case("utf8") =>
        {
            match encoding_rs::Encoding::for_label(label.as_bytes()) {
                Some(encoding) => {
                    let (text, _, _) = encoding.decode(&bytes);
                    Value::Str(text.into_owned())
                }
                None => Value::Str(String::from_utf8_lossy(&bytes).into_owned()),
            }
        }
        _ => Value::Str(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

fn column_indexes(
    names: &[String],
    columns: &[String],
    attribute: &str,
    entity_type: &str,
    dataset_name: &str,
) -> Result<Vec<usize>, DatasetError> {
    names
        .iter()
        .map(|name| {
            columns.iter().position(|c| c == name).ok_or_else(|| {
                DatasetError::Configuration(format!(
                    "{} columns not present in query.columns for [{}/{}]",
                    attribute, entity_type, dataset_name
                ))
            })
        })
        .collect()
}
