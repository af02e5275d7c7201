//! Error types for the dataset engine.
//!
//! Errors are contained per (EntityType, DatasetName) group and surfaced per
//! id in the fetch envelope; one group's failure never aborts the batch.

use thiserror::Error;

use crate::db::DbError;
use crate::value::EntityId;

#[derive(Debug, Error)]
pub enum DatasetError {
    /// Malformed recipe or engine configuration. Fatal for the group.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No recipe file found for the entity/dataset pair.
    #[error("dataset for [{entity}/{dataset}] not found")]
    RecipeNotFound { entity: String, dataset: String },

    /// A recipe file exists but does not parse.
    #[error("syntax error in dataset file for [{entity}/{dataset}]: {detail}")]
    RecipeSyntax {
        entity: String,
        dataset: String,
        detail: String,
    },

    /// Query execution, hook or procedure failure. Fatal for the group.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// A hook name could not be bound to a registered function.
    #[error("unknown hook: {0}")]
    UnknownHook(String),

    /// The solver returned no entry for a requested id. Per-id only.
    #[error("missing key {0}")]
    MissingKey(EntityId),

    #[error(transparent)]
    Db(#[from] DbError),
}
