//! Entity-dataset resolution engine for a commerce back-office.
//!
//! Given a batch of heterogeneous (EntityType, EntityId, DatasetName)
//! requests, the engine loads declarative recipes, turns them into SQL (or
//! delegates to named procedures), enriches each row through coercion,
//! code-table translation, augmentation and post-processing hooks, and
//! returns one result per request with per-request error isolation.
//!
//! Entry point: [`dataset::DatasetEngine`].

pub mod codetables;
pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod value;

pub use dataset::{DatasetEngine, FetchEntry, Request};
pub use error::DatasetError;
pub use value::{EntityId, Key, Value};
