//! Database access by logical name.
//!
//! The engine never talks to a driver directly: it asks a
//! [`ConnectionBroker`] for a handle to a named database and runs plain SQL
//! text through the [`DbConnection`] contract. The broker also reports the
//! per-database `loosetypes` flag (returned values may not match declared
//! column types, so coercion applies) and the declared text `encoding`.
//!
//! Two drivers are provided: [`postgres::PostgresBroker`] backed by `sqlx`
//! pools, and [`memory::MemoryBroker`], a scripted driver used by tests and
//! fixtures.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::value::Value;

/// Key under which the unnamed default database is pooled per batch.
const DEFAULT_SET_NAME: &str = "__default__";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("unknown database [{0}]")]
    UnknownDatabase(String),

    #[error("database configuration error: {0}")]
    Configuration(String),

    #[error("cannot connect to database [{database}]: {detail}")]
    Connect { database: String, detail: String },

    #[error("query failed: {0}")]
    Query(String),
}

/// Result of one query: column names in select order plus decoded rows.
/// Rows may be wider than the recipe's declared column list.
#[derive(Debug, Clone, Default)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// A live handle to one database for the duration of a batch.
#[async_trait]
pub trait DbConnection: Send + Sync {
    async fn query(&self, sql: &str) -> Result<QueryRows, DbError>;
}

/// Hands out connections by logical database name (`None` selects the
/// broker's default) and reports per-database attributes.
#[async_trait]
pub trait ConnectionBroker: Send + Sync {
    async fn connect(&self, database: Option<&str>) -> Result<Arc<dyn DbConnection>, DbError>;

    fn default_database(&self) -> Option<&str>;

    /// Whether returned values may not match their declared SQL types.
    fn loose_types(&self, database: Option<&str>) -> bool;

    /// Declared text encoding of the database, when not UTF-8 native.
    fn encoding(&self, database: Option<&str>) -> Option<String>;
}

/// Per-batch connection map: one handle per logical database, owned by a
/// single `fetch` call and reused across every recipe and augment in it.
pub struct ConnectionSet {
    broker: Arc<dyn ConnectionBroker>,
    connections: HashMap<String, Arc<dyn DbConnection>>,
}

impl ConnectionSet {
    pub fn new(broker: Arc<dyn ConnectionBroker>) -> ConnectionSet {
        ConnectionSet {
            broker,
            connections: HashMap::new(),
        }
    }

    pub async fn get(
        &mut self,
        database: Option<&str>,
    ) -> Result<Arc<dyn DbConnection>, DbError> {
        let key = database.unwrap_or(DEFAULT_SET_NAME);
        if let Some(connection) = self.connections.get(key) {
            return Ok(connection.clone());
        }
        let connection = self.broker.connect(database).await?;
        self.connections.insert(key.to_string(), connection.clone());
        Ok(connection)
    }
}

/// Quote a string as a SQL literal, doubling embedded quotes.
pub(crate) fn string_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Render a scalar value as a SQL literal (strings quoted, numbers bare).
pub(crate) fn value_literal(value: &Value) -> String {
    match value {
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        other => string_literal(&other.to_string()),
    }
}
