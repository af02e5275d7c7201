//! In-memory scripted database driver.
//!
//! The dataset engine runs dynamically built SQL text, so the test driver
//! does not interpret SQL: each database is scripted with expected
//! statements (matched exactly after whitespace normalization, or by
//! fragment) and the rows they return. Every executed statement is logged,
//! which lets tests assert how many round-trips a batch produced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ConnectionBroker, DbConnection, DbError, QueryRows};
use crate::value::Value;

enum Matcher {
    Exact(String),
    Contains(String),
}

struct Script {
    matcher: Matcher,
    result: QueryRows,
}

/// One scripted database. Databases are shared (`Arc`) between the broker
/// and the test that scripts them.
pub struct MemoryDatabase {
    loose_types: bool,
    encoding: Option<String>,
    scripts: Mutex<Vec<Script>>,
    executed: Mutex<Vec<String>>,
}

impl MemoryDatabase {
    pub fn new() -> Arc<MemoryDatabase> {
        MemoryDatabase::with_attributes(false, None)
    }

    /// A database whose values arrive untyped (like SQLite), triggering
    /// the coercion layer.
    pub fn new_loose() -> Arc<MemoryDatabase> {
        MemoryDatabase::with_attributes(true, None)
    }

    pub fn with_attributes(loose_types: bool, encoding: Option<&str>) -> Arc<MemoryDatabase> {
        Arc::new(MemoryDatabase {
            loose_types,
            encoding: encoding.map(str::to_string),
            scripts: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
        })
    }

    /// Script an exact statement (whitespace-normalized before comparison).
    pub fn script(&self, sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.push(Matcher::Exact(normalize(sql)), columns, rows);
    }

    /// Script any statement containing the fragment.
    pub fn script_contains(&self, fragment: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.push(Matcher::Contains(normalize(fragment)), columns, rows);
    }

    fn push(&self, matcher: Matcher, columns: &[&str], rows: Vec<Vec<Value>>) {
        let result = QueryRows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        };
        self.scripts
            .lock()
            .unwrap()
            .push(Script { matcher, result });
    }

    /// Statements executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DbConnection for MemoryDatabase {
    async fn query(&self, sql: &str) -> Result<QueryRows, DbError> {
        let normalized = normalize(sql);
        self.executed.lock().unwrap().push(normalized.clone());
        let scripts = self.scripts.lock().unwrap();
        for script in scripts.iter() {
            let matched = match &script.matcher {
                Matcher::Exact(expected) => *expected == normalized,
                Matcher::Contains(fragment) => normalized.contains(fragment.as_str()),
            };
            if matched {
                return Ok(script.result.clone());
            }
        }
        Err(DbError::Query(format!(
            "no scripted result for statement: {}",
            normalized
        )))
    }
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Broker over a fixed set of scripted databases.
pub struct MemoryBroker {
    default_database: Option<String>,
    databases: HashMap<String, Arc<MemoryDatabase>>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker {
            default_database: None,
            databases: HashMap::new(),
        }
    }

    pub fn add_database(mut self, name: &str, database: Arc<MemoryDatabase>) -> MemoryBroker {
        if self.default_database.is_none() {
            self.default_database = Some(name.to_string());
        }
        self.databases.insert(name.to_string(), database);
        self
    }

    pub fn with_default(mut self, name: &str) -> MemoryBroker {
        self.default_database = Some(name.to_string());
        self
    }

    fn resolve(&self, database: Option<&str>) -> Result<&Arc<MemoryDatabase>, DbError> {
        let name = database
            .or(self.default_database.as_deref())
            .ok_or_else(|| DbError::UnknownDatabase("<default>".to_string()))?;
        self.databases
            .get(name)
            .ok_or_else(|| DbError::UnknownDatabase(name.to_string()))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

#[async_trait]
impl ConnectionBroker for MemoryBroker {
    async fn connect(&self, database: Option<&str>) -> Result<Arc<dyn DbConnection>, DbError> {
        let database: Arc<dyn DbConnection> = self.resolve(database)?.clone();
        Ok(database)
    }

    fn default_database(&self) -> Option<&str> {
        self.default_database.as_deref()
    }

    fn loose_types(&self, database: Option<&str>) -> bool {
        self.resolve(database).map(|db| db.loose_types).unwrap_or(false)
    }

    fn encoding(&self, database: Option<&str>) -> Option<String> {
        self.resolve(database).ok().and_then(|db| db.encoding.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_statements_return_rows_and_log() {
        let db = MemoryDatabase::new();
        db.script(
            "SELECT 1",
            &["One"],
            vec![vec![Value::Int(1)]],
        );
        let rows = db.query("SELECT   1").await.unwrap();
        assert_eq!(rows.columns, vec!["One".to_string()]);
        assert_eq!(rows.rows, vec![vec![Value::Int(1)]]);
        assert_eq!(db.executed(), vec!["SELECT 1".to_string()]);
    }

    #[tokio::test]
    async fn unscripted_statements_fail() {
        let db = MemoryDatabase::new();
        assert!(db.query("SELECT 2").await.is_err());
    }

    #[tokio::test]
    async fn broker_resolves_default_and_named() {
        let db = MemoryDatabase::new();
        let broker = MemoryBroker::new().add_database("test", db);
        assert!(broker.connect(None).await.is_ok());
        assert!(broker.connect(Some("test")).await.is_ok());
        assert!(broker.connect(Some("other")).await.is_err());
    }
}
