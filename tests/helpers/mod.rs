//! Shared fixtures for dataset integration tests.
//!
//! Tests run against the scripted in-memory driver: each test writes its
//! recipe files into a temp folder, scripts the statements the engine is
//! expected to build, and asserts on the fetch envelope.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use entity_datasets::config::Config;
use entity_datasets::dataset::DatasetEngine;
use entity_datasets::db::memory::{MemoryBroker, MemoryDatabase};
use entity_datasets::value::{RecordMap, Value};

/// Engine wired to one scripted database named `test`.
pub fn engine_with(database: Arc<MemoryDatabase>, recipe_dir: &Path) -> DatasetEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let yaml = format!(
        r#"
db:
    default:    test
    databases:  [ "test" ]
    dataset:
        loader:     folder
        database:   test
        paths:      [ "{}" ]
codetables:
    database:   test
"#,
        recipe_dir.display()
    );
    let config = Arc::new(Config::from_str(&yaml).expect("test config parses"));
    let broker = Arc::new(MemoryBroker::new().add_database("test", database));
    DatasetEngine::new(config, broker).expect("engine builds")
}

pub fn write_recipe(root: &Path, entity: &str, dataset: &str, text: &str) {
    let dir = root.join(entity);
    fs::create_dir_all(&dir).expect("recipe dir");
    fs::write(dir.join(format!("{}.yaml", dataset)), text).expect("recipe file");
}

pub fn s(text: &str) -> Value {
    Value::Str(text.to_string())
}

pub fn i(n: i64) -> Value {
    Value::Int(n)
}

pub fn map(entries: Vec<(&str, Value)>) -> Value {
    let mut record = RecordMap::new();
    for (key, value) in entries {
        record.insert(key.to_string(), value);
    }
    Value::Map(record)
}

pub fn seq(items: Vec<Value>) -> Value {
    Value::Seq(items)
}
