//! Code-table cache: code → description lookups.
//!
//! Back-office tables use short "code" fields as enumerated types and keep
//! the human-readable description in a code table, optionally grouped under
//! a shared multi-table schema. A master table (default `CodeTables`) lists
//! every table with a domain and a name (`ONIX.13`, `User.User`, ...).
//!
//! The master list loads in bulk on first use; each table's data loads
//! lazily on first translation. Lookups never fail: an unknown table gets a
//! synthetic empty descriptor and translation passes values through, and
//! database errors while loading are swallowed into empty maps. Translation
//! must never abort a batch.

pub mod translator;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::{yaml_truthy, Config};
use crate::db::{value_literal, ConnectionBroker};
use crate::value::Value;

/// Field names of the master code table, configurable under `codetables.*`.
#[derive(Debug, Clone)]
pub struct CodeTablesConfig {
    pub database: Option<String>,
    pub code_table: String,
    pub table_id: String,
    pub table_domain: String,
    pub table_name: String,
    pub flag_grouped: String,
    pub data_table_schema: String,
    pub data_table_name: String,
    pub data_table_id: String,
    pub data_table_code: String,
    pub data_table_desc: String,
}

impl CodeTablesConfig {
    pub fn from_config(config: &Config) -> CodeTablesConfig {
        let field = |key: &str, default: &str| {
            config
                .get_str(&format!("codetables.fields.{}", key))
                .unwrap_or_else(|| default.to_string())
        };
        CodeTablesConfig {
            database: config.get_str("codetables.database"),
            code_table: config
                .get_str("codetables.codetable")
                .unwrap_or_else(|| "CodeTables".to_string()),
            table_id: field("tableId", "CodeTableId"),
            table_domain: field("tableDomain", "TableDomain"),
            table_name: field("tableName", "TableName"),
            flag_grouped: field("flagGrouped", "FlagGrouped"),
            data_table_schema: field("dataTableSchema", "DataTableSchema"),
            data_table_name: field("dataTableName", "DataTableName"),
            data_table_id: field("dataTableId", "CodeTableId"),
            data_table_code: field("dataTableCode", "DataTableCodeField"),
            data_table_desc: field("dataTableDesc", "DataTableNameField"),
        }
    }
}

/// Where a code table's data lives and how it is keyed.
#[derive(Debug, Clone)]
pub struct CodeTableDescriptor {
    pub id: Value,
    pub domain: String,
    pub name: String,
    pub fullname: String,
    pub grouped: bool,
    pub schema: String,
    pub table_name: String,
    pub col_id: String,
    pub col_code: String,
    pub col_desc: String,
    /// True when listed in the master table, false for synthetic entries.
    pub defined: bool,
}

impl CodeTableDescriptor {
    fn synthetic(fullname: &str) -> CodeTableDescriptor {
        let (domain, name) = match fullname.rsplit_once('.') {
            Some((domain, name)) => (domain.to_string(), name.to_string()),
            None => (String::new(), fullname.to_string()),
        };
        CodeTableDescriptor {
            id: Value::Int(-1),
            domain,
            name,
            fullname: fullname.to_string(),
            grouped: false,
            schema: String::new(),
            table_name: String::new(),
            col_id: String::new(),
            col_code: String::new(),
            col_desc: String::new(),
            defined: false,
        }
    }
}

struct CodeTable {
    descriptor: CodeTableDescriptor,
    /// `None` until lazily loaded; synthetic tables start loaded and empty.
    data: Option<Arc<HashMap<String, String>>>,
}

pub struct CodeTableCache {
    broker: Arc<dyn ConnectionBroker>,
    config: CodeTablesConfig,
    tables: RwLock<Option<HashMap<String, CodeTable>>>,
}

impl CodeTableCache {
    pub fn new(broker: Arc<dyn ConnectionBroker>, config: &Config) -> CodeTableCache {
        CodeTableCache {
            broker,
            config: CodeTablesConfig::from_config(config),
            tables: RwLock::new(None),
        }
    }

    /// Fullnames of every cached code table.
    pub async fn table_names(&self) -> Vec<String> {
        self.ensure_master().await;
        match self.tables.read().await.as_ref() {
            Some(tables) => tables.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// The code → description map for a table, loading it on first use.
    /// Unknown tables yield an empty map through a synthetic descriptor.
    pub async fn translation(&self, fullname: &str) -> Arc<HashMap<String, String>> {
        self.ensure_master().await;

        {
            let tables = self.tables.read().await;
            if let Some(entry) = tables.as_ref().and_then(|t| t.get(fullname)) {
                if let Some(data) = &entry.data {
                    return data.clone();
                }
            }
        }

        let descriptor = {
            let mut tables = self.tables.write().await;
            let tables = tables.get_or_insert_with(HashMap::new);
            let entry = tables.entry(fullname.to_string()).or_insert_with(|| CodeTable {
                descriptor: CodeTableDescriptor::synthetic(fullname),
                data: Some(Arc::new(HashMap::new())),
            });
            if let Some(data) = &entry.data {
                return data.clone();
            }
            entry.descriptor.clone()
        };

        // Load outside the lock; a concurrent load does the same work and
        // the last writer wins with an identical result.
        let data = Arc::new(self.load_data(&descriptor).await);
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.get_or_insert_with(HashMap::new).get_mut(fullname) {
            entry.data = Some(data.clone());
        }
        data
    }

    async fn ensure_master(&self) {
        if self.tables.read().await.is_some() {
            return;
        }
        let loaded = self.load_master().await;
        let mut tables = self.tables.write().await;
        if tables.is_none() {
            *tables = Some(loaded);
        }
    }

    /// Bulk-load the master table list. Errors yield an empty cache.
    async fn load_master(&self) -> HashMap<String, CodeTable> {
        let mut tables = HashMap::new();
        let connection = match self.broker.connect(self.config.database.as_deref()).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(%error, "cannot connect for code table list");
                return tables;
            }
        };

        let sql = format!(
            "SELECT {}, {}, {}, {}, {}, {}, {}, {} FROM {}",
            self.config.table_id,
            self.config.table_domain,
            self.config.table_name,
            self.config.flag_grouped,
            self.config.data_table_schema,
            self.config.data_table_name,
            self.config.data_table_code,
            self.config.data_table_desc,
            self.config.code_table,
        );
        let rows = match connection.query(&sql).await {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(%error, "cannot load code table list");
                return tables;
            }
        };

        for row in &rows.rows {
            if row.len() < 8 {
                continue;
            }
            let domain = opt_string(&row[1]).unwrap_or_default();
            let name = opt_string(&row[2]).unwrap_or_default();
            let fullname = if domain.is_empty() {
                name.clone()
            } else {
                format!("{}.{}", domain, name)
            };
            let grouped = value_truthy(&row[3]);

            let mut descriptor = CodeTableDescriptor {
                id: row[0].clone(),
                domain,
                name,
                fullname: fullname.clone(),
                grouped,
                schema: opt_string(&row[4]).unwrap_or_default(),
                table_name: opt_string(&row[5]).unwrap_or_default(),
                col_id: self.config.data_table_id.clone(),
                col_code: opt_string(&row[6]).unwrap_or_default(),
                col_desc: opt_string(&row[7]).unwrap_or_default(),
                defined: true,
            };
            if descriptor.grouped {
                // Grouped tables share a common layout; NULL master fields
                // fall back to it.
                if descriptor.col_id.is_empty() {
                    descriptor.col_id = "CodeTableId".to_string();
                }
                if descriptor.col_code.is_empty() {
                    descriptor.col_code = "CodeValue".to_string();
                }
                if descriptor.col_desc.is_empty() {
                    descriptor.col_desc = "Name".to_string();
                }
            }

            tables.insert(
                fullname,
                CodeTable {
                    descriptor,
                    data: None,
                },
            );
        }
        tables
    }

    /// Load one table's codes. Errors yield an empty map.
    async fn load_data(&self, descriptor: &CodeTableDescriptor) -> HashMap<String, String> {
        let mut data = HashMap::new();

        let qualified = if descriptor.schema.is_empty() {
            descriptor.table_name.clone()
        } else {
            format!("{}.{}", descriptor.schema, descriptor.table_name)
        };
        let mut sql = format!(
            "SELECT {}, {} FROM {}",
            descriptor.col_code, descriptor.col_desc, qualified
        );
        if descriptor.grouped {
            sql.push_str(&format!(
                " WHERE {} = {}",
                descriptor.col_id,
                value_literal(&descriptor.id)
            ));
        }

        let connection = match self.broker.connect(self.config.database.as_deref()).await {
            Ok(connection) => connection,
            Err(error) => {
                tracing::warn!(table = %descriptor.fullname, %error, "cannot connect for code table");
                return data;
            }
        };
        match connection.query(&sql).await {
            Ok(rows) => {
                for row in &rows.rows {
                    if row.len() < 2 {
                        continue;
                    }
                    data.insert(row[0].to_string(), row[1].to_string());
                }
            }
            Err(error) => {
                tracing::warn!(table = %descriptor.fullname, %error, "cannot load code table");
            }
        }
        data
    }
}

fn opt_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn value_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Int(i) => *i == 1,
        Value::Str(s) => {
            let yaml = serde_yaml::Value::String(s.clone());
            yaml_truthy(&yaml)
        }
        _ => false,
    }
}
