//! Postgres connection broker backed by `sqlx` pools.
//!
//! Databases are declared in configuration:
//!
//! ```yaml
//! db:
//!     default:    backoffice
//!     databases:  [ "backoffice", "catalog" ]
//!     backoffice:
//!         driver:     postgres
//!         host:       db.internal
//!         port:       5432
//!         user:       backoffice
//!         password:   keychain:backoffice-db:changeme
//!         database:   backoffice
//!         loosetypes: false
//! ```
//!
//! Pools are created lazily per logical name and shared for the process
//! lifetime; passwords resolve through the keychain.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};

use super::{ConnectionBroker, DbConnection, DbError, QueryRows};
use crate::config::{Config, Keychain};
use crate::value::Value;

#[derive(Debug, Clone)]
struct DatabaseDef {
    url: String,
    loose_types: bool,
    encoding: Option<String>,
}

pub struct PostgresBroker {
    default_database: Option<String>,
    databases: HashMap<String, DatabaseDef>,
    pools: RwLock<HashMap<String, PgPool>>,
}

impl PostgresBroker {
    /// Build the broker from `db.*` configuration. Databases with a driver
    /// other than `postgres`, or with no definition block, are skipped.
    pub fn from_config(config: &Config) -> Result<PostgresBroker, DbError> {
        let keychain = Keychain::from_config(config);
        let mut default_database = config.get_str("db.default");
        let names = config.get_string_list("db.databases").ok_or_else(|| {
            DbError::Configuration("cannot find 'db.databases' configuration entry".to_string())
        })?;

        let mut databases = HashMap::new();
        for name in names {
            if config.get(&format!("db.{}", name)).is_none() {
                continue;
            }
            let driver = config
                .get_str(&format!("db.{}.driver", name))
                .unwrap_or_else(|| "postgres".to_string());
            if driver != "postgres" {
                tracing::debug!(database = %name, %driver, "skipping non-postgres database");
                continue;
            }
            databases.insert(name.clone(), DatabaseDef::from_config(config, &name, &keychain));
            if default_database.is_none() {
                default_database = Some(name);
            }
        }

        Ok(PostgresBroker {
            default_database,
            databases,
            pools: RwLock::new(HashMap::new()),
        })
    }

    fn resolve<'a>(&'a self, database: Option<&'a str>) -> Result<(&'a str, &'a DatabaseDef), DbError> {
        let name = database
            .or(self.default_database.as_deref())
            .ok_or_else(|| DbError::UnknownDatabase("<default>".to_string()))?;
        let def = self
            .databases
            .get(name)
            .ok_or_else(|| DbError::UnknownDatabase(name.to_string()))?;
        Ok((name, def))
    }

    fn pool(&self, name: &str, def: &DatabaseDef) -> Result<PgPool, DbError> {
        if let Some(pool) = self.pools.read().unwrap().get(name) {
            return Ok(pool.clone());
        }
        let pool = PgPoolOptions::new()
            .connect_lazy(&def.url)
            .map_err(|e| DbError::Connect {
                database: name.to_string(),
                detail: e.to_string(),
            })?;
        let mut pools = self.pools.write().unwrap();
        // A concurrent first use may have installed a pool already.
        let pool = pools.entry(name.to_string()).or_insert(pool);
        Ok(pool.clone())
    }
}

impl DatabaseDef {
    fn from_config(config: &Config, name: &str, keychain: &Keychain) -> DatabaseDef {
        let key = |field: &str| format!("db.{}.{}", name, field);
        let host = config.get_str(&key("host")).unwrap_or_else(|| "localhost".to_string());
        let port = config.get_i64(&key("port")).unwrap_or(5432);
        let user = config.get_str(&key("user")).unwrap_or_default();
        let password = config
            .get_str(&key("password"))
            .map(|p| keychain.fetch(&p))
            .unwrap_or_default();
        let database = config
            .get_str(&key("database"))
            .unwrap_or_else(|| name.to_string());

        let mut url = String::from("postgres://");
        if !user.is_empty() {
            url.push_str(&user);
            if !password.is_empty() {
                url.push(':');
                url.push_str(&password);
            }
            url.push('@');
        }
        url.push_str(&format!("{}:{}/{}", host, port, database));

        DatabaseDef {
            url,
            loose_types: config.get_bool(&key("loosetypes"), false),
            encoding: config.get_str(&key("encoding")),
        }
    }
}

#[async_trait]
impl ConnectionBroker for PostgresBroker {
    async fn connect(&self, database: Option<&str>) -> Result<Arc<dyn DbConnection>, DbError> {
        let (name, def) = self.resolve(database)?;
        let pool = self.pool(name, def)?;
        Ok(Arc::new(PostgresConnection { pool }))
    }

    fn default_database(&self) -> Option<&str> {
        self.default_database.as_deref()
    }

    fn loose_types(&self, database: Option<&str>) -> bool {
        self.resolve(database)
            .map(|(_, def)| def.loose_types)
            .unwrap_or(false)
    }

    fn encoding(&self, database: Option<&str>) -> Option<String> {
        self.resolve(database)
            .ok()
            .and_then(|(_, def)| def.encoding.clone())
    }
}

struct PostgresConnection {
    pool: PgPool,
}

#[async_trait]
impl DbConnection for PostgresConnection {
    async fn query(&self, sql: &str) -> Result<QueryRows, DbError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Query(e.to_string()))?;

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows.iter().map(decode_row).collect();
        Ok(QueryRows { columns, rows })
    }
}

fn decode_row(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| decode_column(row, index, column.type_info().name()))
        .collect()
}

/// Decode one column into the value algebra by declared Postgres type.
/// Anything undecodable becomes `Null` rather than failing the row.
fn decode_column(row: &PgRow, index: usize, type_name: &str) -> Value {
    fn take<'r, T>(row: &'r PgRow, index: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(index).ok().flatten()
    }

    let value = match type_name {
        "BOOL" => take::<bool>(row, index).map(Value::Bool),
        "INT2" => take::<i16>(row, index).map(|v| Value::Int(v.into())),
        "INT4" => take::<i32>(row, index).map(|v| Value::Int(v.into())),
        "INT8" => take::<i64>(row, index).map(Value::Int),
        "FLOAT4" => take::<f32>(row, index).map(|v| Value::Float(v.into())),
        "FLOAT8" => take::<f64>(row, index).map(Value::Float),
        "NUMERIC" => take::<Decimal>(row, index)
            .map(|d| d.to_f64().map(Value::Float).unwrap_or(Value::Null)),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => {
            take::<String>(row, index).map(Value::Str)
        }
        "BYTEA" => take::<Vec<u8>>(row, index).map(Value::Bytes),
        "DATE" => take::<NaiveDate>(row, index).map(Value::Date),
        "TIME" => take::<NaiveTime>(row, index).map(Value::Time),
        "TIMESTAMP" => take::<NaiveDateTime>(row, index).map(Value::DateTime),
        "TIMESTAMPTZ" => {
            take::<DateTime<Utc>>(row, index).map(|dt| Value::DateTime(dt.naive_utc()))
        }
        "JSON" | "JSONB" => take::<serde_json::Value>(row, index).map(Value::from),
        _ => take::<String>(row, index)
            .map(Value::Str)
            .or_else(|| take::<i64>(row, index).map(Value::Int))
            .or_else(|| take::<f64>(row, index).map(Value::Float))
            .or_else(|| take::<bool>(row, index).map(Value::Bool)),
    };
    value.unwrap_or(Value::Null)
}
