//! Database backend implementations.
//!
//! Each backend is implemented in its own file and gated behind a feature flag.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::{ResolvedConnectionConfig, TurtleConfig};
use crate::dialect::Dialect;
use crate::error::{Result, TurtleError};
use crate::executor::{QueryResult, RowStream};
use crate::model::StructDef;
use crate::naming::NamingContext;
use crate::schema_cache::{self, SchemaCache};

/// Unified interface for all database backends.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    /// Connection name, as referenced by `basetable` struct relationships.
    fn name(&self) -> &str;
    fn dialect(&self) -> &dyn Dialect;

    /// Columns of a table, as a `basetable` StructDef.
    async fn fetch_schema(&self, table_path: &str) -> Result<StructDef>;
    /// Columns produced by a SQL block, as a `sql_subquery` StructDef.
    async fn fetch_sql_schema(&self, name: &str, sql: &str) -> Result<StructDef>;

    async fn execute_sql(&self, sql: &str) -> Result<QueryResult>;

    /// Rows of `sql`, stopping after `row_limit` rows when set.
    async fn stream_sql(&self, sql: &str, row_limit: Option<u64>) -> Result<RowStream>;

    /// Persist the result of `sql` in a temporary table named after its
    /// content; returns the table name.
    async fn manifest_temporary_table(&self, sql: &str) -> Result<String> {
        let name = NamingContext::content_name("tt", sql);
        let ddl = self.dialect().create_table_as_select(&name, sql, true);
        self.execute_sql(&ddl).await?;
        tracing::debug!(connection = self.name(), table = name.as_str(), "manifested temporary table");
        Ok(name)
    }
}

/// Connections keyed by name, with one schema cache per manager.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: HashMap<String, Arc<dyn BackendConnection>>,
    config: Option<TurtleConfig>,
    schemas: Arc<Mutex<SchemaCache>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TurtleConfig) -> Self {
        let schemas = SchemaCache::with_config(&config.defaults.schema_cache);
        Self {
            connections: HashMap::new(),
            config: Some(config),
            schemas: Arc::new(Mutex::new(schemas)),
        }
    }

    pub fn config(&self) -> Option<&TurtleConfig> {
        self.config.as_ref()
    }

    pub fn config_for(&self, name: &str) -> ResolvedConnectionConfig {
        match &self.config {
            Some(cfg) => cfg.for_connection(name),
            None => TurtleConfig::default().for_connection(name),
        }
    }

    pub fn insert(&mut self, conn: Arc<dyn BackendConnection>) {
        self.connections.insert(conn.name().to_string(), conn);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn BackendConnection>> {
        self.connections.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<dyn BackendConnection>> {
        self.get(name)
            .ok_or_else(|| TurtleError::Config(format!("connection {name} not registered")))
    }

    pub async fn table_schema(&self, connection: &str, table_path: &str) -> Result<StructDef> {
        let conn = self.require(connection)?;
        schema_cache::cached_table_schema(&self.schemas, conn.as_ref(), table_path).await
    }

    pub async fn sql_schema(&self, connection: &str, name: &str, sql: &str) -> Result<StructDef> {
        let conn = self.require(connection)?;
        schema_cache::cached_sql_schema(&self.schemas, conn.as_ref(), name, sql).await
    }
}

// Feature-gated backend implementations
#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use self::duckdb::DuckDbConnection;

#[cfg(feature = "snowflake")]
mod snowflake;
#[cfg(feature = "snowflake")]
pub use self::snowflake::{map_native_type, SnowflakeConnection};
