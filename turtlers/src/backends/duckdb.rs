//! DuckDB backend implementation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::config::DuckDbConfig;
use crate::dialect::{Dialect, DuckDbDialect};
use crate::error::{Result, TurtleError};
use crate::executor::{ColumnMeta, QueryResult, RowStream};
use crate::model::{AtomicType, FieldDef, StructDef, StructRelationship, StructSource};

use super::BackendConnection;

const MEMORY: &str = ":memory:";

/// DuckDB connection implementing the unified backend trait.
///
/// Pooled connections are clones of one root connection, so they share the
/// same database, including `:memory:` ones.
#[derive(Clone)]
pub struct DuckDbConnection {
    name: String,
    database_path: String,
    dialect: DuckDbDialect,
    limiter: Arc<Semaphore>,
    root: Arc<Mutex<duckdb::Connection>>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbConnection {
    pub fn open(name: impl Into<String>, path: impl Into<String>) -> Result<Self> {
        Self::from_config(
            name,
            &DuckDbConfig {
                path: path.into(),
                ..Default::default()
            },
        )
    }

    pub fn in_memory(name: impl Into<String>) -> Result<Self> {
        Self::open(name, MEMORY)
    }

    pub fn from_config(name: impl Into<String>, config: &DuckDbConfig) -> Result<Self> {
        let name = name.into();
        tracing::info!(
            connection = %name,
            path = %config.path,
            max_concurrency = config.max_concurrency,
            "creating DuckDB connection"
        );
        let root = if config.path == MEMORY {
            duckdb::Connection::open_in_memory()?
        } else {
            duckdb::Connection::open(&config.path)?
        };
        Ok(Self {
            name,
            database_path: config.path.clone(),
            dialect: DuckDbDialect::default().with_default_sample_rows(config.default_sample_rows),
            limiter: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            root: Arc::new(Mutex::new(root)),
            pool: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Configure maximum concurrent executions; callers can tune based on hardware.
    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        tracing::debug!(max_concurrency = max_in_flight, "configuring DuckDB concurrency");
        self.limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        self.limiter
            .acquire()
            .await
            .map_err(|e| TurtleError::Execution(format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            let pool_size = guard.len();
            drop(guard);
            tracing::trace!(pool_remaining = pool_size, "reusing pooled DuckDB connection");
            return Ok(conn);
        }
        drop(guard);
        tracing::debug!(path = %self.database_path, "cloning DuckDB connection");
        let root = self.root.lock().await;
        Ok(root.try_clone()?)
    }

    async fn checkin_connection(&self, conn: duckdb::Connection) {
        self.pool.lock().await.push(conn);
    }

    /// Run `work` on a pooled connection off the async runtime.
    async fn with_connection<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&duckdb::Connection) -> Result<T> + Send + 'static,
    {
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let (result, conn) = tokio::task::spawn_blocking(move || {
            let result = work(&conn);
            (result, conn)
        })
        .await
        .map_err(|e| TurtleError::Execution(format!("task join error: {e}")))?;
        self.checkin_connection(conn).await;
        result
    }

    async fn describe(&self, relation: String, label: String) -> Result<Vec<FieldDef>> {
        self.with_connection(move |conn| {
            let start = Instant::now();
            let sql = format!("DESCRIBE SELECT * FROM {relation}");
            let mut stmt = conn.prepare(&sql).map_err(|e| not_found_or(e, &label))?;
            let mut rows = stmt.query([]).map_err(|e| not_found_or(e, &label))?;
            let mut fields = Vec::new();
            while let Some(row) = rows.next()? {
                let name: String = row.get("column_name")?;
                let native: String = row.get("column_type")?;
                fields.push(field_from_native(&name, &native)?);
            }
            tracing::debug!(
                relation = label.as_str(),
                columns = fields.len(),
                ms = start.elapsed().as_millis(),
                "duckdb describe"
            );
            Ok(fields)
        })
        .await
    }
}

fn not_found_or(err: duckdb::Error, label: &str) -> TurtleError {
    let message = err.to_string();
    if message.contains("does not exist") || message.contains("not found") {
        TurtleError::SchemaNotFound(label.to_string())
    } else {
        TurtleError::DuckDb(err)
    }
}

fn run_query(conn: &duckdb::Connection, sql: &str, row_limit: Option<u64>) -> Result<QueryResult> {
    let start = Instant::now();
    let mut stmt = conn.prepare(sql)?;
    let mut rows_iter = stmt.query([])?;
    let stmt_ref = rows_iter
        .as_ref()
        .ok_or_else(|| TurtleError::Execution("statement missing".to_string()))?;
    let mut column_names = Vec::new();
    for idx in 0..stmt_ref.column_count() {
        let name = stmt_ref
            .column_name(idx)
            .map_err(|e| TurtleError::Execution(e.to_string()))?;
        column_names.push(name.to_string());
    }
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        if row_limit.is_some_and(|limit| rows.len() as u64 >= limit) {
            break;
        }
        let mut map = serde_json::Map::new();
        for (idx, name) in column_names.iter().enumerate() {
            let value = crate::executor::duck_value_to_json(row.get_ref(idx)?.to_owned());
            map.insert(name.clone(), value);
        }
        rows.push(map);
    }

    let columns: Vec<_> = column_names
        .into_iter()
        .map(|name| ColumnMeta {
            name,
            native_type: None,
        })
        .collect();
    tracing::debug!(
        rows = rows.len(),
        columns = columns.len(),
        ms = start.elapsed().as_millis(),
        "duckdb execute_sql"
    );
    Ok(QueryResult { columns, rows })
}

#[async_trait]
impl BackendConnection for DuckDbConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn fetch_schema(&self, table_path: &str) -> Result<StructDef> {
        let relation = self.dialect.quote_table_path(table_path);
        let fields = self
            .describe(relation, table_path.to_string())
            .await?;
        Ok(StructDef::table(table_path, table_path, self.name.clone(), fields))
    }

    async fn fetch_sql_schema(&self, name: &str, sql: &str) -> Result<StructDef> {
        let fields = self
            .describe(format!("({sql}) AS q"), name.to_string())
            .await?;
        Ok(StructDef {
            name: name.to_string(),
            fields,
            struct_source: StructSource::SqlSubquery {
                select: sql.to_string(),
            },
            struct_relationship: StructRelationship::Basetable {
                connection_name: self.name.clone(),
            },
            primary_key: None,
        })
    }

    async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let sql = sql.to_string();
        tracing::trace!(sql = %sql, "executing DuckDB query");
        self.with_connection(move |conn| run_query(conn, &sql, None))
            .await
    }

    async fn stream_sql(&self, sql: &str, row_limit: Option<u64>) -> Result<RowStream> {
        // In-process engine: rows past the limit are never materialized.
        let sql = sql.to_string();
        let result = self
            .with_connection(move |conn| run_query(conn, &sql, row_limit))
            .await?;
        Ok(Box::pin(stream::iter(result.rows.into_iter().map(Ok))))
    }
}

/// Semantic field for a DuckDB column type.
pub(crate) fn field_from_native(name: &str, native: &str) -> Result<FieldDef> {
    let native = native.trim();
    if let Some(element) = native.strip_suffix("[]") {
        return match field_from_native(name, element)? {
            FieldDef::Atomic(a) => Ok(FieldDef::Struct(StructDef::scalar_array(name, a.field_type))),
            FieldDef::Struct(record) => Ok(FieldDef::Struct(StructDef::nested(name, true, record.fields))),
        };
    }
    let upper = native.to_ascii_uppercase();
    if upper.starts_with("STRUCT(") && upper.ends_with(')') {
        let inner = &native["STRUCT(".len()..native.len() - 1];
        let mut fields = Vec::new();
        for member in split_top_level(inner) {
            let (member_name, member_type) = split_member(&member).ok_or_else(|| {
                TurtleError::UnknownNativeType {
                    type_name: native.to_string(),
                    column: name.to_string(),
                }
            })?;
            fields.push(field_from_native(&member_name, &member_type)?);
        }
        return Ok(FieldDef::Struct(StructDef::nested(name, false, fields)));
    }
    let base = upper.split('(').next().unwrap_or_default().trim();
    let atomic = match base {
        "VARCHAR" | "TEXT" | "STRING" | "UUID" | "ENUM" | "CHAR" | "BPCHAR" => AtomicType::String,
        "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT"
        | "USMALLINT" | "UINTEGER" | "UBIGINT" | "UHUGEINT" | "FLOAT" | "REAL" | "DOUBLE"
        | "DECIMAL" | "NUMERIC" => AtomicType::Number,
        "BOOLEAN" | "BOOL" => AtomicType::Boolean,
        "DATE" => AtomicType::Date,
        "TIMESTAMP" | "DATETIME" | "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ" | "TIMESTAMP_S"
        | "TIMESTAMP_MS" | "TIMESTAMP_NS" => AtomicType::Timestamp,
        "JSON" => AtomicType::Json,
        _ => {
            return Err(TurtleError::UnknownNativeType {
                type_name: native.to_string(),
                column: name.to_string(),
            })
        }
    };
    Ok(FieldDef::atomic(name, atomic))
}

/// Split on commas outside parentheses and double quotes.
fn split_top_level(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// `name TYPE` or `"quoted name" TYPE`.
fn split_member(member: &str) -> Option<(String, String)> {
    if let Some(rest) = member.strip_prefix('"') {
        let end = rest.find('"')?;
        let name = rest[..end].to_string();
        return Some((name, rest[end + 1..].trim().to_string()));
    }
    let (name, ty) = member.split_once(' ')?;
    Some((name.to_string(), ty.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_types_map_to_fields() {
        assert_eq!(
            field_from_native("n", "DECIMAL(18,3)").unwrap().atomic_type(),
            Some(AtomicType::Number)
        );
        let tags = field_from_native("tags", "VARCHAR[]").unwrap();
        assert!(tags.as_struct().unwrap().is_scalar_array());

        let lines = field_from_native("lines", "STRUCT(sku VARCHAR, \"unit price\" DOUBLE)[]").unwrap();
        let lines = lines.as_struct().unwrap();
        assert!(lines.is_array() && !lines.is_scalar_array());
        assert_eq!(
            lines.field("unit price").and_then(|f| f.atomic_type()),
            Some(AtomicType::Number)
        );
        assert!(matches!(
            field_from_native("m", "MAP(VARCHAR, INTEGER)"),
            Err(TurtleError::UnknownNativeType { .. })
        ));
    }
}
