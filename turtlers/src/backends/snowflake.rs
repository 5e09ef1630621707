//! Snowflake backend over the SQL API (`/api/v2/statements`).
//!
//! Statements are submitted over HTTPS, polled while running, and their
//! result partitions are fetched lazily. Values arrive as strings and are
//! converted using the result set's `rowType`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::SnowflakeConfig;
use crate::dialect::{Dialect, SnowflakeDialect};
use crate::error::{Result, TurtleError};
use crate::executor::{epoch_days_to_string, epoch_micros_to_string, ColumnMeta, QueryResult, RowStream};
use crate::model::{AtomicType, FieldDef, StructDef, StructRelationship, StructSource};

use super::BackendConnection;

const STATEMENTS_PATH: &str = "/api/v2/statements";
const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";

static PROBE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    #[serde(default)]
    num_rows: u64,
    #[serde(default)]
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<PartitionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    scale: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitionInfo {
    #[serde(default)]
    row_count: u64,
}

/// A finished statement: its handle, columns and first partition.
struct Statement {
    handle: String,
    columns: Arc<Vec<RowType>>,
    first: Vec<Vec<Option<String>>>,
    partitions: usize,
}

/// Snowflake connection implementing the unified backend trait.
#[derive(Clone)]
pub struct SnowflakeConnection {
    name: String,
    config: SnowflakeConfig,
    base_url: String,
    token: String,
    dialect: SnowflakeDialect,
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
}

impl SnowflakeConnection {
    pub fn new(name: impl Into<String>, config: SnowflakeConfig) -> Result<Self> {
        let name = name.into();
        let base_url = config.base_url()?;
        let token = config.resolve_token()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.statement_timeout_secs + 30))
            .build()?;
        let dialect = SnowflakeDialect::new()
            .with_quote_mode(config.quote_identifiers)
            .with_week_start(config.week_start)
            .with_default_sample_rows(config.default_sample_rows);
        tracing::info!(
            connection = %name,
            url = %base_url,
            max_concurrent_queries = config.max_concurrent_queries,
            "creating Snowflake connection"
        );
        Ok(Self {
            name,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_queries.max(1))),
            config,
            base_url,
            token,
            dialect,
            client,
        })
    }

    fn statement_url(&self, handle: &str) -> String {
        format!("{}{STATEMENTS_PATH}/{handle}", self.base_url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header(TOKEN_TYPE_HEADER, &self.config.token_type)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all Snowflake slots in use, waiting for permit");
        }
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TurtleError::Execution(format!("limiter closed: {e}")))
    }

    async fn read(response: reqwest::Response) -> Result<(StatusCode, StatementResponse)> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(TurtleError::Authentication(format!("snowflake returned {status}: {body}")));
        }
        let body = response.text().await?;
        let parsed: StatementResponse = serde_json::from_str(&body).map_err(|e| {
            TurtleError::Execution(format!("unexpected snowflake response ({status}): {e}"))
        })?;
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            return Err(TurtleError::Execution(format!(
                "snowflake statement failed ({status}, code {}): {}",
                parsed.code.as_deref().unwrap_or("?"),
                parsed.message.as_deref().unwrap_or("no message")
            )));
        }
        Ok((status, parsed))
    }

    /// Submit `sql` and wait for it to finish.
    async fn run_statement(&self, sql: &str) -> Result<Statement> {
        let start = Instant::now();
        let mut body = json!({
            "statement": sql,
            "timeout": self.config.statement_timeout_secs,
        });
        for (key, value) in [
            ("warehouse", &self.config.warehouse),
            ("database", &self.config.database),
            ("schema", &self.config.schema),
            ("role", &self.config.role),
        ] {
            if let Some(value) = value {
                body[key] = Value::String(value.clone());
            }
        }
        tracing::trace!(sql = %sql, "submitting Snowflake statement");
        let request = self
            .authorized(self.client.post(format!("{}{STATEMENTS_PATH}", self.base_url)))
            .json(&body);
        let (mut status, mut response) = Self::read(request.send().await?).await?;
        let handle = response
            .statement_handle
            .clone()
            .ok_or_else(|| TurtleError::Execution("snowflake response has no statement handle".to_string()))?;

        let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));
        while status == StatusCode::ACCEPTED {
            tokio::time::sleep(poll).await;
            let request = self.authorized(self.client.get(self.statement_url(&handle)));
            (status, response) = Self::read(request.send().await?).await?;
        }

        let meta = response.result_set_meta_data.take().ok_or_else(|| {
            TurtleError::Execution(format!("statement {handle} returned no result set"))
        })?;
        tracing::debug!(
            handle = handle.as_str(),
            rows = meta.num_rows,
            partitions = meta.partition_info.len(),
            ms = start.elapsed().as_millis(),
            "snowflake statement finished"
        );
        Ok(Statement {
            handle,
            partitions: meta.partition_info.len().max(1),
            columns: Arc::new(meta.row_type),
            first: response.data,
        })
    }

    async fn fetch_partition(&self, handle: &str, partition: usize) -> Result<Vec<Vec<Option<String>>>> {
        let request = self
            .authorized(self.client.get(self.statement_url(handle)))
            .query(&[("partition", partition)]);
        let (_, response) = Self::read(request.send().await?).await?;
        Ok(response.data)
    }

    fn cancel_guard(&self, handle: &str) -> CancelOnDrop {
        CancelOnDrop {
            request: Some(
                self.authorized(
                    self.client
                        .post(format!("{}/cancel", self.statement_url(handle))),
                ),
            ),
        }
    }

    async fn text_rows(&self, sql: &str) -> Result<Vec<Map<String, Value>>> {
        Ok(self.execute_sql(sql).await?.rows)
    }

    /// Fields from `(name, type)` rows, sampling semi-structured columns
    /// out of `relation`.
    async fn fields_from_columns(&self, columns: Vec<(String, String)>, relation: &str) -> Result<Vec<FieldDef>> {
        let mut fields = Vec::with_capacity(columns.len());
        for (name, native) in columns {
            let field = match native.as_str() {
                "ARRAY" | "OBJECT" | "VARIANT" => {
                    self.semi_structured_field(relation, &name, &native).await?
                }
                _ => FieldDef::atomic(&name, map_native_type(&native, &name)?),
            };
            fields.push(field);
        }
        Ok(fields)
    }

    async fn semi_structured_field(&self, relation: &str, column: &str, native: &str) -> Result<FieldDef> {
        let q = self.dialect.quote_identifier(column);
        let kind = match native {
            "VARIANT" => {
                let sql = format!(
                    "SELECT TYPEOF({q}) AS \"type\" FROM {relation} WHERE {q} IS NOT NULL LIMIT 1"
                );
                match self.text_rows(&sql).await?.first() {
                    Some(row) => text(row, "type")?,
                    None => "VARIANT".to_string(),
                }
            }
            other => other.to_string(),
        };
        match kind.as_str() {
            "ARRAY" => {
                let sql = format!(
                    "SELECT TYPEOF(GET({q}, 0)) AS \"type\" FROM {relation} WHERE ARRAY_SIZE({q}) > 0 LIMIT 1"
                );
                let element = match self.text_rows(&sql).await?.first() {
                    Some(row) => text(row, "type")?,
                    None => {
                        tracing::warn!(column, "no sample for array column, elements typed as json");
                        "VARIANT".to_string()
                    }
                };
                if element == "OBJECT" {
                    let keys = self
                        .object_keys(&format!("GET({q}, 0)"), &format!("ARRAY_SIZE({q}) > 0"), relation)
                        .await?;
                    Ok(FieldDef::Struct(StructDef::nested(column, true, keys)))
                } else {
                    Ok(FieldDef::Struct(StructDef::scalar_array(column, sampled_type(&element))))
                }
            }
            "OBJECT" => {
                let keys = self
                    .object_keys(&q, &format!("{q} IS NOT NULL"), relation)
                    .await?;
                Ok(FieldDef::Struct(StructDef::nested(column, false, keys)))
            }
            other => Ok(FieldDef::atomic(column, sampled_type(other))),
        }
    }

    /// Keys and value types of the first object matching `condition`.
    async fn object_keys(&self, object: &str, condition: &str, relation: &str) -> Result<Vec<FieldDef>> {
        let sql = format!(
            "SELECT f.KEY AS \"key\", TYPEOF(f.VALUE) AS \"type\" FROM (SELECT {object} AS o FROM {relation} WHERE {condition} LIMIT 1) AS s, LATERAL FLATTEN(INPUT => s.o) AS f ORDER BY f.INDEX, f.KEY"
        );
        let mut fields = Vec::new();
        for row in self.text_rows(&sql).await? {
            fields.push(FieldDef::atomic(text(&row, "key")?, sampled_type(&text(&row, "type")?)));
        }
        Ok(fields)
    }

    async fn probe_fields(&self, probe: &str, sql: &str) -> Result<Vec<FieldDef>> {
        self.execute_sql(&format!(
            "CREATE TRANSIENT TABLE {probe} AS SELECT * FROM ({sql}) AS x WHERE false"
        ))
        .await?;
        let info = format!(
            "SELECT column_name AS \"name\", data_type AS \"type\" FROM information_schema.columns WHERE table_schema = CURRENT_SCHEMA() AND table_name = {} ORDER BY ordinal_position",
            self.dialect.quote_string(probe)
        );
        let columns = column_rows(self.text_rows(&info).await?)?;
        self.fields_from_columns(columns, &format!("({sql}) AS x")).await
    }
}

/// Posts a cancel request for an unfinished statement when dropped.
struct CancelOnDrop {
    request: Option<reqwest::RequestBuilder>,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.request = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let Some(request) = self.request.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                match request.send().await {
                    Ok(_) => tracing::debug!("cancelled snowflake statement"),
                    Err(e) => tracing::warn!(error = %e, "failed to cancel snowflake statement"),
                }
            });
        }
    }
}

struct StreamState {
    conn: SnowflakeConnection,
    handle: String,
    columns: Arc<Vec<RowType>>,
    buffer: VecDeque<Vec<Option<String>>>,
    next_partition: usize,
    partitions: usize,
    emitted: u64,
    limit: Option<u64>,
    done: bool,
    guard: CancelOnDrop,
    _permit: OwnedSemaphorePermit,
}

fn text(row: &Map<String, Value>, key: &str) -> Result<String> {
    match row.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(other.to_string()),
        None => Err(TurtleError::Schema(format!("missing column {key} in schema query"))),
    }
}

fn column_rows(rows: Vec<Map<String, Value>>) -> Result<Vec<(String, String)>> {
    rows.iter()
        .map(|row| Ok((text(row, "name")?, text(row, "type")?)))
        .collect()
}

fn to_row(columns: &[RowType], raw: Vec<Option<String>>) -> Map<String, Value> {
    let mut map = Map::new();
    for (column, value) in columns.iter().zip(raw) {
        map.insert(column.name.clone(), convert_value(value, column));
    }
    map
}

/// Micros since the epoch from `seconds[.fraction][ offset]`.
fn parse_epoch_micros(raw: &str) -> Option<i64> {
    let seconds_part = raw.split_whitespace().next()?;
    let (whole, fraction) = seconds_part.split_once('.').unwrap_or((seconds_part, ""));
    let seconds: i64 = whole.parse().ok()?;
    let mut digits: String = fraction.chars().take(6).collect();
    while digits.len() < 6 {
        digits.push('0');
    }
    let micros: i64 = digits.parse().ok()?;
    let base = seconds.checked_mul(1_000_000)?;
    Some(if whole.starts_with('-') { base - micros } else { base + micros })
}

fn convert_value(raw: Option<String>, column: &RowType) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    let kind = column.kind.to_ascii_lowercase();
    let converted = match kind.as_str() {
        "fixed" if column.scale.unwrap_or(0) == 0 => raw.parse::<i64>().ok().map(Value::from),
        "fixed" | "real" => raw.parse::<f64>().ok().map(Value::from),
        "boolean" => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        "date" => raw
            .parse::<i64>()
            .ok()
            .and_then(epoch_days_to_string)
            .map(Value::String),
        "timestamp_ntz" | "timestamp_ltz" | "timestamp_tz" => parse_epoch_micros(&raw)
            .and_then(epoch_micros_to_string)
            .map(Value::String),
        "variant" | "object" | "array" => serde_json::from_str(&raw).ok(),
        _ => None,
    };
    converted.unwrap_or(Value::String(raw))
}

/// Semantic type of a Snowflake column type.
pub fn map_native_type(type_name: &str, column: &str) -> Result<AtomicType> {
    match type_name.to_ascii_uppercase().as_str() {
        "BOOLEAN" => Ok(AtomicType::Boolean),
        "DATE" => Ok(AtomicType::Date),
        "FLOAT" | "NUMBER" | "INTEGER" | "DECIMAL" | "DOUBLE" => Ok(AtomicType::Number),
        "TEXT" | "VARCHAR" => Ok(AtomicType::String),
        "TIMESTAMP" | "TIMESTAMP_LTZ" | "TIMESTAMP_NTZ" | "TIMESTAMP_TZ" => Ok(AtomicType::Timestamp),
        _ => Err(TurtleError::UnknownNativeType {
            type_name: type_name.to_string(),
            column: column.to_string(),
        }),
    }
}

/// Type of a sampled semi-structured value; anything unmapped stays json.
fn sampled_type(type_name: &str) -> AtomicType {
    map_native_type(type_name, "").unwrap_or(AtomicType::Json)
}

#[async_trait]
impl BackendConnection for SnowflakeConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn fetch_schema(&self, table_path: &str) -> Result<StructDef> {
        let parts: Vec<&str> = table_path.split('.').collect();
        let (catalog, schema_filter, table) = match parts.as_slice() {
            [table] => (String::new(), "CURRENT_SCHEMA()".to_string(), *table),
            [schema, table] => (
                String::new(),
                format!("UPPER({})", self.dialect.quote_string(schema)),
                *table,
            ),
            [database, schema, table] => (
                format!("{database}."),
                format!("UPPER({})", self.dialect.quote_string(schema)),
                *table,
            ),
            _ => {
                return Err(TurtleError::Validation(format!(
                    "invalid table path {table_path}"
                )))
            }
        };
        let info = format!(
            "SELECT column_name AS \"name\", data_type AS \"type\" FROM {catalog}information_schema.columns WHERE table_schema = {schema_filter} AND table_name = UPPER({}) ORDER BY ordinal_position",
            self.dialect.quote_string(table)
        );
        let columns = column_rows(self.text_rows(&info).await?)?;
        if columns.is_empty() {
            return Err(TurtleError::SchemaNotFound(table_path.to_string()));
        }
        let fields = self.fields_from_columns(columns, table_path).await?;
        Ok(StructDef::table(table_path, table_path, self.name.clone(), fields))
    }

    async fn fetch_sql_schema(&self, name: &str, sql: &str) -> Result<StructDef> {
        let digest = format!("{:x}", md5::compute(sql.as_bytes()));
        let probe = format!(
            "TMP_{}_{}",
            &digest[..12].to_ascii_uppercase(),
            PROBE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let fields = self.probe_fields(&probe, sql).await;
        if let Err(e) = self.execute_sql(&format!("DROP TABLE IF EXISTS {probe}")).await {
            tracing::warn!(probe = probe.as_str(), error = %e, "failed to drop schema probe table");
        }
        Ok(StructDef {
            name: name.to_string(),
            fields: fields?,
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
        let _permit = self.acquire_slot().await?;
        let start = Instant::now();
        let statement = self.run_statement(sql).await?;
        let mut rows: Vec<Map<String, Value>> = statement
            .first
            .into_iter()
            .map(|raw| to_row(&statement.columns, raw))
            .collect();
        for partition in 1..statement.partitions {
            for raw in self.fetch_partition(&statement.handle, partition).await? {
                rows.push(to_row(&statement.columns, raw));
            }
        }
        let columns = statement
            .columns
            .iter()
            .map(|c| ColumnMeta {
                name: c.name.clone(),
                native_type: Some(c.kind.clone()),
            })
            .collect::<Vec<_>>();
        tracing::debug!(
            rows = rows.len(),
            columns = columns.len(),
            ms = start.elapsed().as_millis(),
            "snowflake execute_sql"
        );
        Ok(QueryResult { columns, rows })
    }

    async fn stream_sql(&self, sql: &str, row_limit: Option<u64>) -> Result<RowStream> {
        let permit = self.acquire_slot().await?;
        let statement = self.run_statement(sql).await?;
        let state = StreamState {
            conn: self.clone(),
            guard: self.cancel_guard(&statement.handle),
            handle: statement.handle,
            columns: statement.columns,
            buffer: statement.first.into(),
            next_partition: 1,
            partitions: statement.partitions,
            emitted: 0,
            limit: row_limit,
            done: false,
            _permit: permit,
        };
        let stream = futures::stream::unfold(state, |mut st| async move {
            if st.done || st.limit.is_some_and(|limit| st.emitted >= limit) {
                // Dropping the state with an armed guard cancels the statement.
                return None;
            }
            while st.buffer.is_empty() && st.next_partition < st.partitions {
                match st.conn.fetch_partition(&st.handle, st.next_partition).await {
                    Ok(rows) => {
                        st.buffer.extend(rows);
                        st.next_partition += 1;
                    }
                    Err(e) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                }
            }
            match st.buffer.pop_front() {
                Some(raw) => {
                    st.emitted += 1;
                    let row = to_row(&st.columns, raw);
                    Some((Ok(row), st))
                }
                None => {
                    st.guard.disarm();
                    None
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
