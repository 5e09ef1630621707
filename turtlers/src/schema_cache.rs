use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OnceCell};

use crate::backends::BackendConnection;
use crate::config::SchemaCacheConfig;
use crate::error::{Result, TurtleError};
use crate::model::StructDef;

/// Cloneable record of a failed lookup, replayed as the original error kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaFailure {
    NotFound(String),
    Authentication(String),
    UnknownNativeType { type_name: String, column: String },
    Other(String),
}

impl From<&TurtleError> for SchemaFailure {
    fn from(err: &TurtleError) -> Self {
        match err {
            TurtleError::SchemaNotFound(what) => SchemaFailure::NotFound(what.clone()),
            TurtleError::Authentication(msg) => SchemaFailure::Authentication(msg.clone()),
            TurtleError::UnknownNativeType { type_name, column } => {
                SchemaFailure::UnknownNativeType {
                    type_name: type_name.clone(),
                    column: column.clone(),
                }
            }
            other => SchemaFailure::Other(other.to_string()),
        }
    }
}

impl From<SchemaFailure> for TurtleError {
    fn from(failure: SchemaFailure) -> Self {
        match failure {
            SchemaFailure::NotFound(what) => TurtleError::SchemaNotFound(what),
            SchemaFailure::Authentication(msg) => TurtleError::Authentication(msg),
            SchemaFailure::UnknownNativeType { type_name, column } => {
                TurtleError::UnknownNativeType { type_name, column }
            }
            SchemaFailure::Other(msg) => TurtleError::Schema(msg),
        }
    }
}

type Lookup = std::result::Result<StructDef, SchemaFailure>;
type CacheKey = (String, String);

/// Cache entry with timestamp for TTL tracking.
#[derive(Debug, Clone)]
struct CacheEntry {
    lookup: Lookup,
    inserted_at: Instant,
}

/// Memoized schema lookups keyed by (connection, table or SQL block).
///
/// Failures are cached as well, so a missing table is reported once per
/// connection lifetime rather than re-queried.
///
/// Misses on a key that is already being fetched wait for that fetch.
#[derive(Debug)]
pub struct SchemaCache {
    schemas: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, Arc<OnceCell<Lookup>>>,
    /// `None` keeps entries until evicted by size.
    ttl: Option<Duration>,
    max_size: usize,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::with_config(&SchemaCacheConfig::default())
    }

    pub fn with_config(config: &SchemaCacheConfig) -> Self {
        Self {
            schemas: HashMap::new(),
            in_flight: HashMap::new(),
            ttl: (config.ttl_secs > 0).then(|| Duration::from_secs(config.ttl_secs)),
            max_size: config.max_size.max(1),
        }
    }

    pub fn table_key(table_path: &str) -> String {
        format!("table:{table_path}")
    }

    pub fn sql_key(name: &str) -> String {
        format!("sql:{name}")
    }

    pub fn insert(&mut self, connection: &str, key: &str, lookup: &Result<StructDef>) {
        self.store(connection, key, to_lookup(lookup));
    }

    fn store(&mut self, connection: &str, key: &str, lookup: Lookup) {
        let cache_key = (connection.to_string(), key.to_string());
        if !self.schemas.contains_key(&cache_key) && self.schemas.len() >= self.max_size {
            self.evict_oldest();
        }
        self.schemas.insert(
            cache_key,
            CacheEntry {
                lookup,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Cached outcome, or `None` on a miss or an expired entry.
    pub fn get(&self, connection: &str, key: &str) -> Option<Result<StructDef>> {
        let entry = self
            .schemas
            .get(&(connection.to_string(), key.to_string()))?;
        if !self.is_live(entry) {
            return None;
        }
        Some(entry.lookup.clone().map_err(TurtleError::from))
    }

    fn is_live(&self, entry: &CacheEntry) -> bool {
        match self.ttl {
            Some(ttl) => entry.inserted_at.elapsed() < ttl,
            None => true,
        }
    }

    /// Remove expired entries from the cache.
    pub fn evict_expired(&mut self) {
        if let Some(ttl) = self.ttl {
            self.schemas
                .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest_key) = self
            .schemas
            .iter()
            .min_by_key(|(_, entry)| entry.inserted_at)
            .map(|(k, _)| k.clone())
        {
            tracing::debug!(
                connection = %oldest_key.0,
                key = %oldest_key.1,
                "evicting oldest schema from cache"
            );
            self.schemas.remove(&oldest_key);
        }
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn clear(&mut self) {
        self.schemas.clear();
    }

    fn in_flight_cell(&mut self, connection: &str, key: &str) -> Arc<OnceCell<Lookup>> {
        self.in_flight
            .entry((connection.to_string(), key.to_string()))
            .or_default()
            .clone()
    }

    fn complete(&mut self, connection: &str, key: &str, lookup: Lookup) {
        self.in_flight
            .remove(&(connection.to_string(), key.to_string()));
        self.store(connection, key, lookup);
    }
}

fn to_lookup(lookup: &Result<StructDef>) -> Lookup {
    match lookup {
        Ok(schema) => Ok(schema.clone()),
        Err(err) => Err(SchemaFailure::from(err)),
    }
}

/// Cached outcome of `fetch` for `key`; concurrent misses share one fetch.
async fn cached_lookup<F, Fut>(
    cache: &Mutex<SchemaCache>,
    connection: &str,
    key: &str,
    fetch: F,
) -> Result<StructDef>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<StructDef>>,
{
    let cell = {
        let mut guard = cache.lock().await;
        if let Some(hit) = guard.get(connection, key) {
            tracing::trace!(connection, key, "schema cache hit");
            return hit;
        }
        guard.in_flight_cell(connection, key)
    };

    let mut fetched = None;
    let shared = cell
        .get_or_init(|| async {
            let lookup = fetch().await;
            let shared = to_lookup(&lookup);
            cache.lock().await.complete(connection, key, shared.clone());
            fetched = Some(lookup);
            shared
        })
        .await
        .clone();
    match fetched {
        Some(lookup) => lookup,
        None => {
            tracing::trace!(connection, key, "joined in-flight schema lookup");
            shared.map_err(TurtleError::from)
        }
    }
}

/// Table schema through the cache.
pub async fn cached_table_schema(
    cache: &Mutex<SchemaCache>,
    connection: &dyn BackendConnection,
    table_path: &str,
) -> Result<StructDef> {
    let key = SchemaCache::table_key(table_path);
    cached_lookup(cache, connection.name(), &key, || connection.fetch_schema(table_path)).await
}

/// SQL block schema through the cache.
pub async fn cached_sql_schema(
    cache: &Mutex<SchemaCache>,
    connection: &dyn BackendConnection,
    name: &str,
    sql: &str,
) -> Result<StructDef> {
    let key = SchemaCache::sql_key(name);
    cached_lookup(cache, connection.name(), &key, || connection.fetch_sql_schema(name, sql)).await
}
