//! Configuration for Turtle.
//!
//! TOML with global defaults and per-connection overrides:
//!
//! ```toml
//! [defaults.compile]
//! symmetric_precision = 0.000001
//!
//! [connections.warehouse.snowflake]
//! account = "acme-xy12345"
//! token_env = "SNOWFLAKE_TOKEN"
//! week_start = "sunday"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compiler::CompileOptions;
use crate::dialect::{QuoteMode, WeekStart};
use crate::error::{Result, TurtleError};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TurtleConfig {
    /// Global defaults applied to all connections unless overridden.
    pub defaults: GlobalDefaults,

    /// Per-connection overrides keyed by connection name.
    pub connections: HashMap<String, ConnectionConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalDefaults {
    pub compile: CompileOptions,
    pub query: QueryConfig,
    pub schema_cache: SchemaCacheConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Statement timeout in milliseconds (default: 60000).
    pub timeout_ms: u64,
    /// Row limit applied to streamed results when the caller sets none
    /// (0 = unlimited).
    pub default_row_limit: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchemaCacheConfig {
    /// Entry lifetime in seconds; 0 keeps entries for the connection's
    /// lifetime.
    pub ttl_secs: u64,
    /// Maximum cached schemas (default: 1000).
    pub max_size: usize,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Log plan validation failures instead of rejecting the plan.
    pub warn_only: bool,
}

/// Per-connection configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub query: Option<QueryConfig>,
    pub schema_cache: Option<SchemaCacheConfig>,
    pub snowflake: Option<SnowflakeConfig>,
    pub duckdb: Option<DuckDbConfig>,
}

/// Snowflake SQL API settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SnowflakeConfig {
    /// Account identifier, e.g. `acme-xy12345`.
    pub account: String,
    /// Overrides `https://<account>.snowflakecomputing.com`.
    pub host: Option<String>,
    pub token: Option<String>,
    /// Environment variable holding the token when `token` is unset.
    pub token_env: Option<String>,
    /// `OAUTH` or `KEYPAIR_JWT` (default: OAUTH).
    pub token_type: String,
    pub warehouse: Option<String>,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub role: Option<String>,
    /// Maximum in-flight statements (default: 8).
    pub max_concurrent_queries: usize,
    /// Delay between status polls of a running statement (default: 250).
    pub poll_interval_ms: u64,
    /// Server-side statement timeout (default: 600).
    pub statement_timeout_secs: u64,
    pub quote_identifiers: QuoteMode,
    /// Must match the account's `WEEK_START` parameter.
    pub week_start: WeekStart,
    pub default_sample_rows: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DuckDbConfig {
    /// Database file; `:memory:` for an in-memory database.
    pub path: String,
    /// Maximum concurrent queries (default: 16).
    pub max_concurrency: usize,
    pub default_sample_rows: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            default_row_limit: 0,
        }
    }
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 0,
            max_size: 1000,
        }
    }
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            host: None,
            token: None,
            token_env: None,
            token_type: "OAUTH".to_string(),
            warehouse: None,
            database: None,
            schema: None,
            role: None,
            max_concurrent_queries: 8,
            poll_interval_ms: 250,
            statement_timeout_secs: 600,
            quote_identifiers: QuoteMode::Always,
            // Snowflake's default WEEK_START of 0 behaves like Monday.
            week_start: WeekStart::Monday,
            default_sample_rows: crate::dialect::snowflake::DEFAULT_SAMPLE_ROWS,
        }
    }
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            max_concurrency: 16,
            default_sample_rows: crate::dialect::duckdb::DEFAULT_SAMPLE_ROWS,
        }
    }
}

impl SnowflakeConfig {
    pub fn base_url(&self) -> Result<String> {
        if let Some(host) = &self.host {
            return Ok(host.trim_end_matches('/').to_string());
        }
        if self.account.is_empty() {
            return Err(TurtleError::Config(
                "snowflake account or host must be set".to_string(),
            ));
        }
        Ok(format!("https://{}.snowflakecomputing.com", self.account))
    }

    /// Token from `token`, else from the `token_env` variable.
    pub fn resolve_token(&self) -> Result<String> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        let var = self.token_env.as_deref().ok_or_else(|| {
            TurtleError::Authentication("snowflake token or token_env must be set".to_string())
        })?;
        std::env::var(var).map_err(|_| {
            TurtleError::Authentication(format!("environment variable {var} is not set"))
        })
    }
}

impl TurtleConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TurtleError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| TurtleError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `TURTLE_CONFIG` environment variable
    /// 2. `./turtle.toml`
    /// 3. `<user config dir>/turtle/config.toml`
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("TURTLE_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path, "loaded config from TURTLE_CONFIG");
                    return cfg;
                }
                Err(e) => tracing::warn!(path = %path, error = %e, "ignoring TURTLE_CONFIG"),
            }
        }

        if let Ok(cfg) = Self::from_file("turtle.toml") {
            tracing::info!("loaded config from ./turtle.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("turtle").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Resolved config for a connection (merges global defaults).
    pub fn for_connection(&self, name: &str) -> ResolvedConnectionConfig {
        ResolvedConnectionConfig::merge(&self.defaults, self.connections.get(name))
    }
}

/// Fully resolved configuration for a connection (no Option fields).
#[derive(Debug, Clone)]
pub struct ResolvedConnectionConfig {
    pub compile: CompileOptions,
    pub query: QueryConfig,
    pub schema_cache: SchemaCacheConfig,
    pub snowflake: SnowflakeConfig,
    pub duckdb: DuckDbConfig,
}

impl ResolvedConnectionConfig {
    fn merge(defaults: &GlobalDefaults, override_cfg: Option<&ConnectionConfig>) -> Self {
        let conn = override_cfg.cloned().unwrap_or_default();
        Self {
            compile: defaults.compile,
            query: conn.query.unwrap_or_else(|| defaults.query.clone()),
            schema_cache: conn
                .schema_cache
                .unwrap_or_else(|| defaults.schema_cache.clone()),
            snowflake: conn.snowflake.unwrap_or_default(),
            duckdb: conn.duckdb.unwrap_or_default(),
        }
    }
}
