use thiserror::Error;

pub type Result<T> = std::result::Result<T, TurtleError>;

#[derive(Debug, Error)]
pub enum TurtleError {
    #[error("{dialect} cannot render {operation}: {detail}")]
    UnsupportedDialectFeature {
        dialect: String,
        operation: String,
        detail: String,
    },
    #[error("unknown native type {type_name} for column {column}")]
    UnknownNativeType { type_name: String, column: String },
    #[error("stage {stage} has no upstream placeholder to resolve")]
    UnresolvedPlaceholder { stage: String },
    #[error("{dialect} cannot sample with {sampling}: {reason}")]
    SamplingUnsupported {
        dialect: String,
        sampling: String,
        reason: String,
    },
    #[error("schema not found: {0}")]
    SchemaNotFound(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[cfg(feature = "snowflake")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[cfg(feature = "duckdb")]
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TurtleError {
    pub fn unsupported(
        dialect: impl Into<String>,
        operation: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        TurtleError::UnsupportedDialectFeature {
            dialect: dialect.into(),
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}
