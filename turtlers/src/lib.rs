pub mod backends;
pub mod compiler;
pub mod config;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod fragment;
pub mod model;
pub mod naming;
pub mod plan;
pub mod registry;
pub mod runtime;
pub mod schema_cache;
pub mod symmetric;
pub mod validation;

use std::path::Path;

use crate::error::Result;
use crate::registry::ModelRegistry;

/// Load struct definitions and stored queries from disk and validate every
/// query with the provided validator.
pub fn load_and_validate<P: AsRef<Path>>(
    model_dir: P,
    validator: &PlanValidator,
) -> Result<ModelRegistry> {
    let registry = ModelRegistry::load_from_dir(model_dir)?;
    let mut names: Vec<&String> = registry.queries.keys().collect();
    names.sort();
    for name in names {
        validator.validate(&registry.query(name)?)?;
    }
    Ok(registry)
}

pub use crate::validation::PlanValidator;
pub use backends::{BackendConnection, ConnectionManager};
pub use compiler::{CompileOptions, CompiledQuery, SqlCompiler};
pub use config::TurtleConfig;
pub use dialect::{Dialect, DialectKind, DuckDbDialect, SnowflakeDialect};
pub use error::{Result as TurtleResult, TurtleError};
pub use executor::{QueryResult, RowStream};
pub use model::{AtomicType, FieldDef, StructDef};
pub use plan::QueryPlan;
