//! Compile a plan for the connection that owns its source and run it.

use std::sync::Arc;
use std::time::Duration;

use crate::backends::{BackendConnection, ConnectionManager};
use crate::compiler::{CompiledQuery, SqlCompiler};
use crate::error::{Result, TurtleError};
use crate::executor::{QueryResult, RowStream};
use crate::plan::QueryPlan;
use crate::registry::ModelRegistry;
use crate::validation::PlanValidator;

/// Validate `plan` and compile it with the dialect of its source's
/// connection.
pub fn compile_plan(
    connections: &ConnectionManager,
    plan: &QueryPlan,
) -> Result<(Arc<dyn BackendConnection>, CompiledQuery)> {
    let source = plan.source.structure.resolved()?;
    let name = source.connection_name().ok_or_else(|| {
        TurtleError::Validation(format!(
            "source {} is not bound to a connection",
            plan.source.alias
        ))
    })?;
    let conn = connections.require(name)?.clone();
    let warn_only = connections
        .config()
        .map(|c| c.defaults.validation.warn_only)
        .unwrap_or(false);
    PlanValidator::new(warn_only).validate(plan)?;

    let options = connections.config_for(name).compile;
    let compiled = SqlCompiler::new(conn.dialect())
        .with_options(options)
        .compile(plan)?;
    tracing::trace!(connection = name, sql = %compiled.sql, "compiled plan");
    Ok((conn, compiled))
}

pub async fn run_plan(connections: &ConnectionManager, plan: &QueryPlan) -> Result<QueryResult> {
    let (conn, compiled) = compile_plan(connections, plan)?;
    let timeout = Duration::from_millis(connections.config_for(conn.name()).query.timeout_ms);
    tokio::time::timeout(timeout, conn.execute_sql(&compiled.sql))
        .await
        .map_err(|_| {
            TurtleError::Execution(format!(
                "query on {} timed out after {}ms",
                conn.name(),
                timeout.as_millis()
            ))
        })?
}

/// Stream the rows of `plan`; `row_limit` falls back to the connection's
/// `default_row_limit` (0 = unlimited).
pub async fn stream_plan(
    connections: &ConnectionManager,
    plan: &QueryPlan,
    row_limit: Option<u64>,
) -> Result<RowStream> {
    let (conn, compiled) = compile_plan(connections, plan)?;
    let default_limit = connections.config_for(conn.name()).query.default_row_limit;
    let limit = row_limit.or((default_limit > 0).then_some(default_limit));
    conn.stream_sql(&compiled.sql, limit).await
}

/// Run the stored query `name` from `registry`.
pub async fn run_query(
    registry: &ModelRegistry,
    connections: &ConnectionManager,
    name: &str,
) -> Result<QueryResult> {
    let plan = registry.query(name)?;
    run_plan(connections, &plan).await
}
