//! SQL dialect abstractions for different database engines.
//!
//! Each dialect is implemented in its own file. The compiler walks the plan
//! and asks the dialect to render one node at a time; dialects never walk the
//! plan and carry no mutable state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurtleError};
use crate::fragment::SqlFragment;
use crate::model::{
    AlterOp, AtomicType, DialectField, ExtractUnit, GroupSet, Sampling, SortDirection, SortTerm,
    TimeFieldType, TimeValue, TimestampUnit, TypecastFragment,
};

/// First day of the week used by an engine's native week truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekStart {
    #[default]
    Monday,
    Sunday,
}

/// How a field reference reaches its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStep {
    /// Column of a relation.
    Column,
    /// Key of a record value, after `depth` earlier keys.
    Key { depth: usize },
    /// An unnested array element.
    Element,
    /// Key of an unnested record element.
    ElementKey,
}

impl PathStep {
    /// Step used for a key read from the value this step produced.
    pub fn next(self) -> Self {
        match self {
            PathStep::Column => PathStep::Key { depth: 0 },
            PathStep::Key { depth } => PathStep::Key { depth: depth + 1 },
            PathStep::Element | PathStep::ElementKey => PathStep::Key { depth: 1 },
        }
    }
}

/// How identifiers are quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteMode {
    #[default]
    Always,
    /// Leave identifiers bare when they are already in the engine's
    /// canonical unquoted form and are not reserved.
    WhenNeeded,
}

/// Engine capabilities consulted by the shared protocols.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DialectCapabilities {
    /// The dialect renders its own fan-out safe `sum_distinct`.
    pub supports_sum_distinct_function: bool,
    pub supports_unnest: bool,
    pub supports_percent_sampling: bool,
    pub max_sample_rows: Option<u64>,
    pub default_sample_rows: u64,
    pub native_week_start: WeekStart,
}

/// Rendering service implemented once per engine.
///
/// Arguments named `alias`, `expr`, `key`, `value` and `source` are already
/// rendered SQL. Arguments named `name`, `field` or `path` are raw semantic
/// names that the dialect quotes itself.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;
    fn capabilities(&self) -> DialectCapabilities;

    fn quote_identifier(&self, name: &str) -> String;
    fn quote_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }
    /// Paths that cannot be a bare identifier (file paths) become string literals.
    fn quote_table_path(&self, path: &str) -> String {
        if path.contains('/') {
            self.quote_string(path)
        } else {
            path.to_string()
        }
    }

    /// Reference `field` of `alias`, reached the way `step` says.
    fn field_reference(&self, alias: &str, field: &str, step: PathStep) -> String;

    /// Row source with `levels + 1` rows and an integer `group_set` column.
    fn group_set_table(&self, levels: u32) -> Result<String>;
    fn aggregate_turtle(
        &self,
        level: GroupSet,
        fields: &[DialectField],
        order_by: &[SortTerm],
        limit: Option<u64>,
    ) -> String;
    fn coalesce_measures_inline(&self, level: GroupSet, fields: &[DialectField]) -> String;
    /// One value per group taken only from rows of `level`.
    fn any_value(&self, level: GroupSet, expr: &str) -> String {
        format!("MAX(CASE WHEN group_set = {level} THEN {expr} END)")
    }

    /// Outer join exploding `source` into rows named `alias`.
    fn unnest_alias(&self, source: &str, alias: &str, needs_distinct_key: bool) -> String;
    /// Position of the element within its array, for distinct keys.
    fn unnest_row_id(&self, alias: &str) -> String;

    fn sum_distinct(&self, key: &str, value: &str, precision: f64) -> Result<String> {
        let _ = (key, value, precision);
        Err(TurtleError::unsupported(
            self.name(),
            "sum_distinct",
            "no native rendering; use the shared symmetric formula",
        ))
    }
    fn sum_distinct_hashed_key(&self, key: &str) -> String;
    /// Exact integer type wide enough to sum hashed keys.
    fn hashed_key_type(&self) -> &'static str;

    fn sample_table(&self, table_sql: &str, sampling: &Sampling) -> Result<String>;

    fn order_by(&self, terms: &[SortTerm]) -> String {
        if terms.is_empty() {
            return String::new();
        }
        format!("ORDER BY {}", render_sort_terms(terms))
    }

    /// Source for a stage that reads one column of the upstream stage as
    /// rows of `base`.
    fn pipeline_head(&self, is_singleton: bool, source_column: &str) -> SqlFragment;
    fn pipelined_stage(&self, fragment: &SqlFragment, last_stage_name: &str) -> Result<String> {
        fragment.resolve(last_stage_name)
    }

    fn select_alias_as_struct(&self, alias: &str, physical_names: &[String]) -> String;

    fn native_type(&self, atomic: AtomicType) -> &'static str;
    fn cast(&self, cast: &TypecastFragment) -> String;
    fn literal_time(
        &self,
        value: &str,
        time_type: TimeFieldType,
        timezone: Option<&str>,
    ) -> Result<String>;
    fn truncate_time(&self, value: &TimeValue, unit: TimestampUnit) -> String;
    fn extract_time_part(&self, value: &TimeValue, unit: ExtractUnit) -> String;
    fn alter_time(
        &self,
        op: AlterOp,
        value: &TimeValue,
        amount: &str,
        unit: TimestampUnit,
    ) -> String;
    fn measure_time(&self, from: &TimeValue, to: &TimeValue, unit: TimestampUnit) -> String;
    fn regexp_match(&self, expr: &str, pattern: &str) -> String;
    fn generate_uuid(&self) -> String;
    fn now_expression(&self) -> String;
    fn date_to_string(&self, expr: &str) -> String;

    fn create_table_as_select(&self, name: &str, sql: &str, temporary: bool) -> String;
    fn create_function(&self, id: &str, body: &str) -> Result<String> {
        let _ = body;
        Err(TurtleError::unsupported(
            self.name(),
            "create_function",
            format!("user defined function {id}"),
        ))
    }
}

/// Double-quote an identifier, doubling embedded quotes. Already-quoted
/// input is returned unchanged.
pub fn quote_double(name: &str) -> String {
    if is_double_quoted(name) {
        return name.to_string();
    }
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// True when `name` is one well-formed double-quoted identifier.
pub fn is_double_quoted(name: &str) -> bool {
    if name.len() < 2 || !name.starts_with('"') || !name.ends_with('"') {
        return false;
    }
    let inner = &name[1..name.len() - 1];
    !inner.replace("\"\"", "").contains('"')
}

pub(crate) fn render_sort_terms(terms: &[SortTerm]) -> String {
    terms
        .iter()
        .map(|t| {
            let dir = match t.direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("{} {dir} NULLS LAST", t.expr)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Sampling request after validation against a dialect's capabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SampleRequest {
    None,
    Rows(u64),
    Percent(f64),
}

pub(crate) fn check_sampling(dialect: &dyn Dialect, sampling: &Sampling) -> Result<SampleRequest> {
    let caps = dialect.capabilities();
    let reject = |reason: String| TurtleError::SamplingUnsupported {
        dialect: dialect.name().to_string(),
        sampling: sampling.to_string(),
        reason,
    };
    match *sampling {
        Sampling::Disabled => Ok(SampleRequest::None),
        Sampling::Enabled => Ok(SampleRequest::Rows(caps.default_sample_rows)),
        Sampling::Rows { rows } => {
            if rows == 0 {
                return Err(reject("row count must be positive".to_string()));
            }
            match caps.max_sample_rows {
                Some(max) if rows > max => {
                    Err(reject(format!("row count exceeds the maximum of {max}")))
                }
                _ => Ok(SampleRequest::Rows(rows)),
            }
        }
        Sampling::Percent { percent } => {
            if !caps.supports_percent_sampling {
                return Err(reject("percent sampling is not available".to_string()));
            }
            if !(percent > 0.0 && percent <= 100.0) {
                return Err(reject("percent must be in (0, 100]".to_string()));
            }
            Ok(SampleRequest::Percent(percent))
        }
    }
}

/// Monday-start week truncation on an engine whose weeks start on Sunday:
/// shift back one day, truncate, shift forward one day.
pub(crate) fn monday_week_from_sunday(
    expr: &str,
    shift_days: impl Fn(&str, i32) -> String,
    truncate_week: impl Fn(&str) -> String,
) -> String {
    shift_days(&truncate_week(&shift_days(expr, -1)), 1)
}

pub(crate) fn extract_unit_name(unit: ExtractUnit) -> &'static str {
    match unit {
        ExtractUnit::Second => "second",
        ExtractUnit::Minute => "minute",
        ExtractUnit::Hour => "hour",
        ExtractUnit::Day => "day",
        ExtractUnit::DayOfWeek => "dayofweek",
        ExtractUnit::DayOfYear => "dayofyear",
        ExtractUnit::Week => "week",
        ExtractUnit::Month => "month",
        ExtractUnit::Quarter => "quarter",
        ExtractUnit::Year => "year",
    }
}

/// Engines with a bundled dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    Snowflake,
    DuckDb,
}

impl DialectKind {
    pub fn dialect(&self) -> Box<dyn Dialect> {
        match self {
            DialectKind::Snowflake => Box::new(SnowflakeDialect::default()),
            DialectKind::DuckDb => Box::new(DuckDbDialect::default()),
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialectKind::Snowflake => f.write_str("snowflake"),
            DialectKind::DuckDb => f.write_str("duckdb"),
        }
    }
}

impl FromStr for DialectKind {
    type Err = TurtleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "snowflake" => Ok(DialectKind::Snowflake),
            "duckdb" => Ok(DialectKind::DuckDb),
            other => Err(TurtleError::Config(format!("unknown dialect {other}"))),
        }
    }
}

pub mod duckdb;
pub use duckdb::DuckDbDialect;

pub mod snowflake;
pub use snowflake::SnowflakeDialect;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_double_is_idempotent() {
        let once = quote_double("Order \"Total\"");
        assert_eq!(once, "\"Order \"\"Total\"\"\"");
        assert_eq!(quote_double(&once), once);
        assert!(!is_double_quoted("\"a\"b\""));
        assert!(!is_double_quoted("\""));
    }

    #[test]
    fn sort_terms_put_nulls_last() {
        let terms = vec![
            SortTerm {
                expr: "\"a\"".to_string(),
                direction: SortDirection::Desc,
            },
            SortTerm {
                expr: "\"b\"".to_string(),
                direction: SortDirection::Asc,
            },
        ];
        assert_eq!(
            render_sort_terms(&terms),
            "\"a\" DESC NULLS LAST, \"b\" ASC NULLS LAST"
        );
    }

    #[test]
    fn dialect_kind_parses_case_insensitively() {
        assert_eq!("Snowflake".parse::<DialectKind>().unwrap(), DialectKind::Snowflake);
        assert!("oracle".parse::<DialectKind>().is_err());
    }
}
