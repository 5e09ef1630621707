//! DuckDB dialect implementation.

use crate::error::Result;
use crate::fragment::SqlFragment;
use crate::model::{
    AlterOp, AtomicType, DialectField, ExtractUnit, GroupSet, Sampling, SortTerm, TimeFieldType,
    TimeValue, TimestampUnit, TypecastFragment,
};

use super::{
    check_sampling, extract_unit_name, quote_double, render_sort_terms, Dialect,
    DialectCapabilities, PathStep, SampleRequest, WeekStart,
};

pub const DEFAULT_SAMPLE_ROWS: u64 = 50_000;

#[derive(Debug, Clone, Copy)]
pub struct DuckDbDialect {
    pub default_sample_rows: u64,
}

impl Default for DuckDbDialect {
    fn default() -> Self {
        Self {
            default_sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }
}

impl DuckDbDialect {
    pub fn with_default_sample_rows(mut self, rows: u64) -> Self {
        self.default_sample_rows = rows;
        self
    }

    fn struct_literal(&self, fields: &[DialectField], values: bool) -> String {
        let entries: Vec<String> = fields
            .iter()
            .map(|f| {
                let value = if values { f.sql_expression.as_str() } else { "NULL" };
                format!("{}: {value}", self.quote_string(&f.name))
            })
            .collect();
        format!("{{{}}}", entries.join(", "))
    }

    fn keep_date(value: &TimeValue, unit: TimestampUnit, sql: String) -> String {
        match (value.time_type, unit.seconds()) {
            (TimeFieldType::Date, None) => format!("CAST({sql} AS DATE)"),
            _ => sql,
        }
    }
}

impl Dialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities {
            supports_sum_distinct_function: false,
            supports_unnest: true,
            supports_percent_sampling: true,
            max_sample_rows: None,
            default_sample_rows: self.default_sample_rows,
            native_week_start: WeekStart::Monday,
        }
    }

    fn quote_identifier(&self, name: &str) -> String {
        quote_double(name)
    }

    fn field_reference(&self, alias: &str, field: &str, step: PathStep) -> String {
        match step {
            PathStep::Column => format!("{alias}.{}", quote_double(field)),
            PathStep::Key { .. } => format!("{alias}[{}]", self.quote_string(field)),
            PathStep::Element => format!("{alias}.\"value\""),
            PathStep::ElementKey => format!("{alias}.\"value\"[{}]", self.quote_string(field)),
        }
    }

    fn group_set_table(&self, levels: u32) -> Result<String> {
        if levels == 0 {
            return Err(crate::error::TurtleError::unsupported(
                self.name(),
                "group_set_table",
                "at least one nested level is required",
            ));
        }
        Ok(format!(
            "CROSS JOIN (SELECT range AS group_set FROM range(0, {})) AS group_set_rows",
            levels + 1
        ))
    }

    fn aggregate_turtle(
        &self,
        level: GroupSet,
        fields: &[DialectField],
        order_by: &[SortTerm],
        limit: Option<u64>,
    ) -> String {
        let mut list = format!("LIST({}", self.struct_literal(fields, true));
        if !order_by.is_empty() {
            list.push_str(&format!(" ORDER BY {}", render_sort_terms(order_by)));
        }
        list.push(')');
        let array = format!("COALESCE({list} FILTER (WHERE group_set = {level}), [])");
        match limit {
            Some(limit) => format!("list_slice({array}, 1, {limit})"),
            None => array,
        }
    }

    fn coalesce_measures_inline(&self, level: GroupSet, fields: &[DialectField]) -> String {
        format!(
            "COALESCE(FIRST({}) FILTER (WHERE group_set = {level}), {})",
            self.struct_literal(fields, true),
            self.struct_literal(fields, false)
        )
    }

    fn unnest_alias(&self, source: &str, alias: &str, needs_distinct_key: bool) -> String {
        if needs_distinct_key {
            format!(
                "LEFT JOIN LATERAL (SELECT UNNEST(GENERATE_SERIES(1, LEN({source}), 1)) AS \"__row_id\", UNNEST({source}) AS \"value\") AS {alias} ON TRUE"
            )
        } else {
            format!("LEFT JOIN LATERAL (SELECT UNNEST({source}) AS \"value\") AS {alias} ON TRUE")
        }
    }

    fn unnest_row_id(&self, alias: &str) -> String {
        format!("{alias}.\"__row_id\"")
    }

    fn sum_distinct_hashed_key(&self, key: &str) -> String {
        // HASH(NULL) is not NULL; keep gated-out rows out of the distinct sums.
        format!("CASE WHEN ({key}) IS NULL THEN NULL ELSE CAST(HASH({key}) AS HUGEINT) END")
    }

    fn hashed_key_type(&self) -> &'static str {
        "HUGEINT"
    }

    fn sample_table(&self, table_sql: &str, sampling: &Sampling) -> Result<String> {
        match check_sampling(self, sampling)? {
            SampleRequest::None => Ok(table_sql.to_string()),
            SampleRequest::Rows(rows) => {
                Ok(format!("(SELECT * FROM {table_sql} USING SAMPLE {rows} ROWS)"))
            }
            SampleRequest::Percent(percent) => Ok(format!(
                "(SELECT * FROM {table_sql} USING SAMPLE {percent} PERCENT (bernoulli))"
            )),
        }
    }

    fn pipeline_head(&self, is_singleton: bool, source_column: &str) -> SqlFragment {
        let column = quote_double(source_column);
        let projection = if is_singleton {
            format!("s.{column}")
        } else {
            format!("UNNEST(s.{column})")
        };
        let mut fragment = SqlFragment::text(format!("(SELECT {projection} AS base FROM "));
        fragment.push_upstream();
        fragment.push_str(" AS s)");
        fragment
    }

    fn select_alias_as_struct(&self, alias: &str, physical_names: &[String]) -> String {
        let entries: Vec<String> = physical_names
            .iter()
            .map(|name| {
                format!(
                    "{}: {}",
                    self.quote_string(name),
                    self.field_reference(alias, name, PathStep::Column)
                )
            })
            .collect();
        format!("{{{}}}", entries.join(", "))
    }

    fn native_type(&self, atomic: AtomicType) -> &'static str {
        match atomic {
            AtomicType::String => "VARCHAR",
            AtomicType::Number => "DOUBLE",
            AtomicType::Boolean => "BOOLEAN",
            AtomicType::Date => "DATE",
            AtomicType::Timestamp => "TIMESTAMP",
            AtomicType::Json => "JSON",
        }
    }

    fn cast(&self, cast: &TypecastFragment) -> String {
        if cast.src == Some(cast.dst) {
            return cast.expr.clone();
        }
        let func = if cast.safe { "TRY_CAST" } else { "CAST" };
        format!("{func}({} AS {})", cast.expr, self.native_type(cast.dst))
    }

    fn literal_time(
        &self,
        value: &str,
        time_type: TimeFieldType,
        timezone: Option<&str>,
    ) -> Result<String> {
        Ok(match (time_type, timezone) {
            (TimeFieldType::Date, _) => format!("DATE {}", self.quote_string(value)),
            (TimeFieldType::Timestamp, None) => format!("TIMESTAMP {}", self.quote_string(value)),
            (TimeFieldType::Timestamp, Some(tz)) => format!(
                "CAST(TIMESTAMPTZ {} AS TIMESTAMP)",
                self.quote_string(&format!("{value} {tz}"))
            ),
        })
    }

    fn truncate_time(&self, value: &TimeValue, unit: TimestampUnit) -> String {
        // DuckDB weeks already start on Monday.
        let sql = format!("DATE_TRUNC('{}', {})", unit.as_str(), value.expr);
        Self::keep_date(value, unit, sql)
    }

    fn extract_time_part(&self, value: &TimeValue, unit: ExtractUnit) -> String {
        match unit {
            ExtractUnit::DayOfWeek => format!("(EXTRACT(dow FROM {}) + 1)", value.expr),
            ExtractUnit::DayOfYear => format!("EXTRACT(doy FROM {})", value.expr),
            other => format!("EXTRACT({} FROM {})", extract_unit_name(other), value.expr),
        }
    }

    fn alter_time(
        &self,
        op: AlterOp,
        value: &TimeValue,
        amount: &str,
        unit: TimestampUnit,
    ) -> String {
        let sign = match op {
            AlterOp::Add => "+",
            AlterOp::Subtract => "-",
        };
        let interval = match unit {
            TimestampUnit::Quarter => format!("INTERVAL (({amount}) * 3) MONTH"),
            other => format!("INTERVAL ({amount}) {}", other.as_str().to_uppercase()),
        };
        Self::keep_date(value, unit, format!("({} {sign} {interval})", value.expr))
    }

    fn measure_time(&self, from: &TimeValue, to: &TimeValue, unit: TimestampUnit) -> String {
        match unit.seconds() {
            Some(seconds) => format!(
                "FLOOR(DATE_DIFF('second', {}, {}) / {seconds})",
                from.expr, to.expr
            ),
            None => format!(
                "DATE_DIFF('{}', CAST({} AS DATE), CAST({} AS DATE))",
                unit.as_str(),
                from.expr,
                to.expr
            ),
        }
    }

    fn regexp_match(&self, expr: &str, pattern: &str) -> String {
        format!("REGEXP_MATCHES({expr}, {})", self.quote_string(pattern))
    }

    fn generate_uuid(&self) -> String {
        "CAST(GEN_RANDOM_UUID() AS VARCHAR)".to_string()
    }

    fn now_expression(&self) -> String {
        "CURRENT_TIMESTAMP".to_string()
    }

    fn date_to_string(&self, expr: &str) -> String {
        format!("STRFTIME(CAST({expr} AS DATE), '%Y-%m-%d')")
    }

    fn create_table_as_select(&self, name: &str, sql: &str, temporary: bool) -> String {
        let kind = if temporary { "TEMPORARY " } else { "" };
        format!("CREATE OR REPLACE {kind}TABLE {name} AS {sql}")
    }
}
