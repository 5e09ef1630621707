//! Snowflake dialect implementation.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::error::{Result, TurtleError};
use crate::fragment::SqlFragment;
use crate::model::{
    AlterOp, AtomicType, DialectField, ExtractUnit, GroupSet, Sampling, SortTerm, TimeFieldType,
    TimeValue, TimestampUnit, TypecastFragment,
};
use crate::symmetric::precision_scale;

use super::{
    check_sampling, extract_unit_name, monday_week_from_sunday, quote_double, render_sort_terms,
    Dialect, DialectCapabilities, PathStep, QuoteMode, SampleRequest, WeekStart,
};

/// Largest row count accepted by `SAMPLE (n ROWS)`.
pub const MAX_SAMPLE_ROWS: u64 = 1_000_000;
pub const DEFAULT_SAMPLE_ROWS: u64 = 50_000;

static RESERVED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "ACCOUNT", "ALL", "ALTER", "AND", "ANY", "AS", "BETWEEN", "BY", "CASE", "CAST",
        "CHECK", "COLUMN", "CONNECT", "CONNECTION", "CONSTRAINT", "CREATE", "CROSS",
        "CURRENT", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "CURRENT_USER",
        "DATABASE", "DELETE", "DISTINCT", "DROP", "ELSE", "EXISTS", "FALSE", "FOLLOWING",
        "FOR", "FROM", "FULL", "GRANT", "GROUP", "GSCLUSTER", "HAVING", "ILIKE", "IN",
        "INCREMENT", "INNER", "INSERT", "INTERSECT", "INTO", "IS", "ISSUE", "JOIN",
        "LATERAL", "LEFT", "LIKE", "LOCALTIME", "LOCALTIMESTAMP", "MINUS", "NATURAL", "NOT",
        "NULL", "OF", "ON", "OR", "ORDER", "ORGANIZATION", "QUALIFY", "REGEXP", "REVOKE",
        "RIGHT", "RLIKE", "ROW", "ROWS", "SAMPLE", "SCHEMA", "SELECT", "SET", "SOME",
        "START", "TABLE", "TABLESAMPLE", "THEN", "TO", "TRIGGER", "TRUE", "TRY_CAST",
        "UNION", "UNIQUE", "UPDATE", "USING", "VALUES", "VIEW", "WHEN", "WHENEVER", "WHERE",
        "WITH",
    ]
    .into_iter()
    .collect()
});

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(name.to_ascii_uppercase().as_str())
}

/// Snowflake folds unquoted identifiers to upper case; only names already in
/// that form survive without quotes.
fn is_canonical_unquoted(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '$')
        && !is_reserved(name)
}

#[derive(Debug, Clone, Copy)]
pub struct SnowflakeDialect {
    pub quote_mode: QuoteMode,
    /// Mirrors the session's `WEEK_START` parameter.
    pub week_start: WeekStart,
    pub default_sample_rows: u64,
}

impl Default for SnowflakeDialect {
    fn default() -> Self {
        Self {
            quote_mode: QuoteMode::Always,
            week_start: WeekStart::Monday,
            default_sample_rows: DEFAULT_SAMPLE_ROWS,
        }
    }
}

impl SnowflakeDialect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quote_mode(mut self, mode: QuoteMode) -> Self {
        self.quote_mode = mode;
        self
    }

    pub fn with_week_start(mut self, week_start: WeekStart) -> Self {
        self.week_start = week_start;
        self
    }

    pub fn with_default_sample_rows(mut self, rows: u64) -> Self {
        self.default_sample_rows = rows;
        self
    }

    fn object_pairs(&self, fields: &[DialectField], values: bool) -> String {
        fields
            .iter()
            .map(|f| {
                let value = if values { f.sql_expression.as_str() } else { "NULL" };
                format!("{}, {value}", self.quote_string(&f.name))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn shift_days(expr: &str, days: i32) -> String {
        format!("DATEADD(day, {days}, {expr})")
    }
}

impl Dialect for SnowflakeDialect {
    fn name(&self) -> &'static str {
        "snowflake"
    }

    fn capabilities(&self) -> DialectCapabilities {
        DialectCapabilities {
            supports_sum_distinct_function: true,
            supports_unnest: true,
            supports_percent_sampling: true,
            max_sample_rows: Some(MAX_SAMPLE_ROWS),
            default_sample_rows: self.default_sample_rows,
            native_week_start: self.week_start,
        }
    }

    fn quote_identifier(&self, name: &str) -> String {
        match self.quote_mode {
            QuoteMode::WhenNeeded if is_canonical_unquoted(name) => name.to_string(),
            _ => quote_double(name),
        }
    }

    fn quote_string(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn field_reference(&self, alias: &str, field: &str, step: PathStep) -> String {
        // Keys inside semi-structured values are case sensitive, so they are
        // always quoted regardless of the quoting mode.
        match step {
            PathStep::Column => format!("{alias}.{}", self.quote_identifier(field)),
            // Only the first step of a semi-structured path uses ':'.
            PathStep::Key { depth: 0 } => format!("{alias}:{}", quote_double(field)),
            PathStep::Key { .. } => format!("{alias}.{}", quote_double(field)),
            PathStep::Element => format!("{alias}.VALUE"),
            PathStep::ElementKey => format!("{alias}.VALUE:{}", quote_double(field)),
        }
    }

    fn group_set_table(&self, levels: u32) -> Result<String> {
        if levels == 0 {
            return Err(TurtleError::unsupported(
                self.name(),
                "group_set_table",
                "at least one nested level is required",
            ));
        }
        Ok(format!(
            "CROSS JOIN (SELECT ROW_NUMBER() OVER (ORDER BY SEQ4()) - 1 AS group_set FROM TABLE(GENERATOR(ROWCOUNT => {}))) AS group_set_rows",
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
        let object = format!("OBJECT_CONSTRUCT_KEEP_NULL({})", self.object_pairs(fields, true));
        let mut agg = format!("ARRAY_AGG(CASE WHEN group_set = {level} THEN {object} END)");
        if !order_by.is_empty() {
            agg.push_str(&format!(" WITHIN GROUP (ORDER BY {})", render_sort_terms(order_by)));
        }
        if let Some(limit) = limit {
            // ARRAY_SLICE's upper bound is exclusive.
            agg = format!("ARRAY_SLICE({agg}, 0, {limit})");
        }
        format!("COALESCE({agg}, [])")
    }

    fn coalesce_measures_inline(&self, level: GroupSet, fields: &[DialectField]) -> String {
        let present = self.object_pairs(fields, true);
        let absent = self.object_pairs(fields, false);
        format!(
            "COALESCE(GET(ARRAY_AGG(CASE WHEN group_set = {level} THEN OBJECT_CONSTRUCT_KEEP_NULL({present}) END), 0), OBJECT_CONSTRUCT_KEEP_NULL({absent}))"
        )
    }

    fn unnest_alias(&self, source: &str, alias: &str, _needs_distinct_key: bool) -> String {
        // FLATTEN always exposes INDEX, so the row id needs no extra column.
        format!(", LATERAL FLATTEN(INPUT => {source}, OUTER => TRUE) AS {alias}")
    }

    fn unnest_row_id(&self, alias: &str) -> String {
        format!("{alias}.INDEX")
    }

    fn sum_distinct(&self, key: &str, value: &str, precision: f64) -> Result<String> {
        let scale = precision_scale(precision)?;
        let hashed = self.sum_distinct_hashed_key(key);
        Ok(format!(
            "((SUM(DISTINCT {hashed} + CAST(FLOOR(IFNULL({value}, 0) * {scale}) AS NUMBER(38,0))) - SUM(DISTINCT {hashed})) / {scale})"
        ))
    }

    fn sum_distinct_hashed_key(&self, key: &str) -> String {
        format!("MD5_NUMBER_LOWER64(({key})::VARCHAR)")
    }

    fn hashed_key_type(&self) -> &'static str {
        "NUMBER(38,0)"
    }

    fn sample_table(&self, table_sql: &str, sampling: &Sampling) -> Result<String> {
        match check_sampling(self, sampling)? {
            SampleRequest::None => Ok(table_sql.to_string()),
            SampleRequest::Rows(rows) => {
                Ok(format!("(SELECT * FROM {table_sql} SAMPLE ({rows} ROWS))"))
            }
            SampleRequest::Percent(percent) => {
                Ok(format!("(SELECT * FROM {table_sql} SAMPLE ({percent}))"))
            }
        }
    }

    fn pipeline_head(&self, is_singleton: bool, source_column: &str) -> SqlFragment {
        let column = self.quote_identifier(source_column);
        let mut fragment = SqlFragment::new();
        if is_singleton {
            fragment.push_str(format!("(SELECT s.{column} AS base FROM "));
            fragment.push_upstream();
            fragment.push_str(" AS s)");
        } else {
            fragment.push_str("(SELECT f.VALUE AS base FROM ");
            fragment.push_upstream();
            fragment.push_str(format!(" AS s, LATERAL FLATTEN(INPUT => s.{column}) AS f)"));
        }
        fragment
    }

    fn select_alias_as_struct(&self, alias: &str, physical_names: &[String]) -> String {
        let pairs: Vec<String> = physical_names
            .iter()
            .map(|name| {
                format!(
                    "{}, {}",
                    self.quote_string(name),
                    self.field_reference(alias, name, PathStep::Column)
                )
            })
            .collect();
        format!("OBJECT_CONSTRUCT_KEEP_NULL({})", pairs.join(", "))
    }

    fn native_type(&self, atomic: AtomicType) -> &'static str {
        match atomic {
            AtomicType::String => "VARCHAR",
            AtomicType::Number => "FLOAT",
            AtomicType::Boolean => "BOOLEAN",
            AtomicType::Date => "DATE",
            AtomicType::Timestamp => "TIMESTAMP",
            AtomicType::Json => "VARIANT",
        }
    }

    fn cast(&self, cast: &TypecastFragment) -> String {
        if cast.src == Some(cast.dst) {
            return cast.expr.clone();
        }
        let target = self.native_type(cast.dst);
        if cast.safe {
            // TRY_CAST only accepts string input.
            let input = match cast.src {
                Some(AtomicType::String) => cast.expr.clone(),
                _ => format!("({})::VARCHAR", cast.expr),
            };
            format!("TRY_CAST({input} AS {target})")
        } else {
            format!("CAST({} AS {target})", cast.expr)
        }
    }

    fn literal_time(
        &self,
        value: &str,
        time_type: TimeFieldType,
        timezone: Option<&str>,
    ) -> Result<String> {
        let literal = self.quote_string(value);
        Ok(match (time_type, timezone) {
            (TimeFieldType::Date, _) => format!("DATE({literal})"),
            (TimeFieldType::Timestamp, None) => format!("TIMESTAMP {literal}"),
            (TimeFieldType::Timestamp, Some(tz)) => format!(
                "CONVERT_TIMEZONE({}, 'UTC', {literal}::TIMESTAMP_NTZ)",
                self.quote_string(tz)
            ),
        })
    }

    fn truncate_time(&self, value: &TimeValue, unit: TimestampUnit) -> String {
        match (unit, self.week_start) {
            (TimestampUnit::Week, WeekStart::Sunday) => {
                monday_week_from_sunday(&value.expr, Self::shift_days, |e| {
                    format!("DATE_TRUNC('week', {e})")
                })
            }
            _ => format!("DATE_TRUNC('{}', {})", unit.as_str(), value.expr),
        }
    }

    fn extract_time_part(&self, value: &TimeValue, unit: ExtractUnit) -> String {
        match unit {
            // DAYOFWEEKISO ignores WEEK_START; 1 = Sunday after the shift.
            ExtractUnit::DayOfWeek => {
                format!("MOD(EXTRACT(dayofweekiso FROM {}), 7) + 1", value.expr)
            }
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
        let amount = match op {
            AlterOp::Add => amount.to_string(),
            AlterOp::Subtract => format!("-({amount})"),
        };
        format!("DATEADD({}, {amount}, {})", unit.as_str(), value.expr)
    }

    fn measure_time(&self, from: &TimeValue, to: &TimeValue, unit: TimestampUnit) -> String {
        if let Some(seconds) = unit.seconds() {
            return format!(
                "FLOOR(TIMESTAMPDIFF(second, {}, {}) / {seconds})",
                from.expr, to.expr
            );
        }
        let from_date = format!("DATE({})", from.expr);
        let to_date = format!("DATE({})", to.expr);
        match (unit, self.week_start) {
            (TimestampUnit::Week, WeekStart::Sunday) => format!(
                "DATEDIFF(week, {}, {})",
                Self::shift_days(&from_date, -1),
                Self::shift_days(&to_date, -1)
            ),
            _ => format!("DATEDIFF({}, {from_date}, {to_date})", unit.as_str()),
        }
    }

    fn regexp_match(&self, expr: &str, pattern: &str) -> String {
        format!(
            "IFF(REGEXP_INSTR({expr}, {}) > 0, TRUE, FALSE)",
            self.quote_string(pattern)
        )
    }

    fn generate_uuid(&self) -> String {
        "UUID_STRING()".to_string()
    }

    fn now_expression(&self) -> String {
        "CURRENT_TIMESTAMP()".to_string()
    }

    fn date_to_string(&self, expr: &str) -> String {
        format!("({expr})::date::varchar")
    }

    fn create_table_as_select(&self, name: &str, sql: &str, temporary: bool) -> String {
        let kind = if temporary { "TEMPORARY" } else { "TRANSIENT" };
        format!("CREATE OR REPLACE {kind} TABLE {name} AS {sql}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, expr: &str) -> DialectField {
        DialectField {
            name: name.to_string(),
            sql_expression: expr.to_string(),
            sql_output_name: quote_double(name),
            field_type: crate::model::FieldType::Atomic(AtomicType::Number),
        }
    }

    #[test]
    fn when_needed_mode_leaves_canonical_names_bare() {
        let dialect = SnowflakeDialect::new().with_quote_mode(QuoteMode::WhenNeeded);
        assert_eq!(dialect.quote_identifier("ORDER_ID"), "ORDER_ID");
        assert_eq!(dialect.quote_identifier("order_id"), "\"order_id\"");
        assert_eq!(dialect.quote_identifier("SELECT"), "\"SELECT\"");
        assert_eq!(dialect.quote_identifier("9LIVES"), "\"9LIVES\"");
    }

    #[test]
    fn strings_escape_backslashes() {
        let dialect = SnowflakeDialect::new();
        assert_eq!(dialect.quote_string("it's a\\b"), "'it''s a\\\\b'");
    }

    #[test]
    fn coalesce_inline_null_record_has_same_keys() {
        let dialect = SnowflakeDialect::new();
        let sql = dialect.coalesce_measures_inline(
            GroupSet(2),
            &[field("total", "\"total__2\""), field("n", "\"n__2\"")],
        );
        assert!(sql.contains("CASE WHEN group_set = 2 THEN OBJECT_CONSTRUCT_KEEP_NULL('total', \"total__2\", 'n', \"n__2\")"));
        assert!(sql.ends_with("OBJECT_CONSTRUCT_KEEP_NULL('total', NULL, 'n', NULL))"));
    }

    #[test]
    fn sunday_weeks_shift_around_truncation() {
        let dialect = SnowflakeDialect::new().with_week_start(WeekStart::Sunday);
        let value = TimeValue::new("d", TimeFieldType::Date);
        assert_eq!(
            dialect.truncate_time(&value, TimestampUnit::Week),
            "DATEADD(day, 1, DATE_TRUNC('week', DATEADD(day, -1, d)))"
        );
        let monday = SnowflakeDialect::new();
        assert_eq!(
            monday.truncate_time(&value, TimestampUnit::Week),
            "DATE_TRUNC('week', d)"
        );
    }

    #[test]
    fn alias_records_are_objects() {
        let dialect = SnowflakeDialect::new();
        let names = vec!["id".to_string(), "state".to_string()];
        assert_eq!(
            dialect.select_alias_as_struct("t", &names),
            "OBJECT_CONSTRUCT_KEEP_NULL('id', t.\"id\", 'state', t.\"state\")"
        );
    }
}
