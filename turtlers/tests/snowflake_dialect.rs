use turtle::dialect::{quote_double, PathStep, QuoteMode, WeekStart};
use turtle::model::{AtomicType, Sampling, TimeFieldType, TimeValue, TimestampUnit, TypecastFragment};
use turtle::{Dialect, SnowflakeDialect, TurtleError};

#[test]
fn when_needed_quoting_is_idempotent() {
    let dialect = SnowflakeDialect::new().with_quote_mode(QuoteMode::WhenNeeded);
    for name in ["ORDER_ID", "order_id", "Mixed Case", "GROUP", "with\"quote"] {
        let once = dialect.quote_identifier(name);
        assert_eq!(dialect.quote_identifier(&once), once, "{name}");
    }
    assert_eq!(dialect.quote_identifier("group"), "\"group\"");
    assert_eq!(dialect.quote_identifier("GROUP"), "\"GROUP\"");
    assert_eq!(quote_double("\"already\""), "\"already\"");
}

#[test]
fn record_paths_chain_after_the_first_step() {
    let dialect = SnowflakeDialect::new();
    let column = dialect.field_reference("t", "a", PathStep::Column);
    assert_eq!(column, "t.\"a\"");
    let step = PathStep::Column.next();
    let first = dialect.field_reference(&column, "b", step);
    assert_eq!(first, "t.\"a\":\"b\"");
    assert_eq!(
        dialect.field_reference(&first, "c", step.next()),
        "t.\"a\":\"b\".\"c\""
    );
    assert_eq!(dialect.field_reference("f", "x", PathStep::ElementKey), "f.VALUE:\"x\"");
    assert_eq!(dialect.field_reference("f", "x", PathStep::Element), "f.VALUE");
    assert_eq!(
        dialect.field_reference("f.VALUE:\"x\"", "y", PathStep::ElementKey.next()),
        "f.VALUE:\"x\".\"y\""
    );
}

#[test]
fn colons_inside_quoted_aliases_do_not_change_the_path() {
    let dialect = SnowflakeDialect::new();
    let column = dialect.field_reference("\"a:b\"", "rec", PathStep::Column);
    assert_eq!(
        dialect.field_reference(&column, "k", PathStep::Column.next()),
        "\"a:b\".\"rec\":\"k\""
    );
}

#[test]
fn group_set_table_needs_a_nested_level() {
    let dialect = SnowflakeDialect::new();
    assert!(matches!(
        dialect.group_set_table(0),
        Err(TurtleError::UnsupportedDialectFeature { .. })
    ));
    assert!(dialect.group_set_table(3).unwrap().contains("ROWCOUNT => 4"));
}

#[test]
fn sampling_bounds_are_enforced() {
    let dialect = SnowflakeDialect::new();
    let reject = |sampling: Sampling| {
        matches!(
            dialect.sample_table("t", &sampling),
            Err(TurtleError::SamplingUnsupported { .. })
        )
    };
    assert!(reject(Sampling::Rows { rows: 0 }));
    assert!(reject(Sampling::Rows { rows: 1_000_001 }));
    assert!(reject(Sampling::Percent { percent: 0.0 }));
    assert!(reject(Sampling::Percent { percent: 150.0 }));

    assert_eq!(
        dialect.sample_table("t", &Sampling::Rows { rows: 1_000_000 }).unwrap(),
        "(SELECT * FROM t SAMPLE (1000000 ROWS))"
    );
    assert_eq!(
        dialect.sample_table("t", &Sampling::Percent { percent: 12.5 }).unwrap(),
        "(SELECT * FROM t SAMPLE (12.5))"
    );
    assert_eq!(dialect.sample_table("t", &Sampling::Disabled).unwrap(), "t");
    let small = SnowflakeDialect::new().with_default_sample_rows(10);
    assert_eq!(
        small.sample_table("t", &Sampling::Enabled).unwrap(),
        "(SELECT * FROM t SAMPLE (10 ROWS))"
    );
}

#[test]
fn sunday_sessions_still_truncate_to_monday() {
    let dialect = SnowflakeDialect::new().with_week_start(WeekStart::Sunday);
    let value = TimeValue::new("\"o\".\"created_at\"", TimeFieldType::Timestamp);
    let sql = dialect.truncate_time(&value, TimestampUnit::Week);
    assert!(sql.starts_with("DATEADD(day, 1, DATE_TRUNC('week', DATEADD(day, -1, "));
    assert_eq!(
        dialect.truncate_time(&value, TimestampUnit::Month),
        "DATE_TRUNC('month', \"o\".\"created_at\")"
    );
}

#[test]
fn safe_casts_go_through_varchar() {
    let dialect = SnowflakeDialect::new();
    let cast = TypecastFragment::new("x", Some(AtomicType::Number), AtomicType::Date).safe();
    assert_eq!(dialect.cast(&cast), "TRY_CAST((x)::VARCHAR AS DATE)");
    let cast = TypecastFragment::new("x", Some(AtomicType::String), AtomicType::Number).safe();
    assert_eq!(dialect.cast(&cast), "TRY_CAST(x AS FLOAT)");
    let same = TypecastFragment::new("x", Some(AtomicType::Number), AtomicType::Number);
    assert_eq!(dialect.cast(&same), "x");
}

#[test]
fn unnest_uses_outer_flatten() {
    let dialect = SnowflakeDialect::new();
    assert_eq!(
        dialect.unnest_alias("\"u\".\"tags\"", "\"tag\"", true),
        ", LATERAL FLATTEN(INPUT => \"u\".\"tags\", OUTER => TRUE) AS \"tag\""
    );
    assert_eq!(dialect.unnest_row_id("\"tag\""), "\"tag\".INDEX");
}

#[test]
fn materialized_tables_are_transient_unless_temporary() {
    let dialect = SnowflakeDialect::new();
    assert_eq!(
        dialect.create_table_as_select("T1", "SELECT 1", false),
        "CREATE OR REPLACE TRANSIENT TABLE T1 AS SELECT 1"
    );
    assert_eq!(
        dialect.create_table_as_select("T1", "SELECT 1", true),
        "CREATE OR REPLACE TEMPORARY TABLE T1 AS SELECT 1"
    );
    assert!(dialect.create_function("f", "SELECT 1").is_err());
}
