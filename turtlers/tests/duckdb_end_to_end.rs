//! Compiled SQL executed against a DuckDB file.
#![cfg(feature = "duckdb")]

mod common;

use std::path::Path;
use std::sync::Arc;

use common::*;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tempfile::TempDir;
use turtle::backends::DuckDbConnection;
use turtle::model::{AtomicType, StructDef};
use turtle::runtime::{run_plan, stream_plan};
use turtle::{BackendConnection, ConnectionManager, QueryPlan, SqlCompiler, TurtleError};

fn bootstrap(path: &Path) -> anyhow::Result<()> {
    let conn = duckdb::Connection::open(path)?;
    conn.execute_batch(
        r#"
        CREATE TABLE users (id INTEGER, name VARCHAR, state VARCHAR, budget DOUBLE);
        INSERT INTO users VALUES
            (1, 'a', 'CA', 10.5),
            (2, 'b', 'CA', 20.25),
            (3, 'c', 'NY', 7.0);
        CREATE TABLE orders (id INTEGER, user_id INTEGER, amount DOUBLE, status VARCHAR);
        INSERT INTO orders VALUES
            (1, 1, 5.0, 'shipped'),
            (2, 1, 6.0, 'shipped'),
            (3, 1, 7.0, 'cancelled'),
            (4, 2, 8.0, 'shipped');
        CREATE TABLE facts AS SELECT i AS id, i % 51 AS key_id FROM range(0, 300) t(i);
        CREATE TABLE keys AS SELECT i AS id, 'k' || i AS label FROM range(0, 51) t(i);
        CREATE TABLE posts (id INTEGER, tags VARCHAR[]);
        INSERT INTO posts VALUES (1, ['x', 'y', 'z']), (2, []), (3, ['x']);
        "#,
    )?;
    for fan in [1, 2, 10] {
        conn.execute_batch(&format!(
            "CREATE TABLE big_users_{fan} AS
                SELECT i AS id, CAST((i % 97) * 0.37 + 0.01 AS DOUBLE) AS budget FROM range(0, 1000) t(i);
             CREATE TABLE big_orders_{fan} AS
                SELECT i AS id, i % 1000 AS user_id FROM range(0, {}) t(i);",
            1000 * fan
        ))?;
    }
    Ok(())
}

fn open() -> (TempDir, DuckDbConnection) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("turtle.duckdb");
    bootstrap(&path).unwrap();
    let conn = DuckDbConnection::open("duck", path.to_string_lossy()).unwrap();
    (dir, conn)
}

async fn query_rows(conn: &DuckDbConnection, plan: &QueryPlan) -> Vec<Map<String, Value>> {
    let compiled = SqlCompiler::new(conn.dialect()).compile(plan).unwrap();
    conn.execute_sql(&compiled.sql).await.unwrap().rows
}

fn number(row: &Map<String, Value>, name: &str) -> f64 {
    row[name].as_f64().unwrap_or_else(|| panic!("{name} is not a number: {}", row[name]))
}

fn row_where<'a>(rows: &'a [Map<String, Value>], column: &str, value: &str) -> &'a Map<String, Value> {
    rows.iter()
        .find(|r| r[column] == value)
        .unwrap_or_else(|| panic!("no row with {column} = {value}"))
}

#[tokio::test]
async fn every_group_gets_exactly_its_nested_rows() {
    let (_dir, conn) = open();
    let plan = plan(json!({
        "source": { "alias": "f", "struct": table("facts", "duck", Some("id"), &[("id", "number"), ("key_id", "number")]) },
        "joins": [{
            "alias": "k",
            "struct": table("keys", "duck", Some("id"), &[("id", "number"), ("label", "string")]),
            "relationship": "many_to_one",
            "on": eq(field("f", "key_id"), field("k", "id")),
        }],
        "segment": {
            "fields": [
                dim("label", field("k", "label")),
                count("row_count", "f"),
                nest("facts", json!({ "fields": [dim("id", field("f", "id")), count("n", "f")] })),
            ]
        },
    }));
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(rows.len(), 51);
    let mut total = 0;
    for row in &rows {
        let nested = row["facts"].as_array().unwrap();
        assert_eq!(nested.len() as u64, row["row_count"].as_u64().unwrap());
        assert!(nested.iter().all(|r| r["n"] == 1));
        total += nested.len();
    }
    assert_eq!(total, 300);
}

#[tokio::test]
async fn fanned_out_sums_count_each_user_once() {
    let (_dir, conn) = open();
    let plan = users_orders(
        "duck",
        json!({
            "fields": [
                agg("budget", "sum", field("u", "budget")),
                count("user_count", "u"),
                agg("avg_budget", "avg", field("u", "budget")),
                agg("revenue", "sum", field("o", "amount")),
                count("order_count", "o"),
            ]
        }),
    );
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert!((number(row, "budget") - 37.75).abs() < 1e-6);
    assert_eq!(row["user_count"], 3);
    assert!((number(row, "avg_budget") - 37.75 / 3.0).abs() < 1e-6);
    assert!((number(row, "revenue") - 26.0).abs() < 1e-9);
    assert_eq!(row["order_count"], 4);
}

#[tokio::test]
async fn symmetric_sums_hold_at_any_fan_out() {
    let (_dir, conn) = open();
    for fan in [1, 2, 10] {
        let users = format!("big_users_{fan}");
        let orders = format!("big_orders_{fan}");
        let plan = plan(json!({
            "source": { "alias": "u", "struct": table(&users, "duck", Some("id"), &[("id", "number"), ("budget", "number")]) },
            "joins": [{
                "alias": "o",
                "struct": table(&orders, "duck", Some("id"), &[("id", "number"), ("user_id", "number")]),
                "relationship": "one_to_many",
                "on": eq(field("u", "id"), field("o", "user_id")),
            }],
            "segment": { "fields": [agg("budget", "sum", field("u", "budget")), count("orders", "o")] },
        }));
        let expected = conn
            .execute_sql(&format!("SELECT SUM(budget) AS s FROM {users}"))
            .await
            .unwrap();
        let expected = number(&expected.rows[0], "s");

        let rows = query_rows(&conn, &plan).await;
        let got = number(&rows[0], "budget");
        assert!((got - expected).abs() < 2e-3, "fan-out {fan}: {got} vs {expected}");
        assert_eq!(rows[0]["orders"], 1000 * fan);
    }
}

#[tokio::test]
async fn week_truncation_starts_on_monday() {
    let (_dir, conn) = open();
    let trunc = |day: &str| {
        json!({
            "type": "trunc",
            "unit": "week",
            "expr": { "type": "time", "value": day, "time_type": "date" },
        })
    };
    let plan = plan(json!({
        "source": {
            "alias": "d",
            "struct": {
                "name": "one_row",
                "struct_source": { "type": "sql_subquery", "select": "SELECT 1 AS one" },
                "struct_relationship": { "type": "basetable", "connection_name": "duck" },
                "fields": [{ "name": "one", "type": "number" }],
            },
        },
        "segment": { "fields": [dim("sunday", trunc("2024-01-07")), dim("monday", trunc("2024-01-08"))] },
    }));
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(rows[0]["sunday"], "2024-01-01");
    assert_eq!(rows[0]["monday"], "2024-01-08");
}

#[tokio::test]
async fn nests_without_rows_are_empty_arrays() {
    let (_dir, conn) = open();
    let plan = users_orders(
        "duck",
        json!({
            "fields": [
                dim("state", field("u", "state")),
                nest("refunds", json!({
                    "fields": [dim("id", field("o", "id"))],
                    "filters": [eq(field("o", "status"), json!({ "type": "literal", "value": "refunded" }))],
                })),
            ]
        }),
    );
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row["refunds"], json!([]));
    }
}

#[tokio::test]
async fn measure_only_nests_are_single_records() {
    let (_dir, conn) = open();
    let totals = |filters: Value| {
        nest("totals", json!({
            "fields": [agg("total", "sum", field("o", "amount")), count("n", "o")],
            "filters": filters,
        }))
    };
    let plan = users_orders(
        "duck",
        json!({
            "fields": [
                dim("name", field("u", "name")),
                totals(json!([])),
            ]
        }),
    );
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(row_where(&rows, "name", "a")["totals"], json!({ "total": 18.0, "n": 3 }));
    // the outer join row of a user without orders counts nothing
    assert_eq!(row_where(&rows, "name", "c")["totals"], json!({ "total": null, "n": 0 }));

    let plan = users_orders(
        "duck",
        json!({
            "fields": [
                dim("name", field("u", "name")),
                totals(json!([eq(field("o", "status"), json!({ "type": "literal", "value": "refunded" }))])),
            ]
        }),
    );
    let rows = query_rows(&conn, &plan).await;
    for row in &rows {
        assert_eq!(row["totals"], json!({ "total": null, "n": null }));
    }
}

fn by_state() -> QueryPlan {
    users_orders(
        "duck",
        json!({
            "fields": [
                dim("state", field("u", "state")),
                count("user_count", "u"),
                nest("by_status", json!({
                    "fields": [dim("status", field("o", "status")), count("order_count", "o")]
                })),
            ]
        }),
    )
}

#[tokio::test]
async fn pipelines_aggregate_the_previous_stage() {
    let (_dir, conn) = open();

    let mut plan = by_state();
    plan.pipeline = serde_json::from_value(json!([
        { "alias": "q", "segment": { "fields": [agg("users", "sum", field("q", "user_count"))] } },
    ]))
    .unwrap();
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(number(&rows[0], "users"), 3.0);

    let mut plan = by_state();
    plan.pipeline = serde_json::from_value(json!([
        {
            "alias": "s",
            "source": { "type": "nested_array", "field": "by_status" },
            "segment": {
                "fields": [dim("status", field("s", "status")), agg("orders", "sum", field("s", "order_count"))]
            },
        },
    ]))
    .unwrap();
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(number(row_where(&rows, "status", "shipped"), "orders"), 3.0);
    assert_eq!(number(row_where(&rows, "status", "cancelled"), "orders"), 1.0);
    assert_eq!(rows[0]["status"], "shipped");
}

#[tokio::test]
async fn streams_stop_at_the_row_limit() {
    let (_dir, conn) = open();
    let stream = conn
        .stream_sql("SELECT * FROM range(0, 100)", Some(10))
        .await
        .unwrap();
    let rows: Vec<_> = stream.collect().await;
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(Result::is_ok));
}

#[tokio::test]
async fn temporary_tables_are_named_after_their_sql() {
    let (_dir, conn) = open();
    let sql = "SELECT state, COUNT(*) AS n FROM users GROUP BY 1";
    let name = conn.manifest_temporary_table(sql).await.unwrap();
    assert_eq!(name, conn.manifest_temporary_table(sql).await.unwrap());
    let result = conn
        .execute_sql(&format!("SELECT n FROM {name} WHERE state = 'CA'"))
        .await
        .unwrap();
    assert_eq!(result.rows[0]["n"], 2);
}

#[tokio::test]
async fn schemas_come_from_the_database() {
    let (_dir, conn) = open();
    let users = conn.fetch_schema("users").await.unwrap();
    assert_eq!(users.connection_name(), Some("duck"));
    let names: Vec<&str> = users.fields.iter().map(|f| f.name()).collect();
    assert_eq!(names, ["id", "name", "state", "budget"]);

    let err = conn.fetch_schema("missing_table").await.unwrap_err();
    assert!(matches!(err, TurtleError::SchemaNotFound(_)));

    let block = conn
        .fetch_sql_schema("totals", "SELECT user_id, SUM(amount) AS total FROM orders GROUP BY 1")
        .await
        .unwrap();
    assert_eq!(block.fields.len(), 2);
}

#[tokio::test]
async fn runtime_routes_plans_to_their_connection() {
    let (_dir, conn) = open();
    let mut connections = ConnectionManager::new();
    connections.insert(Arc::new(conn));

    let result = run_plan(&connections, &by_state()).await.unwrap();
    assert_eq!(result.rows.len(), 2);
    let ca = row_where(&result.rows, "state", "CA");
    assert_eq!(ca["user_count"], 2);

    let stream = stream_plan(&connections, &by_state(), Some(1)).await.unwrap();
    assert_eq!(stream.collect::<Vec<_>>().await.len(), 1);

    let orphan = users_orders("elsewhere", json!({ "fields": [count("n", "u")] }));
    assert!(matches!(
        run_plan(&connections, &orphan).await,
        Err(TurtleError::Config(_))
    ));
}

fn posts_with_tags(segment: Value) -> QueryPlan {
    let mut posts = table("posts", "duck", Some("id"), &[("id", "number")]);
    let tags = serde_json::to_value(StructDef::scalar_array("tags", AtomicType::String)).unwrap();
    posts["fields"].as_array_mut().unwrap().push(tags);
    plan(json!({
        "source": { "alias": "p", "struct": posts },
        "unnests": [{ "alias": "t", "parent": "p", "field": "tags" }],
        "segment": segment,
    }))
}

#[tokio::test]
async fn empty_arrays_add_no_elements_to_counts() {
    let (_dir, conn) = open();
    let plan = posts_with_tags(json!({ "fields": [count("tag_rows", "t"), count("posts", "p")] }));
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(rows[0]["tag_rows"], 4);
    assert_eq!(rows[0]["posts"], 3);

    let plan = posts_with_tags(json!({
        "fields": [dim("id", field("p", "id")), count("tag_rows", "t")]
    }));
    let rows = query_rows(&conn, &plan).await;
    let per_post: Vec<(i64, i64)> = rows
        .iter()
        .map(|r| (r["id"].as_i64().unwrap(), r["tag_rows"].as_i64().unwrap()))
        .collect();
    assert_eq!(per_post, [(1, 3), (3, 1), (2, 0)]);

    let plan = posts_with_tags(json!({
        "fields": [dim("tag", field("t", "value")), count("n", "t")]
    }));
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(row_where(&rows, "tag", "x")["n"], 2);
    assert_eq!(row_where(&rows, "tag", "z")["n"], 1);
}

#[tokio::test]
async fn two_level_nests_fold_into_their_parents() {
    let (_dir, conn) = open();
    let plan = users_orders(
        "duck",
        json!({
            "fields": [
                dim("state", field("u", "state")),
                count("user_count", "u"),
                nest("by_status", json!({
                    "fields": [
                        dim("status", field("o", "status")),
                        count("order_count", "o"),
                        nest("orders", json!({
                            "fields": [dim("id", field("o", "id")), agg("amount", "sum", field("o", "amount"))]
                        })),
                    ]
                })),
            ]
        }),
    );
    let rows = query_rows(&conn, &plan).await;
    assert_eq!(rows.len(), 2);
    let ca = row_where(&rows, "state", "CA");
    assert_eq!(ca["user_count"], 2);

    let statuses = ca["by_status"].as_array().unwrap();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0]["status"], "shipped");
    assert_eq!(statuses[0]["order_count"], 3);
    assert_eq!(statuses[1]["status"], "cancelled");

    let mut shipped: Vec<(i64, f64)> = statuses[0]["orders"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| (o["id"].as_i64().unwrap(), o["amount"].as_f64().unwrap()))
        .collect();
    shipped.sort_by_key(|(id, _)| *id);
    assert_eq!(shipped, [(1, 5.0), (2, 6.0), (4, 8.0)]);
    assert_eq!(statuses[1]["orders"], json!([{ "id": 3, "amount": 7.0 }]));
}

#[tokio::test]
async fn awkward_field_names_come_back_unchanged() {
    let (_dir, conn) = open();
    let plan = users_orders(
        "duck",
        json!({
            "fields": [
                dim("GROUP", field("u", "state")),
                agg("Order Total", "sum", field("o", "amount")),
                count("mixedCase", "o"),
                nest("By Status", json!({
                    "fields": [dim("Status Name", field("o", "status")), count("select", "o")]
                })),
            ]
        }),
    );
    let rows = query_rows(&conn, &plan).await;
    let ca = row_where(&rows, "GROUP", "CA");
    assert!((number(ca, "Order Total") - 26.0).abs() < 1e-9);
    assert_eq!(ca["mixedCase"], 4);
    let shipped = ca["By Status"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["Status Name"] == "shipped")
        .unwrap();
    assert_eq!(shipped["select"], 3);
    let keys: Vec<&str> = ca.keys().map(String::as_str).collect();
    for name in ["GROUP", "Order Total", "mixedCase", "By Status"] {
        assert!(keys.contains(&name), "{name} missing from {keys:?}");
    }
}

#[tokio::test]
async fn first_stage_rows_belong_to_one_group_set() {
    let (_dir, conn) = open();
    let sql = SqlCompiler::new(conn.dialect()).compile(&by_state()).unwrap().sql;
    let body = sql.strip_prefix("WITH __stage0 AS (\n").unwrap();
    let first_stage = &body[..body.find("\n)\n").unwrap()];

    let rows = conn
        .execute_sql(&format!(
            "SELECT group_set, COUNT(*) AS n, SUM(\"user_count__0\") AS users,
                    COUNT(\"status__1\") AS statuses, SUM(\"order_count__1\") AS orders
             FROM ({first_stage}) GROUP BY 1 ORDER BY 1"
        ))
        .await
        .unwrap()
        .rows;
    assert_eq!(rows.len(), 2);
    // state rows: CA and NY
    assert_eq!(rows[0]["group_set"], 0);
    assert_eq!(rows[0]["n"], 2);
    assert_eq!(rows[0]["users"], 3);
    assert_eq!(rows[0]["statuses"], 0);
    assert_eq!(rows[0]["orders"], 0);
    // status rows: CA shipped, CA cancelled and the order-less NY user
    assert_eq!(rows[1]["group_set"], 1);
    assert_eq!(rows[1]["n"], 3);
    assert_eq!(rows[1]["users"], 0);
    assert_eq!(rows[1]["statuses"], 2);
    assert_eq!(rows[1]["orders"], 4);
}
