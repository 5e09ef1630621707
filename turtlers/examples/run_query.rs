use std::{fs, path::Path, sync::Arc};

use tracing_subscriber::EnvFilter;
use turtle::{
    backends::{ConnectionManager, DuckDbConnection},
    runtime::run_query,
    PlanValidator,
};

fn bootstrap_duckdb(path: &Path) -> anyhow::Result<()> {
    let conn = duckdb::Connection::open(path)?;
    conn.execute_batch(
        "
        CREATE TABLE users (
            id INTEGER PRIMARY KEY,
            name VARCHAR,
            state VARCHAR
        );
        CREATE TABLE orders (
            id INTEGER PRIMARY KEY,
            user_id INTEGER,
            amount DOUBLE,
            status VARCHAR,
            created_at TIMESTAMP
        );
        INSERT INTO users VALUES
            (1, 'Alice', 'CA'),
            (2, 'Bob', 'NY'),
            (3, 'Carla', 'CA');
        INSERT INTO orders VALUES
            (1, 1, 100.0, 'shipped', '2023-01-01'),
            (2, 1, 50.0, 'returned', '2023-01-02'),
            (3, 2, 25.0, 'shipped', '2023-01-03');
        ",
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let db_path = std::env::temp_dir().join("turtle_demo.duckdb");
    if db_path.exists() {
        fs::remove_file(&db_path)?;
    }
    bootstrap_duckdb(&db_path)?;

    let mut connections = ConnectionManager::new();
    connections.insert(Arc::new(DuckDbConnection::open(
        "duckdb_local",
        db_path.display().to_string(),
    )?));

    let registry = turtle::load_and_validate("examples/models", &PlanValidator::new(false))?;
    let result = run_query(&registry, &connections, "orders_by_state").await?;
    println!("rows: {}", result.rows.len());
    for row in result.rows {
        println!("{}", serde_json::Value::Object(row));
    }
    Ok(())
}
