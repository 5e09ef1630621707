use std::{env, path::PathBuf};

use tracing_subscriber::EnvFilter;
use turtle::{registry::ModelRegistry, DialectKind, PlanValidator, SqlCompiler};

fn usage() {
    eprintln!("Usage: print_sql <models_dir> <query_name> [snowflake|duckdb]");
    eprintln!("Example: cargo run --example print_sql -- examples/models orders_by_state snowflake");
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let models_dir = PathBuf::from(args.remove(0));
    let query_name = args.remove(0);
    let kind: DialectKind = args
        .first()
        .map(|s| s.parse())
        .transpose()?
        .unwrap_or(DialectKind::Snowflake);

    let registry = ModelRegistry::load_from_dir(models_dir)?;
    let plan = registry.query(&query_name)?;
    PlanValidator::new(false).validate(&plan)?;

    let dialect = kind.dialect();
    let compiled = SqlCompiler::new(dialect.as_ref()).compile(&plan)?;
    println!("{}", compiled.sql);
    Ok(())
}
