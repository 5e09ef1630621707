use chrono::{DateTime, NaiveDate};
use futures::stream::BoxStream;
#[cfg(feature = "duckdb")]
use duckdb::types::{TimeUnit, Value as DuckValue};
use serde_json::{Map, Value};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    /// Engine type name as reported by the backend, when known.
    pub native_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
}

/// Finite, non-restartable stream of result rows. Dropping it releases the
/// statement on the server.
pub type RowStream = BoxStream<'static, Result<Map<String, Value>>>;

/// `YYYY-MM-DD` for a day count since the Unix epoch.
pub(crate) fn epoch_days_to_string(days: i64) -> Option<String> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
    let date = epoch.checked_add_signed(chrono::Duration::days(days))?;
    Some(date.format("%Y-%m-%d").to_string())
}

/// `YYYY-MM-DD HH:MM:SS[.fff]` for microseconds since the Unix epoch.
pub(crate) fn epoch_micros_to_string(micros: i64) -> Option<String> {
    DateTime::from_timestamp_micros(micros).map(|ts| ts.naive_utc().to_string())
}

#[cfg(feature = "duckdb")]
fn micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

#[cfg(feature = "duckdb")]
pub(crate) fn duck_value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        DuckValue::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => Value::from(small),
            Err(_) => Value::String(i.to_string()),
        },
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => Value::from(f),
        DuckValue::Double(f) => Value::from(f),
        DuckValue::Decimal(d) => Value::String(d.to_string()),
        DuckValue::Timestamp(unit, t) => epoch_micros_to_string(micros(unit, t))
            .map(Value::String)
            .unwrap_or(Value::Null),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Blob(bytes) => Value::String(hex::encode(bytes)),
        DuckValue::Date32(d) => epoch_days_to_string(i64::from(d))
            .map(Value::String)
            .unwrap_or(Value::Null),
        DuckValue::Time64(unit, t) => Value::String(format!("{t} ({unit:?})")),
        DuckValue::Interval {
            months,
            days,
            nanos,
        } => Value::String(format!("{months} months {days} days {nanos} nanos")),
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(duck_value_to_json).collect())
        }
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Struct(fields) => {
            let mut map = Map::new();
            for (key, val) in fields.iter() {
                map.insert(key.clone(), duck_value_to_json(val.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Map(entries) => {
            let mut map = Map::new();
            for (k, v) in entries.iter() {
                let key = match duck_value_to_json(k.clone()) {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                map.insert(key, duck_value_to_json(v.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Union(inner) => duck_value_to_json(*inner),
    }
}
