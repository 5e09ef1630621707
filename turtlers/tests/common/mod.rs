#![allow(dead_code)]

use serde_json::{json, Value};
use turtle::plan::QueryPlan;

pub fn table(name: &str, connection: &str, primary_key: Option<&str>, fields: &[(&str, &str)]) -> Value {
    let fields: Vec<Value> = fields
        .iter()
        .map(|(name, ty)| json!({ "name": name, "type": ty }))
        .collect();
    let mut def = json!({
        "name": name,
        "struct_source": { "type": "table", "table_path": name },
        "struct_relationship": { "type": "basetable", "connection_name": connection },
        "fields": fields,
    });
    if let Some(pk) = primary_key {
        def["primary_key"] = json!(pk);
    }
    def
}

pub fn field(alias: &str, name: &str) -> Value {
    json!({ "type": "field", "alias": alias, "name": name })
}

pub fn eq(left: Value, right: Value) -> Value {
    json!({ "type": "binary", "op": "eq", "left": left, "right": right })
}

pub fn dim(name: &str, expr: Value) -> Value {
    json!({ "kind": "dimension", "name": name, "expr": expr })
}

pub fn count(name: &str, source: &str) -> Value {
    json!({ "kind": "aggregate", "name": name, "function": "count", "source": source })
}

pub fn agg(name: &str, function: &str, expr: Value) -> Value {
    json!({ "kind": "aggregate", "name": name, "function": function, "expr": expr })
}

pub fn nest(name: &str, segment: Value) -> Value {
    json!({ "kind": "nest", "name": name, "segment": segment })
}

pub fn plan(value: Value) -> QueryPlan {
    serde_json::from_value(value).expect("valid query plan")
}

/// `users` one-to-many `orders`, both keyed by `id`.
pub fn users_orders(connection: &str, segment: Value) -> QueryPlan {
    plan(json!({
        "source": {
            "alias": "u",
            "struct": table("users", connection, Some("id"), &[
                ("id", "number"), ("name", "string"), ("state", "string"), ("budget", "number"),
            ]),
        },
        "joins": [{
            "alias": "o",
            "struct": table("orders", connection, Some("id"), &[
                ("id", "number"), ("user_id", "number"), ("amount", "number"), ("status", "string"),
            ]),
            "relationship": "one_to_many",
            "on": eq(field("u", "id"), field("o", "user_id")),
        }],
        "segment": segment,
    }))
}
