//! Scalar expression rendering and type inference.

use serde_json::Value;

use crate::dialect::{Dialect, PathStep};
use crate::error::{Result, TurtleError};
use crate::model::{
    AtomicType, FieldDef, StructDef, TimeFieldType, TimeValue, TimestampUnit, TypecastFragment,
    ARRAY_VALUE_FIELD,
};
use crate::plan::Expr;

use super::scope::{Access, Scope};

/// Rendered SQL with its inferred semantic type.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Typed {
    pub sql: String,
    pub ty: AtomicType,
}

impl Typed {
    fn new(sql: impl Into<String>, ty: AtomicType) -> Self {
        Self { sql: sql.into(), ty }
    }

    fn time(&self, what: &str) -> Result<TimeValue> {
        let time_type = self.ty.time_type().ok_or_else(|| {
            TurtleError::Validation(format!("{what} needs a date or timestamp, got {}", self.ty))
        })?;
        Ok(TimeValue::new(self.sql.clone(), time_type))
    }
}

pub(crate) struct ExprRenderer<'a> {
    dialect: &'a dyn Dialect,
    scope: &'a Scope,
}

impl<'a> ExprRenderer<'a> {
    pub fn new(dialect: &'a dyn Dialect, scope: &'a Scope) -> Self {
        Self { dialect, scope }
    }

    pub fn render(&self, expr: &Expr) -> Result<Typed> {
        let d = self.dialect;
        match expr {
            Expr::Field { alias, name, path } => self.field(alias, path, name),
            Expr::Literal { value } => self.literal(value),
            Expr::Time {
                value,
                time_type,
                timezone,
            } => Ok(Typed::new(
                d.literal_time(value, *time_type, timezone.as_deref())?,
                time_atomic(*time_type),
            )),
            Expr::Binary { op, left, right } => {
                let l = self.render(left)?;
                let r = self.render(right)?;
                let ty = if op.is_arithmetic() {
                    AtomicType::Number
                } else {
                    AtomicType::Boolean
                };
                Ok(Typed::new(format!("({} {} {})", l.sql, op.symbol(), r.sql), ty))
            }
            Expr::Not { expr } => Ok(Typed::new(
                format!("NOT ({})", self.render(expr)?.sql),
                AtomicType::Boolean,
            )),
            Expr::IsNull { expr, negated } => {
                let inner = self.render(expr)?;
                let test = if *negated { "IS NOT NULL" } else { "IS NULL" };
                Ok(Typed::new(format!("({} {test})", inner.sql), AtomicType::Boolean))
            }
            Expr::Cast { expr, to, safe } => {
                let inner = self.render(expr)?;
                let src = (inner.ty != AtomicType::Json).then_some(inner.ty);
                let mut cast = TypecastFragment::new(inner.sql, src, *to);
                cast.safe = *safe;
                Ok(Typed::new(d.cast(&cast), *to))
            }
            Expr::Trunc { expr, unit } => {
                let value = self.render(expr)?.time("truncation")?;
                let ty = altered_type(value.time_type, *unit);
                Ok(Typed::new(d.truncate_time(&value, *unit), ty))
            }
            Expr::Extract { expr, unit } => {
                let value = self.render(expr)?.time("extraction")?;
                Ok(Typed::new(d.extract_time_part(&value, *unit), AtomicType::Number))
            }
            Expr::TimeDiff { unit, from, to } => {
                let from = self.render(from)?.time("time difference")?;
                let to = self.render(to)?.time("time difference")?;
                Ok(Typed::new(d.measure_time(&from, &to, *unit), AtomicType::Number))
            }
            Expr::AlterTime {
                expr,
                op,
                amount,
                unit,
            } => {
                let value = self.render(expr)?.time("time arithmetic")?;
                let amount = self.render(amount)?;
                let ty = altered_type(value.time_type, *unit);
                Ok(Typed::new(d.alter_time(*op, &value, &amount.sql, *unit), ty))
            }
            Expr::RegexpMatch { expr, pattern } => {
                let inner = self.render(expr)?;
                Ok(Typed::new(d.regexp_match(&inner.sql, pattern), AtomicType::Boolean))
            }
            Expr::Now => Ok(Typed::new(d.now_expression(), AtomicType::Timestamp)),
            Expr::Uuid => Ok(Typed::new(d.generate_uuid(), AtomicType::String)),
            Expr::DateToString { expr } => {
                let inner = self.render(expr)?;
                Ok(Typed::new(d.date_to_string(&inner.sql), AtomicType::String))
            }
            Expr::Call {
                function,
                args,
                returns,
            } => {
                if !is_function_name(function) {
                    return Err(TurtleError::Validation(format!(
                        "invalid function name {function:?}"
                    )));
                }
                let args = args
                    .iter()
                    .map(|a| self.render(a))
                    .collect::<Result<Vec<_>>>()?;
                let ty = returns
                    .or_else(|| args.first().map(|a| a.ty))
                    .unwrap_or(AtomicType::String);
                let sql: Vec<&str> = args.iter().map(|a| a.sql.as_str()).collect();
                Ok(Typed::new(format!("{function}({})", sql.join(", ")), ty))
            }
        }
    }

    fn literal(&self, value: &Value) -> Result<Typed> {
        match value {
            Value::Null => Ok(Typed::new("NULL", AtomicType::Json)),
            Value::Bool(b) => Ok(Typed::new(
                if *b { "TRUE" } else { "FALSE" },
                AtomicType::Boolean,
            )),
            Value::Number(n) => Ok(Typed::new(n.to_string(), AtomicType::Number)),
            Value::String(s) => Ok(Typed::new(self.dialect.quote_string(s), AtomicType::String)),
            other => Err(TurtleError::Validation(format!(
                "unsupported literal {other}"
            ))),
        }
    }

    /// Reference to an atomic field, cast when read out of a semi-structured value.
    fn field(&self, alias: &str, path: &[String], name: &str) -> Result<Typed> {
        let (sql, field, semi_structured) = self.raw_field(alias, path, name)?;
        let ty = field.atomic_type().ok_or_else(|| {
            TurtleError::Validation(format!(
                "{alias}.{name} is a nested field; unnest it or reference one of its fields"
            ))
        })?;
        if semi_structured {
            Ok(Typed::new(
                self.dialect.cast(&TypecastFragment::new(sql, None, ty)),
                ty,
            ))
        } else {
            Ok(Typed::new(sql, ty))
        }
    }

    /// Expression for the array field `field` of `alias`, as unnest input.
    pub fn array_source(&self, alias: &str, field: &str) -> Result<String> {
        let (sql, def, _) = self.raw_field(alias, &[], field)?;
        match def.as_struct() {
            Some(s) if s.is_array() => Ok(sql),
            _ => Err(TurtleError::Validation(format!(
                "{alias}.{field} is not an array"
            ))),
        }
    }

    fn raw_field(&self, alias: &str, path: &[String], name: &str) -> Result<(String, FieldDef, bool)> {
        let info = self.scope.alias(alias)?;
        let d = self.dialect;
        let structure: &StructDef = &info.structure;

        if info.access() == Access::Element && structure.is_scalar_array() {
            if !path.is_empty() || name != ARRAY_VALUE_FIELD {
                return Err(TurtleError::Validation(format!(
                    "elements of {alias} are scalars; reference {alias}.{ARRAY_VALUE_FIELD}"
                )));
            }
            let field = structure
                .field(ARRAY_VALUE_FIELD)
                .cloned()
                .ok_or_else(|| missing(alias, name))?;
            return Ok((d.field_reference(&info.quoted, ARRAY_VALUE_FIELD, PathStep::Element), field, true));
        }

        let (mut expr, mut step) = match info.access() {
            Access::Columns => (info.quoted.clone(), PathStep::Column),
            Access::Element => (info.quoted.clone(), PathStep::ElementKey),
            Access::Record => (format!("{}.base", info.quoted), PathStep::Key { depth: 0 }),
        };
        let mut current = structure;
        for key in path {
            let record = current
                .field(key)
                .and_then(FieldDef::as_struct)
                .filter(|s| !s.is_array())
                .ok_or_else(|| {
                    TurtleError::Validation(format!("{alias}.{key} is not a record field"))
                })?;
            expr = d.field_reference(&expr, key, step);
            step = step.next();
            current = record;
        }
        let field = current
            .field(name)
            .cloned()
            .ok_or_else(|| missing(alias, name))?;
        let semi_structured = step != PathStep::Column;
        Ok((d.field_reference(&expr, name, step), field, semi_structured))
    }
}

fn missing(alias: &str, name: &str) -> TurtleError {
    TurtleError::Validation(format!("{alias} has no field {name}"))
}

fn time_atomic(time_type: TimeFieldType) -> AtomicType {
    match time_type {
        TimeFieldType::Date => AtomicType::Date,
        TimeFieldType::Timestamp => AtomicType::Timestamp,
    }
}

/// Dates stay dates unless moved by less than a day.
fn altered_type(time_type: TimeFieldType, unit: TimestampUnit) -> AtomicType {
    match (time_type, unit.seconds()) {
        (TimeFieldType::Date, None) => AtomicType::Date,
        _ => AtomicType::Timestamp,
    }
}

fn is_function_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{DuckDbDialect, SnowflakeDialect};
    use crate::model::{Sampling, StructDef};
    use crate::plan::{BinaryOp, QueryPlan, Segment, SourceRef, StructRef, UnnestPlan};

    fn plan() -> QueryPlan {
        let address = StructDef::nested(
            "address",
            false,
            vec![FieldDef::atomic("city", AtomicType::String)],
        );
        let lines = StructDef::nested(
            "lines",
            true,
            vec![
                FieldDef::atomic("sku", AtomicType::String),
                FieldDef::atomic("qty", AtomicType::Number),
            ],
        );
        let users = StructDef::table(
            "users",
            "db.users",
            "wh",
            vec![
                FieldDef::atomic("id", AtomicType::Number),
                FieldDef::atomic("created_at", AtomicType::Timestamp),
                FieldDef::Struct(address),
                FieldDef::Struct(lines),
                FieldDef::Struct(StructDef::scalar_array("tags", AtomicType::String)),
            ],
        );
        QueryPlan {
            source: SourceRef {
                alias: "u".to_string(),
                structure: StructRef::Inline(users),
                sampling: Sampling::Disabled,
            },
            joins: Vec::new(),
            unnests: vec![
                UnnestPlan {
                    alias: "l".to_string(),
                    parent: "u".to_string(),
                    field: "lines".to_string(),
                },
                UnnestPlan {
                    alias: "t".to_string(),
                    parent: "u".to_string(),
                    field: "tags".to_string(),
                },
            ],
            filters: Vec::new(),
            segment: Segment::default(),
            pipeline: Vec::new(),
        }
    }

    fn nested_field(alias: &str, path: &[&str], name: &str) -> Expr {
        Expr::Field {
            alias: alias.to_string(),
            name: name.to_string(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn snowflake_paths_are_cast_out_of_variants() {
        let dialect = SnowflakeDialect::default();
        let plan = plan();
        let scope = Scope::for_plan(&plan, &dialect).unwrap();
        let r = ExprRenderer::new(&dialect, &scope);

        let city = r.render(&nested_field("u", &["address"], "city")).unwrap();
        assert_eq!(city.ty, AtomicType::String);
        assert!(city.sql.contains("\"u\".\"address\":\"city\""));

        let qty = r.render(&Expr::field("l", "qty")).unwrap();
        assert!(qty.sql.contains("\"l\".VALUE:\"qty\""));
        assert_eq!(qty.ty, AtomicType::Number);

        let tag = r.render(&Expr::field("t", "value")).unwrap();
        assert!(tag.sql.contains("\"t\".VALUE"));
        assert!(r.render(&Expr::field("t", "other")).is_err());
    }

    #[test]
    fn duckdb_paths_use_struct_access() {
        let dialect = DuckDbDialect::default();
        let plan = plan();
        let scope = Scope::for_plan(&plan, &dialect).unwrap();
        let r = ExprRenderer::new(&dialect, &scope);
        let city = r.render(&nested_field("u", &["address"], "city")).unwrap();
        assert_eq!(city.sql, "CAST(\"u\".\"address\"['city'] AS VARCHAR)");
        assert_eq!(r.array_source("u", "lines").unwrap(), "\"u\".\"lines\"");
    }

    #[test]
    fn types_are_inferred() {
        let dialect = DuckDbDialect::default();
        let plan = plan();
        let scope = Scope::for_plan(&plan, &dialect).unwrap();
        let r = ExprRenderer::new(&dialect, &scope);
        let day = r
            .render(&Expr::Trunc {
                expr: Box::new(Expr::field("u", "created_at")),
                unit: TimestampUnit::Day,
            })
            .unwrap();
        assert_eq!(day.ty, AtomicType::Timestamp);
        let cmp = r
            .render(&Expr::binary(BinaryOp::Gt, Expr::field("u", "id"), Expr::literal(3)))
            .unwrap();
        assert_eq!(cmp.sql, "(\"u\".\"id\" > 3)");
        assert_eq!(cmp.ty, AtomicType::Boolean);
        assert!(r
            .render(&Expr::Extract {
                expr: Box::new(Expr::field("u", "id")),
                unit: crate::model::ExtractUnit::Year,
            })
            .is_err());
    }

    #[test]
    fn records_cannot_be_used_as_scalars() {
        let dialect = DuckDbDialect::default();
        let plan = plan();
        let scope = Scope::for_plan(&plan, &dialect).unwrap();
        let r = ExprRenderer::new(&dialect, &scope);
        assert!(r.render(&Expr::field("u", "address")).is_err());
        assert!(r
            .render(&Expr::Call {
                function: "drop table x;".to_string(),
                args: Vec::new(),
                returns: None,
            })
            .is_err());
    }
}
