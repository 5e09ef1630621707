use std::collections::{HashMap, HashSet};

use crate::backends::ConnectionManager;
use crate::error::{Result, TurtleError};
use crate::model::{FieldDef, StructDef, StructSource, ARRAY_VALUE_FIELD};
use crate::plan::{Expr, PlanField, QueryPlan, Segment, StageSource};

/// Structural checks on a query plan before it reaches the compiler.
///
/// With `warn_only` set, failed checks are logged and the plan is accepted.
pub struct PlanValidator {
    warn_only: bool,
}

impl PlanValidator {
    pub fn new(warn_only: bool) -> Self {
        Self { warn_only }
    }

    pub fn validate(&self, plan: &QueryPlan) -> Result<()> {
        let base = plan.source.structure.resolved()?;
        self.check(
            !matches!(base.struct_source, StructSource::Nested),
            format!("source {} must be a table or SQL block", plan.source.alias),
        )?;
        let connection = base.connection_name();

        let mut aliases: HashMap<&str, StructDef> = HashMap::new();
        aliases.insert(plan.source.alias.as_str(), base.clone());

        for join in &plan.joins {
            let structure = join.structure.resolved()?;
            self.check(
                !aliases.contains_key(join.alias.as_str()),
                format!("duplicate alias {}", join.alias),
            )?;
            let parent = join.parent.as_deref().unwrap_or(&plan.source.alias);
            self.check(
                aliases.contains_key(parent),
                format!("join {} hangs off unknown alias {parent}", join.alias),
            )?;
            if let (Some(base_conn), Some(join_conn)) = (connection, structure.connection_name()) {
                self.check(
                    base_conn == join_conn,
                    format!(
                        "join {} mixes connections ({join_conn}) with base ({base_conn})",
                        join.alias
                    ),
                )?;
            }
            aliases.insert(join.alias.as_str(), structure.clone());
            self.check_expr(&join.on, &aliases, &format!("join {}", join.alias))?;
        }

        for unnest in &plan.unnests {
            let element = aliases
                .get(unnest.parent.as_str())
                .and_then(|s| s.field(&unnest.field))
                .and_then(FieldDef::as_struct)
                .filter(|s| s.is_array())
                .cloned();
            match element {
                Some(element) => {
                    aliases.insert(unnest.alias.as_str(), element);
                }
                None => self.check(
                    false,
                    format!(
                        "unnest {} needs array field {} on {}",
                        unnest.alias, unnest.field, unnest.parent
                    ),
                )?,
            }
        }

        for filter in &plan.filters {
            self.check_expr(filter, &aliases, "query filter")?;
        }
        self.check_segment(&plan.segment, &aliases, "query")?;

        for stage in &plan.pipeline {
            if let StageSource::NestedArray { field, .. } = &stage.source {
                self.check(!field.is_empty(), format!("stage {} reads an unnamed column", stage.alias))?;
            }
            self.check_segment_names(&stage.segment, &format!("stage {}", stage.alias))?;
        }
        Ok(())
    }

    /// Compare declared table columns with the live schema of their
    /// connection.
    pub async fn validate_schemas(&self, plan: &QueryPlan, connections: &ConnectionManager) -> Result<()> {
        let mut structs = vec![plan.source.structure.resolved()?];
        for join in &plan.joins {
            structs.push(join.structure.resolved()?);
        }
        for declared in structs {
            let (StructSource::Table { table_path }, Some(connection)) =
                (&declared.struct_source, declared.connection_name())
            else {
                continue;
            };
            let live = connections.table_schema(connection, table_path).await?;
            let columns: HashSet<String> = live
                .fields
                .iter()
                .map(|f| f.name().to_ascii_lowercase())
                .collect();
            for field in &declared.fields {
                self.check(
                    columns.contains(&field.name().to_ascii_lowercase()),
                    format!("column {} missing on table {table_path}", field.name()),
                )?;
            }
            if let Some(pk) = &declared.primary_key {
                self.check(
                    columns.contains(&pk.to_ascii_lowercase()),
                    format!("primary key {pk} missing on table {table_path}"),
                )?;
            }
        }
        Ok(())
    }

    fn check_segment(&self, segment: &Segment, aliases: &HashMap<&str, StructDef>, context: &str) -> Result<()> {
        self.check_segment_names(segment, context)?;
        for filter in &segment.filters {
            self.check_expr(filter, aliases, context)?;
        }
        for field in &segment.fields {
            match field {
                PlanField::Dimension { name, expr } => {
                    self.check_expr(expr, aliases, &format!("{context} dimension {name}"))?;
                }
                PlanField::Aggregate { name, expr, filter, source, .. } => {
                    let what = format!("{context} aggregate {name}");
                    for e in expr.iter().chain(filter.iter()) {
                        self.check_expr(e, aliases, &what)?;
                    }
                    if let Some(source) = source {
                        self.check(
                            aliases.contains_key(source.as_str()),
                            format!("{what} counts unknown alias {source}"),
                        )?;
                    }
                }
                PlanField::Nest { name, segment } => {
                    self.check_segment(segment, aliases, &format!("{context} nest {name}"))?;
                }
            }
        }
        Ok(())
    }

    fn check_segment_names(&self, segment: &Segment, context: &str) -> Result<()> {
        let mut names = HashSet::new();
        for field in &segment.fields {
            self.check(
                names.insert(field.name()),
                format!("{context} has duplicate output field {}", field.name()),
            )?;
        }
        for term in &segment.order_by {
            self.check(
                names.contains(term.field.as_str()),
                format!("{context} orders by unknown field {}", term.field),
            )?;
        }
        Ok(())
    }

    fn check_expr(&self, expr: &Expr, aliases: &HashMap<&str, StructDef>, context: &str) -> Result<()> {
        let mut missing = Vec::new();
        collect_missing_fields(expr, aliases, &mut missing);
        for message in missing {
            self.check(false, format!("{context}: {message}"))?;
        }
        Ok(())
    }

    fn check(&self, condition: bool, message: String) -> Result<()> {
        if condition {
            return Ok(());
        }
        if self.warn_only {
            tracing::warn!(message = %message, "plan validation");
            Ok(())
        } else {
            Err(TurtleError::Validation(message))
        }
    }
}

fn collect_missing_fields(expr: &Expr, aliases: &HashMap<&str, StructDef>, out: &mut Vec<String>) {
    let Expr::Field { alias, name, path } = expr else {
        match expr {
            Expr::Binary { left, right, .. } => {
                collect_missing_fields(left, aliases, out);
                collect_missing_fields(right, aliases, out);
            }
            Expr::TimeDiff { from, to, .. } => {
                collect_missing_fields(from, aliases, out);
                collect_missing_fields(to, aliases, out);
            }
            Expr::AlterTime { expr, amount, .. } => {
                collect_missing_fields(expr, aliases, out);
                collect_missing_fields(amount, aliases, out);
            }
            Expr::Not { expr }
            | Expr::IsNull { expr, .. }
            | Expr::Cast { expr, .. }
            | Expr::Trunc { expr, .. }
            | Expr::Extract { expr, .. }
            | Expr::RegexpMatch { expr, .. }
            | Expr::DateToString { expr } => collect_missing_fields(expr, aliases, out),
            Expr::Call { args, .. } => {
                for arg in args {
                    collect_missing_fields(arg, aliases, out);
                }
            }
            _ => {}
        }
        return;
    };

    let Some(mut current) = aliases.get(alias.as_str()) else {
        out.push(format!("unknown alias {alias}"));
        return;
    };
    for step in path {
        match current.field(step).and_then(FieldDef::as_struct) {
            Some(record) => current = record,
            None => {
                out.push(format!("{alias} has no record {step}"));
                return;
            }
        }
    }
    // Fields of a struct with no declared columns cannot be checked.
    let known = current.fields.is_empty()
        || current.field(name).is_some()
        || (current.is_scalar_array() && name == ARRAY_VALUE_FIELD);
    if !known {
        out.push(format!("{alias} has no field {name}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AtomicType;
    use crate::plan::{AggregateFunction, JoinKind, JoinPlan, JoinRelationship, OrderTerm, SourceRef, StructRef};

    fn plan() -> QueryPlan {
        let orders = StructDef::table(
            "orders",
            "db.orders",
            "wh",
            vec![
                FieldDef::atomic("id", AtomicType::Number),
                FieldDef::atomic("user_id", AtomicType::Number),
            ],
        );
        let users = StructDef::table(
            "users",
            "db.users",
            "wh",
            vec![
                FieldDef::atomic("id", AtomicType::Number),
                FieldDef::atomic("state", AtomicType::String),
            ],
        );
        QueryPlan {
            source: SourceRef {
                alias: "o".to_string(),
                structure: StructRef::Inline(orders),
                sampling: Default::default(),
            },
            joins: vec![JoinPlan {
                alias: "u".to_string(),
                structure: StructRef::Inline(users),
                parent: None,
                kind: JoinKind::Left,
                relationship: JoinRelationship::ManyToOne,
                on: Expr::eq(Expr::field("o", "user_id"), Expr::field("u", "id")),
                sampling: Default::default(),
            }],
            unnests: vec![],
            filters: vec![],
            segment: Segment::new(vec![
                PlanField::Dimension {
                    name: "state".to_string(),
                    expr: Expr::field("u", "state"),
                },
                PlanField::Aggregate {
                    name: "order_count".to_string(),
                    function: AggregateFunction::Count,
                    expr: None,
                    filter: None,
                    source: None,
                },
            ]),
            pipeline: vec![],
        }
    }

    #[test]
    fn accepts_a_well_formed_plan() {
        PlanValidator::new(false).validate(&plan()).unwrap();
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut plan = plan();
        plan.segment.fields[0] = PlanField::Dimension {
            name: "state".to_string(),
            expr: Expr::field("u", "region"),
        };
        let err = PlanValidator::new(false).validate(&plan).unwrap_err();
        assert!(err.to_string().contains("u has no field region"));
    }

    #[test]
    fn warn_only_accepts_bad_ordering() {
        let mut plan = plan();
        plan.segment.order_by.push(OrderTerm {
            field: "missing".to_string(),
            direction: Default::default(),
        });
        assert!(PlanValidator::new(false).validate(&plan).is_err());
        PlanValidator::new(true).validate(&plan).unwrap();
    }
}
