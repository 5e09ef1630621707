//! Aliases visible to a segment and the FROM clause that binds them.

use std::collections::{HashMap, HashSet};

use crate::dialect::{Dialect, PathStep};
use crate::error::{Result, TurtleError};
use crate::fragment::SqlFragment;
use crate::model::{AtomicType, FieldDef, Sampling, StructDef, StructSource, TypecastFragment};
use crate::plan::{
    Expr, JoinKind, JoinRelationship, PipelineStage, QueryPlan, StageSource, UnnestPlan,
};

use super::expressions::ExprRenderer;
use super::fanout::FanoutGraph;

/// Column added to relations that need a distinct key but have no primary key.
pub(crate) const DISTINCT_KEY_COLUMN: &str = "__distinct_key";

#[derive(Debug, Clone)]
pub(crate) enum AliasKind {
    Source {
        sampling: Sampling,
    },
    /// Rows of the previous pipeline stage.
    Upstream,
    /// Elements of a nested column of the previous stage, exposed as `base`.
    PipelineHead {
        singleton: bool,
        column: String,
    },
    Join {
        parent: String,
        kind: JoinKind,
        relationship: JoinRelationship,
        on: Expr,
        sampling: Sampling,
    },
    Unnest {
        parent: String,
        field: String,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct AliasInfo {
    pub name: String,
    pub quoted: String,
    /// Columns of the relation, or fields of the array/record element.
    pub structure: StructDef,
    pub kind: AliasKind,
}

/// How fields of an alias are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Columns,
    Element,
    Record,
}

impl AliasInfo {
    pub fn access(&self) -> Access {
        match self.kind {
            AliasKind::Unnest { .. } => Access::Element,
            AliasKind::PipelineHead { .. } => Access::Record,
            _ => Access::Columns,
        }
    }
}

/// Rendered FROM clause.
#[derive(Debug, Clone)]
pub(crate) struct FromClause {
    /// Base relation followed by its joins.
    pub relations: SqlFragment,
    /// Unnest clauses; placed after any other row source.
    pub unnests: Vec<String>,
    keys: HashMap<String, String>,
}

impl FromClause {
    pub fn distinct_key(&self, alias: &str) -> Result<&str> {
        self.keys.get(alias).map(String::as_str).ok_or_else(|| {
            TurtleError::Validation(format!("no distinct key was prepared for {alias}"))
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Scope {
    aliases: Vec<AliasInfo>,
    fanout: FanoutGraph,
}

impl Scope {
    pub fn for_plan(plan: &QueryPlan, dialect: &dyn Dialect) -> Result<Self> {
        let mut scope = Self::empty();
        let base = plan.source.structure.resolved()?;
        if matches!(base.struct_source, StructSource::Nested) {
            return Err(TurtleError::Validation(format!(
                "source {} must be a table or a SQL block",
                plan.source.alias
            )));
        }
        scope.push(
            dialect,
            &plan.source.alias,
            base.clone(),
            AliasKind::Source {
                sampling: plan.source.sampling,
            },
        )?;
        for join in &plan.joins {
            let parent = join
                .parent
                .clone()
                .unwrap_or_else(|| plan.source.alias.clone());
            scope.alias(&parent)?;
            scope.fanout.add_join(&parent, &join.alias, join.relationship);
            scope.push(
                dialect,
                &join.alias,
                join.structure.resolved()?.clone(),
                AliasKind::Join {
                    parent,
                    kind: join.kind,
                    relationship: join.relationship,
                    on: join.on.clone(),
                    sampling: join.sampling,
                },
            )?;
        }
        scope.add_unnests(dialect, &plan.unnests)?;
        Ok(scope)
    }

    /// Scope of a pipeline stage reading `upstream`, the output of the
    /// previous stage.
    pub fn for_stage(stage: &PipelineStage, upstream: StructDef, dialect: &dyn Dialect) -> Result<Self> {
        let mut scope = Self::empty();
        match &stage.source {
            StageSource::Previous => {
                scope.push(dialect, &stage.alias, upstream, AliasKind::Upstream)?;
            }
            StageSource::NestedArray { field, singleton } => {
                let nested = upstream
                    .field(field)
                    .and_then(FieldDef::as_struct)
                    .ok_or_else(|| {
                        TurtleError::Validation(format!(
                            "previous stage has no nested field {field}"
                        ))
                    })?
                    .clone();
                let singleton = *singleton || !nested.is_array();
                scope.push(
                    dialect,
                    &stage.alias,
                    nested,
                    AliasKind::PipelineHead {
                        singleton,
                        column: field.clone(),
                    },
                )?;
            }
        }
        scope.add_unnests(dialect, &stage.unnests)?;
        Ok(scope)
    }

    fn empty() -> Self {
        Self {
            aliases: Vec::new(),
            fanout: FanoutGraph::new(),
        }
    }

    fn push(&mut self, dialect: &dyn Dialect, name: &str, structure: StructDef, kind: AliasKind) -> Result<()> {
        if self.aliases.iter().any(|a| a.name == name) {
            return Err(TurtleError::Validation(format!("alias {name} is declared twice")));
        }
        self.aliases.push(AliasInfo {
            name: name.to_string(),
            quoted: dialect.quote_identifier(name),
            structure,
            kind,
        });
        Ok(())
    }

    fn add_unnests(&mut self, dialect: &dyn Dialect, unnests: &[UnnestPlan]) -> Result<()> {
        if !unnests.is_empty() && !dialect.capabilities().supports_unnest {
            return Err(TurtleError::unsupported(
                dialect.name(),
                "unnest",
                "arrays cannot be expanded into rows",
            ));
        }
        for unnest in unnests {
            let parent = self.alias(&unnest.parent)?;
            let element = parent
                .structure
                .field(&unnest.field)
                .and_then(FieldDef::as_struct)
                .filter(|s| s.is_array())
                .ok_or_else(|| {
                    TurtleError::Validation(format!(
                        "{}.{} is not an array field",
                        unnest.parent, unnest.field
                    ))
                })?
                .clone();
            self.fanout.add_unnest(&unnest.parent, &unnest.alias);
            self.push(
                dialect,
                &unnest.alias,
                element,
                AliasKind::Unnest {
                    parent: unnest.parent.clone(),
                    field: unnest.field.clone(),
                },
            )?;
        }
        Ok(())
    }

    pub fn alias(&self, name: &str) -> Result<&AliasInfo> {
        self.aliases
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| TurtleError::Validation(format!("unknown alias {name}")))
    }

    /// Alias every other alias hangs off.
    pub fn base(&self) -> &AliasInfo {
        &self.aliases[0]
    }

    /// Column that is NULL exactly on the padding rows of an alias. Outer
    /// joins pad missing rows with NULL keys and empty arrays unnest to one
    /// NULL element, so counts over an alias count this column.
    pub fn row_key_ref(&self, dialect: &dyn Dialect, name: &str) -> Result<Option<String>> {
        let info = self.alias(name)?;
        Ok(match (&info.kind, info.structure.primary_key.as_deref()) {
            (AliasKind::Unnest { .. }, _) => Some(dialect.unnest_row_id(&info.quoted)),
            (AliasKind::Source { .. } | AliasKind::Join { .. } | AliasKind::Upstream, Some(pk)) => {
                Some(dialect.field_reference(&info.quoted, pk, PathStep::Column))
            }
            _ => None,
        })
    }

    pub fn is_at_grain(&self, alias: &str) -> bool {
        self.fanout.is_at_grain(alias)
    }

    /// Render the relations, joins and unnests. Aliases in `keyed` get a
    /// distinct key, and so do the parents of keyed unnests. Unnests in
    /// `row_ids` expose their element position without keying the parent.
    pub fn render_from(
        &self,
        dialect: &dyn Dialect,
        keyed: &HashSet<String>,
        row_ids: &HashSet<String>,
    ) -> Result<FromClause> {
        let keyed = self.key_closure(keyed)?;
        let renderer = ExprRenderer::new(dialect, self);
        let mut keys = HashMap::new();
        let mut relations = SqlFragment::new();
        let mut unnests = Vec::new();

        for info in &self.aliases {
            let needs_key = keyed.contains(&info.name);
            match &info.kind {
                AliasKind::Source { .. } | AliasKind::Upstream | AliasKind::PipelineHead { .. } => {
                    relations.push_fragment(&self.relation(dialect, info, needs_key)?);
                }
                AliasKind::Join { kind, on, .. } => {
                    let on_sql = renderer.render(on)?.sql;
                    relations.push_str(format!("\n{} ", kind.keyword()));
                    relations.push_fragment(&self.relation(dialect, info, needs_key)?);
                    relations.push_str(format!(" ON {on_sql}"));
                }
                AliasKind::Unnest { parent, field } => {
                    let source = renderer.array_source(parent, field)?;
                    let with_row_id = needs_key || row_ids.contains(&info.name);
                    unnests.push(dialect.unnest_alias(&source, &info.quoted, with_row_id));
                }
            }
            if needs_key {
                let key = match &info.kind {
                    AliasKind::Unnest { parent, .. } => {
                        let parent_key = keys.get(parent).cloned().ok_or_else(|| {
                            TurtleError::Validation(format!("no distinct key for {parent}"))
                        })?;
                        let as_string =
                            |expr: String| dialect.cast(&TypecastFragment::new(expr, None, AtomicType::String));
                        format!(
                            "({} || '|' || {})",
                            as_string(parent_key),
                            as_string(dialect.unnest_row_id(&info.quoted))
                        )
                    }
                    _ => {
                        let column = info
                            .structure
                            .primary_key
                            .as_deref()
                            .unwrap_or(DISTINCT_KEY_COLUMN);
                        dialect.field_reference(&info.quoted, column, PathStep::Column)
                    }
                };
                keys.insert(info.name.clone(), key);
            }
        }

        Ok(FromClause {
            relations,
            unnests,
            keys,
        })
    }

    fn key_closure(&self, keyed: &HashSet<String>) -> Result<HashSet<String>> {
        let mut out = HashSet::new();
        let mut pending: Vec<String> = keyed.iter().cloned().collect();
        while let Some(name) = pending.pop() {
            if !out.insert(name.clone()) {
                continue;
            }
            if let AliasKind::Unnest { parent, .. } = &self.alias(&name)?.kind {
                pending.push(parent.clone());
            }
        }
        Ok(out)
    }

    /// `<relation> AS alias`, with sampling and a generated key when needed.
    fn relation(&self, dialect: &dyn Dialect, info: &AliasInfo, needs_key: bool) -> Result<SqlFragment> {
        let mut relation = match &info.kind {
            AliasKind::Source { sampling } | AliasKind::Join { sampling, .. } => {
                let table = match &info.structure.struct_source {
                    StructSource::Table { table_path } => dialect.quote_table_path(table_path),
                    StructSource::SqlSubquery { select } => format!("({select})"),
                    StructSource::Nested => {
                        return Err(TurtleError::Validation(format!(
                            "{} must be a table or a SQL block",
                            info.name
                        )))
                    }
                };
                SqlFragment::text(dialect.sample_table(&table, sampling)?)
            }
            AliasKind::Upstream => SqlFragment::upstream(),
            AliasKind::PipelineHead { singleton, column } => {
                dialect.pipeline_head(*singleton, column)
            }
            AliasKind::Unnest { .. } => {
                return Err(TurtleError::Validation(format!(
                    "{} is an unnest, not a relation",
                    info.name
                )))
            }
        };

        if needs_key && info.structure.primary_key.is_none() {
            if matches!(info.kind, AliasKind::Join { .. }) {
                return Err(TurtleError::Validation(format!(
                    "join {} fans out and needs a primary_key for fan-out safe aggregation",
                    info.name
                )));
            }
            let mut keyed = SqlFragment::text(format!(
                "(SELECT {} AS {}, x.* FROM ",
                dialect.generate_uuid(),
                dialect.quote_identifier(DISTINCT_KEY_COLUMN)
            ));
            keyed.push_fragment(&relation);
            keyed.push_str(" AS x)");
            relation = keyed;
        }
        relation.push_str(format!(" AS {}", info.quoted));
        Ok(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{DuckDbDialect, SnowflakeDialect};
    use crate::plan::{JoinPlan, Segment, SourceRef, StructRef};

    fn orders_plan() -> QueryPlan {
        let orders = StructDef::table(
            "orders",
            "analytics.orders",
            "wh",
            vec![
                FieldDef::atomic("id", AtomicType::Number),
                FieldDef::atomic("amount", AtomicType::Number),
                FieldDef::Struct(StructDef::scalar_array("tags", AtomicType::String)),
            ],
        );
        let items = StructDef::table(
            "items",
            "analytics.items",
            "wh",
            vec![FieldDef::atomic("order_id", AtomicType::Number)],
        );
        QueryPlan {
            source: SourceRef {
                alias: "o".to_string(),
                structure: StructRef::Inline(orders),
                sampling: Sampling::Disabled,
            },
            joins: vec![JoinPlan {
                alias: "i".to_string(),
                structure: StructRef::Inline(items),
                parent: None,
                kind: JoinKind::Left,
                relationship: JoinRelationship::OneToMany,
                on: Expr::eq(Expr::field("o", "id"), Expr::field("i", "order_id")),
                sampling: Sampling::Disabled,
            }],
            unnests: vec![UnnestPlan {
                alias: "t".to_string(),
                parent: "o".to_string(),
                field: "tags".to_string(),
            }],
            filters: Vec::new(),
            segment: Segment::default(),
            pipeline: Vec::new(),
        }
    }

    #[test]
    fn base_without_primary_key_gets_a_generated_key() {
        let plan = orders_plan();
        let dialect = DuckDbDialect::default();
        let scope = Scope::for_plan(&plan, &dialect).unwrap();
        assert!(!scope.is_at_grain("o"));
        // items reach the tags of their order
        assert!(!scope.is_at_grain("i"));

        let keyed: HashSet<String> = ["t".to_string()].into_iter().collect();
        let from = scope.render_from(&dialect, &keyed, &HashSet::new()).unwrap();
        let sql = from.relations.render(None).unwrap();
        assert!(sql.starts_with("(SELECT CAST(GEN_RANDOM_UUID() AS VARCHAR) AS \"__distinct_key\", x.* FROM analytics.orders AS x) AS \"o\""));
        assert!(sql.contains("LEFT JOIN analytics.items AS \"i\" ON (\"o\".\"id\" = \"i\".\"order_id\")"));
        assert_eq!(from.distinct_key("o").unwrap(), "\"o\".\"__distinct_key\"");
        assert!(from.distinct_key("t").unwrap().contains("\"t\".\"__row_id\""));
        assert!(from.unnests[0].contains("\"__row_id\""));
    }

    #[test]
    fn keyed_join_without_primary_key_is_rejected() {
        let plan = orders_plan();
        let dialect = SnowflakeDialect::default();
        let scope = Scope::for_plan(&plan, &dialect).unwrap();
        let keyed: HashSet<String> = ["i".to_string()].into_iter().collect();
        let err = scope.render_from(&dialect, &keyed, &HashSet::new()).unwrap_err();
        assert!(matches!(err, TurtleError::Validation(msg) if msg.contains("primary_key")));
    }

    #[test]
    fn duplicate_aliases_are_rejected() {
        let mut plan = orders_plan();
        plan.unnests[0].alias = "i".to_string();
        let err = Scope::for_plan(&plan, &DuckDbDialect::default()).unwrap_err();
        assert!(matches!(err, TurtleError::Validation(_)));
    }

    #[test]
    fn unnest_must_name_an_array() {
        let mut plan = orders_plan();
        plan.unnests[0].field = "amount".to_string();
        assert!(Scope::for_plan(&plan, &DuckDbDialect::default()).is_err());
    }

    #[test]
    fn counted_unnests_expose_positions_without_keying_the_parent() {
        let plan = orders_plan();
        let dialect = DuckDbDialect::default();
        let scope = Scope::for_plan(&plan, &dialect).unwrap();
        let row_ids: HashSet<String> = ["t".to_string()].into_iter().collect();
        let from = scope.render_from(&dialect, &HashSet::new(), &row_ids).unwrap();
        assert!(from.unnests[0].contains("AS \"__row_id\""));
        assert!(!from.relations.render(None).unwrap().contains("__distinct_key"));
        assert_eq!(
            scope.row_key_ref(&dialect, "t").unwrap().as_deref(),
            Some("\"t\".\"__row_id\"")
        );
        assert_eq!(scope.row_key_ref(&dialect, "i").unwrap(), None);
    }
}
