//! Group-set compilation of one segment.
//!
//! Stage 0 evaluates every level in a single pass: the base rows are
//! cross-joined with `N + 1` group sets, dimensions of a level are kept only
//! on rows of that level or its descendants, and aggregates are gated to
//! their own level. Reduction stages then fold the deepest remaining levels
//! into nested columns of their parents, deepest first, relabelling the
//! folded rows with the parent's group set. The final stage folds depth 1
//! into the root and names the output columns.

use std::collections::{HashMap, HashSet};

use crate::dialect::Dialect;
use crate::error::{Result, TurtleError};
use crate::fragment::SqlFragment;
use crate::model::{
    AtomicType, DialectField, DialectFieldList, FieldDef, FieldType, GroupSet, SortDirection,
    SortTerm, StructDef,
};
use crate::plan::{AggregateFunction, Expr, PlanField, Segment};
use crate::symmetric;

use super::expressions::{ExprRenderer, Typed};
use super::levels::{level_column, Level, LevelTree};
use super::scope::{Access, FromClause, Scope};
use super::select::{SelectItem, SelectQuery};

/// Output of one compiled segment.
#[derive(Debug, Clone)]
pub(crate) struct CompiledSegment {
    /// Intermediate stages, each reading the one before it.
    pub stages: Vec<SqlFragment>,
    pub final_select: SqlFragment,
    pub fields: DialectFieldList,
    pub schema: Vec<FieldDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Dimension,
    Measure,
    Nested,
}

/// Column carried between stages.
#[derive(Debug, Clone)]
struct Column {
    name: String,
    level: u32,
    kind: ColumnKind,
}

pub(crate) struct SegmentCompiler<'a> {
    dialect: &'a dyn Dialect,
    scope: &'a Scope,
    precision: f64,
    tree: LevelTree<'a>,
    filters: &'a [Expr],
    types: HashMap<(u32, String), AtomicType>,
}

impl<'a> SegmentCompiler<'a> {
    pub fn new(
        dialect: &'a dyn Dialect,
        scope: &'a Scope,
        precision: f64,
        segment: &'a Segment,
        filters: &'a [Expr],
    ) -> Self {
        Self {
            dialect,
            scope,
            precision,
            tree: LevelTree::build(segment),
            filters,
            types: HashMap::new(),
        }
    }

    pub fn compile(mut self) -> Result<CompiledSegment> {
        self.check_names()?;
        let renderer = ExprRenderer::new(self.dialect, self.scope);
        let (keyed, row_ids) = self.key_needs()?;
        let from = self.scope.render_from(self.dialect, &keyed, &row_ids)?;

        let mut where_clause = Vec::new();
        for filter in self.filters.iter().chain(&self.tree.root().segment.filters) {
            where_clause.push(renderer.render(filter)?.sql);
        }

        if self.tree.nest_count() == 0 {
            return self.flat(&renderer, &from, where_clause);
        }

        let (stage0, mut columns) = self.first_stage(&renderer, &from, where_clause)?;
        let mut stages = vec![stage0];
        for depth in (2..=self.tree.max_depth()).rev() {
            stages.push(self.reduction_stage(depth, &mut columns)?);
        }
        let (final_select, fields) = self.final_stage()?;
        let schema = self.output_schema(self.tree.root())?;

        tracing::debug!(
            dialect = self.dialect.name(),
            levels = self.tree.nest_count(),
            stages = stages.len() + 1,
            keyed = keyed.len(),
            "compiled nested segment"
        );
        Ok(CompiledSegment {
            stages,
            final_select,
            fields,
            schema,
        })
    }

    fn check_names(&self) -> Result<()> {
        for level in self.tree.iter() {
            let mut seen = HashSet::new();
            if level.segment.fields.is_empty() {
                return Err(TurtleError::Validation(format!(
                    "segment {} has no fields",
                    display_level(level)
                )));
            }
            for field in &level.segment.fields {
                if !seen.insert(field.name()) {
                    return Err(TurtleError::Validation(format!(
                        "field {} appears twice in segment {}",
                        field.name(),
                        display_level(level)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Aliases whose aggregates run off their grain and need a distinct key,
    /// and unnests whose elements are counted by position.
    fn key_needs(&self) -> Result<(HashSet<String>, HashSet<String>)> {
        let mut keyed = HashSet::new();
        let mut row_ids = HashSet::new();
        for level in self.tree.iter() {
            for field in &level.segment.fields {
                if let PlanField::Aggregate {
                    name,
                    function,
                    expr,
                    source,
                    ..
                } = field
                {
                    if !is_fanout_sensitive(*function) {
                        continue;
                    }
                    let alias = self.aggregate_alias(name, expr.as_ref(), source.as_deref())?;
                    if *function == AggregateFunction::Count
                        && expr.is_none()
                        && self.scope.alias(&alias)?.access() == Access::Element
                    {
                        row_ids.insert(alias.clone());
                    }
                    if !self.scope.is_at_grain(&alias) {
                        keyed.insert(alias);
                    }
                }
            }
        }
        Ok((keyed, row_ids))
    }

    fn aggregate_alias(&self, name: &str, expr: Option<&Expr>, source: Option<&str>) -> Result<String> {
        if let Some(source) = source {
            return Ok(self.scope.alias(source)?.name.clone());
        }
        let aliases = expr.map(Expr::aliases).unwrap_or_default();
        match aliases.as_slice() {
            [] => Ok(self.scope.base().name.clone()),
            [alias] => Ok(alias.to_string()),
            _ => Err(TurtleError::Validation(format!(
                "aggregate {name} reads several aliases ({}); set its source",
                aliases.join(", ")
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn aggregate(
        &self,
        renderer: &ExprRenderer<'_>,
        from: &FromClause,
        level: Option<GroupSet>,
        name: &str,
        function: AggregateFunction,
        expr: Option<&Expr>,
        filter: Option<&Expr>,
        source: Option<&str>,
    ) -> Result<Typed> {
        let filter = filter.map(|f| renderer.render(f)).transpose()?;
        let gate = |extra: Option<String>, inner: &str| -> String {
            let mut conditions = Vec::new();
            if let Some(level) = level {
                conditions.push(format!("group_set = {level}"));
            }
            if let Some(filter) = &filter {
                conditions.push(filter.sql.clone());
            }
            if let Some(extra) = extra {
                conditions.push(extra);
            }
            if conditions.is_empty() {
                inner.to_string()
            } else {
                format!("CASE WHEN {} THEN {inner} END", conditions.join(" AND "))
            }
        };
        let value = expr.map(|e| renderer.render(e)).transpose()?;
        let required = || {
            value.as_ref().ok_or_else(|| {
                TurtleError::Validation(format!("aggregate {name} needs an expression"))
            })
        };
        let symmetric = is_fanout_sensitive(function) && {
            let alias = self.aggregate_alias(name, expr, source)?;
            !self.scope.is_at_grain(&alias)
        };
        let key = if symmetric {
            Some(from.distinct_key(&self.aggregate_alias(name, expr, source)?)?.to_string())
        } else {
            None
        };
        let d = self.dialect;

        let typed = match (function, key) {
            (AggregateFunction::Count, None) => {
                let counted = match (&value, source) {
                    (Some(v), _) => v.sql.clone(),
                    (None, Some(source)) => self
                        .scope
                        .row_key_ref(d, source)?
                        .unwrap_or_else(|| "1".to_string()),
                    (None, None) => "1".to_string(),
                };
                Typed {
                    sql: format!("COUNT({})", gate(None, &counted)),
                    ty: AtomicType::Number,
                }
            }
            (AggregateFunction::Count, Some(key)) => {
                let present = value.as_ref().map(|v| format!("{} IS NOT NULL", v.sql));
                Typed {
                    sql: symmetric::count_distinct_keys(&gate(present, &key)),
                    ty: AtomicType::Number,
                }
            }
            (AggregateFunction::CountDistinct, _) => Typed {
                sql: format!("COUNT(DISTINCT {})", gate(None, &required()?.sql)),
                ty: AtomicType::Number,
            },
            (AggregateFunction::Sum, None) => Typed {
                sql: format!("SUM({})", gate(None, &required()?.sql)),
                ty: AtomicType::Number,
            },
            (AggregateFunction::Sum, Some(key)) => Typed {
                sql: symmetric::sum_distinct(d, &gate(None, &key), &required()?.sql, self.precision)?,
                ty: AtomicType::Number,
            },
            (AggregateFunction::Avg, None) => Typed {
                sql: format!("AVG({})", gate(None, &required()?.sql)),
                ty: AtomicType::Number,
            },
            (AggregateFunction::Avg, Some(key)) => Typed {
                sql: symmetric::avg_distinct(d, &gate(None, &key), &required()?.sql, self.precision)?,
                ty: AtomicType::Number,
            },
            (AggregateFunction::Min | AggregateFunction::Max, _) => {
                let v = required()?;
                let func = if function == AggregateFunction::Min { "MIN" } else { "MAX" };
                Typed {
                    sql: format!("{func}({})", gate(None, &v.sql)),
                    ty: v.ty,
                }
            }
        };
        Ok(typed)
    }

    /// Segment without nests: one plain grouped SELECT.
    fn flat(
        mut self,
        renderer: &ExprRenderer<'_>,
        from: &FromClause,
        where_clause: Vec<String>,
    ) -> Result<CompiledSegment> {
        let root = self.tree.root();
        let mut query = SelectQuery {
            from: from.relations.clone(),
            joins: from.unnests.clone(),
            filters: where_clause,
            limit: root.segment.limit,
            ..Default::default()
        };
        let mut fields = Vec::new();
        let mut types = Vec::new();
        for field in &root.segment.fields {
            let typed = match field {
                PlanField::Dimension { expr, .. } => {
                    let typed = renderer.render(expr)?;
                    query.group_by.push(query.select.len() + 1);
                    typed
                }
                PlanField::Aggregate {
                    name,
                    function,
                    expr,
                    filter,
                    source,
                } => self.aggregate(
                    renderer,
                    from,
                    None,
                    name,
                    *function,
                    expr.as_ref(),
                    filter.as_ref(),
                    source.as_deref(),
                )?,
                PlanField::Nest { name, .. } => {
                    return Err(TurtleError::Validation(format!(
                        "nest {name} reached the flat compiler"
                    )))
                }
            };
            let output = self.dialect.quote_identifier(field.name());
            query
                .select
                .push(SelectItem::aliased(typed.sql.clone(), output.clone()));
            fields.push(DialectField {
                name: field.name().to_string(),
                sql_expression: typed.sql,
                sql_output_name: output,
                field_type: FieldType::Atomic(typed.ty),
            });
            types.push((field.name().to_string(), typed.ty));
        }
        query.order_by = self.order_terms(root, |name| self.dialect.quote_identifier(name))?;
        for (name, ty) in types {
            self.types.insert((0, name), ty);
        }
        let schema = self.output_schema(self.tree.root())?;
        tracing::debug!(dialect = self.dialect.name(), "compiled flat segment");
        Ok(CompiledSegment {
            stages: Vec::new(),
            final_select: query.render(self.dialect),
            fields,
            schema,
        })
    }

    fn first_stage(
        &mut self,
        renderer: &ExprRenderer<'_>,
        from: &FromClause,
        mut where_clause: Vec<String>,
    ) -> Result<(SqlFragment, Vec<Column>)> {
        let mut query = SelectQuery {
            from: from.relations.clone(),
            ..Default::default()
        };
        query.joins.push(self.dialect.group_set_table(self.tree.nest_count())?);
        query.joins.extend(from.unnests.iter().cloned());
        query.select.push(SelectItem::bare("group_set"));

        let mut columns = Vec::new();
        let mut types = Vec::new();
        for level in self.tree.iter() {
            let subtree = self.tree.subtree(level.id);
            for field in &level.segment.fields {
                if let PlanField::Dimension { name, expr } = field {
                    let typed = renderer.render(expr)?;
                    let sql = if level.id == 0 {
                        typed.sql
                    } else {
                        format!("CASE WHEN {} THEN {} END", in_group_sets(&subtree), typed.sql)
                    };
                    let column = level_column(name, level.id);
                    query
                        .select
                        .push(SelectItem::aliased(sql, self.dialect.quote_identifier(&column)));
                    columns.push(Column {
                        name: column,
                        level: level.id,
                        kind: ColumnKind::Dimension,
                    });
                    types.push(((level.id, name.clone()), typed.ty));
                }
            }
        }
        query.group_by = (1..=query.select.len()).collect();

        for level in self.tree.iter() {
            for field in &level.segment.fields {
                if let PlanField::Aggregate {
                    name,
                    function,
                    expr,
                    filter,
                    source,
                } = field
                {
                    let typed = self.aggregate(
                        renderer,
                        from,
                        Some(level.group_set()),
                        name,
                        *function,
                        expr.as_ref(),
                        filter.as_ref(),
                        source.as_deref(),
                    )?;
                    let column = level_column(name, level.id);
                    query
                        .select
                        .push(SelectItem::aliased(typed.sql, self.dialect.quote_identifier(&column)));
                    columns.push(Column {
                        name: column,
                        level: level.id,
                        kind: ColumnKind::Measure,
                    });
                    types.push(((level.id, name.clone()), typed.ty));
                }
            }
        }

        // Nest filters only drop rows of the nest and its descendants.
        for level in self.tree.iter().skip(1) {
            if level.segment.filters.is_empty() {
                continue;
            }
            let conditions = level
                .segment
                .filters
                .iter()
                .map(|f| renderer.render(f).map(|t| t.sql))
                .collect::<Result<Vec<_>>>()?;
            let subtree = self.tree.subtree(level.id);
            where_clause.push(format!(
                "(group_set NOT IN ({}) OR ({}))",
                join_ids(&subtree),
                conditions.join(" AND ")
            ));
        }
        query.filters = where_clause;

        self.types.extend(types);
        Ok((query.render(self.dialect), columns))
    }

    fn reduction_stage(&self, depth: u32, columns: &mut Vec<Column>) -> Result<SqlFragment> {
        let d = self.dialect;
        let mut query = SelectQuery {
            from: SqlFragment::upstream(),
            ..Default::default()
        };
        let mut kept = Vec::new();
        for column in columns.iter() {
            if self.tree.get(column.level).depth >= depth {
                continue;
            }
            let quoted = d.quote_identifier(&column.name);
            match column.kind {
                ColumnKind::Dimension => {
                    query.select.push(SelectItem::bare(quoted));
                    query.group_by.push(query.select.len());
                }
                ColumnKind::Measure | ColumnKind::Nested => {
                    let value = d.any_value(GroupSet(column.level), &quoted);
                    query.select.push(SelectItem::aliased(value, quoted));
                }
            }
            kept.push(column.clone());
        }

        let mut remap = Vec::new();
        for level in self.tree.at_depth(depth) {
            let parent = parent_of(level)?;
            let column = level_column(&level.name, parent);
            query
                .select
                .push(SelectItem::aliased(self.turtle(level)?, d.quote_identifier(&column)));
            kept.push(Column {
                name: column,
                level: parent,
                kind: ColumnKind::Nested,
            });
            remap.push(format!("WHEN {} THEN {parent}", level.id));
        }
        query.select.push(SelectItem::aliased(
            format!("CASE group_set {} ELSE group_set END", remap.join(" ")),
            "group_set",
        ));
        query.group_by.push(query.select.len());

        *columns = kept;
        Ok(query.render(d))
    }

    fn final_stage(&self) -> Result<(SqlFragment, DialectFieldList)> {
        let d = self.dialect;
        let root = self.tree.root();
        let mut query = SelectQuery {
            from: SqlFragment::upstream(),
            limit: root.segment.limit,
            ..Default::default()
        };
        let mut fields = Vec::new();
        for field in &root.segment.fields {
            let name = field.name();
            let output = d.quote_identifier(name);
            let (sql, field_type) = match field {
                PlanField::Dimension { .. } => {
                    query.group_by.push(query.select.len() + 1);
                    (
                        d.quote_identifier(&level_column(name, 0)),
                        FieldType::Atomic(self.type_of(0, name)?),
                    )
                }
                PlanField::Aggregate { .. } => (
                    d.any_value(GroupSet(0), &d.quote_identifier(&level_column(name, 0))),
                    FieldType::Atomic(self.type_of(0, name)?),
                ),
                PlanField::Nest { segment, .. } => {
                    let child = self.child(root, name)?;
                    (self.turtle(child)?, nest_type(segment))
                }
            };
            query.select.push(SelectItem::aliased(sql.clone(), output.clone()));
            fields.push(DialectField {
                name: name.to_string(),
                sql_expression: sql,
                sql_output_name: output,
                field_type,
            });
        }
        query.order_by = self.order_terms(root, |name| d.quote_identifier(name))?;
        Ok((query.render(d), fields))
    }

    /// Nested column of `level`: an array of records when it has
    /// dimensions, otherwise a single record.
    fn turtle(&self, level: &Level<'_>) -> Result<String> {
        let d = self.dialect;
        let mut fields = Vec::new();
        for field in &level.segment.fields {
            let name = field.name();
            let field_type = match field {
                PlanField::Dimension { .. } | PlanField::Aggregate { .. } => {
                    FieldType::Atomic(self.type_of(level.id, name)?)
                }
                PlanField::Nest { segment, .. } => nest_type(segment),
            };
            fields.push(DialectField {
                name: name.to_string(),
                sql_expression: d.quote_identifier(&level_column(name, level.id)),
                sql_output_name: d.quote_identifier(name),
                field_type,
            });
        }
        if level.segment.has_dimensions() {
            let order = self.order_terms(level, |name| d.quote_identifier(&level_column(name, level.id)))?;
            Ok(d.aggregate_turtle(level.group_set(), &fields, &order, level.segment.limit))
        } else {
            Ok(d.coalesce_measures_inline(level.group_set(), &fields))
        }
    }

    /// Explicit ordering, or the first aggregate descending, or the first
    /// dimension ascending. Segments without dimensions produce one row and
    /// are left unordered.
    fn order_terms(&self, level: &Level<'_>, column: impl Fn(&str) -> String) -> Result<Vec<SortTerm>> {
        let segment = level.segment;
        let requested: Vec<(&str, SortDirection)> = if !segment.order_by.is_empty() {
            segment
                .order_by
                .iter()
                .map(|t| (t.field.as_str(), t.direction))
                .collect()
        } else if !segment.has_dimensions() {
            Vec::new()
        } else if let Some(first) = segment
            .fields
            .iter()
            .find(|f| matches!(f, PlanField::Aggregate { .. }))
        {
            vec![(first.name(), SortDirection::Desc)]
        } else {
            segment
                .fields
                .iter()
                .find(|f| matches!(f, PlanField::Dimension { .. }))
                .map(|f| vec![(f.name(), SortDirection::Asc)])
                .unwrap_or_default()
        };

        requested
            .into_iter()
            .map(|(name, direction)| match segment.fields.iter().find(|f| f.name() == name) {
                Some(PlanField::Nest { .. }) => Err(TurtleError::Validation(format!(
                    "cannot order segment {} by nested field {name}",
                    display_level(level)
                ))),
                Some(_) => Ok(SortTerm {
                    expr: column(name),
                    direction,
                }),
                None => Err(TurtleError::Validation(format!(
                    "segment {} orders by unknown field {name}",
                    display_level(level)
                ))),
            })
            .collect()
    }

    fn output_schema(&self, level: &Level<'_>) -> Result<Vec<FieldDef>> {
        let mut out = Vec::new();
        for field in &level.segment.fields {
            let name = field.name();
            match field {
                PlanField::Dimension { .. } | PlanField::Aggregate { .. } => {
                    out.push(FieldDef::atomic(name, self.type_of(level.id, name)?));
                }
                PlanField::Nest { segment, .. } => {
                    let child = self.child(level, name)?;
                    out.push(FieldDef::Struct(StructDef::nested(
                        name,
                        segment.has_dimensions(),
                        self.output_schema(child)?,
                    )));
                }
            }
        }
        Ok(out)
    }

    fn child(&self, level: &Level<'_>, name: &str) -> Result<&Level<'a>> {
        self.tree
            .child_named(level.id, name)
            .ok_or_else(|| TurtleError::Validation(format!("unknown nest {name}")))
    }

    fn type_of(&self, level: u32, name: &str) -> Result<AtomicType> {
        self.types
            .get(&(level, name.to_string()))
            .copied()
            .ok_or_else(|| TurtleError::Validation(format!("field {name} was never rendered")))
    }
}

fn is_fanout_sensitive(function: AggregateFunction) -> bool {
    matches!(
        function,
        AggregateFunction::Count | AggregateFunction::Sum | AggregateFunction::Avg
    )
}

fn nest_type(segment: &Segment) -> FieldType {
    if segment.has_dimensions() {
        FieldType::Array
    } else {
        FieldType::Record
    }
}

fn parent_of(level: &Level<'_>) -> Result<u32> {
    level
        .parent
        .ok_or_else(|| TurtleError::Validation("the root segment has no parent".to_string()))
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn in_group_sets(ids: &[u32]) -> String {
    match ids {
        [only] => format!("group_set = {only}"),
        _ => format!("group_set IN ({})", join_ids(ids)),
    }
}

fn display_level(level: &Level<'_>) -> String {
    if level.name.is_empty() {
        "<root>".to_string()
    } else {
        level.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_set_membership_uses_equality_for_leaves() {
        assert_eq!(in_group_sets(&[3]), "group_set = 3");
        assert_eq!(in_group_sets(&[1, 2, 4]), "group_set IN (1,2,4)");
    }

    #[test]
    fn fan_out_only_affects_additive_aggregates() {
        assert!(is_fanout_sensitive(AggregateFunction::Sum));
        assert!(!is_fanout_sensitive(AggregateFunction::CountDistinct));
        assert!(!is_fanout_sensitive(AggregateFunction::Max));
    }
}
