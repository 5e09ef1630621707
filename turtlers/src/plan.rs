//! Query plan handed to the compiler.
//!
//! The plan is already decided: join order, predicates and nesting come from
//! the planner. The compiler only renders it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurtleError};
use crate::model::{
    AlterOp, AtomicType, ExtractUnit, Sampling, SortDirection, StructDef, TimeFieldType,
    TimestampUnit,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub source: SourceRef,
    #[serde(default)]
    pub joins: Vec<JoinPlan>,
    #[serde(default)]
    pub unnests: Vec<UnnestPlan>,
    #[serde(default)]
    pub filters: Vec<Expr>,
    pub segment: Segment,
    /// Stages that read the output of the stage before them.
    #[serde(default)]
    pub pipeline: Vec<PipelineStage>,
}

/// Inline struct definition, or the name of one held by a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StructRef {
    Inline(StructDef),
    Named(String),
}

impl StructRef {
    pub fn resolved(&self) -> Result<&StructDef> {
        match self {
            StructRef::Inline(def) => Ok(def),
            StructRef::Named(name) => Err(TurtleError::Validation(format!(
                "struct {name} has not been resolved against a registry"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub alias: String,
    #[serde(rename = "struct")]
    pub structure: StructRef,
    #[serde(default)]
    pub sampling: Sampling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Left,
    Inner,
    Right,
    Full,
}

impl JoinKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Inner => "JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
        }
    }
}

/// Cardinality of a join, read from the parent alias to the joined alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRelationship {
    ManyToOne,
    OneToMany,
    OneToOne,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPlan {
    pub alias: String,
    #[serde(rename = "struct")]
    pub structure: StructRef,
    /// Alias this join hangs off; the source alias when omitted.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub kind: JoinKind,
    pub relationship: JoinRelationship,
    pub on: Expr,
    #[serde(default)]
    pub sampling: Sampling,
}

/// Explode the array field `field` of `parent` into rows named `alias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnnestPlan {
    pub alias: String,
    pub parent: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Segment {
    pub fields: Vec<PlanField>,
    /// Filters limited to this segment's rows (and its nests).
    #[serde(default)]
    pub filters: Vec<Expr>,
    #[serde(default)]
    pub order_by: Vec<OrderTerm>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanField {
    Dimension {
        name: String,
        expr: Expr,
    },
    Aggregate {
        name: String,
        function: AggregateFunction,
        #[serde(default)]
        expr: Option<Expr>,
        #[serde(default)]
        filter: Option<Expr>,
        /// Alias whose grain the aggregate is computed at.
        #[serde(default)]
        source: Option<String>,
    },
    Nest {
        name: String,
        segment: Segment,
    },
}

impl PlanField {
    pub fn name(&self) -> &str {
        match self {
            PlanField::Dimension { name, .. }
            | PlanField::Aggregate { name, .. }
            | PlanField::Nest { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTerm {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub alias: String,
    #[serde(default)]
    pub source: StageSource,
    #[serde(default)]
    pub unnests: Vec<UnnestPlan>,
    #[serde(default)]
    pub filters: Vec<Expr>,
    pub segment: Segment,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageSource {
    /// Rows of the previous stage.
    #[default]
    Previous,
    /// Elements of a nested column of the previous stage.
    NestedArray {
        field: String,
        #[serde(default)]
        singleton: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Like,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Like => "LIKE",
        }
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div)
    }
}

/// Scalar expressions over the aliases of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    /// `alias.path[0]...path[n].name`, where `path` walks nested records.
    Field {
        alias: String,
        name: String,
        #[serde(default)]
        path: Vec<String>,
    },
    Literal {
        value: serde_json::Value,
    },
    Time {
        value: String,
        time_type: TimeFieldType,
        #[serde(default)]
        timezone: Option<String>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not {
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        #[serde(default)]
        negated: bool,
    },
    Cast {
        expr: Box<Expr>,
        to: AtomicType,
        #[serde(default)]
        safe: bool,
    },
    Trunc {
        expr: Box<Expr>,
        unit: TimestampUnit,
    },
    Extract {
        expr: Box<Expr>,
        unit: ExtractUnit,
    },
    TimeDiff {
        unit: TimestampUnit,
        from: Box<Expr>,
        to: Box<Expr>,
    },
    AlterTime {
        expr: Box<Expr>,
        op: AlterOp,
        amount: Box<Expr>,
        unit: TimestampUnit,
    },
    RegexpMatch {
        expr: Box<Expr>,
        pattern: String,
    },
    Now,
    Uuid,
    DateToString {
        expr: Box<Expr>,
    },
    /// Plain function call passed through unchanged.
    Call {
        function: String,
        #[serde(default)]
        args: Vec<Expr>,
        #[serde(default)]
        returns: Option<AtomicType>,
    },
}

impl Expr {
    pub fn field(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Field {
            alias: alias.into(),
            name: name.into(),
            path: Vec::new(),
        }
    }

    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn eq(left: Expr, right: Expr) -> Self {
        Self::binary(BinaryOp::Eq, left, right)
    }

    /// Aliases referenced anywhere in the expression, in first-seen order.
    pub fn aliases(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_aliases(&mut out);
        out
    }

    fn collect_aliases<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Field { alias, .. } => {
                if !out.contains(&alias.as_str()) {
                    out.push(alias);
                }
            }
            Expr::Literal { .. } | Expr::Time { .. } | Expr::Now | Expr::Uuid => {}
            Expr::Binary { left, right, .. } => {
                left.collect_aliases(out);
                right.collect_aliases(out);
            }
            Expr::TimeDiff { from, to, .. } => {
                from.collect_aliases(out);
                to.collect_aliases(out);
            }
            Expr::AlterTime { expr, amount, .. } => {
                expr.collect_aliases(out);
                amount.collect_aliases(out);
            }
            Expr::Not { expr }
            | Expr::IsNull { expr, .. }
            | Expr::Cast { expr, .. }
            | Expr::Trunc { expr, .. }
            | Expr::Extract { expr, .. }
            | Expr::RegexpMatch { expr, .. }
            | Expr::DateToString { expr } => expr.collect_aliases(out),
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_aliases(out);
                }
            }
        }
    }
}

impl Segment {
    pub fn new(fields: Vec<PlanField>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    pub fn has_dimensions(&self) -> bool {
        self.fields
            .iter()
            .any(|f| matches!(f, PlanField::Dimension { .. }))
    }

    pub fn nests(&self) -> impl Iterator<Item = (&str, &Segment)> {
        self.fields.iter().filter_map(|f| match f {
            PlanField::Nest { name, segment } => Some((name.as_str(), segment)),
            _ => None,
        })
    }

    /// Number of nests at any depth.
    pub fn nest_count(&self) -> usize {
        self.nests().map(|(_, s)| 1 + s.nest_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_deserializes_from_json() {
        let json = r#"{
            "source": {"alias": "o", "struct": "orders"},
            "segment": {
                "fields": [
                    {"kind": "dimension", "name": "status", "expr": {"type": "field", "alias": "o", "name": "status"}},
                    {"kind": "aggregate", "name": "order_count", "function": "count"},
                    {"kind": "nest", "name": "by_city", "segment": {"fields": [
                        {"kind": "dimension", "name": "city", "expr": {"type": "field", "alias": "o", "name": "city"}}
                    ], "limit": 3}}
                ],
                "order_by": [{"field": "order_count", "direction": "desc"}]
            }
        }"#;
        let plan: QueryPlan = serde_json::from_str(json).unwrap();
        assert_eq!(plan.source.structure, StructRef::Named("orders".to_string()));
        assert_eq!(plan.segment.nest_count(), 1);
        assert_eq!(plan.segment.order_by[0].direction, SortDirection::Desc);
        assert!(plan.pipeline.is_empty());
    }

    #[test]
    fn aliases_are_collected_once() {
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::field("o", "a"),
            Expr::binary(BinaryOp::Mul, Expr::field("c", "b"), Expr::field("o", "c")),
        );
        assert_eq!(expr.aliases(), vec!["o", "c"]);
    }
}
