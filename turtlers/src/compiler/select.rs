//! Minimal SELECT assembly over already rendered expressions.

use crate::dialect::Dialect;
use crate::fragment::SqlFragment;
use crate::model::SortTerm;

#[derive(Debug, Clone)]
pub(crate) struct SelectItem {
    pub expr: String,
    /// Quoted output name.
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn aliased(expr: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn bare(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            alias: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SelectQuery {
    pub select: Vec<SelectItem>,
    pub from: SqlFragment,
    /// Clauses following the FROM relation, one per line.
    pub joins: Vec<String>,
    pub filters: Vec<String>,
    /// 1-based select positions.
    pub group_by: Vec<usize>,
    pub order_by: Vec<SortTerm>,
    pub limit: Option<u64>,
}

impl SelectQuery {
    pub fn render(&self, dialect: &dyn Dialect) -> SqlFragment {
        let items: Vec<String> = self
            .select
            .iter()
            .map(|item| match &item.alias {
                Some(alias) if *alias != item.expr => format!("{} AS {alias}", item.expr),
                _ => item.expr.clone(),
            })
            .collect();

        let mut sql = SqlFragment::text(format!("SELECT\n  {}\nFROM ", items.join(",\n  ")));
        sql.push_fragment(&self.from);

        for join in &self.joins {
            sql.push_str(format!("\n{join}"));
        }
        if !self.filters.is_empty() {
            sql.push_str(format!("\nWHERE {}", self.filters.join("\n  AND ")));
        }
        if !self.group_by.is_empty() {
            let positions: Vec<String> = self.group_by.iter().map(|p| p.to_string()).collect();
            sql.push_str(format!("\nGROUP BY {}", positions.join(",")));
        }
        let order = dialect.order_by(&self.order_by);
        if !order.is_empty() {
            sql.push_str(format!("\n{order}"));
        }
        if let Some(limit) = self.limit {
            sql.push_str(format!("\nLIMIT {limit}"));
        }
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DuckDbDialect;
    use crate::model::SortDirection;

    #[test]
    fn renders_clauses_in_order() {
        let query = SelectQuery {
            select: vec![
                SelectItem::aliased("o.\"status\"", "\"status\""),
                SelectItem::aliased("COUNT(1)", "\"n\""),
            ],
            from: SqlFragment::text("orders AS o"),
            joins: vec!["LEFT JOIN users AS u ON (o.\"user_id\" = u.\"id\")".to_string()],
            filters: vec!["(o.\"amount\" > 0)".to_string()],
            group_by: vec![1],
            order_by: vec![SortTerm {
                expr: "\"n\"".to_string(),
                direction: SortDirection::Desc,
            }],
            limit: Some(10),
        };
        let sql = query
            .render(&DuckDbDialect::default())
            .render(None)
            .unwrap();
        assert_eq!(
            sql,
            "SELECT\n  o.\"status\" AS \"status\",\n  COUNT(1) AS \"n\"\nFROM orders AS o\nLEFT JOIN users AS u ON (o.\"user_id\" = u.\"id\")\nWHERE (o.\"amount\" > 0)\nGROUP BY 1\nORDER BY \"n\" DESC NULLS LAST\nLIMIT 10"
        );
    }

    #[test]
    fn identical_alias_is_not_repeated() {
        let query = SelectQuery {
            select: vec![SelectItem::aliased("\"group_set\"", "\"group_set\"")],
            from: SqlFragment::upstream(),
            ..Default::default()
        };
        let sql = query
            .render(&DuckDbDialect::default())
            .render(Some("__stage0"))
            .unwrap();
        assert_eq!(sql, "SELECT\n  \"group_set\"\nFROM __stage0");
    }
}
