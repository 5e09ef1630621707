//! Deferred stage naming for multi-stage queries.
//!
//! A stage body is rendered before the name of the stage it reads from is
//! known. Instead of a textual token that is patched later, the reference is a
//! typed [`Piece::Upstream`] slot that [`StageAssembler`] fills once the
//! upstream stage has been named.

use crate::dialect::Dialect;
use crate::error::{Result, TurtleError};
use crate::naming::NamingContext;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Upstream,
}

/// SQL text with zero or more references to the upstream stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlFragment {
    pieces: Vec<Piece>,
}

impl SqlFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(sql: impl Into<String>) -> Self {
        let mut fragment = Self::new();
        fragment.push_str(sql);
        fragment
    }

    /// Fragment consisting of just the upstream reference.
    pub fn upstream() -> Self {
        let mut fragment = Self::new();
        fragment.push_upstream();
        fragment
    }

    pub fn push_str(&mut self, sql: impl Into<String>) -> &mut Self {
        let sql = sql.into();
        if sql.is_empty() {
            return self;
        }
        match self.pieces.last_mut() {
            Some(Piece::Text(existing)) => existing.push_str(&sql),
            _ => self.pieces.push(Piece::Text(sql)),
        }
        self
    }

    pub fn push_upstream(&mut self) -> &mut Self {
        self.pieces.push(Piece::Upstream);
        self
    }

    pub fn push_fragment(&mut self, other: &SqlFragment) -> &mut Self {
        for piece in &other.pieces {
            match piece {
                Piece::Text(sql) => {
                    self.push_str(sql.clone());
                }
                Piece::Upstream => {
                    self.push_upstream();
                }
            }
        }
        self
    }

    pub fn has_upstream(&self) -> bool {
        self.pieces.iter().any(|p| matches!(p, Piece::Upstream))
    }

    /// Render with every upstream slot bound to `upstream`.
    ///
    /// Fails when the fragment has no slot to bind.
    pub fn resolve(&self, upstream: &str) -> Result<String> {
        if !self.has_upstream() {
            return Err(TurtleError::UnresolvedPlaceholder {
                stage: upstream.to_string(),
            });
        }
        Ok(self.render_with(upstream))
    }

    /// Render a fragment that may or may not read from an upstream stage.
    pub fn render(&self, upstream: Option<&str>) -> Result<String> {
        match upstream {
            Some(name) => Ok(self.render_with(name)),
            None if self.has_upstream() => Err(TurtleError::UnresolvedPlaceholder {
                stage: "<none>".to_string(),
            }),
            None => Ok(self.render_with("")),
        }
    }

    fn render_with(&self, upstream: &str) -> String {
        let mut sql = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => sql.push_str(text),
                Piece::Upstream => sql.push_str(upstream),
            }
        }
        sql
    }
}

impl From<String> for SqlFragment {
    fn from(sql: String) -> Self {
        SqlFragment::text(sql)
    }
}

impl From<&str> for SqlFragment {
    fn from(sql: &str) -> Self {
        SqlFragment::text(sql)
    }
}

/// Names stages and assembles `WITH ... SELECT`.
pub struct StageAssembler<'n> {
    naming: &'n mut NamingContext,
    stages: Vec<(String, String)>,
}

impl<'n> StageAssembler<'n> {
    pub fn new(naming: &'n mut NamingContext) -> Self {
        Self {
            naming,
            stages: Vec::new(),
        }
    }

    pub fn last_stage(&self) -> Option<&str> {
        self.stages.last().map(|(name, _)| name.as_str())
    }

    /// Name `body`, binding its upstream slots to the previous stage.
    pub fn add_stage(&mut self, body: &SqlFragment) -> Result<String> {
        let sql = body.render(self.last_stage())?;
        Ok(self.push(sql))
    }

    /// Name a body that must read the previous stage; `dialect` binds it.
    pub fn add_pipelined_stage(&mut self, dialect: &dyn Dialect, body: &SqlFragment) -> Result<String> {
        let sql = dialect.pipelined_stage(body, self.require_last()?)?;
        Ok(self.push(sql))
    }

    fn push(&mut self, sql: String) -> String {
        let name = self.naming.next_stage_name();
        tracing::trace!(stage = name.as_str(), "named pipeline stage");
        self.stages.push((name.clone(), sql));
        name
    }

    fn require_last(&self) -> Result<&str> {
        self.last_stage().ok_or_else(|| TurtleError::UnresolvedPlaceholder {
            stage: "<none>".to_string(),
        })
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn finish(self, final_select: &SqlFragment) -> Result<String> {
        let body = final_select.render(self.last_stage())?;
        Ok(self.assemble(body))
    }

    /// `finish` for a final select that must read the previous stage.
    pub fn finish_pipelined(self, dialect: &dyn Dialect, final_select: &SqlFragment) -> Result<String> {
        let body = dialect.pipelined_stage(final_select, self.require_last()?)?;
        Ok(self.assemble(body))
    }

    fn assemble(self, body: String) -> String {
        if self.stages.is_empty() {
            return body;
        }
        let ctes: Vec<String> = self
            .stages
            .iter()
            .map(|(name, sql)| format!("{name} AS (\n{sql}\n)"))
            .collect();
        format!("WITH {}\n{body}", ctes.join(",\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_requires_a_slot() {
        let fragment = SqlFragment::text("SELECT 1");
        let err = fragment.resolve("__stage0").unwrap_err();
        assert!(matches!(err, TurtleError::UnresolvedPlaceholder { stage } if stage == "__stage0"));
    }

    #[test]
    fn assembler_binds_each_stage_to_its_predecessor() {
        let mut naming = NamingContext::new();
        let mut assembler = StageAssembler::new(&mut naming);
        assembler
            .add_stage(&SqlFragment::text("SELECT 1 AS x"))
            .unwrap();
        let mut second = SqlFragment::text("SELECT x + 1 AS x FROM ");
        second.push_upstream();
        assembler.add_stage(&second).unwrap();
        let mut last = SqlFragment::text("SELECT * FROM ");
        last.push_upstream();
        let sql = assembler.finish(&last).unwrap();
        assert_eq!(
            sql,
            "WITH __stage0 AS (\nSELECT 1 AS x\n),\n__stage1 AS (\nSELECT x + 1 AS x FROM __stage0\n)\nSELECT * FROM __stage1"
        );
    }

    #[test]
    fn first_stage_cannot_read_upstream() {
        let mut naming = NamingContext::new();
        let mut assembler = StageAssembler::new(&mut naming);
        let err = assembler.add_stage(&SqlFragment::upstream()).unwrap_err();
        assert!(matches!(err, TurtleError::UnresolvedPlaceholder { .. }));
    }

    #[test]
    fn pipelined_stages_must_read_upstream() {
        let dialect = crate::dialect::DuckDbDialect::default();
        let mut naming = NamingContext::new();
        let mut assembler = StageAssembler::new(&mut naming);
        let err = assembler
            .add_pipelined_stage(&dialect, &SqlFragment::upstream())
            .unwrap_err();
        assert!(matches!(err, TurtleError::UnresolvedPlaceholder { .. }));

        assembler.add_stage(&SqlFragment::text("SELECT 1 AS x")).unwrap();
        let err = assembler
            .add_pipelined_stage(&dialect, &SqlFragment::text("SELECT 2 AS x"))
            .unwrap_err();
        assert!(matches!(err, TurtleError::UnresolvedPlaceholder { stage } if stage == "__stage0"));

        let mut last = SqlFragment::text("SELECT x FROM ");
        last.push_upstream();
        let sql = assembler.finish_pipelined(&dialect, &last).unwrap();
        assert!(sql.ends_with("SELECT x FROM __stage0"));
    }
}
