//! Query plan to SQL.
//!
//! [`SqlCompiler`] renders a [`QueryPlan`] for one dialect. A plan with
//! nests becomes a chain of stages (see `stages`), a pipeline appends the
//! stages of each following segment, and [`StageAssembler`] names the chain
//! into one `WITH` statement.

use serde::{Deserialize, Serialize};

use crate::dialect::Dialect;
use crate::error::Result;
use crate::fragment::StageAssembler;
use crate::model::{DialectFieldList, FieldDef, StructDef, StructRelationship, StructSource};
use crate::naming::NamingContext;
use crate::plan::QueryPlan;
use crate::symmetric::DEFAULT_PRECISION;

mod expressions;
mod fanout;
mod levels;
mod scope;
mod select;
mod stages;

use scope::Scope;
use stages::{CompiledSegment, SegmentCompiler};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Precision `ε` of fan-out safe sums.
    pub symmetric_precision: f64,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            symmetric_precision: DEFAULT_PRECISION,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    /// Output columns of the last stage, in order.
    pub fields: DialectFieldList,
    /// Output shape, usable as the source of another query.
    pub schema: StructDef,
}

pub struct SqlCompiler<'d> {
    dialect: &'d dyn Dialect,
    options: CompileOptions,
}

impl<'d> SqlCompiler<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self {
            dialect,
            options: CompileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect
    }

    pub fn compile(&self, plan: &QueryPlan) -> Result<CompiledQuery> {
        let mut naming = NamingContext::new();
        self.compile_with(plan, &mut naming)
    }

    /// Compile using an existing naming context, e.g. when several queries
    /// end up in one statement.
    pub fn compile_with(&self, plan: &QueryPlan, naming: &mut NamingContext) -> Result<CompiledQuery> {
        let precision = self.options.symmetric_precision;
        let mut assembler = StageAssembler::new(naming);

        let scope = Scope::for_plan(plan, self.dialect)?;
        let mut compiled =
            SegmentCompiler::new(self.dialect, &scope, precision, &plan.segment, &plan.filters)
                .compile()?;

        let mut pipelined = None;
        for stage in &plan.pipeline {
            push_stages(&mut assembler, &compiled, pipelined)?;
            // The previous segment's output becomes a named stage too.
            match pipelined {
                Some(dialect) => assembler.add_pipelined_stage(dialect, &compiled.final_select)?,
                None => assembler.add_stage(&compiled.final_select)?,
            };
            let upstream = output_struct(&stage.alias, compiled.schema.clone(), None);
            let scope = Scope::for_stage(stage, upstream, self.dialect)?;
            compiled =
                SegmentCompiler::new(self.dialect, &scope, precision, &stage.segment, &stage.filters)
                    .compile()?;
            // Every stage of a later segment reads the one before it.
            pipelined = Some(self.dialect);
        }

        push_stages(&mut assembler, &compiled, pipelined)?;
        let stage_count = assembler.stage_count();
        let sql = match pipelined {
            Some(dialect) => assembler.finish_pipelined(dialect, &compiled.final_select)?,
            None => assembler.finish(&compiled.final_select)?,
        };
        tracing::debug!(
            dialect = self.dialect.name(),
            stages = stage_count,
            pipeline = plan.pipeline.len(),
            "compiled query plan"
        );
        let schema = output_struct("query_result", compiled.schema, Some(sql.clone()));
        Ok(CompiledQuery {
            sql,
            fields: compiled.fields,
            schema,
        })
    }
}

fn push_stages(
    assembler: &mut StageAssembler<'_>,
    compiled: &CompiledSegment,
    pipelined: Option<&dyn Dialect>,
) -> Result<()> {
    for stage in &compiled.stages {
        match pipelined {
            Some(dialect) => assembler.add_pipelined_stage(dialect, stage)?,
            None => assembler.add_stage(stage)?,
        };
    }
    Ok(())
}

fn output_struct(name: &str, fields: Vec<FieldDef>, select: Option<String>) -> StructDef {
    StructDef {
        name: name.to_string(),
        fields,
        struct_source: match select {
            Some(select) => StructSource::SqlSubquery { select },
            None => StructSource::Nested,
        },
        struct_relationship: StructRelationship::Inline,
        primary_key: None,
    }
}
