use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;

use crate::error::{Result, TurtleError};
use crate::model::StructDef;
use crate::plan::{QueryPlan, StructRef};

/// Struct definitions and stored query plans loaded from disk.
///
/// Layout: `sources/*.yml` holds one StructDef per file, keyed by its
/// `name`; `queries/*.{json,yml,yaml}` holds query plans keyed by file stem.
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    pub structs: HashMap<String, StructDef>,
    pub queries: HashMap<String, QueryPlan>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(structs: Vec<StructDef>, queries: Vec<(String, QueryPlan)>) -> Self {
        let mut registry = ModelRegistry::new();
        for def in structs {
            registry.structs.insert(def.name.clone(), def);
        }
        registry.queries.extend(queries);
        registry
    }

    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let mut registry = ModelRegistry::new();
        registry.load_sources(root.as_ref().join("sources"))?;
        let queries = root.as_ref().join("queries");
        if queries.exists() {
            registry.load_queries(queries)?;
        }
        tracing::debug!(
            structs = registry.structs.len(),
            queries = registry.queries.len(),
            "loaded model registry"
        );
        Ok(registry)
    }

    fn load_sources(&mut self, dir: PathBuf) -> Result<()> {
        if !dir.exists() {
            return Err(TurtleError::Validation(format!(
                "sources directory not found: {}",
                dir.display()
            )));
        }
        for path in files_with_extensions(&dir, &["yml", "yaml"])? {
            let contents = fs::read_to_string(&path)?;
            let def: StructDef = serde_yaml::from_str(&contents)?;
            if let Some(previous) = self.structs.insert(def.name.clone(), def) {
                return Err(TurtleError::Validation(format!(
                    "struct {} defined more than once ({})",
                    previous.name,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn load_queries(&mut self, dir: PathBuf) -> Result<()> {
        for path in files_with_extensions(&dir, &["json", "yml", "yaml"])? {
            let contents = fs::read_to_string(&path)?;
            let plan: QueryPlan = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => serde_json::from_str(&contents)?,
                _ => serde_yaml::from_str(&contents)?,
            };
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| TurtleError::Validation(format!("bad query file name {}", path.display())))?
                .to_string();
            self.queries.insert(name, plan);
        }
        Ok(())
    }

    pub fn get_struct(&self, name: &str) -> Option<&StructDef> {
        self.structs.get(name)
    }

    pub fn get_query(&self, name: &str) -> Option<&QueryPlan> {
        self.queries.get(name)
    }

    /// Copy of `plan` with every named struct replaced by its definition.
    pub fn resolve_plan(&self, plan: &QueryPlan) -> Result<QueryPlan> {
        let mut resolved = plan.clone();
        self.resolve_ref(&mut resolved.source.structure)?;
        for join in &mut resolved.joins {
            self.resolve_ref(&mut join.structure)?;
        }
        Ok(resolved)
    }

    /// Stored query `name`, resolved.
    pub fn query(&self, name: &str) -> Result<QueryPlan> {
        let plan = self
            .get_query(name)
            .ok_or_else(|| TurtleError::Validation(format!("unknown query {name}")))?;
        self.resolve_plan(plan)
    }

    fn resolve_ref(&self, structure: &mut StructRef) -> Result<()> {
        if let StructRef::Named(name) = structure {
            let def = self
                .get_struct(name)
                .ok_or_else(|| TurtleError::Validation(format!("unknown struct {name}")))?;
            *structure = StructRef::Inline(def.clone());
        }
        Ok(())
    }
}

fn files_with_extensions(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for ext in extensions {
        let pattern = format!("{}/*.{ext}", dir.display());
        files.extend(
            glob(&pattern)
                .map_err(|e| TurtleError::Other(e.into()))?
                .flatten(),
        );
    }
    files.sort();
    Ok(files)
}
