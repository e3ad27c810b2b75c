use skilldeck_core::{Category, SkillError, WorkflowId};
use skilldeck_skills::{MatchTarget, SkillRegistry, TriggerMatcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::definition::WorkflowDefinition;

/// A workflow file that failed to load or validate.
#[derive(Debug, Clone)]
pub struct CatalogIssue {
    pub path: PathBuf,
    pub reason: String,
}

/// All validated workflow definitions, shared by every run.
#[derive(Default)]
pub struct WorkflowCatalog {
    workflows: Vec<Arc<WorkflowDefinition>>,
    index: HashMap<WorkflowId, usize>,
    dirs: Vec<(PathBuf, Category)>,
    issues: Vec<CatalogIssue>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// User directories are scanned before system ones, so a user workflow
    /// shadows a system workflow with the same id.
    pub fn with_dirs(system_dirs: &[PathBuf], user_dirs: &[PathBuf]) -> Self {
        let dirs = user_dirs
            .iter()
            .map(|d| (d.clone(), Category::User))
            .chain(system_dirs.iter().map(|d| (d.clone(), Category::System)))
            .collect();
        Self {
            dirs,
            ..Self::new()
        }
    }

    /// Load every `*.toml` workflow and validate it against `registry`.
    ///
    /// Invalid files are logged and recorded in [`issues`](Self::issues)
    /// rather than failing the whole load.
    pub fn discover(&mut self, registry: &SkillRegistry) -> skilldeck_core::Result<Vec<WorkflowId>> {
        let mut loaded = Vec::new();

        for (dir, category) in self.dirs.clone() {
            if !dir.exists() {
                debug!(?dir, "workflows directory does not exist, skipping");
                continue;
            }

            for path in workflow_files(&dir)? {
                let def = match WorkflowDefinition::from_file(&path, category) {
                    Ok(def) => def,
                    Err(e) => {
                        warn!(?path, error = %e, "failed to load workflow");
                        self.issues.push(CatalogIssue {
                            path,
                            reason: e.to_string(),
                        });
                        continue;
                    }
                };

                if self.index.contains_key(&def.id) {
                    warn!(workflow = %def.id, ?path, "workflow id already loaded, skipping");
                    continue;
                }

                let id = def.id.clone();
                match self.register(def, registry) {
                    Ok(()) => {
                        info!(workflow = %id, %category, ?path, "loaded workflow");
                        loaded.push(id);
                    }
                    Err(e) => {
                        warn!(?path, error = %e, "workflow failed validation");
                        self.issues.push(CatalogIssue {
                            path,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(loaded)
    }

    /// Validate and add a definition. Fails on an id clash.
    pub fn register(
        &mut self,
        def: WorkflowDefinition,
        registry: &SkillRegistry,
    ) -> skilldeck_core::Result<()> {
        if self.index.contains_key(&def.id) {
            return Err(SkillError::InvalidWorkflow {
                workflow: def.id.clone(),
                reason: "a workflow with this id is already registered".into(),
            });
        }
        def.validate(registry)?;
        self.index.insert(def.id.clone(), self.workflows.len());
        self.workflows.push(Arc::new(def));
        Ok(())
    }

    pub fn get(&self, id: &str) -> skilldeck_core::Result<Arc<WorkflowDefinition>> {
        self.index
            .get(id)
            .map(|&i| Arc::clone(&self.workflows[i]))
            .ok_or_else(|| SkillError::UnknownWorkflow(id.to_string()))
    }

    pub fn list(&self) -> &[Arc<WorkflowDefinition>] {
        &self.workflows
    }

    pub fn issues(&self) -> &[CatalogIssue] {
        &self.issues
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Make workflow trigger phrases matchable alongside skill triggers.
    pub fn add_triggers(&self, matcher: &mut TriggerMatcher) {
        for def in &self.workflows {
            for phrase in &def.triggers {
                matcher.add(phrase, MatchTarget::Workflow(def.id.clone()), def.category);
            }
        }
    }
}

fn workflow_files(dir: &Path) -> skilldeck_core::Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        SkillError::Config(format!("failed to read workflows dir {}: {}", dir.display(), e))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
