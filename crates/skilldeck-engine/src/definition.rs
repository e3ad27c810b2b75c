use serde::{Deserialize, Serialize};
use serde_json::Value;
use skilldeck_core::{Category, InvocationContract, ParamSpec, SkillError, SkillId, WorkflowId};
use skilldeck_skills::SkillRegistry;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

/// Partial retry settings; unset fields inherit from the enclosing policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: Option<u32>,
    pub delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_delay_ms: Option<u64>,
}

/// How one step parameter is produced.
///
/// ```toml
/// [steps.inputs]
/// channel = { value = "#standup" }
/// client = { input = "client" }
/// tasks = { from = "fetch", path = "items" }
/// days = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Binding {
    /// An explicit constant.
    Value { value: Value },
    /// A parameter supplied when the run was started.
    Input { input: String },
    /// (Part of) the output of an earlier step.
    From {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Shorthand for a constant.
    Literal(Value),
}

impl Binding {
    pub fn source_step(&self) -> Option<&str> {
        match self {
            Binding::From { from, .. } => Some(from),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub skill: SkillId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Pause for human review after this step succeeds.
    #[serde(default)]
    pub checkpoint: bool,
    /// Steps that must succeed first even though no output is consumed.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Binding>,
}

impl WorkflowStep {
    /// Every earlier step this one needs: binding sources plus `depends_on`.
    pub fn dependencies(&self) -> BTreeSet<&str> {
        self.inputs
            .values()
            .filter_map(Binding::source_step)
            .chain(self.depends_on.iter().map(String::as_str))
            .collect()
    }
}

fn default_category() -> Category {
    Category::System
}

/// A static, validated sequence of skill invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    /// Run parameters in the compact `name:type?` form used by skills.
    #[serde(default)]
    pub params: Vec<String>,
    /// Overrides `engine.continue_on_error` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,
    /// Run-level retry defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(skip, default = "default_category")]
    pub category: Category,
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl WorkflowDefinition {
    pub fn from_toml(content: &str, category: Category) -> skilldeck_core::Result<Self> {
        Self::parse(content, category)
            .map_err(|e| SkillError::Config(format!("invalid workflow definition: {e}")))
    }

    pub fn from_file(path: &Path, category: Category) -> skilldeck_core::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut def = Self::parse(&content, category)
            .map_err(|e| SkillError::Config(format!("{}: {}", path.display(), e)))?;
        def.path = Some(path.to_path_buf());
        Ok(def)
    }

    fn parse(content: &str, category: Category) -> Result<Self, toml::de::Error> {
        let mut def: WorkflowDefinition = toml::from_str(content)?;
        if def.name.is_empty() {
            def.name = def.id.clone();
        }
        def.category = category;
        Ok(def)
    }

    /// The run-parameter contract declared by `params`.
    pub fn contract(&self) -> skilldeck_core::Result<InvocationContract> {
        Ok(InvocationContract {
            params: self
                .params
                .iter()
                .map(|p| ParamSpec::parse(p))
                .collect::<skilldeck_core::Result<_>>()?,
            result: None,
        })
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Definition-time checks, run before any run of this workflow starts.
    pub fn validate(&self, registry: &SkillRegistry) -> skilldeck_core::Result<()> {
        let invalid = |reason: String| SkillError::InvalidWorkflow {
            workflow: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("workflow id is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(invalid("workflow has no steps".into()));
        }
        let contract = self.contract().map_err(|e| invalid(e.message()))?;

        let mut earlier: HashSet<&str> = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            let at = format!("step {} ('{}')", index + 1, step.id);
            if step.id.trim().is_empty() {
                return Err(invalid(format!("step {} has no id", index + 1)));
            }
            if earlier.contains(step.id.as_str()) {
                return Err(invalid(format!("{at}: duplicate step id")));
            }

            let skill = registry
                .resolve(&step.skill)
                .map_err(|_| invalid(format!("{at}: unknown skill '{}'", step.skill)))?;
            if !skill.is_invocable() {
                return Err(invalid(format!(
                    "{at}: '{}' is a shared library and cannot be a step",
                    step.skill
                )));
            }

            for dep in step.dependencies() {
                if !earlier.contains(dep) {
                    return Err(invalid(format!(
                        "{at}: depends on '{dep}', which is not an earlier step"
                    )));
                }
            }

            for (param, binding) in &step.inputs {
                if let Binding::Input { input } = binding {
                    if !contract.params.is_empty() && contract.param(input).is_none() {
                        return Err(invalid(format!(
                            "{at}: input '{param}' reads undeclared run parameter '{input}'"
                        )));
                    }
                }
                if !skill.contract.params.is_empty() && skill.contract.param(param).is_none() {
                    return Err(invalid(format!(
                        "{at}: skill '{}' has no parameter '{param}'",
                        step.skill
                    )));
                }
            }

            earlier.insert(step.id.as_str());
        }
        Ok(())
    }
}

/// Resolve a step's inputs against run parameters and earlier outputs.
pub fn resolve_binding(
    binding: &Binding,
    inputs: &skilldeck_core::Params,
    output_of: impl Fn(&str) -> Option<Value>,
) -> skilldeck_core::Result<Value> {
    match binding {
        Binding::Value { value } | Binding::Literal(value) => Ok(value.clone()),
        Binding::Input { input } => inputs
            .get(input)
            .cloned()
            .ok_or_else(|| SkillError::Validation(format!("run parameter '{input}' was not supplied"))),
        Binding::From { from, path } => {
            let output = output_of(from).ok_or_else(|| {
                SkillError::Validation(format!("step '{from}' produced no output"))
            })?;
            match path.as_deref() {
                None | Some("") => Ok(output),
                Some(path) => select_path(&output, path).cloned().ok_or_else(|| {
                    SkillError::Validation(format!("output of '{from}' has no '{path}'"))
                }),
            }
        }
    }
}

/// Follow a dotted path (`items.0.id`) into a JSON value.
pub fn select_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, segment| match v {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
