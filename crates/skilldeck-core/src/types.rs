use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::SkillError;

/// Unique identifier of a skill within the registry.
pub type SkillId = String;

/// Unique identifier of a workflow definition.
pub type WorkflowId = String;

/// Unique identifier of a workflow run.
pub type RunId = String;

/// Where a skill or workflow was discovered.
///
/// `User` entries come from a separate namespace and win ties against
/// `System` entries with an equally specific trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    System,
    User,
}

impl Category {
    /// Higher wins.
    pub fn priority(self) -> u8 {
        match self {
            Category::System => 0,
            Category::User => 1,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::System => write!(f, "system"),
            Category::User => write!(f, "user"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkillKind {
    #[default]
    Invocable,
    /// Provides logic or credentials to other skills; never triggered directly.
    SharedLibrary,
}

impl std::str::FromStr for SkillKind {
    type Err = SkillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "invocable" | "skill" => Ok(SkillKind::Invocable),
            "shared-library" | "library" | "shared" => Ok(SkillKind::SharedLibrary),
            other => Err(SkillError::Validation(format!("unknown skill kind '{other}'"))),
        }
    }
}

/// Process-wide credential store (environment-style key/value pairs).
///
/// Skills never receive secrets as parameters; they look them up here.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Look up a credential, failing with a configuration error when absent.
    pub fn require(&self, key: &str) -> crate::Result<&str> {
        self.get(key)
            .ok_or_else(|| SkillError::Configuration(format!("missing credential {key}")))
    }

    /// Check every key at once so the error names all missing credentials.
    pub fn require_all<S: AsRef<str>>(&self, keys: &[S]) -> crate::Result<()> {
        let missing: Vec<&str> = keys
            .iter()
            .map(AsRef::as_ref)
            .filter(|k| !self.contains(k))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SkillError::Configuration(format!(
                "missing credentials: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Per-invocation context handed to every skill.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub credentials: Arc<Credentials>,
    /// Upper bound on a single remote call, enforced by the dispatcher.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub run_id: Option<RunId>,
    pub step_id: Option<String>,
}

impl InvocationContext {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            credentials,
            timeout: None,
            cancel: CancellationToken::new(),
            run_id: None,
            step_id: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn for_step(&self, run_id: &str, step_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.run_id = Some(run_id.to_string());
        ctx.step_id = Some(step_id.to_string());
        ctx
    }
}

/// Last-known status of a remote work unit, as reported by the service that
/// owns it. Parsing is case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Error,
    /// Halted by a condition check rather than an execution fault.
    Stopped,
    Timeout,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 7] = [
        ItemStatus::Queued,
        ItemStatus::Running,
        ItemStatus::Completed,
        ItemStatus::Failed,
        ItemStatus::Error,
        ItemStatus::Stopped,
        ItemStatus::Timeout,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Queued => "QUEUED",
            ItemStatus::Running => "RUNNING",
            ItemStatus::Completed => "COMPLETED",
            ItemStatus::Failed => "FAILED",
            ItemStatus::Error => "ERROR",
            ItemStatus::Stopped => "STOPPED",
            ItemStatus::Timeout => "TIMEOUT",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = SkillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        ItemStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == upper)
            .ok_or_else(|| SkillError::Validation(format!("unknown item status '{s}'")))
    }
}
