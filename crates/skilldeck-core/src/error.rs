use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the skilldeck runtime.
#[derive(Error, Debug)]
pub enum SkillError {
    // ── Invocation errors (classified at the engine boundary) ──
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited: {message} (retry after {retry_after_secs}s)")]
    RateLimited { message: String, retry_after_secs: u64 },

    #[error("transient execution failure: {0}")]
    Transient(String),

    #[error("execution failed: {0}")]
    Fatal(String),

    // ── Registry errors ────────────────────────────────────────
    #[error("duplicate skill id: {0}")]
    DuplicateSkill(String),

    #[error("unknown skill: {0}")]
    UnknownSkill(String),

    #[error("skill '{0}' is a shared library and cannot be invoked directly")]
    NotInvocable(String),

    #[error("invalid skill definition: {path}: {reason}")]
    InvalidSkill { path: String, reason: String },

    // ── Workflow errors ────────────────────────────────────────
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("invalid workflow '{workflow}': {reason}")]
    InvalidWorkflow { workflow: String, reason: String },

    #[error("workflow run not found: {0}")]
    RunNotFound(String),

    #[error("invalid transition for run {run_id}: {reason}")]
    InvalidTransition { run_id: String, reason: String },

    #[error("workflow run {0} is already being executed")]
    RunLocked(String),

    // ── Persistence / config ───────────────────────────────────
    #[error("state store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SkillError>;

/// Closed classification of invocation failures.
///
/// This is what travels in the `{kind, message}` error object of a skill
/// response and what the workflow engine records against a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Validation,
    RateLimit,
    Transient,
    Fatal,
}

impl ErrorKind {
    /// Only throttling and transient failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimit | ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SkillError {
    /// Classify this error for retry decisions and step reporting.
    ///
    /// Anything outside the invocation taxonomy (unknown skill, store failure,
    /// io) is treated as fatal for the step that raised it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SkillError::Configuration(_) | SkillError::Config(_) => ErrorKind::Configuration,
            SkillError::Authentication(_) => ErrorKind::Authentication,
            SkillError::Validation(_) => ErrorKind::Validation,
            SkillError::RateLimited { .. } => ErrorKind::RateLimit,
            SkillError::Transient(_) => ErrorKind::Transient,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            SkillError::RateLimited {
                retry_after_secs, ..
            } if *retry_after_secs > 0 => {
                Some(std::time::Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }

    /// Rebuild an error from its wire classification.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Configuration => SkillError::Configuration(message),
            ErrorKind::Authentication => SkillError::Authentication(message),
            ErrorKind::Validation => SkillError::Validation(message),
            ErrorKind::RateLimit => SkillError::RateLimited {
                message,
                retry_after_secs: 0,
            },
            ErrorKind::Transient => SkillError::Transient(message),
            ErrorKind::Fatal => SkillError::Fatal(message),
        }
    }

    /// The human-readable part of the error without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            SkillError::Configuration(m)
            | SkillError::Authentication(m)
            | SkillError::Validation(m)
            | SkillError::Transient(m)
            | SkillError::Fatal(m) => m.clone(),
            SkillError::RateLimited { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
