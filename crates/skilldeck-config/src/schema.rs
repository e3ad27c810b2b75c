use serde::{Deserialize, Serialize};
use skilldeck_core::ItemStatus;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root configuration — maps to `skilldeck.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkilldeckConfig {
    pub skills: SkillsConfig,
    pub workflows: WorkflowsConfig,
    pub engine: EngineConfig,
    pub batch: BatchConfig,
    pub state: StateConfig,
    pub logging: LoggingConfig,
    /// Inline credentials (e.g. `LINEAR_API_KEY = "..."`). The process
    /// environment fills in any key not set here.
    pub credentials: BTreeMap<String, String>,
}

// ── Skills ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillsConfig {
    /// Directories holding bundled `system` skills, highest precedence first.
    pub system_dirs: Vec<PathBuf>,
    /// Directories holding `user` skills. These are a separate namespace and
    /// win trigger ties against system skills.
    pub user_dirs: Vec<PathBuf>,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            system_dirs: vec![PathBuf::from("skills/system")],
            user_dirs: vec![PathBuf::from("skills/user")],
        }
    }
}

// ── Workflows ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowsConfig {
    pub system_dirs: Vec<PathBuf>,
    pub user_dirs: Vec<PathBuf>,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            system_dirs: vec![PathBuf::from("workflows/system")],
            user_dirs: vec![PathBuf::from("workflows/user")],
        }
    }
}

// ── Engine ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Total attempts per step (first try included) for retryable failures.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub retry_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt (1.0 = fixed).
    pub backoff_factor: f64,
    /// Ceiling for the inter-attempt delay.
    pub max_delay_ms: u64,
    /// Upper bound on a single skill invocation. 0 = no timeout.
    pub step_timeout_secs: u64,
    /// How long an interactive checkpoint waits before treating silence as a
    /// rejection. 0 = wait indefinitely.
    pub checkpoint_timeout_secs: u64,
    /// Keep running steps that do not depend on a failed step.
    pub continue_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            step_timeout_secs: 120,
            checkpoint_timeout_secs: 0,
            continue_on_error: true,
        }
    }
}

// ── Batch retry ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Statuses eligible for retry when `--status` is not given.
    pub default_statuses: Vec<String>,
    /// Hard cap on items acted upon in one batch.
    pub max_items: usize,
    /// Pause between item submissions.
    pub delay_ms: u64,
    /// Items in flight at once. The delay still bounds the overall rate.
    pub concurrency: usize,
    /// Lookback window used when a skill does not declare its own.
    pub default_lookback_days: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_statuses: vec!["FAILED".into(), "ERROR".into(), "TIMEOUT".into()],
            max_items: 50,
            delay_ms: 500,
            concurrency: 1,
            default_lookback_days: 1,
        }
    }
}

impl BatchConfig {
    /// Parse `default_statuses`; unknown names are reported by `validate`.
    pub fn statuses(&self) -> Vec<ItemStatus> {
        self.default_statuses
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

// ── State ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// SQLite database holding run snapshots, context history and the
    /// batch idempotency ledger.
    pub db_path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("state.db"),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl SkilldeckConfig {
    /// Make every relative directory absolute against `base` (the directory
    /// holding the config file).
    pub fn resolve_paths(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        self.skills.system_dirs.iter_mut().for_each(fix);
        self.skills.user_dirs.iter_mut().for_each(fix);
        self.workflows.system_dirs.iter_mut().for_each(fix);
        self.workflows.user_dirs.iter_mut().for_each(fix);
        if self.state.db_path.as_os_str() != ":memory:" {
            fix(&mut self.state.db_path);
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl ConfigWarning {
    fn new(severity: WarningSeverity, field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            severity,
            hint: None,
        }
    }

    fn error(field: &str, message: impl Into<String>) -> Self {
        Self::new(WarningSeverity::Error, field, message)
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self::new(WarningSeverity::Warning, field, message)
    }

    fn info(field: &str, message: impl Into<String>) -> Self {
        Self::new(WarningSeverity::Info, field, message)
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let marker = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{marker} {}: {}", self.field, self.message)?;
        match &self.hint {
            Some(hint) => write!(f, "\n   ↳ {hint}"),
            None => Ok(()),
        }
    }
}

impl SkilldeckConfig {
    /// Check value ranges that serde cannot express.
    ///
    /// Every finding is returned; any `Error` turns the whole result into
    /// `Err` with one line per error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let engine = &self.engine;
        let batch = &self.batch;
        let mut found = Vec::new();

        if engine.max_attempts == 0 {
            found.push(
                ConfigWarning::error("engine.max_attempts", "must allow at least one attempt")
                    .hint("Use 1 to disable retries"),
            );
        }
        if engine.backoff_factor < 1.0 {
            found.push(
                ConfigWarning::warning(
                    "engine.backoff_factor",
                    format!(
                        "backoff factor {} shrinks the delay between attempts",
                        engine.backoff_factor
                    ),
                )
                .hint("Use 1.0 for a fixed delay"),
            );
        }
        if engine.max_delay_ms < engine.retry_delay_ms {
            found.push(ConfigWarning::warning(
                "engine.max_delay_ms",
                "ceiling is below the initial retry delay",
            ));
        }
        if engine.step_timeout_secs == 0 {
            found.push(ConfigWarning::info(
                "engine.step_timeout_secs",
                "steps have no timeout and may block forever",
            ));
        }

        if batch.concurrency == 0 {
            found.push(ConfigWarning::error("batch.concurrency", "concurrency must be at least 1"));
        }
        if batch.max_items == 0 {
            found.push(
                ConfigWarning::error("batch.max_items", "max_items must be at least 1")
                    .hint("Use --dry-run to preview without acting"),
            );
        }
        if batch.default_statuses.is_empty() {
            found.push(
                ConfigWarning::error("batch.default_statuses", "no statuses are eligible for retry")
                    .hint("e.g. [\"FAILED\", \"ERROR\", \"TIMEOUT\"]"),
            );
        }
        for status in &batch.default_statuses {
            match status.parse::<ItemStatus>() {
                Err(_) => found.push(
                    ConfigWarning::error("batch.default_statuses", format!("unknown status '{status}'"))
                        .hint(format!("Valid: {}", ItemStatus::ALL.map(|s| s.as_str()).join(", "))),
                ),
                Ok(ItemStatus::Completed) => found.push(ConfigWarning::warning(
                    "batch.default_statuses",
                    "COMPLETED items would be re-submitted",
                )),
                Ok(_) => {}
            }
        }
        if batch.concurrency > 1 && batch.delay_ms == 0 {
            found.push(ConfigWarning::warning(
                "batch.delay_ms",
                "parallel batches without a delay have no rate ceiling",
            ));
        }

        const LOG_FORMATS: [&str; 3] = ["pretty", "json", "compact"];
        if !LOG_FORMATS.contains(&self.logging.format.as_str()) {
            found.push(
                ConfigWarning::warning(
                    "logging.format",
                    format!("log format '{}' is not recognised", self.logging.format),
                )
                .hint(format!("Valid: {}", LOG_FORMATS.join(", "))),
            );
        }

        let fatal: Vec<String> = found
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("  • {}: {}", w.field, w.message))
            .collect();
        if fatal.is_empty() {
            Ok(found)
        } else {
            Err(format!("invalid configuration:\n{}", fatal.join("\n")))
        }
    }
}
