use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skilldeck_core::{ErrorKind, Params, RunId, SkillError, SkillId, WorkflowId};
use skilldeck_store::RunRecord;
use uuid::Uuid;

/// Lifecycle of a workflow run.
///
/// ```text
/// Pending -> Running -> (AwaitingCheckpoint <-> Running) -> Completed | Aborted | StepFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingCheckpoint,
    Completed,
    Aborted,
    /// Halted on a failed step. Only `retry_step` leaves this state.
    StepFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted | RunStatus::StepFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingCheckpoint => "awaiting_checkpoint",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::StepFailed => "step_failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    SkippedDependencyFailed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::SkippedDependencyFailed => "skipped-dependency-failed",
        })
    }
}

/// Classified failure recorded against a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SkillError> for StepError {
    fn from(err: &SkillError) -> Self {
        Self {
            kind: err.kind(),
            message: err.message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub step_id: String,
    pub skill_id: SkillId,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default)]
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Human answer to a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum CheckpointDecision {
    Approve,
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    /// Index of the next step to execute.
    pub current: usize,
    /// In step order, one per executed or skipped step.
    pub results: Vec<StepResult>,
    /// Index of the step whose checkpoint awaits a decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_checkpoint: Option<usize>,
    #[serde(default)]
    pub inputs: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(workflow_id: impl Into<WorkflowId>, inputs: Params) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            current: 0,
            results: Vec::new(),
            pending_checkpoint: None,
            inputs,
            abort_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn result_for(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_id == step_id)
    }

    /// Output of a step that succeeded.
    pub fn output_of(&self, step_id: &str) -> Option<Value> {
        self.result_for(step_id)
            .filter(|r| r.status == StepStatus::Succeeded)
            .and_then(|r| r.output.clone())
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.status != StepStatus::Succeeded)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn to_record(&self) -> skilldeck_core::Result<RunRecord> {
        Ok(RunRecord {
            run_id: self.run_id.clone(),
            workflow_id: self.workflow_id.clone(),
            status: self.status.as_str().to_string(),
            snapshot: serde_json::to_value(self)?,
            archived: self.status.is_terminal(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    pub fn from_record(record: &RunRecord) -> skilldeck_core::Result<Self> {
        Ok(serde_json::from_value(record.snapshot.clone())?)
    }
}
