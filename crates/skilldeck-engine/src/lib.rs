//! # skilldeck-engine
//!
//! Workflow orchestration on top of the skill dispatcher: validated workflow
//! definitions, the checkpointed run state machine with per-step retry and
//! dependency-aware failure handling, human-in-the-loop checkpoint gates,
//! and the paced, idempotent batch retry executor.

pub mod approval;
pub mod batch;
pub mod catalog;
pub mod definition;
pub mod engine;
pub mod retry;
pub mod run;
pub mod session;

pub use approval::{AutoApprove, ChannelGate, CheckpointGate, CheckpointRequest};
pub use batch::{
    BatchCounters, BatchExecutor, BatchPolicy, BatchRetryResult, ItemOutcome, ItemQuery,
    ItemResult, ItemSource, ItemSubmitter, RetryableItem, SkillBatchAdapter,
};
pub use catalog::{CatalogIssue, WorkflowCatalog};
pub use definition::{Binding, RetrySettings, WorkflowDefinition, WorkflowStep};
pub use engine::{CancelOutcome, WorkflowEngine};
pub use retry::RetryPolicy;
pub use run::{CheckpointDecision, RunStatus, StepError, StepResult, StepStatus, WorkflowRun};
pub use session::{Dispatch, Session};
