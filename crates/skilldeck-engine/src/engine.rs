use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::{Value, json};
use skilldeck_config::EngineConfig;
use skilldeck_core::{Credentials, InvocationContext, Params, RunId, SkillError};
use skilldeck_skills::SkillDispatcher;
use skilldeck_store::{ContextEntry, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::approval::{CheckpointGate, CheckpointRequest};
use crate::catalog::WorkflowCatalog;
use crate::definition::{WorkflowDefinition, WorkflowStep, resolve_binding};
use crate::retry::RetryPolicy;
use crate::run::{
    CheckpointDecision, RunStatus, StepError, StepResult, StepStatus, WorkflowRun,
};

/// What `cancel` did.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The run was idle and is now aborted.
    Aborted(WorkflowRun),
    /// The run is executing in this process; it aborts at its next
    /// suspension point.
    Signalled,
}

/// Drives workflow runs through their state machine.
///
/// Every transition is persisted to the state store and logged to the
/// context history before the next step starts, so a run can be resumed
/// from its last durable point. At most one task drives a given run id at a
/// time.
pub struct WorkflowEngine {
    dispatcher: SkillDispatcher,
    catalog: Arc<WorkflowCatalog>,
    store: Arc<dyn StateStore>,
    credentials: Arc<Credentials>,
    default_retry: RetryPolicy,
    continue_on_error: bool,
    step_timeout: Option<Duration>,
    gate: Option<Arc<dyn CheckpointGate>>,
    active: DashMap<RunId, CancellationToken>,
}

/// Holds the per-run lock for as long as it lives.
struct RunGuard<'a> {
    active: &'a DashMap<RunId, CancellationToken>,
    run_id: RunId,
    cancel: CancellationToken,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

impl WorkflowEngine {
    pub fn new(
        dispatcher: SkillDispatcher,
        catalog: Arc<WorkflowCatalog>,
        store: Arc<dyn StateStore>,
        credentials: Arc<Credentials>,
    ) -> Self {
        Self {
            dispatcher,
            catalog,
            store,
            credentials,
            default_retry: RetryPolicy::default(),
            continue_on_error: true,
            step_timeout: None,
            gate: None,
            active: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.default_retry = RetryPolicy::from_config(config);
        self.continue_on_error = config.continue_on_error;
        self.step_timeout =
            (config.step_timeout_secs > 0).then(|| Duration::from_secs(config.step_timeout_secs));
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Without a gate, checkpoints suspend the run until `signal` is called.
    pub fn with_gate(mut self, gate: Arc<dyn CheckpointGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // ── Operations ─────────────────────────────────────────────

    /// Create a `Pending` run after validating its parameters.
    pub fn create(&self, workflow_id: &str, inputs: Params) -> skilldeck_core::Result<WorkflowRun> {
        let def = self.catalog.get(workflow_id)?;
        let inputs = def.contract()?.validate(inputs)?;
        let mut run = WorkflowRun::new(def.id.clone(), inputs);
        self.persist(&mut run)?;
        info!(run_id = %run.run_id, workflow = %def.id, "created workflow run");
        Ok(run)
    }

    /// Create a run and drive it until it suspends or finishes.
    pub async fn start(&self, workflow_id: &str, inputs: Params) -> skilldeck_core::Result<WorkflowRun> {
        let run = self.create(workflow_id, inputs)?;
        self.advance(&run.run_id).await
    }

    /// Drive a stored run forward from wherever it stands.
    ///
    /// A `Running` run (left behind by a crash) re-executes its current
    /// step. An `AwaitingCheckpoint` run asks the gate again, if any.
    pub async fn advance(&self, run_id: &str) -> skilldeck_core::Result<WorkflowRun> {
        let guard = self.lock(run_id)?;
        let mut run = self.load(run_id)?;
        if run.status.is_terminal() {
            return Err(SkillError::InvalidTransition {
                run_id: run_id.to_string(),
                reason: format!("run is already {}", run.status),
            });
        }
        let def = self.catalog.get(&run.workflow_id)?;
        self.drive(&def, &mut run, &guard.cancel).await?;
        Ok(run)
    }

    /// Reload a run from the store and continue it.
    pub async fn resume(&self, run_id: &str) -> skilldeck_core::Result<WorkflowRun> {
        info!(run_id, "resuming workflow run");
        self.advance(run_id).await
    }

    /// Deliver a checkpoint decision. Approval continues the run.
    pub async fn signal(
        &self,
        run_id: &str,
        decision: CheckpointDecision,
    ) -> skilldeck_core::Result<WorkflowRun> {
        let guard = self.lock(run_id)?;
        let mut run = self.load(run_id)?;
        self.apply_decision(&mut run, decision)?;
        if run.status == RunStatus::Running {
            let def = self.catalog.get(&run.workflow_id)?;
            self.drive(&def, &mut run, &guard.cancel).await?;
        }
        Ok(run)
    }

    /// Abort a run. Completed steps are kept, nothing is rolled back.
    pub fn cancel(&self, run_id: &str) -> skilldeck_core::Result<CancelOutcome> {
        if let Some(token) = self.active.get(run_id) {
            token.cancel();
            info!(run_id, "cancellation requested for executing run");
            return Ok(CancelOutcome::Signalled);
        }

        let _guard = self.lock(run_id)?;
        let mut run = self.load(run_id)?;
        if run.status.is_terminal() {
            return Err(SkillError::InvalidTransition {
                run_id: run_id.to_string(),
                reason: format!("cannot cancel a run that is {}", run.status),
            });
        }
        self.abort(&mut run, "cancelled")?;
        Ok(CancelOutcome::Aborted(run))
    }

    /// Re-run the failed step of a halted run, then continue.
    pub async fn retry_step(&self, run_id: &str) -> skilldeck_core::Result<WorkflowRun> {
        let guard = self.lock(run_id)?;
        let mut run = self.load(run_id)?;
        let invalid = |reason: &str| SkillError::InvalidTransition {
            run_id: run_id.to_string(),
            reason: reason.to_string(),
        };
        if run.status != RunStatus::StepFailed {
            return Err(invalid("only a run halted on a failed step can retry it"));
        }
        let failed = match run.results.last() {
            Some(r) if r.status == StepStatus::Failed => r.index,
            _ => return Err(invalid("the last recorded step did not fail")),
        };

        run.results.pop();
        run.current = failed;
        run.status = RunStatus::Running;
        self.persist(&mut run)?;
        let def = self.catalog.get(&run.workflow_id)?;
        let step_id = def.steps.get(failed).map(|s| s.id.as_str()).unwrap_or_default();
        self.record(&run, "step_retried", format!("retrying step '{step_id}'"), json!({"index": failed}))?;

        self.drive(&def, &mut run, &guard.cancel).await?;
        Ok(run)
    }

    pub fn status(&self, run_id: &str) -> skilldeck_core::Result<WorkflowRun> {
        self.load(run_id)
    }

    /// Stored runs, most recently updated first.
    pub fn runs(&self, include_archived: bool) -> skilldeck_core::Result<Vec<WorkflowRun>> {
        self.store
            .list_runs(include_archived)?
            .iter()
            .map(WorkflowRun::from_record)
            .collect()
    }

    // ── State machine ──────────────────────────────────────────

    async fn drive(
        &self,
        def: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> skilldeck_core::Result<()> {
        let continue_on_error = def.continue_on_error.unwrap_or(self.continue_on_error);

        match run.status {
            RunStatus::Pending => {
                run.status = RunStatus::Running;
                self.persist(run)?;
                self.record(run, "run_started", format!("started workflow '{}'", def.id), json!({
                    "inputs": run.inputs,
                    "steps": def.steps.len(),
                }))?;
            }
            RunStatus::AwaitingCheckpoint => {
                if !self.await_checkpoint(def, run, cancel).await? {
                    return Ok(());
                }
            }
            _ => {}
        }

        loop {
            if cancel.is_cancelled() {
                return self.abort(run, "cancelled");
            }
            let Some(step) = def.steps.get(run.current) else {
                return self.complete(run);
            };
            let index = run.current;

            if let Some(dep) = failed_dependency(run, step) {
                let now = Utc::now();
                run.results.push(StepResult {
                    index,
                    step_id: step.id.clone(),
                    skill_id: step.skill.clone(),
                    status: StepStatus::SkippedDependencyFailed,
                    output: None,
                    error: None,
                    attempts: 0,
                    started_at: now,
                    finished_at: now,
                });
                run.current += 1;
                self.persist(run)?;
                info!(run_id = %run.run_id, step = %step.id, dependency = dep, "skipping step");
                self.record(
                    run,
                    "step_skipped",
                    format!("step '{}' skipped: '{dep}' did not succeed", step.id),
                    json!({"index": index, "dependency": dep}),
                )?;
                continue;
            }

            let started_at = Utc::now();
            let (result, attempts) = self.execute_step(def, run, step, cancel).await;
            if result.is_err() && cancel.is_cancelled() {
                // Interrupted mid-step: the step is not recorded at all.
                return self.abort(run, "cancelled");
            }

            match result {
                Ok(output) => {
                    run.results.push(StepResult {
                        index,
                        step_id: step.id.clone(),
                        skill_id: step.skill.clone(),
                        status: StepStatus::Succeeded,
                        output: Some(output),
                        error: None,
                        attempts,
                        started_at,
                        finished_at: Utc::now(),
                    });
                    run.current += 1;
                    self.persist(run)?;
                    info!(run_id = %run.run_id, step = %step.id, attempts, "step succeeded");
                    self.record(
                        run,
                        "step_succeeded",
                        format!("step '{}' succeeded", step.id),
                        json!({"index": index, "skill": step.skill, "attempts": attempts}),
                    )?;

                    if step.checkpoint {
                        run.status = RunStatus::AwaitingCheckpoint;
                        run.pending_checkpoint = Some(index);
                        self.persist(run)?;
                        self.record(
                            run,
                            "checkpoint_reached",
                            format!("waiting for approval after step '{}'", step.id),
                            json!({"index": index}),
                        )?;
                        if !self.await_checkpoint(def, run, cancel).await? {
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    let error = StepError::from(&err);
                    run.results.push(StepResult {
                        index,
                        step_id: step.id.clone(),
                        skill_id: step.skill.clone(),
                        status: StepStatus::Failed,
                        output: None,
                        error: Some(error.clone()),
                        attempts,
                        started_at,
                        finished_at: Utc::now(),
                    });
                    run.current += 1;
                    warn!(
                        run_id = %run.run_id,
                        step = %step.id,
                        skill = %step.skill,
                        kind = %error.kind,
                        attempts,
                        "step failed"
                    );

                    if continue_on_error {
                        self.persist(run)?;
                        self.record(
                            run,
                            "step_failed",
                            format!("step '{}' failed: {}", step.id, error.message),
                            json!({"index": index, "skill": step.skill, "error": error}),
                        )?;
                        continue;
                    }

                    run.status = RunStatus::StepFailed;
                    self.persist(run)?;
                    self.record(
                        run,
                        "step_failed",
                        format!("step '{}' failed: {}", step.id, error.message),
                        json!({"index": index, "skill": step.skill, "error": error}),
                    )?;
                    self.record(
                        run,
                        "run_halted",
                        format!("run halted at step '{}'", step.id),
                        json!({"index": index}),
                    )?;
                    return Ok(());
                }
            }
        }
    }

    /// Resolve inputs and invoke the step's skill under its retry policy.
    async fn execute_step(
        &self,
        def: &WorkflowDefinition,
        run: &WorkflowRun,
        step: &WorkflowStep,
        cancel: &CancellationToken,
    ) -> (skilldeck_core::Result<Value>, u32) {
        let mut params = Params::new();
        for (name, binding) in &step.inputs {
            match resolve_binding(binding, &run.inputs, |id| run.output_of(id)) {
                Ok(value) => {
                    params.insert(name.clone(), value);
                }
                Err(e) => return (Err(e), 0),
            }
        }

        let policy = self
            .default_retry
            .overlay(def.retry.as_ref())
            .overlay(step.retry.as_ref());
        let ctx = InvocationContext::new(Arc::clone(&self.credentials))
            .with_timeout(self.step_timeout)
            .with_cancel(cancel.clone())
            .for_step(&run.run_id, &step.id);
        let dispatcher = &self.dispatcher;
        let skill = step.skill.as_str();

        debug!(run_id = %run.run_id, step = %step.id, skill, "executing step");
        policy
            .run(cancel, |attempt| {
                let params = params.clone();
                let ctx = &ctx;
                async move {
                    if attempt > 1 {
                        debug!(skill, attempt, "retrying step");
                    }
                    dispatcher.invoke(skill, params, ctx).await
                }
            })
            .await
    }

    /// Ask the gate about the pending checkpoint. Returns whether the run
    /// should keep going.
    async fn await_checkpoint(
        &self,
        def: &WorkflowDefinition,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> skilldeck_core::Result<bool> {
        let Some(gate) = &self.gate else {
            return Ok(false);
        };
        let Some(index) = run.pending_checkpoint else {
            return Ok(true);
        };
        let Some(step) = def.steps.get(index) else {
            return Err(SkillError::InvalidTransition {
                run_id: run.run_id.clone(),
                reason: format!("checkpoint refers to missing step {index}"),
            });
        };

        let request = CheckpointRequest {
            run_id: run.run_id.clone(),
            workflow_id: run.workflow_id.clone(),
            step_index: index,
            step_id: step.id.clone(),
            skill_id: step.skill.clone(),
            output: run.output_of(&step.id).unwrap_or(Value::Null),
            created_at: Utc::now(),
        };

        let decision = tokio::select! {
            _ = cancel.cancelled() => {
                self.abort(run, "cancelled")?;
                return Ok(false);
            }
            decision = gate.review(request) => decision,
        };

        match decision {
            Some(decision) => {
                self.apply_decision(run, decision)?;
                Ok(run.status == RunStatus::Running)
            }
            None => {
                debug!(run_id = %run.run_id, "checkpoint deferred");
                Ok(false)
            }
        }
    }

    fn apply_decision(
        &self,
        run: &mut WorkflowRun,
        decision: CheckpointDecision,
    ) -> skilldeck_core::Result<()> {
        if run.status != RunStatus::AwaitingCheckpoint {
            return Err(SkillError::InvalidTransition {
                run_id: run.run_id.clone(),
                reason: format!("no checkpoint pending (run is {})", run.status),
            });
        }
        let index = run.pending_checkpoint.take();

        match decision {
            CheckpointDecision::Approve => {
                run.status = RunStatus::Running;
                self.persist(run)?;
                info!(run_id = %run.run_id, ?index, "checkpoint approved");
                self.record(run, "checkpoint_approved", "checkpoint approved", json!({"index": index}))
            }
            CheckpointDecision::Reject { reason } => {
                run.status = RunStatus::Aborted;
                run.abort_reason = Some(reason.clone().unwrap_or_else(|| "checkpoint rejected".into()));
                self.persist(run)?;
                info!(run_id = %run.run_id, ?index, ?reason, "checkpoint rejected");
                self.record(
                    run,
                    "checkpoint_rejected",
                    reason.as_deref().unwrap_or("checkpoint rejected"),
                    json!({"index": index, "completed_steps": run.results.len()}),
                )
            }
        }
    }

    fn abort(&self, run: &mut WorkflowRun, reason: &str) -> skilldeck_core::Result<()> {
        run.status = RunStatus::Aborted;
        run.pending_checkpoint = None;
        run.abort_reason = Some(reason.to_string());
        self.persist(run)?;
        info!(run_id = %run.run_id, recorded = run.results.len(), "run aborted");
        self.record(
            run,
            "run_cancelled",
            format!("run aborted: {reason}"),
            json!({"completed_steps": run.results.len()}),
        )
    }

    fn complete(&self, run: &mut WorkflowRun) -> skilldeck_core::Result<()> {
        run.status = RunStatus::Completed;
        self.persist(run)?;
        let summary = json!({
            "succeeded": run.count(StepStatus::Succeeded),
            "failed": run.count(StepStatus::Failed),
            "skipped": run.count(StepStatus::SkippedDependencyFailed),
        });
        info!(run_id = %run.run_id, %summary, "run completed");
        self.record(run, "run_completed", "run completed", summary)
    }

    // ── Plumbing ───────────────────────────────────────────────

    fn lock(&self, run_id: &str) -> skilldeck_core::Result<RunGuard<'_>> {
        match self.active.entry(run_id.to_string()) {
            Entry::Occupied(_) => Err(SkillError::RunLocked(run_id.to_string())),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                slot.insert(cancel.clone());
                Ok(RunGuard {
                    active: &self.active,
                    run_id: run_id.to_string(),
                    cancel,
                })
            }
        }
    }

    fn load(&self, run_id: &str) -> skilldeck_core::Result<WorkflowRun> {
        WorkflowRun::from_record(&self.store.load(run_id)?)
    }

    fn persist(&self, run: &mut WorkflowRun) -> skilldeck_core::Result<()> {
        run.updated_at = Utc::now();
        self.store.save(&run.to_record()?)
    }

    fn record(
        &self,
        run: &WorkflowRun,
        kind: &str,
        message: impl Into<String>,
        details: Value,
    ) -> skilldeck_core::Result<()> {
        self.store.append_context(
            ContextEntry::new(kind, message)
                .with_run(run.run_id.clone())
                .with_project(run.workflow_id.clone())
                .with_details(details),
        )?;
        Ok(())
    }
}

/// The first dependency of `step` that did not succeed, if any.
/// Skipped steps count as not succeeded, so skips propagate.
fn failed_dependency<'a>(run: &WorkflowRun, step: &'a WorkflowStep) -> Option<&'a str> {
    step.dependencies().into_iter().find(|dep| {
        run.result_for(dep)
            .is_none_or(|r| r.status != StepStatus::Succeeded)
    })
}
