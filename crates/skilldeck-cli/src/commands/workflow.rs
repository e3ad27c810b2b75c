use console::style;
use skilldeck_core::Params;
use skilldeck_engine::{
    AutoApprove, CancelOutcome, ChannelGate, CheckpointDecision, CheckpointGate,
    CheckpointRequest, RunStatus, Session, StepStatus, WorkflowDefinition, WorkflowRun,
};
use std::sync::Arc;
use std::time::Duration;

use super::{Outcome, WorkflowAction, truncate_output};

/// Who answers checkpoints reached while this process drives a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Review {
    /// Ask on the terminal.
    Prompt,
    AutoApprove,
    /// Leave the run suspended for a later `workflow approve`.
    Detach,
}

impl Review {
    /// Prompting needs a terminal; without one the run suspends.
    pub(super) fn from_flags(yes: bool, detach: bool) -> Self {
        if yes {
            Review::AutoApprove
        } else if detach || !console::user_attended() {
            Review::Detach
        } else {
            Review::Prompt
        }
    }
}

pub(super) async fn cmd_workflow(session: Session, action: WorkflowAction) -> skilldeck_core::Result<Outcome> {
    match action {
        WorkflowAction::List => {
            let workflows = session.catalog().list();
            if workflows.is_empty() {
                println!("No workflows found.");
            } else {
                println!("{}\n", style(format!("Workflows ({}):", workflows.len())).bold());
                for def in workflows {
                    let checkpoints = def.steps.iter().filter(|s| s.checkpoint).count();
                    println!(
                        "  {} {} · {} steps, {} checkpoints",
                        style(&def.id).cyan(),
                        style(format!("[{}]", def.category)).dim(),
                        def.steps.len(),
                        checkpoints
                    );
                    if !def.description.is_empty() {
                        println!("    {}", def.description);
                    }
                    if !def.params.is_empty() {
                        println!("    Params: {}", def.params.join(", "));
                    }
                }
            }
            for issue in session.catalog().issues() {
                println!("  ⚠️  skipped {}: {}", issue.path.display(), issue.reason);
            }
            Ok(Outcome::Success)
        }
        WorkflowAction::Show { id } => {
            let def = session.catalog().get(&id)?;
            print_definition(&def);
            Ok(Outcome::Success)
        }
        WorkflowAction::Run {
            id,
            params,
            yes,
            detach,
        } => {
            let review = Review::from_flags(yes, detach);
            run_workflow(session, &id, super::to_params(params), review).await
        }
        WorkflowAction::Status { run_id, json } => {
            let run = session.engine().status(&run_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&run)?);
            } else {
                print_run(&session, &run);
            }
            Ok(Outcome::Success)
        }
        WorkflowAction::Runs { all } => {
            let runs = session.engine().runs(all)?;
            if runs.is_empty() {
                println!("No {}runs.", if all { "" } else { "active " });
            }
            for run in &runs {
                println!(
                    "  {}  {:<24} {:<20} {}/{} steps  {}",
                    style(&run.run_id).dim(),
                    run.workflow_id,
                    status_label(run.status),
                    run.results.len(),
                    step_count(&session, run).map_or("?".to_string(), |n| n.to_string()),
                    run.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
            Ok(Outcome::Success)
        }
        WorkflowAction::Approve { run_id, yes } => {
            let session = with_review(session, Review::from_flags(yes, false));
            let run = session.engine().signal(&run_id, CheckpointDecision::Approve).await?;
            print_run(&session, &run);
            Ok(outcome_of(&run))
        }
        WorkflowAction::Reject { run_id, reason } => {
            let run = session
                .engine()
                .signal(&run_id, CheckpointDecision::Reject { reason })
                .await?;
            print_run(&session, &run);
            Ok(outcome_of(&run))
        }
        WorkflowAction::Cancel { run_id } => match session.engine().cancel(&run_id)? {
            CancelOutcome::Aborted(run) => {
                print_run(&session, &run);
                Ok(Outcome::Success)
            }
            CancelOutcome::Signalled => {
                println!("⏹  Cancellation requested for {run_id}");
                Ok(Outcome::Success)
            }
        },
        WorkflowAction::Resume { run_id, yes } => {
            let session = with_review(session, Review::from_flags(yes, false));
            let run = session.engine().resume(&run_id).await?;
            print_run(&session, &run);
            Ok(outcome_of(&run))
        }
        WorkflowAction::RetryStep { run_id, yes } => {
            let session = with_review(session, Review::from_flags(yes, false));
            let run = session.engine().retry_step(&run_id).await?;
            print_run(&session, &run);
            Ok(outcome_of(&run))
        }
    }
}

/// Start `workflow_id` and drive it as far as `review` allows.
pub(super) async fn run_workflow(
    session: Session,
    workflow_id: &str,
    params: Params,
    review: Review,
) -> skilldeck_core::Result<Outcome> {
    let session = with_review(session, review);
    let run = session.engine().start(workflow_id, params).await?;
    print_run(&session, &run);
    Ok(outcome_of(&run))
}

fn with_review(session: Session, review: Review) -> Session {
    let gate: Arc<dyn CheckpointGate> = match review {
        Review::Detach => return session,
        Review::AutoApprove => Arc::new(AutoApprove),
        Review::Prompt => {
            let secs = session.config().engine.checkpoint_timeout_secs;
            prompt_gate((secs > 0).then(|| Duration::from_secs(secs)))
        }
    };
    session.with_gate(gate)
}

/// A channel gate answered from the terminal. A prompt that cannot be shown
/// drops the reply, which leaves the run suspended.
fn prompt_gate(timeout: Option<Duration>) -> Arc<dyn CheckpointGate> {
    let mut gate = ChannelGate::new().with_timeout(timeout);
    if let Some(mut requests) = gate.take_receiver() {
        tokio::spawn(async move {
            while let Some((request, reply)) = requests.recv().await {
                if let Ok(Some(decision)) =
                    tokio::task::spawn_blocking(move || ask_decision(&request)).await
                {
                    let _ = reply.send(decision);
                }
            }
        });
    }
    Arc::new(gate)
}

fn ask_decision(request: &CheckpointRequest) -> Option<CheckpointDecision> {
    use dialoguer::{Confirm, Input, theme::ColorfulTheme};

    println!();
    println!(
        "⏸  {} after step {} ({})",
        style("Checkpoint").yellow().bold(),
        style(&request.step_id).cyan(),
        request.skill_id
    );
    let rendered = serde_json::to_string_pretty(&request.output).unwrap_or_default();
    for line in rendered.lines() {
        println!("   {line}");
    }

    let theme = ColorfulTheme::default();
    let approve = Confirm::with_theme(&theme)
        .with_prompt("Approve and continue?")
        .default(true)
        .interact()
        .ok()?;
    if approve {
        return Some(CheckpointDecision::Approve);
    }

    let reason: String = Input::with_theme(&theme)
        .with_prompt("Reason (optional)")
        .allow_empty(true)
        .interact_text()
        .ok()?;
    let reason = reason.trim();
    Some(CheckpointDecision::Reject {
        reason: (!reason.is_empty()).then(|| reason.to_string()),
    })
}

/// Exit 2 when any step failed or the run did not finish cleanly.
fn outcome_of(run: &WorkflowRun) -> Outcome {
    Outcome::from_failures(
        run.has_failures() || matches!(run.status, RunStatus::Aborted | RunStatus::StepFailed),
    )
}

fn step_count(session: &Session, run: &WorkflowRun) -> Option<usize> {
    session.catalog().get(&run.workflow_id).ok().map(|d| d.steps.len())
}

fn status_label(status: RunStatus) -> String {
    let label = style(status.as_str());
    match status {
        RunStatus::Completed => label.green(),
        RunStatus::Aborted | RunStatus::StepFailed => label.red(),
        RunStatus::AwaitingCheckpoint => label.yellow(),
        RunStatus::Pending | RunStatus::Running => label.cyan(),
    }
    .to_string()
}

fn print_definition(def: &WorkflowDefinition) {
    println!("{} {}", style(&def.id).bold(), style(format!("[{}]", def.category)).dim());
    if !def.name.is_empty() {
        println!("  {}", def.name);
    }
    if !def.description.is_empty() {
        println!("  {}", def.description);
    }
    if !def.triggers.is_empty() {
        println!("  Triggers: {}", def.triggers.join(", "));
    }
    if !def.params.is_empty() {
        println!("  Params: {}", def.params.join(", "));
    }
    if let Some(path) = &def.path {
        println!("  File: {}", path.display());
    }
    println!();
    for (i, step) in def.steps.iter().enumerate() {
        let flag = if step.checkpoint { " ⏸" } else { "" };
        println!("  {}. {} → {}{flag}", i + 1, style(&step.id).cyan(), step.skill);
        if let Some(ref d) = step.description {
            println!("       {d}");
        }
        let deps = step.dependencies();
        if !deps.is_empty() {
            let deps: Vec<&str> = deps.into_iter().collect();
            println!("       after: {}", deps.join(", "));
        }
    }
}

fn print_run(session: &Session, run: &WorkflowRun) {
    println!();
    println!(
        "Run {} · {} · {}",
        style(&run.run_id).bold(),
        run.workflow_id,
        status_label(run.status)
    );

    for result in &run.results {
        let icon = match result.status {
            StepStatus::Succeeded => "✅",
            StepStatus::Failed => "❌",
            StepStatus::SkippedDependencyFailed => "⏭ ",
        };
        let attempts = if result.attempts > 1 {
            format!(" ({} attempts)", result.attempts)
        } else {
            String::new()
        };
        println!("  {icon} {} → {}{attempts}", result.step_id, result.skill_id);
        if let Some(ref err) = result.error {
            println!("     {} {}", style(err.kind).red(), truncate_output(&err.message, 120));
        } else if let Some(ref output) = result.output {
            println!("     {}", style(truncate_output(&output.to_string(), 120)).dim());
        }
    }

    if let Ok(def) = session.catalog().get(&run.workflow_id) {
        if !run.status.is_terminal() {
            for step in def.steps.iter().skip(run.results.len()) {
                println!("  ·  {} → {}", style(&step.id).dim(), style(&step.skill).dim());
            }
        }
    }

    if let Some(ref reason) = run.abort_reason {
        println!("  Reason: {reason}");
    }
    match run.status {
        RunStatus::AwaitingCheckpoint => {
            println!();
            println!("  Review the output above, then:");
            println!("    skilldeck workflow approve {}", run.run_id);
            println!("    skilldeck workflow reject {} --reason \"...\"", run.run_id);
        }
        RunStatus::StepFailed => {
            println!();
            println!("  Fix the cause, then: skilldeck workflow retry-step {}", run.run_id);
        }
        _ => {}
    }
}
