use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skilldeck_core::{RunId, SkillId, WorkflowId};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::run::CheckpointDecision;

/// A checkpoint awaiting human review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub step_index: usize,
    pub step_id: String,
    pub skill_id: SkillId,
    /// What the checkpointed step produced, shown to the reviewer.
    pub output: Value,
    pub created_at: DateTime<Utc>,
}

/// Where checkpoint decisions come from.
///
/// `None` defers the decision: the run stays `AwaitingCheckpoint` and is
/// signalled later.
#[async_trait]
pub trait CheckpointGate: Send + Sync {
    async fn review(&self, request: CheckpointRequest) -> Option<CheckpointDecision>;
}

type Pending = (CheckpointRequest, oneshot::Sender<CheckpointDecision>);

/// Forwards checkpoint requests over a channel to whoever holds the receiver
/// (an interactive prompt, a chat integration, a test).
pub struct ChannelGate {
    request_tx: mpsc::Sender<Pending>,
    request_rx: Option<mpsc::Receiver<Pending>>,
    /// Silence past this is a rejection. `None` waits indefinitely.
    timeout: Option<Duration>,
}

impl Default for ChannelGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelGate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            request_tx: tx,
            request_rx: Some(rx),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    /// Take the receiving end. Can only be taken once.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<Pending>> {
        self.request_rx.take()
    }
}

#[async_trait]
impl CheckpointGate for ChannelGate {
    async fn review(&self, request: CheckpointRequest) -> Option<CheckpointDecision> {
        info!(
            run_id = %request.run_id,
            step = %request.step_id,
            skill = %request.skill_id,
            "checkpoint awaiting decision"
        );

        let (decision_tx, decision_rx) = oneshot::channel();
        if self.request_tx.send((request, decision_tx)).await.is_err() {
            // Nobody listening: leave the checkpoint pending.
            return None;
        }

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, decision_rx).await {
                Ok(Ok(decision)) => Some(decision),
                Ok(Err(_)) => None,
                Err(_) => {
                    info!(timeout_secs = limit.as_secs(), "checkpoint timed out, rejecting");
                    Some(CheckpointDecision::Reject {
                        reason: Some(format!("no decision within {}s", limit.as_secs())),
                    })
                }
            },
            None => decision_rx.await.ok(),
        }
    }
}

/// Approves every checkpoint. For unattended runs and tests.
pub struct AutoApprove;

#[async_trait]
impl CheckpointGate for AutoApprove {
    async fn review(&self, _request: CheckpointRequest) -> Option<CheckpointDecision> {
        Some(CheckpointDecision::Approve)
    }
}
