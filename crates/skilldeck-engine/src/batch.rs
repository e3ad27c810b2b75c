//! Batch retry of previously failed remote work units.
//!
//! Selection happens once, up front, against the snapshot of items passed
//! in: status filter, then de-duplication (within the batch and against the
//! idempotency ledger), then the item cap. Only then are items submitted, in
//! input order, paced by a fixed delay shared by all workers.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use skilldeck_config::BatchConfig;
use skilldeck_core::{InvocationContext, ItemStatus, Params, SkillError, SkillId, WireError};
use skilldeck_skills::SkillDispatcher;
use skilldeck_store::{InMemoryStateStore, StateStore};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// An opaque remote work unit and its last-known status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryableItem {
    pub key: String,
    pub status: ItemStatus,
    /// Changes whenever the remote state changes (e.g. an `updated_at`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl RetryableItem {
    pub fn new(key: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            key: key.into(),
            status,
            revision: None,
            payload: Value::Null,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Identity used for idempotent re-submission. The same key with the
    /// same remote state is submitted at most once.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}|{}|{}",
            self.key,
            self.status,
            self.revision.as_deref().unwrap_or("")
        )
    }

    /// Build an item from a listing entry: `key` (or `id`), a case-insensitive
    /// `status`, an optional `revision` (or `updated_at`). The whole entry
    /// is kept as payload.
    pub fn from_value(value: Value) -> skilldeck_core::Result<Self> {
        let field = |names: &[&str]| -> Option<String> {
            names.iter().find_map(|name| match value.get(*name)? {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };
        let key = field(&["key", "id"])
            .ok_or_else(|| SkillError::Validation(format!("item has no key: {value}")))?;
        let status: ItemStatus = field(&["status"])
            .ok_or_else(|| SkillError::Validation(format!("item '{key}' has no status")))?
            .parse()?;
        let revision = field(&["revision", "updated_at"]);
        Ok(Self {
            key,
            status,
            revision,
            payload: value,
        })
    }
}

/// What to retry and how fast.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPolicy {
    pub statuses: BTreeSet<ItemStatus>,
    /// Upper bound on items acted upon.
    pub max_items: usize,
    /// Minimum spacing between submissions, across all workers.
    pub delay: Duration,
    /// Compute the selection without submitting anything.
    pub dry_run: bool,
    pub concurrency: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

impl BatchPolicy {
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            statuses: config.statuses().into_iter().collect(),
            max_items: config.max_items,
            delay: Duration::from_millis(config.delay_ms),
            dry_run: false,
            concurrency: config.concurrency.max(1),
        }
    }

    pub fn with_statuses<I: IntoIterator<Item = ItemStatus>>(mut self, statuses: I) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemOutcome {
    Retried,
    /// Dry run: would have been retried.
    WouldRetry,
    SkippedStatusFiltered,
    /// Eligible but past `max_items`.
    SkippedCap,
    /// Already submitted for this remote state.
    SkippedDuplicate,
    FailedAgain,
}

impl std::fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ItemOutcome::Retried => "retried",
            ItemOutcome::WouldRetry => "would-retry",
            ItemOutcome::SkippedStatusFiltered => "skipped-status-filtered",
            ItemOutcome::SkippedCap => "skipped-cap",
            ItemOutcome::SkippedDuplicate => "skipped-duplicate",
            ItemOutcome::FailedAgain => "failed-again",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub key: String,
    pub status: ItemStatus,
    pub outcome: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl ItemResult {
    fn new(item: &RetryableItem, outcome: ItemOutcome) -> Self {
        Self {
            key: item.key.clone(),
            status: item.status,
            outcome,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub total: usize,
    pub selected: usize,
    pub retried: usize,
    pub would_retry: usize,
    pub failed_again: usize,
    pub skipped_status_filtered: usize,
    pub skipped_cap: usize,
    pub skipped_duplicate: usize,
}

impl BatchCounters {
    fn count(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Retried => self.retried += 1,
            ItemOutcome::WouldRetry => self.would_retry += 1,
            ItemOutcome::SkippedStatusFiltered => self.skipped_status_filtered += 1,
            ItemOutcome::SkippedCap => self.skipped_cap += 1,
            ItemOutcome::SkippedDuplicate => self.skipped_duplicate += 1,
            ItemOutcome::FailedAgain => self.failed_again += 1,
        }
    }
}

/// Per-item outcomes in input order, plus totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRetryResult {
    pub dry_run: bool,
    pub items: Vec<ItemResult>,
    pub counters: BatchCounters,
}

impl BatchRetryResult {
    pub fn has_failures(&self) -> bool {
        self.counters.failed_again > 0
    }

    /// Keys acted upon, or that would be in a dry run.
    pub fn selected_keys(&self) -> Vec<&str> {
        self.items
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    ItemOutcome::Retried | ItemOutcome::WouldRetry | ItemOutcome::FailedAgain
                )
            })
            .map(|r| r.key.as_str())
            .collect()
    }
}

/// Lists candidate items from the remote service.
#[async_trait]
pub trait ItemSource: Send + Sync {
    async fn fetch(&self, query: &ItemQuery) -> skilldeck_core::Result<Vec<RetryableItem>>;
}

/// Re-submits one item. Throttling and transient failures are the
/// submitter's to handle; whatever it returns is final for this batch.
#[async_trait]
pub trait ItemSubmitter: Send + Sync {
    async fn submit(&self, item: &RetryableItem) -> skilldeck_core::Result<Value>;
}

/// Which items to list: explicit keys and/or a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuery {
    #[serde(default)]
    pub keys: Vec<String>,
    pub days: Option<u32>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl ItemQuery {
    pub fn validate(&self) -> skilldeck_core::Result<()> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(SkillError::Validation(format!(
                    "--start {start} is after --end {end}"
                )));
            }
        }
        if self.days == Some(0) {
            return Err(SkillError::Validation("--days must be at least 1".into()));
        }
        Ok(())
    }

    /// Parameters for a listing call. An explicit window wins over `days`;
    /// with neither, `default_days` applies.
    pub fn to_params(&self, default_days: u32) -> Params {
        let mut params = Params::new();
        params.insert("action".into(), json!("list"));
        if !self.keys.is_empty() {
            params.insert("ids".into(), json!(self.keys.join(",")));
        }
        if self.start.is_some() || self.end.is_some() {
            if let Some(start) = self.start {
                params.insert("start".into(), json!(start.format("%Y-%m-%d").to_string()));
            }
            if let Some(end) = self.end {
                params.insert("end".into(), json!(end.format("%Y-%m-%d").to_string()));
            }
        } else {
            params.insert("days".into(), json!(self.days.unwrap_or(default_days)));
        }
        params
    }
}

/// Applies a [`BatchPolicy`] to a set of items.
pub struct BatchExecutor {
    submitter: Arc<dyn ItemSubmitter>,
    ledger: Arc<dyn StateStore>,
}

impl BatchExecutor {
    /// Uses a process-local ledger; see [`with_ledger`](Self::with_ledger).
    pub fn new(submitter: Arc<dyn ItemSubmitter>) -> Self {
        Self {
            submitter,
            ledger: Arc::new(InMemoryStateStore::new()),
        }
    }

    /// Record submissions in a durable store so de-duplication holds
    /// across processes.
    pub fn with_ledger(mut self, ledger: Arc<dyn StateStore>) -> Self {
        self.ledger = ledger;
        self
    }

    pub async fn execute(
        &self,
        items: Vec<RetryableItem>,
        policy: &BatchPolicy,
    ) -> skilldeck_core::Result<BatchRetryResult> {
        let total = items.len();
        let mut seen = HashSet::new();
        let mut selected = 0usize;
        let mut plan = Vec::with_capacity(total);

        for item in items {
            let fingerprint = item.fingerprint();
            let decided = if !policy.statuses.contains(&item.status) {
                Some(ItemOutcome::SkippedStatusFiltered)
            } else if !seen.insert(fingerprint.clone()) || self.ledger.has_submission(&fingerprint)? {
                Some(ItemOutcome::SkippedDuplicate)
            } else if selected >= policy.max_items {
                Some(ItemOutcome::SkippedCap)
            } else if policy.dry_run {
                selected += 1;
                Some(ItemOutcome::WouldRetry)
            } else {
                selected += 1;
                None
            };
            plan.push((item, decided));
        }

        info!(
            total,
            selected,
            dry_run = policy.dry_run,
            concurrency = policy.concurrency,
            "batch retry selection"
        );

        let pacer = (!policy.delay.is_zero()).then(|| {
            let mut interval = tokio::time::interval(policy.delay);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tokio::sync::Mutex::new(interval)
        });
        let pacer = pacer.as_ref();

        let results: Vec<ItemResult> = futures::stream::iter(plan.into_iter().map(
            |(item, decided)| async move {
                match decided {
                    Some(outcome) => ItemResult::new(&item, outcome),
                    None => self.submit_one(&item, pacer).await,
                }
            },
        ))
        .buffered(policy.concurrency.max(1))
        .collect()
        .await;

        let mut counters = BatchCounters {
            total,
            selected,
            ..BatchCounters::default()
        };
        for result in &results {
            counters.count(result.outcome);
        }
        info!(
            retried = counters.retried,
            failed_again = counters.failed_again,
            skipped_duplicate = counters.skipped_duplicate,
            skipped_cap = counters.skipped_cap,
            "batch retry finished"
        );

        Ok(BatchRetryResult {
            dry_run: policy.dry_run,
            items: results,
            counters,
        })
    }

    async fn submit_one(
        &self,
        item: &RetryableItem,
        pacer: Option<&tokio::sync::Mutex<Interval>>,
    ) -> ItemResult {
        if let Some(pacer) = pacer {
            pacer.lock().await.tick().await;
        }

        debug!(item = %item.key, status = %item.status, "submitting item");
        match self.submitter.submit(item).await {
            Ok(output) => {
                if let Err(e) = self.ledger.record_submission(&item.fingerprint(), &item.key) {
                    warn!(item = %item.key, error = %e, "failed to record submission");
                }
                ItemResult {
                    output: Some(output),
                    ..ItemResult::new(item, ItemOutcome::Retried)
                }
            }
            Err(e) => {
                warn!(item = %item.key, kind = %e.kind(), error = %e, "item retry failed");
                ItemResult {
                    error: Some(WireError::from(&e)),
                    ..ItemResult::new(item, ItemOutcome::FailedAgain)
                }
            }
        }
    }
}

/// Lists and retries items through a skill's `action` parameter:
/// `action = "list"` returns the items, `action = "retry"` resubmits one.
pub struct SkillBatchAdapter {
    dispatcher: SkillDispatcher,
    skill_id: SkillId,
    ctx: InvocationContext,
    default_days: u32,
}

impl SkillBatchAdapter {
    pub fn new(dispatcher: SkillDispatcher, skill_id: impl Into<SkillId>, ctx: InvocationContext) -> Self {
        Self {
            dispatcher,
            skill_id: skill_id.into(),
            ctx,
            default_days: 1,
        }
    }

    /// Lookback used when neither the query nor the skill sets one.
    pub fn with_default_days(mut self, days: u32) -> Self {
        self.default_days = days.max(1);
        self
    }

    /// The skill's own lookback window, if it declares one.
    pub fn lookback_days(&self) -> Option<u32> {
        self.dispatcher
            .registry()
            .resolve(&self.skill_id)
            .ok()
            .and_then(|d| d.lookback_days)
    }
}

#[async_trait]
impl ItemSource for SkillBatchAdapter {
    async fn fetch(&self, query: &ItemQuery) -> skilldeck_core::Result<Vec<RetryableItem>> {
        query.validate()?;
        let default_days = self.lookback_days().unwrap_or(self.default_days);
        let data = self
            .dispatcher
            .invoke(&self.skill_id, query.to_params(default_days), &self.ctx)
            .await?;

        let entries = match data {
            Value::Array(entries) => entries,
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(entries)) => entries,
                _ => {
                    return Err(SkillError::Validation(format!(
                        "skill '{}' listing has no 'items' array",
                        self.skill_id
                    )));
                }
            },
            other => {
                return Err(SkillError::Validation(format!(
                    "skill '{}' returned {other} instead of an item list",
                    self.skill_id
                )));
            }
        };
        entries.into_iter().map(RetryableItem::from_value).collect()
    }
}

#[async_trait]
impl ItemSubmitter for SkillBatchAdapter {
    async fn submit(&self, item: &RetryableItem) -> skilldeck_core::Result<Value> {
        let mut params = Params::new();
        params.insert("action".into(), json!("retry"));
        params.insert("ids".into(), json!(item.key));
        self.dispatcher.invoke(&self.skill_id, params, &self.ctx).await
    }
}
