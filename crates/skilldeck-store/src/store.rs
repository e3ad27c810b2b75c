use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skilldeck_core::{RunId, WorkflowId};

/// Durable snapshot of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    /// Run status at the time of the snapshot (e.g. `awaiting_checkpoint`).
    pub status: String,
    /// Full serialized run state.
    pub snapshot: Value,
    /// Set once the run reaches a terminal status.
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One append-only history entry (workflow or project activity).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Assigned on append; 0 before that.
    pub id: i64,
    pub project: Option<String>,
    pub run_id: Option<RunId>,
    /// Short machine-readable event name, e.g. `step_succeeded` or `note`.
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub created_at: DateTime<Utc>,
    /// blake3 over the previous entry's checksum and this entry's fields.
    /// Assigned on append.
    #[serde(default)]
    pub checksum: String,
}

impl ContextEntry {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            project: None,
            run_id: None,
            kind: kind.into(),
            message: message.into(),
            details: Value::Null,
            created_at: Utc::now(),
            checksum: String::new(),
        }
    }

    pub fn with_run(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Selection for `context_history`. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    pub run_id: Option<RunId>,
    pub project: Option<String>,
    pub kind: Option<String>,
    pub since: Option<DateTime<Utc>>,
    /// Keep only the most recent N matches.
    pub limit: Option<usize>,
}

impl ContextFilter {
    pub fn for_run(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &ContextEntry) -> bool {
        self.run_id.as_ref().is_none_or(|r| entry.run_id.as_ref() == Some(r))
            && self.project.as_ref().is_none_or(|p| entry.project.as_ref() == Some(p))
            && self.kind.as_ref().is_none_or(|k| &entry.kind == k)
            && self.since.is_none_or(|s| entry.created_at >= s)
    }
}

/// Result of walking the context hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub entries: usize,
    /// Id of the first entry whose checksum does not match.
    pub first_broken: Option<i64>,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.first_broken.is_none()
    }
}

/// Persistence for run snapshots, the context log and the batch ledger.
///
/// Snapshots are overwritten per run id. The context log only grows.
pub trait StateStore: Send + Sync {
    /// Insert or overwrite the snapshot for `record.run_id`.
    fn save(&self, record: &RunRecord) -> skilldeck_core::Result<()>;

    /// Fails with `RunNotFound` when no snapshot exists.
    fn load(&self, run_id: &str) -> skilldeck_core::Result<RunRecord>;

    /// Most recently updated first.
    fn list_runs(&self, include_archived: bool) -> skilldeck_core::Result<Vec<RunRecord>>;

    /// Append an entry and return it with its id and checksum assigned.
    fn append_context(&self, entry: ContextEntry) -> skilldeck_core::Result<ContextEntry>;

    /// Matching entries, oldest first.
    fn context_history(&self, filter: &ContextFilter) -> skilldeck_core::Result<Vec<ContextEntry>>;

    fn verify_context_chain(&self) -> skilldeck_core::Result<ChainReport>;

    fn has_submission(&self, fingerprint: &str) -> skilldeck_core::Result<bool>;

    /// Record a completed submission. Returns false if it was already recorded.
    fn record_submission(&self, fingerprint: &str, item_key: &str) -> skilldeck_core::Result<bool>;
}

/// Timestamp form used both in storage and in the chain hash.
pub(crate) fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> skilldeck_core::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| skilldeck_core::SkillError::Store(format!("bad timestamp '{s}': {e}")))
}

/// Chain checksum of an entry given its predecessor's checksum.
pub(crate) fn chain_hash(
    prev: &str,
    created_at: &str,
    kind: &str,
    run_id: Option<&str>,
    project: Option<&str>,
    message: &str,
    details: &str,
) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [
        prev,
        created_at,
        kind,
        run_id.unwrap_or(""),
        project.unwrap_or(""),
        message,
        details,
    ] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_hash_depends_on_predecessor() {
        let a = chain_hash("", "t", "note", None, None, "m", "null");
        let b = chain_hash("x", "t", "note", None, None, "m", "null");
        assert_ne!(a, b);
        assert_eq!(a, chain_hash("", "t", "note", None, None, "m", "null"));
    }

    #[test]
    fn chain_hash_fields_are_delimited() {
        // Moving a character between fields must change the hash.
        let a = chain_hash("", "t", "ab", None, None, "c", "null");
        let b = chain_hash("", "t", "a", None, None, "bc", "null");
        assert_ne!(a, b);
    }

    #[test]
    fn filter_matching() {
        let entry = ContextEntry::new("step_failed", "boom")
            .with_run("r1")
            .with_project("acme");
        assert!(ContextFilter::default().matches(&entry));
        assert!(ContextFilter::for_run("r1").matches(&entry));
        assert!(!ContextFilter::for_run("r2").matches(&entry));
        let f = ContextFilter {
            project: Some("acme".into()),
            kind: Some("note".into()),
            ..Default::default()
        };
        assert!(!f.matches(&entry));
    }

    #[test]
    fn timestamp_roundtrips() {
        let now = Utc::now();
        let parsed = parse_timestamp(&timestamp(&now)).unwrap();
        assert_eq!(timestamp(&parsed), timestamp(&now));
    }
}
