use parking_lot::Mutex;
use skilldeck_core::SkillError;
use std::collections::{HashMap, HashSet};

use crate::store::{
    ChainReport, ContextEntry, ContextFilter, RunRecord, StateStore, chain_hash, timestamp,
};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, RunRecord>,
    context: Vec<ContextEntry>,
    ledger: HashSet<String>,
}

/// Process-local state store for tests and throwaway sessions.
#[derive(Default)]
pub struct InMemoryStateStore {
    inner: Mutex<Inner>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entry_hash(prev: &str, entry: &ContextEntry) -> skilldeck_core::Result<String> {
    Ok(chain_hash(
        prev,
        &timestamp(&entry.created_at),
        &entry.kind,
        entry.run_id.as_deref(),
        entry.project.as_deref(),
        &entry.message,
        &serde_json::to_string(&entry.details)?,
    ))
}

impl StateStore for InMemoryStateStore {
    fn save(&self, record: &RunRecord) -> skilldeck_core::Result<()> {
        let mut inner = self.inner.lock();
        let created_at = inner
            .runs
            .get(&record.run_id)
            .map(|r| r.created_at)
            .unwrap_or(record.created_at);
        inner.runs.insert(
            record.run_id.clone(),
            RunRecord {
                created_at,
                ..record.clone()
            },
        );
        Ok(())
    }

    fn load(&self, run_id: &str) -> skilldeck_core::Result<RunRecord> {
        self.inner
            .lock()
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| SkillError::RunNotFound(run_id.to_string()))
    }

    fn list_runs(&self, include_archived: bool) -> skilldeck_core::Result<Vec<RunRecord>> {
        let inner = self.inner.lock();
        let mut runs: Vec<_> = inner
            .runs
            .values()
            .filter(|r| include_archived || !r.archived)
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    fn append_context(&self, entry: ContextEntry) -> skilldeck_core::Result<ContextEntry> {
        let mut inner = self.inner.lock();
        let prev = inner
            .context
            .last()
            .map(|e| e.checksum.as_str())
            .unwrap_or("");
        let checksum = entry_hash(prev, &entry)?;
        let stored = ContextEntry {
            id: inner.context.len() as i64 + 1,
            checksum,
            ..entry
        };
        inner.context.push(stored.clone());
        Ok(stored)
    }

    fn context_history(&self, filter: &ContextFilter) -> skilldeck_core::Result<Vec<ContextEntry>> {
        let inner = self.inner.lock();
        let matching: Vec<_> = inner
            .context
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        let skip = filter
            .limit
            .map(|n| matching.len().saturating_sub(n))
            .unwrap_or(0);
        Ok(matching.into_iter().skip(skip).collect())
    }

    fn verify_context_chain(&self) -> skilldeck_core::Result<ChainReport> {
        let inner = self.inner.lock();
        let mut prev = "";
        for (i, entry) in inner.context.iter().enumerate() {
            if entry_hash(prev, entry)? != entry.checksum {
                return Ok(ChainReport {
                    entries: i + 1,
                    first_broken: Some(entry.id),
                });
            }
            prev = &entry.checksum;
        }
        Ok(ChainReport {
            entries: inner.context.len(),
            first_broken: None,
        })
    }

    fn has_submission(&self, fingerprint: &str) -> skilldeck_core::Result<bool> {
        Ok(self.inner.lock().ledger.contains(fingerprint))
    }

    fn record_submission(&self, fingerprint: &str, _item_key: &str) -> skilldeck_core::Result<bool> {
        Ok(self.inner.lock().ledger.insert(fingerprint.to_string()))
    }
}
