#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use skilldeck_core::SkillError;
    use skilldeck_store::*;

    fn record(run_id: &str, status: &str, archived: bool) -> RunRecord {
        RunRecord {
            run_id: run_id.into(),
            workflow_id: "client-update".into(),
            status: status.into(),
            snapshot: json!({"current": 2, "results": [{"step": "fetch"}]}),
            archived,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // Shared contract checks, run against every implementation.

    fn snapshots_overwrite(store: &dyn StateStore) {
        store.save(&record("r1", "running", false)).unwrap();
        let mut later = record("r1", "awaiting_checkpoint", false);
        later.snapshot = json!({"current": 3});
        store.save(&later).unwrap();

        let loaded = store.load("r1").unwrap();
        assert_eq!(loaded.status, "awaiting_checkpoint");
        assert_eq!(loaded.snapshot, json!({"current": 3}));
        assert!(matches!(store.load("nope"), Err(SkillError::RunNotFound(_))));
    }

    fn archived_runs_hidden(store: &dyn StateStore) {
        store.save(&record("live", "running", false)).unwrap();
        store.save(&record("done", "completed", true)).unwrap();
        let active: Vec<_> = store
            .list_runs(false)
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        assert_eq!(active, vec!["live"]);
        assert_eq!(store.list_runs(true).unwrap().len(), 2);
    }

    fn context_is_chained(store: &dyn StateStore) {
        let a = store
            .append_context(ContextEntry::new("run_started", "started").with_run("r1"))
            .unwrap();
        let b = store
            .append_context(
                ContextEntry::new("note", "client prefers email")
                    .with_project("acme")
                    .with_details(json!({"by": "ops"})),
            )
            .unwrap();
        let c = store
            .append_context(ContextEntry::new("step_failed", "timeout").with_run("r1"))
            .unwrap();

        assert!(a.id < b.id && b.id < c.id);
        assert_ne!(a.checksum, b.checksum);

        let history = store.context_history(&ContextFilter::for_run("r1")).unwrap();
        let kinds: Vec<_> = history.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["run_started", "step_failed"]);

        let latest = store
            .context_history(&ContextFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, c.id);

        let project = store
            .context_history(&ContextFilter {
                project: Some("acme".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(project[0].details, json!({"by": "ops"}));

        let report = store.verify_context_chain().unwrap();
        assert_eq!(report.entries, 3);
        assert!(report.is_intact());
    }

    fn ledger_dedupes(store: &dyn StateStore) {
        assert!(!store.has_submission("task-1|FAILED|").unwrap());
        assert!(store.record_submission("task-1|FAILED|", "task-1").unwrap());
        assert!(store.has_submission("task-1|FAILED|").unwrap());
        assert!(!store.record_submission("task-1|FAILED|", "task-1").unwrap());
        // A new revision is a different submission.
        assert!(!store.has_submission("task-1|FAILED|2").unwrap());
    }

    mod in_memory {
        use super::*;

        #[test]
        fn test_snapshots_overwrite() {
            snapshots_overwrite(&InMemoryStateStore::new());
        }

        #[test]
        fn test_archived_runs_hidden() {
            archived_runs_hidden(&InMemoryStateStore::new());
        }

        #[test]
        fn test_context_is_chained() {
            context_is_chained(&InMemoryStateStore::new());
        }

        #[test]
        fn test_ledger_dedupes() {
            ledger_dedupes(&InMemoryStateStore::new());
        }
    }

    mod sqlite {
        use super::*;

        #[test]
        fn test_snapshots_overwrite() {
            snapshots_overwrite(&SqliteStateStore::open_in_memory().unwrap());
        }

        #[test]
        fn test_archived_runs_hidden() {
            archived_runs_hidden(&SqliteStateStore::open_in_memory().unwrap());
        }

        #[test]
        fn test_context_is_chained() {
            context_is_chained(&SqliteStateStore::open_in_memory().unwrap());
        }

        #[test]
        fn test_ledger_dedupes() {
            ledger_dedupes(&SqliteStateStore::open_in_memory().unwrap());
        }

        #[test]
        fn test_context_log_rejects_rewrites() {
            let store = SqliteStateStore::open_in_memory().unwrap();
            store
                .append_context(ContextEntry::new("note", "original"))
                .unwrap();

            let db = store.db();
            let update = db.execute("UPDATE context_log SET message = 'edited'", []);
            assert!(update.unwrap_err().to_string().contains("append-only"));
            let delete = db.execute("DELETE FROM context_log", []);
            assert!(delete.is_err());
        }

        #[test]
        fn test_tampering_detected() {
            let store = SqliteStateStore::open_in_memory().unwrap();
            for i in 0..3 {
                store
                    .append_context(ContextEntry::new("note", format!("entry {i}")))
                    .unwrap();
            }
            {
                let db = store.db();
                db.execute_batch(
                    "DROP TRIGGER context_log_no_update;
                     UPDATE context_log SET message = 'forged' WHERE id = 2;",
                )
                .unwrap();
            }
            let report = store.verify_context_chain().unwrap();
            assert_eq!(report.first_broken, Some(2));
        }

        #[test]
        fn test_persists_across_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("nested").join("state.db");
            {
                let store = SqliteStateStore::open(&path).unwrap();
                store.save(&record("r9", "awaiting_checkpoint", false)).unwrap();
                store
                    .append_context(ContextEntry::new("checkpoint_reached", "review").with_run("r9"))
                    .unwrap();
                store.record_submission("k|FAILED|", "k").unwrap();
            }
            let store = SqliteStateStore::open(&path).unwrap();
            assert_eq!(store.load("r9").unwrap().status, "awaiting_checkpoint");
            assert_eq!(
                store.context_history(&ContextFilter::for_run("r9")).unwrap().len(),
                1
            );
            assert!(store.has_submission("k|FAILED|").unwrap());
            assert!(store.verify_context_chain().unwrap().is_intact());
        }
    }
}
