#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use skilldeck_core::{Category, Credentials, InvocationContext, Params, Skill, SkillError};
    use skilldeck_engine::*;
    use skilldeck_skills::{SkillDescriptor, SkillDispatcher, SkillRegistry};
    use skilldeck_store::{ContextFilter, InMemoryStateStore, StateStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    // ── Scripted skills ────────────────────────────────────────

    type CallLog = Arc<Mutex<Vec<String>>>;

    enum Behaviour {
        Succeed,
        /// Fail the first `n` calls with errors built by the closure.
        FailFirst(usize, fn() -> SkillError),
        FailAlways(fn() -> SkillError),
        /// Announce the call, then wait for cancellation.
        Block(Arc<Notify>),
    }

    struct Scripted {
        behaviour: Behaviour,
        log: CallLog,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Skill for Scripted {
        async fn invoke(&self, params: Params, ctx: &InvocationContext) -> skilldeck_core::Result<Value> {
            let step = ctx.step_id.clone().unwrap_or_default();
            self.log.lock().push(step.clone());
            let call = {
                let mut calls = self.calls.lock();
                *calls += 1;
                *calls
            };
            match &self.behaviour {
                Behaviour::Succeed => {}
                Behaviour::FailFirst(n, err) if call <= *n => return Err(err()),
                Behaviour::FailFirst(..) => {}
                Behaviour::FailAlways(err) => return Err(err()),
                Behaviour::Block(started) => {
                    started.notify_one();
                    ctx.cancel.cancelled().await;
                    return Err(SkillError::Fatal("interrupted".into()));
                }
            }
            Ok(json!({"step": step, "params": params}))
        }
    }

    fn fatal() -> SkillError {
        SkillError::Fatal("resource not found".into())
    }

    fn transient() -> SkillError {
        SkillError::Transient("502 from upstream".into())
    }

    struct Harness {
        registry: SkillRegistry,
        log: CallLog,
    }

    impl Harness {
        fn new() -> Self {
            let mut h = Self {
                registry: SkillRegistry::new(),
                log: Arc::default(),
            };
            h.skill("work", Behaviour::Succeed);
            h
        }

        fn skill(&mut self, id: &str, behaviour: Behaviour) -> &mut Self {
            let skill = Scripted {
                behaviour,
                log: Arc::clone(&self.log),
                calls: Mutex::new(0),
            };
            self.registry
                .register_with(SkillDescriptor::new(id, Category::System), Arc::new(skill))
                .unwrap();
            self
        }

        fn engine_with_store(self, workflow: &str, store: Arc<dyn StateStore>) -> (WorkflowEngine, CallLog) {
            let def = WorkflowDefinition::from_toml(workflow, Category::System).unwrap();
            let mut catalog = WorkflowCatalog::new();
            catalog.register(def, &self.registry).unwrap();
            let engine = WorkflowEngine::new(
                SkillDispatcher::new(Arc::new(self.registry)),
                Arc::new(catalog),
                store,
                Arc::new(Credentials::new()),
            )
            .with_retry(RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::ZERO,
            });
            (engine, self.log)
        }

        fn engine(self, workflow: &str) -> (WorkflowEngine, CallLog) {
            self.engine_with_store(workflow, Arc::new(InMemoryStateStore::new()))
        }
    }

    /// `id = "wf"` with one `[[steps]]` table per `(id, skill, extra)`.
    fn workflow(header: &str, steps: &[(&str, &str, &str)]) -> String {
        let mut toml = format!("id = \"wf\"\n{header}\n");
        for (id, skill, extra) in steps {
            toml.push_str(&format!("\n[[steps]]\nid = \"{id}\"\nskill = \"{skill}\"\n{extra}\n"));
        }
        toml
    }

    fn seven_steps(checkpoints: &[usize], skill_at: impl Fn(usize) -> &'static str) -> String {
        let ids: Vec<String> = (1..=7).map(|i| format!("s{i}")).collect();
        let steps: Vec<(&str, &str, &str)> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let extra = if checkpoints.contains(&(i + 1)) { "checkpoint = true" } else { "" };
                (id.as_str(), skill_at(i + 1), extra)
            })
            .collect();
        workflow("", &steps)
    }

    fn statuses(run: &WorkflowRun) -> Vec<StepStatus> {
        run.results.iter().map(|r| r.status).collect()
    }

    // ── Checkpoints ────────────────────────────────────────────

    mod checkpoints {
        use super::*;

        #[tokio::test]
        async fn seven_steps_pause_exactly_twice() {
            let (engine, log) = Harness::new().engine(&seven_steps(&[1, 5], |_| "work"));

            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(run.status, RunStatus::AwaitingCheckpoint);
            assert_eq!(run.pending_checkpoint, Some(0));
            assert_eq!(*log.lock(), vec!["s1"]);

            let run = engine.signal(&run.run_id, CheckpointDecision::Approve).await.unwrap();
            assert_eq!(run.status, RunStatus::AwaitingCheckpoint);
            assert_eq!(run.pending_checkpoint, Some(4));
            // Nothing past step 5 runs before the second approval.
            assert_eq!(*log.lock(), vec!["s1", "s2", "s3", "s4", "s5"]);

            let run = engine.signal(&run.run_id, CheckpointDecision::Approve).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(log.lock().len(), 7);
            assert_eq!(run.results.len(), 7);

            let reached = engine
                .store()
                .context_history(&ContextFilter {
                    run_id: Some(run.run_id.clone()),
                    kind: Some("checkpoint_reached".into()),
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(reached.len(), 2);
        }

        #[tokio::test]
        async fn reject_aborts_and_keeps_partial_results() {
            let (engine, log) = Harness::new().engine(&workflow(
                "",
                &[
                    ("fetch", "work", ""),
                    ("draft", "work", "checkpoint = true"),
                    ("send", "work", ""),
                ],
            ));

            let run = engine.start("wf", Params::new()).await.unwrap();
            let run = engine
                .signal(
                    &run.run_id,
                    CheckpointDecision::Reject {
                        reason: Some("tone is off".into()),
                    },
                )
                .await
                .unwrap();

            assert_eq!(run.status, RunStatus::Aborted);
            assert_eq!(run.results.len(), 2);
            assert_eq!(run.abort_reason.as_deref(), Some("tone is off"));
            assert_eq!(*log.lock(), vec!["fetch", "draft"]);

            let again = engine.signal(&run.run_id, CheckpointDecision::Approve).await;
            assert!(matches!(again, Err(SkillError::InvalidTransition { .. })));
        }

        #[tokio::test]
        async fn channel_gate_approves_inline() {
            let mut gate = ChannelGate::new();
            let mut rx = gate.take_receiver().unwrap();
            let reviewed: Arc<Mutex<Vec<String>>> = Arc::default();
            let seen = Arc::clone(&reviewed);
            tokio::spawn(async move {
                while let Some((request, reply)) = rx.recv().await {
                    seen.lock().push(request.step_id.clone());
                    let _ = reply.send(CheckpointDecision::Approve);
                }
            });

            let (engine, _log) = Harness::new().engine(&seven_steps(&[1, 5], |_| "work"));
            let engine = engine.with_gate(Arc::new(gate));

            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(*reviewed.lock(), vec!["s1", "s5"]);
        }

        #[tokio::test]
        async fn gate_timeout_rejects() {
            let mut gate = ChannelGate::new().with_timeout(Some(Duration::from_millis(20)));
            let _rx = gate.take_receiver();

            let (engine, log) = Harness::new().engine(&seven_steps(&[2], |_| "work"));
            let engine = engine.with_gate(Arc::new(gate));

            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(run.status, RunStatus::Aborted);
            assert_eq!(run.results.len(), 2);
            assert_eq!(log.lock().len(), 2);
        }

        #[tokio::test]
        async fn suspended_run_resumes_from_disk() {
            let dir = tempfile::tempdir().unwrap();
            let db = dir.path().join("state.db");
            let wf = workflow("", &[("a", "work", "checkpoint = true"), ("b", "work", "")]);

            let run_id = {
                let store = Arc::new(skilldeck_store::SqliteStateStore::open(&db).unwrap());
                let (engine, _) = Harness::new().engine_with_store(&wf, store);
                let run = engine.start("wf", Params::new()).await.unwrap();
                assert_eq!(run.status, RunStatus::AwaitingCheckpoint);
                run.run_id
            };

            let store = Arc::new(skilldeck_store::SqliteStateStore::open(&db).unwrap());
            let (engine, log) = Harness::new().engine_with_store(&wf, store);
            assert_eq!(engine.status(&run_id).unwrap().status, RunStatus::AwaitingCheckpoint);

            let run = engine.signal(&run_id, CheckpointDecision::Approve).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            // Only the step after the checkpoint ran in this process.
            assert_eq!(*log.lock(), vec!["b"]);
            assert_eq!(run.results.len(), 2);
        }
    }

    // ── Failures ───────────────────────────────────────────────

    mod failures {
        use super::*;

        #[tokio::test]
        async fn independent_steps_run_after_failure() {
            let mut h = Harness::new();
            h.skill("broken", Behaviour::FailAlways(fatal));
            let (engine, log) = h.engine(&workflow(
                "",
                &[
                    ("s1", "work", ""),
                    ("s2", "broken", ""),
                    ("s3", "work", "inputs = { x = { from = \"s2\" } }"),
                    ("s4", "work", "inputs = { x = { from = \"s1\", path = \"step\" } }"),
                ],
            ));

            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(
                statuses(&run),
                vec![
                    StepStatus::Succeeded,
                    StepStatus::Failed,
                    StepStatus::SkippedDependencyFailed,
                    StepStatus::Succeeded,
                ]
            );

            let failed = run.result_for("s2").unwrap();
            assert_eq!(failed.attempts, 1);
            assert_eq!(failed.skill_id, "broken");
            assert_eq!(failed.error.as_ref().unwrap().kind, skilldeck_core::ErrorKind::Fatal);

            assert_eq!(run.output_of("s4").unwrap()["params"]["x"], json!("s1"));
            assert_eq!(*log.lock(), vec!["s1", "s2", "s4"]);
        }

        #[tokio::test]
        async fn skips_propagate_through_depends_on() {
            let mut h = Harness::new();
            h.skill("broken", Behaviour::FailAlways(fatal));
            let (engine, _) = h.engine(&workflow(
                "",
                &[
                    ("a", "broken", ""),
                    ("b", "work", "depends_on = [\"a\"]"),
                    ("c", "work", "depends_on = [\"b\"]"),
                ],
            ));

            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(
                statuses(&run),
                vec![
                    StepStatus::Failed,
                    StepStatus::SkippedDependencyFailed,
                    StepStatus::SkippedDependencyFailed,
                ]
            );
        }

        #[tokio::test]
        async fn transient_failures_are_retried() {
            let mut h = Harness::new();
            h.skill("flaky", Behaviour::FailFirst(2, transient));
            let (engine, log) = h.engine(&workflow("", &[("only", "flaky", "")]));

            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(run.results[0].attempts, 3);
            assert_eq!(log.lock().len(), 3);
        }

        #[tokio::test]
        async fn step_retry_override_limits_attempts() {
            let mut h = Harness::new();
            h.skill("flaky", Behaviour::FailFirst(2, transient));
            let (engine, _) = h.engine(&workflow(
                "",
                &[("only", "flaky", "[steps.retry]\nmax_attempts = 2")],
            ));

            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(run.results[0].status, StepStatus::Failed);
            assert_eq!(run.results[0].attempts, 2);
            assert_eq!(
                run.results[0].error.as_ref().unwrap().kind,
                skilldeck_core::ErrorKind::Transient
            );
        }

        #[tokio::test]
        async fn halt_then_retry_failed_step() {
            let mut h = Harness::new();
            h.skill("once", Behaviour::FailFirst(1, fatal));
            let (engine, log) = h.engine(&workflow(
                "continue_on_error = false",
                &[("a", "work", ""), ("b", "once", ""), ("c", "work", "")],
            ));

            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(run.status, RunStatus::StepFailed);
            assert_eq!(statuses(&run), vec![StepStatus::Succeeded, StepStatus::Failed]);
            assert!(engine.runs(false).unwrap().is_empty());
            assert!(matches!(
                engine.advance(&run.run_id).await,
                Err(SkillError::InvalidTransition { .. })
            ));

            let run = engine.retry_step(&run.run_id).await.unwrap();
            assert_eq!(run.status, RunStatus::Completed);
            assert_eq!(
                statuses(&run),
                vec![StepStatus::Succeeded, StepStatus::Succeeded, StepStatus::Succeeded]
            );
            assert_eq!(*log.lock(), vec!["a", "b", "b", "c"]);

            assert!(matches!(
                engine.retry_step(&run.run_id).await,
                Err(SkillError::InvalidTransition { .. })
            ));
        }

        #[tokio::test]
        async fn missing_run_parameter_rejected_up_front() {
            let (engine, log) = Harness::new().engine(&workflow(
                "params = [\"client:string\"]",
                &[("a", "work", "inputs = { who = { input = \"client\" } }")],
            ));

            let err = engine.start("wf", Params::new()).await.unwrap_err();
            assert_eq!(err.kind(), skilldeck_core::ErrorKind::Validation);
            assert!(log.lock().is_empty());

            let mut params = Params::new();
            params.insert("client".into(), json!("acme"));
            let run = engine.start("wf", params).await.unwrap();
            assert_eq!(run.output_of("a").unwrap()["params"]["who"], json!("acme"));
        }
    }

    // ── Cancellation and locking ───────────────────────────────

    mod cancellation {
        use super::*;

        fn blocking_engine() -> (Arc<WorkflowEngine>, CallLog, Arc<Notify>) {
            let started = Arc::new(Notify::new());
            let mut h = Harness::new();
            h.skill("blocker", Behaviour::Block(Arc::clone(&started)));
            let (engine, log) =
                h.engine(&seven_steps(&[], |i| if i == 4 { "blocker" } else { "work" }));
            (Arc::new(engine), log, started)
        }

        #[tokio::test]
        async fn cancel_after_step_three_keeps_three_results() {
            let (engine, log, started) = blocking_engine();
            let run = engine.create("wf", Params::new()).unwrap();

            let handle = {
                let engine = Arc::clone(&engine);
                let run_id = run.run_id.clone();
                tokio::spawn(async move { engine.advance(&run_id).await })
            };
            started.notified().await;

            assert!(matches!(engine.cancel(&run.run_id).unwrap(), CancelOutcome::Signalled));
            let run = handle.await.unwrap().unwrap();

            assert_eq!(run.status, RunStatus::Aborted);
            assert_eq!(run.results.len(), 3);
            assert!(run.results.iter().all(|r| r.status == StepStatus::Succeeded));
            assert!(run.result_for("s4").is_none());
            assert_eq!(*log.lock(), vec!["s1", "s2", "s3", "s4"]);

            let stored = engine.status(&run.run_id).unwrap();
            assert_eq!(stored.status, RunStatus::Aborted);
            assert_eq!(stored.results.len(), 3);
        }

        #[tokio::test]
        async fn concurrent_drive_is_refused() {
            let (engine, _log, started) = blocking_engine();
            let run = engine.create("wf", Params::new()).unwrap();

            let handle = {
                let engine = Arc::clone(&engine);
                let run_id = run.run_id.clone();
                tokio::spawn(async move { engine.advance(&run_id).await })
            };
            started.notified().await;

            assert!(matches!(
                engine.advance(&run.run_id).await,
                Err(SkillError::RunLocked(_))
            ));

            engine.cancel(&run.run_id).unwrap();
            handle.await.unwrap().unwrap();
            // Lock released once the driver returns.
            assert!(matches!(
                engine.advance(&run.run_id).await,
                Err(SkillError::InvalidTransition { .. })
            ));
        }

        #[tokio::test]
        async fn cancel_idle_run() {
            let (engine, log) = Harness::new().engine(&seven_steps(&[2], |_| "work"));
            let run = engine.start("wf", Params::new()).await.unwrap();
            assert_eq!(run.status, RunStatus::AwaitingCheckpoint);

            let CancelOutcome::Aborted(run) = engine.cancel(&run.run_id).unwrap() else {
                panic!("idle run should abort immediately");
            };
            assert_eq!(run.status, RunStatus::Aborted);
            assert_eq!(run.results.len(), 2);
            assert_eq!(log.lock().len(), 2);

            assert!(engine.cancel(&run.run_id).is_err());
            assert!(matches!(engine.status("missing"), Err(SkillError::RunNotFound(_))));
        }
    }

    // ── Batch retry ────────────────────────────────────────────

    mod batch {
        use super::*;
        use skilldeck_core::ItemStatus;
        use std::collections::HashMap;

        #[derive(Default)]
        struct CountingSubmitter {
            calls: Mutex<HashMap<String, usize>>,
            order: Mutex<Vec<String>>,
            failing: Vec<String>,
            /// Per-key artificial latency.
            latency: HashMap<String, Duration>,
        }

        impl CountingSubmitter {
            fn total(&self) -> usize {
                self.calls.lock().values().sum()
            }
        }

        #[async_trait]
        impl ItemSubmitter for CountingSubmitter {
            async fn submit(&self, item: &RetryableItem) -> skilldeck_core::Result<Value> {
                *self.calls.lock().entry(item.key.clone()).or_default() += 1;
                if let Some(delay) = self.latency.get(&item.key) {
                    tokio::time::sleep(*delay).await;
                }
                self.order.lock().push(item.key.clone());
                if self.failing.contains(&item.key) {
                    return Err(SkillError::Fatal(format!("{} cannot be requeued", item.key)));
                }
                Ok(json!({"requeued": item.key}))
            }
        }

        fn items(spec: &[(&str, ItemStatus)]) -> Vec<RetryableItem> {
            spec.iter().map(|(k, s)| RetryableItem::new(*k, *s)).collect()
        }

        fn policy(statuses: &[ItemStatus]) -> BatchPolicy {
            BatchPolicy::default()
                .with_statuses(statuses.iter().copied())
                .with_delay(Duration::ZERO)
                .with_max_items(100)
        }

        fn mixed() -> Vec<RetryableItem> {
            items(&[
                ("t1", ItemStatus::Failed),
                ("t2", ItemStatus::Error),
                ("t3", ItemStatus::Stopped),
                ("t4", ItemStatus::Timeout),
                ("t5", ItemStatus::Completed),
            ])
        }

        #[tokio::test]
        async fn dry_run_makes_no_calls() {
            let submitter = Arc::new(CountingSubmitter::default());
            let executor = BatchExecutor::new(submitter.clone());
            let policy = policy(&[ItemStatus::Failed, ItemStatus::Error, ItemStatus::Timeout])
                .with_dry_run(true)
                .with_max_items(2);

            let result = executor.execute(mixed(), &policy).await.unwrap();
            assert_eq!(submitter.total(), 0);
            assert!(result.dry_run);
            assert_eq!(result.selected_keys(), vec!["t1", "t2"]);
            assert_eq!(result.counters.would_retry, 2);
            assert_eq!(result.counters.skipped_cap, 1);
            assert_eq!(result.counters.skipped_status_filtered, 2);

            // The preview did not consume the ledger.
            let live = executor.execute(mixed(), &policy.with_dry_run(false)).await.unwrap();
            assert_eq!(live.counters.retried, 2);
        }

        #[tokio::test]
        async fn mixed_statuses_select_exactly_two() {
            let submitter = Arc::new(CountingSubmitter::default());
            let filter = [ItemStatus::Failed, ItemStatus::Error];

            let forward = BatchExecutor::new(submitter.clone())
                .execute(mixed(), &policy(&filter))
                .await
                .unwrap();
            assert_eq!(forward.selected_keys(), vec!["t1", "t2"]);

            let mut reversed = mixed();
            reversed.reverse();
            let backward = BatchExecutor::new(Arc::new(CountingSubmitter::default()))
                .execute(reversed, &policy(&filter))
                .await
                .unwrap();
            assert_eq!(backward.counters.retried, 2);
            assert_eq!(backward.counters.skipped_status_filtered, 3);
        }

        #[tokio::test]
        async fn resubmission_is_idempotent() {
            let submitter = Arc::new(CountingSubmitter::default());
            let executor = BatchExecutor::new(submitter.clone());
            let p = policy(&[ItemStatus::Failed]);
            let batch = items(&[("a", ItemStatus::Failed), ("a", ItemStatus::Failed), ("b", ItemStatus::Failed)]);

            let first = executor.execute(batch.clone(), &p).await.unwrap();
            assert_eq!(first.counters.retried, 2);
            assert_eq!(first.counters.skipped_duplicate, 1);

            let second = executor.execute(batch, &p).await.unwrap();
            assert_eq!(second.counters.retried, 0);
            assert_eq!(second.counters.skipped_duplicate, 3);

            let calls = submitter.calls.lock();
            assert_eq!(calls["a"], 1);
            assert_eq!(calls["b"], 1);
            drop(calls);

            // A changed remote state is a new submission.
            let changed = vec![RetryableItem::new("a", ItemStatus::Failed).with_revision("2")];
            let third = executor.execute(changed, &p).await.unwrap();
            assert_eq!(third.counters.retried, 1);
            assert_eq!(submitter.calls.lock()["a"], 2);
        }

        #[tokio::test]
        async fn failures_do_not_stop_the_batch() {
            let submitter = Arc::new(CountingSubmitter {
                failing: vec!["b".into()],
                ..Default::default()
            });
            let result = BatchExecutor::new(submitter.clone())
                .execute(
                    items(&[("a", ItemStatus::Error), ("b", ItemStatus::Error), ("c", ItemStatus::Error)]),
                    &policy(&[ItemStatus::Error]),
                )
                .await
                .unwrap();

            let outcomes: Vec<_> = result.items.iter().map(|r| r.outcome).collect();
            assert_eq!(
                outcomes,
                vec![ItemOutcome::Retried, ItemOutcome::FailedAgain, ItemOutcome::Retried]
            );
            assert!(result.has_failures());
            assert_eq!(result.items[1].error.as_ref().unwrap().kind, skilldeck_core::ErrorKind::Fatal);

            // The failed item is not in the ledger, so it can be retried later.
            let again = BatchExecutor::new(submitter.clone())
                .execute(items(&[("b", ItemStatus::Error)]), &policy(&[ItemStatus::Error]))
                .await
                .unwrap();
            assert_eq!(again.counters.failed_again, 1);
        }

        #[tokio::test]
        async fn concurrent_results_keep_input_order() {
            let latency = HashMap::from([
                ("slow".to_string(), Duration::from_millis(60)),
                ("medium".to_string(), Duration::from_millis(30)),
            ]);
            let submitter = Arc::new(CountingSubmitter {
                latency,
                ..Default::default()
            });
            let result = BatchExecutor::new(submitter.clone())
                .execute(
                    items(&[
                        ("slow", ItemStatus::Failed),
                        ("medium", ItemStatus::Failed),
                        ("fast", ItemStatus::Failed),
                    ]),
                    &policy(&[ItemStatus::Failed]).with_concurrency(3),
                )
                .await
                .unwrap();

            let keys: Vec<_> = result.items.iter().map(|r| r.key.as_str()).collect();
            assert_eq!(keys, vec!["slow", "medium", "fast"]);
            // Completion order differed.
            assert_eq!(*submitter.order.lock(), vec!["fast", "medium", "slow"]);
        }

        #[tokio::test]
        async fn delay_paces_submissions() {
            let submitter = Arc::new(CountingSubmitter::default());
            let started = std::time::Instant::now();
            BatchExecutor::new(submitter.clone())
                .execute(
                    items(&[("a", ItemStatus::Failed), ("b", ItemStatus::Failed), ("c", ItemStatus::Failed)]),
                    &policy(&[ItemStatus::Failed]).with_delay(Duration::from_millis(25)),
                )
                .await
                .unwrap();
            assert!(started.elapsed() >= Duration::from_millis(50));
            assert_eq!(submitter.total(), 3);
        }
    }

    // ── Session ────────────────────────────────────────────────

    mod session {
        use super::*;
        use skilldeck_config::SkilldeckConfig;
        use skilldeck_core::ItemStatus;

        /// Lists three tasks and records which ones were requeued.
        #[derive(Default)]
        struct TaskService {
            requeued: Mutex<Vec<String>>,
            listed_with: Mutex<Option<Params>>,
        }

        #[async_trait]
        impl Skill for TaskService {
            async fn invoke(&self, params: Params, _ctx: &InvocationContext) -> skilldeck_core::Result<Value> {
                match params.get("action").and_then(Value::as_str) {
                    Some("list") => {
                        *self.listed_with.lock() = Some(params.clone());
                        Ok(json!({"items": [
                            {"id": "t1", "status": "FAILED"},
                            {"id": "t2", "status": "completed"},
                            {"id": "t3", "status": "Timeout"},
                        ]}))
                    }
                    Some("retry") => {
                        let id = params["ids"].as_str().unwrap_or_default().to_string();
                        self.requeued.lock().push(id.clone());
                        Ok(json!({"requeued": id}))
                    }
                    _ => Err(SkillError::Validation("unknown action".into())),
                }
            }
        }

        fn session(service: Arc<TaskService>) -> Session {
            let mut registry = SkillRegistry::new();
            let mut tasks = SkillDescriptor::new("task-retry", Category::System)
                .with_triggers(["retry failed tasks"]);
            tasks.lookback_days = Some(7);
            registry.register_with(tasks, service).unwrap();
            registry
                .register_with(
                    SkillDescriptor::new("standup", Category::System).with_triggers(["standup"]),
                    Arc::new(TaskService::default()),
                )
                .unwrap();

            let mut catalog = WorkflowCatalog::new();
            let def = WorkflowDefinition::from_toml(
                "id = \"morning\"\ntriggers = [\"morning routine\"]\n[[steps]]\nid = \"a\"\nskill = \"standup\"\n",
                Category::User,
            )
            .unwrap();
            catalog.register(def, &registry).unwrap();

            Session::new(
                SkilldeckConfig::default(),
                registry,
                catalog,
                Arc::new(InMemoryStateStore::new()),
                Credentials::new(),
            )
        }

        #[test]
        fn dispatch_resolves_skills_and_workflows() {
            let s = session(Arc::default());
            assert!(matches!(
                s.dispatch("please retry failed tasks from yesterday").unwrap(),
                Dispatch::Skill(d) if d.id == "task-retry"
            ));
            assert!(matches!(
                s.dispatch("start my morning routine").unwrap(),
                Dispatch::Workflow(w) if w.id == "morning"
            ));
            assert!(matches!(s.dispatch("order pizza").unwrap(), Dispatch::NoMatch));
        }

        #[tokio::test]
        async fn batch_retry_through_skill() {
            let service = Arc::new(TaskService::default());
            let s = session(Arc::clone(&service));
            let policy = BatchPolicy::default()
                .with_statuses([ItemStatus::Failed, ItemStatus::Timeout])
                .with_delay(Duration::ZERO);

            let result = s.batch_retry("task-retry", &ItemQuery::default(), &policy).await.unwrap();
            assert_eq!(result.selected_keys(), vec!["t1", "t3"]);
            assert_eq!(*service.requeued.lock(), vec!["t1", "t3"]);
            // The skill's own lookback applies when the query sets none.
            assert_eq!(service.listed_with.lock().as_ref().unwrap()["days"], json!(7));

            // Recorded in the session's ledger: a second pass is a no-op.
            let again = s.batch_retry("task-retry", &ItemQuery::default(), &policy).await.unwrap();
            assert_eq!(again.counters.skipped_duplicate, 2);
            assert_eq!(service.requeued.lock().len(), 2);
        }

        #[test]
        fn notes_land_in_history() {
            let s = session(Arc::default());
            s.note("client prefers email", Some("acme")).unwrap();
            let history = s
                .history(&ContextFilter {
                    project: Some("acme".into()),
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(history.len(), 1);
            assert_eq!(history[0].kind, "note");
            assert!(s.store().verify_context_chain().unwrap().is_intact());
        }
    }
}
