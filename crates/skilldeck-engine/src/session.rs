use serde_json::Value;
use skilldeck_config::{ConfigLoader, SkilldeckConfig};
use skilldeck_core::{Credentials, InvocationContext, Params};
use skilldeck_skills::{
    Candidate, MatchOutcome, MatchTarget, Resolution, SkillDescriptor, SkillDispatcher,
    SkillRegistry, TriggerMatcher,
};
use skilldeck_store::{
    ContextEntry, ContextFilter, InMemoryStateStore, SqliteStateStore, StateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::approval::CheckpointGate;
use crate::batch::{BatchExecutor, BatchPolicy, BatchRetryResult, ItemQuery, ItemSource, SkillBatchAdapter};
use crate::catalog::WorkflowCatalog;
use crate::definition::WorkflowDefinition;
use crate::engine::WorkflowEngine;

/// What an utterance resolved to.
#[derive(Debug)]
pub enum Dispatch {
    Skill(Arc<SkillDescriptor>),
    Workflow(Arc<WorkflowDefinition>),
    NoMatch,
    /// Equally good candidates; the caller must pick one.
    Ambiguous(Vec<Candidate>),
}

/// Everything one process needs, built once at startup and passed by
/// reference: loaded skills and workflows, the trigger matcher, the state
/// store, credentials and the workflow engine.
pub struct Session {
    config: SkilldeckConfig,
    registry: Arc<SkillRegistry>,
    catalog: Arc<WorkflowCatalog>,
    matcher: TriggerMatcher,
    dispatcher: SkillDispatcher,
    engine: WorkflowEngine,
    store: Arc<dyn StateStore>,
    credentials: Arc<Credentials>,
}

impl Session {
    /// Discover skills and workflows and open the state database named by
    /// the loaded configuration.
    pub fn open(loader: &ConfigLoader) -> skilldeck_core::Result<Self> {
        let config = loader.get();

        let mut registry = SkillRegistry::with_dirs(&config.skills.system_dirs, &config.skills.user_dirs);
        registry.discover()?;

        let mut catalog =
            WorkflowCatalog::with_dirs(&config.workflows.system_dirs, &config.workflows.user_dirs);
        catalog.discover(&registry)?;

        let store: Arc<dyn StateStore> = if config.state.db_path.as_os_str() == ":memory:" {
            Arc::new(InMemoryStateStore::new())
        } else {
            Arc::new(SqliteStateStore::open(&config.state.db_path)?)
        };

        info!(
            skills = registry.count(),
            workflows = catalog.len(),
            db = %config.state.db_path.display(),
            "session opened"
        );
        Ok(Self::new(config, registry, catalog, store, loader.credentials()))
    }

    pub fn new(
        config: SkilldeckConfig,
        registry: SkillRegistry,
        catalog: WorkflowCatalog,
        store: Arc<dyn StateStore>,
        credentials: Credentials,
    ) -> Self {
        let mut matcher = TriggerMatcher::from_registry(&registry);
        catalog.add_triggers(&mut matcher);

        let registry = Arc::new(registry);
        let catalog = Arc::new(catalog);
        let credentials = Arc::new(credentials);
        let dispatcher = SkillDispatcher::new(Arc::clone(&registry)).with_default_timeout(
            (config.engine.step_timeout_secs > 0)
                .then(|| Duration::from_secs(config.engine.step_timeout_secs)),
        );
        let engine = WorkflowEngine::new(
            dispatcher.clone(),
            Arc::clone(&catalog),
            Arc::clone(&store),
            Arc::clone(&credentials),
        )
        .with_config(&config.engine);

        Self {
            config,
            registry,
            catalog,
            matcher,
            dispatcher,
            engine,
            store,
            credentials,
        }
    }

    /// Route checkpoints through `gate` instead of suspending the run.
    pub fn with_gate(mut self, gate: Arc<dyn CheckpointGate>) -> Self {
        self.engine = self.engine.with_gate(gate);
        self
    }

    pub fn config(&self) -> &SkilldeckConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<WorkflowCatalog> {
        &self.catalog
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn match_utterance(&self, utterance: &str) -> MatchOutcome {
        self.matcher.match_utterance(utterance)
    }

    /// Resolve an utterance to a single skill or workflow.
    pub fn dispatch(&self, utterance: &str) -> skilldeck_core::Result<Dispatch> {
        let outcome = self.matcher.match_utterance(utterance);
        match outcome.resolution() {
            Resolution::NoMatch => Ok(Dispatch::NoMatch),
            Resolution::Ambiguous(tied) => Ok(Dispatch::Ambiguous(tied.into_iter().cloned().collect())),
            Resolution::Unique(candidate) => match &candidate.target {
                MatchTarget::Skill(id) => Ok(Dispatch::Skill(self.registry.resolve(id)?)),
                MatchTarget::Workflow(id) => Ok(Dispatch::Workflow(self.catalog.get(id)?)),
            },
        }
    }

    fn context(&self) -> InvocationContext {
        InvocationContext::new(Arc::clone(&self.credentials))
    }

    /// One-off invocation outside any workflow.
    pub async fn invoke_skill(&self, skill_id: &str, params: Params) -> skilldeck_core::Result<Value> {
        self.dispatcher.invoke(skill_id, params, &self.context()).await
    }

    /// List items through `skill_id` and retry those `policy` selects.
    pub async fn batch_retry(
        &self,
        skill_id: &str,
        query: &ItemQuery,
        policy: &BatchPolicy,
    ) -> skilldeck_core::Result<BatchRetryResult> {
        let adapter = Arc::new(
            SkillBatchAdapter::new(self.dispatcher.clone(), skill_id, self.context())
                .with_default_days(self.config.batch.default_lookback_days),
        );
        let items = adapter.fetch(query).await?;
        info!(skill = skill_id, items = items.len(), "fetched batch candidates");
        BatchExecutor::new(adapter)
            .with_ledger(Arc::clone(&self.store))
            .execute(items, policy)
            .await
    }

    /// Append a free-form project note to the context history.
    pub fn note(&self, message: &str, project: Option<&str>) -> skilldeck_core::Result<ContextEntry> {
        let mut entry = ContextEntry::new("note", message);
        if let Some(project) = project {
            entry = entry.with_project(project);
        }
        self.store.append_context(entry)
    }

    pub fn history(&self, filter: &ContextFilter) -> skilldeck_core::Result<Vec<ContextEntry>> {
        self.store.context_history(filter)
    }
}
