use serde_json::Value;
use skilldeck_core::{InvocationContext, Params, SkillError, SkillResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::registry::SkillRegistry;

/// Enforces the invocation contract in front of every skill call.
///
/// Order of checks: the skill must exist and be invocable, the shared
/// libraries it uses are materialized, its credentials are present, and the
/// parameters validate against its contract. Only then is the skill
/// invoked, bounded by a timeout and the context's cancellation token.
#[derive(Clone)]
pub struct SkillDispatcher {
    registry: Arc<SkillRegistry>,
    default_timeout: Option<Duration>,
}

impl SkillDispatcher {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self {
            registry,
            default_timeout: None,
        }
    }

    /// Applied when the invocation context carries no timeout of its own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    pub async fn invoke(
        &self,
        skill_id: &str,
        params: Params,
        ctx: &InvocationContext,
    ) -> skilldeck_core::Result<Value> {
        let descriptor = self.registry.resolve(skill_id)?;
        if !descriptor.is_invocable() {
            return Err(SkillError::NotInvocable(skill_id.to_string()));
        }

        for library in &descriptor.uses {
            self.registry.materialize_library(library, &ctx.credentials)?;
        }
        ctx.credentials.require_all(&descriptor.requires)?;
        let params = descriptor.contract.validate(params)?;
        let implementation = self.registry.implementation(skill_id)?;

        debug!(skill = skill_id, run_id = ?ctx.run_id, step = ?ctx.step_id, "invoking skill");

        let call = implementation.invoke(params, ctx);
        let timeout = ctx.timeout.or(self.default_timeout);
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                Err(SkillError::Fatal("invocation cancelled".into()))
            }
            r = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                        Err(SkillError::Transient(format!(
                            "skill '{skill_id}' timed out after {}s",
                            limit.as_secs_f64()
                        )))
                    }),
                    None => call.await,
                }
            } => r,
        };

        if let Err(e) = &result {
            warn!(skill = skill_id, kind = %e.kind(), error = %e, "skill invocation failed");
        }
        result
    }

    /// Invoke and fold the result into the uniform response shape.
    pub async fn respond(
        &self,
        skill_id: &str,
        params: Params,
        ctx: &InvocationContext,
    ) -> SkillResponse {
        self.invoke(skill_id, params, ctx).await.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::SkillDescriptor;
    use async_trait::async_trait;
    use serde_json::json;
    use skilldeck_core::{Category, Credentials, ErrorKind, ParamSpec, Skill, SkillKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Skill for Echo {
        async fn invoke(&self, params: Params, _ctx: &InvocationContext) -> skilldeck_core::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(params))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Skill for Sleepy {
        async fn invoke(&self, _params: Params, _ctx: &InvocationContext) -> skilldeck_core::Result<Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    fn registry(echo: Arc<Echo>) -> Arc<SkillRegistry> {
        let mut reg = SkillRegistry::new();
        let mut desc = SkillDescriptor::new("tasks", Category::System);
        desc.requires = vec!["BEAM_API_KEY".into()];
        desc.uses = vec!["beam-auth".into()];
        desc.contract.params = vec![ParamSpec::parse("days:integer").unwrap()];
        reg.register_with(desc, echo).unwrap();

        let mut lib = SkillDescriptor::new("beam-auth", Category::System).with_kind(SkillKind::SharedLibrary);
        lib.requires = vec!["BEAM_WORKSPACE".into()];
        reg.register(lib).unwrap();

        reg.register_with(SkillDescriptor::new("sleepy", Category::System), Arc::new(Sleepy))
            .unwrap();
        Arc::new(reg)
    }

    fn ctx(keys: &[&str]) -> InvocationContext {
        let mut creds = Credentials::new();
        for k in keys {
            creds.insert(*k, "secret");
        }
        InvocationContext::new(Arc::new(creds))
    }

    fn days(v: Value) -> Params {
        let mut p = Params::new();
        p.insert("days".into(), v);
        p
    }

    #[tokio::test]
    async fn missing_credential_fails_before_call() {
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        let d = SkillDispatcher::new(registry(echo.clone()));

        // Library credential missing.
        let err = d.invoke("tasks", days(json!(1)), &ctx(&["BEAM_API_KEY"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.message().contains("BEAM_WORKSPACE"));

        // Skill credential missing.
        let err = d.invoke("tasks", days(json!(1)), &ctx(&["BEAM_WORKSPACE"])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn params_validated_and_coerced() {
        let echo = Arc::new(Echo { calls: AtomicUsize::new(0) });
        let d = SkillDispatcher::new(registry(echo.clone()));
        let c = ctx(&["BEAM_API_KEY", "BEAM_WORKSPACE"]);

        let err = d.invoke("tasks", days(json!("soon")), &c).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let out = d.invoke("tasks", days(json!("3")), &c).await.unwrap();
        assert_eq!(out, json!({"days": 3}));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn library_cannot_be_invoked() {
        let d = SkillDispatcher::new(registry(Arc::new(Echo { calls: AtomicUsize::new(0) })));
        let resp = d.respond("beam-auth", Params::new(), &ctx(&[])).await;
        assert!(!resp.is_ok());
        let err = d.invoke("beam-auth", Params::new(), &ctx(&[])).await.unwrap_err();
        assert!(matches!(err, SkillError::NotInvocable(_)));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let d = SkillDispatcher::new(registry(Arc::new(Echo { calls: AtomicUsize::new(0) })))
            .with_default_timeout(Some(Duration::from_millis(20)));
        let err = d.invoke("sleepy", Params::new(), &ctx(&[])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn cancellation_interrupts_call() {
        let d = SkillDispatcher::new(registry(Arc::new(Echo { calls: AtomicUsize::new(0) })));
        let c = ctx(&[]);
        let token = c.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = d.invoke("sleepy", Params::new(), &c).await.unwrap_err();
        assert!(err.message().contains("cancelled"));
    }
}
