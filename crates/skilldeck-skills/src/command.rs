use async_trait::async_trait;
use serde_json::Value;
use skilldeck_core::{InvocationContext, Params, Skill, SkillError, SkillId, SkillResponse};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::definition::SkillDescriptor;

/// Exit status a command uses to report a transient failure (EX_TEMPFAIL).
pub const EXIT_TEMPFAIL: i32 = 75;

/// A skill backed by an external program.
///
/// The program runs through `sh -c` in the skill's directory. It receives the
/// validated parameters as a JSON object on stdin and the skill's required
/// credentials as environment variables. It answers with a `SkillResponse`
/// on stdout (the whole output or its last line).
#[derive(Debug, Clone)]
pub struct CommandSkill {
    skill_id: SkillId,
    program: String,
    working_dir: PathBuf,
    credential_keys: Vec<String>,
}

impl CommandSkill {
    pub fn new(skill_id: impl Into<SkillId>, program: impl Into<String>) -> Self {
        Self {
            skill_id: skill_id.into(),
            program: program.into(),
            working_dir: PathBuf::from("."),
            credential_keys: Vec::new(),
        }
    }

    /// Build from a descriptor's `command`, if it declares one.
    pub fn from_descriptor(descriptor: &SkillDescriptor) -> Option<Self> {
        let program = descriptor.command.as_ref()?;
        let working_dir = if descriptor.base_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            descriptor.base_dir.clone()
        };
        Some(Self {
            skill_id: descriptor.id.clone(),
            program: program.clone(),
            working_dir,
            credential_keys: descriptor.requires.clone(),
        })
    }

    pub fn with_credentials(mut self, keys: Vec<String>) -> Self {
        self.credential_keys = keys;
        self
    }
}

#[async_trait]
impl Skill for CommandSkill {
    async fn invoke(&self, params: Params, ctx: &InvocationContext) -> skilldeck_core::Result<Value> {
        let input = serde_json::to_vec(&Value::Object(params))?;

        info!(skill = %self.skill_id, command = %self.program, "executing skill command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.program)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("SKILLDECK_SKILL", &self.skill_id);
        if let Some(run_id) = &ctx.run_id {
            cmd.env("SKILLDECK_RUN_ID", run_id);
        }
        for key in &self.credential_keys {
            if let Some(value) = ctx.credentials.get(key) {
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            SkillError::Fatal(format!("failed to start '{}': {}", self.program, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input may exit before reading it.
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(skill = %self.skill_id, exit_code, "skill command finished");

        interpret_output(&stdout, &stderr, exit_code)
    }
}

/// Map a finished command to the invocation result.
fn interpret_output(stdout: &str, stderr: &str, exit_code: i32) -> skilldeck_core::Result<Value> {
    let stdout = stdout.trim();
    let last_line = stdout.lines().rev().find(|l| !l.trim().is_empty());
    let response = serde_json::from_str::<SkillResponse>(stdout)
        .ok()
        .or_else(|| last_line.and_then(|l| serde_json::from_str::<SkillResponse>(l).ok()));
    if let Some(response) = response {
        return response.into_result();
    }

    let detail = || {
        let tail: String = stderr.trim().chars().rev().take(2_000).collect();
        let tail: String = tail.chars().rev().collect();
        if tail.is_empty() {
            format!("exit code {exit_code}")
        } else {
            format!("exit code {exit_code}: {tail}")
        }
    };

    match exit_code {
        0 => Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string()))),
        EXIT_TEMPFAIL => Err(SkillError::Transient(detail())),
        _ => Err(SkillError::Fatal(detail())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skilldeck_core::ErrorKind;

    #[test]
    fn response_on_last_line() {
        let out = "fetching...\n{\"status\":\"ok\",\"data\":{\"n\":2}}\n";
        assert_eq!(interpret_output(out, "", 0).unwrap(), json!({"n": 2}));
    }

    #[test]
    fn error_response_wins_over_exit_code() {
        let out = r#"{"status":"error","error":{"kind":"authentication","message":"bad key"}}"#;
        let err = interpret_output(out, "", 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.message(), "bad key");
    }

    #[test]
    fn plain_output_becomes_data() {
        assert_eq!(interpret_output("[1,2]", "", 0).unwrap(), json!([1, 2]));
        assert_eq!(interpret_output("done", "", 0).unwrap(), json!("done"));
    }

    #[test]
    fn exit_codes_classified() {
        let err = interpret_output("", "upstream 503", EXIT_TEMPFAIL).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.message().contains("upstream 503"));

        let err = interpret_output("", "", 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(err.message(), "exit code 2");
    }
}
