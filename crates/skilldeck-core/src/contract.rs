use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, SkillError};
use crate::types::InvocationContext;

/// Named parameters passed to a skill invocation.
pub type Params = serde_json::Map<String, Value>;

/// Declared type of a single parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "values")]
pub enum ParamKind {
    String,
    Integer,
    /// Calendar date, `YYYY-MM-DD`.
    Date,
    Bool,
    Enum(Vec<String>),
}

/// One accepted parameter of a skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    /// Regex the (string form of the) value must match, e.g. an id shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ParamSpec {
    /// Parse a compact spec such as `agent_id:string`, `days:integer?` or
    /// `mode:enum(fast|full)`. A trailing `?` marks the parameter optional.
    pub fn parse(spec: &str) -> crate::Result<Self> {
        let spec = spec.trim();
        let (name, ty) = spec
            .split_once(':')
            .map(|(n, t)| (n.trim(), t.trim()))
            .unwrap_or((spec, "string"));
        if name.is_empty() {
            return Err(SkillError::Validation(format!(
                "parameter spec '{spec}' has no name"
            )));
        }

        let (ty, required) = match ty.strip_suffix('?') {
            Some(t) => (t.trim(), false),
            None => (ty, true),
        };

        let kind = match ty {
            "string" | "str" => ParamKind::String,
            "integer" | "int" => ParamKind::Integer,
            "date" => ParamKind::Date,
            "bool" | "boolean" | "flag" => ParamKind::Bool,
            other => {
                let inner = other
                    .strip_prefix("enum(")
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| {
                        SkillError::Validation(format!(
                            "parameter '{name}' has unknown type '{other}'"
                        ))
                    })?;
                let values: Vec<String> = inner
                    .split('|')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if values.is_empty() {
                    return Err(SkillError::Validation(format!(
                        "parameter '{name}' declares an empty enum"
                    )));
                }
                ParamKind::Enum(values)
            }
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            required,
            pattern: None,
        })
    }

    /// Check and coerce a value to this parameter's declared type.
    /// String inputs (e.g. from the command line) are converted when possible.
    fn coerce(&self, value: Value) -> crate::Result<Value> {
        let name = &self.name;
        let coerced = match (&self.kind, value) {
            (ParamKind::String, Value::String(s)) => Value::String(s),
            (ParamKind::String, v @ (Value::Number(_) | Value::Bool(_))) => {
                Value::String(v.to_string())
            }
            (ParamKind::Integer, Value::Number(n)) if n.is_i64() => Value::Number(n),
            (ParamKind::Integer, Value::String(s)) => {
                let n: i64 = s.trim().parse().map_err(|_| {
                    SkillError::Validation(format!("parameter '{name}' expects an integer, got '{s}'"))
                })?;
                Value::from(n)
            }
            (ParamKind::Date, Value::String(s)) => {
                chrono::NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
                    SkillError::Validation(format!(
                        "parameter '{name}' expects a YYYY-MM-DD date, got '{s}'"
                    ))
                })?;
                Value::String(s.trim().to_string())
            }
            (ParamKind::Bool, Value::Bool(b)) => Value::Bool(b),
            (ParamKind::Bool, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Value::Bool(true),
                "false" | "no" | "0" => Value::Bool(false),
                _ => {
                    return Err(SkillError::Validation(format!(
                        "parameter '{name}' expects a boolean, got '{s}'"
                    )));
                }
            },
            (ParamKind::Enum(values), Value::String(s)) => {
                if !values.iter().any(|v| v == &s) {
                    return Err(SkillError::Validation(format!(
                        "parameter '{name}' must be one of [{}], got '{s}'",
                        values.join(", ")
                    )));
                }
                Value::String(s)
            }
            (kind, other) => {
                return Err(SkillError::Validation(format!(
                    "parameter '{name}' expects {kind:?}, got {other}"
                )));
            }
        };

        if let (Some(pattern), Value::String(s)) = (&self.pattern, &coerced) {
            let re = Regex::new(pattern).map_err(|e| {
                SkillError::Validation(format!("parameter '{name}' has an invalid pattern: {e}"))
            })?;
            if !re.is_match(s) {
                return Err(SkillError::Validation(format!(
                    "parameter '{name}' value '{s}' does not match {pattern}"
                )));
            }
        }

        Ok(coerced)
    }
}

/// What a skill accepts and what it promises to return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationContract {
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Free-text description of the `data` payload returned on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl InvocationContract {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Validate `params` against the contract and return the coerced set.
    ///
    /// A contract that declares no parameters accepts anything. Otherwise
    /// unknown parameters and missing required ones are rejected.
    pub fn validate(&self, params: Params) -> crate::Result<Params> {
        if self.params.is_empty() {
            return Ok(params);
        }

        if let Some(unknown) = params.keys().find(|k| self.param(k).is_none()) {
            return Err(SkillError::Validation(format!("unknown parameter '{unknown}'")));
        }

        let mut out = Params::new();
        let mut input = params;
        for spec in &self.params {
            match input.remove(&spec.name) {
                Some(Value::Null) | None if spec.required => {
                    return Err(SkillError::Validation(format!(
                        "missing required parameter '{}'",
                        spec.name
                    )));
                }
                Some(Value::Null) | None => {}
                Some(value) => {
                    out.insert(spec.name.clone(), spec.coerce(value)?);
                }
            }
        }
        Ok(out)
    }
}

/// Error object of the uniform response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl From<&SkillError> for WireError {
    fn from(err: &SkillError) -> Self {
        let retry_after_secs = match err {
            SkillError::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.message(),
            retry_after_secs,
        }
    }
}

impl From<WireError> for SkillError {
    fn from(err: WireError) -> Self {
        match err.kind {
            ErrorKind::RateLimit => SkillError::RateLimited {
                message: err.message,
                retry_after_secs: err.retry_after_secs.unwrap_or(0),
            },
            kind => SkillError::from_kind(kind, err.message),
        }
    }
}

/// The uniform result every skill produces:
/// `{"status": "ok", "data": ...}` or `{"status": "error", "error": {kind, message}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SkillResponse {
    Ok {
        #[serde(default)]
        data: Value,
    },
    Error {
        error: WireError,
    },
}

impl SkillResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, SkillResponse::Ok { .. })
    }

    pub fn into_result(self) -> crate::Result<Value> {
        match self {
            SkillResponse::Ok { data } => Ok(data),
            SkillResponse::Error { error } => Err(error.into()),
        }
    }
}

impl From<crate::Result<Value>> for SkillResponse {
    fn from(result: crate::Result<Value>) -> Self {
        match result {
            Ok(data) => SkillResponse::Ok { data },
            Err(e) => SkillResponse::Error {
                error: WireError::from(&e),
            },
        }
    }
}

/// Capability interface implemented by every concrete skill.
///
/// Parameters have already been validated against the skill's contract and
/// its required credentials checked by the time `invoke` runs.
#[async_trait]
pub trait Skill: Send + Sync {
    async fn invoke(&self, params: Params, ctx: &InvocationContext) -> crate::Result<Value>;
}
