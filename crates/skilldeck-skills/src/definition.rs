use serde::{Deserialize, Serialize};
use skilldeck_core::{
    Category, InvocationContract, ParamSpec, SkillError, SkillId, SkillKind,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A skill descriptor parsed from a SKILL.md file.
///
/// Descriptors are immutable once loaded and owned by the registry; callers
/// receive them behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillDescriptor {
    /// Unique id (frontmatter `name`).
    pub id: SkillId,
    /// Human-readable name. Defaults to the id.
    pub title: String,
    /// Free-text description used for discovery.
    pub description: String,
    pub version: semver::Version,
    pub category: Category,
    #[serde(default)]
    pub kind: SkillKind,
    /// Phrases that nominate this skill in the trigger matcher.
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub contract: InvocationContract,
    /// Credential keys that must be present before any call is attempted.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Shared-library skills this skill depends on.
    #[serde(default)]
    pub uses: Vec<SkillId>,
    /// Program run by `CommandSkill`, relative to `base_dir` unless absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Default lookback window for batch-style skills.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_days: Option<u32>,
    /// The Markdown body (usage notes for humans).
    #[serde(skip)]
    pub body: String,
    #[serde(skip)]
    pub file_path: PathBuf,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl SkillDescriptor {
    /// Minimal in-memory descriptor, mostly for programmatic registration.
    pub fn new(id: impl Into<SkillId>, category: Category) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            description: String::new(),
            version: default_version(),
            category,
            kind: SkillKind::Invocable,
            triggers: Vec::new(),
            contract: InvocationContract::default(),
            requires: Vec::new(),
            uses: Vec::new(),
            command: None,
            lookback_days: None,
            body: String::new(),
            file_path: PathBuf::new(),
            base_dir: PathBuf::new(),
        }
    }

    pub fn with_triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_kind(mut self, kind: SkillKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_invocable(&self) -> bool {
        self.kind == SkillKind::Invocable
    }

    /// Parse a SKILL.md file.
    pub fn from_file(path: &Path, category: Category) -> skilldeck_core::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SkillError::InvalidSkill {
            path: path.display().to_string(),
            reason: format!("failed to read: {e}"),
        })?;
        let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Self::parse(&content, path.to_path_buf(), base_dir, category)
    }

    /// Parse SKILL.md content with known path info. The file format is:
    ///
    /// ```text
    /// ---
    /// name: retry-failed-tasks
    /// title: Retry failed tasks
    /// description: Re-run failed agent tasks
    /// triggers: [retry failed tasks, rerun tasks]
    /// params: [agent_id:string, days:integer?, dry_run:bool?]
    /// pattern.agent_id: ^[0-9a-f-]{36}$
    /// requires: [BEAM_API_KEY]
    /// uses: [beam-auth]
    /// command: ./run.sh
    /// ---
    ///
    /// # Retry failed tasks
    /// ...
    /// ```
    ///
    /// List values may also be written as indented `- item` lines under an
    /// empty key.
    pub fn parse(
        content: &str,
        file_path: PathBuf,
        base_dir: PathBuf,
        category: Category,
    ) -> skilldeck_core::Result<Self> {
        let invalid = |reason: String| SkillError::InvalidSkill {
            path: file_path.display().to_string(),
            reason,
        };

        let (frontmatter, body) = split_frontmatter(content).map_err(invalid)?;
        let fm = Frontmatter::parse(&frontmatter);

        let id = fm.scalar("name").unwrap_or_default();
        if id.is_empty() {
            return Err(invalid("skill name is empty".into()));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(invalid(format!("skill name '{id}' contains whitespace")));
        }
        let description = fm.scalar("description").unwrap_or_default();
        if description.is_empty() {
            return Err(invalid(format!("skill '{id}' has no description")));
        }

        let version = match fm.scalar("version") {
            Some(v) => semver::Version::parse(&v)
                .map_err(|e| invalid(format!("invalid version '{v}': {e}")))?,
            None => default_version(),
        };
        let kind = match fm.scalar("kind") {
            Some(k) => k.parse::<SkillKind>().map_err(|e| invalid(e.message()))?,
            None => SkillKind::Invocable,
        };

        let mut contract = InvocationContract {
            params: fm
                .list("params")
                .iter()
                .map(|p| ParamSpec::parse(p))
                .collect::<skilldeck_core::Result<Vec<_>>>()
                .map_err(|e| invalid(e.message()))?,
            result: fm.scalar("result"),
        };
        for (param, pattern) in fm.patterns() {
            regex::Regex::new(&pattern)
                .map_err(|e| invalid(format!("invalid pattern for '{param}': {e}")))?;
            let spec = contract
                .params
                .iter_mut()
                .find(|p| p.name == param)
                .ok_or_else(|| invalid(format!("pattern given for undeclared parameter '{param}'")))?;
            spec.pattern = Some(pattern);
        }

        let lookback_days = match fm.scalar("lookback_days") {
            Some(d) => Some(
                d.parse::<u32>()
                    .map_err(|_| invalid(format!("lookback_days must be a number, got '{d}'")))?,
            ),
            None => None,
        };

        let base_dir_str = base_dir.to_string_lossy().to_string();
        Ok(Self {
            title: fm.scalar("title").unwrap_or_else(|| id.clone()),
            id,
            description,
            version,
            category,
            kind,
            triggers: fm.list("triggers"),
            contract,
            requires: fm.list("requires"),
            uses: fm.list("uses"),
            command: fm.scalar("command"),
            lookback_days,
            body: body.replace("{baseDir}", &base_dir_str),
            file_path,
            base_dir,
        })
    }

    /// Render a SKILL.md scaffold for a new skill.
    pub fn template(id: &str) -> String {
        format!(
            r#"---
name: {id}
title: {id}
description: Describe what {id} does
version: 0.1.0
kind: invocable
triggers:
  - {phrase}
params: []
requires: []
command: ./run.sh
---

# {id}

## When to use this skill
Describe the requests this skill should answer.

## Contract
`run.sh` receives the parameters as a JSON object on stdin and prints a
response on stdout:

    {{"status": "ok", "data": {{}}}}
    {{"status": "error", "error": {{"kind": "fatal", "message": "..."}}}}
"#,
            phrase = id.replace(['-', '_'], " ")
        )
    }
}

/// Read only the id and kind from a SKILL.md file, leaving the full parse
/// (and its validation) for later.
pub fn peek_header(path: &Path) -> skilldeck_core::Result<(SkillId, SkillKind)> {
    let invalid = |reason: String| SkillError::InvalidSkill {
        path: path.display().to_string(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| invalid(format!("failed to read: {e}")))?;
    let (frontmatter, _) = split_frontmatter(&content).map_err(invalid)?;
    let fm = Frontmatter::parse(&frontmatter);
    let id = fm
        .scalar("name")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| invalid("skill name is empty".into()))?;
    let kind = match fm.scalar("kind") {
        Some(k) => k.parse::<SkillKind>().map_err(|e| invalid(e.message()))?,
        None => SkillKind::Invocable,
    };
    Ok((id, kind))
}

fn default_version() -> semver::Version {
    semver::Version::new(1, 0, 0)
}

/// Split a SKILL.md file into YAML frontmatter and Markdown body.
fn split_frontmatter(content: &str) -> Result<(String, String), String> {
    let trimmed = content.trim();

    if !trimmed.starts_with("---") {
        return Err("SKILL.md must start with YAML frontmatter (---)".into());
    }

    let after_first = &trimmed[3..];
    let end_pos = after_first
        .find("\n---")
        .ok_or_else(|| "missing closing --- for frontmatter".to_string())?;

    let frontmatter = after_first[..end_pos].trim().to_string();
    let body = after_first[end_pos + 4..].trim().to_string();

    Ok((frontmatter, body))
}

/// Flat `key: value` frontmatter with inline `[a, b]` or block `- a` lists.
#[derive(Default)]
struct Frontmatter {
    scalars: BTreeMap<String, String>,
    lists: BTreeMap<String, Vec<String>>,
}

impl Frontmatter {
    fn parse(yaml: &str) -> Self {
        let mut fm = Self::default();
        let mut open_list: Option<String> = None;

        for raw in yaml.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(item) = line.strip_prefix("- ").or_else(|| (line == "-").then_some("")) {
                if let Some(key) = &open_list {
                    let item = unquote(item);
                    if !item.is_empty() {
                        fm.lists.entry(key.clone()).or_default().push(item);
                    }
                }
                continue;
            }

            open_list = None;
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_string();
            let value = value.trim();

            if value.is_empty() {
                fm.lists.entry(key.clone()).or_default();
                open_list = Some(key);
            } else if value.starts_with('[')
                && value.ends_with(']')
                && !key.starts_with("pattern.")
            {
                let items = split_list(&value[1..value.len() - 1]);
                fm.lists.insert(key, items);
            } else {
                fm.scalars.insert(key, unquote(value));
            }
        }
        fm
    }

    fn scalar(&self, key: &str) -> Option<String> {
        self.scalars.get(key).cloned()
    }

    /// List value; a plain scalar is read as a comma-separated list.
    fn list(&self, key: &str) -> Vec<String> {
        match (self.lists.get(key), self.scalars.get(key)) {
            (Some(items), _) => items.clone(),
            (None, Some(s)) => split_list(s),
            (None, None) => Vec::new(),
        }
    }

    /// `pattern.<param>` entries.
    fn patterns(&self) -> Vec<(String, String)> {
        self.scalars
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("pattern.")
                    .map(|param| (param.to_string(), v.clone()))
            })
            .collect()
    }
}

fn split_list(inner: &str) -> Vec<String> {
    inner
        .split(',')
        .map(|t| unquote(t.trim()))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Remove surrounding quotes from a YAML value.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
