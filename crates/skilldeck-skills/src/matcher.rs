//! Deterministic trigger-phrase matching.
//!
//! Every registered phrase is checked against the utterance after
//! normalisation (lowercase, punctuation to spaces, whitespace collapsed).
//! A phrase matches when it occurs in the utterance on token boundaries
//! (*contained*), or failing that, when all its tokens appear anywhere in
//! the utterance (*token overlap*). Candidates are ranked by:
//!
//! 1. specificity: match type, then token count, then character length
//! 2. category: `user` before `system`
//! 3. registration order
//!
//! Each target appears once, under its best phrase. Ties on (1) and (2)
//! are reported as ambiguous rather than broken silently.

use serde::Serialize;
use skilldeck_core::{Category, SkillId, WorkflowId};
use std::cmp::Reverse;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::registry::SkillRegistry;

/// What a trigger phrase nominates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum MatchTarget {
    Skill(SkillId),
    Workflow(WorkflowId),
}

impl MatchTarget {
    pub fn id(&self) -> &str {
        match self {
            MatchTarget::Skill(id) | MatchTarget::Workflow(id) => id,
        }
    }
}

impl std::fmt::Display for MatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchTarget::Skill(id) => write!(f, "skill:{id}"),
            MatchTarget::Workflow(id) => write!(f, "workflow:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    TokenOverlap,
    Contained,
}

/// Ordered so that a greater value is more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Specificity {
    pub kind: MatchKind,
    pub tokens: usize,
    pub chars: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub target: MatchTarget,
    /// The phrase as registered.
    pub phrase: String,
    pub category: Category,
    pub specificity: Specificity,
    /// Registration order of the phrase.
    pub order: usize,
}

/// How a caller should act on a match.
#[derive(Debug, PartialEq)]
pub enum Resolution<'a> {
    NoMatch,
    Unique(&'a Candidate),
    /// Two or more top candidates with the same specificity and category.
    Ambiguous(Vec<&'a Candidate>),
}

/// Ranked candidates, best first. Possibly empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MatchOutcome {
    pub candidates: Vec<Candidate>,
}

impl MatchOutcome {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn best(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn resolution(&self) -> Resolution<'_> {
        let Some(top) = self.candidates.first() else {
            return Resolution::NoMatch;
        };
        let tied: Vec<&Candidate> = self
            .candidates
            .iter()
            .take_while(|c| c.specificity == top.specificity && c.category == top.category)
            .collect();
        if tied.len() > 1 {
            Resolution::Ambiguous(tied)
        } else {
            Resolution::Unique(top)
        }
    }
}

#[derive(Debug, Clone)]
struct TriggerEntry {
    phrase: String,
    normalized: String,
    tokens: Vec<String>,
    target: MatchTarget,
    category: Category,
    order: usize,
}

/// Matches utterances against the static set of registered trigger phrases.
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher {
    entries: Vec<TriggerEntry>,
}

impl TriggerMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every trigger of every invocable skill in `registry`.
    pub fn from_registry(registry: &SkillRegistry) -> Self {
        let mut matcher = Self::new();
        for (phrase, skill_id, category) in registry.list_triggers() {
            matcher.add(&phrase, MatchTarget::Skill(skill_id), category);
        }
        matcher
    }

    pub fn add(&mut self, phrase: &str, target: MatchTarget, category: Category) {
        let normalized = normalize(phrase);
        if normalized.is_empty() {
            warn!(%target, phrase, "ignoring trigger phrase with no words");
            return;
        }
        let tokens = normalized.split(' ').map(str::to_string).collect();
        let order = self.entries.len();
        self.entries.push(TriggerEntry {
            phrase: phrase.to_string(),
            normalized,
            tokens,
            target,
            category,
            order,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rank all targets whose triggers match `utterance`. Never fails.
    pub fn match_utterance(&self, utterance: &str) -> MatchOutcome {
        let normalized = normalize(utterance);
        if normalized.is_empty() {
            return MatchOutcome::default();
        }
        let padded = format!(" {normalized} ");
        let utterance_tokens: HashSet<&str> = normalized.split(' ').collect();

        let mut matches: Vec<Candidate> = self
            .entries
            .iter()
            .filter_map(|e| {
                let kind = if padded.contains(&format!(" {} ", e.normalized)) {
                    MatchKind::Contained
                } else if e.tokens.iter().all(|t| utterance_tokens.contains(t.as_str())) {
                    MatchKind::TokenOverlap
                } else {
                    return None;
                };
                Some(Candidate {
                    target: e.target.clone(),
                    phrase: e.phrase.clone(),
                    category: e.category,
                    specificity: Specificity {
                        kind,
                        tokens: e.tokens.len(),
                        chars: e.normalized.len(),
                    },
                    order: e.order,
                })
            })
            .collect();

        matches.sort_by_key(|c| (Reverse(c.specificity), Reverse(c.category.priority()), c.order));

        let mut seen = HashSet::new();
        matches.retain(|c| seen.insert(c.target.clone()));

        debug!(utterance, candidates = matches.len(), "matched utterance");
        MatchOutcome { candidates: matches }
    }
}

/// Lowercase, replace non-alphanumerics with spaces, collapse whitespace.
pub fn normalize(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(id: &str) -> MatchTarget {
        MatchTarget::Skill(id.into())
    }

    #[test]
    fn normalize_strips_punctuation() {
        assert_eq!(normalize("  Retry FAILED-tasks, please!! "), "retry failed tasks please");
        assert_eq!(normalize("?!"), "");
    }

    #[test]
    fn contained_requires_token_boundaries() {
        let mut m = TriggerMatcher::new();
        m.add("port", skill("port-scan"), Category::System);
        assert!(m.match_utterance("generate a report").is_empty());
        assert_eq!(m.match_utterance("scan the port").candidates.len(), 1);
    }

    #[test]
    fn longer_phrase_outranks_shorter() {
        let mut m = TriggerMatcher::new();
        m.add("retry", skill("generic-retry"), Category::User);
        m.add("retry failed tasks", skill("beam-retry"), Category::System);
        let out = m.match_utterance("please retry failed tasks for agent 7");
        let ids: Vec<_> = out.candidates.iter().map(|c| c.target.id()).collect();
        assert_eq!(ids, vec!["beam-retry", "generic-retry"]);
    }

    #[test]
    fn contained_outranks_token_overlap() {
        let mut m = TriggerMatcher::new();
        // Overlap only: tokens present but out of order.
        m.add("tasks failed retry now", skill("overlap"), Category::User);
        m.add("retry failed tasks", skill("contained"), Category::System);
        let out = m.match_utterance("retry failed tasks now");
        assert_eq!(out.candidates[0].target, skill("contained"));
        assert_eq!(out.candidates[0].specificity.kind, MatchKind::Contained);
        assert_eq!(out.candidates[1].specificity.kind, MatchKind::TokenOverlap);
    }

    #[test]
    fn best_phrase_per_target() {
        let mut m = TriggerMatcher::new();
        m.add("standup", skill("standup"), Category::System);
        m.add("post standup", skill("standup"), Category::System);
        let out = m.match_utterance("post standup to slack");
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].phrase, "post standup");
    }

    #[test]
    fn same_category_tie_is_ambiguous() {
        let mut m = TriggerMatcher::new();
        m.add("weekly report", skill("a"), Category::System);
        m.add("weekly report", skill("b"), Category::System);
        let out = m.match_utterance("weekly report");
        match out.resolution() {
            Resolution::Ambiguous(c) => {
                // Registration order is kept inside the disambiguation list.
                assert_eq!(c[0].target, skill("a"));
                assert_eq!(c[1].target, skill("b"));
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn workflows_are_targets() {
        let mut m = TriggerMatcher::new();
        m.add(
            "onboard client",
            MatchTarget::Workflow("client-onboarding".into()),
            Category::System,
        );
        let out = m.match_utterance("Onboard client ACME");
        assert!(matches!(
            out.resolution(),
            Resolution::Unique(c) if c.target == MatchTarget::Workflow("client-onboarding".into())
        ));
    }

    #[test]
    fn empty_utterance_is_no_match() {
        let mut m = TriggerMatcher::new();
        m.add("anything", skill("x"), Category::System);
        assert_eq!(m.match_utterance("").resolution(), Resolution::NoMatch);
        assert_eq!(m.match_utterance("...").resolution(), Resolution::NoMatch);
    }
}
