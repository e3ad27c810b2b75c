//! # skilldeck-skills
//!
//! Skills are named, trigger-activated units of behavior. Each one is a
//! directory holding a `SKILL.md` file: YAML-style frontmatter declaring the
//! id, trigger phrases and invocation contract, followed by a Markdown body
//! with usage notes.
//!
//! ## SKILL.md Format
//!
//! ```markdown
//! ---
//! name: retry-failed-tasks
//! description: Re-run failed agent tasks
//! triggers: [retry failed tasks, rerun tasks]
//! params: [agent_id:string, days:integer?, dry_run:bool?]
//! requires: [BEAM_API_KEY]
//! uses: [beam-auth]
//! command: ./run.sh
//! ---
//!
//! # Retry failed tasks
//! ```
//!
//! ## Flow
//!
//! 1. `SkillRegistry::discover` loads user and system directories
//! 2. `TriggerMatcher` indexes the trigger phrases of invocable skills
//! 3. An utterance is ranked against those phrases
//! 4. `SkillDispatcher` checks credentials and parameters, then invokes

pub mod command;
pub mod definition;
pub mod dispatcher;
pub mod matcher;
pub mod registry;

pub use command::CommandSkill;
pub use definition::SkillDescriptor;
pub use dispatcher::SkillDispatcher;
pub use matcher::{
    Candidate, MatchKind, MatchOutcome, MatchTarget, Resolution, Specificity, TriggerMatcher,
};
pub use registry::SkillRegistry;
