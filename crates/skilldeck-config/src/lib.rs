//! # skilldeck-config
//!
//! Configuration for skilldeck. Values come from `skilldeck.toml`, then
//! `SKILLDECK_*` environment overrides, then CLI flags.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::SkilldeckConfig;
pub use schema::{
    BatchConfig, ConfigWarning, EngineConfig, LoggingConfig, SkillsConfig, StateConfig,
    WarningSeverity, WorkflowsConfig,
};
