//! # skilldeck-cli
//!
//! Command-line interface for the skilldeck runtime.
//!
//! ## Commands
//!
//! - `skilldeck skill`: List, inspect, scaffold and invoke skills
//! - `skilldeck match` / `skilldeck ask`: Route an utterance to a skill or workflow
//! - `skilldeck workflow`: Run workflows and manage their checkpoints
//! - `skilldeck retry`: Re-submit failed items through a batch-capable skill
//! - `skilldeck history` / `skilldeck note`: Project context log
//! - `skilldeck config` / `skilldeck set` / `skilldeck init`: Configuration
//! - `skilldeck doctor`: Validate config, definitions and the context chain

pub mod commands;

pub use commands::{Cli, Outcome};
