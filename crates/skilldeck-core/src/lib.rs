//! # skilldeck-core
//!
//! Core types, traits, and primitives shared by every skilldeck crate: the
//! uniform skill invocation contract, the error taxonomy used to classify
//! step failures, and the per-invocation context (credentials, timeout,
//! cancellation).

pub mod contract;
pub mod error;
pub mod types;

pub use contract::{
    InvocationContract, ParamKind, ParamSpec, Params, Skill, SkillResponse, WireError,
};
pub use error::{ErrorKind, Result, SkillError};
pub use types::*;
