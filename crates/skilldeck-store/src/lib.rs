//! # skilldeck-store
//!
//! Durable state for skilldeck:
//!
//! - **Run snapshots**: the full state of every workflow run, overwritten
//!   after each transition so a run can resume from its last durable point.
//! - **Context log**: append-only workflow and project history, hash-chained
//!   so tampering is detectable.
//! - **Batch ledger**: fingerprints of submitted batch items, so re-running a
//!   batch never re-submits an unchanged item.

pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::InMemoryStateStore;
pub use sqlite::SqliteStateStore;
pub use store::{ChainReport, ContextEntry, ContextFilter, RunRecord, StateStore};
