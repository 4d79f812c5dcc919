//! taskgrid-state — task and worker state for TaskGrid.
//!
//! Holds the domain model shared by every other crate, the task state
//! machine, the [`TaskStore`] contract, and its redb-backed implementation.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! The scheduling queue is a separate table keyed by a monotonically
//! increasing sequence number, so reading it in key order yields tasks in
//! insertion order. Every mutating operation runs in a single redb write
//! transaction; redb admits one writer at a time, which gives each task id
//! the single-writer guarantee the state machine relies on.
//!
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod task_store;
pub mod transition;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use task_store::{QueueChunk, TaskFilter, TaskStore};
pub use transition::{Transition, TransitionError, transition};
pub use types::*;
