//! taskgrid-worker — the worker side of TaskGrid.
//!
//! A worker repeatedly fetches its authoritative record from the server,
//! compares every assigned task with what it is running locally, starts and
//! cancels executions to close the gap, and reports back through a
//! heartbeat.
//!
//! # Components
//!
//! - **`reconcile`** — the pure (server state, local state) → action table
//! - **`controller`** — one cancellable execution per task
//! - **`engine`** — the execution capability and its process implementation
//! - **`client`** — how the worker talks to the server
//! - **`reconciler`** — the loop tying them together

pub mod client;
pub mod controller;
pub mod engine;
pub mod error;
pub mod reconcile;
pub mod reconciler;

pub use client::{LocalClient, WorkerClient};
pub use controller::TaskController;
pub use engine::{ExecMetadata, ExecOutcome, ExecutionEngine, ProcessEngine};
pub use error::{WorkerError, WorkerResult};
pub use reconcile::{Action, LocalState, reconcile};
pub use reconciler::{ReconcileReport, WorkerReconciler};
