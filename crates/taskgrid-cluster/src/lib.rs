//! taskgrid-cluster — worker membership for TaskGrid.
//!
//! The [`WorkerRegistry`] is the server side of the worker heartbeat: it
//! merges reports into the store under optimistic concurrency and reaps
//! workers that stopped checking in.

pub mod error;
pub mod membership;

pub use error::{ClusterError, ClusterResult};
pub use membership::WorkerRegistry;
