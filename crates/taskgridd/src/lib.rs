//! taskgridd — assembles the TaskGrid subsystems into one process.
//!
//! A [`Node`] owns the state store, the worker registry and the backend
//! registry, and runs three loops until shutdown:
//! - the scheduling loop
//! - the stuck-task recovery sweep
//! - a worker reconciler executing tasks on this host

pub mod node;

pub use node::Node;
