//! taskgrid-scheduler — matches queued tasks to compute capacity.
//!
//! The [`SchedulingLoop`] pulls chunks of the task queue, asks the
//! configured [`Backend`] for an offer per task, runs any provisioning
//! step the offer carries, and persists the assignment. Backends are
//! looked up by name in a [`BackendRegistry`] built once at start-up.
//!
//! The [`RecoverySweep`] runs beside the loop and returns tasks stranded by
//! lost workers to the queue.

pub mod backend;
pub mod backends;
pub mod error;
pub mod recovery;
pub mod scheduler;

pub use backend::{Backend, BackendConstructor, BackendRegistry};
pub use error::{SchedulerError, SchedulerResult};
pub use recovery::{RecoveryReport, RecoverySweep};
pub use scheduler::{SchedulingLoop, TickReport};
