//! Built-in compute backends.

mod batch;
mod command;
mod fleet;
mod local;
mod manual;

pub use batch::BatchBackend;
pub use command::run_command;
pub use fleet::{CommandProvisioner, FLEET_KEY, FleetBackend, Provisioner, STRATEGY_TAG};
pub use local::LocalBackend;
pub use manual::ManualBackend;

use taskgrid_state::{TaskStore, Worker};
use tracing::warn;
use ulid::Ulid;

/// All workers in the store; a read failure is logged and yields none.
fn stored_workers(store: &dyn TaskStore, backend: &str) -> Vec<Worker> {
    match store.list_workers() {
        Ok(workers) => workers,
        Err(e) => {
            warn!(%backend, error = %e, "failed to list workers");
            Vec::new()
        }
    }
}

/// A fresh id for capacity that does not exist yet.
fn provisional_id(prefix: &str) -> String {
    format!("{prefix}-{}", Ulid::new().to_string().to_lowercase())
}
