//! The reconciliation table.
//!
//! [`reconcile`] compares the server's view of a task with the worker's
//! and names the one action that brings them together. It is total: every
//! pair of states maps to exactly one action.

use taskgrid_state::TaskState;

/// What the worker knows about a task locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// No controller for this task.
    Unknown,
    /// A controller is executing it.
    Active(TaskState),
    /// Cancellation was requested.
    Canceled,
    /// The execution finished in the given terminal state.
    Complete(TaskState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Noop,
    /// Create a controller and start executing.
    Start,
    /// Report the local state to the server.
    Update,
    /// Stop the local execution and drop the controller.
    Cancel,
    /// The two sides disagree in a way the table does not resolve. Logged
    /// as an error and treated as a cancel.
    Unhandled,
}

pub fn reconcile(server: TaskState, local: LocalState) -> Action {
    use LocalState as L;
    use TaskState::*;

    match (server, local) {
        // The server wants the task running.
        (Queued | Initializing | Running, L::Unknown) => Action::Start,
        (Queued | Initializing | Running, L::Active(state)) if state == server => Action::Noop,
        (Queued | Initializing | Running, L::Active(_) | L::Complete(_)) => Action::Update,
        (Queued | Initializing | Running, L::Canceled) => Action::Cancel,

        // The server canceled it. A local run that already finished lost the
        // race and has nothing left to stop.
        (Canceled, L::Active(_)) => Action::Cancel,
        (Canceled, L::Unknown | L::Canceled | L::Complete(_)) => Action::Noop,

        (Complete | Error | SystemError, L::Unknown | L::Canceled) => Action::Noop,
        (Complete | Error | SystemError, L::Complete(state)) if state == server => Action::Noop,
        (Complete | Error | SystemError, L::Active(_) | L::Complete(_)) => Action::Unhandled,

        // Not on the worker record at all.
        (Unknown, L::Unknown) => Action::Noop,
        (Unknown, _) => Action::Cancel,

        (Paused, L::Unknown) => Action::Noop,
        (Paused, _) => Action::Unhandled,
    }
}
