//! The task state machine.
//!
//! [`transition`] is a pure function over `(current, target)`. The store
//! applies its result inside the same write transaction that loaded the
//! task, so no caller can observe or act on a half-applied change.

use thiserror::Error;

use crate::types::TaskState;

/// Outcome of a permitted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Target equals the current state; nothing to write.
    Noop,
    /// Set the task to this state and drop it from the queue.
    Apply(TaskState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("invalid transition from terminal state {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("unexpected transition from {from} to {to}")]
    UnexpectedTransition { from: TaskState, to: TaskState },

    #[error("task in state {from} cannot be requeued; use restart")]
    RequeueNotAllowed { from: TaskState },

    #[error("transition to {to} is not implemented")]
    Unimplemented { to: TaskState },
}

/// Decide whether a task may move from `current` to `target`.
///
/// Rules are checked in order:
/// 1. same state is a no-op;
/// 2. nothing leaves a terminal state;
/// 3. any terminal target is accepted;
/// 4. INITIALIZING and RUNNING are reachable only from UNKNOWN, QUEUED or
///    INITIALIZING;
/// 5. QUEUED is only re-entered through restart;
/// 6. UNKNOWN and PAUSED are not supported targets.
pub fn transition(current: TaskState, target: TaskState) -> Result<Transition, TransitionError> {
    use TaskState::*;

    if current == target {
        return Ok(Transition::Noop);
    }
    if current.is_terminal() {
        return Err(TransitionError::InvalidTransition {
            from: current,
            to: target,
        });
    }
    match target {
        Complete | Error | SystemError | Canceled => Ok(Transition::Apply(target)),
        Initializing | Running => match current {
            Unknown | Queued | Initializing => Ok(Transition::Apply(target)),
            _ => Err(TransitionError::UnexpectedTransition {
                from: current,
                to: target,
            }),
        },
        Queued => Err(TransitionError::RequeueNotAllowed { from: current }),
        Unknown | Paused => Err(TransitionError::Unimplemented { to: target }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskState::*;

    #[test]
    fn same_state_is_noop_for_every_state() {
        for state in TaskState::ALL {
            assert_eq!(transition(state, state), Ok(Transition::Noop), "{state}");
        }
    }

    #[test]
    fn terminal_states_reject_every_other_target() {
        for from in TaskState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TaskState::ALL.into_iter().filter(|t| *t != from) {
                assert_eq!(
                    transition(from, to),
                    Err(TransitionError::InvalidTransition { from, to }),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn queued_task_is_picked_up_and_runs() {
        assert_eq!(transition(Queued, Initializing), Ok(Transition::Apply(Initializing)));
        assert_eq!(transition(Initializing, Running), Ok(Transition::Apply(Running)));
        assert_eq!(transition(Running, Complete), Ok(Transition::Apply(Complete)));
    }

    #[test]
    fn queued_can_skip_straight_to_running() {
        assert_eq!(transition(Queued, Running), Ok(Transition::Apply(Running)));
        assert_eq!(transition(Unknown, Running), Ok(Transition::Apply(Running)));
    }

    #[test]
    fn running_cannot_go_back_to_initializing() {
        assert_eq!(
            transition(Running, Initializing),
            Err(TransitionError::UnexpectedTransition {
                from: Running,
                to: Initializing
            })
        );
        assert!(matches!(
            transition(Paused, Running),
            Err(TransitionError::UnexpectedTransition { .. })
        ));
    }

    #[test]
    fn any_live_state_can_be_canceled() {
        for from in [Unknown, Queued, Initializing, Running, Paused] {
            assert_eq!(transition(from, Canceled), Ok(Transition::Apply(Canceled)));
        }
    }

    #[test]
    fn requeue_is_rejected() {
        assert_eq!(
            transition(Running, Queued),
            Err(TransitionError::RequeueNotAllowed { from: Running })
        );
    }

    #[test]
    fn paused_and_unknown_targets_are_unimplemented() {
        assert_eq!(
            transition(Running, Paused),
            Err(TransitionError::Unimplemented { to: Paused })
        );
        assert_eq!(
            transition(Queued, Unknown),
            Err(TransitionError::Unimplemented { to: Unknown })
        );
    }
}
