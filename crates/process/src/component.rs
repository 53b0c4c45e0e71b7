//! Process component contract: lifecycle states, cancellation, listeners.

use crate::error::{ProcessError, RollbackReason};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle of a process component.
///
/// `Ready → Running → {Succeeded | Failed | Rollbacking → RolledBack}`.
/// Any other transition is rejected with `ProcessError::InvalidState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Succeeded,
    Failed,
    Rollbacking,
    RolledBack,
}

/// Cooperative cancellation flag, observed by steps at their suspension
/// points (overlay round-trips, sleeps, latch waits).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled when either it or `self` is cancelled.
    /// Parallel composites use this to stop siblings of a failed child
    /// without marking the whole process as user-aborted.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }
}

/// Observer of a component's terminal transitions.
pub trait ProcessListener: Send {
    fn on_succeeded(&self) {}
    fn on_failed(&self, _reason: &RollbackReason) {}
    /// Fired after either terminal outcome.
    fn on_finished(&self) {}
}

/// An executable unit of work with a rollback contract.
///
/// Components are polymorphic over the capability set
/// {execute, rollback, observe state}; composites hold children behind this
/// same trait.
pub trait ProcessComponent: Send {
    fn name(&self) -> &str;

    fn state(&self) -> ProcessState;

    /// Run the component. Valid only in `Ready` state.
    fn execute(&mut self, cancel: &CancelToken) -> Result<(), ProcessError>;

    /// Undo whatever `execute` did. Must be idempotent and must tolerate a
    /// component that never executed.
    fn rollback(&mut self, reason: &RollbackReason) -> Result<(), ProcessError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_token_sees_parent_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_cancellation_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
