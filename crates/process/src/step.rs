//! Atomic process steps.

use crate::component::{CancelToken, ProcessComponent, ProcessState};
use crate::error::{ProcessError, RollbackReason, StepError};
use tracing::{debug, warn};

/// An atomic unit of work. Steps share state with their siblings through a
/// typed context object owned by the operation that composed them.
pub trait ProcessStep: Send {
    fn name(&self) -> &str;

    fn run(&mut self, cancel: &CancelToken) -> Result<(), StepError>;

    /// Compensate for `run`. Default: nothing to undo.
    fn undo(&mut self, _reason: &RollbackReason) {}
}

/// Adapter giving a step the component lifecycle.
pub struct StepUnit {
    step: Box<dyn ProcessStep>,
    state: ProcessState,
}

impl StepUnit {
    pub fn new(step: impl ProcessStep + 'static) -> Self {
        Self {
            step: Box::new(step),
            state: ProcessState::Ready,
        }
    }
}

impl ProcessComponent for StepUnit {
    fn name(&self) -> &str {
        self.step.name()
    }

    fn state(&self) -> ProcessState {
        self.state
    }

    fn execute(&mut self, cancel: &CancelToken) -> Result<(), ProcessError> {
        if self.state != ProcessState::Ready {
            return Err(ProcessError::InvalidState(self.state));
        }
        if cancel.is_cancelled() {
            self.state = ProcessState::Failed;
            return Err(ProcessError::Aborted);
        }

        self.state = ProcessState::Running;
        debug!(step = self.step.name(), "executing step");
        match self.step.run(cancel) {
            Ok(()) => {
                self.state = ProcessState::Succeeded;
                Ok(())
            }
            Err(source) => {
                warn!(step = self.step.name(), error = %source, "step failed");
                self.state = ProcessState::Failed;
                Err(ProcessError::StepFailed {
                    step: self.step.name().to_string(),
                    source,
                })
            }
        }
    }

    fn rollback(&mut self, reason: &RollbackReason) -> Result<(), ProcessError> {
        match self.state {
            // Never ran: nothing to undo.
            ProcessState::Ready => {
                self.state = ProcessState::RolledBack;
                Ok(())
            }
            ProcessState::Succeeded | ProcessState::Failed => {
                self.state = ProcessState::Rollbacking;
                debug!(step = self.step.name(), "rolling back step");
                self.step.undo(reason);
                self.state = ProcessState::RolledBack;
                Ok(())
            }
            // Idempotent under repeated rollback.
            ProcessState::RolledBack => Ok(()),
            other => Err(ProcessError::InvalidState(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingStep {
        runs: Arc<AtomicUsize>,
        undos: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ProcessStep for CountingStep {
        fn name(&self) -> &str {
            "counting"
        }

        fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(StepError::new("boom"))
            } else {
                Ok(())
            }
        }

        fn undo(&mut self, _reason: &RollbackReason) {
            self.undos.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_step_lifecycle() {
        let runs = Arc::new(AtomicUsize::new(0));
        let undos = Arc::new(AtomicUsize::new(0));
        let mut unit = StepUnit::new(CountingStep {
            runs: runs.clone(),
            undos: undos.clone(),
            fail: false,
        });

        assert_eq!(unit.state(), ProcessState::Ready);
        unit.execute(&CancelToken::new()).unwrap();
        assert_eq!(unit.state(), ProcessState::Succeeded);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_execute_rejected() {
        let mut unit = StepUnit::new(CountingStep {
            runs: Arc::new(AtomicUsize::new(0)),
            undos: Arc::new(AtomicUsize::new(0)),
            fail: false,
        });

        unit.execute(&CancelToken::new()).unwrap();
        assert!(matches!(
            unit.execute(&CancelToken::new()),
            Err(ProcessError::InvalidState(ProcessState::Succeeded))
        ));
    }

    #[test]
    fn test_rollback_without_execute_is_noop() {
        let undos = Arc::new(AtomicUsize::new(0));
        let mut unit = StepUnit::new(CountingStep {
            runs: Arc::new(AtomicUsize::new(0)),
            undos: undos.clone(),
            fail: false,
        });

        unit.rollback(&RollbackReason::new("other", "failed"))
            .unwrap();
        assert_eq!(unit.state(), ProcessState::RolledBack);
        assert_eq!(undos.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rollback_is_idempotent() {
        let undos = Arc::new(AtomicUsize::new(0));
        let mut unit = StepUnit::new(CountingStep {
            runs: Arc::new(AtomicUsize::new(0)),
            undos: undos.clone(),
            fail: true,
        });

        let _ = unit.execute(&CancelToken::new());
        let reason = RollbackReason::new("counting", "boom");
        unit.rollback(&reason).unwrap();
        unit.rollback(&reason).unwrap();
        assert_eq!(undos.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_token_aborts_before_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut unit = StepUnit::new(CountingStep {
            runs: runs.clone(),
            undos: Arc::new(AtomicUsize::new(0)),
            fail: false,
        });

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            unit.execute(&cancel),
            Err(ProcessError::Aborted)
        ));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
