//! Worker-thread execution of top-level processes.

use crate::component::{CancelToken, ProcessComponent};
use crate::error::{ProcessError, StepError};
use std::thread::JoinHandle;
use tracing::error;

/// Terminal state of a top-level process.
#[derive(Debug)]
pub enum ProcessOutcome {
    Succeeded,
    Failed(ProcessError),
}

impl ProcessOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, ProcessOutcome::Succeeded)
    }

    pub fn into_result(self) -> Result<(), ProcessError> {
        match self {
            ProcessOutcome::Succeeded => Ok(()),
            ProcessOutcome::Failed(error) => Err(error),
        }
    }
}

/// Run a process on the calling thread and surface its terminal state.
pub fn execute_blocking(process: &mut dyn ProcessComponent) -> ProcessOutcome {
    match process.execute(&CancelToken::new()) {
        Ok(()) => ProcessOutcome::Succeeded,
        Err(e) => ProcessOutcome::Failed(e),
    }
}

/// Handle to a process running on a worker thread.
pub struct ProcessHandle {
    cancel: CancelToken,
    join: JoinHandle<ProcessOutcome>,
}

impl ProcessHandle {
    /// Request cooperative cancellation; the process unwinds via rollback.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Await the terminal state.
    pub fn join(self) -> ProcessOutcome {
        self.join.join().unwrap_or_else(|_| {
            error!("process worker panicked");
            ProcessOutcome::Failed(ProcessError::StepFailed {
                step: "worker".to_string(),
                source: StepError::new("process worker panicked"),
            })
        })
    }
}

/// Start a process on a dedicated worker thread.
pub fn spawn(mut process: impl ProcessComponent + 'static) -> ProcessHandle {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    let join = std::thread::spawn(move || match process.execute(&token) {
        Ok(()) => ProcessOutcome::Succeeded,
        Err(e) => ProcessOutcome::Failed(e),
    });
    ProcessHandle { cancel, join }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::SequentialProcess;
    use crate::error::RollbackReason;
    use crate::step::ProcessStep;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct SleepyStep {
        rolled_back: Arc<AtomicBool>,
    }

    impl ProcessStep for SleepyStep {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn run(&mut self, cancel: &CancelToken) -> Result<(), StepError> {
            for _ in 0..100 {
                if cancel.is_cancelled() {
                    return Err(StepError::new("observed cancellation"));
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        }

        fn undo(&mut self, _reason: &RollbackReason) {
            self.rolled_back.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_spawn_and_cancel() {
        let rolled_back = Arc::new(AtomicBool::new(false));
        let mut process = SequentialProcess::new("cancellable");
        process.add_step(SleepyStep {
            rolled_back: rolled_back.clone(),
        });

        let handle = spawn(process);
        std::thread::sleep(Duration::from_millis(50));
        handle.cancel();

        let outcome = handle.join();
        assert!(!outcome.is_succeeded());
        assert!(rolled_back.load(Ordering::SeqCst));
    }

    #[test]
    fn test_execute_blocking_success() {
        struct Noop;
        impl ProcessStep for Noop {
            fn name(&self) -> &str {
                "noop"
            }
            fn run(&mut self, _cancel: &CancelToken) -> Result<(), StepError> {
                Ok(())
            }
        }

        let mut process = SequentialProcess::new("ok");
        process.add_step(Noop);
        assert!(execute_blocking(&mut process).is_succeeded());
    }
}
