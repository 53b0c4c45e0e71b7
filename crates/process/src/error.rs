//! Error types for the process engine.

use crate::component::ProcessState;
use thiserror::Error;

/// Domain failure surfaced by a step. Carries the step's message and an
/// optional cause so the operation's terminal state reports the full chain.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Failure of a process component. Failure is a value, not unwinding:
/// composites inspect it and initiate compensation.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Invalid process state: {0:?}")]
    InvalidState(ProcessState),

    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: StepError,
    },

    #[error("Aborted by user")]
    Aborted,
}

/// Why a rollback is happening, handed to every compensated step.
#[derive(Debug, Clone)]
pub struct RollbackReason {
    pub failed_step: String,
    pub message: String,
}

impl RollbackReason {
    pub fn new(failed_step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failed_step: failed_step.into(),
            message: message.into(),
        }
    }
}

impl From<&ProcessError> for RollbackReason {
    fn from(error: &ProcessError) -> Self {
        match error {
            ProcessError::StepFailed { step, source } => {
                Self::new(step.clone(), source.to_string())
            }
            other => Self::new("", other.to_string()),
        }
    }
}
