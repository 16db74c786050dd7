//! Core error types.

use thiserror::Error;
use wakestate_store::StoreError;

/// Error raised by a state handler. Any error type converts into it with `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from the state machine engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid machine definition {machine}: {reason}")]
    InvalidDefinition { machine: String, reason: String },

    #[error("machine {machine}: state {state} referenced by {referenced_by} is not declared")]
    UnknownState {
        machine: String,
        state: i32,
        referenced_by: String,
    },

    #[error("machine {machine}: state {state} declared twice")]
    DuplicateState { machine: String, state: i32 },

    #[error("machine {machine}: timer {timer} declared twice")]
    DuplicateTimer { machine: String, timer: String },

    #[error("machine already registered: {machine}")]
    MachineExists { machine: String },

    #[error("machine {machine}: timer {timer} is not declared")]
    UndeclaredTimer { machine: String, timer: String },

    #[error("machine {machine}: timer {timer} is not active in state {state}")]
    TimerNotActive {
        machine: String,
        timer: String,
        state: i32,
    },

    #[error("machine {machine}: transition chain exceeded {limit} hops")]
    TransitionChainTooLong { machine: String, limit: usize },

    #[error("handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Returns whether this error indicates the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Store(e) if e.is_retryable())
    }

    /// Returns true for errors that reject a machine definition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidDefinition { .. }
                | CoreError::UnknownState { .. }
                | CoreError::DuplicateState { .. }
                | CoreError::DuplicateTimer { .. }
                | CoreError::MachineExists { .. }
        )
    }
}
