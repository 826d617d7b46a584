//! Typed errors surfaced at the engine API boundary.

use thiserror::Error;

/// Errors returned by engine operations.
///
/// The engine catches everything at its API boundary; nothing unwinds
/// through the dispatcher. Variants map to how the operator should react.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: bad URL, missing repo root, unknown criterion.
    /// No state changed.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// An external binary (agent CLI, issue tracker) is missing or failed.
    #[error("external tool failure: {0}")]
    ExternalTool(String),

    /// Timeout or other recoverable failure; retry the operation.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The agent process misbehaved (stdin closed, spawn produced no pid).
    #[error("agent process failure: {0}")]
    ProcessFailure(String),

    #[error("loop not found: {0}")]
    LoopNotFound(String),

    /// The process table already holds a live child for this loop.
    #[error("loop {0} already has a live agent process")]
    AlreadyRunning(String),

    /// The operation is not allowed in the loop's current status.
    #[error("cannot {action} a loop in status {from}")]
    InvalidTransition { from: String, action: String },

    /// The platform cannot do this (e.g. stop/continue signals).
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),

    /// Store or journal I/O failure.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the operator can simply retry the same command.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    pub fn invalid_transition(from: impl Into<String>, action: impl Into<String>) -> Self {
        EngineError::InvalidTransition {
            from: from.into(),
            action: action.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_recoverable() {
        assert!(EngineError::Transient("timeout".into()).is_recoverable());
        assert!(!EngineError::UserInput("bad url".into()).is_recoverable());
    }

    #[test]
    fn display_names_the_transition() {
        let e = EngineError::invalid_transition("completed", "pause");
        assert_eq!(e.to_string(), "cannot pause a loop in status completed");
    }
}
