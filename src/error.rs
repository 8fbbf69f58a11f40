use thiserror::Error;

use crate::probe::ProbeState;

/// Errors surfaced by probe operations.
///
/// Ingress triggers (HTTP handlers, signal tasks) log and swallow these at
/// the boundary; the direct API forwards them to the caller.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid probe configuration: {0}")]
    ConfigInvalid(String),

    #[error("cannot {operation} while the profiler state is {state}")]
    WrongState {
        operation: &'static str,
        state: ProbeState,
    },

    #[error("a profile is already in progress")]
    AlreadyProfiling,

    #[error("signing request failed: {0}")]
    SigningFailed(String),

    #[error("agent protocol error: {0}")]
    AgentProtocol(String),

    #[error("sampler error: {0}")]
    Sampler(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Permanent sentinel: a panic was caught inside a probe operation and
    /// the probe refuses all further work until the process restarts.
    #[error("probe disabled by a previous panic, check the logs for details")]
    DisabledFromPanic,
}

impl ProbeError {
    /// Wrong-state errors are expected under concurrent triggers and are
    /// logged at debug rather than error level.
    pub fn is_wrong_state(&self) -> bool {
        matches!(
            self,
            ProbeError::WrongState { .. } | ProbeError::AlreadyProfiling
        )
    }
}
