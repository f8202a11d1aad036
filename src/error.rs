//! Failure taxonomy shared by the install and run workers

use thiserror::Error;

use crate::runner::KILLED_BY_SIGNAL;

/// Typed failures that change how a worker reports its outcome.
///
/// Plumbing code returns `anyhow::Result`; these are raised with
/// `Err(HostError::... .into())` and recovered with [`Failure::classify`].
#[derive(Debug, Error)]
pub enum HostError {
    /// Synchronous rejection of a user request
    #[error("{0}")]
    Rejected(String),
    /// An external command exited non-zero
    #[error("command `{command}` exited with code {code}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },
    /// Manifest content that cannot be accepted
    #[error("{0}")]
    Validation(String),
    /// The worker received SIGTERM/SIGINT
    #[error("interrupted by operator")]
    Interrupted,
}

/// Final classification of a failed worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Command,
    Internal,
    Validation,
    Interrupted,
    WorkerLost,
}

impl Failure {
    /// Walk the error chain for a typed failure; anything else is internal
    pub fn classify(err: &anyhow::Error) -> Self {
        match err.chain().find_map(|e| e.downcast_ref::<HostError>()) {
            // killed by a signal, as a stop request does to a run's children
            Some(HostError::CommandFailed { code: KILLED_BY_SIGNAL, .. }) => Failure::Interrupted,
            Some(HostError::CommandFailed { .. }) => Failure::Command,
            Some(HostError::Validation(_)) => Failure::Validation,
            Some(HostError::Interrupted) => Failure::Interrupted,
            Some(HostError::Rejected(_)) | None => Failure::Internal,
        }
    }

    /// Code carried by `Installed with error (<code>)`
    pub fn install_code(self) -> u8 {
        match self {
            Failure::Command => 1,
            Failure::Internal => 2,
            Failure::Validation => 3,
            Failure::Interrupted => 4,
            Failure::WorkerLost => 5,
        }
    }

    /// Code carried by `Completed with error <code>`
    pub fn run_code(self) -> u8 {
        match self {
            Failure::Command => 1,
            // manifests are checked at install time, so a run never sees one
            Failure::Internal | Failure::Validation => 2,
            Failure::Interrupted => 3,
            Failure::WorkerLost => 4,
        }
    }
}
