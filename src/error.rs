//! Error types for archive client operations

use dimse::DimseError;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, PacsError>;

/// Why an association with the archive could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    Rejected,
    Aborted,
    Unreachable,
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionFailure::Rejected => "rejected",
            ConnectionFailure::Aborted => "aborted",
            ConnectionFailure::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

#[derive(Error, Debug)]
pub enum PacsError {
    /// Opening an association failed; fatal to the current operation
    #[error("Association with {remote} {reason}: {detail}")]
    Connection {
        remote: String,
        reason: ConnectionFailure,
        detail: String,
    },

    /// A non-success, non-pending status arrived mid-stream
    #[error("Archive reported failure status 0x{0:04X}")]
    ProtocolFailure(u16),

    /// Responses for the same key disagree on a singular attribute
    #[error("Inconsistent archive data: {0}")]
    DataInconsistency(String),

    #[error("Storage listener is not running")]
    ListenerNotRunning,

    #[error(transparent)]
    Dimse(DimseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rendering failed: {0}")]
    Render(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl PacsError {
    /// Map an association-establishment error, keeping the remote identity
    pub fn connection(remote: impl Into<String>, err: DimseError) -> Self {
        let remote = remote.into();
        let reason = match &err {
            DimseError::AssociationRejected(_) | DimseError::NoPresentationContext(_) => {
                ConnectionFailure::Rejected
            }
            DimseError::AssociationAborted(_) => ConnectionFailure::Aborted,
            DimseError::Unreachable(_) | DimseError::Network(_) => ConnectionFailure::Unreachable,
            _ => return PacsError::Dimse(err),
        };
        PacsError::Connection {
            remote,
            reason,
            detail: err.to_string(),
        }
    }

    pub fn render(msg: impl ToString) -> Self {
        PacsError::Render(msg.to_string())
    }
}

impl From<DimseError> for PacsError {
    fn from(err: DimseError) -> Self {
        match err {
            DimseError::Network(e) => PacsError::Io(e),
            other => PacsError::Dimse(other),
        }
    }
}

impl From<tokio::task::JoinError> for PacsError {
    fn from(err: tokio::task::JoinError) -> Self {
        PacsError::Task(err.to_string())
    }
}
