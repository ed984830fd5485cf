//! Error types for DIMSE operations

use thiserror::Error;

/// Result type alias for DIMSE operations
pub type Result<T> = std::result::Result<T, DimseError>;

/// Error types that can occur during DIMSE operations
#[derive(Error, Debug)]
pub enum DimseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("DICOM parsing error: {0}")]
    DicomParsing(String),

    #[error("DICOM encoding error: {0}")]
    DicomEncoding(String),

    #[error("DICOM UL error: {0}")]
    DicomUl(String),

    #[error("Association rejected: {0}")]
    AssociationRejected(String),

    #[error("Association aborted: {0}")]
    AssociationAborted(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("No accepted presentation context for {0}")]
    NoPresentationContext(String),

    #[error("Unexpected PDU: {0}")]
    UnexpectedPdu(String),

    #[error("DIMSE operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid AE Title: {0}")]
    InvalidAeTitle(String),

    #[error("Unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DimseError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new operation failed error
    pub fn operation_failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Create a new upper layer error
    pub fn ul(msg: impl ToString) -> Self {
        Self::DicomUl(msg.to_string())
    }

    /// Create a new parsing error
    pub fn parsing(msg: impl ToString) -> Self {
        Self::DicomParsing(msg.to_string())
    }

    /// Create a new encoding error
    pub fn encoding(msg: impl ToString) -> Self {
        Self::DicomEncoding(msg.to_string())
    }

    /// Classify an association establishment failure reported by the UL layer.
    ///
    /// dicom-ul reports rejections and aborts through its error message, so the
    /// message text decides which variant applies. Anything else means the peer
    /// could not be reached or did not answer in time.
    pub fn from_establish(peer: &str, err: impl std::fmt::Display) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("reject") {
            Self::AssociationRejected(format!("{}: {}", peer, msg))
        } else if lower.contains("abort") {
            Self::AssociationAborted(format!("{}: {}", peer, msg))
        } else {
            Self::Unreachable(format!("{}: {}", peer, msg))
        }
    }

    /// Whether this error happened while establishing an association
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            DimseError::AssociationRejected(_)
                | DimseError::AssociationAborted(_)
                | DimseError::Unreachable(_)
        )
    }
}
