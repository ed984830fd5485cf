//! DIMSE status classification
//!
//! Every DIMSE response carries a numeric status (0000,0900). For the
//! query/retrieve exchanges used here only three outcomes matter:
//! - `0x0000`: Success (final response)
//! - `0xFF00`, `0xFF01`: Pending (more responses follow)
//! - anything else: Failure, including warnings and cancel
//!
//! See DICOM PS3.7 Annex C for the full status tables.

use serde::Serialize;

/// Success
pub const STATUS_SUCCESS: u16 = 0x0000;
/// Pending, all optional keys supported
pub const STATUS_PENDING: u16 = 0xFF00;
/// Pending, some optional keys not supported
pub const STATUS_PENDING_WARNING: u16 = 0xFF01;
/// Processing failure, used when a stored instance cannot be written
pub const STATUS_PROCESSING_FAILURE: u16 = 0x0110;

/// Outcome of a DIMSE status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusOutcome {
    /// Operation completed successfully
    Success,
    /// More responses follow
    Pending,
    /// Operation failed with the given status code
    Failure(u16),
}

impl StatusOutcome {
    /// Classify a raw status code
    pub fn classify(code: u16) -> Self {
        match code {
            STATUS_SUCCESS => StatusOutcome::Success,
            STATUS_PENDING | STATUS_PENDING_WARNING => StatusOutcome::Pending,
            other => StatusOutcome::Failure(other),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, StatusOutcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusOutcome::Success)
    }

    /// Success or Pending
    pub fn is_ok(&self) -> bool {
        !matches!(self, StatusOutcome::Failure(_))
    }
}

impl From<u16> for StatusOutcome {
    fn from(code: u16) -> Self {
        Self::classify(code)
    }
}

impl std::fmt::Display for StatusOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusOutcome::Success => write!(f, "Success"),
            StatusOutcome::Pending => write!(f, "Pending"),
            StatusOutcome::Failure(code) => write!(f, "Failure(0x{:04X})", code),
        }
    }
}
