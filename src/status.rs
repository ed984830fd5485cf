//! Status classification shared with the protocol crate

pub use dimse::status::{
    StatusOutcome, STATUS_PENDING, STATUS_PENDING_WARNING, STATUS_PROCESSING_FAILURE,
    STATUS_SUCCESS,
};

/// Classify a raw status code
pub fn classify(status: u16) -> StatusOutcome {
    StatusOutcome::classify(status)
}
