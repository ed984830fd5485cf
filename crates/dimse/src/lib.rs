//! DIMSE (DICOM Message Service Element) messaging for query/retrieve clients
//!
//! This crate provides the Service Class User (SCU) side of C-ECHO, C-FIND,
//! C-MOVE and C-STORE, plus a storage Service Class Provider (SCP) that
//! receives the instances a C-MOVE delivers.
//!
//! # Features
//! - Outbound DIMSE services (SCU): C-ECHO, C-FIND, C-MOVE, C-STORE
//! - Inbound DIMSE services (SCP): C-STORE, C-ECHO
//! - Lazy response streams for pending C-FIND and C-MOVE responses
//! - Status classification shared by every operation

pub mod config;
pub mod error;
pub mod message;
pub mod scp;
pub mod scu;
pub mod status;
pub mod types;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{DimseScp, StoreHandler, StoreRequest};
pub use scu::{Association, DimseScu, ResponseStream};
pub use status::StatusOutcome;
pub use types::{
    DimseCommand, DimseResponse, FindQuery, MovePriority, MoveProgress, MoveQuery, QueryLevel,
};

/// DIMSE protocol version
pub const DIMSE_VERSION: &str = "0.2.0";

/// Default DICOM port of a remote archive
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

/// Default port of the local storage listener
pub const DEFAULT_LISTENER_PORT: u16 = 11113;
