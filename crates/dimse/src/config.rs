//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DimseError, Result};
use crate::DEFAULT_LISTENER_PORT;

/// Maximum AE title length (PS3.5 AE value representation)
const MAX_AE_TITLE_LEN: usize = 16;

/// Configuration for the local side of DIMSE services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title used when calling the archive
    pub local_aet: String,

    /// AE title of the storage listener receiving C-MOVE deliveries.
    /// Defaults to `{local_aet}-SCP`.
    #[serde(default)]
    pub listener_aet: Option<String>,

    /// Bind address for the storage listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the storage listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Read timeout in milliseconds applied at association time
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Directory receiving retrieved DICOM files
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Transfer syntaxes accepted by the storage listener
    #[serde(default = "default_transfer_syntaxes")]
    pub preferred_transfer_syntaxes: Vec<String>,

    /// Maximum number of concurrent inbound associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Answer C-ECHO on the storage listener
    #[serde(default = "default_true")]
    pub enable_echo: bool,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides global setting)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Maximum PDU size for this node (overrides global setting)
    #[serde(default)]
    pub max_pdu: Option<u32>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "PACSMAN".to_string(),
            listener_aet: None,
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            storage_dir: default_storage_dir(),
            preferred_transfer_syntaxes: default_transfer_syntaxes(),
            max_associations: default_max_associations(),
            enable_echo: true,
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get read timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// AE title the storage listener answers to
    pub fn listener_aet(&self) -> String {
        match &self.listener_aet {
            Some(aet) => aet.clone(),
            None => {
                let mut aet = format!("{}-SCP", self.local_aet);
                aet.truncate(MAX_AE_TITLE_LEN);
                aet
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title("Local AE title", &self.local_aet)?;
        validate_ae_title("Listener AE title", &self.listener_aet())?;

        // Validate PDU size
        if self.max_pdu < 4096 || self.max_pdu > 131_072 {
            return Err(DimseError::config(
                "Max PDU size must be between 4096 and 131072 bytes",
            ));
        }

        if self.preferred_transfer_syntaxes.is_empty() {
            return Err(DimseError::config(
                "At least one transfer syntax must be accepted by the listener",
            ));
        }

        if self.max_associations == 0 {
            return Err(DimseError::config("max_associations must be at least 1"));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
            max_pdu: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// `host:port` of the node
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> Result<()> {
        validate_ae_title("Remote AE title", &self.ae_title)?;

        if self.host.is_empty() {
            return Err(DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(DimseError::config("Remote port must be greater than 0"));
        }

        Ok(())
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

fn validate_ae_title(what: &str, aet: &str) -> Result<()> {
    if aet.trim().is_empty() || aet.len() > MAX_AE_TITLE_LEN {
        return Err(DimseError::InvalidAeTitle(format!(
            "{} must be 1-{} characters: '{}'",
            what, MAX_AE_TITLE_LEN, aet
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_LISTENER_PORT
}

fn default_max_pdu() -> u32 {
    16_384
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_read_timeout() -> u64 {
    60_000
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./tmp/dicom")
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        "1.2.840.10008.1.2.1".to_string(),    // Explicit VR Little Endian
        "1.2.840.10008.1.2".to_string(),      // Implicit VR Little Endian
        "1.2.840.10008.1.2.2".to_string(),    // Explicit VR Big Endian
        "1.2.840.10008.1.2.4.50".to_string(), // JPEG Baseline
        "1.2.840.10008.1.2.4.70".to_string(), // JPEG Lossless SV1
        "1.2.840.10008.1.2.4.90".to_string(), // JPEG 2000 lossless
        "1.2.840.10008.1.2.4.91".to_string(), // JPEG 2000
        "1.2.840.10008.1.2.5".to_string(),    // RLE Lossless
    ]
}

fn default_max_associations() -> u32 {
    10
}

fn default_true() -> bool {
    true
}
