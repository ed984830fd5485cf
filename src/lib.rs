//! Query/retrieve client for DICOM archives.
//!
//! [`client::NetworkClient`] searches a remote archive with C-FIND and pulls
//! series or single images with C-MOVE into a local [`listener::StorageListener`].
//! [`client::FilesystemClient`] serves the same operations from a directory of
//! DICOM files for offline work.

pub mod aggregate;
pub mod attributes;
pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod records;
pub mod render;
pub mod response;
pub mod session;
pub mod status;

pub use client::{FilesystemClient, NetworkClient, PacsClient};
pub use config::Config;
pub use error::{ConnectionFailure, PacsError, Result};
pub use records::{ImageRecord, PatientRecord, SeriesRecord, StudyRecord};

/// Build the client selected by `config`: the filesystem client when
/// `offline_dir` or a `[filesystem]` section is given, otherwise the network
/// client for `[pacs]`.
pub fn build_client(
    config: &Config,
    offline_dir: Option<std::path::PathBuf>,
) -> Result<Box<dyn PacsClient>> {
    let source_dir = offline_dir.or_else(|| {
        config
            .filesystem
            .as_ref()
            .map(|fs| fs.source_dir.clone())
    });

    match source_dir {
        Some(dir) => {
            tracing::info!("🔧 Using offline archive at {}", dir.display());
            let client = FilesystemClient::open(dir, config.dimse.storage_dir.clone())?;
            Ok(Box::new(client))
        }
        None => {
            tracing::info!(
                "🔧 Using archive {} as {}",
                config.pacs.address(),
                config.dimse.local_aet
            );
            Ok(Box::new(NetworkClient::new(
                config.dimse.clone(),
                config.pacs.clone(),
            )))
        }
    }
}
