//! Storage listener receiving C-MOVE deliveries
//!
//! One listener runs per retrieval. It accepts C-STORE sub-operations from
//! the archive and writes each instance to `{result_dir}/{SOPInstanceUID}.dcm`.

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_object::meta::FileMetaTableBuilder;
use dimse::message::decode_dataset;
use dimse::status::{STATUS_PROCESSING_FAILURE, STATUS_SUCCESS};
use dimse::{DimseConfig, DimseScp, StoreHandler, StoreRequest};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PacsError, Result};

/// File extension of stored instances
pub const STORED_FILE_EXTENSION: &str = "dcm";

/// Outcome of one inbound delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Stored {
        sop_instance_uid: String,
        path: PathBuf,
        overwritten: bool,
    },
    Failed {
        sop_instance_uid: String,
        reason: String,
    },
}

/// Background C-STORE endpoint for a single retrieval
pub struct StorageListener {
    config: DimseConfig,
    result_dir: PathBuf,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    events_tx: mpsc::UnboundedSender<DeliveryEvent>,
    events_rx: mpsc::UnboundedReceiver<DeliveryEvent>,
}

impl StorageListener {
    pub fn new(config: DimseConfig, result_dir: impl Into<PathBuf>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            result_dir: result_dir.into(),
            shutdown: CancellationToken::new(),
            task: None,
            local_addr: None,
            events_tx,
            events_rx,
        }
    }

    /// Bind the listener port and start accepting in the background.
    ///
    /// The result directory is created with the first delivery. Starting
    /// twice is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            return Err(PacsError::ListenerNotRunning);
        }

        let handler = FileStoreHandler {
            result_dir: self.result_dir.clone(),
            events: self.events_tx.clone(),
        };
        let scp = DimseScp::new(self.config.clone(), Arc::new(handler));
        let listener = scp.bind().await?;
        let local_addr = listener.local_addr()?;

        info!(
            "📥 Storage listener {} on {} writing to {}",
            self.config.listener_aet(),
            local_addr,
            self.result_dir.display()
        );

        let shutdown = self.shutdown.clone();
        self.local_addr = Some(local_addr);
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = scp.serve(listener, shutdown).await {
                error!("Storage listener on {} failed: {}", local_addr, e);
            }
        }));
        Ok(())
    }

    /// Whether the listener is accepting deliveries
    pub fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
            && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop accepting and wait for the accept loop to exit. Idempotent.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Storage listener task ended abnormally: {}", e);
            }
            debug!("Storage listener stopped");
        }
    }

    /// AE title the archive must use as move destination
    pub fn ae_title(&self) -> String {
        self.config.listener_aet()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    /// Where the instance with this SOP Instance UID is written
    pub fn path_for(&self, sop_instance_uid: &str) -> PathBuf {
        stored_path(&self.result_dir, sop_instance_uid)
    }

    /// Deliveries completed since the last call
    pub fn drain_events(&mut self) -> Vec<DeliveryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Drop for StorageListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// `{dir}/{sop_instance_uid}.dcm`
pub fn stored_path(dir: &Path, sop_instance_uid: &str) -> PathBuf {
    dir.join(format!("{}.{}", sop_instance_uid, STORED_FILE_EXTENSION))
}

/// Writes each delivered instance as a DICOM file
struct FileStoreHandler {
    result_dir: PathBuf,
    events: mpsc::UnboundedSender<DeliveryEvent>,
}

impl FileStoreHandler {
    fn write(&self, request: &StoreRequest) -> Result<(PathBuf, bool)> {
        let uid = request.sop_instance_uid.as_str();
        if uid.is_empty() || uid.contains(['/', '\\']) || uid.contains("..") {
            return Err(PacsError::Dimse(dimse::DimseError::Storage(format!(
                "refusing SOP Instance UID '{}' as a file name",
                uid
            ))));
        }

        let dataset = decode_dataset(&request.data, &request.transfer_syntax)?;
        let file = dataset
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(request.transfer_syntax.as_str())
                    .media_storage_sop_class_uid(request.sop_class_uid.as_str())
                    .media_storage_sop_instance_uid(uid),
            )
            .map_err(|e| dimse::DimseError::Storage(e.to_string()))?;

        std::fs::create_dir_all(&self.result_dir)?;
        let path = stored_path(&self.result_dir, uid);
        let overwritten = path.exists();

        // Written beside the target and renamed into place
        let mut tmp = NamedTempFile::new_in(&self.result_dir)?;
        file.write_all(&mut tmp)
            .map_err(|e| dimse::DimseError::Storage(e.to_string()))?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| PacsError::Io(e.error))?;

        Ok((path, overwritten))
    }
}

impl StoreHandler for FileStoreHandler {
    fn store(&self, request: StoreRequest) -> u16 {
        match self.write(&request) {
            Ok((path, overwritten)) => {
                if overwritten {
                    warn!(
                        "Instance {} delivered again, overwrote {}",
                        request.sop_instance_uid,
                        path.display()
                    );
                } else {
                    info!("Stored {}", path.display());
                }
                let _ = self.events.send(DeliveryEvent::Stored {
                    sop_instance_uid: request.sop_instance_uid,
                    path,
                    overwritten,
                });
                STATUS_SUCCESS
            }
            Err(e) => {
                error!(
                    "Failed to store instance {} from {}: {}",
                    request.sop_instance_uid, request.calling_aet, e
                );
                let _ = self.events.send(DeliveryEvent::Failed {
                    sop_instance_uid: request.sop_instance_uid,
                    reason: e.to_string(),
                });
                STATUS_PROCESSING_FAILURE
            }
        }
    }
}
