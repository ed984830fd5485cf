//! Service Class Provider (SCP) implementation for inbound DIMSE operations
//!
//! The SCP accepts C-STORE (and optionally C-ECHO) on behalf of a
//! [`StoreHandler`]. Accepting runs on the tokio runtime; each association
//! is then served on a blocking thread, since the upper layer is synchronous.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dicom_ul::association::server::ServerAssociation;
use dicom_ul::pdu::Pdu;
use dicom_ul::ServerAssociationOptions;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, span, warn, Level};

use crate::config::DimseConfig;
use crate::message::{self, DimseMessage, Incoming, MessageAssembler};
use crate::status::{STATUS_PROCESSING_FAILURE, STATUS_SUCCESS};
use crate::types::VERIFICATION_SOP_CLASS;
use crate::{DimseError, Result};

/// Status returned for DIMSE operations the SCP does not offer
const STATUS_UNRECOGNIZED_OPERATION: u16 = 0x0211;

/// An instance received through C-STORE
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// AE title of the peer that sent the instance
    pub calling_aet: String,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    /// Transfer syntax the data set bytes are encoded with
    pub transfer_syntax: String,
    /// Raw data set bytes, without preamble or file meta group
    pub data: Vec<u8>,
}

/// Receives instances accepted by the SCP.
///
/// Called on a blocking thread; the returned value is sent back to the peer
/// as the C-STORE response status.
pub trait StoreHandler: Send + Sync {
    fn store(&self, request: StoreRequest) -> u16;
}

/// DIMSE Service Class Provider
pub struct DimseScp {
    config: DimseConfig,
    handler: Arc<dyn StoreHandler>,
    active_associations: Arc<AtomicU32>,
}

impl DimseScp {
    /// Create a new SCP with the given configuration and store handler
    pub fn new(config: DimseConfig, handler: Arc<dyn StoreHandler>) -> Self {
        Self {
            config,
            handler,
            active_associations: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    /// Bind the configured address and port
    pub async fn bind(&self) -> Result<TcpListener> {
        self.config.validate()?;
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        Ok(listener)
    }

    /// Accept associations on `listener` until `shutdown` is cancelled.
    ///
    /// Associations already in progress run to completion on their own.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "Starting DIMSE SCP on {} (AET: {})",
            local_addr,
            self.config.listener_aet()
        );

        let scp = Arc::new(self);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DIMSE SCP on {} shutting down", local_addr);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted connection from {}", peer_addr);

                        // Check association limit
                        let active = scp.active_associations.load(Ordering::SeqCst);
                        if active >= scp.config.max_associations {
                            warn!(
                                "Maximum associations reached, rejecting connection from {}",
                                peer_addr
                            );
                            drop(stream);
                            continue;
                        }

                        let stream = match stream.into_std() {
                            Ok(stream) => stream,
                            Err(e) => {
                                error!("Failed to detach connection from {}: {}", peer_addr, e);
                                continue;
                            }
                        };

                        let scp_clone = Arc::clone(&scp);
                        tokio::task::spawn_blocking(move || {
                            if let Err(e) = scp_clone.handle_association(stream, peer_addr) {
                                error!("Error handling association from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single association
    fn handle_association(&self, stream: std::net::TcpStream, peer_addr: SocketAddr) -> Result<()> {
        self.active_associations.fetch_add(1, Ordering::SeqCst);
        let result = self.handle_association_inner(stream, peer_addr);
        self.active_associations.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn handle_association_inner(
        &self,
        stream: std::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.read_timeout()))?;

        let mut options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title(self.config.listener_aet())
            .max_pdu_length(self.config.max_pdu)
            .promiscuous(true);
        for ts in &self.config.preferred_transfer_syntaxes {
            options = options.with_transfer_syntax(ts.clone());
        }
        if self.config.enable_echo {
            options = options.with_abstract_syntax(VERIFICATION_SOP_CLASS);
        }

        let mut association = options
            .establish(stream)
            .map_err(|e| DimseError::from_establish(&peer_addr.to_string(), e))?;

        let calling_aet = association.client_ae_title().trim().to_string();
        let _span = span!(Level::DEBUG, "dimse_association", peer = %peer_addr, calling = %calling_aet)
            .entered();
        info!("Starting association with {} ({})", calling_aet, peer_addr);

        let contexts: HashMap<u8, String> = association
            .presentation_contexts()
            .iter()
            .map(|pc| (pc.id, pc.transfer_syntax.trim_end_matches('\0').to_string()))
            .collect();

        let mut assembler = MessageAssembler::new();
        loop {
            let incoming = {
                let association = &mut association;
                message::next_incoming(&mut assembler, || {
                    association.receive().map_err(DimseError::ul)
                })
            };

            match incoming {
                Ok(Incoming::Message(message)) => {
                    if let Err(e) = self.dispatch(&mut association, &calling_aet, &contexts, message) {
                        let _ = association.abort();
                        return Err(e);
                    }
                }
                Ok(Incoming::Release) => {
                    association.send(&Pdu::ReleaseRP).map_err(DimseError::ul)?;
                    info!("Association with {} released", calling_aet);
                    return Ok(());
                }
                Ok(Incoming::Abort) => {
                    info!("Association with {} aborted by peer", calling_aet);
                    return Ok(());
                }
                Err(e) => {
                    let _ = association.abort();
                    return Err(e);
                }
            }
        }
    }

    fn dispatch(
        &self,
        association: &mut ServerAssociation<std::net::TcpStream>,
        calling_aet: &str,
        contexts: &HashMap<u8, String>,
        message: DimseMessage,
    ) -> Result<()> {
        let pc_id = message.presentation_context_id;
        let message_id = message.message_id();

        let response = match message.command_field() {
            Some(message::C_ECHO_RQ) => {
                debug!("Processing C-ECHO request");
                let status = if self.config.enable_echo {
                    STATUS_SUCCESS
                } else {
                    STATUS_UNRECOGNIZED_OPERATION
                };
                message::echo_rsp(message_id, status)
            }
            Some(message::C_STORE_RQ) => {
                let sop_class_uid = message.affected_sop_class_uid().unwrap_or_default();
                let sop_instance_uid = message.affected_sop_instance_uid().unwrap_or_default();
                debug!("Processing C-STORE request for {}", sop_instance_uid);

                let status = match (contexts.get(&pc_id), message.data) {
                    (Some(transfer_syntax), Some(data)) => self.handler.store(StoreRequest {
                        calling_aet: calling_aet.to_string(),
                        sop_class_uid: sop_class_uid.clone(),
                        sop_instance_uid: sop_instance_uid.clone(),
                        transfer_syntax: transfer_syntax.clone(),
                        data,
                    }),
                    _ => {
                        warn!(
                            "C-STORE for {} without data set or presentation context",
                            sop_instance_uid
                        );
                        STATUS_PROCESSING_FAILURE
                    }
                };
                message::store_rsp(&sop_class_uid, &sop_instance_uid, message_id, status)
            }
            other => {
                return Err(DimseError::UnexpectedPdu(format!(
                    "unsupported command 0x{:04X}",
                    other.unwrap_or(0)
                )));
            }
        };

        for pdu in message::message_pdus(pc_id, &response, None, self.config.max_pdu)? {
            association.send(&pdu).map_err(DimseError::ul)?;
        }
        Ok(())
    }
}
