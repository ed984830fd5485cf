//! Service Class User (SCU) implementation for outbound DIMSE operations

use std::net::TcpStream;
use std::time::Duration;

use dicom_ul::association::client::ClientAssociation;
use dicom_ul::pdu::PresentationContextResultReason;
use dicom_ul::ClientAssociationOptions;
use tracing::{debug, info, warn};

use crate::config::{DimseConfig, RemoteNode};
use crate::message::{self, Incoming, MessageAssembler};
use crate::status::{StatusOutcome, STATUS_SUCCESS};
use crate::types::{DimseCommand, DimseResponse, FindQuery, MoveQuery, IMPLICIT_VR_LE};
use crate::{DimseError, Result};

/// DIMSE Service Class User
#[derive(Debug, Clone)]
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DimseConfig {
        &self.config
    }

    /// Open an association negotiating the abstract syntax of `command`.
    ///
    /// Queries and moves use Implicit VR Little Endian only, which every
    /// archive must support.
    pub fn associate(&self, node: &RemoteNode, command: DimseCommand) -> Result<Association> {
        let abstract_syntax = command.abstract_syntax().ok_or_else(|| {
            DimseError::config(format!("{} needs an explicit SOP class", command))
        })?;
        self.establish(node, abstract_syntax, vec![IMPLICIT_VR_LE.to_string()])
    }

    /// Send a single instance with C-STORE and return the response status.
    ///
    /// `data` must already be encoded in `transfer_syntax_uid`.
    pub fn store(
        &self,
        node: &RemoteNode,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        transfer_syntax_uid: &str,
        data: &[u8],
    ) -> Result<u16> {
        info!(
            "Sending C-STORE to {} (instance: {})",
            node, sop_instance_uid
        );
        let mut association =
            self.establish(node, sop_class_uid, vec![transfer_syntax_uid.to_string()])?;

        let result = association.store(sop_class_uid, sop_instance_uid, data);
        match &result {
            Ok(status) => {
                debug!("C-STORE response: 0x{:04X}", status);
                if let Err(e) = association.release() {
                    warn!("Failed to release association with {}: {}", node, e);
                }
            }
            Err(_) => association.abort(),
        }
        result
    }

    fn establish(
        &self,
        node: &RemoteNode,
        abstract_syntax: &str,
        transfer_syntaxes: Vec<String>,
    ) -> Result<Association> {
        node.validate()?;
        let peer = node.to_string();
        debug!(
            "Requesting association with {} (abstract syntax: {})",
            peer, abstract_syntax
        );

        let max_pdu = self.get_max_pdu(node);
        let inner = ClientAssociationOptions::new()
            .calling_ae_title(self.config.local_aet.clone())
            .called_ae_title(node.ae_title.clone())
            .with_presentation_context(abstract_syntax.to_string(), transfer_syntaxes)
            .max_pdu_length(max_pdu)
            .connection_timeout(self.get_connection_timeout(node))
            .read_timeout(self.config.read_timeout())
            .establish(node.address())
            .map_err(|e| DimseError::from_establish(&peer, e))?;

        let (presentation_context_id, transfer_syntax) = inner
            .presentation_contexts()
            .iter()
            .find(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .map(|pc| (pc.id, pc.transfer_syntax.clone()))
            .ok_or_else(|| DimseError::NoPresentationContext(abstract_syntax.to_string()))?;

        debug!(
            "Association with {} established (context {}, transfer syntax {})",
            peer, presentation_context_id, transfer_syntax
        );

        Ok(Association {
            inner,
            peer,
            abstract_syntax: abstract_syntax.to_string(),
            presentation_context_id,
            transfer_syntax: transfer_syntax.trim_end_matches('\0').to_string(),
            max_pdu,
            next_message_id: 1,
            assembler: MessageAssembler::new(),
        })
    }

    /// Get connection timeout for a node (uses node-specific or global setting)
    fn get_connection_timeout(&self, node: &RemoteNode) -> Duration {
        node.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout())
    }

    /// Get maximum PDU size for a node (uses node-specific or global setting)
    fn get_max_pdu(&self, node: &RemoteNode) -> u32 {
        node.max_pdu.unwrap_or(self.config.max_pdu)
    }
}

/// An established outbound association
pub struct Association {
    inner: ClientAssociation<TcpStream>,
    peer: String,
    abstract_syntax: String,
    presentation_context_id: u8,
    transfer_syntax: String,
    max_pdu: u32,
    next_message_id: u16,
    assembler: MessageAssembler,
}

impl Association {
    /// `AE@host:port` of the peer
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send C-ECHO and return the response status
    pub fn echo(&mut self) -> Result<u16> {
        info!("Sending C-ECHO to {}", self.peer);
        let message_id = self.message_id();
        self.send_message(&message::echo_rq(message_id), None)?;
        let response = self.receive_message()?;
        if response.command_field() != Some(message::C_ECHO_RSP) {
            return Err(DimseError::UnexpectedPdu(format!(
                "expected C-ECHO-RSP, got command 0x{:04X}",
                response.command_field().unwrap_or(0)
            )));
        }
        Ok(response.status().unwrap_or(STATUS_SUCCESS))
    }

    /// Send a C-FIND request; responses are read lazily from the returned stream
    pub fn find(&mut self, query: &FindQuery) -> Result<ResponseStream<'_>> {
        info!(
            "Sending C-FIND to {} (level: {})",
            self.peer, query.query_level
        );
        debug!("C-FIND query parameters: {:?}", query.parameters);

        let identifier = query.to_identifier()?;
        let data = message::encode_dataset(&identifier, &self.transfer_syntax)?;
        let message_id = self.message_id();
        let command = message::find_rq(&self.abstract_syntax, message_id);
        self.send_message(&command, Some(&data))?;
        Ok(ResponseStream::new(self, message_id, message::C_FIND_RSP))
    }

    /// Send a C-MOVE request; responses are read lazily from the returned stream
    pub fn move_request(&mut self, query: &MoveQuery) -> Result<ResponseStream<'_>> {
        info!(
            "Sending C-MOVE to {} (level: {}, dest: {})",
            self.peer, query.query_level, query.destination_aet
        );
        debug!("C-MOVE query parameters: {:?}", query.parameters);

        let identifier = query.to_identifier()?;
        let data = message::encode_dataset(&identifier, &self.transfer_syntax)?;
        let message_id = self.message_id();
        let command = message::move_rq(
            &self.abstract_syntax,
            message_id,
            &query.destination_aet,
            query.priority.code(),
        );
        self.send_message(&command, Some(&data))?;
        Ok(ResponseStream::new(self, message_id, message::C_MOVE_RSP))
    }

    fn store(&mut self, sop_class_uid: &str, sop_instance_uid: &str, data: &[u8]) -> Result<u16> {
        let message_id = self.message_id();
        let command = message::store_rq(sop_class_uid, sop_instance_uid, message_id);
        self.send_message(&command, Some(data))?;
        let response = self.receive_message()?;
        if response.command_field() != Some(message::C_STORE_RSP) {
            return Err(DimseError::UnexpectedPdu(format!(
                "expected C-STORE-RSP, got command 0x{:04X}",
                response.command_field().unwrap_or(0)
            )));
        }
        response
            .status()
            .ok_or_else(|| DimseError::operation_failed("C-STORE-RSP without status"))
    }

    /// Gracefully release the association
    pub fn release(self) -> Result<()> {
        debug!("Releasing association with {}", self.peer);
        self.inner.release().map_err(DimseError::ul)
    }

    /// Abort the association, ignoring any error
    pub fn abort(self) {
        debug!("Aborting association with {}", self.peer);
        let _ = self.inner.abort();
    }

    fn message_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    fn send_message(
        &mut self,
        command: &dicom_object::InMemDicomObject,
        data: Option<&[u8]>,
    ) -> Result<()> {
        for pdu in message::message_pdus(self.presentation_context_id, command, data, self.max_pdu)? {
            self.inner.send(&pdu).map_err(DimseError::ul)?;
        }
        Ok(())
    }

    fn receive_message(&mut self) -> Result<message::DimseMessage> {
        let inner = &mut self.inner;
        let incoming = message::next_incoming(&mut self.assembler, || {
            inner.receive().map_err(DimseError::ul)
        })?;
        match incoming {
            Incoming::Message(message) => Ok(message),
            Incoming::Abort => Err(DimseError::AssociationAborted(self.peer.clone())),
            Incoming::Release => Err(DimseError::UnexpectedPdu(format!(
                "{} requested release mid-exchange",
                self.peer
            ))),
        }
    }
}

/// Lazily reads the responses of one C-FIND or C-MOVE exchange.
///
/// Yields every response, pending or final, and ends after the first
/// non-pending status. Transport errors are yielded once and end the stream.
/// Dropping the stream before the final response cancels the request.
pub struct ResponseStream<'a> {
    association: &'a mut Association,
    message_id: u16,
    expected_command: u16,
    done: bool,
}

impl<'a> ResponseStream<'a> {
    fn new(association: &'a mut Association, message_id: u16, expected_command: u16) -> Self {
        Self {
            association,
            message_id,
            expected_command,
            done: false,
        }
    }

    /// Send C-CANCEL-RQ for the outstanding request
    fn cancel(&mut self) -> Result<()> {
        debug!(
            "Cancelling request {} on {}",
            self.message_id, self.association.peer
        );
        self.association
            .send_message(&message::cancel_rq(self.message_id), None)
    }

    fn read_response(&mut self) -> Result<DimseResponse> {
        let message = self.association.receive_message()?;
        if message.command_field() != Some(self.expected_command) {
            return Err(DimseError::UnexpectedPdu(format!(
                "expected response 0x{:04X}, got 0x{:04X}",
                self.expected_command,
                message.command_field().unwrap_or(0)
            )));
        }
        let status = message
            .status()
            .ok_or_else(|| DimseError::operation_failed("response without status"))?;
        let dataset = match &message.data {
            Some(data) => Some(message::decode_dataset(data, &self.association.transfer_syntax)?),
            None => None,
        };
        Ok(DimseResponse {
            status,
            dataset,
            progress: message.progress(),
        })
    }
}

impl Iterator for ResponseStream<'_> {
    type Item = Result<DimseResponse>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_response() {
            Ok(response) => {
                let outcome = StatusOutcome::classify(response.status);
                debug!("Response from {}: {}", self.association.peer, outcome);
                if !outcome.is_pending() {
                    self.done = true;
                }
                Some(Ok(response))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// A stream dropped before its final response still owns the exchange. The
// request is cancelled and the responses already in flight are read up to
// the final (Cancel) status so the association can be released cleanly.
impl Drop for ResponseStream<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.cancel() {
            warn!("Failed to cancel request on {}: {}", self.association.peer, e);
            self.done = true;
            return;
        }
        let mut skipped = 0usize;
        while let Some(result) = self.next() {
            if result.is_err() {
                break;
            }
            skipped += 1;
        }
        if skipped > 0 {
            debug!(
                "Discarded {} unread responses from {}",
                skipped, self.association.peer
            );
        }
    }
}
