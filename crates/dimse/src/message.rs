//! DIMSE message framing over P-DATA-TF PDUs
//!
//! A DIMSE message is a command set (always Implicit VR Little Endian)
//! optionally followed by a data set encoded with the presentation context's
//! transfer syntax. Either part may be split across several PDVs and PDUs.

use std::collections::VecDeque;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};

use crate::types::{element_str, MoveProgress};
use crate::{DimseError, Result};

pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_FIND_RQ: u16 = 0x0020;
pub const C_FIND_RSP: u16 = 0x8020;
pub const C_MOVE_RQ: u16 = 0x0021;
pub const C_MOVE_RSP: u16 = 0x8021;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;
pub const C_CANCEL_RQ: u16 = 0x0FFF;

/// CommandDataSetType value meaning "no data set follows"
pub const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0001;

/// PDU size assumed when the peer announces no limit
const FALLBACK_MAX_PDU: u32 = 16_384;
/// PDV item header: item length (4), context id (1), control header (1)
const PDV_HEADER_LEN: u32 = 6;

/// A complete inbound DIMSE message
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    /// Raw data set bytes, still in the presentation context's transfer syntax
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    pub fn command_field(&self) -> Option<u16> {
        command_u16(&self.command, tags::COMMAND_FIELD)
    }

    pub fn message_id(&self) -> u16 {
        command_u16(&self.command, tags::MESSAGE_ID).unwrap_or(0)
    }

    pub fn status(&self) -> Option<u16> {
        command_u16(&self.command, tags::STATUS)
    }

    /// Sub-operation counters, present on C-MOVE responses
    pub fn progress(&self) -> Option<MoveProgress> {
        let remaining = command_u16(&self.command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS);
        let completed = command_u16(&self.command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS);
        let failed = command_u16(&self.command, tags::NUMBER_OF_FAILED_SUBOPERATIONS);
        let warning = command_u16(&self.command, tags::NUMBER_OF_WARNING_SUBOPERATIONS);
        if remaining.is_none() && completed.is_none() && failed.is_none() && warning.is_none() {
            return None;
        }
        Some(MoveProgress {
            remaining: remaining.unwrap_or(0),
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            warning: warning.unwrap_or(0),
        })
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        element_str(&self.command, tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        element_str(&self.command, tags::AFFECTED_SOP_INSTANCE_UID)
    }
}

/// What the peer sent next on an association
#[derive(Debug)]
pub enum Incoming {
    Message(DimseMessage),
    Release,
    Abort,
}

/// Reassembles PDV fragments into DIMSE messages
#[derive(Debug, Default)]
pub struct MessageAssembler {
    command_buf: Vec<u8>,
    data_buf: Vec<u8>,
    command: Option<(u8, InMemDicomObject)>,
    ready: VecDeque<DimseMessage>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the PDVs of one P-DATA-TF PDU
    pub fn push(&mut self, values: Vec<PDataValue>) -> Result<()> {
        for value in values {
            match value.value_type {
                PDataValueType::Command => {
                    self.command_buf.extend_from_slice(&value.data);
                    if value.is_last {
                        let command = decode_command(&self.command_buf)?;
                        self.command_buf.clear();
                        if has_data_set(&command) {
                            self.command = Some((value.presentation_context_id, command));
                        } else {
                            self.ready.push_back(DimseMessage {
                                presentation_context_id: value.presentation_context_id,
                                command,
                                data: None,
                            });
                        }
                    }
                }
                PDataValueType::Data => {
                    self.data_buf.extend_from_slice(&value.data);
                    if value.is_last {
                        let (pc_id, command) = self.command.take().ok_or_else(|| {
                            DimseError::UnexpectedPdu("data set received before its command".into())
                        })?;
                        self.ready.push_back(DimseMessage {
                            presentation_context_id: pc_id,
                            command,
                            data: Some(std::mem::take(&mut self.data_buf)),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Pop the next complete message, if any
    pub fn next_message(&mut self) -> Option<DimseMessage> {
        self.ready.pop_front()
    }
}

/// Receive PDUs until a complete message, a release request or an abort arrives
pub fn next_incoming<F>(assembler: &mut MessageAssembler, mut receive: F) -> Result<Incoming>
where
    F: FnMut() -> Result<Pdu>,
{
    loop {
        if let Some(message) = assembler.next_message() {
            return Ok(Incoming::Message(message));
        }
        match receive()? {
            Pdu::PData { data } => assembler.push(data)?,
            Pdu::ReleaseRQ => return Ok(Incoming::Release),
            Pdu::AbortRQ { .. } => return Ok(Incoming::Abort),
            other => {
                return Err(DimseError::UnexpectedPdu(format!("{:?}", other)));
            }
        }
    }
}

/// Encode a command set and optional data set as P-DATA-TF PDUs.
///
/// The data set is split so that no PDU exceeds `max_pdu` bytes.
pub fn message_pdus(
    presentation_context_id: u8,
    command: &InMemDicomObject,
    data: Option<&[u8]>,
    max_pdu: u32,
) -> Result<Vec<Pdu>> {
    let mut pdus = vec![Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id,
            value_type: PDataValueType::Command,
            is_last: true,
            data: encode_command(command)?,
        }],
    }];

    if let Some(data) = data {
        let max_pdu = if max_pdu == 0 { FALLBACK_MAX_PDU } else { max_pdu };
        let chunk_len = max_pdu.saturating_sub(PDV_HEADER_LEN).max(1) as usize;
        let chunk_count = data.len().div_ceil(chunk_len).max(1);
        for (i, chunk) in data.chunks(chunk_len).enumerate() {
            pdus.push(Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id,
                    value_type: PDataValueType::Data,
                    is_last: i + 1 == chunk_count,
                    data: chunk.to_vec(),
                }],
            });
        }
        if data.is_empty() {
            pdus.push(Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id,
                    value_type: PDataValueType::Data,
                    is_last: true,
                    data: Vec::new(),
                }],
            });
        }
    }

    Ok(pdus)
}

/// Encode a data set with the given transfer syntax
pub fn encode_dataset(dataset: &InMemDicomObject, transfer_syntax_uid: &str) -> Result<Vec<u8>> {
    with_transfer_syntax(transfer_syntax_uid, |ts| {
        let mut buf = Vec::new();
        dataset
            .write_dataset_with_ts(&mut buf, ts)
            .map_err(DimseError::encoding)?;
        Ok(buf)
    })
}

/// Decode a data set with the given transfer syntax
pub fn decode_dataset(data: &[u8], transfer_syntax_uid: &str) -> Result<InMemDicomObject> {
    with_transfer_syntax(transfer_syntax_uid, |ts| {
        InMemDicomObject::read_dataset_with_ts(data, ts).map_err(DimseError::parsing)
    })
}

/// Whether the transfer syntax is known to the registry
pub fn is_known_transfer_syntax(uid: &str) -> bool {
    with_transfer_syntax(uid, |_| Ok(())).is_ok()
}

fn with_transfer_syntax<T, F>(uid: &str, f: F) -> Result<T>
where
    F: FnOnce(&TransferSyntax) -> Result<T>,
{
    let uid = uid.trim_end_matches(['\0', ' ']);
    let registry = TransferSyntaxRegistry;
    let ts = registry
        .get(uid)
        .ok_or_else(|| DimseError::UnsupportedTransferSyntax(uid.to_string()))?;
    f(ts)
}

fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut buf, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(DimseError::encoding)?;
    Ok(buf)
}

fn decode_command(data: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(DimseError::parsing)
}

fn has_data_set(command: &InMemDicomObject) -> bool {
    command_u16(command, tags::COMMAND_DATA_SET_TYPE).unwrap_or(NO_DATA_SET) != NO_DATA_SET
}

fn command_u16(command: &InMemDicomObject, tag: dicom_core::Tag) -> Option<u16> {
    command.element(tag).ok()?.to_int::<u16>().ok()
}

fn uid_element(tag: dicom_core::Tag, uid: &str) -> InMemElement {
    DataElement::new(tag, VR::UI, PrimitiveValue::from(uid))
}

fn us_element(tag: dicom_core::Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn data_set_type(present: bool) -> u16 {
    if present {
        DATA_SET_PRESENT
    } else {
        NO_DATA_SET
    }
}

/// C-ECHO-RQ command set
pub fn echo_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        uid_element(tags::AFFECTED_SOP_CLASS_UID, crate::types::VERIFICATION_SOP_CLASS),
        us_element(tags::COMMAND_FIELD, C_ECHO_RQ),
        us_element(tags::MESSAGE_ID, message_id),
        us_element(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
    ])
}

/// C-ECHO-RSP command set
pub fn echo_rsp(message_id: u16, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        uid_element(tags::AFFECTED_SOP_CLASS_UID, crate::types::VERIFICATION_SOP_CLASS),
        us_element(tags::COMMAND_FIELD, C_ECHO_RSP),
        us_element(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us_element(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        us_element(tags::STATUS, status),
    ])
}

/// C-FIND-RQ command set
pub fn find_rq(sop_class_uid: &str, message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us_element(tags::COMMAND_FIELD, C_FIND_RQ),
        us_element(tags::MESSAGE_ID, message_id),
        us_element(tags::PRIORITY, 0x0000),
        us_element(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
    ])
}

/// C-FIND-RSP command set
pub fn find_rsp(sop_class_uid: &str, message_id: u16, status: u16, with_data: bool) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us_element(tags::COMMAND_FIELD, C_FIND_RSP),
        us_element(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us_element(tags::COMMAND_DATA_SET_TYPE, data_set_type(with_data)),
        us_element(tags::STATUS, status),
    ])
}

/// C-MOVE-RQ command set
pub fn move_rq(
    sop_class_uid: &str,
    message_id: u16,
    destination_aet: &str,
    priority: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us_element(tags::COMMAND_FIELD, C_MOVE_RQ),
        us_element(tags::MESSAGE_ID, message_id),
        DataElement::new(tags::MOVE_DESTINATION, VR::AE, PrimitiveValue::from(destination_aet)),
        us_element(tags::PRIORITY, priority),
        us_element(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
    ])
}

/// C-CANCEL-RQ command set for the request with `message_id`
pub fn cancel_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        us_element(tags::COMMAND_FIELD, C_CANCEL_RQ),
        us_element(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us_element(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
    ])
}

/// C-STORE-RQ command set
pub fn store_rq(sop_class_uid: &str, sop_instance_uid: &str, message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us_element(tags::COMMAND_FIELD, C_STORE_RQ),
        us_element(tags::MESSAGE_ID, message_id),
        us_element(tags::PRIORITY, 0x0000),
        us_element(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
        uid_element(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}

/// C-STORE-RSP command set
pub fn store_rsp(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        uid_element(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us_element(tags::COMMAND_FIELD, C_STORE_RSP),
        us_element(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us_element(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        us_element(tags::STATUS, status),
        uid_element(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}
