//! In-process archive used by the client integration tests.
//!
//! Queries are answered from a fixed list of instance data sets. Moves
//! perform real C-STORE sub-operations against the client's storage listener
//! over loopback.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::message::encode_dataset;
use dimse::status::{STATUS_PENDING, STATUS_SUCCESS};
use dimse::types::{element_str, keyword_tag, EXPLICIT_VR_LE};
use dimse::{
    DimseCommand, DimseConfig, DimseResponse, DimseScu, FindQuery, MoveProgress, MoveQuery,
    RemoteNode,
};
use pacsman::session::{Connector, Responses, Session};

pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";

/// Status sent by the archive when some sub-operations failed
pub const STATUS_SUB_OPERATIONS_FAILED: u16 = 0xA702;

#[derive(Debug, Clone, Default)]
pub struct Instance {
    pub patient_id: &'static str,
    pub patient_name: &'static str,
    pub study_uid: &'static str,
    pub study_date: &'static str,
    pub series_uid: &'static str,
    pub modality: &'static str,
    pub sop_uid: &'static str,
}

impl Instance {
    pub fn to_dataset(&self) -> InMemDicomObject {
        let mut ds = InMemDicomObject::new_empty();
        let elements = [
            (tags::SOP_CLASS_UID, VR::UI, CT_IMAGE_STORAGE),
            (tags::SOP_INSTANCE_UID, VR::UI, self.sop_uid),
            (tags::PATIENT_ID, VR::LO, self.patient_id),
            (tags::PATIENT_NAME, VR::PN, self.patient_name),
            (tags::STUDY_INSTANCE_UID, VR::UI, self.study_uid),
            (tags::STUDY_DATE, VR::DA, self.study_date),
            (tags::SERIES_INSTANCE_UID, VR::UI, self.series_uid),
            (tags::MODALITY, VR::CS, self.modality),
        ];
        for (tag, vr, value) in elements {
            ds.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        }
        ds
    }
}

/// Jane Smith with two studies, plus an unrelated patient.
///
/// Study 1.1 holds series of modalities CT, MR, CT.
pub fn fixture() -> Vec<Instance> {
    let smith = Instance {
        patient_id: "P1",
        patient_name: "SMITH^JANE",
        ..Default::default()
    };
    let first = Instance {
        study_uid: "1.1",
        study_date: "20200101",
        ..smith.clone()
    };
    let second = Instance {
        study_uid: "1.2",
        study_date: "20210505",
        ..smith
    };
    vec![
        Instance { series_uid: "1.1.1", modality: "CT", sop_uid: "1.1.1.1", ..first.clone() },
        Instance { series_uid: "1.1.1", modality: "CT", sop_uid: "1.1.1.2", ..first.clone() },
        Instance { series_uid: "1.1.1", modality: "CT", sop_uid: "1.1.1.3", ..first.clone() },
        Instance { series_uid: "1.1.2", modality: "MR", sop_uid: "1.1.2.1", ..first.clone() },
        Instance { series_uid: "1.1.3", modality: "CT", sop_uid: "1.1.3.1", ..first },
        Instance { series_uid: "1.2.1", modality: "CT", sop_uid: "1.2.1.1", ..second },
        Instance {
            patient_id: "P2",
            patient_name: "DOE^JOHN",
            study_uid: "2.1",
            study_date: "20190303",
            series_uid: "2.1.1",
            modality: "MR",
            sop_uid: "2.1.1.1",
        },
    ]
}

/// A free loopback port for the storage listener
pub fn free_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .expect("no free port")
}

/// Client-side config whose listener the mock archive can reach
pub fn client_config(storage_dir: &Path) -> DimseConfig {
    DimseConfig {
        local_aet: "PACSMAN".to_string(),
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: free_port(),
        storage_dir: storage_dir.to_path_buf(),
        connect_timeout_ms: 5_000,
        read_timeout_ms: 5_000,
        ..Default::default()
    }
}

#[derive(Debug, Default)]
pub struct Counters {
    pub opened: AtomicUsize,
    pub released: AtomicUsize,
}

pub struct MockArchive {
    datasets: Arc<Vec<InMemDicomObject>>,
    scu: DimseScu,
    destination: RemoteNode,
    pub counters: Arc<Counters>,
    pub stored: Arc<Mutex<Vec<String>>>,
    find_failure: Option<u16>,
    move_failure: Option<u16>,
}

impl MockArchive {
    /// Archive serving `instances`, delivering moves to the listener
    /// described by `client`
    pub fn new(instances: &[Instance], client: &DimseConfig) -> Self {
        let scu_config = DimseConfig {
            local_aet: "MOCKPACS".to_string(),
            connect_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
            ..Default::default()
        };
        Self {
            datasets: Arc::new(instances.iter().map(Instance::to_dataset).collect()),
            scu: DimseScu::new(scu_config),
            destination: RemoteNode::new(client.listener_aet(), "127.0.0.1", client.port),
            counters: Arc::new(Counters::default()),
            stored: Arc::new(Mutex::new(Vec::new())),
            find_failure: None,
            move_failure: None,
        }
    }

    /// Answer every C-FIND with one pending response followed by `status`
    pub fn failing_find(mut self, status: u16) -> Self {
        self.find_failure = Some(status);
        self
    }

    /// End every C-MOVE with `status` once all sub-operations are done
    pub fn failing_move(mut self, status: u16) -> Self {
        self.move_failure = Some(status);
        self
    }
}

impl Connector for MockArchive {
    type Session = MockSession;

    fn open(&self, _command: DimseCommand) -> dimse::Result<MockSession> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            datasets: Arc::clone(&self.datasets),
            scu: self.scu.clone(),
            destination: self.destination.clone(),
            counters: Arc::clone(&self.counters),
            find_failure: self.find_failure,
            move_failure: self.move_failure,
            released: false,
        })
    }

    fn remote(&self) -> String {
        "MOCKPACS@127.0.0.1:0".to_string()
    }

    fn store(
        &self,
        _sop_class_uid: &str,
        sop_instance_uid: &str,
        _transfer_syntax_uid: &str,
        _data: &[u8],
    ) -> dimse::Result<u16> {
        if let Ok(mut stored) = self.stored.lock() {
            stored.push(sop_instance_uid.to_string());
        }
        Ok(STATUS_SUCCESS)
    }
}

pub struct MockSession {
    datasets: Arc<Vec<InMemDicomObject>>,
    scu: DimseScu,
    destination: RemoteNode,
    counters: Arc<Counters>,
    find_failure: Option<u16>,
    move_failure: Option<u16>,
    released: bool,
}

impl MockSession {
    /// Data sets accepted by `matches`, one per `unique_key` value
    fn select(
        &self,
        matches: impl Fn(&InMemDicomObject) -> bool,
        unique_key: &str,
    ) -> Vec<InMemDicomObject> {
        let key = keyword_tag(unique_key);
        let mut seen = HashSet::new();
        self.datasets
            .iter()
            .filter(|ds| matches(*ds))
            .filter(|ds| seen.insert(key.and_then(|tag| element_str(ds, tag))))
            .cloned()
            .collect()
    }
}

impl Session for MockSession {
    fn echo(&mut self) -> dimse::Result<u16> {
        Ok(STATUS_SUCCESS)
    }

    fn find(&mut self, query: &FindQuery) -> dimse::Result<Responses<'_>> {
        let selected = self.select(|ds| query.matches(ds), query.query_level.unique_key());

        let mut responses: Vec<dimse::Result<DimseResponse>> = Vec::new();
        match self.find_failure {
            Some(status) => {
                responses.extend(
                    selected
                        .into_iter()
                        .take(1)
                        .map(|ds| Ok(DimseResponse::new(STATUS_PENDING, Some(ds)))),
                );
                responses.push(Ok(DimseResponse::new(status, None)));
            }
            None => {
                responses.extend(
                    selected
                        .into_iter()
                        .map(|ds| Ok(DimseResponse::new(STATUS_PENDING, Some(ds)))),
                );
                // Some archives end the list with an empty success
                responses.push(Ok(DimseResponse::new(STATUS_SUCCESS, None)));
            }
        }
        Ok(Box::new(responses.into_iter()))
    }

    fn move_request(&mut self, query: &MoveQuery) -> dimse::Result<Responses<'_>> {
        let find = FindQuery {
            query_level: query.query_level,
            parameters: query.parameters.clone(),
        };
        let selected = self.select(|ds| find.matches(ds), "SOPInstanceUID");

        let total = selected.len() as u16;
        let mut progress = MoveProgress {
            remaining: total,
            ..Default::default()
        };
        let mut responses = Vec::new();
        for ds in &selected {
            let sop_uid = element_str(ds, tags::SOP_INSTANCE_UID).unwrap_or_default();
            let data = encode_dataset(ds, EXPLICIT_VR_LE)?;
            let status = self.scu.store(
                &self.destination,
                CT_IMAGE_STORAGE,
                &sop_uid,
                EXPLICIT_VR_LE,
                &data,
            )?;
            progress.remaining -= 1;
            if status == STATUS_SUCCESS {
                progress.completed += 1;
            } else {
                progress.failed += 1;
            }
            let mut response = DimseResponse::new(STATUS_PENDING, None);
            response.progress = Some(progress);
            responses.push(Ok(response));
        }

        let final_status = if let Some(status) = self.move_failure {
            status
        } else if progress.failed > 0 {
            STATUS_SUB_OPERATIONS_FAILED
        } else {
            STATUS_SUCCESS
        };
        let mut last = DimseResponse::new(final_status, None);
        last.progress = Some(progress);
        responses.push(Ok(last));
        Ok(Box::new(responses.into_iter()))
    }

    fn release(&mut self) -> dimse::Result<()> {
        if !self.released {
            self.released = true;
            self.counters.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
