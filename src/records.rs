//! Domain records built from archive responses

use std::collections::BTreeMap;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::types::{element_str, element_u32};
use serde::Serialize;

use crate::attributes::{AttributeRegistry, PRIVATE_CREATOR};

/// Attributes requested for every series listing
pub const SERIES_RETURN_KEYS: [&str; 8] = [
    "SeriesInstanceUID",
    "SeriesDescription",
    "SeriesDate",
    "SeriesTime",
    "Modality",
    "BodyPartExamined",
    "PatientPosition",
    "NumberOfSeriesRelatedInstances",
];

/// A patient with the studies observed for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub patient_name: String,
    pub birth_date: String,
    /// Study instance UIDs, in the order first observed, without duplicates
    pub study_ids: Vec<String>,
    /// Greatest non-empty `YYYYMMDD` study date observed, empty if none
    pub most_recent_study_date: String,
    pub extra: BTreeMap<String, String>,
}

impl PatientRecord {
    /// Encode as a patient-level data set carrying the aggregated fields
    /// in the pacsman private attributes
    pub fn to_dataset(&self) -> InMemDicomObject {
        let registry = AttributeRegistry::global();
        let mut ds = InMemDicomObject::new_empty();
        ds.put(DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            PrimitiveValue::from(self.patient_id.as_str()),
        ));
        ds.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(self.patient_name.as_str()),
        ));
        ds.put(DataElement::new(
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            PrimitiveValue::from(self.birth_date.as_str()),
        ));

        let private = [
            ("PacsmanPrivateIdentifier", vec![PRIVATE_CREATOR.to_string()]),
            ("PatientStudyIDs", self.study_ids.clone()),
            (
                "PatientMostRecentStudyDate",
                vec![self.most_recent_study_date.clone()],
            ),
        ];
        for (keyword, values) in private {
            if let Some(element) = registry.private_element(keyword, &values) {
                ds.put(element);
            }
        }
        ds
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyRecord {
    pub patient_id: String,
    pub study_instance_uid: String,
    pub study_date: String,
    pub extra: BTreeMap<String, String>,
}

impl StudyRecord {
    /// `None` when the response lacks the patient or study identifier
    pub fn from_dataset(ds: &InMemDicomObject, extra_keys: &[String]) -> Option<Self> {
        Some(Self {
            patient_id: element_str(ds, tags::PATIENT_ID)?,
            study_instance_uid: element_str(ds, tags::STUDY_INSTANCE_UID)?,
            study_date: element_str(ds, tags::STUDY_DATE).unwrap_or_default(),
            extra: AttributeRegistry::global().copy_extra(ds, extra_keys),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesRecord {
    pub series_instance_uid: String,
    pub description: String,
    pub modality: String,
    pub body_part: String,
    pub patient_position: String,
    pub acquisition_date: String,
    pub acquisition_time: String,
    pub image_count: u32,
    pub extra: BTreeMap<String, String>,
}

impl SeriesRecord {
    /// `None` when the response lacks a series identifier.
    ///
    /// The image count is taken from NumberOfSeriesRelatedInstances and is 0
    /// when the archive does not report it; see [`reported_image_count`].
    pub fn from_dataset(ds: &InMemDicomObject, extra_keys: &[String]) -> Option<Self> {
        Some(Self {
            series_instance_uid: element_str(ds, tags::SERIES_INSTANCE_UID)?,
            description: element_str(ds, tags::SERIES_DESCRIPTION).unwrap_or_default(),
            modality: element_str(ds, tags::MODALITY).unwrap_or_default(),
            body_part: element_str(ds, tags::BODY_PART_EXAMINED).unwrap_or_default(),
            patient_position: element_str(ds, tags::PATIENT_POSITION).unwrap_or_default(),
            acquisition_date: element_str(ds, tags::SERIES_DATE).unwrap_or_default(),
            acquisition_time: element_str(ds, tags::SERIES_TIME).unwrap_or_default(),
            image_count: reported_image_count(ds).unwrap_or(0),
            extra: AttributeRegistry::global().copy_extra(ds, extra_keys),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
    pub extra: BTreeMap<String, String>,
}

impl ImageRecord {
    pub fn from_dataset(ds: &InMemDicomObject, extra_keys: &[String]) -> Option<Self> {
        Some(Self {
            series_instance_uid: element_str(ds, tags::SERIES_INSTANCE_UID)?,
            sop_instance_uid: element_str(ds, tags::SOP_INSTANCE_UID)?,
            extra: AttributeRegistry::global().copy_extra(ds, extra_keys),
        })
    }
}

/// NumberOfSeriesRelatedInstances, when the archive reported a usable value
pub fn reported_image_count(ds: &InMemDicomObject) -> Option<u32> {
    element_str(ds, tags::NUMBER_OF_SERIES_RELATED_INSTANCES)?;
    element_u32(ds, tags::NUMBER_OF_SERIES_RELATED_INSTANCES)
}
