//! Folding of raw responses into de-duplicated records

use std::collections::{HashMap, HashSet};

use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dimse::types::element_str;

use crate::attributes::AttributeRegistry;
use crate::error::{PacsError, Result};
use crate::records::{reported_image_count, PatientRecord, SeriesRecord};

/// Builds patient records from study-level responses.
///
/// Responses are grouped by the trimmed, case-folded patient id; every
/// response of a group must agree on the id itself, the name and the birth
/// date.
#[derive(Debug, Default)]
pub struct PatientAggregator {
    extra_keys: Vec<String>,
    /// Study UID to the patient id it was first seen under
    seen_studies: HashMap<String, String>,
    order: Vec<String>,
    patients: HashMap<String, PatientRecord>,
}

/// Grouping key for a patient id
pub fn patient_key(patient_id: &str) -> String {
    patient_id.trim().to_lowercase()
}

impl PatientAggregator {
    pub fn new(extra_keys: &[String]) -> Self {
        Self {
            extra_keys: extra_keys.to_vec(),
            ..Default::default()
        }
    }

    /// Fold one study-level response.
    ///
    /// Responses without a patient id or study UID are skipped; a study
    /// already folded is ignored unless it now names another patient.
    pub fn add(&mut self, ds: &InMemDicomObject) -> Result<()> {
        let (Some(patient_id), Some(study_uid)) = (
            element_str(ds, tags::PATIENT_ID),
            element_str(ds, tags::STUDY_INSTANCE_UID),
        ) else {
            return Ok(());
        };

        if let Some(previous) = self.seen_studies.get(&study_uid) {
            if *previous != patient_id {
                return Err(PacsError::DataInconsistency(format!(
                    "study {} reported for patients '{}' and '{}'",
                    study_uid, previous, patient_id
                )));
            }
            return Ok(());
        }

        let incoming = PatientRecord {
            patient_id: patient_id.clone(),
            patient_name: element_str(ds, tags::PATIENT_NAME).unwrap_or_default(),
            birth_date: element_str(ds, tags::PATIENT_BIRTH_DATE).unwrap_or_default(),
            study_ids: vec![study_uid.clone()],
            most_recent_study_date: element_str(ds, tags::STUDY_DATE).unwrap_or_default(),
            extra: AttributeRegistry::global().copy_extra(ds, &self.extra_keys),
        };

        let key = patient_key(&patient_id);
        match self.patients.get_mut(&key) {
            None => {
                self.order.push(key.clone());
                self.patients.insert(key, incoming);
            }
            Some(record) => merge_study(record, incoming)?,
        }
        self.seen_studies.insert(study_uid, patient_id);
        Ok(())
    }

    /// Patients in the order first observed
    pub fn finish(mut self) -> Vec<PatientRecord> {
        self.order
            .iter()
            .filter_map(|key| self.patients.remove(key))
            .collect()
    }
}

/// Merge the studies of `incoming` into `record`, which must describe the
/// same patient
pub fn merge_study(record: &mut PatientRecord, incoming: PatientRecord) -> Result<()> {
    let singular = [
        ("PatientID", &record.patient_id, &incoming.patient_id),
        ("PatientName", &record.patient_name, &incoming.patient_name),
        ("PatientBirthDate", &record.birth_date, &incoming.birth_date),
    ];
    for (keyword, ours, theirs) in singular {
        if ours != theirs {
            return Err(PacsError::DataInconsistency(format!(
                "patient '{}' reported with {} '{}' and '{}'",
                record.patient_id, keyword, ours, theirs
            )));
        }
    }

    for study_uid in incoming.study_ids {
        if !record.study_ids.contains(&study_uid) {
            record.study_ids.push(study_uid);
        }
    }
    let study_date = incoming.most_recent_study_date;
    if !study_date.is_empty()
        && (record.most_recent_study_date.is_empty() || study_date > record.most_recent_study_date)
    {
        record.most_recent_study_date = study_date;
    }
    Ok(())
}

/// Builds one series record per series UID from series- or image-level
/// responses
#[derive(Debug, Default)]
pub struct SeriesAggregator {
    extra_keys: Vec<String>,
    order: Vec<String>,
    series: HashMap<String, SeriesEntry>,
}

#[derive(Debug)]
struct SeriesEntry {
    record: SeriesRecord,
    reported: bool,
    images: HashSet<String>,
}

impl SeriesAggregator {
    pub fn new(extra_keys: &[String]) -> Self {
        Self {
            extra_keys: extra_keys.to_vec(),
            ..Default::default()
        }
    }

    /// Fold one response; responses without a series UID are skipped
    pub fn add(&mut self, ds: &InMemDicomObject) {
        let Some(record) = SeriesRecord::from_dataset(ds, &self.extra_keys) else {
            return;
        };
        let uid = record.series_instance_uid.clone();
        let reported = reported_image_count(ds);

        let entry = self.series.entry(uid.clone()).or_insert_with(|| {
            self.order.push(uid);
            SeriesEntry {
                record,
                reported: false,
                images: HashSet::new(),
            }
        });

        if let Some(count) = reported {
            entry.record.image_count = count;
            entry.reported = true;
        }
        if let Some(image_uid) = element_str(ds, tags::SOP_INSTANCE_UID) {
            entry.images.insert(image_uid);
        }
    }

    pub fn finish(mut self) -> Vec<SeriesRecord> {
        self.order
            .iter()
            .filter_map(|uid| self.series.remove(uid))
            .map(|mut entry| {
                if !entry.reported {
                    entry.record.image_count = entry.images.len() as u32;
                }
                entry.record
            })
            .collect()
    }
}
