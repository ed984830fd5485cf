//! Archive client operations
//!
//! [`PacsClient`] is implemented by [`NetworkClient`], which talks DIMSE to a
//! remote archive, and by [`FilesystemClient`], which serves the same
//! operations from a directory of DICOM files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::records::{ImageRecord, PatientRecord, SeriesRecord, StudyRecord};

pub mod filesystem;
pub mod network;

pub use filesystem::FilesystemClient;
pub use network::NetworkClient;

#[async_trait]
pub trait PacsClient: Send + Sync {
    /// Check connectivity with the archive. A failure status yields `false`.
    async fn verify(&self) -> Result<bool>;

    /// Patients whose id or name contains `query`
    async fn search_patients(&self, query: &str, extra: &[String]) -> Result<Vec<PatientRecord>>;

    /// Series matching `template`, a map of attribute keyword to matching value
    async fn search_series(
        &self,
        template: &BTreeMap<String, String>,
        extra: &[String],
    ) -> Result<Vec<SeriesRecord>>;

    async fn studies_for_patient(
        &self,
        patient_id: &str,
        extra: &[String],
    ) -> Result<Vec<StudyRecord>>;

    /// Series of a study, optionally restricted to the given modalities
    async fn series_for_study(
        &self,
        study_id: &str,
        modality_filter: Option<&[String]>,
        extra: &[String],
    ) -> Result<Vec<SeriesRecord>>;

    /// Images of a series, at most `max_count` when given
    async fn images_for_series(
        &self,
        series_id: &str,
        extra: &[String],
        max_count: Option<usize>,
    ) -> Result<Vec<ImageRecord>>;

    /// Retrieve a whole series into `{dicom_dir}/{series_id}/`
    async fn fetch_images_as_files(&self, series_id: &str) -> Result<Option<PathBuf>>;

    /// Retrieve one image into `{dicom_dir}/{series_id}/{image_id}.dcm`
    async fn fetch_image_as_file(&self, series_id: &str, image_id: &str)
        -> Result<Option<PathBuf>>;

    /// Render a representative image of the series and return the PNG path
    async fn fetch_thumbnail(&self, series_id: &str) -> Result<Option<PathBuf>>;

    /// Send local DICOM files to the archive; returns how many were accepted
    async fn send_files(&self, paths: &[PathBuf]) -> Result<usize>;
}

/// Image used for a series thumbnail: the middle of the sorted ids.
///
/// Instance ids carry no standard ordering, so this is deterministic but not
/// necessarily the anatomically central slice.
pub fn thumbnail_candidate(mut image_ids: Vec<String>) -> Option<String> {
    if image_ids.is_empty() {
        return None;
    }
    image_ids.sort();
    let middle = image_ids.len() / 2;
    Some(image_ids.swap_remove(middle))
}

/// Keep only series whose modality is in `filter`, when a filter is given
pub fn modality_allowed(filter: Option<&[String]>, modality: &str) -> bool {
    filter.map_or(true, |allowed| allowed.iter().any(|m| m == modality))
}

/// Deletes a file when dropped
pub(crate) struct RemoveOnDrop(pub PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        remove_if_exists(&self.0);
    }
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}
