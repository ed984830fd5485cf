//! Offline client backed by a directory of DICOM files
//!
//! Every `*.dcm` below the source directory is indexed once (headers only,
//! pixel data skipped). All operations are linear scans over that index.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use async_trait::async_trait;
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use dimse::types::{element_str, matches_pattern};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{modality_allowed, thumbnail_candidate, PacsClient, RemoveOnDrop};
use crate::aggregate::{PatientAggregator, SeriesAggregator};
use crate::attributes::AttributeRegistry;
use crate::error::{PacsError, Result};
use crate::listener::STORED_FILE_EXTENSION;
use crate::records::{ImageRecord, PatientRecord, SeriesRecord, StudyRecord};
use crate::render::{PngRenderer, Renderer};

#[derive(Debug, Clone)]
struct IndexedInstance {
    path: PathBuf,
    header: InMemDicomObject,
}

impl IndexedInstance {
    fn attr(&self, tag: dicom_core::Tag) -> String {
        element_str(&self.header, tag).unwrap_or_default()
    }
}

/// [`PacsClient`] serving a local directory tree
pub struct FilesystemClient {
    source_dir: PathBuf,
    dicom_dir: PathBuf,
    renderer: Arc<dyn Renderer>,
    index: RwLock<Vec<IndexedInstance>>,
}

impl FilesystemClient {
    /// Index `source_dir`; retrievals are written below `dicom_dir`
    pub fn open(source_dir: impl Into<PathBuf>, dicom_dir: impl Into<PathBuf>) -> Result<Self> {
        let source_dir = source_dir.into();
        let dicom_dir = dicom_dir.into();
        std::fs::create_dir_all(&dicom_dir)?;

        let mut index = Vec::new();
        for entry in WalkDir::new(&source_dir).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_dicom = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(STORED_FILE_EXTENSION));
            if !entry.file_type().is_file() || !is_dicom {
                continue;
            }
            match read_header(path) {
                Ok(header) => index.push(IndexedInstance {
                    path: path.to_path_buf(),
                    header,
                }),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        info!(
            "📂 Indexed {} DICOM files below {}",
            index.len(),
            source_dir.display()
        );

        Ok(Self {
            source_dir,
            dicom_dir,
            renderer: Arc::new(PngRenderer::default()),
            index: RwLock::new(index),
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Number of indexed instances
    pub fn len(&self) -> usize {
        self.instances().map(|index| index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn instances(&self) -> Result<RwLockReadGuard<'_, Vec<IndexedInstance>>> {
        self.index
            .read()
            .map_err(|_| PacsError::Task("filesystem index lock poisoned".to_string()))
    }

    /// Paths and SOP Instance UIDs of the instances selected by `filter`
    fn select<F>(&self, filter: F) -> Result<Vec<(PathBuf, String)>>
    where
        F: Fn(&IndexedInstance) -> bool,
    {
        Ok(self
            .instances()?
            .iter()
            .filter(|instance| filter(instance))
            .map(|instance| (instance.path.clone(), instance.attr(tags::SOP_INSTANCE_UID)))
            .collect())
    }
}

fn read_header(path: &Path) -> std::result::Result<InMemDicomObject, String> {
    let obj = OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .map_err(|e| e.to_string())?;
    Ok(obj.into_inner())
}

async fn copy_into(source: &Path, dir: &Path, sop_instance_uid: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(format!("{}.{}", sop_instance_uid, STORED_FILE_EXTENSION));
    tokio::fs::copy(source, &target).await?;
    debug!("Copied {} to {}", source.display(), target.display());
    Ok(target)
}

#[async_trait]
impl PacsClient for FilesystemClient {
    async fn verify(&self) -> Result<bool> {
        Ok(true)
    }

    async fn search_patients(&self, query: &str, extra: &[String]) -> Result<Vec<PatientRecord>> {
        let needle = query.to_lowercase();
        let mut aggregator = PatientAggregator::new(extra);
        for instance in self.instances()?.iter() {
            let id = instance.attr(tags::PATIENT_ID).to_lowercase();
            let name = instance.attr(tags::PATIENT_NAME).to_lowercase();
            if id.contains(&needle) || name.contains(&needle) {
                aggregator.add(&instance.header)?;
            }
        }
        Ok(aggregator.finish())
    }

    async fn search_series(
        &self,
        template: &BTreeMap<String, String>,
        extra: &[String],
    ) -> Result<Vec<SeriesRecord>> {
        let registry = AttributeRegistry::global();
        let mut aggregator = SeriesAggregator::new(extra);
        for instance in self.instances()?.iter() {
            let matches = template.iter().all(|(keyword, pattern)| {
                let value = registry
                    .tag(keyword)
                    .and_then(|tag| element_str(&instance.header, tag))
                    .unwrap_or_default();
                matches_pattern(pattern, &value)
            });
            if matches {
                aggregator.add(&instance.header);
            }
        }
        Ok(aggregator.finish())
    }

    async fn studies_for_patient(
        &self,
        patient_id: &str,
        extra: &[String],
    ) -> Result<Vec<StudyRecord>> {
        let mut seen = HashSet::new();
        Ok(self
            .instances()?
            .iter()
            .filter(|instance| instance.attr(tags::PATIENT_ID) == patient_id)
            .filter_map(|instance| StudyRecord::from_dataset(&instance.header, extra))
            .filter(|study| seen.insert(study.study_instance_uid.clone()))
            .collect())
    }

    async fn series_for_study(
        &self,
        study_id: &str,
        modality_filter: Option<&[String]>,
        extra: &[String],
    ) -> Result<Vec<SeriesRecord>> {
        let mut aggregator = SeriesAggregator::new(extra);
        for instance in self.instances()?.iter() {
            if instance.attr(tags::STUDY_INSTANCE_UID) == study_id
                && modality_allowed(modality_filter, &instance.attr(tags::MODALITY))
            {
                aggregator.add(&instance.header);
            }
        }
        Ok(aggregator.finish())
    }

    async fn images_for_series(
        &self,
        series_id: &str,
        extra: &[String],
        max_count: Option<usize>,
    ) -> Result<Vec<ImageRecord>> {
        Ok(self
            .instances()?
            .iter()
            .filter(|instance| instance.attr(tags::SERIES_INSTANCE_UID) == series_id)
            .filter_map(|instance| ImageRecord::from_dataset(&instance.header, extra))
            .take(max_count.unwrap_or(usize::MAX))
            .collect())
    }

    async fn fetch_images_as_files(&self, series_id: &str) -> Result<Option<PathBuf>> {
        let selected =
            self.select(|instance| instance.attr(tags::SERIES_INSTANCE_UID) == series_id)?;
        if selected.is_empty() {
            return Ok(None);
        }

        let result_dir = self.dicom_dir.join(series_id);
        for (path, sop_instance_uid) in &selected {
            copy_into(path, &result_dir, sop_instance_uid).await?;
        }
        info!("Copied {} files into {}", selected.len(), result_dir.display());
        Ok(Some(result_dir))
    }

    async fn fetch_image_as_file(
        &self,
        series_id: &str,
        image_id: &str,
    ) -> Result<Option<PathBuf>> {
        let selected = self.select(|instance| {
            instance.attr(tags::SERIES_INSTANCE_UID) == series_id
                && instance.attr(tags::SOP_INSTANCE_UID) == image_id
        })?;
        match selected.first() {
            Some((path, sop_instance_uid)) => {
                let result_dir = self.dicom_dir.join(series_id);
                Ok(Some(copy_into(path, &result_dir, sop_instance_uid).await?))
            }
            None => Ok(None),
        }
    }

    async fn fetch_thumbnail(&self, series_id: &str) -> Result<Option<PathBuf>> {
        let selected =
            self.select(|instance| instance.attr(tags::SERIES_INSTANCE_UID) == series_id)?;
        let ids = selected.iter().map(|(_, uid)| uid.clone()).collect();
        let Some(image_id) = thumbnail_candidate(ids) else {
            return Ok(None);
        };
        let Some((source, _)) = selected.iter().find(|(_, uid)| *uid == image_id) else {
            return Ok(None);
        };

        let dicom_path = copy_into(source, &self.dicom_dir, &image_id).await?;
        let _cleanup = RemoveOnDrop(dicom_path.clone());
        let renderer = Arc::clone(&self.renderer);
        let png = tokio::task::spawn_blocking(move || renderer.render(&dicom_path)).await??;
        Ok(Some(png))
    }

    async fn send_files(&self, paths: &[PathBuf]) -> Result<usize> {
        tokio::fs::create_dir_all(&self.source_dir).await?;

        let mut added = Vec::new();
        for path in paths {
            let header = match read_header(path) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            let Some(uid) = element_str(&header, tags::SOP_INSTANCE_UID) else {
                warn!("Skipping {}: no SOP Instance UID", path.display());
                continue;
            };
            let target = copy_into(path, &self.source_dir, &uid).await?;
            added.push(IndexedInstance {
                path: target,
                header,
            });
        }

        let count = added.len();
        let mut index = self
            .index
            .write()
            .map_err(|_| PacsError::Task("filesystem index lock poisoned".to_string()))?;
        for instance in added {
            index.retain(|existing| existing.path != instance.path);
            index.push(instance);
        }
        Ok(count)
    }
}
