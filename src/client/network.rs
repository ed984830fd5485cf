//! Client for a remote archive over DIMSE

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dicom_dictionary_std::tags;
use dimse::message::encode_dataset;
use dimse::types::element_str;
use dimse::{DimseCommand, DimseConfig, DimseScu, FindQuery, MovePriority, MoveQuery, QueryLevel, RemoteNode};
use tracing::{debug, info, warn};

use super::{modality_allowed, thumbnail_candidate, PacsClient, RemoveOnDrop};
use crate::aggregate::{PatientAggregator, SeriesAggregator};
use crate::attributes::AttributeRegistry;
use crate::error::{PacsError, Result};
use crate::listener::{stored_path, DeliveryEvent, StorageListener};
use crate::records::{
    reported_image_count, ImageRecord, PatientRecord, SeriesRecord, StudyRecord,
    SERIES_RETURN_KEYS,
};
use crate::render::{PngRenderer, Renderer};
use crate::response::checked;
use crate::session::{with_session, Connector, DimseConnector, Session};
use crate::status::classify;

const PATIENT_STUDY_KEYS: [&str; 5] = [
    "PatientID",
    "PatientName",
    "PatientBirthDate",
    "StudyInstanceUID",
    "StudyDate",
];

/// [`PacsClient`] talking to a remote archive
pub struct NetworkClient<C: Connector = DimseConnector> {
    connector: Arc<C>,
    config: DimseConfig,
    renderer: Arc<dyn Renderer>,
    move_priority: MovePriority,
}

impl NetworkClient<DimseConnector> {
    /// Client for `pacs`, using `config` for both the outbound and the
    /// listener side
    pub fn new(config: DimseConfig, pacs: RemoteNode) -> Self {
        let connector = DimseConnector::new(DimseScu::new(config.clone()), pacs);
        Self::with_connector(connector, config)
    }
}

impl<C: Connector> NetworkClient<C> {
    pub fn with_connector(connector: C, config: DimseConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
            renderer: Arc::new(PngRenderer::default()),
            move_priority: MovePriority::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_move_priority(mut self, priority: MovePriority) -> Self {
        self.move_priority = priority;
        self
    }

    /// Root directory for retrieved files
    pub fn dicom_dir(&self) -> &Path {
        &self.config.storage_dir
    }

    /// Run a blocking exchange on the blocking thread pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Result<T> + Send + 'static,
    {
        let connector = Arc::clone(&self.connector);
        tokio::task::spawn_blocking(move || f(&connector)).await?
    }

    /// Move the instances selected by `query` into `result_dir`.
    ///
    /// The listener is started before the request and stopped once the
    /// response stream is drained, whether draining succeeded or not.
    async fn retrieve(&self, result_dir: PathBuf, query: MoveQuery) -> Result<StorageListener> {
        let mut listener = StorageListener::new(self.config.clone(), result_dir);
        listener.start().await?;

        let outcome = if listener.is_alive() {
            let query = query.with_priority(self.move_priority);
            self.blocking(move |connector| {
                with_session(connector, DimseCommand::Move, |session| {
                    checked(session.move_request(&query)?).drain()
                })
            })
            .await
        } else {
            Err(PacsError::ListenerNotRunning)
        };

        listener.stop().await;

        let events = listener.drain_events();
        let stored = events
            .iter()
            .filter(|e| matches!(e, DeliveryEvent::Stored { .. }))
            .count();
        let failed = events.len() - stored;
        if failed > 0 {
            warn!("{} deliveries into {} failed", failed, listener.result_dir().display());
        }
        debug!("{} instances stored into {}", stored, listener.result_dir().display());

        outcome?;
        Ok(listener)
    }

    fn move_query(&self, listener_aet: String) -> MoveQuery {
        MoveQuery::new(QueryLevel::Image, listener_aet)
    }
}

fn find_datasets<S: Session>(
    session: &mut S,
    query: &FindQuery,
) -> Result<Vec<dicom_object::InMemDicomObject>> {
    checked(session.find(query)?).collect()
}

fn count_images<C: Connector>(connector: &C, series_uid: &str) -> Result<u32> {
    let query = FindQuery::image()
        .with_parameter("SeriesInstanceUID", series_uid)
        .with_return_key("SOPInstanceUID");
    with_session(connector, DimseCommand::Find, |session| {
        let mut ids: Vec<String> = find_datasets(&mut **session, &query)?
            .iter()
            .filter_map(|ds| element_str(ds, tags::SOP_INSTANCE_UID))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids.len() as u32)
    })
}

fn image_ids<C: Connector>(connector: &C, series_uid: &str) -> Result<Vec<String>> {
    let query = FindQuery::image()
        .with_parameter("SeriesInstanceUID", series_uid)
        .with_return_key("SOPInstanceUID");
    with_session(connector, DimseCommand::Find, |session| {
        Ok(find_datasets(&mut **session, &query)?
            .iter()
            .filter_map(|ds| element_str(ds, tags::SOP_INSTANCE_UID))
            .collect())
    })
}

fn owned_keys(extra: &[String]) -> Vec<String> {
    AttributeRegistry::global()
        .return_keys(extra)
        .into_iter()
        .map(String::from)
        .collect()
}

#[async_trait]
impl<C: Connector> PacsClient for NetworkClient<C> {
    async fn verify(&self) -> Result<bool> {
        self.blocking(|connector| {
            with_session(connector, DimseCommand::Echo, |session| {
                let outcome = classify(session.echo()?);
                info!("C-ECHO to {}: {}", session.remote(), outcome);
                Ok(outcome.is_success())
            })
        })
        .await
    }

    async fn search_patients(&self, query: &str, extra: &[String]) -> Result<Vec<PatientRecord>> {
        let pattern = format!("*{}*", query);
        let keys = owned_keys(extra);
        let extra = extra.to_vec();

        let patients = self
            .blocking(move |connector| {
                with_session(connector, DimseCommand::Find, |session| {
                    let mut aggregator = PatientAggregator::new(&extra);
                    for field in ["PatientID", "PatientName"] {
                        let find = FindQuery::study()
                            .with_return_keys(PATIENT_STUDY_KEYS)
                            .with_return_keys(keys.iter().cloned())
                            .with_parameter(field, pattern.as_str());
                        for ds in checked(session.find(&find)?) {
                            aggregator.add(&ds?)?;
                        }
                    }
                    Ok(aggregator.finish())
                })
            })
            .await?;

        info!("Patient search '{}' matched {} patients", query, patients.len());
        Ok(patients)
    }

    async fn search_series(
        &self,
        template: &BTreeMap<String, String>,
        extra: &[String],
    ) -> Result<Vec<SeriesRecord>> {
        let mut find = FindQuery::image()
            .with_return_keys(SERIES_RETURN_KEYS)
            .with_return_key("SOPInstanceUID")
            .with_return_keys(owned_keys(extra));
        for (keyword, value) in template {
            find = find.with_parameter(keyword.as_str(), value.as_str());
        }
        let extra = extra.to_vec();

        self.blocking(move |connector| {
            with_session(connector, DimseCommand::Find, |session| {
                let mut aggregator = SeriesAggregator::new(&extra);
                for ds in checked(session.find(&find)?) {
                    aggregator.add(&ds?);
                }
                Ok(aggregator.finish())
            })
        })
        .await
    }

    async fn studies_for_patient(
        &self,
        patient_id: &str,
        extra: &[String],
    ) -> Result<Vec<StudyRecord>> {
        let find = FindQuery::study()
            .with_return_keys(PATIENT_STUDY_KEYS)
            .with_return_keys(owned_keys(extra))
            .with_parameter("PatientID", patient_id);
        let extra = extra.to_vec();

        self.blocking(move |connector| {
            with_session(connector, DimseCommand::Find, |session| {
                Ok(find_datasets(&mut **session, &find)?
                    .iter()
                    .filter_map(|ds| StudyRecord::from_dataset(ds, &extra))
                    .collect())
            })
        })
        .await
    }

    async fn series_for_study(
        &self,
        study_id: &str,
        modality_filter: Option<&[String]>,
        extra: &[String],
    ) -> Result<Vec<SeriesRecord>> {
        let find = FindQuery::series()
            .with_return_keys(SERIES_RETURN_KEYS)
            .with_return_keys(owned_keys(extra))
            .with_parameter("StudyInstanceUID", study_id);
        let extra = extra.to_vec();
        let filter = modality_filter.map(<[String]>::to_vec);

        self.blocking(move |connector| {
            let datasets = with_session(connector, DimseCommand::Find, |session| {
                find_datasets(&mut **session, &find)
            })?;

            let mut records = Vec::new();
            for ds in &datasets {
                let Some(mut record) = SeriesRecord::from_dataset(ds, &extra) else {
                    continue;
                };
                if !modality_allowed(filter.as_deref(), &record.modality) {
                    continue;
                }
                if reported_image_count(ds).is_none() {
                    record.image_count = count_images(connector, &record.series_instance_uid)?;
                }
                records.push(record);
            }
            Ok(records)
        })
        .await
    }

    async fn images_for_series(
        &self,
        series_id: &str,
        extra: &[String],
        max_count: Option<usize>,
    ) -> Result<Vec<ImageRecord>> {
        let find = FindQuery::image()
            .with_return_key("SOPInstanceUID")
            .with_return_keys(owned_keys(extra))
            .with_parameter("SeriesInstanceUID", series_id);
        let extra = extra.to_vec();
        let limit = max_count.unwrap_or(usize::MAX);

        self.blocking(move |connector| {
            with_session(connector, DimseCommand::Find, |session| {
                // take() stops pulling responses once the limit is reached
                checked(session.find(&find)?)
                    .filter_map(|ds| {
                        ds.map(|ds| ImageRecord::from_dataset(&ds, &extra))
                            .transpose()
                    })
                    .take(limit)
                    .collect()
            })
        })
        .await
    }

    async fn fetch_images_as_files(&self, series_id: &str) -> Result<Option<PathBuf>> {
        let result_dir = self.dicom_dir().join(series_id);
        info!("Retrieving series {} into {}", series_id, result_dir.display());

        let query = self
            .move_query(self.config.listener_aet())
            .with_parameter("SeriesInstanceUID", series_id);
        let listener = self.retrieve(result_dir, query).await?;

        // The directory only appears with the first delivery
        let dir = listener.result_dir().to_path_buf();
        let delivered = std::fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        Ok(delivered.then_some(dir))
    }

    async fn fetch_image_as_file(
        &self,
        series_id: &str,
        image_id: &str,
    ) -> Result<Option<PathBuf>> {
        let result_dir = self.dicom_dir().join(series_id);
        info!("Retrieving image {} of series {}", image_id, series_id);

        let query = self
            .move_query(self.config.listener_aet())
            .with_parameter("SeriesInstanceUID", series_id)
            .with_parameter("SOPInstanceUID", image_id);
        let listener = self.retrieve(result_dir, query).await?;

        let path = listener.path_for(image_id);
        Ok(path.exists().then_some(path))
    }

    async fn fetch_thumbnail(&self, series_id: &str) -> Result<Option<PathBuf>> {
        let series_uid = series_id.to_string();
        let ids = self
            .blocking(move |connector| image_ids(connector, &series_uid))
            .await?;
        let Some(image_id) = thumbnail_candidate(ids) else {
            info!("Series {} has no images for a thumbnail", series_id);
            return Ok(None);
        };

        // Removed on every exit, including a failed retrieval that already
        // delivered the image
        let dicom_path = stored_path(self.dicom_dir(), &image_id);
        let _cleanup = RemoveOnDrop(dicom_path.clone());

        let query = self
            .move_query(self.config.listener_aet())
            .with_parameter("SeriesInstanceUID", series_id)
            .with_parameter("SOPInstanceUID", image_id.as_str());
        self.retrieve(self.dicom_dir().to_path_buf(), query).await?;

        if !dicom_path.exists() {
            return Ok(None);
        }

        let renderer = Arc::clone(&self.renderer);
        let png = tokio::task::spawn_blocking(move || renderer.render(&dicom_path)).await??;
        Ok(Some(png))
    }

    async fn send_files(&self, paths: &[PathBuf]) -> Result<usize> {
        let paths = paths.to_vec();
        self.blocking(move |connector| {
            let mut accepted = 0;
            for path in &paths {
                let obj = dicom_object::open_file(path)
                    .map_err(|e| dimse::DimseError::parsing(format!("{}: {}", path.display(), e)))?;
                let meta = obj.meta();
                let transfer_syntax = meta.transfer_syntax().to_string();
                let data = encode_dataset(&obj, &transfer_syntax)?;
                let status = connector.store(
                    meta.media_storage_sop_class_uid(),
                    meta.media_storage_sop_instance_uid(),
                    &transfer_syntax,
                    &data,
                )?;
                match classify(status) {
                    outcome if outcome.is_success() => accepted += 1,
                    outcome => warn!("Archive refused {}: {}", path.display(), outcome),
                }
            }
            info!("Sent {} of {} files to {}", accepted, paths.len(), connector.remote());
            Ok(accepted)
        })
        .await
    }
}
