#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{fixture, Instance, CT_IMAGE_STORAGE};
use dicom_object::meta::FileMetaTableBuilder;
use dimse::types::EXPLICIT_VR_LE;
use pacsman::render::Renderer;
use pacsman::{FilesystemClient, PacsClient, PacsError};

struct CopyRenderer;

impl Renderer for CopyRenderer {
    fn render(&self, dicom_path: &Path) -> pacsman::Result<PathBuf> {
        let png = dicom_path.with_extension("png");
        std::fs::copy(dicom_path, &png)?;
        Ok(png)
    }
}

fn write_fixture(dir: &Path, instances: &[Instance]) {
    std::fs::create_dir_all(dir).unwrap();
    for instance in instances {
        let file = instance
            .to_dataset()
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LE)
                    .media_storage_sop_class_uid(CT_IMAGE_STORAGE)
                    .media_storage_sop_instance_uid(instance.sop_uid),
            )
            .unwrap();
        let study_dir = dir.join(instance.study_uid);
        std::fs::create_dir_all(&study_dir).unwrap();
        file.write_to_file(study_dir.join(format!("{}.dcm", instance.sop_uid)))
            .unwrap();
    }
}

fn client(root: &Path) -> FilesystemClient {
    let source = root.join("archive");
    write_fixture(&source, &fixture());
    FilesystemClient::open(source, root.join("dicom"))
        .unwrap()
        .with_renderer(Arc::new(CopyRenderer))
}

#[tokio::test]
async fn test_search_patients_scenario() {
    let root = tempfile::tempdir().unwrap();
    let client = client(root.path());

    assert!(client.verify().await.unwrap());

    let patients = client.search_patients("smith", &[]).await.unwrap();
    assert_eq!(patients.len(), 1);
    assert_eq!(patients[0].study_ids.len(), 2);
    assert_eq!(patients[0].most_recent_study_date, "20210505");
}

#[tokio::test]
async fn test_series_for_study_modality_filter() {
    let root = tempfile::tempdir().unwrap();
    let client = client(root.path());

    let ct = vec!["CT".to_string()];
    let series = client.series_for_study("1.1", Some(&ct), &[]).await.unwrap();
    assert_eq!(series.len(), 2);

    let studies = client.studies_for_patient("P1", &[]).await.unwrap();
    assert_eq!(studies.len(), 2);
}

#[tokio::test]
async fn test_search_series_wildcard_template() {
    let root = tempfile::tempdir().unwrap();
    let client = client(root.path());

    let template: BTreeMap<String, String> = [("PatientName".to_string(), "DOE*".to_string())]
        .into_iter()
        .collect();
    let series = client.search_series(&template, &[]).await.unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].series_instance_uid, "2.1.1");
    assert_eq!(series[0].image_count, 1);
}

#[tokio::test]
async fn test_fetch_image_and_missing_image() {
    let root = tempfile::tempdir().unwrap();
    let client = client(root.path());

    let path = client
        .fetch_image_as_file("1.1.1", "1.1.1.2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(path, root.path().join("dicom").join("1.1.1").join("1.1.1.2.dcm"));

    assert!(client
        .fetch_image_as_file("1.1.1", "9.9.9")
        .await
        .unwrap()
        .is_none());
    assert!(!root.path().join("dicom").join("1.1.1").join("9.9.9.dcm").exists());
}

#[tokio::test]
async fn test_thumbnail_uses_sorted_midpoint() {
    let root = tempfile::tempdir().unwrap();
    let client = client(root.path());

    let png = client.fetch_thumbnail("1.1.1").await.unwrap().unwrap();
    assert_eq!(png, root.path().join("dicom").join("1.1.1.2.png"));
    assert!(!root.path().join("dicom").join("1.1.1.2.dcm").exists());

    assert!(client.fetch_thumbnail("7.7.7").await.unwrap().is_none());
}

#[tokio::test]
async fn test_patient_ids_differing_in_case_are_inconsistent() {
    let root = tempfile::tempdir().unwrap();
    let source = root.path().join("archive");
    let smith = Instance {
        patient_id: "P1",
        patient_name: "SMITH^JANE",
        study_uid: "1.1",
        study_date: "20200101",
        series_uid: "1.1.1",
        modality: "CT",
        sop_uid: "1.1.1.1",
    };
    let lower = Instance {
        patient_id: "p1",
        study_uid: "1.2",
        series_uid: "1.2.1",
        sop_uid: "1.2.1.1",
        ..smith.clone()
    };
    write_fixture(&source, &[smith, lower]);
    let client = FilesystemClient::open(source, root.path().join("dicom")).unwrap();

    let result = client.search_patients("smith", &[]).await;
    assert!(matches!(result, Err(PacsError::DataInconsistency(_))));
}
