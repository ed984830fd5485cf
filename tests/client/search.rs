#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{client_config, fixture, MockArchive};
use pacsman::{NetworkClient, PacsClient, PacsError};

fn client() -> (tempfile::TempDir, NetworkClient<MockArchive>) {
    let dir = tempfile::tempdir().unwrap();
    let config = client_config(dir.path());
    let archive = MockArchive::new(&fixture(), &config);
    (dir, NetworkClient::with_connector(archive, config))
}

#[tokio::test]
async fn test_verify() {
    let (_dir, client) = client();
    assert!(client.verify().await.unwrap());
}

#[tokio::test]
async fn test_search_patients_merges_studies() {
    let (_dir, client) = client();

    let patients = client.search_patients("SMITH", &[]).await.unwrap();
    assert_eq!(patients.len(), 1);

    let smith = &patients[0];
    assert_eq!(smith.patient_id, "P1");
    assert_eq!(smith.patient_name, "SMITH^JANE");
    assert_eq!(smith.study_ids.len(), 2);
    assert_eq!(smith.most_recent_study_date, "20210505");
}

#[tokio::test]
async fn test_search_patients_matches_id_too() {
    let (_dir, client) = client();
    let patients = client.search_patients("P2", &[]).await.unwrap();
    assert_eq!(patients.len(), 1);
    assert_eq!(patients[0].patient_name, "DOE^JOHN");
}

#[tokio::test]
async fn test_studies_for_patient() {
    let (_dir, client) = client();
    let mut studies = client.studies_for_patient("P1", &[]).await.unwrap();
    studies.sort_by(|a, b| a.study_instance_uid.cmp(&b.study_instance_uid));

    let uids: Vec<_> = studies.iter().map(|s| s.study_instance_uid.as_str()).collect();
    assert_eq!(uids, vec!["1.1", "1.2"]);
    assert_eq!(studies[1].study_date, "20210505");
}

#[tokio::test]
async fn test_series_for_study_modality_filter() {
    let (_dir, client) = client();

    let all = client.series_for_study("1.1", None, &[]).await.unwrap();
    assert_eq!(all.len(), 3);

    let ct = vec!["CT".to_string()];
    let series = client.series_for_study("1.1", Some(&ct), &[]).await.unwrap();
    assert_eq!(series.len(), 2);
    assert!(series.iter().all(|s| s.modality == "CT"));

    // No count is reported, so each series is counted with a separate query
    let first = series
        .iter()
        .find(|s| s.series_instance_uid == "1.1.1")
        .unwrap();
    assert_eq!(first.image_count, 3);
}

#[tokio::test]
async fn test_search_series_template() {
    let (_dir, client) = client();
    let template: BTreeMap<String, String> = [("Modality".to_string(), "MR".to_string())]
        .into_iter()
        .collect();

    let mut series = client.search_series(&template, &[]).await.unwrap();
    series.sort_by(|a, b| a.series_instance_uid.cmp(&b.series_instance_uid));
    let uids: Vec<_> = series.iter().map(|s| s.series_instance_uid.as_str()).collect();
    assert_eq!(uids, vec!["1.1.2", "2.1.1"]);
}

#[tokio::test]
async fn test_images_for_series_max_count() {
    let (_dir, client) = client();

    let all = client.images_for_series("1.1.1", &[], None).await.unwrap();
    assert_eq!(all.len(), 3);

    let some = client.images_for_series("1.1.1", &[], Some(2)).await.unwrap();
    assert_eq!(some.len(), 2);
}

#[tokio::test]
async fn test_every_session_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let config = client_config(dir.path());
    let archive = MockArchive::new(&fixture(), &config);
    let counters = Arc::clone(&archive.counters);
    let client = NetworkClient::with_connector(archive, config);

    client.search_patients("SMITH", &[]).await.unwrap();
    client.series_for_study("1.1", None, &[]).await.unwrap();
    client.images_for_series("1.1.1", &[], Some(1)).await.unwrap();

    let opened = counters.opened.load(Ordering::SeqCst);
    assert!(opened > 0);
    assert_eq!(opened, counters.released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_failure_status_aborts_search() {
    let dir = tempfile::tempdir().unwrap();
    let config = client_config(dir.path());
    let archive = MockArchive::new(&fixture(), &config).failing_find(0xC000);
    let counters = Arc::clone(&archive.counters);
    let client = NetworkClient::with_connector(archive, config);

    let result = client.search_patients("SMITH", &[]).await;
    assert!(matches!(result, Err(PacsError::ProtocolFailure(0xC000))));
    assert_eq!(
        counters.opened.load(Ordering::SeqCst),
        counters.released.load(Ordering::SeqCst)
    );
}
