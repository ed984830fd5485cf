#[path = "../common/mod.rs"]
mod common;

use common::{client_config, Instance, CT_IMAGE_STORAGE};
use dimse::message::encode_dataset;
use dimse::status::STATUS_SUCCESS;
use dimse::types::EXPLICIT_VR_LE;
use dimse::{DimseConfig, DimseScu, RemoteNode};
use pacsman::listener::{DeliveryEvent, StorageListener};

fn instance(sop_uid: &'static str) -> Instance {
    Instance {
        patient_id: "P1",
        patient_name: "SMITH^JANE",
        study_uid: "1.1",
        study_date: "20200101",
        series_uid: "1.1.1",
        modality: "CT",
        sop_uid,
    }
}

/// C-STORE one instance to the listener from a blocking thread
async fn deliver(listener: &StorageListener, sop_uid: &'static str) -> u16 {
    let addr = listener.local_addr().expect("listener is bound");
    let node = RemoteNode::new(listener.ae_title(), "127.0.0.1", addr.port());
    let scu = DimseScu::new(DimseConfig {
        local_aet: "MOCKPACS".to_string(),
        ..Default::default()
    });

    tokio::task::spawn_blocking(move || {
        let data = encode_dataset(&instance(sop_uid).to_dataset(), EXPLICIT_VR_LE)?;
        scu.store(&node, CT_IMAGE_STORAGE, sop_uid, EXPLICIT_VR_LE, &data)
    })
    .await
    .unwrap()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redelivery_overwrites_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let result_dir = dir.path().join("1.1.1");
    let mut listener = StorageListener::new(client_config(dir.path()), &result_dir);

    listener.start().await.unwrap();
    assert!(listener.is_alive());

    for uid in ["1.1.1.1", "1.1.1.1", "1.1.1.2"] {
        assert_eq!(deliver(&listener, uid).await, STATUS_SUCCESS);
    }

    listener.stop().await;
    assert!(!listener.is_alive());

    let mut names: Vec<String> = std::fs::read_dir(&result_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["1.1.1.1.dcm", "1.1.1.2.dcm"]);

    let events = listener.drain_events();
    assert_eq!(events.len(), 3);
    let overwrites = events
        .iter()
        .filter(|e| matches!(e, DeliveryEvent::Stored { overwritten: true, .. }))
        .count();
    assert_eq!(overwrites, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_result_dir_created_by_first_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let result_dir = dir.path().join("nested").join("series");
    let mut listener = StorageListener::new(client_config(dir.path()), &result_dir);

    listener.start().await.unwrap();
    assert!(!result_dir.exists());
    assert_eq!(listener.path_for("1.2.3"), result_dir.join("1.2.3.dcm"));

    assert_eq!(deliver(&listener, "1.1.1.5").await, STATUS_SUCCESS);
    assert!(result_dir.join("1.1.1.5.dcm").is_file());
    listener.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delivery_after_stop_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let config = client_config(dir.path());
    let port = config.port;
    let mut listener = StorageListener::new(config, dir.path().join("series"));

    listener.start().await.unwrap();
    listener.stop().await;

    let node = RemoteNode::new("PACSMAN-SCP", "127.0.0.1", port).with_timeout(1_000);
    let scu = DimseScu::new(DimseConfig::default());
    let result = tokio::task::spawn_blocking(move || {
        let data = encode_dataset(&instance("1.1.1.9").to_dataset(), EXPLICIT_VR_LE)?;
        scu.store(&node, CT_IMAGE_STORAGE, "1.1.1.9", EXPLICIT_VR_LE, &data)
    })
    .await
    .unwrap();
    assert!(result.is_err());
}
