#[path = "../common/mod.rs"]
mod common;

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use common::{client_config, fixture, MockArchive, STATUS_SUB_OPERATIONS_FAILED};
use pacsman::render::Renderer;
use pacsman::{NetworkClient, PacsClient, PacsError};

/// Records what it was asked to render and writes an empty PNG
#[derive(Default)]
struct RecordingRenderer {
    rendered: Mutex<Vec<PathBuf>>,
}

impl Renderer for RecordingRenderer {
    fn render(&self, dicom_path: &Path) -> pacsman::Result<PathBuf> {
        assert!(dicom_path.exists(), "rendered file must still be on disk");
        let png = dicom_path.with_extension("png");
        std::fs::write(&png, b"")?;
        if let Ok(mut rendered) = self.rendered.lock() {
            rendered.push(dicom_path.to_path_buf());
        }
        Ok(png)
    }
}

fn client(dir: &Path) -> NetworkClient<MockArchive> {
    let config = client_config(dir);
    let archive = MockArchive::new(&fixture(), &config);
    NetworkClient::with_connector(archive, config)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_series_writes_one_file_per_instance() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(dir.path());

    let series_dir = client
        .fetch_images_as_files("1.1.1")
        .await
        .unwrap()
        .expect("series should be retrieved");
    assert_eq!(series_dir, dir.path().join("1.1.1"));

    let mut names: Vec<String> = std::fs::read_dir(&series_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["1.1.1.1.dcm", "1.1.1.2.dcm", "1.1.1.3.dcm"]);

    let obj = dicom_object::open_file(series_dir.join("1.1.1.2.dcm")).unwrap();
    assert_eq!(obj.meta().media_storage_sop_instance_uid(), "1.1.1.2");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_single_image() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(dir.path());

    let path = client
        .fetch_image_as_file("1.1.1", "1.1.1.3")
        .await
        .unwrap()
        .expect("image should be retrieved");
    assert_eq!(path, dir.path().join("1.1.1").join("1.1.1.3.dcm"));
    assert_eq!(std::fs::read_dir(dir.path().join("1.1.1")).unwrap().count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_missing_image_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(dir.path());

    let fetched = client.fetch_image_as_file("1.1.1", "9.9.9").await.unwrap();
    assert!(fetched.is_none());
    // Nothing was delivered, so no series directory either
    assert!(!dir.path().join("1.1.1").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_unknown_series_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(dir.path());
    assert!(client.fetch_images_as_files("7.7.7").await.unwrap().is_none());
    assert!(!dir.path().join("7.7.7").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_move_reports_status_and_frees_port() {
    let dir = tempfile::tempdir().unwrap();
    let config = client_config(dir.path());
    let archive =
        MockArchive::new(&fixture(), &config).failing_move(STATUS_SUB_OPERATIONS_FAILED);
    let counters = Arc::clone(&archive.counters);
    let failing = NetworkClient::with_connector(archive, config.clone());

    let result = failing.fetch_images_as_files("1.1.1").await;
    assert!(matches!(
        result,
        Err(PacsError::ProtocolFailure(STATUS_SUB_OPERATIONS_FAILED))
    ));
    let result = failing.fetch_image_as_file("1.1.1", "1.1.1.1").await;
    assert!(matches!(
        result,
        Err(PacsError::ProtocolFailure(STATUS_SUB_OPERATIONS_FAILED))
    ));
    assert_eq!(
        counters.opened.load(Ordering::SeqCst),
        counters.released.load(Ordering::SeqCst)
    );

    // The listener was stopped, so the same port serves the next retrieval
    let archive = MockArchive::new(&fixture(), &config);
    let client = NetworkClient::with_connector(archive, config);
    let path = client
        .fetch_image_as_file("1.1.1", "1.1.1.3")
        .await
        .unwrap()
        .expect("image should be retrieved");
    assert!(path.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_port_is_free_after_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(dir.path());

    // The same listener port serves consecutive retrievals
    client.fetch_image_as_file("1.1.1", "1.1.1.1").await.unwrap();
    let second = client.fetch_image_as_file("1.1.1", "1.1.1.2").await.unwrap();
    assert!(second.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_thumbnail_renders_middle_image_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let renderer = Arc::new(RecordingRenderer::default());
    let client = client(dir.path()).with_renderer(renderer.clone());

    let png = client
        .fetch_thumbnail("1.1.1")
        .await
        .unwrap()
        .expect("thumbnail should be rendered");
    assert_eq!(png, dir.path().join("1.1.1.2.png"));
    assert!(png.exists());

    let rendered = renderer.rendered.lock().unwrap().clone();
    assert_eq!(rendered, vec![dir.path().join("1.1.1.2.dcm")]);
    // The intermediate DICOM file is removed once rendered
    assert!(!dir.path().join("1.1.1.2.dcm").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_thumbnail_retrieval_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = client_config(dir.path());
    let archive =
        MockArchive::new(&fixture(), &config).failing_move(STATUS_SUB_OPERATIONS_FAILED);
    let renderer = Arc::new(RecordingRenderer::default());
    let client = NetworkClient::with_connector(archive, config).with_renderer(renderer.clone());

    let result = client.fetch_thumbnail("1.1.1").await;
    assert!(matches!(
        result,
        Err(PacsError::ProtocolFailure(STATUS_SUB_OPERATIONS_FAILED))
    ));
    // The image was delivered before the move failed, and is removed again
    assert!(!dir.path().join("1.1.1.2.dcm").exists());
    assert!(renderer.rendered.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_thumbnail_of_empty_series_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let client = client(dir.path());
    assert!(client.fetch_thumbnail("7.7.7").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_files_stores_each_instance() {
    let dir = tempfile::tempdir().unwrap();
    let config = client_config(dir.path());
    let archive = MockArchive::new(&fixture(), &config);
    let stored = Arc::clone(&archive.stored);
    let counters = Arc::clone(&archive.counters);
    let client = NetworkClient::with_connector(archive, config);

    let series_dir = client.fetch_images_as_files("1.1.3").await.unwrap().unwrap();
    let sent = client
        .send_files(&[series_dir.join("1.1.3.1.dcm")])
        .await
        .unwrap();
    assert_eq!(sent, 1);
    assert_eq!(stored.lock().unwrap().as_slice(), ["1.1.3.1".to_string()]);
    assert_eq!(
        counters.opened.load(Ordering::SeqCst),
        counters.released.load(Ordering::SeqCst)
    );
}
