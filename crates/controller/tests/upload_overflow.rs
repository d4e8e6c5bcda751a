//! A source upload past the configured size limit is rejected mid-stream
//! with 413, and no partial artifact is left behind under the build's
//! storage directory.

mod support;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use controller::artifact::LocalArtifactStore;
use controller::queue::QueueManager;
use controller::state::AppState;

const BOUNDARY: &str = "controller-test-boundary";
const TINY_SOURCE_LIMIT: u64 = 64;

fn multipart_body(source_len: usize) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(b"--");
    body.extend_from_slice(BOUNDARY.as_bytes());
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"meta\"\r\n\r\n");
    body.extend_from_slice(br#"{"platform":"ios"}"#);
    body.extend_from_slice(b"\r\n--");
    body.extend_from_slice(BOUNDARY.as_bytes());
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"source\"; filename=\"app.zip\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend(std::iter::repeat(b'x').take(source_len));
    body.extend_from_slice(b"\r\n--");
    body.extend_from_slice(BOUNDARY.as_bytes());
    body.extend_from_slice(b"--\r\n");
    body
}

#[tokio::test]
async fn oversized_source_upload_is_rejected_with_413() {
    let store = support::connect().await;
    let storage_dir = tempfile::tempdir().expect("tempdir");
    let artifacts: Arc<dyn controller::artifact::ArtifactStore> =
        Arc::new(LocalArtifactStore::new(storage_dir.path()));

    let queue = QueueManager::reconcile(store.clone())
        .await
        .expect("reconcile queue");
    let mut config = support::test_config("a-sufficiently-long-admin-key");
    config.max_source_size = TINY_SOURCE_LIMIT;
    let state = AppState::new(store.clone(), artifacts, queue, Arc::new(config));
    let router = controller::http::router(state);

    let oversized = multipart_body(TINY_SOURCE_LIMIT as usize * 4);
    let request = Request::builder()
        .method("POST")
        .uri("/api/builds/submit")
        .header("x-api-key", "a-sufficiently-long-admin-key")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(oversized))
        .expect("build request");

    let response = router.oneshot(request).await.expect("request");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // The build's subdirectory may exist (it's created before the first
    // byte is written), but no file may survive in it: the tmp file is
    // removed as soon as the limit is crossed, and the rename to the
    // final path never happens.
    let mut top_level = tokio::fs::read_dir(storage_dir.path())
        .await
        .expect("read storage dir");
    while let Some(build_dir) = top_level.next_entry().await.expect("read entry") {
        let mut inner = tokio::fs::read_dir(build_dir.path())
            .await
            .expect("read build dir");
        assert!(
            inner.next_entry().await.expect("read inner entry").is_none(),
            "no artifact file should survive a rejected upload"
        );
    }
}
