use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use zaplink_core::channels::ChannelCatalog;
use zaplink_core::epg::EpgStore;
use zaplink_core::hls::HlsManager;
use zaplink_core::tuner::{TunerDescriptor, TunerId, TunerPool};
use zaplink_core::{create_app, AppState};

const CHANNELS_CONF: &str = "5.1|WABC HD|563000000|1\n7.1|WNBC HD|177000000|2\n";

async fn test_state(tmp: &std::path::Path, n_tuners: u32) -> Arc<AppState> {
    let conf_path = tmp.join("channels.conf");
    tokio::fs::write(&conf_path, CHANNELS_CONF).await.unwrap();

    let catalog = Arc::new(ChannelCatalog::load(&conf_path).await.unwrap());

    let descriptors = (0..n_tuners)
        .map(|i| TunerDescriptor {
            id: TunerId(i),
            device_path: PathBuf::from(format!("/dev/dvb/adapter{i}")),
        })
        .collect();
    let pool = TunerPool::new(descriptors);

    let hls_root = tmp.join("hls");
    let hls = HlsManager::new(hls_root, pool.clone(), "cat".to_string(), conf_path.clone()).unwrap();

    let epg = EpgStore::open_in_memory().await.unwrap();

    Arc::new(AppState {
        catalog,
        pool,
        hls,
        epg,
        channels_conf_path: conf_path,
        capture_program: "cat".to_string(),
    })
}

#[tokio::test]
async fn unknown_channel_returns_404() {
    let tmp = tempdir();
    let state = test_state(tmp.path(), 1).await;
    let app = create_app(state);

    let response = app
        .oneshot(Request::builder().uri("/stream/99.9").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn healthz_reports_ok() {
    let tmp = tempdir();
    let state = test_state(tmp.path(), 1).await;
    let app = create_app(state);

    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_exposes_tuner_gauges() {
    let tmp = tempdir();
    let state = test_state(tmp.path(), 2).await;
    let app = create_app(state);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("zaplink_tuner_held"));
    assert!(text.contains("zaplink_hls_active_sessions"));
}

#[tokio::test]
async fn plain_global_playlist_lists_every_channel() {
    let tmp = tempdir();
    let state = test_state(tmp.path(), 1).await;
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/playlist.m3u")
                .header("Host", "zaplink.local:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("http://zaplink.local:8080/stream/5.1"));
    assert!(text.contains("http://zaplink.local:8080/stream/7.1"));
}

#[tokio::test]
async fn hls_playlist_requires_known_backend_and_codec() {
    let tmp = tempdir();
    let state = test_state(tmp.path(), 1).await;
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/hls/not-a-backend/h264/5.1/index.m3u8")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn hls_segment_rejects_path_traversal() {
    let tmp = tempdir();
    let state = test_state(tmp.path(), 1).await;
    let app = create_app(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/hls/abc/../../etc/passwd")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn guide_json_is_empty_array_with_no_scanned_programs() {
    let tmp = tempdir();
    let state = test_state(tmp.path(), 1).await;
    let app = create_app(state);

    let response = app
        .oneshot(Request::builder().uri("/guide.json").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"[]");
}

/// Minimal stand-in for `tempfile::tempdir()`: the pack's teacher examples
/// depend on it, but this crate has no other use for the crate, so a
/// process-unique directory under `std::env::temp_dir()` avoids adding a
/// dependency for one test helper.
struct TempDir(PathBuf);

impl TempDir {
    fn path(&self) -> &std::path::Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn tempdir() -> TempDir {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("zaplink-api-test-{}-{n}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    TempDir(dir)
}
