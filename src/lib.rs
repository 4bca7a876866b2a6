//! HTTP adapter: parses URLs into the five core operations (spec §6) and
//! dispatches to the tuner pool, pipeline runner, HLS manager, and EPG
//! store. One state struct, one handler per route, errors converted via
//! `CoreError`'s `IntoResponse`.

pub mod channels;
pub mod demux;
pub mod epg;
pub mod error;
pub mod hls;
pub mod metrics;
pub mod pipeline;
pub mod process;
pub mod scan;
pub mod transcode_args;
pub mod tuner;
pub mod xmltv;

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::Stream;
use serde::Deserialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use channels::ChannelCatalog;
use error::{CoreError, CoreResult};
use hls::{Fingerprint, HlsManager, PlaylistKind};
use pipeline::{CaptureSpec, Pipeline};
use transcode_args::{Backend, Codec, OutputKind, TranscodeParams};
use tuner::{TunerPool, UserClass};

pub struct AppState {
    pub catalog: Arc<ChannelCatalog>,
    pub pool: Arc<TunerPool>,
    pub hls: Arc<HlsManager>,
    pub epg: epg::EpgStore,
    pub channels_conf_path: PathBuf,
    pub capture_program: String,
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream/{channel}", get(stream_handler))
        .route("/transcode/{*rest}", get(transcode_handler))
        .route("/hls/{*rest}", get(hls_handler))
        .route("/playlist.m3u", get(global_playlist_handler))
        .route("/guide.xml", get(guide_xml_handler))
        .route("/guide.json", get(guide_json_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

async fn fallback_handler(uri: axum::http::Uri) -> impl IntoResponse {
    info!(%uri, "HTTP 404");
    (StatusCode::NOT_FOUND, "not found")
}

/// Wraps a live [`Pipeline`] and its broadcast receiver as a byte stream, so
/// the pipeline (tuner lease, child processes) stays alive for exactly as
/// long as the HTTP response body is being polled.
struct GuardedPipelineStream {
    _pipeline: Pipeline,
    inner: BroadcastStream<Bytes>,
}

impl Stream for GuardedPipelineStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => Poll::Ready(Some(Ok(bytes))),
                Poll::Ready(Some(Err(_lagged))) => continue,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

fn pipeline_response(pipeline: Pipeline, content_type: &'static str) -> Response {
    let Some(rx) = pipeline.subscribe() else {
        return CoreError::Internal(anyhow::anyhow!("pipeline has no output stream")).into_response();
    };
    let guarded = GuardedPipelineStream {
        _pipeline: pipeline,
        inner: BroadcastStream::new(rx),
    };
    Response::builder()
        .header("Content-Type", content_type)
        .header("Cache-Control", "no-store")
        .body(Body::from_stream(guarded))
        .unwrap()
}

async fn stream_handler(Path(channel): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    match stream_inner(&state, &channel).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn stream_inner(state: &Arc<AppState>, channel: &str) -> CoreResult<Response> {
    state
        .catalog
        .find_by_number(channel)
        .ok_or_else(|| CoreError::NotFound(format!("unknown channel {channel}")))?;

    let capture_spec = CaptureSpec::for_channel(state.capture_program.clone(), &state.channels_conf_path, channel);
    let pipeline = Pipeline::start_passthrough(state.pool.clone(), UserClass::Stream, capture_spec).await?;
    Ok(pipeline_response(pipeline, "video/mp2t"))
}

/// `/backend/codec[/bNNN][/ac6]/channel` segments, shared by the transcode
/// and HLS routes (spec §6's `url_params` shape, reversed into a parser).
struct EncodeParams {
    backend: Backend,
    codec: Codec,
    bitrate_kbps: Option<u32>,
    surround: bool,
    channel: String,
}

fn parse_encode_segments(segments: &[&str]) -> CoreResult<EncodeParams> {
    let mut it = segments.iter();

    let backend = it
        .next()
        .and_then(|s| Backend::parse(s))
        .ok_or_else(|| CoreError::BadParams("missing or unknown backend".to_string()))?;
    let codec = it
        .next()
        .and_then(|s| Codec::parse(s))
        .ok_or_else(|| CoreError::BadParams("missing or unknown codec".to_string()))?;

    let mut bitrate_kbps = None;
    let mut surround = false;
    let mut rest: Vec<&str> = it.copied().collect();

    if let Some(first) = rest.first() {
        if let Some(n) = first.strip_prefix('b').and_then(|n| n.parse::<u32>().ok()) {
            bitrate_kbps = Some(n);
            rest.remove(0);
        }
    }
    if let Some(first) = rest.first() {
        if *first == "ac6" {
            surround = true;
            rest.remove(0);
        }
    }

    let channel = rest
        .first()
        .ok_or_else(|| CoreError::BadParams("missing channel number".to_string()))?
        .to_string();

    Ok(EncodeParams {
        backend,
        codec,
        bitrate_kbps,
        surround,
        channel,
    })
}

async fn transcode_handler(Path(rest): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    match transcode_inner(&state, &rest).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn transcode_inner(state: &Arc<AppState>, rest: &str) -> CoreResult<Response> {
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let params = parse_encode_segments(&segments)?;

    state
        .catalog
        .find_by_number(&params.channel)
        .ok_or_else(|| CoreError::NotFound(format!("unknown channel {}", params.channel)))?;

    let capture_spec =
        CaptureSpec::for_channel(state.capture_program.clone(), &state.channels_conf_path, &params.channel);
    let transcode = TranscodeParams {
        backend: params.backend,
        codec: params.codec,
        surround: params.surround,
        bitrate_kbps: params.bitrate_kbps,
        output: OutputKind::Pipe,
    };

    let pipeline = Pipeline::start(state.pool.clone(), UserClass::Stream, capture_spec, transcode).await?;
    Ok(pipeline_response(pipeline, params.codec.content_type()))
}

async fn hls_handler(Path(rest): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    match hls_inner(&state, &rest).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn hls_inner(state: &Arc<AppState>, rest: &str) -> CoreResult<Response> {
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    if segments.last().copied() == Some("index.m3u8") {
        let params = parse_encode_segments(&segments[..segments.len() - 1])?;

        state
            .catalog
            .find_by_number(&params.channel)
            .ok_or_else(|| CoreError::NotFound(format!("unknown channel {}", params.channel)))?;

        let fingerprint = Fingerprint {
            channel: params.channel,
            backend: params.backend,
            codec: params.codec,
            surround: params.surround,
            bitrate_kbps: params.bitrate_kbps,
        };

        let playlist = state.hls.resolve_playlist(fingerprint).await?;
        return Ok(Response::builder()
            .header("Content-Type", "application/vnd.apple.mpegurl")
            .header("Cache-Control", "no-cache")
            .body(Body::from(playlist))
            .unwrap());
    }

    // Anything not ending in `index.m3u8` is a segment fetch:
    // `<session_id>/<segment_file>`. Split on the first `/` only, rather
    // than the pre-filtered segment list, so a path-traversal attempt like
    // `abc/../../etc/passwd` is handed to `resolve_segment` intact and
    // rejected there instead of silently collapsing into "malformed".
    let (session_id, segment) = rest
        .split_once('/')
        .ok_or_else(|| CoreError::NotFound("malformed HLS path".to_string()))?;

    let path = state.hls.resolve_segment(session_id, segment).await?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| CoreError::NotFound(format!("segment {segment} not found")))?;

    let content_type = if segment.ends_with(".ts") { "video/mp2t" } else { "application/octet-stream" };
    Ok(Response::builder()
        .header("Content-Type", content_type)
        .header("Cache-Control", "no-store")
        .body(Body::from(bytes))
        .unwrap())
}

#[derive(Debug, Deserialize)]
struct PlaylistQuery {
    #[serde(default = "default_kind")]
    kind: String,
    backend: Option<String>,
    codec: Option<String>,
    bitrate: Option<u32>,
    #[serde(default)]
    surround: bool,
}

fn default_kind() -> String {
    "plain".to_string()
}

async fn global_playlist_handler(
    Query(query): Query<PlaylistQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    match global_playlist_inner(&state, &query, &headers) {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

fn global_playlist_inner(state: &Arc<AppState>, query: &PlaylistQuery, headers: &HeaderMap) -> CoreResult<Response> {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let kind = match query.kind.as_str() {
        "plain" => PlaylistKind::Plain,
        "transcode" => PlaylistKind::Transcode,
        "hls" => PlaylistKind::Hls,
        other => return Err(CoreError::BadParams(format!("unknown playlist kind {other}"))),
    };

    let fingerprint = if matches!(kind, PlaylistKind::Plain) {
        None
    } else {
        let backend = query
            .backend
            .as_deref()
            .and_then(Backend::parse)
            .ok_or_else(|| CoreError::BadParams("missing or unknown backend".to_string()))?;
        let codec = query
            .codec
            .as_deref()
            .and_then(Codec::parse)
            .ok_or_else(|| CoreError::BadParams("missing or unknown codec".to_string()))?;
        Some(Fingerprint {
            channel: String::new(),
            backend,
            codec,
            surround: query.surround,
            bitrate_kbps: query.bitrate,
        })
    };

    let m3u = hls::global_playlist(host, state.catalog.all(), kind, fingerprint.as_ref())?;
    Ok(Response::builder()
        .header("Content-Type", "application/vnd.apple.mpegurl")
        .body(Body::from(m3u))
        .unwrap())
}

async fn guide_xml_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.epg.all_programs().await {
        Ok(programs) => Response::builder()
            .header("Content-Type", "application/xml")
            .body(Body::from(xmltv::render_xmltv(state.catalog.all(), &programs)))
            .unwrap(),
        Err(e) => {
            warn!(error = %e, "guide.xml: EPG store read failed");
            CoreError::Internal(anyhow::anyhow!(e)).into_response()
        }
    }
}

async fn guide_json_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.epg.all_programs().await {
        Ok(programs) => Json(programs).into_response(),
        Err(e) => {
            warn!(error = %e, "guide.json: EPG store read failed");
            CoreError::Internal(anyhow::anyhow!(e)).into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = metrics::gather(&state.pool, &state.hls).await;
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        body,
    )
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_encode_segment_shape() {
        let segments = vec!["qsv", "hevc", "b4000", "ac6", "5.1"];
        let params = parse_encode_segments(&segments).unwrap();
        assert_eq!(params.backend, Backend::Qsv);
        assert_eq!(params.codec, Codec::Hevc);
        assert_eq!(params.bitrate_kbps, Some(4000));
        assert!(params.surround);
        assert_eq!(params.channel, "5.1");
    }

    #[test]
    fn parses_minimal_encode_segment_shape() {
        let segments = vec!["software", "h264", "5.1"];
        let params = parse_encode_segments(&segments).unwrap();
        assert_eq!(params.bitrate_kbps, None);
        assert!(!params.surround);
        assert_eq!(params.channel, "5.1");
    }

    #[test]
    fn rejects_unknown_backend() {
        let segments = vec!["potato", "h264", "5.1"];
        assert!(matches!(parse_encode_segments(&segments), Err(CoreError::BadParams(_))));
    }

    #[test]
    fn rejects_missing_channel() {
        let segments = vec!["software", "h264"];
        assert!(matches!(parse_encode_segments(&segments), Err(CoreError::BadParams(_))));
    }
}
