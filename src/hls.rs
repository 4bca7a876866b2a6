//! HLS session manager: dedups concurrent requests for the same
//! channel/encode settings onto one running session, rewrites the playlist
//! so segment URIs route back through the server, and garbage-collects
//! sessions that go idle or whose child processes die.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::pipeline::{CaptureSpec, Pipeline};
use crate::transcode_args::{Backend, Codec, OutputKind, TranscodeParams};
use crate::tuner::{TunerPool, UserClass};

const MAX_SESSIONS: usize = 32;
const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const PLAYLIST_POLL_ATTEMPTS: u32 = 20;
const PLAYLIST_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Identifies an HLS session by the exact settings that produce its output.
/// Two requests with an identical fingerprint share one running pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub channel: String,
    pub backend: Backend,
    pub codec: Codec,
    pub surround: bool,
    pub bitrate_kbps: Option<u32>,
}

impl Fingerprint {
    /// Render the `/backend/codec[/bXXX][/ac6]` URL path segment used by
    /// the global playlist, so each distinct fingerprint maps to a stable
    /// URL a player can poll.
    pub fn url_params(&self) -> String {
        let backend = match self.backend {
            Backend::Software => "software",
            Backend::Qsv => "qsv",
            Backend::Nvenc => "nvenc",
            Backend::Vaapi => "vaapi",
        };
        let codec = match self.codec {
            Codec::H264 => "h264",
            Codec::Hevc => "hevc",
            Codec::Av1 => "av1",
        };
        let mut params = format!("/{backend}/{codec}");
        if let Some(kbps) = self.bitrate_kbps {
            params.push_str(&format!("/b{kbps}"));
        }
        if self.surround {
            params.push_str("/ac6");
        }
        params
    }
}

struct Session {
    id: String,
    fingerprint: Fingerprint,
    dir: PathBuf,
    pipeline: Mutex<Option<Pipeline>>,
    last_access: AtomicU64,
}

impl Session {
    fn playlist_path(&self) -> PathBuf {
        self.dir.join("index.m3u8")
    }

    fn touch(&self) {
        self.last_access.store(now_epoch_secs(), Ordering::Relaxed);
    }

    fn idle_for(&self, now: u64) -> Duration {
        Duration::from_secs(now.saturating_sub(self.last_access.load(Ordering::Relaxed)))
    }
}

pub struct HlsManager {
    root: PathBuf,
    pool: Arc<TunerPool>,
    capture_program: String,
    channels_conf_path: PathBuf,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl HlsManager {
    pub fn new(
        root: PathBuf,
        pool: Arc<TunerPool>,
        capture_program: String,
        channels_conf_path: PathBuf,
    ) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&root)?;
        clean_hls_dir(&root);
        Ok(Arc::new(Self {
            root,
            pool,
            capture_program,
            channels_conf_path,
            sessions: Mutex::new(HashMap::new()),
        }))
    }

    /// Count of currently active sessions, for metrics reporting.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    fn capture_spec_for(&self, channel_number: &str) -> CaptureSpec {
        CaptureSpec::for_channel(self.capture_program.clone(), &self.channels_conf_path, channel_number)
    }

    /// Resolve (creating if needed) the session for `fingerprint`, ensure
    /// its pipeline is running, wait briefly for the playlist file to
    /// appear, rewrite it so segment lines point back through this server,
    /// and return the rewritten text.
    pub async fn resolve_playlist(self: &Arc<Self>, fingerprint: Fingerprint) -> CoreResult<String> {
        let session = self.find_or_create_session(fingerprint).await?;
        self.ensure_running(&session).await?;
        session.touch();

        let playlist_path = session.playlist_path();
        for _ in 0..PLAYLIST_POLL_ATTEMPTS {
            if playlist_path.exists() {
                break;
            }
            tokio::time::sleep(PLAYLIST_POLL_INTERVAL).await;
        }

        let raw = tokio::fs::read_to_string(&playlist_path)
            .await
            .map_err(|_| CoreError::Retry)?;

        Ok(rewrite_playlist(&raw, &session.id))
    }

    /// Resolve a segment file within `session_id`, rejecting any path
    /// component escaping the session directory, and touch the session's
    /// last-access time so housekeeping doesn't reap it mid-playback.
    pub async fn resolve_segment(&self, session_id: &str, segment_file: &str) -> CoreResult<PathBuf> {
        if !is_safe_path_component(session_id) || !is_safe_path_component(segment_file) {
            return Err(CoreError::Forbidden);
        }

        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("unknown HLS session {session_id}")))?;
        session.touch();

        Ok(self.root.join(session_id).join(segment_file))
    }

    async fn find_or_create_session(self: &Arc<Self>, fingerprint: Fingerprint) -> CoreResult<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.values().find(|s| s.fingerprint == fingerprint) {
            existing.touch();
            return Ok(existing.clone());
        }

        if sessions.len() >= MAX_SESSIONS {
            return Err(CoreError::Retry);
        }

        let id = format!("{:x}_{}", now_epoch_secs(), sessions.len());
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("create session dir: {e}")))?;

        let session = Arc::new(Session {
            id: id.clone(),
            fingerprint,
            dir,
            pipeline: Mutex::new(None),
            last_access: AtomicU64::new(now_epoch_secs()),
        });
        sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn ensure_running(self: &Arc<Self>, session: &Arc<Session>) -> CoreResult<()> {
        let mut pipeline_guard = session.pipeline.lock().await;
        if pipeline_guard.is_some() {
            return Ok(());
        }

        info!(session = %session.id, channel = %session.fingerprint.channel, "starting HLS session");
        let transcode = TranscodeParams {
            backend: session.fingerprint.backend,
            codec: session.fingerprint.codec,
            surround: session.fingerprint.surround,
            bitrate_kbps: session.fingerprint.bitrate_kbps,
            output: OutputKind::Hls {
                dir: session.dir.clone(),
                playlist: session.playlist_path(),
            },
        };

        let capture_spec = self.capture_spec_for(&session.fingerprint.channel);
        let pipeline = Pipeline::start(self.pool.clone(), UserClass::Stream, capture_spec, transcode).await?;

        *pipeline_guard = Some(pipeline);
        Ok(())
    }

    /// Background GC: sweep every `interval`, tearing down sessions whose
    /// children have died or that have been idle past the timeout.
    pub async fn run_housekeeping(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.housekeep_once().await;
        }
    }

    async fn housekeep_once(&self) {
        let now = now_epoch_secs();
        let mut dead = Vec::new();

        {
            let mut sessions = self.sessions.lock().await;
            for (id, session) in sessions.iter() {
                let alive = {
                    let mut pipeline_guard = session.pipeline.lock().await;
                    match pipeline_guard.as_mut() {
                        Some(pipeline) => pipeline.poll_alive(),
                        None => true,
                    }
                };

                let timed_out = session.idle_for(now) > SESSION_TIMEOUT;
                if !alive || timed_out {
                    if !alive {
                        warn!(session = %id, "HLS session child process died, cleaning up");
                    } else {
                        info!(session = %id, "HLS session timed out, cleaning up");
                    }
                    dead.push(id.clone());
                }
            }
            for id in &dead {
                sessions.remove(id);
            }
        }

        for id in dead {
            let dir = self.root.join(&id);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(session = %id, error = %e, "failed to remove HLS session directory");
            }
        }
    }

    /// Tear down every session immediately, used on server shutdown.
    pub async fn shutdown(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            if let Some(pipeline) = session.pipeline.lock().await.take() {
                pipeline.shutdown(Duration::from_secs(2)).await;
            }
        }
    }
}

/// Which form of URL `global_playlist` should emit per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    Plain,
    Transcode,
    Hls,
}

/// Render an `#EXTM3U` catalog playlist over `channels` (spec §6
/// `global_playlist`). `params` selects the encode settings and is required
/// for `Transcode`/`Hls` kinds; `Plain` ignores it.
pub fn global_playlist(
    host: &str,
    channels: &[crate::channels::Channel],
    kind: PlaylistKind,
    params: Option<&Fingerprint>,
) -> CoreResult<String> {
    if !matches!(kind, PlaylistKind::Plain) && params.is_none() {
        return Err(CoreError::BadParams(
            "transcode/hls playlists require backend/codec params".to_string(),
        ));
    }

    let mut out = String::from("#EXTM3U\n");
    for channel in channels {
        out.push_str(&format!("#EXTINF:-1,{}\n", channel.name));
        let url = match kind {
            PlaylistKind::Plain => format!("http://{host}/stream/{}", channel.number),
            PlaylistKind::Transcode => {
                format!("http://{host}/transcode{}/{}", params.unwrap().url_params(), channel.number)
            }
            PlaylistKind::Hls => {
                format!("http://{host}/hls{}/{}/index.m3u8", params.unwrap().url_params(), channel.number)
            }
        };
        out.push_str(&url);
        out.push('\n');
    }
    Ok(out)
}

fn is_safe_path_component(s: &str) -> bool {
    !s.is_empty() && !s.contains("..") && !s.contains('/') && !s.contains('\\')
}

fn rewrite_playlist(raw: &str, session_id: &str) -> String {
    raw.lines()
        .map(|line| {
            if line.ends_with(".ts") || line.ends_with(".m4s") {
                format!("/hls/{session_id}/{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

fn clean_hls_dir(root: &Path) {
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.path().is_dir() {
            let _ = std::fs::remove_dir_all(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_playlist_prefixes_segment_lines_only() {
        let raw = "#EXTM3U\n#EXT-X-VERSION:3\nseg_00000.ts\n#EXT-X-ENDLIST\n";
        let rewritten = rewrite_playlist(raw, "abc_0");
        assert!(rewritten.contains("/hls/abc_0/seg_00000.ts"));
        assert!(rewritten.contains("#EXT-X-VERSION:3"));
        assert!(!rewritten.contains("\nseg_00000.ts\n"));
    }

    #[test]
    fn path_safety_rejects_traversal_and_separators() {
        assert!(!is_safe_path_component(".."));
        assert!(!is_safe_path_component("a/../b"));
        assert!(!is_safe_path_component("a/b"));
        assert!(is_safe_path_component("seg_00001.ts"));
    }

    #[test]
    fn fingerprint_url_params_render_optional_segments() {
        let fp = Fingerprint {
            channel: "5.1".into(),
            backend: Backend::Qsv,
            codec: Codec::Hevc,
            surround: true,
            bitrate_kbps: Some(4000),
        };
        assert_eq!(fp.url_params(), "/qsv/hevc/b4000/ac6");
    }

    fn sample_channels() -> Vec<crate::channels::Channel> {
        vec![
            crate::channels::Channel {
                number: "5.1".into(),
                name: "WABC HD".into(),
                frequency: "563000000".into(),
                service_id: "1".into(),
            },
            crate::channels::Channel {
                number: "7.1".into(),
                name: "WABC2".into(),
                frequency: "563000000".into(),
                service_id: "2".into(),
            },
        ]
    }

    #[test]
    fn plain_playlist_points_at_stream_route() {
        let m3u = global_playlist("host:8080", &sample_channels(), PlaylistKind::Plain, None).unwrap();
        assert!(m3u.starts_with("#EXTM3U\n"));
        assert!(m3u.contains("http://host:8080/stream/5.1"));
        assert!(m3u.contains("http://host:8080/stream/7.1"));
    }

    #[test]
    fn hls_playlist_requires_params() {
        let err = global_playlist("host:8080", &sample_channels(), PlaylistKind::Hls, None).unwrap_err();
        assert!(matches!(err, CoreError::BadParams(_)));
    }

    #[tokio::test]
    async fn find_or_create_session_dedups_by_fingerprint() {
        let tmp_root = std::env::temp_dir().join(format!("zaplink-hls-test-{}", std::process::id()));
        let pool = TunerPool::new(vec![]);
        let manager = HlsManager::new(tmp_root.clone(), pool, "true".to_string(), "/dev/null".into()).unwrap();

        let fp = Fingerprint {
            channel: "5.1".into(),
            backend: Backend::Software,
            codec: Codec::H264,
            surround: false,
            bitrate_kbps: None,
        };

        let a = manager.find_or_create_session(fp.clone()).await.unwrap();
        let b = manager.find_or_create_session(fp).await.unwrap();
        assert_eq!(a.id, b.id, "identical fingerprints must share one session");
        assert_eq!(manager.session_count().await, 1);

        let _ = std::fs::remove_dir_all(&tmp_root);
    }

    #[test]
    fn hls_playlist_embeds_fingerprint_params() {
        let fp = Fingerprint {
            channel: String::new(),
            backend: Backend::Software,
            codec: Codec::H264,
            surround: false,
            bitrate_kbps: None,
        };
        let m3u = global_playlist("host:8080", &sample_channels(), PlaylistKind::Hls, Some(&fp)).unwrap();
        assert!(m3u.contains("http://host:8080/hls/software/h264/5.1/index.m3u8"));
    }
}
