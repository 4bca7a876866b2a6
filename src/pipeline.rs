//! Pipeline runner: wires a tuner lease to a two-stage capture⇒encode child
//! process chain and relays bytes to callers. Generalizes the single-ffmpeg
//! invocation the teacher's transcoder used into the capture+encoder pair
//! the original system actually runs (a zapper feeding ffmpeg over a pipe).

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::process::{spawn, terminate, ChildHandle, StdioKind};
use crate::transcode_args::{build_ffmpeg_args, OutputKind, TranscodeParams};
use crate::tuner::{TunerLease, TunerPool, UserClass};

/// How to invoke the capture program (`dvbv5-zap` in production, a stub
/// shell script in tests) for a given tuner adapter id.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    pub program: String,
    pub args_template: Vec<String>,
}

impl CaptureSpec {
    /// Render args for `adapter_id`, substituting the literal token
    /// `{adapter}` wherever it appears in the template.
    fn render(&self, adapter_id: u32) -> Vec<String> {
        self.args_template
            .iter()
            .map(|a| a.replace("{adapter}", &adapter_id.to_string()))
            .collect()
    }

    /// `<capture> -c <channels_conf> -P -a <adapter_id> -o - <channel_number>`
    /// per spec §6's external command-line contract. One manager serves every
    /// channel's sessions, so the channel number is baked directly into the
    /// argv rather than templated like the adapter id.
    pub fn for_channel(program: String, channels_conf_path: &std::path::Path, channel_number: &str) -> Self {
        Self {
            program,
            args_template: vec![
                "-c".to_string(),
                channels_conf_path.to_string_lossy().to_string(),
                "-P".to_string(),
                "-a".to_string(),
                "{adapter}".to_string(),
                "-o".to_string(),
                "-".to_string(),
                channel_number.to_string(),
            ],
        }
    }
}

const RELAY_CHUNK: usize = 64 * 1024;
const BROADCAST_CAPACITY: usize = 8192;
const ACQUIRE_RETRIES: u32 = 5;
const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Retry a STREAM tuner acquisition up to `ACQUIRE_RETRIES` times, spaced
/// `ACQUIRE_RETRY_INTERVAL` apart, before surfacing `NoTuner` — a pool that's
/// transiently saturated by another streaming client or an EPG scan still
/// holding a slot often frees one within a second.
async fn acquire_with_retries(pool: &Arc<TunerPool>, user_class: UserClass) -> CoreResult<TunerLease> {
    for attempt in 0..ACQUIRE_RETRIES {
        match pool.acquire(user_class).await {
            Ok(lease) => return Ok(lease),
            Err(_) if attempt + 1 < ACQUIRE_RETRIES => {
                tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns on its last iteration")
}

/// A live capture⇒encode pipeline holding the tuner lease and both child
/// handles. Dropping it tears everything down: relay task stops when the
/// children's pipes close, and `Drop` best-effort terminates any children
/// still alive plus releases the lease. Callers that can await should
/// prefer [`Pipeline::shutdown`] for a clean, logged teardown.
pub struct Pipeline {
    lease: Option<TunerLease>,
    capture: Option<ChildHandle>,
    encode: Option<ChildHandle>,
    relay_task: Option<JoinHandle<()>>,
    output_tx: Option<broadcast::Sender<Bytes>>,
}

impl Pipeline {
    /// Acquire a tuner, spawn capture and encoder, and (for `OutputKind::Pipe`)
    /// start relaying the encoder's stdout into an internal broadcast
    /// channel. For `OutputKind::Hls`, the encoder writes segments directly
    /// to disk and no output channel is created.
    pub async fn start(
        pool: Arc<TunerPool>,
        user_class: UserClass,
        capture_spec: CaptureSpec,
        transcode: TranscodeParams,
    ) -> CoreResult<Self> {
        let lease = acquire_with_retries(&pool, user_class).await?;
        let adapter_id = lease.tuner_id().0;

        let capture_args = capture_spec.render(adapter_id);
        let mut capture = spawn(
            "capture",
            &capture_spec.program,
            &capture_args,
            StdioKind::Null,
            StdioKind::Pipe,
            StdioKind::Pipe,
        )
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("spawn capture: {e}")))?;

        let wants_output_pipe = matches!(transcode.output, OutputKind::Pipe);
        let encoder_argv = build_ffmpeg_args(&transcode);

        let mut encode = spawn(
            "encode",
            "ffmpeg",
            &encoder_argv,
            StdioKind::Pipe,
            if wants_output_pipe { StdioKind::Pipe } else { StdioKind::Null },
            StdioKind::Pipe,
        )
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("spawn encoder: {e}")))?;

        lease.record_children(capture.pid, encode.pid).await;

        let capture_stdout = capture.stdout().expect("capture stdout piped");
        let encoder_stdin = encode.stdin().expect("encoder stdin piped");
        spawn_relay_task(capture_stdout, encoder_stdin, "capture->encoder");
        spawn_stderr_drain(capture.stderr(), "capture");
        spawn_stderr_drain(encode.stderr(), "encode");

        let output_tx = if wants_output_pipe {
            let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
            let encoder_stdout = encode.stdout().expect("encoder stdout piped");
            spawn_broadcast_task(encoder_stdout, tx.clone());
            Some(tx)
        } else {
            None
        };

        Ok(Self {
            lease: Some(lease),
            capture: Some(capture),
            encode: Some(encode),
            relay_task: None,
            output_tx,
        })
    }

    /// Raw pass-through: capture only, no encode stage, for the `stream`
    /// operation's direct MPEG-TS relay (the spec's "0..2 child process
    /// handles" pipeline, with the encode half omitted).
    pub async fn start_passthrough(pool: Arc<TunerPool>, user_class: UserClass, capture_spec: CaptureSpec) -> CoreResult<Self> {
        let lease = acquire_with_retries(&pool, user_class).await?;
        let adapter_id = lease.tuner_id().0;

        let capture_args = capture_spec.render(adapter_id);
        let mut capture = spawn(
            "capture",
            &capture_spec.program,
            &capture_args,
            StdioKind::Null,
            StdioKind::Pipe,
            StdioKind::Pipe,
        )
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("spawn capture: {e}")))?;

        lease.record_children(capture.pid, None).await;

        spawn_stderr_drain(capture.stderr(), "capture");

        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        let capture_stdout = capture.stdout().expect("capture stdout piped");
        spawn_broadcast_task(capture_stdout, tx.clone());

        Ok(Self {
            lease: Some(lease),
            capture: Some(capture),
            encode: None,
            relay_task: None,
            output_tx: Some(tx),
        })
    }

    /// Subscribe to the encoder's (or, for a pass-through pipeline, the
    /// capture's) output stream. Only meaningful for pipelines started with
    /// `OutputKind::Pipe` or via `start_passthrough`.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<Bytes>> {
        self.output_tx.as_ref().map(|tx| tx.subscribe())
    }

    /// Non-blocking liveness check of both children. Returns `false` as
    /// soon as either has exited, mirroring the `waitpid(WNOHANG)` liveness
    /// poll the original housekeeping loop performed.
    pub fn poll_alive(&mut self) -> bool {
        let capture_alive = self
            .capture
            .as_mut()
            .map(|c| matches!(c.poll(), Ok(None)))
            .unwrap_or(true);
        let encode_alive = self
            .encode
            .as_mut()
            .map(|c| matches!(c.poll(), Ok(None)))
            .unwrap_or(true);
        capture_alive && encode_alive
    }

    /// Terminate both children (SIGTERM, grace, SIGKILL) and release the
    /// tuner lease.
    pub async fn shutdown(mut self, grace: Duration) {
        if let Some(task) = self.relay_task.take() {
            task.abort();
        }
        if let Some(mut encode) = self.encode.take() {
            terminate(&mut encode, grace).await;
        }
        if let Some(mut capture) = self.capture.take() {
            terminate(&mut capture, grace).await;
        }
        if let Some(lease) = self.lease.take() {
            lease.release_and_wait().await;
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(task) = self.relay_task.take() {
            task.abort();
        }
        // kill_on_drop(true) on both children handles the worst case; the
        // lease's own Drop spawns a detached release. Nothing further to do
        // synchronously here.
    }
}

fn spawn_relay_task(
    mut from: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    mut to: impl tokio::io::AsyncWrite + Unpin + Send + 'static,
    label: &'static str,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; RELAY_CHUNK];
        loop {
            match from.read(&mut buf).await {
                Ok(0) => {
                    debug!(label, "relay source closed");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = to.write_all(&buf[..n]).await {
                        warn!(label, error = %e, "relay sink write failed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(label, error = %e, "relay source read failed");
                    break;
                }
            }
        }
    });
}

fn spawn_broadcast_task(
    mut from: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: broadcast::Sender<Bytes>,
) {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(RELAY_CHUNK);
        buf.resize(RELAY_CHUNK, 0);
        loop {
            match from.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    // No receivers just means nobody's listening right now;
                    // that's normal between client connects.
                    let _ = tx.send(chunk);
                }
                Err(e) => {
                    error!(error = %e, "encoder stdout read failed");
                    break;
                }
            }
        }
    });
}

fn spawn_stderr_drain(stderr: Option<tokio::process::ChildStderr>, label: &'static str) {
    let Some(stderr) = stderr else { return };
    tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, BufReader};
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(label, "{}", line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuner::TunerDescriptor;
    use std::path::PathBuf;

    fn one_tuner_pool() -> Arc<TunerPool> {
        TunerPool::new(vec![TunerDescriptor {
            id: crate::tuner::TunerId(0),
            device_path: PathBuf::from("/dev/dvb/adapter0"),
        }])
    }

    #[tokio::test]
    async fn start_relays_bytes_from_capture_through_encoder() {
        let pool = one_tuner_pool();
        // `cat` as a stand-in capture program, `cat` again as a stand-in
        // encoder: both copy stdin to stdout verbatim, which is enough to
        // exercise the relay wiring without a real zapper/ffmpeg present.
        let capture = CaptureSpec {
            program: "cat".into(),
            args_template: vec![],
        };
        let transcode = TranscodeParams {
            backend: crate::transcode_args::Backend::Software,
            codec: crate::transcode_args::Codec::H264,
            surround: false,
            bitrate_kbps: None,
            output: OutputKind::Pipe,
        };

        // This exercises the spawn path; since neither `cat` reads DVB
        // input nor does the real ffmpeg binary need to exist in the test
        // sandbox, we only assert startup succeeds and a lease was taken.
        let result = Pipeline::start(pool.clone(), UserClass::Stream, capture, transcode).await;
        match result {
            Ok(pipeline) => {
                pipeline.shutdown(Duration::from_millis(200)).await;
            }
            Err(CoreError::Internal(_)) => {
                // ffmpeg binary not present in the sandbox; acceptable here,
                // the pool contention behavior is covered in tuner::pool.
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn passthrough_has_no_encode_stage_and_stays_alive() {
        let pool = one_tuner_pool();
        let capture = CaptureSpec {
            program: "cat".into(),
            args_template: vec![],
        };

        let mut pipeline = Pipeline::start_passthrough(pool, UserClass::Stream, capture)
            .await
            .unwrap();
        assert!(pipeline.encode.is_none());
        assert!(pipeline.subscribe().is_some());
        assert!(pipeline.poll_alive());
        pipeline.shutdown(Duration::from_millis(200)).await;
    }
}
