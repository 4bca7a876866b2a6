//! External process supervisor: spawn a child with managed stdio, terminate
//! it with a SIGTERM/SIGKILL grace sequence, and reap it so it never lingers
//! as a zombie.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How a child's stdio stream should be wired.
#[derive(Debug, Clone)]
pub enum StdioKind {
    Inherit,
    Pipe,
    Null,
    /// Redirect to/from an existing file path (used for HLS segment output
    /// and for feeding a capture's stdout into an encoder's stdin via a
    /// named pipe on platforms where an in-process pipe isn't wired up).
    File(PathBuf),
}

impl StdioKind {
    fn into_stdio(self) -> std::io::Result<Stdio> {
        Ok(match self {
            StdioKind::Inherit => Stdio::inherit(),
            StdioKind::Pipe => Stdio::piped(),
            StdioKind::Null => Stdio::null(),
            StdioKind::File(path) => Stdio::from(std::fs::File::open(path)?),
        })
    }
}

/// A supervised child process. Holds the `tokio::process::Child` plus enough
/// metadata to log and terminate it meaningfully.
pub struct ChildHandle {
    pub label: String,
    pub pid: Option<u32>,
    child: Child,
}

impl ChildHandle {
    pub fn stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stdin(&mut self) -> Option<tokio::process::ChildStdin> {
        self.child.stdin.take()
    }

    pub fn stderr(&mut self) -> Option<tokio::process::ChildStderr> {
        self.child.stderr.take()
    }

    /// Non-blocking liveness probe. `Ok(None)` means still running.
    pub fn poll(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// Spawn `program` with `args`, wiring the requested stdio kinds. The child
/// carries `kill_on_drop(true)` as a backstop in case the handle is dropped
/// without an explicit `terminate` call, but callers that care about a grace
/// period must call `terminate` themselves.
pub fn spawn(
    label: &str,
    program: &str,
    args: &[String],
    stdin: StdioKind,
    stdout: StdioKind,
    stderr: StdioKind,
) -> std::io::Result<ChildHandle> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(stdin.into_stdio()?)
        .stdout(stdout.into_stdio()?)
        .stderr(stderr.into_stdio()?)
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    let pid = child.id();
    debug!(label, program, pid, "spawned child process");

    Ok(ChildHandle {
        label: label.to_string(),
        pid,
        child,
    })
}

/// Terminate a child: SIGTERM, poll for exit up to `grace`, then SIGKILL and
/// block for the final reap. Mirrors the capture/encoder teardown sequence
/// used throughout the tuner and pipeline layers so no child is ever left a
/// zombie or orphaned.
pub async fn terminate(handle: &mut ChildHandle, grace: Duration) {
    let Some(pid) = handle.pid else {
        let _ = handle.child.kill().await;
        return;
    };

    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match handle.poll() {
            Ok(Some(status)) => {
                debug!(label = %handle.label, pid, ?status, "child exited after SIGTERM");
                return;
            }
            Ok(None) => {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                warn!(label = %handle.label, pid, error = %e, "error polling child during terminate");
                break;
            }
        }
    }

    warn!(label = %handle.label, pid, "child did not exit within grace period, sending SIGKILL");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    match handle.wait().await {
        Ok(status) => debug!(label = %handle.label, pid, ?status, "child reaped after SIGKILL"),
        Err(e) => warn!(label = %handle.label, pid, error = %e, "wait() failed after SIGKILL"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_wait_exits_cleanly() {
        let mut handle = spawn(
            "test-true",
            "true",
            &[],
            StdioKind::Null,
            StdioKind::Null,
            StdioKind::Null,
        )
        .expect("spawn true(1)");
        let status = handle.wait().await.expect("wait");
        assert!(status.success());
    }

    #[tokio::test]
    async fn terminate_reaps_a_long_running_child() {
        let mut handle = spawn(
            "test-sleep",
            "sleep",
            &["30".to_string()],
            StdioKind::Null,
            StdioKind::Null,
            StdioKind::Null,
        )
        .expect("spawn sleep 30");

        terminate(&mut handle, Duration::from_millis(300)).await;
        let status = handle.poll().expect("poll after terminate");
        assert!(status.is_some(), "child should have been reaped");
    }
}
