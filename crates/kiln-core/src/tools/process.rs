//! Supervised subprocess execution with a hard deadline.

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};

/// Bytes of stderr kept for error messages.
pub const STDERR_CAP: usize = 4 * 1024;

/// Why a single invocation did not succeed.
#[derive(Debug)]
pub enum RunFailure {
    /// The program does not exist.
    Missing,
    /// The deadline passed; the child was killed.
    TimedOut,
    /// Non-zero exit. Carries the truncated stderr.
    Exited { status: ExitStatus, stderr: String },
    /// Any other spawn or wait error.
    Io(io::Error),
}

/// Run `program args…` in `cwd`, killing it if it outlives `deadline`.
pub async fn run(
    program: &str,
    args: &[OsString],
    cwd: &Path,
    deadline: Duration,
) -> Result<(), RunFailure> {
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RunFailure::Missing,
            _ => RunFailure::Io(e),
        })?;

    let collector = child.stderr.take().map(|pipe| tokio::spawn(capture(pipe)));

    match tokio::time::timeout(deadline, child.wait()).await {
        Err(_) => {
            if let Err(e) = child.kill().await {
                tracing::warn!(program, error = %e, "failed to kill timed-out tool");
            }
            if let Some(handle) = collector {
                handle.abort();
            }
            Err(RunFailure::TimedOut)
        }
        Ok(Err(e)) => Err(RunFailure::Io(e)),
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => {
            let stderr = match collector {
                // A grandchild may still hold the pipe open; do not wait on it forever.
                Some(handle) => tokio::time::timeout(Duration::from_secs(1), handle)
                    .await
                    .ok()
                    .and_then(Result::ok)
                    .unwrap_or_default(),
                None => String::new(),
            };
            Err(RunFailure::Exited { status, stderr })
        }
    }
}

/// Drain `pipe` to EOF, keeping only the first [`STDERR_CAP`] bytes.
async fn capture(mut pipe: ChildStderr) -> String {
    let mut kept = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_CAP.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).trim().to_owned()
}

/// Run a version probe; any exit within `deadline` counts as present.
pub async fn probe(program: &str, args: &[&str], deadline: Duration) -> bool {
    let spawned = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(program, error = %e, "tool probe could not spawn");
            return false;
        }
    };
    match tokio::time::timeout(deadline, child.wait()).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::debug!(program, error = %e, "tool probe wait failed");
            false
        }
        Err(_) => {
            let _ = child.kill().await;
            tracing::debug!(program, "tool probe timed out");
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let res = run("/definitely/not/here", &[], dir.path(), Duration::from_secs(1)).await;
        assert!(matches!(res, Err(RunFailure::Missing)));
    }

    #[tokio::test]
    async fn stderr_is_captured_and_capped() {
        let dir = tempfile::tempdir().unwrap();
        let args: Vec<OsString> = vec![
            "-c".into(),
            "head -c 10000 /dev/zero | tr '\\0' x >&2; exit 3".into(),
        ];
        let res = run("sh", &args, dir.path(), Duration::from_secs(5)).await;
        match res {
            Err(RunFailure::Exited { status, stderr }) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr.len(), STDERR_CAP);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let args: Vec<OsString> = vec!["-c".into(), "exec sleep 10".into()];
        let started = Instant::now();
        let res = run("sh", &args, dir.path(), Duration::from_millis(200)).await;
        assert!(matches!(res, Err(RunFailure::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn probe_reports_presence() {
        assert!(probe("sh", &["-c", "exit 1"], Duration::from_secs(2)).await);
        assert!(!probe("/definitely/not/here", &["--version"], Duration::from_secs(2)).await);
    }
}
