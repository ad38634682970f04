//! Execution guard — runs validated scripts as bounded child processes.
//!
//! The script is written to a collision-free path, launched with an emptied
//! environment (only the provided grant URLs and parameters), and bounded by
//! one cancellation token fed by several sources:
//!
//! - a portable deadline timer (always present),
//! - the gateway's shutdown token (external cancellation),
//! - on unix, a second-layer watchdog that SIGKILLs the whole process group
//!   if the child has not been reaped shortly after cancellation, in case
//!   the process-level kill fails to take the child (or its children) down.
//!
//! On non-unix platforms only the portable layer exists; the group-kill
//! guarantee is reduced to plain child termination there.
//!
//! stdout/stderr are captured up to a configured bound; overflow is
//! truncated and flagged, never silently dropped. The script artifact is
//! removed on every exit path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;

/// Grace between the deadline firing and the group SIGKILL.
#[cfg(unix)]
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    /// Constructed by the gateway when generation attempts are exhausted;
    /// the guard itself never runs unvalidated code.
    ValidationFailed,
    Timeout,
    RuntimeError,
}

/// Terminal, immutable outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionOutcome {
    /// Outcome for a job that never reached execution.
    pub fn validation_failed() -> Self {
        Self {
            status: ExecutionStatus::ValidationFailed,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration: Duration::ZERO,
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }
}

pub struct ExecutionGuard {
    interpreter: String,
    work_dir: PathBuf,
    max_output_bytes: usize,
}

impl ExecutionGuard {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            work_dir: config.work_dir.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    /// Runs `code` as a child process with exactly the given environment.
    ///
    /// `env` must contain only grant URLs and non-sensitive parameters —
    /// the child starts from an emptied environment, so nothing from the
    /// gateway process (API keys, storage secrets) leaks through.
    pub async fn run(
        &self,
        code: &str,
        env: &HashMap<String, String>,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| format!("creating work dir {}", self.work_dir.display()))?;
        let script_path = self.work_dir.join(format!("job-{}.py", Uuid::new_v4()));
        tokio::fs::write(&script_path, code)
            .await
            .with_context(|| format!("writing script {}", script_path.display()))?;
        debug!("Script written to {}", script_path.display());

        let result = self.run_script(&script_path, env, timeout, shutdown).await;

        // Cleanup on every exit path, including guard errors
        if let Err(e) = tokio::fs::remove_file(&script_path).await {
            warn!(
                "Failed to remove script artifact {}: {e}",
                script_path.display()
            );
        }
        result
    }

    async fn run_script(
        &self,
        script_path: &Path,
        env: &HashMap<String, String>,
        timeout: Duration,
        shutdown: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(script_path)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", self.interpreter))?;

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;
        let max = self.max_output_bytes;
        let stdout_task = tokio::spawn(read_capped(stdout, max));
        let stderr_task = tokio::spawn(read_capped(stderr, max));

        // Deadline token: child of the shutdown token (external cancellation
        // propagates), also cancelled by the portable timer below.
        let deadline = shutdown.child_token();
        let timer = {
            let deadline = deadline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            })
        };

        // Reaped marker: stands the watchdog down once the child is gone
        let reaped = CancellationToken::new();
        #[cfg(unix)]
        spawn_group_watchdog(deadline.clone(), reaped.clone(), child.id());

        let exit_status = tokio::select! {
            status = child.wait() => Some(status.context("waiting for child")?),
            _ = deadline.cancelled() => None,
        };

        let timed_out = exit_status.is_none();
        if timed_out {
            warn!(
                "Execution exceeded {}s (or was cancelled), killing process",
                timeout.as_secs()
            );
            if let Err(e) = child.kill().await {
                warn!("Failed to kill child process: {e}");
            }
        }

        // Drain the pipes before standing the watchdog down: on timeout,
        // processes the script spawned may still hold them open, and only
        // the group kill releases them.
        let (stdout, stdout_truncated) =
            stdout_task.await.context("stdout reader panicked")??;
        let (stderr, stderr_truncated) =
            stderr_task.await.context("stderr reader panicked")??;
        reaped.cancel();
        timer.abort();
        let duration = start.elapsed();

        let (status, exit_code) = match exit_status {
            None => (ExecutionStatus::Timeout, None),
            Some(s) if s.success() => (ExecutionStatus::Success, Some(0)),
            Some(s) => (ExecutionStatus::RuntimeError, s.code()),
        };

        info!(
            "Execution finished: status={status:?}, exit_code={exit_code:?}, duration={}ms",
            duration.as_millis()
        );
        Ok(ExecutionOutcome {
            status,
            stdout,
            stderr,
            exit_code,
            duration,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

/// Second-layer watchdog: once the deadline fires, give the process-level
/// kill a short grace, then SIGKILL the whole process group so children
/// spawned by the script do not survive either.
#[cfg(unix)]
fn spawn_group_watchdog(deadline: CancellationToken, reaped: CancellationToken, pid: Option<u32>) {
    let Some(pid) = pid else { return };
    tokio::spawn(async move {
        tokio::select! {
            _ = reaped.cancelled() => {}
            _ = deadline.cancelled() => {
                tokio::select! {
                    _ = reaped.cancelled() => {}
                    _ = tokio::time::sleep(KILL_GRACE) => {
                        warn!("Watchdog firing: SIGKILL to process group {pid}");
                        unsafe {
                            libc::kill(-(pid as i32), libc::SIGKILL);
                        }
                    }
                }
            }
        }
    });
}

/// Reads at most `max` bytes, then drains the rest so the child never
/// blocks on a full pipe. Returns the captured text and a truncation flag.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    max: usize,
) -> std::io::Result<(String, bool)> {
    let mut buf = Vec::with_capacity(1024.min(max + 1));
    (&mut reader).take(max as u64 + 1).read_to_end(&mut buf).await?;
    let truncated = buf.len() > max;
    if truncated {
        buf.truncate(max);
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    }
    Ok((String::from_utf8_lossy(&buf).into_owned(), truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn guard(dir: &TempDir, max_output_bytes: usize) -> ExecutionGuard {
        // Scripts under test are shell, not Python: the guard does not
        // care what the interpreter is, only how the process behaves.
        ExecutionGuard::new(&ExecutionConfig {
            interpreter: "/bin/sh".to_string(),
            timeout_secs: 300,
            work_dir: dir.path().to_path_buf(),
            max_output_bytes,
        })
    }

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    fn work_dir_file_count(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn test_success_captures_output() {
        let dir = TempDir::new().unwrap();
        let outcome = guard(&dir, 64 * 1024)
            .run(
                "echo out\necho err >&2\n",
                &no_env(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.stdout_truncated);
        // Artifact cleaned up
        assert_eq!(work_dir_file_count(&dir), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_runtime_error() {
        let dir = TempDir::new().unwrap();
        let outcome = guard(&dir, 64 * 1024)
            .run(
                "echo boom >&2\nexit 3\n",
                &no_env(),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::RuntimeError);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stderr, "boom\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();
        let outcome = guard(&dir, 64 * 1024)
            .run(
                "echo partial\nsleep 30\n",
                &no_env(),
                Duration::from_millis(300),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert_eq!(outcome.exit_code, None);
        // Partial stdout preserved
        assert_eq!(outcome.stdout, "partial\n");
        // Process killed, not waited out
        assert!(started.elapsed() < Duration::from_secs(10));
        // Artifact cleaned up even on timeout
        assert_eq!(work_dir_file_count(&dir), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_spawned_children_too() {
        let dir = TempDir::new().unwrap();
        let started = Instant::now();
        // The background sleep inherits the pipes and survives the kill of
        // the direct child; only the group watchdog takes it down. Were it
        // left running, draining stdout would block for its full 30s.
        let outcome = guard(&dir, 64 * 1024)
            .run(
                "sleep 30 &\nwait\n",
                &no_env(),
                Duration::from_millis(300),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        // Deadline (0.3s) plus KILL_GRACE (2s) plus margin, nowhere near
        // the background child's 30s
        assert!(
            started.elapsed() < Duration::from_secs(15),
            "process group outlived the watchdog: {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn test_shutdown_token_cancels_execution() {
        let dir = TempDir::new().unwrap();
        let shutdown = CancellationToken::new();
        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                shutdown.cancel();
            })
        };
        let outcome = guard(&dir, 64 * 1024)
            .run(
                "sleep 30\n",
                &no_env(),
                Duration::from_secs(60),
                &shutdown,
            )
            .await
            .unwrap();
        canceller.await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_output_truncation_is_flagged() {
        let dir = TempDir::new().unwrap();
        let script = "i=0\nwhile [ $i -lt 100 ]; do printf '0123456789'; i=$((i+1)); done\n";
        let outcome = guard(&dir, 100)
            .run(script, &no_env(), Duration::from_secs(10), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert!(outcome.stdout_truncated);
        assert_eq!(outcome.stdout.len(), 100);
        assert!(!outcome.stderr_truncated);
    }

    #[tokio::test]
    async fn test_child_env_is_exactly_what_was_passed() {
        let dir = TempDir::new().unwrap();
        let env = HashMap::from([("GUARD_TEST_VAR".to_string(), "hello".to_string())]);
        let outcome = guard(&dir, 64 * 1024)
            .run(
                "printf '%s|%s' \"$GUARD_TEST_VAR\" \"$HOME\"\n",
                &env,
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // Only the provided variable is visible; the parent env (HOME,
        // secrets, …) never reaches the child
        assert_eq!(outcome.stdout, "hello|");
    }

    #[tokio::test]
    async fn test_concurrent_runs_do_not_clobber() {
        let dir = TempDir::new().unwrap();
        let guard = std::sync::Arc::new(guard(&dir, 64 * 1024));
        let mut handles = Vec::new();
        for i in 0..4 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .run(
                        &format!("echo job-{i}\n"),
                        &HashMap::new(),
                        Duration::from_secs(10),
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert_eq!(outcome.status, ExecutionStatus::Success);
            seen.push(outcome.stdout.trim().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["job-0", "job-1", "job-2", "job-3"]);
    }

    #[test]
    fn test_validation_failed_outcome_shape() {
        let outcome = ExecutionOutcome::validation_failed();
        assert_eq!(outcome.status, ExecutionStatus::ValidationFailed);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.stdout.is_empty());
    }
}
