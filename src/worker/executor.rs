use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of one execution attempt.
///
/// Failures here are data, not errors: they are recorded on the job and
/// funneled through the retry policy, never surfaced to the CLI.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Child exit code; -1 for timeout, signal termination, or spawn failure.
    pub exit_code: i32,
    /// None on success, otherwise "nonzero_exit", "timeout", "signal", or a
    /// spawn error message.
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// Runs a job's command line in a shell and captures its output.
///
/// Commands are executed as-is via `sh -c` without sandboxing or quoting
/// rewrites; job authors trust the host.
#[derive(Debug, Clone)]
pub struct Executor {
    timeout: Duration,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl Executor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute `command` and wait up to the configured timeout. On timeout
    /// the child's whole process group is killed and whatever output was
    /// captured so far is returned.
    pub async fn execute(&self, job_id: &str, command: &str) -> ExecutionResult {
        tracing::info!(job_id = %job_id, command, "executing job");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so a timeout kill reaches the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "failed to spawn job command");
                return ExecutionResult {
                    exit_code: -1,
                    error: Some(e.to_string()),
                    stdout: String::new(),
                    stderr: e.to_string(),
                };
            }
        };
        let pid = child.id();

        // Drain both pipes concurrently with the wait, so output is not
        // lost when the child is killed on timeout.
        let stdout_task = child.stdout.take().map(|pipe| tokio::spawn(read_all(pipe)));
        let stderr_task = child.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => {
                let stdout = collect(stdout_task).await;
                let stderr = collect(stderr_task).await;
                let (exit_code, error) = match status.code() {
                    Some(0) => (0, None),
                    Some(code) => (code, Some("nonzero_exit".to_string())),
                    None => (-1, Some("signal".to_string())),
                };
                tracing::info!(job_id = %job_id, exit_code, "job command finished");
                ExecutionResult {
                    exit_code,
                    error,
                    stdout,
                    stderr,
                }
            }
            Ok(Err(e)) => {
                tracing::error!(job_id = %job_id, error = %e, "failed waiting on job command");
                ExecutionResult {
                    exit_code: -1,
                    error: Some(e.to_string()),
                    stdout: collect(stdout_task).await,
                    stderr: collect(stderr_task).await,
                }
            }
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    timeout_secs = self.timeout.as_secs(),
                    "job command timed out, killing process group"
                );
                kill_group(&mut child, pid);
                let _ = child.wait().await;
                ExecutionResult {
                    exit_code: -1,
                    error: Some("timeout".to_string()),
                    stdout: collect(stdout_task).await,
                    stderr: collect(stderr_task).await,
                }
            }
        }
    }
}

async fn read_all<R: AsyncReadExt + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn kill_group(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // Negative pid addresses the process group set at spawn.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}
