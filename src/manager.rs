//! Worker manager lifecycle: spawn a pool of workers, publish liveness
//! through an on-disk PID file, and stop cooperatively through a shutdown
//! marker file.
//!
//! The PID file and shutdown marker live next to the database file and are
//! the ground truth for "is a manager running on this host?". The manager
//! itself is a detached child process of the CLI; workers are tokio tasks
//! inside it, which keeps `count` executions in flight without a process
//! per worker.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::{QueueError, Result};
use crate::store::Store;
use crate::worker::Worker;

pub const PID_FILE: &str = "worker_manager.pid";
pub const SHUTDOWN_FILE: &str = "worker_manager.shutdown";

/// How long workers get to finish their current job after a stop request.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// How often the manager polls for the shutdown marker.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(500);
/// How often expired leases are swept back to pending.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub active_workers: u32,
}

pub struct WorkerManager {
    db_path: PathBuf,
    data_dir: PathBuf,
    worker_count: u32,
}

impl WorkerManager {
    pub fn new(db_path: impl Into<PathBuf>, worker_count: u32) -> Self {
        let db_path = db_path.into();
        let data_dir = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path,
            data_dir,
            worker_count,
        }
    }

    /// Run the manager in the current process until a shutdown marker
    /// appears or a termination signal arrives. This is the body of the
    /// hidden `worker run` subcommand.
    pub async fn run(&self) -> Result<()> {
        if status(&self.data_dir).running {
            return Err(QueueError::AlreadyRunning);
        }
        let _ = fs::remove_file(self.data_dir.join(SHUTDOWN_FILE));
        write_pid_file(&self.data_dir, std::process::id(), self.worker_count)?;

        let token = CancellationToken::new();
        cancel_pool_on_signal(token.clone());
        let mut sweep_store = Store::open(&self.db_path)?;

        let mut workers = Vec::with_capacity(self.worker_count as usize);
        for i in 0..self.worker_count {
            let store = Store::open(&self.db_path)?;
            let id = format!("worker-{}-{}", std::process::id(), i + 1);
            workers.push(tokio::spawn(Worker::new(id, store, token.clone()).run()));
        }
        tracing::info!(count = self.worker_count, "worker manager started");

        let mut sweep_timer = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                // First tick fires immediately: leases orphaned by a
                // previous crash are recovered at startup.
                _ = sweep_timer.tick() => self.sweep(&mut sweep_store),
                _ = tokio::time::sleep(SUPERVISE_INTERVAL) => {
                    if self.data_dir.join(SHUTDOWN_FILE).exists() {
                        tracing::info!("shutdown marker found, stopping workers");
                        break;
                    }
                }
                _ = token.cancelled() => break,
            }
        }

        token.cancel();
        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        for mut handle in workers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!("worker did not drain within grace period, aborting");
                handle.abort();
            }
        }

        let _ = fs::remove_file(self.data_dir.join(PID_FILE));
        let _ = fs::remove_file(self.data_dir.join(SHUTDOWN_FILE));
        tracing::info!("worker manager stopped");
        Ok(())
    }

    fn sweep(&self, store: &mut Store) {
        let threshold = match (
            config::get_u64(store, "job_timeout"),
            config::get_u64(store, "lease_slack"),
        ) {
            (Ok(timeout), Ok(slack)) => timeout + slack,
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "lease sweep skipped, config unreadable");
                return;
            }
        };
        match store.release_expired_leases(Utc::now(), threshold) {
            Ok(0) => {}
            Ok(n) => tracing::warn!(count = n, "released expired job leases"),
            Err(e) => tracing::error!(error = %e, "lease sweep failed"),
        }
    }
}

/// Spawn a detached manager process. Used by `worker start`; fails with
/// `AlreadyRunning` when a live manager's PID file is present.
pub fn start_detached(db_path: &Path, count: u32) -> Result<()> {
    let data_dir = data_dir_of(db_path);
    if status(&data_dir).running {
        return Err(QueueError::AlreadyRunning);
    }
    let _ = fs::remove_file(data_dir.join(SHUTDOWN_FILE));

    let exe = std::env::current_exe()?;
    let count_arg = count.to_string();
    std::process::Command::new(exe)
        .args(["worker", "run", "--count", count_arg.as_str()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    // Wait for the child to publish its PID file.
    for _ in 0..50 {
        if status(&data_dir).running {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(QueueError::Io(std::io::Error::other(
        "worker manager did not start",
    )))
}

/// Request a graceful stop and wait for the manager to exit, escalating to
/// SIGKILL after the grace period. Fails with `NotRunning` when no live
/// manager is found.
pub fn stop(data_dir: &Path) -> Result<()> {
    if !status(data_dir).running {
        return Err(QueueError::NotRunning);
    }
    fs::create_dir_all(data_dir)?;
    fs::write(data_dir.join(SHUTDOWN_FILE), b"stop")?;

    // The manager polls every 500ms and then drains for up to STOP_GRACE;
    // give it that long plus slack before escalating.
    let deadline = std::time::Instant::now() + STOP_GRACE + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if !status(data_dir).running {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if let Some((pid, _)) = read_pid_file(data_dir) {
        tracing::warn!(pid, "manager did not stop in time, killing");
        kill_process(pid);
    }
    let _ = fs::remove_file(data_dir.join(PID_FILE));
    let _ = fs::remove_file(data_dir.join(SHUTDOWN_FILE));
    Ok(())
}

/// Probe the lifecycle file. A PID file whose process is gone is stale and
/// gets cleaned up here.
pub fn status(data_dir: &Path) -> ManagerStatus {
    match read_pid_file(data_dir) {
        Some((pid, workers)) if process_alive(pid) => ManagerStatus {
            running: true,
            active_workers: workers,
        },
        Some(_) => {
            let _ = fs::remove_file(data_dir.join(PID_FILE));
            ManagerStatus {
                running: false,
                active_workers: 0,
            }
        }
        None => ManagerStatus {
            running: false,
            active_workers: 0,
        },
    }
}

/// Cancel the pool token when the process receives a termination signal.
///
/// SIGTERM/SIGINT drain the pool exactly like a `worker stop`: in-flight
/// job commands run to completion or timeout, queued jobs stay pending,
/// and the manager removes its lifecycle files on the way out.
fn cancel_pool_on_signal(pool: CancellationToken) {
    tokio::spawn(async move {
        if wait_for_termination().await {
            tracing::info!("termination signal received, draining worker pool");
            pool.cancel();
        }
    });
}

#[cfg(unix)]
async fn wait_for_termination() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot watch SIGTERM, stop via the shutdown marker only");
            return false;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "cannot watch SIGINT, stop via the shutdown marker only");
            return false;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
    true
}

#[cfg(not(unix))]
async fn wait_for_termination() -> bool {
    tokio::signal::ctrl_c().await.is_ok()
}

pub fn data_dir_of(db_path: &Path) -> PathBuf {
    db_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Write-then-rename so a concurrent reader never sees a half-written
/// lifecycle file. First line is the manager PID, second the worker count.
fn write_pid_file(dir: &Path, pid: u32, workers: u32) -> Result<()> {
    fs::create_dir_all(dir)?;
    let tmp = dir.join(format!("{PID_FILE}.tmp"));
    fs::write(&tmp, format!("{pid}\n{workers}\n"))?;
    fs::rename(&tmp, dir.join(PID_FILE))?;
    Ok(())
}

fn read_pid_file(dir: &Path) -> Option<(u32, u32)> {
    let text = fs::read_to_string(dir.join(PID_FILE)).ok()?;
    let mut lines = text.lines();
    let pid = lines.next()?.trim().parse().ok()?;
    let workers = lines.next().and_then(|l| l.trim().parse().ok()).unwrap_or(0);
    Some((pid, workers))
}

fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 probes existence without delivering anything.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

fn kill_process(pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}
