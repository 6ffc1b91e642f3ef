//! Worker loop: claim a job, execute it, finalize the outcome.
//!
//! Each worker owns its own store connection and polls for eligible work.
//! Claim atomicity lives in the store; the worker's contract is that every
//! claim is followed by exactly one `complete` or `fail`, so a job never
//! stays `processing` while its worker is healthy. Shutdown is cooperative:
//! the cancellation token is checked between iterations, and a job that
//! already started runs to completion or timeout.

pub mod executor;

pub use executor::{ExecutionResult, Executor};

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::Result;
use crate::store::Store;

pub struct Worker {
    id: String,
    store: Store,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(id: impl Into<String>, store: Store, shutdown: CancellationToken) -> Self {
        Self {
            id: id.into(),
            store,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(worker = %self.id, "worker started");
        while !self.shutdown.is_cancelled() {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => self.idle().await,
                Err(e) => {
                    tracing::error!(worker = %self.id, error = %e, "worker iteration failed");
                    self.idle().await;
                }
            }
        }
        tracing::info!(worker = %self.id, "worker stopped");
    }

    /// One iteration. Returns true when a job was executed, false when the
    /// queue had nothing eligible.
    async fn step(&mut self) -> Result<bool> {
        let Some(job) = self.store.claim(&self.id, Utc::now())? else {
            return Ok(false);
        };
        tracing::info!(
            worker = %self.id,
            job_id = %job.id,
            attempt = job.attempts + 1,
            max_retries = job.max_retries,
            "claimed job"
        );

        let timeout = Duration::from_secs(config::get_u64(&self.store, "job_timeout")?.max(1));
        let result = Executor::new(timeout).execute(&job.id, &job.command).await;

        if result.succeeded() {
            self.store
                .complete(&job.id, result.exit_code, &result.stdout, &result.stderr, Utc::now())?;
        } else {
            let backoff_base = config::get_u64(&self.store, "backoff_base")?.max(1) as u32;
            let error = result.error.as_deref().unwrap_or("execution_failure");
            self.store.fail(
                &job.id,
                result.exit_code,
                error,
                &result.stdout,
                &result.stderr,
                Utc::now(),
                backoff_base,
                None,
            )?;
        }
        Ok(true)
    }

    /// Empty-claim sleep, interruptible by shutdown. The interval is
    /// re-read from config on every poll so changes apply without a
    /// restart.
    async fn idle(&mut self) {
        let secs = config::get_u64(&self.store, "worker_poll_interval")
            .unwrap_or(1)
            .max(1);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}
