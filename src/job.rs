use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{QueueError, Result};

/// Lifecycle state of a job.
///
/// `Failed` is a transient label between attempts; a job that has exhausted
/// its retries ends up in `Dead`, the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Error)]
#[error("unknown job state: {0}")]
pub struct ParseStateError(String);

impl std::str::FromStr for JobState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// A persisted job record, one row of the `jobs` table.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    /// Opaque shell command line, executed as-is.
    pub command: String,
    pub state: JobState,
    /// Execution attempts made so far; incremented on finalize.
    pub attempts: u32,
    /// Total attempts allowed before the job goes dead.
    pub max_retries: u32,
    /// Higher is more urgent.
    pub priority: i64,
    /// When the job first becomes eligible.
    pub run_at: DateTime<Utc>,
    /// When the job next becomes eligible; pushed forward by retry backoff.
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    /// Short failure reason: "nonzero_exit", "timeout", "signal",
    /// "lease_expired", or a spawn error message.
    pub error: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Worker identity holding the claim; set only while `processing`.
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Validated enqueue request.
///
/// Accepted as a JSON object (unknown keys are rejected) or assembled from
/// CLI flags. Only `command` is required; everything else has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| QueueError::InvalidInput(format!("bad job spec: {e}")))
    }
}
