//! Deferred work: the submitter contract the dispatcher schedules against,
//! and [`JobQueue`], an in-process implementation of it.

mod queue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use conductor_config::BackoffKind;
pub use queue::{JobQueue, QueueSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Delay between attempts of a failing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type", default)]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay: u64,
}

impl Backoff {
    /// Delay before the attempt following attempt number `attempts_made`
    /// (1-based).
    pub fn delay_after(&self, attempts_made: u32) -> std::time::Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exp = attempts_made.saturating_sub(1).min(20);
                self.delay.saturating_mul(1u64 << exp)
            }
        };
        std::time::Duration::from_millis(ms)
    }
}

/// Per-job submission options.  Unset fields take the queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobOptions {
    /// Higher runs first.
    pub priority: Option<i32>,
    /// Milliseconds to hold the job before it becomes runnable.
    pub delay: Option<u64>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts_made: u32,
    /// Runtime of the last attempt, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A job as seen by a [`JobProcessor`].
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: Value,
    /// 1-based attempt number.
    pub attempt: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job queue is shut down")]
    ShutDown,
}

/// What the dispatcher needs from a background-job store.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, name: &str, data: Value, options: JobOptions) -> Result<JobHandle, JobError>;

    async fn status(&self, id: &str) -> Option<JobStatus>;

    async fn result(&self, id: &str) -> Result<JobResult, JobError>;
}

/// Executes jobs pulled from a [`JobQueue`].
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<Value>;
}
