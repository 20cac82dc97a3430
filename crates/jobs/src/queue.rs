//! In-process priority job queue with delayed jobs, retries and a fixed
//! worker pool.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use conductor_config::JobsConfig;

use crate::{
    Backoff, Job, JobError, JobHandle, JobOptions, JobProcessor, JobResult, JobStatus,
    JobSubmitter,
};

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub default_attempts: u32,
    pub backoff: Backoff,
    /// Terminal job records kept before the oldest is dropped.
    pub retain_finished: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&JobsConfig::default())
    }
}

impl From<&JobsConfig> for QueueSettings {
    fn from(config: &JobsConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            default_attempts: config.default_attempts.max(1),
            backoff: Backoff {
                kind: config.backoff,
                delay: config.backoff_ms,
            },
            retain_finished: config.retain_finished.max(1),
        }
    }
}

#[derive(Debug)]
struct JobRecord {
    id: String,
    name: String,
    data: Value,
    priority: i32,
    seq: u64,
    attempts: u32,
    backoff: Backoff,
    status: JobStatus,
    attempts_made: u32,
    run_at: Option<Instant>,
    result: Option<Value>,
    error: Option<String>,
    duration_ms: Option<u64>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn snapshot(&self) -> JobResult {
        JobResult {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            attempts_made: self.attempts_made,
            duration: self.duration_ms,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Ready {
    priority: i32,
    seq: u64,
    id: String,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A delayed job or pending retry, earliest `run_at` first.
#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    run_at: Instant,
    seq: u64,
    id: String,
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the max-heap yields the earliest deadline.
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobRecord>,
    ready: BinaryHeap<Ready>,
    delayed: BinaryHeap<Scheduled>,
    /// Terminal job ids, oldest first.
    finished: VecDeque<String>,
    paused: bool,
    shutdown: bool,
}

impl State {
    fn schedule(&mut self, job: &JobRecord) {
        match job.run_at {
            Some(run_at) => self.delayed.push(Scheduled {
                run_at,
                seq: job.seq,
                id: job.id.clone(),
            }),
            None => self.ready.push(Ready {
                priority: job.priority,
                seq: job.seq,
                id: job.id.clone(),
            }),
        }
    }

    fn retire(&mut self, id: &str, keep: usize) {
        self.finished.push_back(id.to_string());
        while self.finished.len() > keep {
            if let Some(oldest) = self.finished.pop_front() {
                self.jobs.remove(&oldest);
                debug!(job_id = %oldest, "finished job evicted");
            }
        }
    }
}

enum Next {
    Run(Job),
    Idle(Option<Instant>),
    Stop,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    seq: AtomicU64,
    settings: QueueSettings,
    processor: Arc<dyn JobProcessor>,
}

/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Create the queue and spawn `settings.concurrency` workers on the
    /// current tokio runtime.
    pub fn start(settings: QueueSettings, processor: Arc<dyn JobProcessor>) -> Self {
        let workers = settings.concurrency.max(1);
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            settings,
            processor,
        });
        for worker in 0..workers {
            tokio::spawn(run_worker(inner.clone(), worker));
        }
        info!(workers, "job queue started");
        Self { inner }
    }

    /// Stop handing out jobs.  Waiting jobs report `paused`; running jobs
    /// finish normally.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
        info!("job queue paused");
    }

    pub fn resume(&self) {
        self.inner.lock().paused = false;
        self.inner.notify.notify_waiters();
        info!("job queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// Workers exit after their current job.  Later submissions fail.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.inner.notify.notify_waiters();
        info!("job queue shutting down");
    }

    /// Jobs not yet in a terminal state.
    pub fn pending(&self) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .count()
    }
}

#[async_trait]
impl JobSubmitter for JobQueue {
    async fn submit(&self, name: &str, data: Value, options: JobOptions) -> Result<JobHandle, JobError> {
        if name.trim().is_empty() {
            return Err(JobError::InvalidJob("job name is empty".into()));
        }

        let settings = &self.inner.settings;
        let id = uuid::Uuid::new_v4().to_string();
        let delay = options.delay.filter(|ms| *ms > 0);
        let status = if delay.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        let record = JobRecord {
            id: id.clone(),
            name: name.to_string(),
            data,
            priority: options.priority.unwrap_or(0),
            seq: self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed),
            attempts: options.attempts.unwrap_or(settings.default_attempts).max(1),
            backoff: options.backoff.unwrap_or(settings.backoff),
            status,
            attempts_made: 0,
            run_at: delay.map(|ms| Instant::now() + std::time::Duration::from_millis(ms)),
            result: None,
            error: None,
            duration_ms: None,
            completed_at: None,
        };

        {
            let mut state = self.inner.lock();
            if state.shutdown {
                return Err(JobError::ShutDown);
            }
            state.schedule(&record);
            state.jobs.insert(id.clone(), record);
        }
        self.inner.notify.notify_waiters();
        debug!(job_id = %id, name, ?status, "job submitted");

        Ok(JobHandle {
            id,
            name: name.to_string(),
            status: self.visible_status(status),
        })
    }

    async fn status(&self, id: &str) -> Option<JobStatus> {
        let status = self.inner.lock().jobs.get(id).map(|j| j.status)?;
        Some(self.visible_status(status))
    }

    async fn result(&self, id: &str) -> Result<JobResult, JobError> {
        let state = self.inner.lock();
        let mut snapshot = state
            .jobs
            .get(id)
            .map(JobRecord::snapshot)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if state.paused && snapshot.status == JobStatus::Waiting {
            snapshot.status = JobStatus::Paused;
        }
        Ok(snapshot)
    }
}

impl JobQueue {
    fn visible_status(&self, status: JobStatus) -> JobStatus {
        if status == JobStatus::Waiting && self.is_paused() {
            JobStatus::Paused
        } else {
            status
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Promote due delayed jobs, then pop the best ready job.
    fn next_job(&self) -> Next {
        let mut state = self.lock();
        if state.shutdown {
            return Next::Stop;
        }

        let now = Instant::now();
        while state.delayed.peek().is_some_and(|next| next.run_at <= now) {
            let Some(due) = state.delayed.pop() else {
                break;
            };
            let Some(job) = state.jobs.get_mut(&due.id) else {
                continue;
            };
            if job.status != JobStatus::Delayed {
                continue;
            }
            job.status = JobStatus::Waiting;
            job.run_at = None;
            let ready = Ready {
                priority: job.priority,
                seq: job.seq,
                id: due.id,
            };
            state.ready.push(ready);
        }
        let next_due = state.delayed.peek().map(|next| next.run_at);

        if state.paused {
            return Next::Idle(next_due);
        }

        while let Some(ready) = state.ready.pop() {
            let Some(job) = state.jobs.get_mut(&ready.id) else {
                continue;
            };
            if job.status != JobStatus::Waiting {
                continue;
            }
            job.status = JobStatus::Active;
            job.attempts_made += 1;
            return Next::Run(Job {
                id: job.id.clone(),
                name: job.name.clone(),
                data: job.data.clone(),
                attempt: job.attempts_made,
            });
        }
        Next::Idle(next_due)
    }

    fn finish(&self, id: &str, outcome: Result<Value, String>, duration_ms: u64) {
        let mut state = self.lock();
        let Some(job) = state.jobs.get_mut(id) else {
            return;
        };
        job.duration_ms = Some(duration_ms);

        match outcome {
            Ok(value) => {
                job.status = JobStatus::Completed;
                job.result = Some(value);
                job.error = None;
                job.completed_at = Some(Utc::now());
                info!(job_id = id, name = %job.name, attempts = job.attempts_made, "job completed");
            }
            Err(error) if job.attempts_made < job.attempts => {
                let delay = job.backoff.delay_after(job.attempts_made);
                warn!(
                    job_id = id,
                    name = %job.name,
                    attempt = job.attempts_made,
                    retry_in_ms = delay.as_millis() as u64,
                    %error,
                    "job failed; retrying"
                );
                job.error = Some(error);
                job.status = JobStatus::Delayed;
                let run_at = Instant::now() + delay;
                job.run_at = Some(run_at);
                let scheduled = Scheduled {
                    run_at,
                    seq: job.seq,
                    id: job.id.clone(),
                };
                state.delayed.push(scheduled);
                return;
            }
            Err(error) => {
                warn!(job_id = id, name = %job.name, attempts = job.attempts_made, %error, "job failed");
                job.status = JobStatus::Failed;
                job.error = Some(error);
                job.completed_at = Some(Utc::now());
            }
        }
        state.retire(id, self.settings.retain_finished);
    }
}

async fn run_worker(inner: Arc<Inner>, worker: usize) {
    debug!(worker, "job worker started");
    loop {
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        match inner.next_job() {
            Next::Stop => break,
            Next::Run(job) => {
                let started = Instant::now();
                let processor = inner.processor.clone();
                let id = job.id.clone();
                // Run on its own task so a panicking processor only fails this job.
                let outcome = match tokio::spawn(async move { processor.process(&job).await }).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(format!("{err:#}")),
                    Err(join) => Err(format!("job panicked: {join}")),
                };
                inner.finish(&id, outcome, started.elapsed().as_millis() as u64);
                inner.notify.notify_waiters();
            }
            Next::Idle(Some(deadline)) => {
                let _ = tokio::time::timeout_at(deadline, notified).await;
            }
            Next::Idle(None) => notified.await,
        }
    }
    debug!(worker, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::BackoffKind;

    /// Records job names; fails while `data.failUntil` exceeds the attempt.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobProcessor for Recorder {
        async fn process(&self, job: &Job) -> anyhow::Result<Value> {
            self.seen.lock().unwrap().push(job.name.clone());
            let fail_until = job.data["failUntil"].as_u64().unwrap_or(0) as u32;
            if job.attempt <= fail_until {
                anyhow::bail!("attempt {} failed", job.attempt);
            }
            if job.data["panic"].as_bool().unwrap_or(false) {
                panic!("processor exploded");
            }
            Ok(json!({"handled": job.name, "attempt": job.attempt}))
        }
    }

    fn settings(concurrency: usize) -> QueueSettings {
        QueueSettings {
            concurrency,
            default_attempts: 1,
            backoff: Backoff {
                kind: BackoffKind::Fixed,
                delay: 10,
            },
            retain_finished: 100,
        }
    }

    async fn wait_terminal(queue: &JobQueue, id: &str) -> JobResult {
        for _ in 0..200 {
            let result = queue.result(id).await.unwrap();
            if result.status.is_terminal() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn job_completes_with_result() {
        let queue = JobQueue::start(settings(1), Arc::new(Recorder::default()));
        let handle = queue.submit("report", json!({}), JobOptions::default()).await.unwrap();
        assert_eq!(handle.name, "report");

        let result = wait_terminal(&queue, &handle.id).await;
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.result.unwrap()["handled"], "report");
        assert!(result.completed_at.is_some());
        assert!(result.duration.is_some());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn priority_then_fifo_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = JobQueue::start(settings(1), recorder.clone());
        queue.pause();

        let mut ids = Vec::new();
        for (name, priority) in [("low", 0), ("high-a", 5), ("mid", 2), ("high-b", 5)] {
            let options = JobOptions {
                priority: Some(priority),
                ..Default::default()
            };
            let handle = queue.submit(name, json!({}), options).await.unwrap();
            assert_eq!(handle.status, JobStatus::Paused);
            ids.push(handle.id);
        }
        assert_eq!(queue.status(&ids[0]).await, Some(JobStatus::Paused));

        queue.resume();
        for id in &ids {
            wait_terminal(&queue, id).await;
        }
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["high-a", "high-b", "mid", "low"]
        );
    }

    #[tokio::test]
    async fn delayed_job_waits() {
        let queue = JobQueue::start(settings(1), Arc::new(Recorder::default()));
        let options = JobOptions {
            delay: Some(50),
            ..Default::default()
        };
        let handle = queue.submit("later", json!({}), options).await.unwrap();
        assert_eq!(handle.status, JobStatus::Delayed);
        assert_eq!(queue.status(&handle.id).await, Some(JobStatus::Delayed));

        let result = wait_terminal(&queue, &handle.id).await;
        assert_eq!(result.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let queue = JobQueue::start(settings(2), Arc::new(Recorder::default()));
        let options = JobOptions {
            attempts: Some(3),
            ..Default::default()
        };
        let handle = queue
            .submit("flaky", json!({"failUntil": 2}), options)
            .await
            .unwrap();
        let result = wait_terminal(&queue, &handle.id).await;
        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!(result.attempts_made, 3);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn exhausted_attempts_fail() {
        let queue = JobQueue::start(settings(1), Arc::new(Recorder::default()));
        let options = JobOptions {
            attempts: Some(2),
            ..Default::default()
        };
        let handle = queue
            .submit("doomed", json!({"failUntil": 5}), options)
            .await
            .unwrap();
        let result = wait_terminal(&queue, &handle.id).await;
        assert_eq!(result.status, JobStatus::Failed);
        assert_eq!(result.attempts_made, 2);
        assert!(result.error.unwrap().contains("attempt 2 failed"));
    }

    #[tokio::test]
    async fn panicking_processor_fails_the_job_only() {
        let queue = JobQueue::start(settings(1), Arc::new(Recorder::default()));
        let bad = queue.submit("bad", json!({"panic": true}), JobOptions::default()).await.unwrap();
        let good = queue.submit("good", json!({}), JobOptions::default()).await.unwrap();

        assert_eq!(wait_terminal(&queue, &bad.id).await.status, JobStatus::Failed);
        assert_eq!(wait_terminal(&queue, &good.id).await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let queue = JobQueue::start(settings(1), Arc::new(Recorder::default()));
        assert!(queue.status("missing").await.is_none());
        assert!(matches!(
            queue.result("missing").await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            queue.submit(" ", json!({}), JobOptions::default()).await,
            Err(JobError::InvalidJob(_))
        ));
    }

    #[tokio::test]
    async fn oldest_finished_jobs_are_evicted() {
        let queue = JobQueue::start(
            QueueSettings {
                retain_finished: 2,
                ..settings(1)
            },
            Arc::new(Recorder::default()),
        );
        let mut ids = Vec::new();
        for name in ["first", "second", "third"] {
            let handle = queue.submit(name, json!({}), JobOptions::default()).await.unwrap();
            wait_terminal(&queue, &handle.id).await;
            ids.push(handle.id);
        }

        assert!(matches!(
            queue.result(&ids[0]).await,
            Err(JobError::NotFound(_))
        ));
        assert_eq!(queue.status(&ids[1]).await, Some(JobStatus::Completed));
        assert_eq!(queue.status(&ids[2]).await, Some(JobStatus::Completed));
        assert_eq!(queue.inner.lock().jobs.len(), 2);
    }

    #[tokio::test]
    async fn delayed_jobs_run_in_deadline_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = JobQueue::start(settings(1), recorder.clone());
        let mut ids = Vec::new();
        for (name, delay) in [("slowest", 80), ("soonest", 20), ("middle", 50)] {
            let options = JobOptions {
                delay: Some(delay),
                ..Default::default()
            };
            ids.push(queue.submit(name, json!({}), options).await.unwrap().id);
        }
        for id in &ids {
            wait_terminal(&queue, id).await;
        }
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["soonest", "middle", "slowest"]
        );
        assert!(queue.inner.lock().delayed.is_empty());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_work() {
        let queue = JobQueue::start(settings(1), Arc::new(Recorder::default()));
        queue.shutdown();
        assert!(matches!(
            queue.submit("x", json!({}), JobOptions::default()).await,
            Err(JobError::ShutDown)
        ));
    }
}
