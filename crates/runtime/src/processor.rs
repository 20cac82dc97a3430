use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use conductor_jobs::{Job, JobProcessor};
use conductor_tools::{CapabilityContext, CapabilityRegistry};

/// Runs a job by invoking the capability named after it, with the job data
/// as params.
pub struct CapabilityJobProcessor {
    capabilities: Arc<CapabilityRegistry>,
}

impl CapabilityJobProcessor {
    pub fn new(capabilities: Arc<CapabilityRegistry>) -> Self {
        Self { capabilities }
    }
}

#[async_trait]
impl JobProcessor for CapabilityJobProcessor {
    async fn process(&self, job: &Job) -> anyhow::Result<Value> {
        debug!(job_id = %job.id, job = %job.name, attempt = job.attempt, "running job");
        let ctx = CapabilityContext::new()
            .with("jobId", job.id.clone())
            .with("attempt", job.attempt);
        Ok(self
            .capabilities
            .invoke(&job.name, job.data.clone(), ctx)
            .await?)
    }
}
