//! Wires configuration into registries, the job queue and a dispatcher.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use conductor_config::AppConfig;
use conductor_jobs::{JobQueue, QueueSettings};
use conductor_llm::ModelRegistry;
use conductor_tools::{CapabilityRegistry, builtins};

use crate::{CapabilityJobProcessor, Dispatcher, EventGateway};

/// Everything a running process needs, assembled from one [`AppConfig`].
pub struct Runtime {
    pub config: AppConfig,
    pub capabilities: Arc<CapabilityRegistry>,
    pub models: Arc<ModelRegistry>,
    pub jobs: Option<JobQueue>,
    pub dispatcher: Dispatcher,
}

/// Capability and model registries with the built-in capabilities loaded
/// and the master prompt generated.
pub fn registries(config: &AppConfig) -> Result<(Arc<CapabilityRegistry>, Arc<ModelRegistry>)> {
    let credentials = Arc::new(config.credential_store());
    let capabilities = Arc::new(CapabilityRegistry::new(credentials.clone()));
    builtins::register_all(&capabilities)?;

    let models = Arc::new(ModelRegistry::from_config(config, credentials));
    models.refresh_master_prompt(&capabilities.names());
    Ok((capabilities, models))
}

impl Runtime {
    /// Must be called inside a tokio runtime when jobs are enabled; the
    /// queue's workers start immediately.
    pub fn build(config: AppConfig, gateway: Arc<dyn EventGateway>) -> Result<Self> {
        let (capabilities, models) = registries(&config)?;

        let jobs = config.jobs.enabled.then(|| {
            JobQueue::start(
                QueueSettings::from(&config.jobs),
                Arc::new(CapabilityJobProcessor::new(capabilities.clone())),
            )
        });

        let mut builder = Dispatcher::builder(capabilities.clone(), gateway)
            .models(models.clone())
            .configure(&config);
        if let Some(queue) = &jobs {
            builder = builder.jobs(Arc::new(queue.clone()));
        }
        let dispatcher = builder.build();

        info!(
            capabilities = capabilities.len(),
            models = models.list().len(),
            master = dispatcher.master_available(),
            jobs = jobs.is_some(),
            "runtime assembled"
        );

        Ok(Self {
            config,
            capabilities,
            models,
            jobs,
            dispatcher,
        })
    }

    /// Stop the job workers.  In-flight events are not cancelled.
    pub fn shutdown(&self) {
        if let Some(queue) = &self.jobs {
            queue.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use conductor_config::MASTER_MODEL_ID;

    use super::*;
    use crate::ChannelGateway;

    #[test]
    fn registries_load_builtins_and_master() {
        let config = AppConfig::default();
        let (capabilities, models) = registries(&config).unwrap();
        assert!(capabilities.contains("echo"));
        let master = models.get(MASTER_MODEL_ID).unwrap();
        assert!(master.system_prompt.unwrap().contains("echo"));
    }

    #[tokio::test]
    async fn build_honours_config_switches() {
        let mut config = AppConfig::default();
        config.jobs.enabled = false;
        config.master.enabled = false;
        let (gateway, _rx) = ChannelGateway::new();
        let runtime = Runtime::build(config, Arc::new(gateway)).unwrap();
        assert!(runtime.jobs.is_none());
        assert!(!runtime.dispatcher.master_available());
        runtime.shutdown();
    }
}
