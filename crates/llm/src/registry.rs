//! Model registry: named model configs, the master model, and the provider
//! dispatch behind `send`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use conductor_config::{AppConfig, CredentialStore, MASTER_MODEL_ID};

use crate::providers::{ProviderAdapter, default_adapters};
use crate::{
    ConversationTurn, LlmError, ModelConfig, ModelConfigPatch, ModelResponse, Provider, Role,
    ToolDefinition,
};

#[derive(Debug, Clone)]
struct Registered {
    config: ModelConfig,
    /// The system prompt was generated from capability names and may be
    /// regenerated.  Cleared as soon as anyone sets a prompt explicitly.
    auto_prompt: bool,
}

pub struct ModelRegistry {
    base: ModelConfig,
    models: RwLock<HashMap<String, Registered>>,
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
}

impl ModelRegistry {
    /// Registry with no adapters; add them with [`ModelRegistry::with_adapter`].
    pub fn new(base: ModelConfig) -> Self {
        Self {
            base,
            models: RwLock::new(HashMap::new()),
            adapters: HashMap::new(),
        }
    }

    pub fn with_adapter(mut self, provider: Provider, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(provider, adapter);
        self
    }

    /// Base config from `[llm]`, HTTP adapters for every provider, and one
    /// entry per `[models.<id>]` table merged over the base.
    pub fn from_config(config: &AppConfig, credentials: Arc<CredentialStore>) -> Self {
        let mut registry = Self::new(ModelConfig::from_llm_config(&config.llm));
        registry.adapters = default_adapters(&config.llm, credentials);

        for (id, entry) in &config.models {
            let merged = registry.base.merged(&ModelConfigPatch::from(entry));
            registry.register(id, merged);
        }

        if let Some(prompt) = &config.master.system_prompt {
            registry.set_master_prompt(prompt.clone());
        }

        info!(
            provider = %registry.base.provider,
            model = %registry.base.model_id,
            models = registry.list().len(),
            "model registry ready"
        );
        registry
    }

    pub fn base(&self) -> &ModelConfig {
        &self.base
    }

    /// Insert or overwrite `model_id`.  A master entry registered without a
    /// system prompt receives a generated one on the next refresh.
    pub fn register(&self, model_id: &str, config: ModelConfig) {
        let auto_prompt = model_id == MASTER_MODEL_ID && config.system_prompt.is_none();
        self.write().insert(
            model_id.to_string(),
            Registered {
                config,
                auto_prompt,
            },
        );
        debug!(model_id, "model registered");
    }

    pub fn get(&self, model_id: &str) -> Option<ModelConfig> {
        self.read().get(model_id).map(|r| r.config.clone())
    }

    /// Shallow merge of `patch` into an existing entry.  The master model is
    /// created from the base config when absent; any other unknown id is
    /// `ModelNotFound`.
    pub fn update(&self, model_id: &str, patch: &ModelConfigPatch) -> Result<ModelConfig, LlmError> {
        let mut models = self.write();
        if !models.contains_key(model_id) && model_id == MASTER_MODEL_ID {
            models.insert(
                model_id.to_string(),
                Registered {
                    config: ModelConfig {
                        system_prompt: None,
                        ..self.base.clone()
                    },
                    auto_prompt: true,
                },
            );
        }
        let entry = models
            .get_mut(model_id)
            .ok_or_else(|| LlmError::ModelNotFound(model_id.to_string()))?;
        entry.config.apply(patch);
        if patch.system_prompt.is_some() {
            entry.auto_prompt = false;
        }
        Ok(entry.config.clone())
    }

    pub fn remove(&self, model_id: &str) -> Result<ModelConfig, LlmError> {
        if model_id == MASTER_MODEL_ID {
            return Err(LlmError::MasterModelProtected);
        }
        self.write()
            .remove(model_id)
            .map(|r| r.config)
            .ok_or_else(|| LlmError::ModelNotFound(model_id.to_string()))
    }

    /// Registered model ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn has_master(&self) -> bool {
        self.read().contains_key(MASTER_MODEL_ID)
    }

    /// Get-or-create the master model config.  A freshly created entry is a
    /// copy of the base config with a generated prompt listing `capabilities`.
    pub fn master_config(&self, capabilities: &[String]) -> ModelConfig {
        if let Some(existing) = self.get(MASTER_MODEL_ID) {
            if existing.system_prompt.is_some() {
                return existing;
            }
        }
        self.refresh_master_prompt(capabilities);
        self.get(MASTER_MODEL_ID).unwrap_or_else(|| self.base.clone())
    }

    /// Regenerate the master prompt from `capabilities`, unless it was
    /// customised.  Returns whether the prompt was rewritten.
    pub fn refresh_master_prompt(&self, capabilities: &[String]) -> bool {
        let mut models = self.write();
        let entry = models
            .entry(MASTER_MODEL_ID.to_string())
            .or_insert_with(|| Registered {
                config: ModelConfig {
                    system_prompt: None,
                    ..self.base.clone()
                },
                auto_prompt: true,
            });
        if !entry.auto_prompt {
            return false;
        }
        entry.config.system_prompt = Some(default_master_prompt(capabilities));
        debug!(capabilities = capabilities.len(), "master prompt regenerated");
        true
    }

    /// Install a hand-written master prompt.  It survives later refreshes.
    pub fn set_master_prompt(&self, prompt: impl Into<String>) {
        let patch = ModelConfigPatch {
            system_prompt: Some(prompt.into()),
            ..Default::default()
        };
        // Only the master id can be created by update, so this never fails.
        let _ = self.update(MASTER_MODEL_ID, &patch);
    }

    /// `registry[model_id] ⊕ overrides`, or the base config when the id is
    /// unset or unknown.
    pub fn effective_config(
        &self,
        model_id: Option<&str>,
        overrides: Option<&ModelConfigPatch>,
    ) -> ModelConfig {
        let mut config = model_id
            .and_then(|id| self.get(id))
            .unwrap_or_else(|| self.base.clone());
        if let Some(patch) = overrides {
            config.apply(patch);
        }
        config
    }

    pub async fn send(
        &self,
        turns: &[ConversationTurn],
        overrides: Option<&ModelConfigPatch>,
        model_id: Option<&str>,
    ) -> Result<ModelResponse, LlmError> {
        self.send_with_tools(turns, overrides, model_id, &[]).await
    }

    /// Tool-enabled `send`.  The provider may answer with one tool call.
    pub async fn send_with_tools(
        &self,
        turns: &[ConversationTurn],
        overrides: Option<&ModelConfigPatch>,
        model_id: Option<&str>,
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, LlmError> {
        let config = self.effective_config(model_id, overrides);
        let turns = prepare_turns(turns, &config)?;
        self.dispatch(&turns, &config, tools).await
    }

    pub async fn chat(
        &self,
        turns: &[ConversationTurn],
        overrides: Option<&ModelConfigPatch>,
        model_id: Option<&str>,
    ) -> Result<ModelResponse, LlmError> {
        self.send(turns, overrides, model_id).await
    }

    /// Single user prompt; the configured system prompt is injected.
    pub async fn generate(
        &self,
        prompt: &str,
        overrides: Option<&ModelConfigPatch>,
        model_id: Option<&str>,
    ) -> Result<ModelResponse, LlmError> {
        self.send(&[ConversationTurn::user(prompt)], overrides, model_id)
            .await
    }

    /// Raw prompt with no system prompt injection.
    pub async fn completion(
        &self,
        prompt: &str,
        overrides: Option<&ModelConfigPatch>,
        model_id: Option<&str>,
    ) -> Result<ModelResponse, LlmError> {
        let config = self.effective_config(model_id, overrides);
        self.dispatch(&[ConversationTurn::user(prompt)], &config, &[])
            .await
    }

    async fn dispatch(
        &self,
        turns: &[ConversationTurn],
        config: &ModelConfig,
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, LlmError> {
        let provider = config.provider_kind()?;
        let adapter = self
            .adapters
            .get(&provider)
            .ok_or_else(|| LlmError::UnsupportedProvider(config.provider.clone()))?;
        debug!(
            %provider,
            model = %config.model_id,
            turns = turns.len(),
            tools = tools.len(),
            "model call"
        );
        adapter.complete(turns, config, tools).await
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Registered>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Registered>> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reject system turns after the first, then prepend the configured system
/// prompt when the conversation does not open with one.
pub fn prepare_turns(
    turns: &[ConversationTurn],
    config: &ModelConfig,
) -> Result<Vec<ConversationTurn>, LlmError> {
    if let Some(pos) = turns.iter().skip(1).position(|t| t.role == Role::System) {
        return Err(LlmError::InvalidConversation(format!(
            "system turn at position {} (only the first turn may be system)",
            pos + 1
        )));
    }

    let mut prepared = Vec::with_capacity(turns.len() + 1);
    let opens_with_system = turns.first().is_some_and(|t| t.role == Role::System);
    if !opens_with_system {
        if let Some(prompt) = config.system_prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            prepared.push(ConversationTurn::system(prompt));
        }
    }
    prepared.extend_from_slice(turns);
    Ok(prepared)
}

/// Decision prompt listing the capabilities the master model may call.
pub fn default_master_prompt(capabilities: &[String]) -> String {
    let listed = if capabilities.is_empty() {
        "(none registered)".to_string()
    } else {
        capabilities.join(", ")
    };
    format!(
        "You are the decision model of an event orchestrator. For every event you \
         receive, decide on exactly one action: answer directly, call one of the \
         available capabilities, schedule deferred work, or do nothing.\n\
         Available capabilities: {listed}.\n\
         Prefer calling a capability through a tool call. Otherwise reply with a \
         single JSON object whose \"action\" is one of \"call_capability\", \
         \"schedule_work\", \"send_response\" or \"no_op\"."
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use conductor_config::{LlmConfig, MasterConfig, ModelEntry};

    use super::*;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(Vec<ConversationTurn>, ModelConfig, usize)>>,
    }

    #[async_trait]
    impl ProviderAdapter for Recording {
        async fn complete(
            &self,
            turns: &[ConversationTurn],
            config: &ModelConfig,
            tools: &[ToolDefinition],
        ) -> Result<ModelResponse, LlmError> {
            self.calls
                .lock()
                .unwrap()
                .push((turns.to_vec(), config.clone(), tools.len()));
            Ok(ModelResponse::text(config.model_id.clone(), "ok"))
        }
    }

    fn base() -> ModelConfig {
        ModelConfig::from_llm_config(&LlmConfig::default())
    }

    fn registry_with(adapter: Arc<Recording>) -> ModelRegistry {
        ModelRegistry::new(base()).with_adapter(Provider::OpenAi, adapter)
    }

    #[test]
    fn register_then_get_round_trips() {
        let registry = ModelRegistry::new(base());
        let mut cfg = base();
        cfg.model_id = "gpt-4o".into();
        cfg.temperature = 0.2;
        registry.register("writer", cfg.clone());
        assert_eq!(registry.get("writer"), Some(cfg));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn update_merges_and_unknown_is_not_found() {
        let registry = ModelRegistry::new(base());
        registry.register("writer", base());
        let updated = registry
            .update(
                "writer",
                &ModelConfigPatch {
                    max_tokens: Some(64),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.max_tokens, 64);
        assert_eq!(updated.model_id, "gpt-4o-mini");

        let err = registry.update("ghost", &ModelConfigPatch::default()).unwrap_err();
        assert!(matches!(err, LlmError::ModelNotFound(_)));
    }

    #[test]
    fn master_cannot_be_removed() {
        let registry = ModelRegistry::new(base());
        registry.master_config(&[]);
        assert!(matches!(
            registry.remove(MASTER_MODEL_ID),
            Err(LlmError::MasterModelProtected)
        ));
        assert!(registry.has_master());

        registry.register("other", base());
        assert!(registry.remove("other").is_ok());
        assert!(matches!(registry.remove("other"), Err(LlmError::ModelNotFound(_))));
    }

    #[test]
    fn master_prompt_tracks_capabilities_until_customised() {
        let registry = ModelRegistry::new(base());
        let cfg = registry.master_config(&["echo".to_string()]);
        assert!(cfg.system_prompt.unwrap().contains("echo"));

        assert!(registry.refresh_master_prompt(&["echo".into(), "double".into()]));
        let prompt = registry.get(MASTER_MODEL_ID).unwrap().system_prompt.unwrap();
        assert!(prompt.contains("double"));

        registry.set_master_prompt("custom decision prompt");
        assert!(!registry.refresh_master_prompt(&["third".into()]));
        assert_eq!(
            registry.get(MASTER_MODEL_ID).unwrap().system_prompt.as_deref(),
            Some("custom decision prompt")
        );
    }

    #[test]
    fn from_config_merges_model_tables() {
        let mut config = AppConfig::default();
        config.models.insert(
            "local".into(),
            ModelEntry {
                provider: Some("ollama".into()),
                model: Some("llama3.1:8b".into()),
                ..Default::default()
            },
        );
        config.master = MasterConfig {
            system_prompt: Some("decide".into()),
            ..Default::default()
        };
        let registry = ModelRegistry::from_config(&config, Arc::new(CredentialStore::default()));
        let local = registry.get("local").unwrap();
        assert_eq!(local.provider, "ollama");
        assert_eq!(local.max_tokens, 1024);
        assert_eq!(
            registry.master_config(&["x".into()]).system_prompt.as_deref(),
            Some("decide")
        );
        assert_eq!(registry.list(), vec!["local".to_string(), MASTER_MODEL_ID.to_string()]);
    }

    #[test]
    fn prepare_turns_injects_and_validates() {
        let mut cfg = base();
        cfg.system_prompt = Some("be terse".into());

        let turns = prepare_turns(&[ConversationTurn::user("hi")], &cfg).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::System);
        assert_eq!(turns[0].content, "be terse");

        let own = prepare_turns(
            &[ConversationTurn::system("mine"), ConversationTurn::user("hi")],
            &cfg,
        )
        .unwrap();
        assert_eq!(own.len(), 2);
        assert_eq!(own[0].content, "mine");

        let err = prepare_turns(
            &[ConversationTurn::user("hi"), ConversationTurn::system("late")],
            &cfg,
        )
        .unwrap_err();
        assert!(matches!(err, LlmError::InvalidConversation(_)));
    }

    #[tokio::test]
    async fn send_uses_registered_config_with_overrides() {
        let adapter = Arc::new(Recording::default());
        let registry = registry_with(adapter.clone());
        let mut writer = base();
        writer.model_id = "gpt-4o".into();
        registry.register("writer", writer);

        let overrides = ModelConfigPatch {
            temperature: Some(0.0),
            ..Default::default()
        };
        let resp = registry
            .send(&[ConversationTurn::user("hi")], Some(&overrides), Some("writer"))
            .await
            .unwrap();
        assert_eq!(resp.model, "gpt-4o");

        let unknown = registry
            .send(&[ConversationTurn::user("hi")], None, Some("nope"))
            .await
            .unwrap();
        assert_eq!(unknown.model, "gpt-4o-mini");

        let calls = adapter.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].1.temperature.abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn unsupported_provider_is_reported() {
        let registry = registry_with(Arc::new(Recording::default()));
        let mut cfg = base();
        cfg.provider = "anthropic".into();
        registry.register("claude", cfg);
        let err = registry
            .send(&[ConversationTurn::user("hi")], None, Some("claude"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::UnsupportedProvider(ref p) if p == "anthropic"));

        let mut bogus = base();
        bogus.provider = "cohere".into();
        registry.register("bogus", bogus);
        assert!(
            registry
                .send(&[ConversationTurn::user("hi")], None, Some("bogus"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn completion_skips_system_prompt() {
        let adapter = Arc::new(Recording::default());
        let mut cfg = base();
        cfg.system_prompt = Some("sys".into());
        let registry = ModelRegistry::new(cfg).with_adapter(Provider::OpenAi, adapter.clone());

        registry.generate("a", None, None).await.unwrap();
        registry.completion("b", None, None).await.unwrap();

        let calls = adapter.calls.lock().unwrap();
        assert_eq!(calls[0].0.len(), 2);
        assert_eq!(calls[1].0.len(), 1);
        assert_eq!(calls[1].0[0].content, "b");
    }
}
