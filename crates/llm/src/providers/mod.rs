//! Provider adapters.
//!
//! One adapter per [`Provider`], each owning its request/response
//! marshaling behind [`ProviderAdapter::complete`].

mod anthropic;
mod ollama;
mod openai;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use conductor_config::{CredentialStore, LlmConfig};

use crate::{ConversationTurn, LlmError, ModelConfig, ModelResponse, Provider, ToolDefinition};

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Run one completion.  `turns` already carry any injected system prompt.
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        config: &ModelConfig,
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, LlmError>;
}

/// HTTP adapters for every built-in provider.
pub fn default_adapters(
    llm: &LlmConfig,
    credentials: Arc<CredentialStore>,
) -> HashMap<Provider, Arc<dyn ProviderAdapter>> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(llm.request_timeout_secs.max(1)))
        .build()
        .unwrap_or_default();

    let mut adapters: HashMap<Provider, Arc<dyn ProviderAdapter>> = HashMap::new();
    adapters.insert(
        Provider::OpenAi,
        Arc::new(OpenAiAdapter::openai(
            client.clone(),
            &llm.openai_base_url,
            credentials.clone(),
        )),
    );
    adapters.insert(
        Provider::OpenRouter,
        Arc::new(OpenAiAdapter::openrouter(
            client.clone(),
            &llm.openrouter_base_url,
            credentials.clone(),
        )),
    );
    adapters.insert(
        Provider::Ollama,
        Arc::new(OllamaAdapter::new(
            client.clone(),
            &llm.ollama_base_url,
            credentials.clone(),
        )),
    );
    adapters.insert(
        Provider::Anthropic,
        Arc::new(AnthropicAdapter::new(client, &llm.anthropic_base_url, credentials)),
    );
    adapters
}

/// Resolve the credential a hosted provider needs, or fail with
/// `ProviderUnavailable` before any request is made.
pub(crate) fn require_credential(
    store: &CredentialStore,
    provider: Provider,
    config: &ModelConfig,
) -> Result<String, LlmError> {
    if config.credential_name.trim().is_empty() {
        return Err(LlmError::unavailable(
            provider.as_str(),
            "no credential name configured",
        ));
    }
    store.next(&config.credential_name).ok_or_else(|| {
        LlmError::unavailable(
            provider.as_str(),
            format!("no credential resolves for {}", config.credential_name),
        )
    })
}

/// Turn a non-success HTTP response into `LlmError::Http`, otherwise
/// decode the JSON body.
pub(crate) async fn read_json(
    provider: Provider,
    response: reqwest::Response,
) -> Result<serde_json::Value, LlmError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Http {
            provider: provider.as_str().to_string(),
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

/// Tool arguments arrive either as a JSON object or as a string holding
/// JSON.  Unparsable strings are passed through untouched.
pub(crate) fn normalize_arguments(raw: &serde_json::Value) -> serde_json::Value {
    match raw {
        serde_json::Value::String(s) if s.trim().is_empty() => serde_json::json!({}),
        serde_json::Value::String(s) => {
            serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone()))
        }
        serde_json::Value::Null => serde_json::json!({}),
        other => other.clone(),
    }
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_arguments_variants() {
        assert_eq!(normalize_arguments(&json!("{\"x\":4}")), json!({"x": 4}));
        assert_eq!(normalize_arguments(&json!({"x": 4})), json!({"x": 4}));
        assert_eq!(normalize_arguments(&json!("")), json!({}));
        assert_eq!(normalize_arguments(&json!(null)), json!({}));
        assert_eq!(normalize_arguments(&json!("not json")), json!("not json"));
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("http://localhost:11434/", "/api/chat"),
            "http://localhost:11434/api/chat"
        );
    }

    #[test]
    fn require_credential_fails_without_pool() {
        let store = CredentialStore::default();
        let mut cfg = ModelConfig::from_llm_config(&LlmConfig::default());
        cfg.credential_name = "CONDUCTOR_TEST_MISSING_KEY".into();
        let err = require_credential(&store, Provider::OpenAi, &cfg).unwrap_err();
        assert!(matches!(err, LlmError::ProviderUnavailable { .. }));

        cfg.credential_name = String::new();
        assert!(require_credential(&store, Provider::OpenAi, &cfg).is_err());
    }

    #[test]
    fn require_credential_uses_pool() {
        let mut store = CredentialStore::default();
        store.insert_pool("OPENAI_API_KEY", vec!["sk-1".into()]);
        let cfg = ModelConfig::from_llm_config(&LlmConfig::default());
        assert_eq!(require_credential(&store, Provider::OpenAi, &cfg).unwrap(), "sk-1");
    }

    #[test]
    fn default_adapters_cover_every_provider() {
        let adapters = default_adapters(&LlmConfig::default(), Arc::new(CredentialStore::default()));
        for provider in Provider::ALL {
            assert!(adapters.contains_key(&provider), "missing adapter for {provider}");
        }
    }
}
