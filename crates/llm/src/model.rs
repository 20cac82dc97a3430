//! Model configurations and the provider enum.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use conductor_config::{LlmConfig, ModelEntry};

use crate::LlmError;

/// LLM providers with a built-in adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    OpenRouter,
    Ollama,
    Anthropic,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::OpenAi,
        Provider::OpenRouter,
        Provider::Ollama,
        Provider::Anthropic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::OpenRouter => "openrouter",
            Provider::Ollama => "ollama",
            Provider::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "openrouter" => Ok(Provider::OpenRouter),
            "ollama" => Ok(Provider::Ollama),
            "anthropic" => Ok(Provider::Anthropic),
            other => Err(LlmError::UnsupportedProvider(other.to_string())),
        }
    }
}

/// Everything needed to call one model.
///
/// `provider` stays a string so configs naming a provider without an
/// adapter can be stored; the mismatch surfaces as `UnsupportedProvider`
/// when the model is used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub credential_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
}

impl ModelConfig {
    pub fn from_llm_config(llm: &LlmConfig) -> Self {
        Self {
            provider: llm.provider.clone(),
            model_id: llm.model.clone(),
            credential_name: llm.credential_name.clone(),
            temperature: llm.temperature,
            max_tokens: llm.max_tokens,
            top_p: llm.top_p,
            system_prompt: llm.system_prompt.clone(),
            response_format: llm.response_format.clone(),
        }
    }

    pub fn provider_kind(&self) -> Result<Provider, LlmError> {
        self.provider.parse()
    }

    /// Shallow merge: every field set in `patch` replaces ours.
    pub fn apply(&mut self, patch: &ModelConfigPatch) {
        if let Some(provider) = &patch.provider {
            self.provider = provider.clone();
        }
        if let Some(model_id) = &patch.model_id {
            self.model_id = model_id.clone();
        }
        if let Some(credential_name) = &patch.credential_name {
            self.credential_name = credential_name.clone();
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = temperature;
        }
        if let Some(max_tokens) = patch.max_tokens {
            self.max_tokens = max_tokens;
        }
        if patch.top_p.is_some() {
            self.top_p = patch.top_p;
        }
        if patch.system_prompt.is_some() {
            self.system_prompt = patch.system_prompt.clone();
        }
        if patch.response_format.is_some() {
            self.response_format = patch.response_format.clone();
        }
    }

    pub fn merged(&self, patch: &ModelConfigPatch) -> Self {
        let mut merged = self.clone();
        merged.apply(patch);
        merged
    }

    /// Whether the provider should be asked for a JSON object reply.
    pub fn wants_json(&self) -> bool {
        self.response_format
            .as_deref()
            .map(|f| f.eq_ignore_ascii_case("json") || f.eq_ignore_ascii_case("json_object"))
            .unwrap_or(false)
    }
}

/// Partial model configuration used for updates and per-call overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelConfigPatch {
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub credential_name: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub system_prompt: Option<String>,
    pub response_format: Option<String>,
}

impl ModelConfigPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<&ModelEntry> for ModelConfigPatch {
    fn from(entry: &ModelEntry) -> Self {
        Self {
            provider: entry.provider.clone(),
            model_id: entry.model.clone(),
            credential_name: entry.credential_name.clone(),
            temperature: entry.temperature,
            max_tokens: entry.max_tokens,
            top_p: entry.top_p,
            system_prompt: entry.system_prompt.clone(),
            response_format: entry.response_format.clone(),
        }
    }
}
