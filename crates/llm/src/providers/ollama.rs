//! Ollama `/api/chat` adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use conductor_config::CredentialStore;

use super::{ProviderAdapter, endpoint, normalize_arguments, read_json};
use crate::{
    ConversationTurn, LlmError, ModelConfig, ModelResponse, Provider, Role, ToolCall,
    ToolDefinition, Usage,
};

/// Local servers need no credential; when the config names one and it
/// resolves, it is sent as a bearer token (hosted Ollama deployments).
#[derive(Debug, Clone)]
pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
}

impl OllamaAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, credentials: Arc<CredentialStore>) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            credentials,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        config: &ModelConfig,
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, LlmError> {
        let payload = build_request(turns, config, tools);
        let mut request = self
            .client
            .post(endpoint(&self.base_url, "api/chat"))
            .json(&payload);
        if !config.credential_name.trim().is_empty() {
            if let Some(key) = self.credentials.next(&config.credential_name) {
                request = request.bearer_auth(key);
            }
        }

        let response = request.send().await.map_err(|err| {
            if err.is_connect() {
                LlmError::unavailable(
                    Provider::Ollama.as_str(),
                    format!("cannot reach {}: {err}", self.base_url),
                )
            } else {
                LlmError::Transport(err)
            }
        })?;
        let body = read_json(Provider::Ollama, response).await?;
        parse_response(config, &body)
    }
}

fn message_for(turn: &ConversationTurn) -> serde_json::Value {
    match (turn.role, &turn.tool_call) {
        (Role::Assistant, Some(call)) => json!({
            "role": "assistant",
            "content": turn.content,
            "tool_calls": [{"function": {"name": call.name, "arguments": call.arguments}}]
        }),
        (Role::Tool, _) => json!({
            "role": "tool",
            "content": turn.content,
            "tool_name": turn.name.clone().unwrap_or_default(),
        }),
        (role, _) => json!({"role": role, "content": turn.content}),
    }
}

pub(crate) fn build_request(
    turns: &[ConversationTurn],
    config: &ModelConfig,
    tools: &[ToolDefinition],
) -> serde_json::Value {
    let mut options = json!({
        "temperature": config.temperature,
        "num_predict": config.max_tokens,
    });
    if let Some(top_p) = config.top_p {
        options["top_p"] = json!(top_p);
    }

    let mut payload = json!({
        "model": config.model_id,
        "messages": turns.iter().map(message_for).collect::<Vec<_>>(),
        "stream": false,
        "options": options,
    });
    if config.wants_json() {
        payload["format"] = json!("json");
    }
    if !tools.is_empty() {
        payload["tools"] = json!(
            tools
                .iter()
                .map(ToolDefinition::to_openai_tool_schema)
                .collect::<Vec<_>>()
        );
    }
    payload
}

pub(crate) fn parse_response(
    config: &ModelConfig,
    body: &serde_json::Value,
) -> Result<ModelResponse, LlmError> {
    let message = body
        .get("message")
        .ok_or_else(|| LlmError::invalid_response(Provider::Ollama.as_str(), "missing message"))?;

    let calls = message
        .get("tool_calls")
        .and_then(|calls| calls.as_array())
        .cloned()
        .unwrap_or_default();
    if calls.len() > 1 {
        debug!(count = calls.len(), "ollama returned several tool calls; keeping the first");
    }
    let tool_call = calls.first().and_then(|call| {
        let function = call.get("function")?;
        let name = function.get("name")?.as_str()?.to_string();
        Some(ToolCall {
            id: format!("call_{name}"),
            arguments: normalize_arguments(function.get("arguments").unwrap_or(&serde_json::Value::Null)),
            name,
        })
    });

    let prompt_tokens = body.get("prompt_eval_count").and_then(|v| v.as_u64());
    let completion_tokens = body.get("eval_count").and_then(|v| v.as_u64());
    let usage = match (prompt_tokens, completion_tokens) {
        (None, None) => None,
        (p, c) => Some(Usage::new(p.unwrap_or(0) as u32, c.unwrap_or(0) as u32)),
    };

    Ok(ModelResponse {
        content: message
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string(),
        model: body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&config.model_id)
            .to_string(),
        usage,
        tool_call,
    })
}
