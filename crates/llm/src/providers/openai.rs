//! OpenAI chat-completions adapter, shared by OpenAI and OpenRouter.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use conductor_config::CredentialStore;

use super::{ProviderAdapter, endpoint, normalize_arguments, read_json, require_credential};
use crate::{
    ConversationTurn, LlmError, ModelConfig, ModelResponse, Provider, Role, ToolCall,
    ToolDefinition, Usage,
};

#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    provider: Provider,
    base_url: String,
    credentials: Arc<CredentialStore>,
    extra_headers: Vec<(&'static str, &'static str)>,
}

impl OpenAiAdapter {
    pub fn openai(client: reqwest::Client, base_url: &str, credentials: Arc<CredentialStore>) -> Self {
        Self {
            client,
            provider: Provider::OpenAi,
            base_url: base_url.to_string(),
            credentials,
            extra_headers: Vec::new(),
        }
    }

    pub fn openrouter(
        client: reqwest::Client,
        base_url: &str,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            client,
            provider: Provider::OpenRouter,
            base_url: base_url.to_string(),
            credentials,
            extra_headers: vec![
                ("HTTP-Referer", "https://conductor.local"),
                ("X-Title", "Conductor"),
            ],
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        config: &ModelConfig,
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, LlmError> {
        let api_key = require_credential(&self.credentials, self.provider, config)?;
        let payload = build_request(turns, config, tools);

        let mut request = self
            .client
            .post(endpoint(&self.base_url, "chat/completions"))
            .bearer_auth(api_key)
            .json(&payload);
        for (name, value) in &self.extra_headers {
            request = request.header(*name, *value);
        }

        let body = read_json(self.provider, request.send().await?).await?;
        parse_response(self.provider, config, &body)
    }
}

fn message_for(turn: &ConversationTurn) -> serde_json::Value {
    match turn.role {
        Role::Assistant => match &turn.tool_call {
            Some(call) => json!({
                "role": "assistant",
                "content": if turn.content.is_empty() { serde_json::Value::Null } else { json!(turn.content) },
                "tool_calls": [{
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                }]
            }),
            None => json!({"role": "assistant", "content": turn.content}),
        },
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": turn.tool_call_id.clone().unwrap_or_default(),
            "content": turn.content,
        }),
        Role::System => json!({"role": "system", "content": turn.content}),
        Role::User => json!({"role": "user", "content": turn.content}),
    }
}

pub(crate) fn build_request(
    turns: &[ConversationTurn],
    config: &ModelConfig,
    tools: &[ToolDefinition],
) -> serde_json::Value {
    let mut payload = json!({
        "model": config.model_id,
        "messages": turns.iter().map(message_for).collect::<Vec<_>>(),
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
    });
    if let Some(top_p) = config.top_p {
        payload["top_p"] = json!(top_p);
    }
    if config.wants_json() {
        payload["response_format"] = json!({"type": "json_object"});
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
    provider: Provider,
    config: &ModelConfig,
    body: &serde_json::Value,
) -> Result<ModelResponse, LlmError> {
    let message = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| LlmError::invalid_response(provider.as_str(), "missing choices[0].message"))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let calls = message
        .get("tool_calls")
        .and_then(|calls| calls.as_array())
        .cloned()
        .unwrap_or_default();
    if calls.len() > 1 {
        debug!(count = calls.len(), "provider returned several tool calls; keeping the first");
    }
    let tool_call = calls.first().and_then(|call| {
        let function = call.get("function")?;
        let name = function.get("name")?.as_str()?.to_string();
        Some(ToolCall {
            id: call
                .get("id")
                .and_then(|id| id.as_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("call_{name}")),
            arguments: normalize_arguments(function.get("arguments").unwrap_or(&serde_json::Value::Null)),
            name,
        })
    });

    let usage = body.get("usage").map(|usage| {
        Usage::new(
            usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        )
    });

    Ok(ModelResponse {
        content,
        model: body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&config.model_id)
            .to_string(),
        usage,
        tool_call,
    })
}
