//! Anthropic `/v1/messages` adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use conductor_config::CredentialStore;

use super::{ProviderAdapter, endpoint, read_json, require_credential};
use crate::{
    ConversationTurn, LlmError, ModelConfig, ModelResponse, Provider, Role, ToolCall,
    ToolDefinition, Usage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialStore>,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client, base_url: &str, credentials: Arc<CredentialStore>) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            credentials,
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn complete(
        &self,
        turns: &[ConversationTurn],
        config: &ModelConfig,
        tools: &[ToolDefinition],
    ) -> Result<ModelResponse, LlmError> {
        let api_key = require_credential(&self.credentials, Provider::Anthropic, config)?;
        let payload = build_request(turns, config, tools);

        let response = self
            .client
            .post(endpoint(&self.base_url, "v1/messages"))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .send()
            .await?;
        let body = read_json(Provider::Anthropic, response).await?;
        parse_response(config, &body)
    }
}

fn message_for(turn: &ConversationTurn) -> serde_json::Value {
    match turn.role {
        Role::Assistant => {
            let mut blocks = Vec::new();
            if !turn.content.is_empty() {
                blocks.push(json!({"type": "text", "text": turn.content}));
            }
            if let Some(call) = &turn.tool_call {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.arguments,
                }));
            }
            json!({"role": "assistant", "content": blocks})
        }
        Role::Tool => json!({
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": turn.tool_call_id.clone().unwrap_or_default(),
                "content": turn.content,
            }]
        }),
        Role::User | Role::System => json!({"role": "user", "content": turn.content}),
    }
}

/// The system turn travels in the top-level `system` field; everything else
/// becomes a message.
pub(crate) fn build_request(
    turns: &[ConversationTurn],
    config: &ModelConfig,
    tools: &[ToolDefinition],
) -> serde_json::Value {
    let (system, rest) = match turns.first() {
        Some(first) if first.role == Role::System => (Some(first.content.clone()), &turns[1..]),
        _ => (None, turns),
    };

    let mut payload = json!({
        "model": config.model_id,
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
        "messages": rest.iter().map(message_for).collect::<Vec<_>>(),
    });
    if let Some(system) = system {
        payload["system"] = json!(system);
    }
    if let Some(top_p) = config.top_p {
        payload["top_p"] = json!(top_p);
    }
    if !tools.is_empty() {
        payload["tools"] = json!(
            tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                }))
                .collect::<Vec<_>>()
        );
    }
    payload
}

pub(crate) fn parse_response(
    config: &ModelConfig,
    body: &serde_json::Value,
) -> Result<ModelResponse, LlmError> {
    let blocks = body
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| LlmError::invalid_response(Provider::Anthropic.as_str(), "missing content"))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                    text.push_str(t);
                }
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                if name.is_empty() {
                    continue;
                }
                tool_calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(|id| id.as_str())
                        .map(ToString::to_string)
                        .unwrap_or_else(|| format!("call_{name}")),
                    name: name.to_string(),
                    arguments: block.get("input").cloned().unwrap_or_else(|| json!({})),
                });
            }
            _ => {}
        }
    }
    if tool_calls.len() > 1 {
        debug!(count = tool_calls.len(), "anthropic returned several tool calls; keeping the first");
    }

    let usage = body.get("usage").map(|usage| {
        Usage::new(
            usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        )
    });

    Ok(ModelResponse {
        content: text,
        model: body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&config.model_id)
            .to_string(),
        usage,
        tool_call: tool_calls.into_iter().next(),
    })
}
