//! Single-round tool calling.
//!
//! Sends the conversation with tool definitions; when the model answers with
//! a tool call, executes it, appends the assistant tool-call turn and a
//! `tool` turn carrying the result, and asks the model once more with tools
//! withheld.  There is never a second round.
//!
//! The follow-up goes to the capability's preferred model when the caller
//! named none and that model is registered.

use serde_json::{Value, json};
use tracing::{debug, info};

use conductor_llm::{ConversationTurn, ModelConfigPatch, ModelRegistry, ModelResponse, ToolDefinition};
use conductor_tools::{CapabilityContext, CapabilityRegistry, CapabilitySpec};

use crate::DispatchError;

/// What to do when the requested capability fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorPolicy {
    /// Hand `{"error": ...}` to the model as the tool result.
    ReportToModel,
    /// Stop and return the capability error.
    Abort,
}

#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub capability: String,
    pub params: Value,
    pub result: Value,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct ToolRound {
    /// The final model response (the follow-up when a tool ran).
    pub response: ModelResponse,
    pub execution: Option<ToolExecution>,
    /// Number of model calls made: 1 or 2.
    pub model_calls: usize,
}

pub fn tool_definition(spec: &CapabilitySpec) -> ToolDefinition {
    ToolDefinition {
        name: spec.name.clone(),
        description: spec.description.clone(),
        parameters: spec.parameter_schema(),
    }
}

/// Tool definitions for every registered capability, or only `names` when
/// given.  Unknown names are `NotFound`.
pub fn tool_definitions(
    registry: &CapabilityRegistry,
    names: Option<&[String]>,
) -> Result<Vec<ToolDefinition>, DispatchError> {
    match names {
        None => Ok(registry.list_specs().iter().map(tool_definition).collect()),
        Some(names) => names
            .iter()
            .map(|name| {
                registry
                    .spec(name)
                    .map(|spec| tool_definition(&spec))
                    .ok_or_else(|| conductor_tools::CapabilityError::NotFound(name.clone()).into())
            })
            .collect(),
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn resolve_tool_call(
    models: &ModelRegistry,
    capabilities: &CapabilityRegistry,
    mut turns: Vec<ConversationTurn>,
    overrides: Option<&ModelConfigPatch>,
    model_id: Option<&str>,
    tools: &[ToolDefinition],
    ctx: CapabilityContext,
    policy: ToolErrorPolicy,
) -> Result<ToolRound, DispatchError> {
    let first = models
        .send_with_tools(&turns, overrides, model_id, tools)
        .await?;

    let Some(call) = first.tool_call.clone() else {
        return Ok(ToolRound {
            response: first,
            execution: None,
            model_calls: 1,
        });
    };

    info!(capability = %call.name, call_id = %call.id, "model requested a capability");
    let outcome = capabilities
        .invoke(&call.name, call.arguments.clone(), ctx)
        .await;
    let (result, success) = match outcome {
        Ok(value) => (value, true),
        Err(err) if policy == ToolErrorPolicy::ReportToModel => {
            debug!(capability = %call.name, error = %err, "reporting capability failure to the model");
            (json!({ "error": err.to_string() }), false)
        }
        Err(err) => return Err(err.into()),
    };

    turns.push(ConversationTurn::assistant_tool_call(first.content.clone(), call.clone()));
    turns.push(ConversationTurn::tool_result(&call, result.to_string()));

    let follow_up_model = match model_id {
        Some(id) => Some(id.to_string()),
        None => preferred_model(models, capabilities, &call.name),
    };
    let follow_up = models
        .send(&turns, overrides, follow_up_model.as_deref())
        .await?;
    if follow_up.tool_call.is_some() {
        debug!("follow-up response requested another tool; ignoring");
    }

    Ok(ToolRound {
        response: follow_up,
        execution: Some(ToolExecution {
            capability: call.name,
            params: call.arguments,
            result,
            success,
        }),
        model_calls: 2,
    })
}

fn preferred_model(models: &ModelRegistry, capabilities: &CapabilityRegistry, name: &str) -> Option<String> {
    let preferred = capabilities.spec(name)?.preferred_model?;
    if models.get(&preferred).is_none() {
        debug!(capability = name, model = %preferred, "preferred model is not registered");
        return None;
    }
    debug!(capability = name, model = %preferred, "follow-up on the capability's preferred model");
    Some(preferred)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use conductor_config::LlmConfig;
    use conductor_llm::{LlmError, ModelConfig, Provider, ProviderAdapter, Role, ToolCall};
    use conductor_tools::FnCapability;

    use super::*;

    /// Replies with a tool call whenever tools are offered, text otherwise.
    #[derive(Default)]
    struct ToolHappy {
        seen: Mutex<Vec<(Vec<ConversationTurn>, usize)>>,
    }

    #[async_trait]
    impl ProviderAdapter for ToolHappy {
        async fn complete(
            &self,
            turns: &[ConversationTurn],
            config: &ModelConfig,
            tools: &[ToolDefinition],
        ) -> Result<ModelResponse, LlmError> {
            self.seen.lock().unwrap().push((turns.to_vec(), tools.len()));
            if tools.is_empty() {
                let last = turns.last().map(|t| t.content.clone()).unwrap_or_default();
                return Ok(ModelResponse::text(&config.model_id, format!("final: {last}")));
            }
            Ok(ModelResponse {
                tool_call: Some(ToolCall {
                    id: "call-1".into(),
                    name: tools[0].name.clone(),
                    arguments: json!({"x": 5}),
                }),
                ..ModelResponse::text(&config.model_id, "")
            })
        }
    }

    fn setup(fail: bool) -> (Arc<ToolHappy>, ModelRegistry, CapabilityRegistry) {
        let adapter = Arc::new(ToolHappy::default());
        let models = ModelRegistry::new(ModelConfig::from_llm_config(&LlmConfig::default()))
            .with_adapter(Provider::OpenAi, adapter.clone());
        let capabilities = CapabilityRegistry::default();
        capabilities
            .register(Arc::new(FnCapability::sync(
                CapabilitySpec::new("double", "Double x"),
                move |params, _| {
                    if fail {
                        anyhow::bail!("double is broken");
                    }
                    Ok(json!(params["x"].as_i64().unwrap_or(0) * 2))
                },
            )))
            .unwrap();
        (adapter, models, capabilities)
    }

    #[tokio::test]
    async fn one_round_then_text() {
        let (adapter, models, capabilities) = setup(false);
        let tools = tool_definitions(&capabilities, None).unwrap();
        let round = resolve_tool_call(
            &models,
            &capabilities,
            vec![ConversationTurn::user("double 5")],
            None,
            None,
            &tools,
            CapabilityContext::new(),
            ToolErrorPolicy::ReportToModel,
        )
        .await
        .unwrap();

        assert_eq!(round.model_calls, 2);
        assert_eq!(round.response.content, "final: 10");
        let exec = round.execution.unwrap();
        assert!(exec.success);
        assert_eq!(exec.result, json!(10));

        let seen = adapter.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, 1);
        assert_eq!(seen[1].1, 0, "tools are withheld on the follow-up");
        let follow_up = &seen[1].0;
        assert_eq!(follow_up[follow_up.len() - 2].role, Role::Assistant);
        assert_eq!(follow_up[follow_up.len() - 1].tool_call_id.as_deref(), Some("call-1"));
    }

    #[tokio::test]
    async fn failure_is_reported_to_model() {
        let (_, models, capabilities) = setup(true);
        let tools = tool_definitions(&capabilities, None).unwrap();
        let round = resolve_tool_call(
            &models,
            &capabilities,
            vec![ConversationTurn::user("double 5")],
            None,
            None,
            &tools,
            CapabilityContext::new(),
            ToolErrorPolicy::ReportToModel,
        )
        .await
        .unwrap();
        let exec = round.execution.unwrap();
        assert!(!exec.success);
        assert!(exec.result["error"].as_str().unwrap().contains("double is broken"));
        assert!(round.response.content.contains("double is broken"));
    }

    #[tokio::test]
    async fn failure_aborts_when_asked() {
        let (adapter, models, capabilities) = setup(true);
        let tools = tool_definitions(&capabilities, None).unwrap();
        let err = resolve_tool_call(
            &models,
            &capabilities,
            vec![ConversationTurn::user("double 5")],
            None,
            None,
            &tools,
            CapabilityContext::new(),
            ToolErrorPolicy::Abort,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Capability(_)));
        assert_eq!(adapter.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_tools_means_single_call() {
        let (adapter, models, capabilities) = setup(false);
        let round = resolve_tool_call(
            &models,
            &capabilities,
            vec![ConversationTurn::user("hello")],
            None,
            None,
            &[],
            CapabilityContext::new(),
            ToolErrorPolicy::ReportToModel,
        )
        .await
        .unwrap();
        assert_eq!(round.model_calls, 1);
        assert!(round.execution.is_none());
        assert_eq!(adapter.seen.lock().unwrap().len(), 1);
    }

    async fn run_one(
        models: &ModelRegistry,
        capabilities: &CapabilityRegistry,
        name: &str,
        model_id: Option<&str>,
    ) -> ToolRound {
        let tools = tool_definitions(capabilities, Some(&[name.to_string()])).unwrap();
        resolve_tool_call(
            models,
            capabilities,
            vec![ConversationTurn::user("go")],
            None,
            model_id,
            &tools,
            CapabilityContext::new(),
            ToolErrorPolicy::ReportToModel,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn follow_up_uses_the_preferred_model() {
        let (_, models, capabilities) = setup(false);
        models.register(
            "summarizer",
            ModelConfig {
                model_id: "summarizer-v1".into(),
                ..models.base().clone()
            },
        );
        capabilities
            .register(Arc::new(FnCapability::sync(
                CapabilitySpec::new("triple", "Triple x").prefers_model("summarizer"),
                |params, _| Ok(json!(params["x"].as_i64().unwrap_or(0) * 3)),
            )))
            .unwrap();
        capabilities
            .register(Arc::new(FnCapability::sync(
                CapabilitySpec::new("halve", "Halve x").prefers_model("unregistered"),
                |params, _| Ok(json!(params["x"].as_i64().unwrap_or(0) / 2)),
            )))
            .unwrap();

        let base = models.base().model_id.clone();
        let answered_by = |round: ToolRound| round.response.model;
        assert_eq!(
            answered_by(run_one(&models, &capabilities, "triple", None).await),
            "summarizer-v1"
        );
        assert_eq!(answered_by(run_one(&models, &capabilities, "halve", None).await), base);
        models.register("pinned", models.base().clone());
        assert_eq!(
            answered_by(run_one(&models, &capabilities, "triple", Some("pinned")).await),
            base
        );
    }

    #[test]
    fn named_definitions_reject_unknown() {
        let (_, _, capabilities) = setup(false);
        let names = vec!["double".to_string()];
        assert_eq!(tool_definitions(&capabilities, Some(&names)).unwrap().len(), 1);
        let unknown = vec!["ghost".to_string()];
        assert!(tool_definitions(&capabilities, Some(&unknown)).is_err());
    }
}
