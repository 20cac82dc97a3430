//! Model registry and provider adapters.
//!
//! [`ModelRegistry`] maps model ids to [`ModelConfig`]s, owns the
//! distinguished `masterModel` entry, and dispatches each call to the
//! [`providers::ProviderAdapter`] selected by the config's provider.

mod error;
mod model;
pub mod providers;
mod registry;
mod types;

pub use error::LlmError;
pub use model::{ModelConfig, ModelConfigPatch, Provider};
pub use providers::ProviderAdapter;
pub use registry::{ModelRegistry, default_master_prompt, prepare_turns};
pub use types::{ConversationTurn, ModelResponse, Role, ToolCall, ToolDefinition, Usage};

/// Locate a JSON value inside model prose.
///
/// A fenced ` ```json ` block wins; otherwise the span from the first `{` to
/// the last `}` is tried.  Returns `None` when neither parses as `T`.
///
/// ```rust
/// use conductor_llm::extract_json_output;
///
/// let raw = "Sure!\n```json\n{\"action\":\"no_op\",\"reason\":\"idle\"}\n```";
/// let value: serde_json::Value = extract_json_output(raw).unwrap();
/// assert_eq!(value["action"], "no_op");
/// ```
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after_fence.find("```") {
            if let Ok(val) = serde_json::from_str(after_fence[..fence_end].trim()) {
                return Some(val);
            }
        }
    }

    let trimmed = response.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}
