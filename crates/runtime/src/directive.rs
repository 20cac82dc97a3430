//! The action a decision produces for one event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use conductor_jobs::JobOptions;
use conductor_llm::extract_json_output;

use crate::DispatchError;

fn default_response_type() -> String {
    "text".to_string()
}

/// Wire shape: an object tagged by `action`.  Unknown or unparsable model
/// output never fails; it becomes a [`ActionDirective::SendResponse`] with
/// the raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionDirective {
    #[serde(alias = "callCapability", alias = "callFunction", alias = "call_function")]
    CallCapability {
        name: String,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        context: Value,
    },
    #[serde(alias = "scheduleWork", alias = "scheduleJob", alias = "schedule_job")]
    ScheduleWork {
        name: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        options: JobOptions,
    },
    #[serde(alias = "sendResponse", alias = "respond")]
    SendResponse {
        content: Value,
        #[serde(
            rename = "responseType",
            alias = "response_type",
            default = "default_response_type"
        )]
        response_type: String,
    },
    #[serde(alias = "noOp", alias = "noop", alias = "none")]
    NoOp {
        #[serde(default)]
        reason: String,
    },
}

impl ActionDirective {
    /// Parse model output.  Shape mismatches coerce to `SendResponse`.
    pub fn parse(raw: &str) -> Self {
        extract_json_output::<ActionDirective>(raw).unwrap_or_else(|| Self::respond_text(raw))
    }

    pub fn respond_text(text: impl Into<String>) -> Self {
        ActionDirective::SendResponse {
            content: Value::String(text.into()),
            response_type: default_response_type(),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            ActionDirective::CallCapability { .. } => "call_capability",
            ActionDirective::ScheduleWork { .. } => "schedule_work",
            ActionDirective::SendResponse { .. } => "send_response",
            ActionDirective::NoOp { .. } => "no_op",
        }
    }

    /// Checks that parse cannot express: non-empty names and object params.
    pub fn validate(&self) -> Result<(), DispatchError> {
        match self {
            ActionDirective::CallCapability { name, params, .. } => {
                if name.trim().is_empty() {
                    return Err(DispatchError::InvalidDirective(
                        "call_capability without a capability name".into(),
                    ));
                }
                if !(params.is_object() || params.is_null()) {
                    return Err(DispatchError::InvalidDirective(format!(
                        "params for {name} must be an object"
                    )));
                }
                Ok(())
            }
            ActionDirective::ScheduleWork { name, .. } if name.trim().is_empty() => Err(
                DispatchError::InvalidDirective("schedule_work without a job name".into()),
            ),
            _ => Ok(()),
        }
    }
}
