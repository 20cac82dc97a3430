//! Built-in capability implementations.

mod clock;
mod web;

pub use clock::CurrentTimeCapability;
pub use web::WebSearchCapability;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    Capability, CapabilityContext, CapabilityError, CapabilityParam, CapabilityRegistry,
    CapabilitySpec,
};

/// Returns its `message` param together with the caller context.
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn spec(&self) -> CapabilitySpec {
        CapabilitySpec::new("echo", "Return the given message unchanged.")
            .param(CapabilityParam::required("message", "Text to echo back"))
    }

    async fn invoke(&self, params: Value, ctx: &CapabilityContext) -> anyhow::Result<Value> {
        Ok(json!({
            "message": params.get("message").cloned().unwrap_or(Value::Null),
            "context": ctx.values(),
        }))
    }
}

/// Every built-in capability.
pub fn all() -> Vec<Arc<dyn Capability>> {
    vec![
        Arc::new(EchoCapability),
        Arc::new(CurrentTimeCapability),
        Arc::new(WebSearchCapability::default()),
    ]
}

/// Register every built-in, stopping at the first collision.
pub fn register_all(registry: &CapabilityRegistry) -> Result<(), CapabilityError> {
    for capability in all() {
        registry.register(capability)?;
    }
    Ok(())
}
