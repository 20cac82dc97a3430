use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod error;
mod registry;

pub mod builtins;

pub use error::CapabilityError;
pub use registry::CapabilityRegistry;

// ── Capability description ───────────────────────────────────────────────────

/// JSON-friendly type hint for a capability parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn as_str(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// Describes a single parameter that a capability accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityParam {
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub param_type: ParamType,
    /// Allowed values when the parameter is an enum.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl CapabilityParam {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            ..Default::default()
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
            ..Default::default()
        }
    }

    pub fn of_type(mut self, param_type: ParamType) -> Self {
        self.param_type = param_type;
        self
    }

    pub fn one_of<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Static metadata about a capability: what the model sees, plus the
/// credential and model preferences the registry honours.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<CapabilityParam>,
    /// Raw JSON Schema used instead of `params` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_credential: Option<String>,
    /// Registered model id that answers after this capability ran in a
    /// tool round, unless the caller named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
}

impl CapabilitySpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, param: CapabilityParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Derive the parameter schema from a `JsonSchema` type.
    pub fn with_schema_for<T: JsonSchema>(self) -> Self {
        let mut schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
        if let Some(obj) = schema.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
        }
        self.with_schema(schema)
    }

    pub fn requires_credential(mut self, name: impl Into<String>) -> Self {
        self.required_credential = Some(name.into());
        self
    }

    pub fn prefers_model(mut self, model_id: impl Into<String>) -> Self {
        self.preferred_model = Some(model_id.into());
        self
    }

    /// JSON Schema of the params object.
    pub fn parameter_schema(&self) -> Value {
        if let Some(schema) = &self.schema {
            return schema.clone();
        }

        let mut properties = serde_json::Map::new();
        let mut required: Vec<String> = Vec::new();
        for p in &self.params {
            let mut prop = serde_json::json!({
                "type": p.param_type.as_str(),
                "description": p.description,
            });
            if !p.enum_values.is_empty() {
                prop["enum"] = serde_json::json!(p.enum_values);
            }
            if let Some(default) = &p.default {
                prop["default"] = default.clone();
            }
            properties.insert(p.name.clone(), prop);
            if p.required {
                required.push(p.name.clone());
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Names listed under `required` in the parameter schema.
    pub fn required_params(&self) -> Vec<String> {
        self.parameter_schema()
            .get("required")
            .and_then(|r| r.as_array())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(ToString::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `{name, description, parameterSchema}` as handed to the model layer.
    pub fn to_model_schema(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameterSchema": self.parameter_schema(),
        })
    }
}

// ── Invocation ───────────────────────────────────────────────────────────────

/// Caller context handed to a capability.  The credential is filled in by
/// the registry when the capability declares one.
#[derive(Clone, Default)]
pub struct CapabilityContext {
    values: serde_json::Map<String, Value>,
    credential: Option<String>,
}

impl CapabilityContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context from a JSON object.  Anything else yields an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(values) => Self {
                values,
                credential: None,
            },
            _ => Self::default(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &serde_json::Map<String, Value> {
        &self.values
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub(crate) fn with_credential(mut self, credential: String) -> Self {
        self.credential = Some(credential);
        self
    }
}

impl fmt::Debug for CapabilityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityContext")
            .field("values", &self.values)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Trait implemented by every capability.
#[async_trait]
pub trait Capability: Send + Sync {
    fn spec(&self) -> CapabilitySpec;
    async fn invoke(&self, params: Value, ctx: &CapabilityContext) -> anyhow::Result<Value>;
}

type BoxedHandler = dyn Fn(Value, CapabilityContext) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>
    + Send
    + Sync;

/// Closure-backed capability for static registration lists.
#[derive(Clone)]
pub struct FnCapability {
    spec: CapabilitySpec,
    handler: Arc<BoxedHandler>,
}

impl FnCapability {
    pub fn new<F, Fut>(spec: CapabilitySpec, handler: F) -> Self
    where
        F: Fn(Value, CapabilityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            spec,
            handler: Arc::new(move |params, ctx| Box::pin(handler(params, ctx))),
        }
    }

    /// Wrap a synchronous function.
    pub fn sync<F>(spec: CapabilitySpec, handler: F) -> Self
    where
        F: Fn(Value, &CapabilityContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(spec, move |params, ctx| {
            let handler = handler.clone();
            async move { handler(params, &ctx) }
        })
    }
}

#[async_trait]
impl Capability for FnCapability {
    fn spec(&self) -> CapabilitySpec {
        self.spec.clone()
    }

    async fn invoke(&self, params: Value, ctx: &CapabilityContext) -> anyhow::Result<Value> {
        (self.handler)(params, ctx.clone()).await
    }
}
