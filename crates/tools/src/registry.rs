//! The capability registry: a name-keyed set of handlers behind one
//! synchronized entry point.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use conductor_config::CredentialStore;

use crate::{Capability, CapabilityContext, CapabilityError, CapabilitySpec};

#[derive(Clone)]
struct Entry {
    spec: CapabilitySpec,
    handler: Arc<dyn Capability>,
}

/// Shared by `Arc`.  Lookups clone the handler out of the lock, so no lock
/// is held while a capability runs.
pub struct CapabilityRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    credentials: Arc<CredentialStore>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(Arc::new(CredentialStore::default()))
    }
}

impl CapabilityRegistry {
    pub fn new(credentials: Arc<CredentialStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            credentials,
        }
    }

    /// Add a capability.  An existing name is never overwritten.
    pub fn register(&self, capability: Arc<dyn Capability>) -> Result<(), CapabilityError> {
        let spec = capability.spec();
        if spec.name.trim().is_empty() {
            return Err(CapabilityError::invalid_params("", "capability name is empty"));
        }

        let mut entries = self.write();
        if entries.contains_key(&spec.name) {
            return Err(CapabilityError::DuplicateCapability(spec.name));
        }
        info!(capability = %spec.name, "capability registered");
        entries.insert(
            spec.name.clone(),
            Entry {
                spec,
                handler: capability,
            },
        );
        Ok(())
    }

    /// Insert or overwrite.  Returns the spec that was replaced, if any.
    pub fn replace(&self, capability: Arc<dyn Capability>) -> Option<CapabilitySpec> {
        let spec = capability.spec();
        let previous = self.write().insert(
            spec.name.clone(),
            Entry {
                spec: spec.clone(),
                handler: capability,
            },
        );
        info!(capability = %spec.name, replaced = previous.is_some(), "capability replaced");
        previous.map(|e| e.spec)
    }

    pub fn unregister(&self, name: &str) -> Result<CapabilitySpec, CapabilityError> {
        let removed = self
            .write()
            .remove(name)
            .map(|e| e.spec)
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;
        info!(capability = name, "capability unregistered");
        Ok(removed)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Capability>, CapabilityError> {
        self.read()
            .get(name)
            .map(|e| e.handler.clone())
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))
    }

    pub fn spec(&self, name: &str) -> Option<CapabilitySpec> {
        self.read().get(name).map(|e| e.spec.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_specs(&self) -> Vec<CapabilitySpec> {
        let mut specs: Vec<CapabilitySpec> = self.read().values().map(|e| e.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// `{name, description, parameterSchema}` for every capability.
    pub fn model_schemas(&self) -> Vec<Value> {
        self.list_specs()
            .iter()
            .map(CapabilitySpec::to_model_schema)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Validate params, resolve the declared credential, then run the
    /// handler.  A missing credential fails before the handler is touched.
    pub async fn invoke(
        &self,
        name: &str,
        params: Value,
        ctx: CapabilityContext,
    ) -> Result<Value, CapabilityError> {
        let entry = self
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;

        let params = match params {
            Value::Null => Value::Object(serde_json::Map::new()),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(CapabilityError::invalid_params(
                    name,
                    format!("params must be an object, got {}", json_kind(&other)),
                ));
            }
        };
        for required in entry.spec.required_params() {
            if params.get(&required).is_none_or(Value::is_null) {
                return Err(CapabilityError::invalid_params(
                    name,
                    format!("missing required param: {required}"),
                ));
            }
        }

        let ctx = match entry.spec.required_credential.as_deref() {
            Some(credential) => match self.credentials.next(credential) {
                Some(key) => ctx.with_credential(key),
                None => {
                    warn!(capability = name, credential, "credential missing");
                    return Err(CapabilityError::CredentialMissing {
                        capability: name.to_string(),
                        credential: credential.to_string(),
                    });
                }
            },
            None => ctx,
        };

        let started = Instant::now();
        let result = entry.handler.invoke(params, &ctx).await;
        debug!(
            capability = name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "capability invoked"
        );
        result.map_err(|source| CapabilityError::Handler {
            capability: name.to_string(),
            source,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
