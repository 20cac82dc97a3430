//! The decision engine: routes each event to the master model or a
//! deterministic handler, executes the resulting directive, replies and
//! acknowledges exactly once.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use lru::LruCache;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use conductor_config::{AppConfig, MASTER_MODEL_ID};
use conductor_jobs::{JobOptions, JobSubmitter};
use conductor_llm::{ConversationTurn, ModelConfigPatch, ModelRegistry, ModelResponse};
use conductor_tools::{Capability, CapabilityContext, CapabilityError, CapabilityRegistry, CapabilitySpec};

use crate::prompt::{event_context_turn, instruction_turn};
use crate::tool_loop::{ToolErrorPolicy, resolve_tool_call, tool_definitions};
use crate::{Acknowledgment, ActionDirective, DispatchError, Event, EventGateway, OutboundResponse};

const DEFAULT_MAX_CONCURRENT: usize = 8;
const DEFAULT_DEDUP_WINDOW: usize = 1024;

/// Lifecycle of one event.  `Errored` absorbs from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Received,
    Routed,
    Executing,
    Responding,
    Acknowledged,
    Errored,
}

fn transition(event_id: &str, state: EventState) {
    debug!(event_id, ?state, "event state");
}

/// Result of processing plus the response type it should be surfaced as.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled {
    pub result: Value,
    pub response_type: String,
}

impl Handled {
    pub fn result(result: Value) -> Self {
        Self {
            result,
            response_type: "result".to_string(),
        }
    }
}

/// What was emitted for an event, kept for redelivery.
#[derive(Debug, Clone)]
struct Outcome {
    response: Option<OutboundResponse>,
    ack: Acknowledgment,
}

enum Admission {
    Fresh,
    Replay(Outcome),
    InFlight,
}

struct Tracking {
    seen: Option<LruCache<String, Outcome>>,
    in_flight: HashSet<String>,
}

struct Inner {
    capabilities: Arc<CapabilityRegistry>,
    models: Option<Arc<ModelRegistry>>,
    jobs: Option<Arc<dyn JobSubmitter>>,
    gateway: Arc<dyn EventGateway>,
    master_enabled: bool,
    master_permits: Option<Semaphore>,
    tracking: Mutex<Tracking>,
}

pub struct DispatcherBuilder {
    capabilities: Arc<CapabilityRegistry>,
    gateway: Arc<dyn EventGateway>,
    models: Option<Arc<ModelRegistry>>,
    jobs: Option<Arc<dyn JobSubmitter>>,
    master_enabled: bool,
    max_concurrent: usize,
    dedup_window: usize,
}

impl DispatcherBuilder {
    pub fn models(mut self, models: Arc<ModelRegistry>) -> Self {
        self.models = Some(models);
        self
    }

    pub fn jobs(mut self, jobs: Arc<dyn JobSubmitter>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// `max_concurrent == 0` leaves master calls unbounded.
    pub fn master(mut self, enabled: bool, max_concurrent: usize) -> Self {
        self.master_enabled = enabled;
        self.max_concurrent = max_concurrent;
        self
    }

    /// `0` disables redelivery detection.
    pub fn dedup_window(mut self, window: usize) -> Self {
        self.dedup_window = window;
        self
    }

    /// Apply the `[master]` and `[dispatch]` sections.
    pub fn configure(self, config: &AppConfig) -> Self {
        self.master(config.master.enabled, config.master.max_concurrent)
            .dedup_window(config.dispatch.dedup_window)
    }

    pub fn build(self) -> Dispatcher {
        let master_permits = (self.max_concurrent > 0).then(|| Semaphore::new(self.max_concurrent));
        let seen = NonZeroUsize::new(self.dedup_window).map(LruCache::new);
        Dispatcher {
            inner: Arc::new(Inner {
                capabilities: self.capabilities,
                models: self.models,
                jobs: self.jobs,
                gateway: self.gateway,
                master_enabled: self.master_enabled,
                master_permits,
                tracking: Mutex::new(Tracking {
                    seen,
                    in_flight: HashSet::new(),
                }),
            }),
        }
    }
}

/// Cheap to clone; every clone shares registries, gateway and dedup state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn builder(capabilities: Arc<CapabilityRegistry>, gateway: Arc<dyn EventGateway>) -> DispatcherBuilder {
        DispatcherBuilder {
            capabilities,
            gateway,
            models: None,
            jobs: None,
            master_enabled: true,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.capabilities
    }

    pub fn models(&self) -> Option<&Arc<ModelRegistry>> {
        self.inner.models.as_ref()
    }

    /// Whether non-internal events are decided by the master model.
    pub fn master_available(&self) -> bool {
        self.inner.master_enabled && self.inner.models.is_some()
    }

    /// Register a capability at runtime and regenerate the master prompt.
    pub fn register_capability(&self, capability: Arc<dyn Capability>) -> Result<(), CapabilityError> {
        self.inner.capabilities.register(capability)?;
        self.refresh_master_prompt();
        Ok(())
    }

    pub fn unregister_capability(&self, name: &str) -> Result<CapabilitySpec, CapabilityError> {
        let spec = self.inner.capabilities.unregister(name)?;
        self.refresh_master_prompt();
        Ok(spec)
    }

    fn refresh_master_prompt(&self) {
        if let Some(models) = &self.inner.models {
            models.refresh_master_prompt(&self.inner.capabilities.names());
        }
    }

    /// Handle `event` on its own task.
    pub fn spawn(&self, event: Event) -> JoinHandle<Acknowledgment> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.handle(event).await })
    }

    /// Consume events until the sender side closes, one task per event.
    /// Returns once every spawned event has been acknowledged.
    pub async fn run(&self, mut events: mpsc::Receiver<Event>) {
        let mut tasks = JoinSet::new();
        while let Some(event) = events.recv().await {
            let dispatcher = self.clone();
            tasks.spawn(async move {
                dispatcher.handle(event).await;
            });
            while tasks.try_join_next().is_some() {}
        }
        while tasks.join_next().await.is_some() {}
        info!("event stream closed; dispatcher drained");
    }

    /// Process one event end to end.  Exactly one acknowledgment is sent to
    /// the gateway and also returned.
    pub async fn handle(&self, event: Event) -> Acknowledgment {
        let event_id = event.id.clone();
        match self.admit(&event_id) {
            Admission::Fresh => {}
            Admission::Replay(previous) => {
                info!(event_id = %event_id, "redelivered event; re-emitting stored acknowledgment");
                if let Some(response) = previous.response {
                    self.deliver_response(response).await;
                }
                self.deliver_ack(previous.ack.clone()).await;
                return previous.ack;
            }
            Admission::InFlight => {
                let ack = Acknowledgment::pending(&event_id, "event is already being processed");
                self.deliver_ack(ack.clone()).await;
                return ack;
            }
        }

        transition(&event_id, EventState::Received);
        let processed = match AssertUnwindSafe(self.process(&event)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(DispatchError::Panicked(panic_message(panic.as_ref()))),
        };

        let outcome = match processed {
            Ok(handled) => {
                transition(&event_id, EventState::Responding);
                let response = event.reply_target.as_ref().map(|target| OutboundResponse {
                    response_type: handled.response_type.clone(),
                    payload: handled.result.clone(),
                    correlation_id: Some(event_id.clone()),
                    reply_target: Some(target.clone()),
                    metadata: event.metadata.clone(),
                });
                Outcome {
                    response,
                    ack: Acknowledgment::success(&event_id, handled.result),
                }
            }
            Err(err) => {
                transition(&event_id, EventState::Errored);
                error!(event_id = %event_id, event_type = %event.event_type, kind = err.kind(), error = %err, "event failed");
                let response = event.reply_target.as_ref().map(|target| OutboundResponse {
                    response_type: "error".to_string(),
                    payload: json!({ "error": err.to_string() }),
                    correlation_id: Some(event_id.clone()),
                    reply_target: Some(target.clone()),
                    metadata: event.metadata.clone(),
                });
                Outcome {
                    response,
                    ack: Acknowledgment::error(&event_id, err.kind(), err.to_string()),
                }
            }
        };

        if let Some(response) = outcome.response.clone() {
            self.deliver_response(response).await;
        }
        self.deliver_ack(outcome.ack.clone()).await;
        transition(&event_id, EventState::Acknowledged);

        let ack = outcome.ack.clone();
        self.settle(event_id, outcome);
        ack
    }

    fn tracking(&self) -> std::sync::MutexGuard<'_, Tracking> {
        self.inner.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, event_id: &str) -> Admission {
        let mut tracking = self.tracking();
        if let Some(previous) = tracking.seen.as_mut().and_then(|seen| seen.get(event_id)) {
            return Admission::Replay(previous.clone());
        }
        if !tracking.in_flight.insert(event_id.to_string()) {
            return Admission::InFlight;
        }
        Admission::Fresh
    }

    fn settle(&self, event_id: String, outcome: Outcome) {
        let mut tracking = self.tracking();
        tracking.in_flight.remove(&event_id);
        if let Some(seen) = tracking.seen.as_mut() {
            seen.put(event_id, outcome);
        }
    }

    async fn deliver_response(&self, response: OutboundResponse) {
        let correlation = response.correlation_id.clone().unwrap_or_default();
        if let Err(err) = self.inner.gateway.send_response(response).await {
            warn!(event_id = %correlation, error = %err, "gateway rejected response");
        }
    }

    async fn deliver_ack(&self, ack: Acknowledgment) {
        let event_id = ack.event_id.clone();
        if let Err(err) = self.inner.gateway.send_acknowledgment(ack).await {
            error!(event_id = %event_id, error = %err, "gateway rejected acknowledgment");
        }
    }

    async fn process(&self, event: &Event) -> Result<Handled, DispatchError> {
        transition(&event.id, EventState::Routed);
        if !event.is_internal() {
            match self.master_models() {
                Some(models) => {
                    transition(&event.id, EventState::Executing);
                    match self.decide(event, &models).await {
                        Ok(handled) => return Ok(handled),
                        Err(err) if event.requires_master() => {
                            return Err(DispatchError::MasterModelFailure(err.to_string()));
                        }
                        Err(err) => {
                            warn!(
                                event_id = %event.id,
                                event_type = %event.event_type,
                                error = %err,
                                "master model failed; falling back to deterministic routing"
                            );
                        }
                    }
                }
                None if event.requires_master() => {
                    return Err(DispatchError::ComponentUnavailable("master model".into()));
                }
                None => {}
            }
        }
        transition(&event.id, EventState::Executing);
        self.route(event).await
    }

    fn master_models(&self) -> Option<Arc<ModelRegistry>> {
        if !self.inner.master_enabled {
            return None;
        }
        self.inner.models.clone()
    }

    /// Ask the master model what to do and carry it out.
    async fn decide(&self, event: &Event, models: &ModelRegistry) -> Result<Handled, DispatchError> {
        let _permit = match &self.inner.master_permits {
            Some(permits) => Some(
                permits
                    .acquire()
                    .await
                    .map_err(|_| DispatchError::ComponentUnavailable("master model permits".into()))?,
            ),
            None => None,
        };

        let capabilities = &self.inner.capabilities;
        let names = capabilities.names();
        let master = models.master_config(&names);
        debug!(event_id = %event.id, provider = %master.provider, model = %master.model_id, "consulting master model");

        let turns = vec![event_context_turn(event), instruction_turn(&names)];
        let tools = tool_definitions(capabilities, None)?;
        let round = resolve_tool_call(
            models,
            capabilities,
            turns,
            None,
            Some(MASTER_MODEL_ID),
            &tools,
            event_context(Value::Null, event),
            ToolErrorPolicy::Abort,
        )
        .await?;

        if let Some(execution) = round.execution {
            return Ok(Handled::result(json!({
                "response": round.response.content,
                "capability": execution.capability,
                "capabilityResult": execution.result,
            })));
        }

        let directive = ActionDirective::parse(&round.response.content);
        debug!(event_id = %event.id, action = directive.action(), "master directive");
        self.execute_directive(directive, event).await
    }

    /// Validate and run one directive on behalf of `event`.
    pub async fn execute_directive(
        &self,
        directive: ActionDirective,
        event: &Event,
    ) -> Result<Handled, DispatchError> {
        directive.validate()?;
        match directive {
            ActionDirective::CallCapability { name, params, context } => {
                let result = self
                    .inner
                    .capabilities
                    .invoke(&name, params, event_context(context, event))
                    .await?;
                Ok(Handled::result(json!({
                    "capability": name,
                    "capabilityResult": result,
                })))
            }
            ActionDirective::ScheduleWork { name, data, options } => {
                let handle = self.job_submitter()?.submit(&name, data, options).await?;
                info!(event_id = %event.id, job_id = %handle.id, job = %handle.name, "work scheduled");
                Ok(Handled::result(json!({
                    "jobId": handle.id,
                    "name": handle.name,
                    "status": handle.status,
                })))
            }
            ActionDirective::SendResponse { content, response_type } => Ok(Handled {
                result: content,
                response_type,
            }),
            ActionDirective::NoOp { reason } => Ok(Handled::result(json!({
                "action": "none",
                "reason": reason,
            }))),
        }
    }

    fn job_submitter(&self) -> Result<&Arc<dyn JobSubmitter>, DispatchError> {
        self.inner
            .jobs
            .as_ref()
            .ok_or_else(|| DispatchError::ComponentUnavailable("job submitter".into()))
    }

    fn model_registry(&self) -> Result<&Arc<ModelRegistry>, DispatchError> {
        self.inner
            .models
            .as_ref()
            .ok_or_else(|| DispatchError::ComponentUnavailable("model registry".into()))
    }

    /// Type-based routing for internal events and master fallbacks.
    async fn route(&self, event: &Event) -> Result<Handled, DispatchError> {
        let payload = &event.payload;
        match event.event_type.as_str() {
            "function:execute" => {
                let name = required_str(event, "name")?;
                let params = payload.get("params").cloned().unwrap_or(Value::Null);
                let context = payload.get("context").cloned().unwrap_or(Value::Null);
                let result = self
                    .inner
                    .capabilities
                    .invoke(name, params, event_context(context, event))
                    .await?;
                Ok(Handled::result(result))
            }
            "job:schedule" => {
                let name = required_str(event, "name")?;
                let data = payload.get("data").cloned().unwrap_or(Value::Null);
                let options: JobOptions = match payload.get("options") {
                    None | Some(Value::Null) => JobOptions::default(),
                    Some(raw) => serde_json::from_value(raw.clone())
                        .map_err(|err| DispatchError::InvalidDirective(format!("invalid job options: {err}")))?,
                };
                let handle = self.job_submitter()?.submit(name, data, options).await?;
                Ok(Handled::result(json!(handle)))
            }
            "job:status" => {
                let id = required_str(event, "id")?;
                let status = self.job_submitter()?.status(id).await;
                Ok(Handled::result(json!({ "id": id, "status": status })))
            }
            "job:result" => {
                let id = required_str(event, "id")?;
                let result = self.job_submitter()?.result(id).await?;
                Ok(Handled::result(json!(result)))
            }
            "llm:generate" | "llm:completion" | "llm:chat" => self.route_llm(event).await,
            other => {
                debug!(event_id = %event.id, event_type = other, "no handler for event type");
                Ok(Handled::result(json!({ "received": true, "processed": false })))
            }
        }
    }

    async fn route_llm(&self, event: &Event) -> Result<Handled, DispatchError> {
        let models = self.model_registry()?;
        let payload = &event.payload;
        let model_id = payload.get("modelId").and_then(Value::as_str);
        let overrides: Option<ModelConfigPatch> = match payload.get("config") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value(raw.clone())
                    .map_err(|err| DispatchError::InvalidDirective(format!("invalid model config: {err}")))?,
            ),
        };
        let overrides = overrides.as_ref();

        let response = match event.event_type.as_str() {
            "llm:generate" => models.generate(required_str(event, "prompt")?, overrides, model_id).await?,
            "llm:completion" => models.completion(required_str(event, "prompt")?, overrides, model_id).await?,
            _ => return self.chat(event, models, overrides, model_id).await,
        };
        Ok(Handled::result(response_value(&response)))
    }

    /// `llm:chat`, with one round of tool calling when `payload.tools` is
    /// `true` or a list of capability names.
    async fn chat(
        &self,
        event: &Event,
        models: &ModelRegistry,
        overrides: Option<&ModelConfigPatch>,
        model_id: Option<&str>,
    ) -> Result<Handled, DispatchError> {
        let payload = &event.payload;
        let turns: Vec<ConversationTurn> = payload
            .get("messages")
            .map(|raw| serde_json::from_value(raw.clone()))
            .transpose()
            .map_err(|err| DispatchError::InvalidDirective(format!("invalid messages: {err}")))?
            .unwrap_or_default();
        if turns.is_empty() {
            return Err(DispatchError::InvalidDirective("llm:chat requires payload.messages".into()));
        }

        let capabilities = &self.inner.capabilities;
        let tools = match payload.get("tools") {
            Some(Value::Bool(true)) => Some(tool_definitions(capabilities, None)?),
            Some(Value::Array(names)) => {
                let names: Vec<String> = names
                    .iter()
                    .filter_map(|name| name.as_str().map(str::to_string))
                    .collect();
                Some(tool_definitions(capabilities, Some(&names))?)
            }
            _ => None,
        };

        let Some(tools) = tools else {
            let response = models.chat(&turns, overrides, model_id).await?;
            return Ok(Handled::result(response_value(&response)));
        };

        let round = resolve_tool_call(
            models,
            capabilities,
            turns,
            overrides,
            model_id,
            &tools,
            event_context(Value::Null, event),
            ToolErrorPolicy::ReportToModel,
        )
        .await?;
        let mut value = response_value(&round.response);
        if let Some(execution) = round.execution {
            value["toolExecution"] = json!({
                "capability": execution.capability,
                "params": execution.params,
                "result": execution.result,
                "success": execution.success,
            });
        }
        Ok(Handled::result(value))
    }
}

/// Caller context with the event identity injected.
fn event_context(context: Value, event: &Event) -> CapabilityContext {
    CapabilityContext::from_value(context)
        .with("eventId", event.id.clone())
        .with("eventType", event.event_type.clone())
}

fn required_str<'a>(event: &'a Event, field: &str) -> Result<&'a str, DispatchError> {
    event
        .payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            DispatchError::InvalidDirective(format!("{} requires payload.{field}", event.event_type))
        })
}

fn response_value(response: &ModelResponse) -> Value {
    json!({
        "content": response.content,
        "model": response.model,
        "usage": response.usage,
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use conductor_tools::FnCapability;

    use super::*;
    use crate::{AckStatus, ChannelGateway, GatewayMessage};

    fn dispatcher() -> (Dispatcher, mpsc::UnboundedReceiver<GatewayMessage>) {
        let capabilities = Arc::new(CapabilityRegistry::default());
        capabilities
            .register(Arc::new(FnCapability::sync(
                CapabilitySpec::new("boom", "Always panics"),
                |_, _| panic!("kaboom"),
            )))
            .unwrap();
        capabilities
            .register(Arc::new(FnCapability::sync(
                CapabilitySpec::new("whoami", "Returns the context"),
                |_, ctx| Ok(json!(ctx.values())),
            )))
            .unwrap();
        let (gateway, rx) = ChannelGateway::new();
        (Dispatcher::builder(capabilities, Arc::new(gateway)).build(), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<GatewayMessage>) -> Vec<GatewayMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn unknown_type_is_received_but_not_processed() {
        let (dispatcher, mut rx) = dispatcher();
        let ack = dispatcher.handle(Event::new("custom:thing", json!({}))).await;
        assert_eq!(ack.status, AckStatus::Success);
        assert_eq!(ack.details["result"], json!({"received": true, "processed": false}));
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1, "no reply target means ack only");
    }

    #[tokio::test]
    async fn panic_becomes_error_ack() {
        let (dispatcher, mut rx) = dispatcher();
        let event = Event::new("function:execute", json!({"name": "boom"})).with_reply_target("t");
        let ack = dispatcher.handle(event).await;
        assert_eq!(ack.status, AckStatus::Error);
        assert_eq!(ack.details["kind"], "Panicked");
        assert!(ack.details["error"].as_str().unwrap().contains("kaboom"));

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        match &messages[0] {
            GatewayMessage::Response { response, .. } => {
                assert_eq!(response.response_type, "error");
                assert!(response.payload["error"].as_str().is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        let next = dispatcher.handle(Event::new("custom:after", json!({}))).await;
        assert_eq!(next.status, AckStatus::Success);
    }

    #[tokio::test]
    async fn event_identity_reaches_the_capability() {
        let (dispatcher, _rx) = dispatcher();
        let event = Event::new("function:execute", json!({"name": "whoami", "context": {"user": "u1"}}))
            .with_id("evt-42");
        let ack = dispatcher.handle(event).await;
        let ctx = &ack.details["result"];
        assert_eq!(ctx["eventId"], "evt-42");
        assert_eq!(ctx["eventType"], "function:execute");
        assert_eq!(ctx["user"], "u1");
    }

    #[tokio::test]
    async fn redelivery_replays_without_reexecuting() {
        let (dispatcher, mut rx) = dispatcher();
        let event = Event::new("function:execute", json!({"name": "whoami"}))
            .with_id("evt-1")
            .with_reply_target("t");
        let first = dispatcher.handle(event.clone()).await;
        let second = dispatcher.handle(event).await;
        assert_eq!(first, second);
        assert_eq!(drain(&mut rx).len(), 4);
    }

    #[tokio::test]
    async fn dedup_can_be_disabled() {
        let capabilities = Arc::new(CapabilityRegistry::default());
        let (gateway, _rx) = ChannelGateway::new();
        let dispatcher = Dispatcher::builder(capabilities, Arc::new(gateway))
            .dedup_window(0)
            .build();
        let event = Event::new("custom:x", json!({})).with_id("same");
        dispatcher.handle(event.clone()).await;
        assert!(matches!(dispatcher.admit("same"), Admission::Fresh));
    }

    #[tokio::test]
    async fn dedup_window_forgets_the_least_recent_event() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let capabilities = Arc::new(CapabilityRegistry::default());
        capabilities
            .register(Arc::new(FnCapability::sync(
                CapabilitySpec::new("count", "Counts its invocations"),
                move |_, _| Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)),
            )))
            .unwrap();
        let (gateway, _rx) = ChannelGateway::new();
        let dispatcher = Dispatcher::builder(capabilities, Arc::new(gateway))
            .dedup_window(1)
            .build();

        let a = Event::new("function:execute", json!({"name": "count"})).with_id("a");
        let b = Event::new("function:execute", json!({"name": "count"})).with_id("b");
        dispatcher.handle(a.clone()).await;
        dispatcher.handle(a.clone()).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1, "a is still remembered");

        dispatcher.handle(b).await;
        let again = dispatcher.handle(a).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3, "b pushed a out of the window");
        assert_eq!(again.details["result"], 3);
    }

    #[tokio::test]
    async fn in_flight_duplicate_gets_pending() {
        let (dispatcher, _rx) = dispatcher();
        assert!(matches!(dispatcher.admit("evt-9"), Admission::Fresh));
        let ack = dispatcher.handle(Event::new("custom:x", json!({})).with_id("evt-9")).await;
        assert_eq!(ack.status, AckStatus::Pending);
    }

    #[tokio::test]
    async fn missing_components_are_unavailable() {
        let (dispatcher, _rx) = dispatcher();
        let ack = dispatcher
            .handle(Event::new("job:schedule", json!({"name": "report"})))
            .await;
        assert_eq!(ack.status, AckStatus::Error);
        assert_eq!(ack.details["kind"], "ComponentUnavailable");

        let ack = dispatcher
            .handle(Event::new("llm:generate", json!({"prompt": "hi"})))
            .await;
        assert_eq!(ack.details["kind"], "ComponentUnavailable");

        let ack = dispatcher
            .handle(Event::new("chat:ask", json!({})).with_metadata(json!({"requiresMaster": true})))
            .await;
        assert_eq!(ack.details["kind"], "ComponentUnavailable");
    }

    #[tokio::test]
    async fn missing_name_is_invalid_directive() {
        let (dispatcher, _rx) = dispatcher();
        let ack = dispatcher.handle(Event::new("function:execute", json!({}))).await;
        assert_eq!(ack.details["kind"], "InvalidDirective");
    }
}
