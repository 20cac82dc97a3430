//! Unix domain socket gateway.  Each inbound line is an [`Event`]; each
//! outbound line is a [`GatewayMessage`] routed back to the connection that
//! submitted the event.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::{AckStatus, Acknowledgment, Dispatcher, Event, EventGateway, GatewayMessage, OutboundResponse};

type Route = mpsc::UnboundedSender<GatewayMessage>;

/// Gateway that writes responses and acknowledgments to the socket
/// connection each event arrived on.
///
/// The first connection to submit an id owns it.  A redelivery of an id that
/// is still in flight queues behind the owner and is answered by the pending
/// acknowledgment; the final acknowledgment reaches every connection still
/// waiting.
#[derive(Default)]
pub struct SocketGateway {
    routes: Mutex<HashMap<String, VecDeque<Route>>>,
}

impl SocketGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Route>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, event_id: &str, route: Route) {
        self.routes()
            .entry(event_id.to_string())
            .or_default()
            .push_back(route);
    }

    /// Number of events still waiting for their acknowledgment.
    pub fn pending_routes(&self) -> usize {
        self.routes().len()
    }

    fn deliver(&self, message: GatewayMessage) -> Result<()> {
        let Some(event_id) = message.event_id().map(str::to_string) else {
            debug!("outbound message without an event id; dropped");
            return Ok(());
        };
        let targets: Vec<Route> = {
            let mut routes = self.routes();
            let status = match &message {
                GatewayMessage::Ack { ack } => Some(ack.status),
                GatewayMessage::Response { .. } => None,
            };
            match (status, routes.get_mut(&event_id)) {
                (_, None) => {
                    debug!(event_id = %event_id, "no connection waiting for event");
                    return Ok(());
                }
                (None, Some(queue)) => queue.front().cloned().into_iter().collect(),
                // The newest registration is the duplicate being turned away.
                (Some(AckStatus::Pending), Some(queue)) => {
                    let duplicate = queue.pop_back();
                    if queue.is_empty() {
                        routes.remove(&event_id);
                    }
                    duplicate.into_iter().collect()
                }
                (Some(_), Some(_)) => routes.remove(&event_id).map(Vec::from).unwrap_or_default(),
            }
        };

        let mut delivered = false;
        for route in targets {
            delivered |= route.send(message.clone()).is_ok();
        }
        if delivered {
            Ok(())
        } else {
            Err(anyhow!("connection for event {event_id} is closed"))
        }
    }

    /// Accept connections on `socket_path` until `shutdown` flips to `true`.
    pub async fn serve(
        self: Arc<Self>,
        socket_path: impl AsRef<Path>,
        dispatcher: Dispatcher,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let socket_path = socket_path.as_ref();
        if socket_path.exists() {
            let _ = std::fs::remove_file(socket_path);
        }
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(socket_path)?;
        info!(path = %socket_path.display(), "gateway listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let gateway = self.clone();
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(err) = gateway.handle_connection(stream, dispatcher).await {
                            warn!(error = %err, "connection ended with error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(socket_path);
        info!("gateway stopped");
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream, dispatcher: Dispatcher) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<GatewayMessage>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let line = serde_json::to_string(&message)?;
                write_half.write_all(line.as_bytes()).await?;
                write_half.write_all(b"\n").await?;
                write_half.flush().await?;
            }
            anyhow::Ok(())
        });

        let mut lines = BufReader::new(read_half).lines();
        let mut in_flight = JoinSet::new();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(line) {
                Ok(event) => {
                    debug!(event_id = %event.id, event_type = %event.event_type, "event received");
                    self.register(&event.id, tx.clone());
                    let dispatcher = dispatcher.clone();
                    in_flight.spawn(async move { dispatcher.handle(event).await });
                }
                Err(err) => {
                    warn!(error = %err, "rejecting malformed event");
                    let event_id = serde_json::from_str::<Value>(line)
                        .ok()
                        .and_then(|raw| raw.get("id").and_then(Value::as_str).map(str::to_string))
                        .unwrap_or_default();
                    let ack = Acknowledgment::error(event_id, "InvalidEvent", err.to_string());
                    let _ = tx.send(GatewayMessage::Ack { ack });
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        drop(tx);
        writer.await??;
        Ok(())
    }
}

#[async_trait]
impl EventGateway for SocketGateway {
    async fn send_response(&self, response: OutboundResponse) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.deliver(GatewayMessage::Response {
            id: id.clone(),
            response,
        })?;
        Ok(id)
    }

    async fn send_acknowledgment(&self, ack: Acknowledgment) -> Result<()> {
        self.deliver(GatewayMessage::Ack { ack })
    }
}
