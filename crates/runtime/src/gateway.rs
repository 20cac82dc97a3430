//! The outbound half of the event transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Acknowledgment, OutboundResponse};

/// Where responses and acknowledgments go.  The dispatcher never opens a
/// transport of its own.
#[async_trait]
pub trait EventGateway: Send + Sync {
    /// Deliver a response; returns the id assigned to it.
    async fn send_response(&self, response: OutboundResponse) -> anyhow::Result<String>;

    async fn send_acknowledgment(&self, ack: Acknowledgment) -> anyhow::Result<()>;
}

/// One outbound line on a gateway transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GatewayMessage {
    Response { id: String, response: OutboundResponse },
    Ack { ack: Acknowledgment },
}

impl GatewayMessage {
    pub fn event_id(&self) -> Option<&str> {
        match self {
            GatewayMessage::Response { response, .. } => response.correlation_id.as_deref(),
            GatewayMessage::Ack { ack } => Some(&ack.event_id),
        }
    }
}

/// In-memory gateway: every outbound message lands on an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelGateway {
    tx: mpsc::UnboundedSender<GatewayMessage>,
}

impl ChannelGateway {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventGateway for ChannelGateway {
    async fn send_response(&self, response: OutboundResponse) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.tx
            .send(GatewayMessage::Response {
                id: id.clone(),
                response,
            })
            .map_err(|_| anyhow::anyhow!("gateway receiver dropped"))?;
        Ok(id)
    }

    async fn send_acknowledgment(&self, ack: Acknowledgment) -> anyhow::Result<()> {
        self.tx
            .send(GatewayMessage::Ack { ack })
            .map_err(|_| anyhow::anyhow!("gateway receiver dropped"))
    }
}
