use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::warn;

use crate::{Event, GatewayMessage};

/// Talks to a running socket gateway.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    socket_path: PathBuf,
}

impl GatewayClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub async fn connect_with_backoff(&self, max_attempts: usize) -> Result<()> {
        let attempts = max_attempts.max(1);
        let mut delay = Duration::from_millis(50);
        for attempt in 0..attempts {
            match UnixStream::connect(&self.socket_path).await {
                Ok(_) => return Ok(()),
                Err(err) if attempt + 1 == attempts => return Err(err.into()),
                Err(err) => {
                    warn!(attempt, ?err, "gateway connect failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
            }
        }
        Ok(())
    }

    /// Send one event and collect every message for it up to and including
    /// its acknowledgment.
    pub async fn send_event(&self, event: &Event) -> Result<Vec<GatewayMessage>> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let request = serde_json::to_string(event)?;
        write_half.write_all(request.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut lines = BufReader::new(read_half).lines();
        let mut messages = Vec::new();
        while let Some(line) = lines.next_line().await? {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let message: GatewayMessage = serde_json::from_str(trimmed)?;
            let done = matches!(&message, GatewayMessage::Ack { ack } if ack.event_id == event.id || ack.event_id.is_empty());
            messages.push(message);
            if done {
                return Ok(messages);
            }
        }
        bail!("gateway closed the connection before acknowledging {}", event.id)
    }
}
