//! Mesh transport seam
//!
//! The radio link is external; the responder only needs "send this text to
//! that node" and a pass/fail answer.

use super::envelope::NodeNum;
use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Transport failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// The reader on the other end went away
    #[error("Transport not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound side of the mesh radio
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Send one text message to a node
    async fn send(&self, destination: NodeNum, text: &str) -> Result<(), TransportError>;
}

/// Writes each reply as a JSON line, e.g. for piping into a radio bridge
pub struct JsonLinesTransport<W> {
    writer: Mutex<W>,
}

impl<W> JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl JsonLinesTransport<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W> MeshTransport for JsonLinesTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, destination: NodeNum, text: &str) -> Result<(), TransportError> {
        let mut line = json!({
            "to": destination.0,
            "toId": destination.node_id(),
            "text": text,
        })
        .to_string();
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(disconnected)?;
        writer.flush().await.map_err(disconnected)?;
        Ok(())
    }
}

fn disconnected(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe => TransportError::NotConnected,
        _ => TransportError::Io(e),
    }
}
