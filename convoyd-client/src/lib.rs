//! Client library for the convoy daemon.
//!
//! Two entry points, one per transport: `push_checkpoint` opens a single-shot
//! connection to the ingress socket, and `NotificationStream` holds a
//! long-lived connection to the egress socket, yielding pushed notification
//! lines as they arrive.

use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use convoy_common::{Checkpoint, CheckpointFrame, HelloFrame, IdentifyFrame, WIRE_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("disconnected")]
    Disconnected,
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("timeout")]
    Timeout,
}

/// Push one checkpoint through the ingress socket. Connections are
/// single-shot: one frame, then close.
pub async fn push_checkpoint(addr: &str, checkpoint: &Checkpoint) -> Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    let frame = CheckpointFrame::from_checkpoint(checkpoint);
    let line = serde_json::to_string(&frame)? + "\n";
    stream.write_all(line.as_bytes()).await?;
    stream.shutdown().await?;
    debug!(checkpoint_id = %checkpoint.id, job_id = %checkpoint.job_id, "Checkpoint pushed");
    Ok(())
}

/// Long-lived notification connection registered for a single user. The
/// server may push string lines at any time until either side closes.
pub struct NotificationStream {
    reader: BufReader<OwnedReadHalf>,
    // Held open so the server keeps the channel registered; dropping this
    // half closes the connection and deregisters us.
    _writer: OwnedWriteHalf,
    line: String,
}

impl NotificationStream {
    pub async fn connect(addr: &str, user: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ClientError::Disconnected.into());
        }
        let hello: HelloFrame = serde_json::from_str(line.trim())
            .map_err(|e| ClientError::InvalidFrame(e.to_string()))?;
        if hello.v != WIRE_VERSION || hello.frame_type != "hello" {
            return Err(ClientError::InvalidFrame(format!(
                "unexpected greeting: {}",
                line.trim()
            ))
            .into());
        }

        let identify = serde_json::to_string(&IdentifyFrame::new(user))? + "\n";
        write_half.write_all(identify.as_bytes()).await?;
        debug!(user, "Notification stream registered");

        Ok(Self {
            reader,
            _writer: write_half,
            line: String::new(),
        })
    }

    /// Next pushed notification, or `None` once the server closes.
    pub async fn next(&mut self) -> Result<Option<String>> {
        self.line.clear();
        let n = self.reader.read_line(&mut self.line).await?;
        if n == 0 {
            return Ok(None);
        }
        let message: String = serde_json::from_str(self.line.trim())
            .map_err(|e| ClientError::InvalidFrame(e.to_string()))?;
        Ok(Some(message))
    }

    /// Like `next`, but gives up after `wait` rather than blocking
    /// indefinitely. Useful in tests and polling loops.
    pub async fn next_timeout(&mut self, wait: Duration) -> Result<Option<String>> {
        match timeout(wait, self.next()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout.into()),
        }
    }
}
