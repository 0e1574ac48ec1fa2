//! Checkpoint ingress transport.
//!
//! One accept loop; each connection is handled on its own task, carries
//! exactly one serialized checkpoint frame, and is closed afterwards. Any
//! other payload or I/O error closes the connection with no side effects on
//! controller state.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use convoy_common::{CheckpointFrame, CoreError};

use crate::controller::Controller;

pub fn spawn_checkpoint_listener(
    listener: TcpListener,
    controller: Arc<Controller>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let controller = controller.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, controller).await {
                            debug!(%peer, "Checkpoint connection dropped: {}", err);
                        }
                    });
                }
                Err(err) => {
                    warn!("Checkpoint listener accept failed: {}", err);
                    break;
                }
            }
        }
    })
}

async fn handle_connection(stream: TcpStream, controller: Arc<Controller>) -> Result<(), CoreError> {
    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    if n == 0 {
        return Err(CoreError::Transport("connection closed before frame".into()));
    }

    let frame: CheckpointFrame = serde_json::from_str(line.trim())
        .map_err(|e| CoreError::Transport(format!("not a checkpoint frame: {e}")))?;
    let checkpoint = frame.into_checkpoint()?;
    controller.handle_checkpoint(checkpoint);
    Ok(())
}
