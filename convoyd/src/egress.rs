//! Notification egress transport.
//!
//! One accept loop; each connection is handled on its own task that sends a
//! hello frame, reads exactly one identity frame, registers the connection's
//! write half as the user's outbound channel, then parks on the read side
//! until the peer disconnects. Pushes happen through the registered write
//! half whenever the registry's `notify` is called for that user.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use convoy_common::{CoreError, HelloFrame, IdentifyFrame, WIRE_VERSION};

use crate::registry::Registry;

pub fn spawn_notification_listener(
    listener: TcpListener,
    registry: Arc<Registry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, registry).await {
                            debug!(%peer, "Notification connection dropped: {}", err);
                        }
                    });
                }
                Err(err) => {
                    warn!("Notification listener accept failed: {}", err);
                    break;
                }
            }
        }
    })
}

async fn handle_connection(stream: TcpStream, registry: Arc<Registry>) -> Result<(), CoreError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // Flush stream framing before the client says anything.
    let hello = serde_json::to_string(&HelloFrame::new())
        .map_err(|e| CoreError::Transport(e.to_string()))?
        + "\n";
    write_half
        .write_all(hello.as_bytes())
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;

    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| CoreError::Transport(e.to_string()))?;
    if n == 0 {
        return Err(CoreError::Transport("closed before identification".into()));
    }
    let identify: IdentifyFrame = serde_json::from_str(line.trim())
        .map_err(|e| CoreError::Transport(format!("not an identify frame: {e}")))?;
    if identify.v != WIRE_VERSION {
        return Err(CoreError::Transport(format!(
            "unsupported identify frame version {}",
            identify.v
        )));
    }

    let user = identify.user;
    let token = registry.register_channel(&user, write_half).await;

    // Park until the peer disconnects. Nothing further is expected on the
    // read side; stray lines are drained and ignored.
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    registry.deregister_channel(&user, token).await;
    Ok(())
}
