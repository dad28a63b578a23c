//! Worker handshake listener
//!
//! A worker that is ready connects here once, sends its session id as a
//! single frame and hangs up. The orchestrator then opens the real control
//! connection to the worker.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use jam_protocol::FrameCodec;
use jam_utils::{JamError, Result};

use crate::workers::WorkerManager;

/// How long a worker has to send its session id
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn serve_handshakes(
    listener: TcpListener,
    workers: Arc<WorkerManager>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("Handshake connection from {}", peer_addr);
                        let workers = Arc::clone(&workers);
                        tokio::spawn(async move {
                            if let Err(e) = handle_handshake(stream, &workers).await {
                                debug!("Handshake from {} failed: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Handshake accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping handshake listener");
                break;
            }
        }
    }
}

async fn handle_handshake(stream: TcpStream, workers: &Arc<WorkerManager>) -> Result<()> {
    let mut framed = Framed::new(stream, FrameCodec::new());
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| JamError::Timeout {
            operation: "worker handshake".into(),
            millis: HANDSHAKE_TIMEOUT.as_millis() as u64,
        })?;

    let line = match frame {
        Some(Ok(line)) => line,
        Some(Err(e)) => return Err(JamError::protocol(e.to_string())),
        None => return Err(JamError::ConnectionClosed),
    };
    let session_id = line.trim();
    if session_id.is_empty() {
        return Err(JamError::protocol("empty handshake"));
    }

    if workers.on_handshake(session_id).await {
        info!("Handshake from worker {}", session_id);
    }
    Ok(())
}
