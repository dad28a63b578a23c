//! Control socket towards the orchestrator
//!
//! The orchestrator connects to the worker's control port and exchanges
//! newline-delimited correlated frames. Only the latest connection is
//! answered; a reconnecting orchestrator simply replaces the old one.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use jam_protocol::FrameCodec;
use jam_utils::{JamError, Result};

use crate::process::WorkerEvent;

/// Outbound frames buffered per control connection
const CONTROL_QUEUE: usize = 256;

/// Accept orchestrator connections and feed their frames to the actor
pub async fn serve_control(listener: TcpListener, events: mpsc::Sender<WorkerEvent>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept control connection: {}", e);
                continue;
            }
        };
        info!("Control connection from {}", addr);

        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
        let (tx, mut rx) = mpsc::channel::<String>(CONTROL_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = sink.send(line).await {
                    warn!("Control write failed: {}", e);
                    break;
                }
            }
        });

        if events
            .send(WorkerEvent::ControlAttached { sender: tx, writer })
            .await
            .is_err()
        {
            return;
        }

        let events = events.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(line) if line.is_empty() => continue,
                    Ok(line) => {
                        if events.send(WorkerEvent::Frame(line)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Control read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Control connection from {} closed", addr);
        });
    }
}

/// Tell the orchestrator this worker is up by sending its session id
pub async fn announce(orchestrator: &str, session_id: &str, attempts: u32, delay: Duration) -> Result<()> {
    for attempt in 1..=attempts {
        match TcpStream::connect(orchestrator).await {
            Ok(stream) => {
                let mut framed = Framed::new(stream, FrameCodec::new());
                framed
                    .send(session_id)
                    .await
                    .map_err(|e| JamError::protocol(e.to_string()))?;
                SinkExt::<&str>::close(&mut framed)
                    .await
                    .map_err(|e| JamError::protocol(e.to_string()))?;
                info!("Announced session {} to {}", session_id, orchestrator);
                return Ok(());
            }
            Err(e) => {
                debug!("Handshake attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(JamError::Timeout {
        operation: format!("handshake with {}", orchestrator),
        millis: delay.as_millis() as u64 * u64::from(attempts),
    })
}
