//! Raw websocket transport.
//!
//! A socket is split into a writer task fed by an mpsc command channel and a
//! reader task that forwards frames into the engine's event channel, tagged
//! with the owning [`ConnectionId`]. Nothing in here understands venue
//! payloads; decoding happens in the application layer where the codec lives.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::connect_async;

use crate::domain::events::{ConnectionEvent, ConnectionId};
use crate::error::SyncError;

/// Commands accepted by a socket's writer task.
#[derive(Debug)]
pub enum WriterCommand {
    Text(String),
    Ping,
    Close,
}

/// Handle for pushing frames onto one socket.
#[derive(Clone)]
pub struct SocketWriter {
    tx: mpsc::Sender<WriterCommand>,
}

impl SocketWriter {
    pub fn new(tx: mpsc::Sender<WriterCommand>) -> Self {
        SocketWriter { tx }
    }

    pub async fn send_text(&self, payload: String) -> Result<(), SyncError> {
        self.tx
            .send(WriterCommand::Text(payload))
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    pub async fn send_ping(&self) -> Result<(), SyncError> {
        self.tx
            .send(WriterCommand::Ping)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    /// Best-effort close; the reader task reports the actual shutdown.
    pub async fn close(&self) {
        let _ = self.tx.send(WriterCommand::Close).await;
    }
}

/// Seam between the connection pool and the wire. The production
/// implementation dials tungstenite; tests substitute an in-memory fake.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Open a socket to `url` and spawn its reader/writer tasks. All frames
    /// and lifecycle notifications flow into `events` tagged with
    /// `connection`.
    async fn open(
        &self,
        url: &str,
        connection: ConnectionId,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<SocketWriter, SyncError>;
}

/// Connector backed by `tokio-tungstenite`.
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn open(
        &self,
        url: &str,
        connection: ConnectionId,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<SocketWriter, SyncError> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WriterCommand>(64);

        // Outgoing half: drain commands until the channel or socket dies.
        let writer_events = events.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let result = match cmd {
                    WriterCommand::Text(json) => write.send(Message::Text(json.into())).await,
                    WriterCommand::Ping => write.send(Message::Ping(Bytes::new())).await,
                    WriterCommand::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    let _ = writer_events
                        .send(ConnectionEvent::Error {
                            connection,
                            error: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
        });

        // Incoming half: forward text frames, surface close and transport
        // errors, note pongs for keep-alive accounting.
        tokio::spawn(async move {
            let mut announced = false;
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let frame = ConnectionEvent::Frame {
                            connection,
                            text: text.to_string(),
                        };
                        if events.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        if events
                            .send(ConnectionEvent::PongReceived { connection })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        // tungstenite queues the protocol-level pong itself.
                        tracing::trace!("{} received ping: {:?}", connection, data);
                    }
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| format!("{} ({})", f.reason, f.code))
                            .unwrap_or_else(|| "closed by peer".to_string());
                        let _ = events
                            .send(ConnectionEvent::Closed { connection, reason })
                            .await;
                        announced = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events
                            .send(ConnectionEvent::Error {
                                connection,
                                error: e.to_string(),
                            })
                            .await;
                        announced = true;
                        break;
                    }
                }
            }
            if !announced {
                // Stream ended without a close frame, e.g. TCP reset.
                let _ = events
                    .send(ConnectionEvent::Closed {
                        connection,
                        reason: "stream ended".to_string(),
                    })
                    .await;
            }
        });

        Ok(SocketWriter::new(cmd_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let writer = SocketWriter::new(tx);
        assert!(matches!(
            writer.send_text("{}".to_string()).await,
            Err(SyncError::ChannelClosed)
        ));
    }
}
