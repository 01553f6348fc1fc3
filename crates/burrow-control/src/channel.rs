//! Serialized outbound half of a control connection
//!
//! The session task and the mux-establishment task both write to the same
//! WebSocket. Frames must not interleave, so every write goes through one
//! queue drained by a single writer task that owns the sink.

use burrow_proto::ControlMessage;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error};

pub(crate) type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The connection's writer task is gone; the session is unrecoverable.
#[derive(Debug, Error)]
#[error("control channel closed")]
pub struct ChannelClosed;

/// Cloneable handle for sending control messages to one client.
#[derive(Clone)]
pub struct ControlChannel {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlChannel {
    /// Spawn the writer task owning `sink` and return the send handle.
    pub fn start(mut sink: WsSink) -> Self {
        let (tx, mut rx) = mpsc::channel::<ControlMessage>(64);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to encode control message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!("control channel write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        Self { tx }
    }

    /// Queue a message for the writer task. Fails only once the underlying
    /// connection is dead.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), ChannelClosed> {
        self.tx.send(msg).await.map_err(|_| ChannelClosed)
    }

    /// Raw sender, stored on tunnel bindings so the broker can reach the
    /// owning connection.
    pub fn sender(&self) -> mpsc::Sender<ControlMessage> {
        self.tx.clone()
    }

    #[cfg(test)]
    pub(crate) fn stub() -> (Self, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (Self { tx }, rx)
    }
}
