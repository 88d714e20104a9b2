use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::CoordinatorError;

/// WebSocket close code sent by browsers navigating away.
const GOING_AWAY: u16 = 1001;

/// Framed signaling message exchanged with the browser.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Start,
    Sdp,
    Ice,
    #[serde(other)]
    Unknown,
}

/// Text-frame adapter over an upgraded WebSocket.
///
/// The adapter only frames text; the session manager owns the
/// `{type, data}` schema.
pub struct SignalingConnection {
    stream: Mutex<SplitStream<WebSocket>>,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl SignalingConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            stream: Mutex::new(stream),
            sink: Mutex::new(sink),
        }
    }

    /// Block for the next text frame.
    ///
    /// Returns `Ok(None)` when the peer is gone for benign reasons (stream
    /// end or a GoingAway close); any other close code or transport error
    /// is propagated.
    pub async fn read_text(&self) -> Result<Option<String>, CoordinatorError> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if frame.code != GOING_AWAY => Err(CoordinatorError::Signaling(
                            format!("peer closed signaling channel: code {}", frame.code),
                        )),
                        _ => Ok(None),
                    };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(CoordinatorError::Signaling(e.to_string())),
            }
        }
    }

    /// JSON-encode a message and send it as one text frame.
    pub async fn send(&self, message: &SignalMessage) -> Result<(), CoordinatorError> {
        let json =
            serde_json::to_string(message).map_err(|e| CoordinatorError::Signaling(e.to_string()))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| CoordinatorError::Signaling(e.to_string()))
    }
}
