//! WebSocket upstream transport
//!
//! Dials a relay's `/ws` endpoint, announces the wanted categories with a
//! `subscribe` control message, then reads one event envelope per text frame.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::{Connection, Inbound, Transport, TransportError};
use crate::event::SubscribeMessage;

/// Transport for `ws://` and `wss://` relay endpoints.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: Url,
    events: Vec<String>,
}

impl WebSocketTransport {
    /// Validate the endpoint. `events` is sent in the subscribe message on
    /// every connection; empty means all categories.
    pub fn new(url: &str, events: Vec<String>) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url, events }),
            other => Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{other}' for websocket transport"
            ))),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;

    fn endpoint(&self) -> &str {
        self.url.as_str()
    }

    async fn connect(&self) -> Result<WebSocketConnection, TransportError> {
        let (stream, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(classify_connect_error)?;
        debug!(status = %response.status(), "WebSocket upgrade accepted");

        Ok(WebSocketConnection {
            stream,
            events: self.events.clone(),
        })
    }
}

fn classify_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Url(e) => TransportError::InvalidEndpoint(e.to_string()),
        tungstenite::Error::Http(response) => {
            TransportError::Handshake(format!("upgrade rejected with status {}", response.status()))
        }
        other => TransportError::Connect(other.to_string()),
    }
}

/// An open WebSocket to the relay.
#[derive(Debug)]
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: Vec<String>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn handshake(&mut self) -> Result<(), TransportError> {
        let subscribe = serde_json::to_string(&SubscribeMessage::new(self.events.clone()))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        self.stream
            .send(Message::Text(subscribe.into()))
            .await
            .map_err(|e| TransportError::Handshake(format!("subscribe failed: {e}")))
    }

    async fn next_message(&mut self) -> Result<Option<Inbound>, TransportError> {
        while let Some(frame) = self.stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None)
                }
                Err(e) => return Err(TransportError::Read(e.to_string())),
            };

            match frame {
                Message::Text(text) => return Ok(Some(Inbound::decode_envelope(text.to_string()))),
                Message::Binary(bytes) => {
                    return Ok(Some(match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Inbound::decode_envelope(text),
                        Err(e) => Inbound::Undecodable {
                            raw: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                            reason: "binary frame is not UTF-8".to_string(),
                        },
                    }))
                }
                Message::Ping(data) => {
                    self.stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| TransportError::Read(format!("pong failed: {e}")))?;
                }
                Message::Close(frame) => {
                    debug!(?frame, "Upstream sent close frame");
                    return Ok(None);
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
