//! WebSocket connection to an external relay.
//!
//! Each [`Connection`] is backed by one WebSocket and a pump task: text
//! messages from the relay go to `inbound`, frames queued on `outbound` go
//! out as text messages. The pump ends, and `inbound` with it, when the
//! relay closes the socket or every `outbound` sender is dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use super::transport::{Connection, Transport};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Opens WebSocket connections to a relay at a fixed URL.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Create a transport for `url` with a 10 second handshake timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Create a transport from the `connection` section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigValidation`] if no relay URL is configured.
    pub fn from_config(config: &ConnectionConfig) -> Result<Self> {
        let url = config.relay_url.clone().ok_or_else(|| Error::ConfigValidation {
            message: "connection.relay_url is not set".to_string(),
        })?;
        Ok(Self::new(url).with_connect_timeout(config.connect_timeout()))
    }

    /// Bound the handshake of each connection attempt.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The relay URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<Connection> {
        let handshake = connect_async(self.url.as_str());
        let handshake = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                Error::network(format!(
                    "connecting to {} timed out after {}ms",
                    self.url,
                    self.connect_timeout.as_millis()
                ))
            })?;
        let (socket, _response) =
            handshake.map_err(|e| Error::network(format!("connecting to {}: {e}", self.url)))?;
        info!(url = %self.url, "Relay socket open");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outgoing) = mpsc::unbounded_channel::<String>();
        let (incoming, inbound) = mpsc::unbounded_channel::<String>();
        let url = self.url.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outgoing.recv() => {
                        let Some(text) = frame else {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        };
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            warn!(url = %url, error = %e, "Relay write failed");
                            break;
                        }
                    }
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            if incoming.send(text).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(other)) => {
                            trace!(url = %url, kind = ?other, "Ignoring non-text message");
                        }
                        Some(Err(e)) => {
                            warn!(url = %url, error = %e, "Relay read failed");
                            break;
                        }
                    },
                }
            }
            debug!(url = %url, "Relay socket closed");
        });

        Ok(Connection { outbound, inbound })
    }
}
