//! Route-scoped messaging over the shared relay connection.
//!
//! A [`Channel`] is one session's view of the connection owned by the
//! [`ConnectionManager`]: it holds one reference while connected, sends
//! `check` and `get-bus-track` frames for its `(school, route)` and hands
//! out subscriptions to every inbound `get-bus-track-response`.

mod backoff;
mod hub;
mod manager;
mod transport;
mod websocket;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::model::SessionKey;
use crate::wire::{CheckPayload, Frame, Track, TrackRequest};

pub use backoff::Backoff;
pub use hub::LocalHub;
pub use manager::{ConnectionManager, ConnectionState};
pub use transport::{Connection, Transport};
pub use websocket::WebSocketTransport;

/// One session's handle on the shared connection.
#[derive(Debug)]
pub struct Channel {
    manager: ConnectionManager,
    key: SessionKey,
    connected: bool,
}

impl Channel {
    /// Create a disconnected channel for `key`.
    #[must_use]
    pub fn new(manager: ConnectionManager, key: SessionKey) -> Self {
        Self {
            manager,
            key,
            connected: false,
        }
    }

    /// The session this channel is scoped to.
    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Whether this channel holds a connection reference.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Take a reference on the shared connection. Idempotent.
    pub fn connect(&mut self) {
        if self.connected {
            return;
        }
        self.manager.acquire();
        self.connected = true;
        debug!(session = %self.key, "Channel connected");
    }

    /// Publish a position. No acknowledgement, no retry.
    pub fn publish(&self, payload: CheckPayload) {
        if !self.connected {
            warn!(session = %self.key, "Publish on a disconnected channel");
            return;
        }
        self.manager.send(Frame::Check(payload));
    }

    /// Ask for the last known position of this channel's route.
    pub fn request(&self) {
        if !self.connected {
            warn!(session = %self.key, "Request on a disconnected channel");
            return;
        }
        self.manager.send(Frame::Request(TrackRequest::from(&self.key)));
    }

    /// Receive every inbound track response on the connection.
    ///
    /// Responses are not filtered by session. Dropping the subscription
    /// unregisters it.
    #[must_use]
    pub fn on_response(&self) -> ResponseSubscription {
        ResponseSubscription {
            rx: self.manager.subscribe(),
        }
    }

    /// Give the connection reference back. Idempotent.
    pub fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.manager.release();
        debug!(session = %self.key, "Channel disconnected");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A registered response handler.
#[derive(Debug)]
pub struct ResponseSubscription {
    rx: broadcast::Receiver<Track>,
}

impl ResponseSubscription {
    /// Next response, or `None` once the connection manager is gone.
    ///
    /// Responses missed because the queue overflowed are skipped.
    pub async fn recv(&mut self) -> Option<Track> {
        loop {
            match self.rx.recv().await {
                Ok(track) => return Some(track),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Response queue overflowed, skipping");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
