//! The wire underneath a [`ConnectionManager`](super::ConnectionManager).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One open bidirectional connection carrying JSON frames.
///
/// The connection is closed from the client side by dropping `outbound`,
/// and from the server side when `inbound` ends.
#[derive(Debug)]
pub struct Connection {
    /// Encoded frames to the relay.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Encoded frames from the relay.
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to the relay.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the relay cannot be reached.
    async fn open(&self) -> Result<Connection>;
}
