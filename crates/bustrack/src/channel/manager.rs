//! The shared, reference-counted relay connection.
//!
//! Every [`Channel`](super::Channel) on a device goes through one
//! [`ConnectionManager`]. The first `acquire()` spawns a driver task that
//! opens the connection, pumps inbound frames into a broadcast queue and
//! reconnects with backoff when the connection drops. The last `release()`
//! stops the driver and closes the connection.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::backoff::Backoff;
use super::transport::{Connection, Transport};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::wire::{Frame, Track};

/// Observable state of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session holds the connection.
    Idle,
    /// Opening the connection.
    Connecting,
    /// Frames flow both ways.
    Connected,
    /// Waiting to retry; `attempt` is the number of the next try.
    Disconnected {
        /// Next attempt, counted from 1 after the last success.
        attempt: u32,
    },
    /// Retries exhausted. A later `acquire()` starts over.
    Unavailable,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected { attempt } => write!(f, "disconnected (next attempt {attempt})"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    refs: usize,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: VecDeque<Frame>,
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    shared: Mutex<Shared>,
    responses: broadcast::Sender<Track>,
    state: watch::Sender<ConnectionState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a state change unless the driver has been superseded.
    fn set_state(&self, generation: u64, state: ConnectionState) {
        let shared = self.lock();
        if shared.generation == generation {
            self.state.send_replace(state);
        }
    }

    /// Take a freshly opened connection into use and flush buffered frames.
    fn install(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) {
        let mut shared = self.lock();
        if shared.generation != generation {
            return;
        }

        let pending = std::mem::take(&mut shared.pending);
        let flushed = pending.len();
        for frame in pending {
            match frame.encode() {
                Ok(text) => {
                    let _ = outbound.send(text);
                }
                Err(e) => warn!(error = %e, topic = frame.topic(), "Dropping unencodable frame"),
            }
        }
        shared.outbound = Some(outbound);
        self.state.send_replace(ConnectionState::Connected);
        drop(shared);

        info!(flushed, "Connection established");
    }

    fn clear_outbound(&self, generation: u64) {
        let mut shared = self.lock();
        if shared.generation == generation {
            shared.outbound = None;
        }
    }

    fn dispatch(&self, text: &str) {
        match Frame::decode(text) {
            Ok(Frame::Response(response)) => {
                trace!(
                    route = response.track.route_id.as_deref().unwrap_or("-"),
                    "Inbound track response"
                );
                // No receivers is not an error: nobody is polling right now.
                let _ = self.responses.send(response.track);
            }
            Ok(other) => trace!(topic = other.topic(), "Ignoring inbound frame"),
            Err(e) => warn!(error = %e, "Discarding malformed inbound frame"),
        }
    }
}

/// Owner of the single relay connection shared by all sessions.
///
/// Cloning is cheap; clones refer to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("state", &*self.inner.state.borrow())
            .field("refs", &shared.refs)
            .field("pending", &shared.pending.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager that opens connections through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (responses, _) = broadcast::channel(config.response_queue.max(1));
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                shared: Mutex::new(Shared::default()),
                responses,
                state,
            }),
        }
    }

    /// Register a session. The first registration starts the connection.
    ///
    /// Returns the number of sessions now holding the connection.
    /// Must be called from within a tokio runtime.
    pub fn acquire(&self) -> usize {
        let mut shared = self.inner.lock();
        shared.refs += 1;

        let running = shared
            .driver
            .as_ref()
            .is_some_and(|driver| !driver.is_finished());
        if !running {
            shared.generation += 1;
            let generation = shared.generation;
            debug!(generation, "Starting connection driver");
            shared.driver = Some(tokio::spawn(drive(Arc::clone(&self.inner), generation)));
        }

        trace!(refs = shared.refs, "Connection acquired");
        shared.refs
    }

    /// Unregister a session. The last release closes the connection.
    ///
    /// Returns the number of sessions still holding the connection.
    pub fn release(&self) -> usize {
        let mut shared = self.inner.lock();
        if shared.refs == 0 {
            warn!("Connection released more often than acquired");
            return 0;
        }

        shared.refs -= 1;
        if shared.refs == 0 {
            shared.generation += 1;
            if let Some(driver) = shared.driver.take() {
                driver.abort();
            }
            shared.outbound = None;
            let dropped = shared.pending.len();
            shared.pending.clear();
            self.inner.state.send_replace(ConnectionState::Idle);
            debug!(dropped, "Connection closed, no sessions remain");
        }

        trace!(refs = shared.refs, "Connection released");
        shared.refs
    }

    /// Sessions currently holding the connection.
    #[must_use]
    pub fn refs(&self) -> usize {
        self.inner.lock().refs
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Follow connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Frames waiting for the connection to open.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Subscribe to every inbound track response.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Track> {
        self.inner.responses.subscribe()
    }

    /// Send a frame without waiting for delivery.
    ///
    /// While the connection is not open the frame is buffered; when the
    /// buffer is full the oldest frame is dropped. Frames sent while no
    /// session holds the connection are discarded.
    pub fn send(&self, frame: Frame) {
        let mut shared = self.inner.lock();
        if shared.refs == 0 {
            warn!(topic = frame.topic(), "Dropping frame sent on a closed connection");
            return;
        }

        if let Some(outbound) = &shared.outbound {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, topic = frame.topic(), "Dropping unencodable frame");
                    return;
                }
            };
            if outbound.send(text).is_ok() {
                trace!(topic = frame.topic(), "Frame sent");
                return;
            }
            shared.outbound = None;
        }

        if shared.pending.len() >= self.inner.config.send_buffer {
            if let Some(oldest) = shared.pending.pop_front() {
                debug!(topic = oldest.topic(), "Send buffer full, dropping oldest frame");
            }
        }
        trace!(topic = frame.topic(), "Frame buffered");
        shared.pending.push_back(frame);
    }

    /// Wait until the connection is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelUnavailable`] if the connection is not open
    /// within `timeout` or retries are exhausted.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut state = self.watch_state();
        let outcome = tokio::time::timeout(timeout, async {
            state
                .wait_for(|s| {
                    matches!(s, ConnectionState::Connected | ConnectionState::Unavailable)
                })
                .await
                .map(|s| *s == ConnectionState::Connected)
        })
        .await;

        match outcome {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(Error::channel_unavailable("reconnect attempts exhausted")),
            Ok(Err(_)) => Err(Error::channel_unavailable("connection manager dropped")),
            Err(_) => Err(Error::channel_unavailable(format!(
                "not connected after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// Connection driver: open, pump, back off, repeat.
async fn drive(inner: Arc<Inner>, generation: u64) {
    let mut backoff = Backoff::from_config(&inner.config);

    loop {
        inner.set_state(generation, ConnectionState::Connecting);

        match inner.transport.open().await {
            Ok(Connection {
                outbound,
                mut inbound,
            }) => {
                let opened = Instant::now();
                let mut established = false;
                inner.install(generation, outbound);

                while let Some(text) = inbound.recv().await {
                    if !established {
                        established = true;
                        backoff.reset();
                    }
                    inner.dispatch(&text);
                }

                inner.clear_outbound(generation);
                if established || opened.elapsed() >= inner.config.stable_after() {
                    backoff.reset();
                    warn!("Connection lost");
                } else {
                    // Accepted and closed straight away: treat like a failed open.
                    let attempt = backoff.failures() + 1;
                    if !backoff.record_failure() {
                        error!(attempt, "Connection keeps closing, giving up");
                        inner.set_state(generation, ConnectionState::Unavailable);
                        return;
                    }
                    warn!(attempt, "Connection closed before it was established");
                }
            }
            Err(e) => {
                let attempt = backoff.failures() + 1;
                if !backoff.record_failure() {
                    error!(attempt, error = %e, "Giving up on connection");
                    inner.set_state(generation, ConnectionState::Unavailable);
                    return;
                }
                warn!(attempt, error = %e, "Failed to open connection");
            }
        }

        let delay = backoff.delay();
        let attempt = backoff.failures() + 1;
        debug!(attempt, delay_ms = delay.as_millis(), "Reconnecting after delay");
        inner.set_state(generation, ConnectionState::Disconnected { attempt });
        tokio::time::sleep(delay).await;
    }
}
