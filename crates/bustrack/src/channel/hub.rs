//! In-process relay.
//!
//! [`LocalHub`] behaves like the relay server the app talks to: it keeps
//! the last `check` of every route, pushes it to all clients as a
//! `get-bus-track-response`, and answers `get-bus-track` requests from the
//! stored value. Switches let simulations and tests lose pushes, ignore
//! requests or drop the connection entirely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::transport::{Connection, Transport};
use crate::error::{Error, Result};
use crate::model::SessionKey;
use crate::wire::{Frame, Track, TrackResponse};

#[derive(Debug)]
struct HubState {
    online: bool,
    push_enabled: bool,
    respond_enabled: bool,
    tracks: HashMap<SessionKey, Track>,
    clients: HashMap<u64, mpsc::UnboundedSender<String>>,
    next_client: u64,
    opens: usize,
    checks_seen: usize,
    requests_seen: usize,
}

/// A relay server living in the same process.
#[derive(Debug, Clone)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    /// Create an online hub that pushes and answers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                online: true,
                push_enabled: true,
                respond_enabled: true,
                tracks: HashMap::new(),
                clients: HashMap::new(),
                next_client: 1,
                opens: 0,
                checks_seen: 0,
                requests_seen: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the hub on or offline. Going offline severs every client.
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            state.clients.clear();
        }
        debug!(online, "Hub availability changed");
    }

    /// Whether a `check` is pushed to all clients.
    pub fn set_push_enabled(&self, enabled: bool) {
        self.lock().push_enabled = enabled;
    }

    /// Whether `get-bus-track` requests are answered.
    pub fn set_respond_enabled(&self, enabled: bool) {
        self.lock().respond_enabled = enabled;
    }

    /// Drop every open connection. Clients may reconnect.
    pub fn sever_connections(&self) {
        let severed = {
            let mut state = self.lock();
            let severed = state.clients.len();
            state.clients.clear();
            severed
        };
        debug!(severed, "Severed hub connections");
    }

    /// Store a track as if a publisher had sent it.
    pub fn seed_track(&self, key: &SessionKey, track: Track) {
        self.lock().tracks.insert(key.clone(), track);
    }

    /// The stored track for a session.
    #[must_use]
    pub fn track(&self, key: &SessionKey) -> Option<Track> {
        self.lock().tracks.get(key).cloned()
    }

    /// Connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Connections opened since creation.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    /// `check` frames received.
    #[must_use]
    pub fn checks_seen(&self) -> usize {
        self.lock().checks_seen
    }

    /// `get-bus-track` frames received.
    #[must_use]
    pub fn requests_seen(&self) -> usize {
        self.lock().requests_seen
    }

    /// Handle one frame from `client`. Returns `false` once the client is gone.
    fn handle(&self, client: u64, text: &str) -> bool {
        let mut state = self.lock();
        if !state.clients.contains_key(&client) {
            return false;
        }

        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(client, error = %e, "Hub received malformed frame");
                return true;
            }
        };

        match frame {
            Frame::Check(check) => {
                state.checks_seen += 1;
                let key = check.session_key();
                let track = check.to_track();
                trace!(client, session = %key, "Hub stored check");
                state.tracks.insert(key, track.clone());

                if state.push_enabled {
                    if let Some(text) = encode_response(track) {
                        for tx in state.clients.values() {
                            let _ = tx.send(text.clone());
                        }
                    }
                }
            }
            Frame::Request(request) => {
                state.requests_seen += 1;
                let key = request.session_key();
                if !state.respond_enabled {
                    trace!(client, session = %key, "Hub ignoring request");
                    return true;
                }
                let reply = state.tracks.get(&key).cloned().and_then(encode_response);
                if let (Some(text), Some(tx)) = (reply, state.clients.get(&client)) {
                    let _ = tx.send(text);
                }
            }
            Frame::Response(_) => trace!(client, "Hub ignoring client response frame"),
        }
        true
    }
}

fn encode_response(track: Track) -> Option<String> {
    match Frame::Response(TrackResponse { track }).encode() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "Hub failed to encode response");
            None
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn open(&self) -> Result<Connection> {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_client) = mpsc::unbounded_channel::<String>();

        let client = {
            let mut state = self.lock();
            if !state.online {
                return Err(Error::network("relay is offline"));
            }
            let client = state.next_client;
            state.next_client += 1;
            state.opens += 1;
            state.clients.insert(client, to_client);
            client
        };
        debug!(client, "Hub accepted connection");

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(text) = from_client.recv().await {
                if !hub.handle(client, &text) {
                    break;
                }
            }
            hub.lock().clients.remove(&client);
            debug!(client, "Hub connection closed");
        });

        Ok(Connection { outbound, inbound })
    }
}
