//! In-process location provider.
//!
//! [`SimulatedDevice`] stands in for a phone's location service. Tests and
//! the `simulate` command push positions into it and every open watch
//! receives them, subject to its own time and distance gate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    LocationProvider, PermissionStatus, PositionWatch, SampleGate, WatchGuard, WatchOptions,
};
use crate::error::{Error, Result};
use crate::model::PositionSample;

#[derive(Debug)]
struct WatchSlot {
    tx: mpsc::Sender<PositionSample>,
    gate: SampleGate,
}

#[derive(Debug)]
struct DeviceState {
    granted: bool,
    available: bool,
    permission_requests: usize,
    watches: HashMap<u64, WatchSlot>,
    next_id: u64,
}

/// A scriptable device location service.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// Create a device whose user grants location access.
    #[must_use]
    pub fn new() -> Self {
        Self::with_permission(true)
    }

    /// Create a device whose user answers permission prompts with `granted`.
    #[must_use]
    pub fn with_permission(granted: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                granted,
                available: true,
                permission_requests: 0,
                watches: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the answer to future permission prompts.
    pub fn set_permission(&self, granted: bool) {
        self.lock().granted = granted;
    }

    /// Make future watch requests fail, as when location services are off.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Report a new device position to every open watch.
    ///
    /// Returns how many watches admitted the sample.
    pub fn push(&self, sample: PositionSample) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let mut delivered = 0;

        state.watches.retain(|id, slot| {
            if slot.tx.is_closed() {
                return false;
            }
            if !slot.gate.admit(sample, now) {
                trace!(watch = id, %sample, "Sample held back by gate");
                return true;
            }
            match slot.tx.try_send(sample) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(watch = id, "Sample queue full, dropping sample");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return false,
            }
            true
        });

        delivered
    }

    /// Number of watches currently open.
    #[must_use]
    pub fn active_watches(&self) -> usize {
        self.lock().watches.len()
    }

    /// Number of permission prompts shown so far.
    #[must_use]
    pub fn permission_requests(&self) -> usize {
        self.lock().permission_requests
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocationProvider for SimulatedDevice {
    async fn request_permission(&self) -> PermissionStatus {
        let mut state = self.lock();
        state.permission_requests += 1;
        if state.granted {
            PermissionStatus::granted()
        } else {
            PermissionStatus::denied()
        }
    }

    fn watch_position(&self, options: WatchOptions) -> Result<PositionWatch> {
        let (tx, rx) = mpsc::channel(options.queue.max(1));
        let id = {
            let mut state = self.lock();
            if !state.available {
                return Err(Error::LocationUnavailable {
                    message: "location services are switched off".to_string(),
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            state.watches.insert(
                id,
                WatchSlot {
                    tx,
                    gate: SampleGate::new(options.min_interval, options.min_distance_m),
                },
            );
            id
        };
        debug!(watch = id, "Opened position watch");

        let state = Arc::clone(&self.state);
        let guard = WatchGuard::new(move || {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .watches
                .remove(&id);
            debug!(watch = id, "Removed position watch");
        });

        Ok(PositionWatch::new(rx, guard))
    }
}
