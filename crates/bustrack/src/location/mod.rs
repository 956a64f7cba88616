//! Device location access.
//!
//! A [`LocationProvider`] is the seam between the publisher and whatever
//! produces positions on the driver's device. Opening a watch yields a
//! [`PositionWatch`]: a queue of samples plus a guard that removes the
//! platform subscription when the watch is removed or dropped.

mod gate;
mod permission;
mod simulated;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::TrackingConfig;
use crate::error::Result;
use crate::model::PositionSample;

pub use gate::SampleGate;
pub use permission::{permission_instructions, PermissionStatus};
pub use simulated::SimulatedDevice;

/// Thresholds a watch must honour between callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatchOptions {
    /// Minimum time between two samples.
    pub min_interval: Duration,
    /// Minimum distance in metres between two samples.
    pub min_distance_m: f64,
    /// Capacity of the sample queue; samples beyond it are dropped.
    pub queue: usize,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&TrackingConfig::default())
    }
}

impl From<&TrackingConfig> for WatchOptions {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            min_interval: config.min_update_interval(),
            min_distance_m: config.min_update_distance_m,
            queue: config.sample_queue,
        }
    }
}

/// Source of device positions.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Ask for foreground location access. May wait on the user.
    async fn request_permission(&self) -> PermissionStatus;

    /// Open a continuous position subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform refuses the subscription.
    fn watch_position(&self, options: WatchOptions) -> Result<PositionWatch>;
}

/// Removes a platform subscription exactly once.
pub struct WatchGuard {
    remove: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchGuard {
    /// Wrap the removal action.
    pub fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    fn remove(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchGuard")
            .field("armed", &self.remove.is_some())
            .finish()
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

/// An open position subscription.
#[derive(Debug)]
pub struct PositionWatch {
    samples: mpsc::Receiver<PositionSample>,
    guard: WatchGuard,
}

impl PositionWatch {
    /// Assemble a watch from its sample queue and removal guard.
    #[must_use]
    pub fn new(samples: mpsc::Receiver<PositionSample>, guard: WatchGuard) -> Self {
        Self { samples, guard }
    }

    /// Next sample, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<PositionSample> {
        self.samples.recv().await
    }

    /// Remove the platform subscription now.
    ///
    /// Samples already queued are discarded.
    pub fn remove(mut self) {
        self.guard.remove();
        self.samples.close();
    }
}
