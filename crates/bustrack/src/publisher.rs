//! Driver-side position publishing.
//!
//! A [`LocationPublisher`] turns device positions into `check` frames for
//! one route and leg. Each activation asks for location permission, opens
//! a single position watch and publishes every admitted sample with a
//! fresh [`Stamp`]. Stopping removes the watch before the channel
//! reference is released, and a new activation never opens its watch until
//! the previous one is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ConnectionManager};
use crate::config::TrackingConfig;
use crate::error::Result;
use crate::location::{LocationProvider, PositionWatch, WatchOptions};
use crate::model::{Route, SessionKey, Stamp, TrackType};
use crate::wire::{CheckPayload, DriverIdentity};

/// Lifecycle of a publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublisherState {
    /// Never started.
    #[default]
    Idle,
    /// Waiting on the permission prompt.
    RequestingPermission,
    /// Watching the device and publishing.
    Active,
    /// The user refused location access.
    PermissionDenied,
    /// Toggled off.
    Stopped,
}

#[derive(Debug)]
struct Activation {
    key: SessionKey,
    track_type: TrackType,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Publishes the device position of one driver.
pub struct LocationPublisher {
    provider: Arc<dyn LocationProvider>,
    manager: ConnectionManager,
    options: WatchOptions,
    state: watch::Sender<PublisherState>,
    published: Arc<AtomicU64>,
    last_epoch: i64,
    active: Option<Activation>,
}

impl std::fmt::Debug for LocationPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationPublisher")
            .field("state", &self.state())
            .field("options", &self.options)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl LocationPublisher {
    /// Create an idle publisher.
    #[must_use]
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        manager: ConnectionManager,
        config: &TrackingConfig,
    ) -> Self {
        let (state, _) = watch::channel(PublisherState::Idle);
        Self {
            provider,
            manager,
            options: WatchOptions::from(config),
            state,
            published: Arc::new(AtomicU64::new(0)),
            last_epoch: 0,
            active: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PublisherState {
        *self.state.borrow()
    }

    /// Follow lifecycle changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<PublisherState> {
        self.state.subscribe()
    }

    /// Samples published since creation.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// The route and leg being published, while active.
    #[must_use]
    pub fn session(&self) -> Option<(&SessionKey, TrackType)> {
        self.active.as_ref().map(|a| (&a.key, a.track_type))
    }

    /// Whether a publishing task is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Start publishing `route` for `track_type`.
    ///
    /// Any previous activation is fully stopped first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::PermissionDenied`] if the user refuses
    /// location access, or the provider's error if the watch cannot be
    /// opened. Nothing is published in either case.
    pub async fn start(
        &mut self,
        route: Route,
        track_type: TrackType,
        driver: DriverIdentity,
    ) -> Result<()> {
        self.teardown().await;
        let key = route.session_key();

        self.state.send_replace(PublisherState::RequestingPermission);
        let permission = self.provider.request_permission().await;
        if !permission.is_granted {
            warn!(session = %key, "Location permission denied, not publishing");
            self.state.send_replace(PublisherState::PermissionDenied);
            return permission.require();
        }

        let mut channel = Channel::new(self.manager.clone(), key.clone());
        channel.connect();

        let watch = match self.provider.watch_position(self.options) {
            Ok(watch) => watch,
            Err(e) => {
                warn!(session = %key, error = %e, "Failed to open position watch");
                channel.disconnect();
                self.state.send_replace(PublisherState::Stopped);
                return Err(e);
            }
        };

        let epoch = Utc::now().timestamp_millis().max(self.last_epoch + 1);
        self.last_epoch = epoch;

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(publish_loop(PublishLoop {
            watch,
            channel,
            route,
            track_type,
            driver,
            epoch,
            published: Arc::clone(&self.published),
            stopped,
        }));

        info!(session = %key, %track_type, epoch, "Publishing started");
        self.active = Some(Activation {
            key,
            track_type,
            stop,
            task,
        });
        self.state.send_replace(PublisherState::Active);
        Ok(())
    }

    /// Stop publishing. Idempotent.
    pub async fn stop(&mut self) {
        self.teardown().await;
        self.state.send_replace(PublisherState::Stopped);
    }

    async fn teardown(&mut self) {
        let Some(activation) = self.active.take() else {
            return;
        };
        let _ = activation.stop.send(());
        if let Err(e) = activation.task.await {
            warn!(session = %activation.key, error = %e, "Publisher task failed");
        }
        info!(session = %activation.key, "Publishing stopped");
    }
}

impl Drop for LocationPublisher {
    fn drop(&mut self) {
        if let Some(activation) = self.active.take() {
            let _ = activation.stop.send(());
        }
    }
}

struct PublishLoop {
    watch: PositionWatch,
    channel: Channel,
    route: Route,
    track_type: TrackType,
    driver: DriverIdentity,
    epoch: i64,
    published: Arc<AtomicU64>,
    stopped: oneshot::Receiver<()>,
}

async fn publish_loop(mut run: PublishLoop) {
    let mut seq = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut run.stopped => break,
            sample = run.watch.next() => {
                let Some(sample) = sample else {
                    debug!(session = %run.channel.key(), "Position watch ended");
                    break;
                };
                seq += 1;
                run.channel.publish(CheckPayload::new(
                    &run.route,
                    run.track_type,
                    &run.driver,
                    sample,
                    Stamp::new(run.epoch, seq),
                ));
                run.published.fetch_add(1, Ordering::Relaxed);
                trace!(session = %run.channel.key(), seq, %sample, "Published position");
            }
        }
    }

    // The watch goes before the channel reference.
    run.watch.remove();
    run.channel.disconnect();
}
