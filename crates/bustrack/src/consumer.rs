//! Viewer-side position tracking.
//!
//! A [`LocationConsumer`] keeps a [`TrackView`] of one bus current. On start
//! it resolves the route, anchors the view at the first stop, then runs a
//! single worker that asks for the last known position right away and on
//! every poll tick, and folds every response it hears into the view through
//! [`Reconciler::apply`].

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ConnectionManager, ResponseSubscription};
use crate::config::{OrderingPolicy, TrackingConfig};
use crate::error::{Error, Result};
use crate::model::{PositionSample, Route, SessionKey, Stamp, TrackType};
use crate::routes::RouteStopResolver;
use crate::wire::Track;

/// Where the displayed position came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    /// Nothing to display.
    #[default]
    None,
    /// The route's first stop, shown until a live position arrives.
    Fallback,
    /// A position published by the driver.
    Live,
}

/// What a viewer renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackView {
    /// The resolved route, for drawing stops and the path.
    pub route: Option<Route>,
    /// Leg being watched.
    pub track_type: TrackType,
    /// Bus marker position.
    pub position: Option<PositionSample>,
    /// Origin of `position`.
    pub source: PositionSource,
    /// Stamp of the newest live sample applied.
    pub stamp: Option<Stamp>,
    /// Live positions applied since the view was reset.
    pub updates: u64,
}

impl TrackView {
    /// A view with nothing resolved yet.
    #[must_use]
    pub fn empty(track_type: TrackType) -> Self {
        Self {
            route: None,
            track_type,
            position: None,
            source: PositionSource::None,
            stamp: None,
            updates: 0,
        }
    }

    /// A view of `route` anchored at its first stop.
    #[must_use]
    pub fn anchored(route: Route, track_type: TrackType) -> Self {
        let position = route.fallback_anchor();
        Self {
            source: if position.is_some() {
                PositionSource::Fallback
            } else {
                PositionSource::None
            },
            position,
            route: Some(route),
            ..Self::empty(track_type)
        }
    }
}

/// Result of folding one response into a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A new live position is displayed.
    Updated,
    /// Same position as before; nothing to redraw.
    Unchanged,
    /// Older than what is displayed; discarded.
    Stale,
    /// Concerns another route or school.
    Ignored,
    /// No coordinate for this leg; the fallback stays.
    Fallback,
}

impl Outcome {
    /// Whether the view changed in a way worth re-rendering.
    #[must_use]
    pub fn changed(self) -> bool {
        self == Self::Updated
    }
}

/// Folds responses into a [`TrackView`].
#[derive(Debug, Clone)]
pub struct Reconciler {
    key: SessionKey,
    track_type: TrackType,
    ordering: OrderingPolicy,
}

impl Reconciler {
    /// Create a reconciler for one session and leg.
    #[must_use]
    pub fn new(key: SessionKey, track_type: TrackType, ordering: OrderingPolicy) -> Self {
        Self {
            key,
            track_type,
            ordering,
        }
    }

    /// Apply one response.
    pub fn apply(&self, view: &mut TrackView, track: &Track) -> Outcome {
        if !track.concerns(&self.key) {
            return Outcome::Ignored;
        }

        let Some(position) = track.location(self.track_type) else {
            return if view.source == PositionSource::Live {
                Outcome::Unchanged
            } else {
                Outcome::Fallback
            };
        };

        let stamp = track.stamp();
        if self.ordering == OrderingPolicy::Sequenced {
            if let (Some(incoming), Some(current)) = (stamp, view.stamp) {
                if incoming.is_stale_against(&current) {
                    return Outcome::Stale;
                }
                if incoming.epoch < current.epoch {
                    debug!(
                        session = %self.key,
                        current = current.epoch,
                        incoming = incoming.epoch,
                        "Publisher epoch went backwards, following new activation"
                    );
                }
            }
        }
        if stamp.is_some() {
            view.stamp = stamp;
        }

        if view.source == PositionSource::Live && view.position == Some(position) {
            return Outcome::Unchanged;
        }

        view.position = Some(position);
        view.source = PositionSource::Live;
        view.updates += 1;
        Outcome::Updated
    }
}

#[derive(Debug)]
struct Worker {
    key: SessionKey,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Tracks one bus for a viewer.
#[derive(Debug)]
pub struct LocationConsumer {
    resolver: RouteStopResolver,
    manager: ConnectionManager,
    config: TrackingConfig,
    view: Arc<watch::Sender<TrackView>>,
    target: Option<(String, String, TrackType)>,
    worker: Option<Worker>,
}

impl LocationConsumer {
    /// Create an idle consumer.
    #[must_use]
    pub fn new(
        resolver: RouteStopResolver,
        manager: ConnectionManager,
        config: &TrackingConfig,
    ) -> Self {
        let (view, _) = watch::channel(TrackView::empty(TrackType::Pickup));
        Self {
            resolver,
            manager,
            config: config.clone(),
            view: Arc::new(view),
            target: None,
            worker: None,
        }
    }

    /// Snapshot of the current view.
    #[must_use]
    pub fn view(&self) -> TrackView {
        self.view.borrow().clone()
    }

    /// Follow view changes.
    #[must_use]
    pub fn watch_view(&self) -> watch::Receiver<TrackView> {
        self.view.subscribe()
    }

    /// Whether the poll worker is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }

    /// The session being tracked, while active.
    #[must_use]
    pub fn session(&self) -> Option<&SessionKey> {
        self.worker.as_ref().map(|w| &w.key)
    }

    /// Start tracking `route_id` of `school_id` for `track_type`.
    ///
    /// Any previous tracking is torn down and the view cleared first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouteNotFound`] or [`Error::Network`] if the route
    /// cannot be resolved. The view then has no route and no position and
    /// no polling runs. Returns [`Error::ConfigValidation`] without
    /// touching the view if the tracking settings are unusable.
    pub async fn start(
        &mut self,
        school_id: &str,
        route_id: &str,
        track_type: TrackType,
    ) -> Result<()> {
        self.teardown().await;
        self.config.validate()?;
        self.target = Some((school_id.to_string(), route_id.to_string(), track_type));
        self.view.send_replace(TrackView::empty(track_type));

        let route = match self.resolver.resolve(route_id, school_id).await {
            Ok(route) => route,
            Err(e) => {
                warn!(route_id, school_id, error = %e, "Cannot track unresolved route");
                return Err(e);
            }
        };

        let key = route.session_key();
        self.view.send_replace(TrackView::anchored(route, track_type));

        let mut channel = Channel::new(self.manager.clone(), key.clone());
        channel.connect();
        let responses = channel.on_response();

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(poll_loop(PollLoop {
            channel,
            responses,
            reconciler: Reconciler::new(key.clone(), track_type, self.config.ordering),
            view: Arc::clone(&self.view),
            config: self.config.clone(),
            stopped,
        }));

        info!(session = %key, %track_type, "Tracking started");
        self.worker = Some(Worker { key, stop, task });
        Ok(())
    }

    /// Watch the other leg of the same route.
    ///
    /// # Errors
    ///
    /// Fails like [`start`](Self::start), or with an internal error if the
    /// consumer was never started.
    pub async fn switch_track_type(&mut self, track_type: TrackType) -> Result<()> {
        let (school_id, route_id, _) = self.require_target()?;
        self.start(&school_id, &route_id, track_type).await
    }

    /// Watch another route of the same school and leg.
    ///
    /// # Errors
    ///
    /// Fails like [`start`](Self::start), or with an internal error if the
    /// consumer was never started.
    pub async fn switch_route(&mut self, route_id: &str) -> Result<()> {
        let (school_id, _, track_type) = self.require_target()?;
        self.start(&school_id, route_id, track_type).await
    }

    /// Stop tracking. The view keeps its last value. Idempotent.
    pub async fn stop(&mut self) {
        self.teardown().await;
    }

    fn require_target(&self) -> Result<(String, String, TrackType)> {
        self.target
            .clone()
            .ok_or_else(|| Error::internal("consumer has not been started"))
    }

    async fn teardown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.stop.send(());
        if let Err(e) = worker.task.await {
            warn!(session = %worker.key, error = %e, "Consumer task failed");
        }
        info!(session = %worker.key, "Tracking stopped");
    }
}

impl Drop for LocationConsumer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop.send(());
        }
    }
}

struct PollLoop {
    channel: Channel,
    responses: ResponseSubscription,
    reconciler: Reconciler,
    view: Arc<watch::Sender<TrackView>>,
    config: TrackingConfig,
    stopped: oneshot::Receiver<()>,
}

async fn poll_loop(mut run: PollLoop) {
    // The first tick completes immediately, so the first request goes out
    // as soon as the worker runs.
    let mut ticker = tokio::time::interval(run.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut run.stopped => break,
            response = run.responses.recv() => {
                let Some(track) = response else {
                    debug!(session = %run.channel.key(), "Response queue closed");
                    break;
                };
                let reconciler = &run.reconciler;
                run.view.send_if_modified(|view| {
                    let outcome = reconciler.apply(view, &track);
                    trace!(?outcome, "Reconciled response");
                    outcome.changed()
                });
            }
            _ = ticker.tick() => {
                trace!(session = %run.channel.key(), "Requesting position");
                run.channel.request();
            }
        }
    }

    // Timer, handler, then connection reference.
    drop(ticker);
    drop(run.responses);
    run.channel.disconnect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::channel::LocalHub;
    use crate::config::{ConnectionConfig, DirectoryConfig};
    use crate::routes::StaticDirectory;

    const ANCHOR: PositionSample = PositionSample::new(12.900, 77.600);

    fn key() -> SessionKey {
        SessionKey::new("S1", "R001")
    }

    fn track(lat: f64, lng: f64, stamp: Option<Stamp>) -> Track {
        Track {
            pickup_location: vec![PositionSample::new(lat, lng)],
            drop_location: vec![PositionSample::new(lat, lng)],
            route_id: Some("R001".to_string()),
            track_schoolid: Some("S1".to_string()),
            track_epoch: stamp.map(|s| s.epoch),
            track_seq: stamp.map(|s| s.seq),
        }
    }

    fn anchored_view() -> TrackView {
        TrackView {
            position: Some(ANCHOR),
            source: PositionSource::Fallback,
            ..TrackView::empty(TrackType::Pickup)
        }
    }

    fn reconciler(ordering: OrderingPolicy) -> Reconciler {
        Reconciler::new(key(), TrackType::Pickup, ordering)
    }

    #[test]
    fn test_live_position_replaces_fallback() {
        let mut view = anchored_view();
        let outcome = reconciler(OrderingPolicy::Sequenced)
            .apply(&mut view, &track(12.905, 77.605, None));

        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(view.position, Some(PositionSample::new(12.905, 77.605)));
        assert_eq!(view.source, PositionSource::Live);
        assert_eq!(view.updates, 1);
    }

    #[test]
    fn test_same_position_is_unchanged() {
        let mut view = anchored_view();
        let r = reconciler(OrderingPolicy::Sequenced);
        r.apply(&mut view, &track(12.905, 77.605, None));

        assert_eq!(r.apply(&mut view, &track(12.905, 77.605, None)), Outcome::Unchanged);
        assert_eq!(view.updates, 1);
    }

    #[test]
    fn test_missing_leg_keeps_fallback() {
        let mut view = anchored_view();
        let response = Track {
            drop_location: vec![PositionSample::new(1.0, 1.0)],
            ..Track::default()
        };

        let outcome = reconciler(OrderingPolicy::Sequenced).apply(&mut view, &response);
        assert_eq!(outcome, Outcome::Fallback);
        assert_eq!(view.position, Some(ANCHOR));
        assert_eq!(view.source, PositionSource::Fallback);
    }

    #[test]
    fn test_missing_leg_after_live_keeps_live() {
        let mut view = anchored_view();
        let r = reconciler(OrderingPolicy::Sequenced);
        r.apply(&mut view, &track(12.905, 77.605, None));

        assert_eq!(r.apply(&mut view, &Track::default()), Outcome::Unchanged);
        assert_eq!(view.position, Some(PositionSample::new(12.905, 77.605)));
    }

    #[test]
    fn test_other_route_ignored() {
        let mut view = anchored_view();
        let mut response = track(1.0, 1.0, None);
        response.route_id = Some("R002".to_string());

        let outcome = reconciler(OrderingPolicy::Sequenced).apply(&mut view, &response);
        assert_eq!(outcome, Outcome::Ignored);
        assert_eq!(view.position, Some(ANCHOR));
    }

    #[test]
    fn test_sequenced_discards_older_stamp() {
        let mut view = anchored_view();
        let r = reconciler(OrderingPolicy::Sequenced);
        r.apply(&mut view, &track(12.905, 77.605, Some(Stamp::new(10, 5))));

        let outcome = r.apply(&mut view, &track(12.901, 77.601, Some(Stamp::new(10, 4))));
        assert_eq!(outcome, Outcome::Stale);
        assert_eq!(view.position, Some(PositionSample::new(12.905, 77.605)));
        assert_eq!(view.stamp, Some(Stamp::new(10, 5)));
    }

    #[test]
    fn test_sequenced_accepts_newer_epoch() {
        let mut view = anchored_view();
        let r = reconciler(OrderingPolicy::Sequenced);
        r.apply(&mut view, &track(12.905, 77.605, Some(Stamp::new(10, 5))));

        let outcome = r.apply(&mut view, &track(12.901, 77.601, Some(Stamp::new(11, 1))));
        assert_eq!(outcome, Outcome::Updated);
    }

    #[test]
    fn test_sequenced_follows_regressed_epoch() {
        let mut view = anchored_view();
        let r = reconciler(OrderingPolicy::Sequenced);
        r.apply(
            &mut view,
            &track(12.905, 77.605, Some(Stamp::new(1_700_000_060_000, 40))),
        );

        // A second device whose clock runs a minute behind takes over.
        let path = [(12.906, 77.606), (12.907, 77.607), (12.908, 77.608)];
        for (seq, &(lat, lng)) in (1..).zip(path.iter()) {
            let stamp = Stamp::new(1_700_000_000_000, seq);
            let outcome = r.apply(&mut view, &track(lat, lng, Some(stamp)));
            assert_eq!(outcome, Outcome::Updated);
        }
        assert_eq!(view.position, Some(PositionSample::new(12.908, 77.608)));
        assert_eq!(view.stamp, Some(Stamp::new(1_700_000_000_000, 3)));

        // Ordering still applies within the new activation.
        let late = track(12.907, 77.607, Some(Stamp::new(1_700_000_000_000, 2)));
        assert_eq!(r.apply(&mut view, &late), Outcome::Stale);
    }

    #[test]
    fn test_last_write_wins_accepts_older_stamp() {
        let mut view = anchored_view();
        let r = reconciler(OrderingPolicy::LastWriteWins);
        r.apply(&mut view, &track(12.905, 77.605, Some(Stamp::new(10, 5))));

        let outcome = r.apply(&mut view, &track(12.901, 77.601, Some(Stamp::new(10, 4))));
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(view.position, Some(PositionSample::new(12.901, 77.601)));
    }

    #[test]
    fn test_unstamped_always_accepted() {
        let mut view = anchored_view();
        let r = reconciler(OrderingPolicy::Sequenced);
        r.apply(&mut view, &track(12.905, 77.605, Some(Stamp::new(10, 5))));

        let outcome = r.apply(&mut view, &track(12.901, 77.601, None));
        assert_eq!(outcome, Outcome::Updated);
    }

    struct Fixture {
        hub: LocalHub,
        manager: ConnectionManager,
        consumer: LocationConsumer,
    }

    fn fixture() -> Fixture {
        let hub = LocalHub::new();
        let manager = ConnectionManager::new(Arc::new(hub.clone()), ConnectionConfig::default());
        let resolver = RouteStopResolver::new(
            Arc::new(StaticDirectory::demo()),
            &DirectoryConfig::default(),
        );
        let consumer =
            LocationConsumer::new(resolver, manager.clone(), &TrackingConfig::default());
        Fixture {
            hub,
            manager,
            consumer,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_anchors_and_requests() {
        let mut f = fixture();
        f.consumer.start("S1", "R001", TrackType::Pickup).await.unwrap();

        let view = f.consumer.view();
        assert_eq!(view.position, Some(ANCHOR));
        assert_eq!(view.source, PositionSource::Fallback);
        assert_eq!(view.route.map(|r| r.stops.len()), Some(2));

        settle().await;
        assert_eq!(f.hub.requests_seen(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_every_interval() {
        let mut f = fixture();
        f.consumer.start("S1", "R001", TrackType::Pickup).await.unwrap();
        settle().await;
        assert_eq!(f.hub.requests_seen(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.hub.requests_seen(), 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.hub.requests_seen(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seeded_track_is_shown() {
        let mut f = fixture();
        f.hub.seed_track(&key(), track(12.905, 77.605, None));

        f.consumer.start("S1", "R001", TrackType::Pickup).await.unwrap();
        settle().await;

        let view = f.consumer.view();
        assert_eq!(view.position, Some(PositionSample::new(12.905, 77.605)));
        assert_eq!(view.source, PositionSource::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_route_does_not_poll() {
        let mut f = fixture();
        let err = f
            .consumer
            .start("S1", "R999", TrackType::Pickup)
            .await
            .unwrap_err();
        assert!(err.is_route_not_found());

        let view = f.consumer.view();
        assert!(view.route.is_none());
        assert!(view.position.is_none());
        assert!(!f.consumer.is_active());

        settle().await;
        assert_eq!(f.manager.refs(), 0);
        assert_eq!(f.hub.requests_seen(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_track_type_reanchors() {
        let mut f = fixture();
        f.hub.seed_track(&key(), track(12.905, 77.605, None));
        f.consumer.start("S1", "R001", TrackType::Pickup).await.unwrap();
        settle().await;
        assert_eq!(f.consumer.view().source, PositionSource::Live);

        f.hub.seed_track(
            &key(),
            Track {
                pickup_location: vec![PositionSample::new(12.905, 77.605)],
                ..Track::default()
            },
        );
        f.consumer.switch_track_type(TrackType::Drop).await.unwrap();

        let view = f.consumer.view();
        assert_eq!(view.track_type, TrackType::Drop);
        assert_eq!(view.position, Some(ANCHOR));
        assert_eq!(view.source, PositionSource::Fallback);
        assert_eq!(view.updates, 0);
        assert_eq!(f.manager.refs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_route() {
        let mut f = fixture();
        f.consumer.start("S1", "R001", TrackType::Drop).await.unwrap();
        f.consumer.switch_route("R002").await.unwrap();

        let view = f.consumer.view();
        assert_eq!(view.position, Some(PositionSample::new(12.920, 77.620)));
        assert_eq!(f.consumer.session(), Some(&SessionKey::new("S1", "R002")));
        assert_eq!(f.manager.refs(), 1);
    }

    #[tokio::test]
    async fn test_switch_before_start_fails() {
        let mut f = fixture();
        assert!(f.consumer.switch_track_type(TrackType::Drop).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_poll_interval_refused() {
        let hub = LocalHub::new();
        let manager = ConnectionManager::new(Arc::new(hub.clone()), ConnectionConfig::default());
        let resolver = RouteStopResolver::new(
            Arc::new(StaticDirectory::demo()),
            &DirectoryConfig::default(),
        );
        let config = TrackingConfig {
            poll_interval_ms: 0,
            ..TrackingConfig::default()
        };
        let mut consumer = LocationConsumer::new(resolver, manager.clone(), &config);

        let err = consumer
            .start("S1", "R001", TrackType::Pickup)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));
        assert!(!consumer.is_active());
        assert_eq!(manager.refs(), 0);

        settle().await;
        assert_eq!(hub.requests_seen(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let mut f = fixture();
        f.consumer.start("S1", "R001", TrackType::Pickup).await.unwrap();
        settle().await;
        assert_eq!(f.hub.requests_seen(), 1);
        let view = f.consumer.watch_view();

        drop(f.consumer);
        settle().await;
        assert_eq!(f.manager.refs(), 0);

        f.hub.seed_track(&key(), track(12.909, 77.609, None));
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert_eq!(f.hub.requests_seen(), 1);
        assert_eq!(view.borrow().position, Some(ANCHOR));
        assert_eq!(view.borrow().source, PositionSource::Fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_frozen_after_stop() {
        let mut f = fixture();
        f.consumer.start("S1", "R001", TrackType::Pickup).await.unwrap();
        settle().await;

        f.consumer.stop().await;
        assert_eq!(f.manager.refs(), 0);
        let before = f.consumer.view();

        f.hub.seed_track(&key(), track(12.909, 77.609, None));
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert_eq!(f.consumer.view(), before);
        assert_eq!(f.hub.requests_seen(), 1);
    }
}
