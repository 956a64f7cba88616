//! Tracking sessions.
//!
//! A [`TrackingSession`] is what the app screens hold: one user on one leg
//! of their school's transport, either driving (publishing) or watching
//! (consuming). It checks the user's transport record before anything
//! runs and sequences every teardown before the next start.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::channel::ConnectionManager;
use crate::config::TrackingConfig;
use crate::consumer::LocationConsumer;
use crate::error::{Error, Result};
use crate::location::LocationProvider;
use crate::model::TrackType;
use crate::publisher::LocationPublisher;
use crate::routes::RouteStopResolver;
use crate::wire::DriverIdentity;

/// Which side of the tracking a session plays.
#[derive(Debug)]
enum Engine {
    Driver {
        identity: DriverIdentity,
        publisher: LocationPublisher,
    },
    Viewer(LocationConsumer),
}

/// Public summary of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// School id.
    pub school_id: String,
    /// Route currently assigned, once resolved from the transport record.
    pub route_id: Option<String>,
    /// Leg being tracked.
    pub track_type: TrackType,
    /// Whether publishing or polling is running.
    pub active: bool,
}

/// One user's tracking session.
#[derive(Debug)]
pub struct TrackingSession {
    school_id: String,
    user_id: String,
    route_id: Option<String>,
    track_type: TrackType,
    active: bool,
    resolver: RouteStopResolver,
    engine: Engine,
}

impl TrackingSession {
    /// A session that publishes the device position of `identity`.
    #[must_use]
    pub fn driver(
        school_id: impl Into<String>,
        user_id: impl Into<String>,
        identity: DriverIdentity,
        provider: Arc<dyn LocationProvider>,
        resolver: RouteStopResolver,
        manager: ConnectionManager,
        config: &TrackingConfig,
    ) -> Self {
        let publisher = LocationPublisher::new(provider, manager, config);
        Self::with_engine(
            school_id.into(),
            user_id.into(),
            resolver,
            Engine::Driver {
                identity,
                publisher,
            },
        )
    }

    /// A session that watches the bus of the user's route.
    #[must_use]
    pub fn viewer(
        school_id: impl Into<String>,
        user_id: impl Into<String>,
        resolver: RouteStopResolver,
        manager: ConnectionManager,
        config: &TrackingConfig,
    ) -> Self {
        let consumer = LocationConsumer::new(resolver.clone(), manager, config);
        Self::with_engine(
            school_id.into(),
            user_id.into(),
            resolver,
            Engine::Viewer(consumer),
        )
    }

    fn with_engine(
        school_id: String,
        user_id: String,
        resolver: RouteStopResolver,
        engine: Engine,
    ) -> Self {
        Self {
            school_id,
            user_id,
            route_id: None,
            track_type: TrackType::Pickup,
            active: false,
            resolver,
            engine,
        }
    }

    /// Choose the leg before the first start.
    #[must_use]
    pub fn with_track_type(mut self, track_type: TrackType) -> Self {
        self.track_type = track_type;
        self
    }

    /// School id.
    #[must_use]
    pub fn school_id(&self) -> &str {
        &self.school_id
    }

    /// User id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The route picked at the last start.
    #[must_use]
    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    /// Leg being tracked.
    #[must_use]
    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    /// Whether publishing or polling is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether this session publishes.
    #[must_use]
    pub fn is_driver(&self) -> bool {
        matches!(self.engine, Engine::Driver { .. })
    }

    /// Summary for display.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            school_id: self.school_id.clone(),
            route_id: self.route_id.clone(),
            track_type: self.track_type,
            active: self.active,
        }
    }

    /// The publisher of a driver session.
    #[must_use]
    pub fn publisher(&self) -> Option<&LocationPublisher> {
        match &self.engine {
            Engine::Driver { publisher, .. } => Some(publisher),
            Engine::Viewer(_) => None,
        }
    }

    /// The consumer of a viewer session.
    #[must_use]
    pub fn consumer(&self) -> Option<&LocationConsumer> {
        match &self.engine {
            Engine::Viewer(consumer) => Some(consumer),
            Engine::Driver { .. } => None,
        }
    }

    /// Start tracking the route assigned to the current leg.
    ///
    /// Anything already running is stopped first.
    ///
    /// # Errors
    ///
    /// - [`Error::TransportNotFound`] or [`Error::Network`] if the
    ///   transport record cannot be fetched
    /// - [`Error::TransportInactive`] unless the record is active
    /// - [`Error::NoRouteAssigned`] if the leg has no route
    /// - route resolution, permission or watch errors from the engine
    pub async fn start(&mut self) -> Result<()> {
        self.stop().await;
        self.route_id = None;

        let record = self
            .resolver
            .transport(&self.school_id, &self.user_id)
            .await?;
        if !record.is_active() {
            info!(user = %self.user_id, "Transport inactive, not tracking");
            return Err(Error::TransportInactive {
                user_id: self.user_id.clone(),
            });
        }

        let route_id = record
            .route_for(self.track_type)
            .ok_or(Error::NoRouteAssigned {
                track_type: self.track_type,
            })?
            .to_string();

        match &mut self.engine {
            Engine::Driver {
                identity,
                publisher,
            } => {
                let route = self.resolver.resolve(&route_id, &self.school_id).await?;
                publisher
                    .start(route, self.track_type, identity.clone())
                    .await?;
            }
            Engine::Viewer(consumer) => {
                consumer
                    .start(&self.school_id, &route_id, self.track_type)
                    .await?;
            }
        }

        info!(
            school = %self.school_id,
            route = %route_id,
            track_type = %self.track_type,
            driver = self.is_driver(),
            "Session started"
        );
        self.route_id = Some(route_id);
        self.active = true;
        Ok(())
    }

    /// Tear everything down. Idempotent.
    pub async fn stop(&mut self) {
        match &mut self.engine {
            Engine::Driver { publisher, .. } => publisher.stop().await,
            Engine::Viewer(consumer) => consumer.stop().await,
        }
        if self.active {
            info!(school = %self.school_id, user = %self.user_id, "Session stopped");
        }
        self.active = false;
    }

    /// Switch legs: full teardown, then start on `track_type`.
    ///
    /// # Errors
    ///
    /// Fails like [`start`](Self::start).
    pub async fn switch_track_type(&mut self, track_type: TrackType) -> Result<()> {
        self.stop().await;
        self.track_type = track_type;
        self.start().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::channel::{ConnectionState, LocalHub};
    use crate::config::{ConnectionConfig, DirectoryConfig};
    use crate::consumer::PositionSource;
    use crate::location::SimulatedDevice;
    use crate::model::{PositionSample, SessionKey, TransportRecord, TransportStatus};
    use crate::publisher::PublisherState;
    use crate::routes::StaticDirectory;

    const GATE_A: PositionSample = PositionSample::new(12.900, 77.600);
    const SCHOOL: PositionSample = PositionSample::new(12.920, 77.620);

    struct World {
        hub: LocalHub,
        device: SimulatedDevice,
        manager: ConnectionManager,
        resolver: RouteStopResolver,
        config: TrackingConfig,
    }

    impl World {
        fn new() -> Self {
            Self::with_directory(StaticDirectory::demo())
        }

        fn with_directory(directory: StaticDirectory) -> Self {
            let hub = LocalHub::new();
            Self {
                device: SimulatedDevice::new(),
                manager: ConnectionManager::new(
                    Arc::new(hub.clone()),
                    ConnectionConfig::default(),
                ),
                resolver: RouteStopResolver::new(
                    Arc::new(directory),
                    &DirectoryConfig::default(),
                ),
                config: TrackingConfig::default(),
                hub,
            }
        }

        fn driver(&self) -> TrackingSession {
            TrackingSession::driver(
                "S1",
                "D1",
                DriverIdentity::staff("D1"),
                Arc::new(self.device.clone()),
                self.resolver.clone(),
                self.manager.clone(),
                &self.config,
            )
        }

        fn viewer(&self) -> TrackingSession {
            TrackingSession::viewer(
                "S1",
                "U1",
                self.resolver.clone(),
                self.manager.clone(),
                &self.config,
            )
        }
    }

    fn position(session: &TrackingSession) -> Option<PositionSample> {
        session.consumer().and_then(|c| c.view().position)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_sees_fallback_then_live() {
        let world = World::new();
        let mut viewer = world.viewer();
        let mut driver = world.driver();

        viewer.start().await.unwrap();
        assert_eq!(position(&viewer), Some(GATE_A));
        assert_eq!(viewer.route_id(), Some("R001"));

        driver.start().await.unwrap();
        world.device.push(PositionSample::new(12.905, 77.605));
        settle().await;

        assert_eq!(position(&viewer), Some(PositionSample::new(12.905, 77.605)));
        let view = viewer.consumer().unwrap().view();
        assert_eq!(view.source, PositionSource::Live);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_push_recovered_by_poll() {
        let world = World::new();
        world.hub.set_push_enabled(false);
        let mut viewer = world.viewer();
        let mut driver = world.driver();

        viewer.start().await.unwrap();
        settle().await;
        assert_eq!(world.hub.requests_seen(), 1);

        driver.start().await.unwrap();
        world.device.push(PositionSample::new(12.907, 77.607));
        settle().await;
        assert_eq!(position(&viewer), Some(GATE_A));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(world.hub.requests_seen(), 2);
        assert_eq!(position(&viewer), Some(PositionSample::new(12.907, 77.607)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_clears_and_reanchors() {
        let world = World::new();
        let mut viewer = world.viewer();
        let mut driver = world.driver();

        viewer.start().await.unwrap();
        driver.start().await.unwrap();
        world.device.push(PositionSample::new(12.905, 77.605));
        settle().await;
        assert_eq!(viewer.consumer().unwrap().view().source, PositionSource::Live);

        viewer.switch_track_type(TrackType::Drop).await.unwrap();
        let view = viewer.consumer().unwrap().view();
        assert_eq!(viewer.route_id(), Some("R002"));
        assert_eq!(view.position, Some(SCHOOL));
        assert_eq!(view.source, PositionSource::Fallback);
        assert_eq!(view.updates, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_never_publishes() {
        let world = World::new();
        world.device.set_permission(false);
        let mut driver = world.driver();

        let err = driver.start().await.unwrap_err();
        assert!(err.is_permission_error());
        assert!(!driver.is_active());
        assert_eq!(driver.info().route_id, None);
        assert_eq!(
            driver.publisher().map(LocationPublisher::state),
            Some(PublisherState::PermissionDenied)
        );

        world.device.push(PositionSample::new(12.905, 77.605));
        settle().await;
        assert_eq!(world.hub.checks_seen(), 0);
        assert_eq!(world.manager.refs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_toggle_leaves_one_watch() {
        let world = World::new();
        let mut driver = world.driver();

        for _ in 0..5 {
            driver.start().await.unwrap();
            assert_eq!(world.device.active_watches(), 1);
            driver.stop().await;
            assert_eq!(world.device.active_watches(), 0);
        }
        for track_type in [TrackType::Drop, TrackType::Pickup, TrackType::Drop] {
            driver.switch_track_type(track_type).await.unwrap();
            assert_eq!(world.device.active_watches(), 1);
        }

        driver.stop().await;
        driver.stop().await;
        assert_eq!(world.device.active_watches(), 0);
        assert_eq!(world.manager.refs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_share_one_connection() {
        let world = World::new();
        let mut viewer = world.viewer();
        let mut driver = world.driver();

        viewer.start().await.unwrap();
        driver.start().await.unwrap();
        world
            .manager
            .wait_connected(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(world.manager.refs(), 2);
        assert_eq!(world.hub.opens(), 1);

        driver.stop().await;
        assert_eq!(world.manager.state(), ConnectionState::Connected);

        viewer.stop().await;
        assert_eq!(world.manager.refs(), 0);
        assert_eq!(world.manager.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_recovers_after_reconnect() {
        let world = World::new();
        let mut viewer = world.viewer();
        let mut driver = world.driver();
        viewer.start().await.unwrap();
        driver.start().await.unwrap();
        world
            .manager
            .wait_connected(Duration::from_secs(1))
            .await
            .unwrap();

        world.hub.sever_connections();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(world.hub.opens(), 2);
        assert_eq!(world.manager.refs(), 2);

        world.hub.set_push_enabled(false);
        world.device.push(PositionSample::new(12.905, 77.605));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(position(&viewer), Some(PositionSample::new(12.905, 77.605)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_transport_refused() {
        let mut directory = StaticDirectory::demo();
        directory.insert_transport(TransportRecord {
            school_id: "S1".to_string(),
            user_id: "U1".to_string(),
            pickup_route: Some("R001".to_string()),
            drop_route: None,
            transport_status: TransportStatus::Inactive,
        });
        let world = World::with_directory(directory);
        let mut viewer = world.viewer();

        let err = viewer.start().await.unwrap_err();
        assert!(matches!(err, Error::TransportInactive { .. }));
        assert!(!viewer.is_active());
        settle().await;
        assert_eq!(world.hub.requests_seen(), 0);
        assert_eq!(world.manager.refs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_route_for_leg() {
        let mut directory = StaticDirectory::demo();
        directory.insert_transport(TransportRecord {
            school_id: "S1".to_string(),
            user_id: "U1".to_string(),
            pickup_route: Some("R001".to_string()),
            drop_route: None,
            transport_status: TransportStatus::Active,
        });
        let world = World::with_directory(directory);
        let mut viewer = world.viewer().with_track_type(TrackType::Drop);

        let err = viewer.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::NoRouteAssigned {
                track_type: TrackType::Drop
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_user() {
        let world = World::new();
        let mut viewer = TrackingSession::viewer(
            "S1",
            "nobody",
            world.resolver.clone(),
            world.manager.clone(),
            &world.config,
        );

        let err = viewer.start().await.unwrap_err();
        assert!(matches!(err, Error::TransportNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_info() {
        let world = World::new();
        let mut viewer = world.viewer();
        viewer.start().await.unwrap();

        let info = viewer.info();
        assert_eq!(info.school_id, "S1");
        assert_eq!(info.route_id.as_deref(), Some("R001"));
        assert_eq!(info.track_type, TrackType::Pickup);
        assert!(info.active);
        assert_eq!(
            viewer.consumer().and_then(LocationConsumer::session),
            Some(&SessionKey::new("S1", "R001"))
        );

        viewer.stop().await;
        assert!(!viewer.info().active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_reports_no_route() {
        let mut directory = StaticDirectory::demo();
        directory.insert_transport(TransportRecord {
            school_id: "S1".to_string(),
            user_id: "U1".to_string(),
            pickup_route: Some("R001".to_string()),
            drop_route: Some("R404".to_string()),
            transport_status: TransportStatus::Active,
        });
        let world = World::with_directory(directory);
        let mut viewer = world.viewer();
        viewer.start().await.unwrap();
        assert_eq!(viewer.route_id(), Some("R001"));

        let err = viewer.switch_track_type(TrackType::Drop).await.unwrap_err();
        assert!(err.is_route_not_found());

        let info = viewer.info();
        assert!(!info.active);
        assert_eq!(info.route_id, None);
        assert_eq!(info.track_type, TrackType::Drop);
        assert_eq!(world.manager.refs(), 0);
    }
}
