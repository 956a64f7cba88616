//! Scripted driver/viewer run against an in-process relay.
//!
//! Used by `bustrack simulate`: a driver session moves along its route in
//! even steps while a viewer session of the same school watches, and the
//! viewer's display is recorded after every step.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::channel::{ConnectionManager, LocalHub};
use crate::config::Config;
use crate::consumer::{PositionSource, TrackView};
use crate::error::{Error, Result};
use crate::location::SimulatedDevice;
use crate::model::{PositionSample, Route, TrackType};
use crate::routes::{RouteDirectory, RouteStopResolver};
use crate::session::TrackingSession;
use crate::wire::DriverIdentity;

/// Time given to frames to cross the relay before a step is recorded.
const SETTLE: Duration = Duration::from_millis(50);

/// What to simulate.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    /// School of both sessions.
    pub school_id: String,
    /// Viewer user id.
    pub viewer_id: String,
    /// Driver staff id.
    pub driver_id: String,
    /// Leg driven and watched.
    pub track_type: TrackType,
    /// Positions to publish.
    pub steps: usize,
    /// Wait between positions. Raised to the minimum update interval.
    pub step_interval: Option<Duration>,
    /// Relay does not push `check`s to viewers.
    pub drop_pushes: bool,
}

/// The viewer's display after one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationStep {
    /// Step number, from 1.
    pub step: usize,
    /// Position the device reported.
    pub published: PositionSample,
    /// Position the viewer displays.
    pub displayed: Option<PositionSample>,
    /// Origin of the displayed position.
    pub source: PositionSource,
}

/// Outcome of a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// The driven route.
    pub route: Route,
    /// Leg driven.
    pub track_type: TrackType,
    /// One entry per published position.
    pub steps: Vec<SimulationStep>,
    /// Viewer display one poll interval after the last step.
    pub final_view: TrackView,
    /// `check` frames the relay received.
    pub checks: usize,
    /// `get-bus-track` frames the relay received.
    pub requests: usize,
}

/// Evenly spaced points along the stops of `route`, first to last stop.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn route_path(route: &Route, steps: usize) -> Vec<PositionSample> {
    let points: Vec<PositionSample> = route.stops.iter().map(|s| s.position()).collect();
    match (points.as_slice(), steps) {
        ([], _) | (_, 0) => Vec::new(),
        ([only], _) => vec![*only; steps],
        (_, 1) => vec![points[0]],
        _ => {
            let segments = points.len() - 1;
            (0..steps)
                .map(|i| {
                    if i == steps - 1 {
                        return points[segments];
                    }
                    let t = i as f64 / (steps - 1) as f64 * segments as f64;
                    let index = (t.floor() as usize).min(segments - 1);
                    let frac = t - index as f64;
                    let (a, b) = (points[index], points[index + 1]);
                    PositionSample::new(a.lat + (b.lat - a.lat) * frac, a.lng + (b.lng - a.lng) * frac)
                })
                .collect()
        }
    }
}

/// Run a driver and a viewer until the driver has covered its route.
///
/// # Errors
///
/// Returns any error from starting either session, or
/// [`Error::ChannelUnavailable`] if the relay connection does not open.
pub async fn run_simulation(
    config: &Config,
    directory: Arc<dyn RouteDirectory>,
    options: &SimulationOptions,
) -> Result<SimulationReport> {
    let hub = LocalHub::new();
    hub.set_push_enabled(!options.drop_pushes);

    let manager = ConnectionManager::new(Arc::new(hub.clone()), config.connection.clone());
    let resolver = RouteStopResolver::new(directory, &config.directory);
    let device = SimulatedDevice::new();

    let mut driver = TrackingSession::driver(
        options.school_id.clone(),
        options.driver_id.clone(),
        DriverIdentity::staff(options.driver_id.clone()),
        Arc::new(device.clone()),
        resolver.clone(),
        manager.clone(),
        &config.tracking,
    )
    .with_track_type(options.track_type);
    let mut viewer = TrackingSession::viewer(
        options.school_id.clone(),
        options.viewer_id.clone(),
        resolver.clone(),
        manager.clone(),
        &config.tracking,
    )
    .with_track_type(options.track_type);

    driver.start().await?;
    viewer.start().await?;
    manager.wait_connected(config.directory.request_timeout()).await?;

    let route_id = driver
        .route_id()
        .ok_or_else(|| Error::internal("driver started without a route"))?
        .to_string();
    let route = resolver.resolve(&route_id, &options.school_id).await?;
    if viewer.route_id() != Some(route_id.as_str()) {
        info!(
            driver_route = %route_id,
            viewer_route = viewer.route_id().unwrap_or("-"),
            "Driver and viewer follow different routes"
        );
    }

    let step_interval = options
        .step_interval
        .unwrap_or_default()
        .max(config.tracking.min_update_interval());
    let mut steps = Vec::with_capacity(options.steps);

    for (i, position) in route_path(&route, options.steps).into_iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(step_interval.saturating_sub(SETTLE)).await;
        }
        device.push(position);
        tokio::time::sleep(SETTLE).await;

        let view = viewer_view(&viewer);
        debug!(step = i + 1, %position, "Simulation step");
        steps.push(SimulationStep {
            step: i + 1,
            published: position,
            displayed: view.position,
            source: view.source,
        });
    }

    tokio::time::sleep(config.tracking.poll_interval()).await;
    let final_view = viewer_view(&viewer);

    viewer.stop().await;
    driver.stop().await;

    Ok(SimulationReport {
        route,
        track_type: options.track_type,
        steps,
        final_view,
        checks: hub.checks_seen(),
        requests: hub.requests_seen(),
    })
}

fn viewer_view(viewer: &TrackingSession) -> TrackView {
    viewer
        .consumer()
        .map_or_else(|| TrackView::empty(viewer.track_type()), |c| c.view())
}
