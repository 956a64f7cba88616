//! Route and transport lookups.
//!
//! The route-management service is an external collaborator; this module
//! defines the narrow [`RouteDirectory`] interface to it, an in-memory
//! implementation backed by a JSON fixture, and the [`RouteStopResolver`]
//! that tracking components use to fetch stops.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DirectoryConfig;
use crate::error::{Error, Result};
use crate::model::{Route, Stop, TransportRecord, TransportStatus};

/// Lookups served by the route-management collaborator.
#[async_trait]
pub trait RouteDirectory: Send + Sync {
    /// `GetRouteById`: the route with its ordered stops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouteNotFound`] for an unknown route, or a network
    /// error if the collaborator could not be reached.
    async fn route_by_id(&self, route_id: &str, school_id: &str) -> Result<Route>;

    /// `GetTransportById`: a user's route assignment and service status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportNotFound`] for an unknown user, or a network
    /// error if the collaborator could not be reached.
    async fn transport_by_id(&self, school_id: &str, user_id: &str) -> Result<TransportRecord>;
}

/// On-disk shape of a directory fixture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryFixture {
    /// Routes; each must carry its `school_id`.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Transport records.
    #[serde(default)]
    pub transports: Vec<TransportRecord>,
}

/// A [`RouteDirectory`] held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    routes: HashMap<(String, String), Route>,
    transports: HashMap<(String, String), TransportRecord>,
}

impl StaticDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a fixture.
    #[must_use]
    pub fn from_fixture(fixture: DirectoryFixture) -> Self {
        let mut directory = Self::new();
        for route in fixture.routes {
            directory.insert_route(route);
        }
        for record in fixture.transports {
            directory.insert_transport(record);
        }
        directory
    }

    /// Load a JSON fixture file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let fixture: DirectoryFixture = serde_json::from_str(&text)?;
        debug!(
            path = %path.display(),
            routes = fixture.routes.len(),
            transports = fixture.transports.len(),
            "Loaded directory fixture"
        );
        Ok(Self::from_fixture(fixture))
    }

    /// Load the configured fixture, or the demo data when none is set.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured fixture cannot be loaded.
    pub fn from_config(config: &DirectoryConfig) -> Result<Self> {
        match &config.fixture_path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::demo()),
        }
    }

    /// Demo data: school `S1`, pickup route `R001` and drop route `R002`,
    /// with active transport for users `U1` (student) and `D1` (driver).
    #[must_use]
    pub fn demo() -> Self {
        let stop = |name: &str, lat: f64, lng: f64, time: &str| Stop {
            name: name.to_string(),
            lat,
            lng,
            scheduled_time: time.to_string(),
        };
        let route = |route_id: &str, route_name: &str, stops: Vec<Stop>| Route {
            route_id: route_id.to_string(),
            route_name: route_name.to_string(),
            stops,
            bus_number: "KA-01-F-4521".to_string(),
            bus_driver: "Suresh".to_string(),
            bus_contact: "+91-80-5550-0100".to_string(),
            school_id: "S1".to_string(),
        };
        let transport = |user_id: &str| TransportRecord {
            school_id: "S1".to_string(),
            user_id: user_id.to_string(),
            pickup_route: Some("R001".to_string()),
            drop_route: Some("R002".to_string()),
            transport_status: TransportStatus::Active,
        };

        Self::from_fixture(DirectoryFixture {
            routes: vec![
                route(
                    "R001",
                    "Morning pickup",
                    vec![
                        stop("Gate A", 12.900, 77.600, "07:30"),
                        stop("Gate B", 12.910, 77.610, "07:45"),
                    ],
                ),
                route(
                    "R002",
                    "Afternoon drop",
                    vec![
                        stop("School", 12.920, 77.620, "15:30"),
                        stop("Gate B", 12.910, 77.610, "15:50"),
                        stop("Gate A", 12.900, 77.600, "16:05"),
                    ],
                ),
            ],
            transports: vec![transport("U1"), transport("D1")],
        })
    }

    /// Add or replace a route.
    pub fn insert_route(&mut self, route: Route) {
        let key = (route.school_id.clone(), route.route_id.clone());
        self.routes.insert(key, route);
    }

    /// Add or replace a transport record.
    pub fn insert_transport(&mut self, record: TransportRecord) {
        let key = (record.school_id.clone(), record.user_id.clone());
        self.transports.insert(key, record);
    }

    /// Number of routes held.
    #[must_use]
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

#[async_trait]
impl RouteDirectory for StaticDirectory {
    async fn route_by_id(&self, route_id: &str, school_id: &str) -> Result<Route> {
        self.routes
            .get(&(school_id.to_string(), route_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::route_not_found(route_id, school_id))
    }

    async fn transport_by_id(&self, school_id: &str, user_id: &str) -> Result<TransportRecord> {
        self.transports
            .get(&(school_id.to_string(), user_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::TransportNotFound {
                school_id: school_id.to_string(),
                user_id: user_id.to_string(),
            })
    }
}

/// Fetches the ordered stop list of a route.
///
/// No caching: every call goes to the directory. Each lookup is bounded by
/// the configured timeout.
#[derive(Clone)]
pub struct RouteStopResolver {
    directory: Arc<dyn RouteDirectory>,
    timeout: Duration,
}

impl std::fmt::Debug for RouteStopResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteStopResolver")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RouteStopResolver {
    /// Create a resolver over `directory`.
    #[must_use]
    pub fn new(directory: Arc<dyn RouteDirectory>, config: &DirectoryConfig) -> Self {
        Self {
            directory,
            timeout: config.request_timeout(),
        }
    }

    /// The underlying directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn RouteDirectory> {
        &self.directory
    }

    /// Resolve a route and its stops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RouteNotFound`] or [`Error::Network`]; a lookup that
    /// exceeds the timeout is reported as a network error.
    pub async fn resolve(&self, route_id: &str, school_id: &str) -> Result<Route> {
        let lookup = self.directory.route_by_id(route_id, school_id);
        let mut route = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(route_id, school_id, "Route lookup timed out");
                return Err(Error::network(format!(
                    "route lookup for '{route_id}' timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        if route.school_id.is_empty() {
            route.school_id = school_id.to_string();
        }
        debug!(route_id, school_id, stops = route.stops.len(), "Resolved route");
        Ok(route)
    }

    /// Fetch a user's transport record, bounded by the same timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportNotFound`] or [`Error::Network`].
    pub async fn transport(&self, school_id: &str, user_id: &str) -> Result<TransportRecord> {
        let lookup = self.directory.transport_by_id(school_id, user_id);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(result) => result,
            Err(_) => Err(Error::network(format!(
                "transport lookup for '{user_id}' timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}
