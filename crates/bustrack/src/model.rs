//! Core tracking types for bustrack.
//!
//! This module defines the routes, stops and position samples that flow
//! between the route directory, the publisher and the consumer.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which leg of a route a session concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    /// Home to school.
    Pickup,
    /// School to home.
    Drop,
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pickup => write!(f, "pickup"),
            Self::Drop => write!(f, "drop"),
        }
    }
}

impl FromStr for TrackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pickup" => Ok(Self::Pickup),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown track type: {other}")),
        }
    }
}

/// A single (lat, lng) reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
}

impl PositionSample {
    /// Mean Earth radius used for distance calculations.
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    /// Create a new sample.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to `other` in metres (haversine).
    #[must_use]
    pub fn distance_m(&self, other: &Self) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_M * a.sqrt().asin()
    }
}

impl fmt::Display for PositionSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

/// Ordering key attached to every published sample.
///
/// `epoch` identifies one publisher activation (its start time in epoch
/// milliseconds) and `seq` counts samples within it. Epochs come from
/// device clocks, so only stamps of the same activation are comparable for
/// staleness; see [`Stamp::is_stale_against`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Publisher activation time, epoch milliseconds.
    pub epoch: i64,
    /// Sample counter within the activation, starting at 1.
    pub seq: u64,
}

impl Stamp {
    /// Create a new stamp.
    #[must_use]
    pub const fn new(epoch: i64, seq: u64) -> Self {
        Self { epoch, seq }
    }

    /// Whether this stamp was superseded by `current` within the same
    /// publisher activation.
    ///
    /// A stamp from a different activation is never stale, whatever its
    /// epoch: a handed-over route or a device with a lagging clock starts a
    /// new sequence.
    #[must_use]
    pub const fn is_stale_against(&self, current: &Self) -> bool {
        self.epoch == current.epoch && self.seq < current.seq
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.epoch, self.seq).cmp(&(other.epoch, other.seq))
    }
}

/// A fixed point on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    /// Display name of the stop.
    pub name: String,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Scheduled arrival time as published by the route directory.
    #[serde(rename = "time", alias = "scheduled_time", default)]
    pub scheduled_time: String,
}

impl Stop {
    /// The stop's coordinate as a sample.
    #[must_use]
    pub const fn position(&self) -> PositionSample {
        PositionSample::new(self.lat, self.lng)
    }
}

/// A named path with its ordered stops and bus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Route identifier.
    pub route_id: String,
    /// Display name.
    #[serde(default)]
    pub route_name: String,
    /// Ordered stops; the first is the route origin.
    #[serde(default)]
    pub stops: Vec<Stop>,
    /// Registration or fleet number of the bus.
    #[serde(default)]
    pub bus_number: String,
    /// Driver name.
    #[serde(default)]
    pub bus_driver: String,
    /// Driver or bus contact number.
    #[serde(default)]
    pub bus_contact: String,
    /// Owning school. Filled in by the resolver when the directory omits it.
    #[serde(default)]
    pub school_id: String,
}

impl Route {
    /// The first stop, if the route has any.
    #[must_use]
    pub fn origin(&self) -> Option<&Stop> {
        self.stops.first()
    }

    /// Where to draw the bus before any live position is known.
    #[must_use]
    pub fn fallback_anchor(&self) -> Option<PositionSample> {
        self.origin().map(Stop::position)
    }

    /// The channel scope of this route.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.school_id.clone(), self.route_id.clone())
    }
}

/// Whether a user's transport service is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportStatus {
    /// Tracking may run.
    Active,
    /// Tracking must not publish or poll.
    #[default]
    Inactive,
}

/// A user's transport assignment from the transport-record collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportRecord {
    /// School the record belongs to.
    #[serde(default)]
    pub school_id: String,
    /// User (student or staff) the record belongs to.
    #[serde(default)]
    pub user_id: String,
    /// Route used for the pickup leg.
    #[serde(default)]
    pub pickup_route: Option<String>,
    /// Route used for the drop leg.
    #[serde(default)]
    pub drop_route: Option<String>,
    /// Service status gate.
    #[serde(default)]
    pub transport_status: TransportStatus,
}

impl TransportRecord {
    /// The route id for the given leg.
    #[must_use]
    pub fn route_for(&self, track_type: TrackType) -> Option<&str> {
        match track_type {
            TrackType::Pickup => self.pickup_route.as_deref(),
            TrackType::Drop => self.drop_route.as_deref(),
        }
        .filter(|id| !id.is_empty())
    }

    /// Whether publishing and polling may run.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.transport_status == TransportStatus::Active
    }
}

/// The scope of a channel session: one route of one school.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// School id (`track_schoolid` on the wire).
    pub school_id: String,
    /// Route id.
    pub route_id: String,
}

impl SessionKey {
    /// Create a new key.
    #[must_use]
    pub fn new(school_id: impl Into<String>, route_id: impl Into<String>) -> Self {
        Self {
            school_id: school_id.into(),
            route_id: route_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.school_id, self.route_id)
    }
}
