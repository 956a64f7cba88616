//! `bustrack` - Real-time school bus location tracking
//!
//! A driver's device publishes its position on a route-scoped channel over
//! one shared relay connection; viewers poll and listen on the same channel
//! and render the bus, falling back to the route's first stop until a live
//! position arrives.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod channel;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod error;
pub mod location;
pub mod logging;
pub mod model;
pub mod publisher;
pub mod routes;
pub mod session;
pub mod simulation;
pub mod wire;

pub use channel::{Channel, ConnectionManager, ConnectionState, LocalHub, WebSocketTransport};
pub use config::Config;
pub use consumer::{LocationConsumer, Reconciler, TrackView};
pub use error::{Error, Result};
pub use location::{LocationProvider, SimulatedDevice};
pub use logging::init_logging;
pub use model::{PositionSample, Route, SessionKey, Stamp, Stop, TrackType};
pub use publisher::{LocationPublisher, PublisherState};
pub use routes::{RouteDirectory, RouteStopResolver, StaticDirectory};
pub use session::TrackingSession;
