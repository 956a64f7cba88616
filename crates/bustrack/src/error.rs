//! Error types for bustrack.
//!
//! This module defines all error types used throughout the bustrack crate,
//! providing detailed context for debugging and user-friendly error messages.

use thiserror::Error;

use crate::model::TrackType;

/// The main error type for bustrack operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Tracking Errors ===
    /// Device location permission was refused.
    #[error("location permission denied: {permission}. {instructions}")]
    PermissionDenied {
        /// Name of the refused permission.
        permission: String,
        /// Instructions for granting the permission.
        instructions: String,
    },

    /// The device location subscription could not be opened.
    #[error("failed to watch device position: {message}")]
    LocationUnavailable {
        /// Description of what went wrong.
        message: String,
    },

    // === Collaborator Errors ===
    /// The route lookup found no such route.
    #[error("route '{route_id}' not found for school '{school_id}'")]
    RouteNotFound {
        /// The requested route id.
        route_id: String,
        /// The school the route was requested for.
        school_id: String,
    },

    /// The transport record lookup found nothing for the user.
    #[error("no transport record for user '{user_id}' in school '{school_id}'")]
    TransportNotFound {
        /// The school searched.
        school_id: String,
        /// The user searched.
        user_id: String,
    },

    /// The transport record is not active, so tracking must not run.
    #[error("transport for user '{user_id}' is not active")]
    TransportInactive {
        /// The user whose transport is inactive.
        user_id: String,
    },

    /// The transport record has no route for the requested leg.
    #[error("no {track_type} route assigned")]
    NoRouteAssigned {
        /// The leg without a route.
        track_type: TrackType,
    },

    /// A collaborator request failed in transit.
    #[error("network error: {0}")]
    Network(String),

    // === Channel Errors ===
    /// The shared connection could not be established.
    #[error("channel unavailable: {message}")]
    ChannelUnavailable {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for bustrack operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a channel unavailable error.
    #[must_use]
    pub fn channel_unavailable(message: impl Into<String>) -> Self {
        Self::ChannelUnavailable {
            message: message.into(),
        }
    }

    /// Create a permission denied error with instructions.
    #[must_use]
    pub fn permission_denied(
        permission: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self::PermissionDenied {
            permission: permission.into(),
            instructions: instructions.into(),
        }
    }

    /// Create a route not found error.
    #[must_use]
    pub fn route_not_found(route_id: impl Into<String>, school_id: impl Into<String>) -> Self {
        Self::RouteNotFound {
            route_id: route_id.into(),
            school_id: school_id.into(),
        }
    }

    /// Check if this error is a permission issue.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Check if this error means the route does not exist.
    #[must_use]
    pub fn is_route_not_found(&self) -> bool {
        matches!(self, Self::RouteNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::network("connection reset");
        assert_eq!(err.to_string(), "network error: connection reset");

        let err = Error::TransportInactive {
            user_id: "U7".to_string(),
        };
        assert_eq!(err.to_string(), "transport for user 'U7' is not active");
    }

    #[test]
    fn test_error_is_permission_error() {
        let err = Error::permission_denied("Location", "Allow location access in Settings");
        assert!(err.is_permission_error());
        assert!(!Error::network("x").is_permission_error());
    }

    #[test]
    fn test_permission_error_display() {
        let err = Error::permission_denied("Location (foreground)", "Open Settings > Privacy");
        let msg = err.to_string();
        assert!(msg.contains("Location (foreground)"));
        assert!(msg.contains("Settings"));
    }

    #[test]
    fn test_route_not_found_display() {
        let err = Error::route_not_found("R404", "S1");
        assert!(err.is_route_not_found());
        let msg = err.to_string();
        assert!(msg.contains("R404"));
        assert!(msg.contains("S1"));
    }

    #[test]
    fn test_no_route_assigned_display() {
        let err = Error::NoRouteAssigned {
            track_type: TrackType::Drop,
        };
        assert_eq!(err.to_string(), "no drop route assigned");
    }

    #[test]
    fn test_internal_error() {
        let err = Error::internal("something went wrong");
        assert_eq!(err.to_string(), "internal error: something went wrong");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "invalid interval".to_string(),
        };
        assert!(err.to_string().contains("invalid interval"));
    }

    #[test]
    fn test_channel_unavailable_display() {
        let err = Error::channel_unavailable("hub offline");
        assert_eq!(err.to_string(), "channel unavailable: hub offline");
    }
}
