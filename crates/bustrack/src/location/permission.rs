//! Device location permission status.
//!
//! Publishing requires foreground location access. Platforms report it in
//! different ways; providers normalise their answer into [`PermissionStatus`].

/// Outcome of a location permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionStatus {
    /// Whether location access is currently granted.
    pub is_granted: bool,

    /// Human-readable description of the status.
    pub description: String,
}

impl PermissionStatus {
    /// Create a new granted status.
    #[must_use]
    pub fn granted() -> Self {
        Self {
            is_granted: true,
            description: "Location permission is granted".to_string(),
        }
    }

    /// Create a new denied status.
    #[must_use]
    pub fn denied() -> Self {
        Self {
            is_granted: false,
            description: "Location permission was denied".to_string(),
        }
    }

    /// Convert into a result, producing [`crate::Error::PermissionDenied`]
    /// when not granted.
    ///
    /// # Errors
    ///
    /// Returns the permission error if access is not granted.
    pub fn require(self) -> crate::Result<()> {
        if self.is_granted {
            Ok(())
        } else {
            Err(crate::Error::permission_denied(
                "Location (foreground)",
                permission_instructions(),
            ))
        }
    }
}

/// Instructions shown to a driver whose device refused location access.
#[must_use]
pub fn permission_instructions() -> &'static str {
    r"Bus tracking needs your location while you drive.

Open the device Settings, find this app under Privacy > Location,
choose 'While using the app', then toggle driving off and on again."
}
