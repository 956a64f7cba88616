//! Channel message shapes.
//!
//! Field names here are the compatibility contract with the relay and with
//! other clients, so they follow the wire spelling (`track_schoolid`,
//! `pickup_location`, ...) rather than Rust naming.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{PositionSample, Route, SessionKey, Stamp, TrackType};

/// Topic of position publishes.
pub const TOPIC_CHECK: &str = "check";

/// Topic of position requests.
pub const TOPIC_GET_BUS_TRACK: &str = "get-bus-track";

/// Topic of position responses.
pub const TOPIC_GET_BUS_TRACK_RESPONSE: &str = "get-bus-track-response";

/// Who is driving: stamped onto every publish.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriverIdentity {
    /// Staff id of the driver.
    pub staff_id: String,
    /// Recorded as `track_created_by`.
    pub created_by: String,
    /// Recorded as `track_modified_by`.
    pub modified_by: String,
}

impl DriverIdentity {
    /// Identity where the driver is also creator and modifier.
    #[must_use]
    pub fn staff(staff_id: impl Into<String>) -> Self {
        let staff_id = staff_id.into();
        Self {
            created_by: staff_id.clone(),
            modified_by: staff_id.clone(),
            staff_id,
        }
    }
}

/// A position publish (`check`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPayload {
    /// Route the sample belongs to.
    pub route_id: String,
    /// Driver staff id.
    #[serde(default)]
    pub staff_id: String,
    /// Route display name.
    #[serde(default)]
    pub route_name: String,
    /// Bus registration or fleet number.
    #[serde(default)]
    pub bus_number: String,
    /// Driver name.
    #[serde(default)]
    pub bus_driver: String,
    /// Leg being driven.
    pub track_type: TrackType,
    /// Pickup-leg coordinate, first element used.
    #[serde(default)]
    pub pickup_location: Vec<PositionSample>,
    /// Drop-leg coordinate, first element used.
    #[serde(default)]
    pub drop_location: Vec<PositionSample>,
    /// Contact number.
    #[serde(default)]
    pub bus_contact: String,
    /// School id.
    pub track_schoolid: String,
    /// Creator of the track record.
    #[serde(default)]
    pub track_created_by: String,
    /// Last modifier of the track record.
    #[serde(default)]
    pub track_modified_by: String,
    /// Publisher activation, see [`Stamp`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_epoch: Option<i64>,
    /// Sample counter, see [`Stamp`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_seq: Option<u64>,
}

impl CheckPayload {
    /// Build a publish for one sample.
    ///
    /// The sample goes into both `pickup_location` and `drop_location`;
    /// receivers pick the field for the leg they watch.
    #[must_use]
    pub fn new(
        route: &Route,
        track_type: TrackType,
        driver: &DriverIdentity,
        sample: PositionSample,
        stamp: Stamp,
    ) -> Self {
        Self {
            route_id: route.route_id.clone(),
            staff_id: driver.staff_id.clone(),
            route_name: route.route_name.clone(),
            bus_number: route.bus_number.clone(),
            bus_driver: route.bus_driver.clone(),
            track_type,
            pickup_location: vec![sample],
            drop_location: vec![sample],
            bus_contact: route.bus_contact.clone(),
            track_schoolid: route.school_id.clone(),
            track_created_by: driver.created_by.clone(),
            track_modified_by: driver.modified_by.clone(),
            track_epoch: Some(stamp.epoch),
            track_seq: Some(stamp.seq),
        }
    }

    /// The stored track this publish produces at the relay.
    #[must_use]
    pub fn to_track(&self) -> Track {
        Track {
            pickup_location: self.pickup_location.clone(),
            drop_location: self.drop_location.clone(),
            route_id: Some(self.route_id.clone()),
            track_schoolid: Some(self.track_schoolid.clone()),
            track_epoch: self.track_epoch,
            track_seq: self.track_seq,
        }
    }

    /// The session this publish belongs to.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.track_schoolid.clone(), self.route_id.clone())
    }
}

/// A position request (`get-bus-track`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRequest {
    /// Route being asked about.
    pub route_id: String,
    /// School id.
    pub track_schoolid: String,
}

impl From<&SessionKey> for TrackRequest {
    fn from(key: &SessionKey) -> Self {
        Self {
            route_id: key.route_id.clone(),
            track_schoolid: key.school_id.clone(),
        }
    }
}

impl TrackRequest {
    /// The session this request asks about.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.track_schoolid.clone(), self.route_id.clone())
    }
}

/// The last known track of a route.
///
/// Only the two location arrays are guaranteed; identity and stamp fields
/// are present when the relay echoes them from the originating publish.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Track {
    /// Pickup-leg coordinate, first element used.
    #[serde(default)]
    pub pickup_location: Vec<PositionSample>,
    /// Drop-leg coordinate, first element used.
    #[serde(default)]
    pub drop_location: Vec<PositionSample>,
    /// Route echoed from the publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    /// School echoed from the publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_schoolid: Option<String>,
    /// Publisher activation, see [`Stamp`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_epoch: Option<i64>,
    /// Sample counter, see [`Stamp`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_seq: Option<u64>,
}

impl Track {
    /// The coordinate for one leg, if the track carries one.
    #[must_use]
    pub fn location(&self, track_type: TrackType) -> Option<PositionSample> {
        match track_type {
            TrackType::Pickup => self.pickup_location.first().copied(),
            TrackType::Drop => self.drop_location.first().copied(),
        }
    }

    /// The ordering stamp, when both halves are present.
    #[must_use]
    pub fn stamp(&self) -> Option<Stamp> {
        Some(Stamp::new(self.track_epoch?, self.track_seq?))
    }

    /// Whether this track may concern `key`.
    ///
    /// Tracks without identity fields are accepted for any session.
    #[must_use]
    pub fn concerns(&self, key: &SessionKey) -> bool {
        let route_ok = self.route_id.as_deref().map_or(true, |r| r == key.route_id);
        let school_ok = self
            .track_schoolid
            .as_deref()
            .map_or(true, |s| s == key.school_id);
        route_ok && school_ok
    }
}

/// A position response (`get-bus-track-response`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackResponse {
    /// The stored track.
    pub track: Track,
}

/// One message on the connection: `{"event": <topic>, "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Frame {
    /// Position publish.
    #[serde(rename = "check")]
    Check(CheckPayload),
    /// Position request.
    #[serde(rename = "get-bus-track")]
    Request(TrackRequest),
    /// Position response.
    #[serde(rename = "get-bus-track-response")]
    Response(TrackResponse),
}

impl Frame {
    /// The topic this frame travels on.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::Check(_) => TOPIC_CHECK,
            Self::Request(_) => TOPIC_GET_BUS_TRACK,
            Self::Response(_) => TOPIC_GET_BUS_TRACK_RESPONSE,
        }
    }

    /// Encode to the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a known frame.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Stop;

    fn route() -> Route {
        Route {
            route_id: "R001".to_string(),
            route_name: "North loop".to_string(),
            stops: vec![Stop {
                name: "Gate A".to_string(),
                lat: 12.900,
                lng: 77.600,
                scheduled_time: "07:30".to_string(),
            }],
            bus_number: "KA-01-1234".to_string(),
            bus_driver: "R. Kumar".to_string(),
            bus_contact: "555-0100".to_string(),
            school_id: "S1".to_string(),
        }
    }

    #[test]
    fn test_check_payload_duplicates_sample() {
        let sample = PositionSample::new(12.905, 77.605);
        let payload = CheckPayload::new(
            &route(),
            TrackType::Pickup,
            &DriverIdentity::staff("D1"),
            sample,
            Stamp::new(10, 1),
        );

        assert_eq!(payload.pickup_location, vec![sample]);
        assert_eq!(payload.drop_location, vec![sample]);
        assert_eq!(payload.track_schoolid, "S1");
        assert_eq!(payload.staff_id, "D1");
        assert_eq!(payload.track_created_by, "D1");
        assert_eq!(payload.bus_number, "KA-01-1234");
    }

    #[test]
    fn test_check_payload_wire_fields() {
        let payload = CheckPayload::new(
            &route(),
            TrackType::Drop,
            &DriverIdentity::staff("D1"),
            PositionSample::new(1.0, 2.0),
            Stamp::new(10, 3),
        );
        let value = serde_json::to_value(&payload).unwrap();

        for field in [
            "route_id",
            "staff_id",
            "route_name",
            "bus_number",
            "bus_driver",
            "track_type",
            "pickup_location",
            "drop_location",
            "bus_contact",
            "track_schoolid",
            "track_created_by",
            "track_modified_by",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["track_type"], "drop");
        assert_eq!(value["pickup_location"][0]["lat"], 1.0);
        assert_eq!(value["track_seq"], 3);
    }

    #[test]
    fn test_frame_envelope_shape() {
        let frame = Frame::Request(TrackRequest {
            route_id: "R001".to_string(),
            track_schoolid: "S1".to_string(),
        });
        let text = frame.encode().unwrap();
        assert_eq!(
            text,
            r#"{"event":"get-bus-track","data":{"route_id":"R001","track_schoolid":"S1"}}"#
        );
        assert_eq!(frame.topic(), TOPIC_GET_BUS_TRACK);
    }

    #[test]
    fn test_decode_legacy_response() {
        let text = r#"{"event":"get-bus-track-response",
            "data":{"track":{"pickup_location":[{"lat":12.907,"lng":77.607}]}}}"#;
        let Frame::Response(response) = Frame::decode(text).unwrap() else {
            panic!("expected a response frame");
        };

        let track = response.track;
        assert_eq!(
            track.location(TrackType::Pickup),
            Some(PositionSample::new(12.907, 77.607))
        );
        assert_eq!(track.location(TrackType::Drop), None);
        assert!(track.stamp().is_none());
        assert!(track.concerns(&SessionKey::new("S1", "R001")));
    }

    #[test]
    fn test_decode_unknown_event_fails() {
        assert!(Frame::decode(r#"{"event":"nope","data":{}}"#).is_err());
    }

    #[test]
    fn test_track_concerns_filters_other_routes() {
        let track = Track {
            route_id: Some("R002".to_string()),
            track_schoolid: Some("S1".to_string()),
            ..Track::default()
        };
        assert!(!track.concerns(&SessionKey::new("S1", "R001")));
        assert!(track.concerns(&SessionKey::new("S1", "R002")));
        assert!(!track.concerns(&SessionKey::new("S2", "R002")));
    }

    #[test]
    fn test_check_to_track_keeps_stamp() {
        let payload = CheckPayload::new(
            &route(),
            TrackType::Pickup,
            &DriverIdentity::staff("D1"),
            PositionSample::new(1.0, 2.0),
            Stamp::new(7, 9),
        );
        let track = payload.to_track();
        assert_eq!(track.stamp(), Some(Stamp::new(7, 9)));
        assert_eq!(track.route_id.as_deref(), Some("R001"));
    }

    #[test]
    fn test_request_from_session_key() {
        let request = TrackRequest::from(&SessionKey::new("S1", "R001"));
        assert_eq!(request.route_id, "R001");
        assert_eq!(request.track_schoolid, "S1");
        assert_eq!(request.session_key(), SessionKey::new("S1", "R001"));
    }
}
