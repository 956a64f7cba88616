//! Time-and-distance gate for device samples.

use std::time::Duration;

use tokio::time::Instant;

use crate::model::PositionSample;

/// Admits a sample only when BOTH the minimum time and the minimum distance
/// have elapsed since the last admitted sample.
///
/// The first sample is always admitted.
#[derive(Debug, Clone)]
pub struct SampleGate {
    min_interval: Duration,
    min_distance_m: f64,
    last: Option<(Instant, PositionSample)>,
}

impl SampleGate {
    /// Create a gate with the given thresholds.
    #[must_use]
    pub fn new(min_interval: Duration, min_distance_m: f64) -> Self {
        Self {
            min_interval,
            min_distance_m,
            last: None,
        }
    }

    /// Offer a sample observed at `now`; returns whether it passes.
    pub fn admit(&mut self, sample: PositionSample, now: Instant) -> bool {
        if let Some((at, previous)) = self.last {
            if now.saturating_duration_since(at) < self.min_interval {
                return false;
            }
            if previous.distance_m(&sample) < self.min_distance_m {
                return false;
            }
        }
        self.last = Some((now, sample));
        true
    }
}
