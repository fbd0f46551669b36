//! ETA estimation.
//!
//! Blends the route-planned remaining duration with a projection from the
//! current speed. Below a minimum speed the live sample is too noisy (stopped
//! at a light, GPS drift) and the planned duration is used unmodified.

use chrono::{DateTime, Duration, Utc};

use crate::config::NavigationConfig;

/// Minimum speed for a live projection. Default: 5 km/h
pub const MIN_SPEED_KMH: f64 = 5.0;

/// Multiplier on the live projection for stops and traffic the instantaneous
/// speed does not show. Default: 1.15
pub const CORRECTION_FACTOR: f64 = 1.15;

// One week; keeps absurd inputs inside chrono's range
const MAX_ETA_SECONDS: f64 = 7.0 * 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtaEstimator {
    pub min_speed_kmh: f64,
    pub correction_factor: f64,
}

impl Default for EtaEstimator {
    fn default() -> Self {
        Self {
            min_speed_kmh: MIN_SPEED_KMH,
            correction_factor: CORRECTION_FACTOR,
        }
    }
}

impl EtaEstimator {
    pub fn new(config: &NavigationConfig) -> Self {
        Self {
            min_speed_kmh: config.min_speed_kmh,
            correction_factor: config.eta_correction_factor,
        }
    }

    /// Seconds until arrival.
    ///
    /// Negative or non-finite inputs are treated as zero, and a non-finite
    /// speed falls back to the planned duration.
    pub fn estimate_seconds(
        &self,
        remaining_distance_m: f64,
        current_speed_kmh: f64,
        remaining_duration_s: f64,
    ) -> f64 {
        let remaining = non_negative(remaining_distance_m);
        let planned = non_negative(remaining_duration_s);

        if !current_speed_kmh.is_finite() || current_speed_kmh < self.min_speed_kmh {
            return planned.min(MAX_ETA_SECONDS);
        }
        // min_speed may be configured to 0
        if current_speed_kmh <= 0.0 {
            return planned.min(MAX_ETA_SECONDS);
        }

        let live = remaining / (current_speed_kmh / 3.6);
        let corrected = live * self.correction_factor;
        ((corrected + planned) / 2.0).min(MAX_ETA_SECONDS)
    }

    /// Arrival timestamp relative to `now`.
    pub fn calculate_eta(
        &self,
        remaining_distance_m: f64,
        current_speed_kmh: f64,
        remaining_duration_s: f64,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let seconds =
            self.estimate_seconds(remaining_distance_m, current_speed_kmh, remaining_duration_s);
        now + Duration::milliseconds((seconds * 1000.0).round() as i64)
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// [`EtaEstimator::calculate_eta`] with the default speed floor and correction.
pub fn calculate_eta(
    remaining_distance_m: f64,
    current_speed_kmh: f64,
    remaining_duration_s: f64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    EtaEstimator::default().calculate_eta(
        remaining_distance_m,
        current_speed_kmh,
        remaining_duration_s,
        now,
    )
}
