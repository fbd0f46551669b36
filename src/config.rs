//! Navigation configuration.
//!
//! All thresholds and policy knobs live here so hosts can tune them (for
//! example from a JSON settings blob) without touching the algorithms.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NavigationError, Result};

/// Configuration for progress tracking, ETA and the session lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Distance to a step's end below which the rider counts as at the step boundary.
    /// Default: 30.0 meters
    pub proximity_threshold_m: f64,

    /// Distance from the current step's polyline above which the rider is off route.
    /// Default: 50.0 meters
    pub off_route_threshold_m: f64,

    /// Distance to the next step's start that triggers pre-maneuver alerts.
    /// Default: 200.0 meters
    pub near_turn_threshold_m: f64,

    /// Distance to the final step's end that counts as arrival.
    /// Default: 20.0 meters
    pub arrival_threshold_m: f64,

    /// Consecutive off-route fixes required before recalculating.
    /// A single noisy fix never triggers a reroute. Default: 3
    pub off_route_debounce_fixes: u32,

    /// Retries after the first failed recalculation fetch before giving up.
    /// Default: 3
    pub max_recalculation_retries: u32,

    /// Backoff before the first recalculation retry, doubled per attempt.
    /// Default: 1000 ms
    pub retry_base_delay_ms: u64,

    /// Upper bound for the recalculation backoff.
    /// Default: 16000 ms
    pub retry_max_delay_ms: u64,

    /// Speeds below this are too noisy to project an ETA from.
    /// Default: 5.0 km/h
    pub min_speed_kmh: f64,

    /// Multiplier applied to the live-speed projection before blending.
    /// Default: 1.15
    pub eta_correction_factor: f64,

    /// Polyline precision used by the directions provider (5 = Google, 6 = polyline6).
    /// Default: 5
    pub precision: u32,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            proximity_threshold_m: 30.0,
            off_route_threshold_m: 50.0,
            near_turn_threshold_m: 200.0,
            arrival_threshold_m: 20.0,
            off_route_debounce_fixes: 3,
            max_recalculation_retries: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 16_000,
            min_speed_kmh: 5.0,
            eta_correction_factor: 1.15,
            precision: 5,
        }
    }
}

impl NavigationConfig {
    /// Parse a (possibly partial) JSON configuration and validate it.
    ///
    /// Missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| NavigationError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let distances = [
            ("proximity_threshold_m", self.proximity_threshold_m),
            ("off_route_threshold_m", self.off_route_threshold_m),
            ("near_turn_threshold_m", self.near_turn_threshold_m),
            ("arrival_threshold_m", self.arrival_threshold_m),
        ];
        for (name, value) in distances {
            if !value.is_finite() || value <= 0.0 {
                return Err(NavigationError::Config {
                    message: format!("{} must be positive, got {}", name, value),
                });
            }
        }
        if self.off_route_debounce_fixes == 0 {
            return Err(NavigationError::Config {
                message: "off_route_debounce_fixes must be at least 1".to_string(),
            });
        }
        if !self.min_speed_kmh.is_finite() || self.min_speed_kmh < 0.0 {
            return Err(NavigationError::Config {
                message: format!("min_speed_kmh must be non-negative, got {}", self.min_speed_kmh),
            });
        }
        if !self.eta_correction_factor.is_finite() || self.eta_correction_factor < 1.0 {
            return Err(NavigationError::Config {
                message: format!(
                    "eta_correction_factor must be >= 1.0, got {}",
                    self.eta_correction_factor
                ),
            });
        }
        if !(1..=7).contains(&self.precision) {
            return Err(NavigationError::Config {
                message: format!("precision must be between 1 and 7, got {}", self.precision),
            });
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(NavigationError::Config {
                message: "retry_max_delay_ms must not be below retry_base_delay_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based): base, 2x base, 4x base, ... capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}
