//! Route progress tracking.
//!
//! Classifies a position fix against the ordered steps of a planned route:
//! - Current step index (monotonic: never below the last confirmed index)
//! - Off-route and near-next-turn flags
//! - Remaining distance and planned remaining duration
//!
//! Every query is total. An empty step list yields index 0 and zero
//! distances; an out-of-range index is clamped to the last step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::NavigationConfig;
use crate::eta::EtaEstimator;
use crate::geodesy::bearing_degrees;
use crate::route::Step;
use crate::{geodesy, Coordinate, LocationFix};

/// Distance to a step's end that counts as reaching the step boundary. Default: 30 m
pub const PROXIMITY_THRESHOLD_M: f64 = 30.0;

/// Distance from the step geometry beyond which the rider is off route. Default: 50 m
pub const OFF_ROUTE_THRESHOLD_M: f64 = 50.0;

/// Distance to the next step's start that triggers pre-maneuver alerts. Default: 200 m
pub const NEAR_TURN_THRESHOLD_M: f64 = 200.0;

/// Movement needed before a bearing is derived from two consecutive fixes.
const MIN_BEARING_MOVEMENT_M: f64 = 3.0;

// ============================================================================
// Snapshot
// ============================================================================

/// Where the rider is on the route, recomputed from scratch on every fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current_step_index: usize,
    pub distance_to_step_end_m: f64,
    /// `None` on the last step
    pub distance_to_next_step_m: Option<f64>,
    pub remaining_distance_m: f64,
    pub remaining_duration_s: f64,
    /// Distance from the current step's geometry
    pub distance_from_route_m: f64,
    pub off_route: bool,
    pub near_next_turn: bool,
    pub speed_kmh: Option<f64>,
    pub bearing: Option<f64>,
    pub eta: DateTime<Utc>,
    pub position: Coordinate,
    pub fix_time: DateTime<Utc>,
}

// ============================================================================
// Tracker
// ============================================================================

/// Threshold set used to classify fixes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTracker {
    pub proximity_threshold_m: f64,
    pub off_route_threshold_m: f64,
    pub near_turn_threshold_m: f64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self {
            proximity_threshold_m: PROXIMITY_THRESHOLD_M,
            off_route_threshold_m: OFF_ROUTE_THRESHOLD_M,
            near_turn_threshold_m: NEAR_TURN_THRESHOLD_M,
        }
    }
}

impl ProgressTracker {
    pub fn new(config: &NavigationConfig) -> Self {
        Self {
            proximity_threshold_m: config.proximity_threshold_m,
            off_route_threshold_m: config.off_route_threshold_m,
            near_turn_threshold_m: config.near_turn_threshold_m,
        }
    }

    /// Step the fix belongs to, scanning forward from `last_step_index`.
    ///
    /// Endpoint proximity is tested before polyline containment: near a sharp
    /// corner a fix can sit closer to the previous step's geometry than to the
    /// next step's start.
    pub fn determine_current_step(
        &self,
        fix: &Coordinate,
        steps: &[Step],
        last_step_index: usize,
    ) -> usize {
        if steps.is_empty() {
            return 0;
        }
        let start = last_step_index.min(steps.len() - 1);

        for (i, step) in steps.iter().enumerate().skip(start) {
            let to_end = step.distance_to_end(fix);
            if to_end <= self.proximity_threshold_m {
                return match steps.get(i + 1) {
                    Some(next) if next.distance_to_start(fix) < to_end => i + 1,
                    _ => i,
                };
            }
            if step.distance_to(fix) <= self.off_route_threshold_m {
                return i;
            }
        }

        start
    }

    /// True when the fix is strictly farther than the threshold from every
    /// segment of the step.
    pub fn is_off_route(&self, fix: &Coordinate, current_step: &Step) -> bool {
        current_step.distance_to(fix) > self.off_route_threshold_m
    }

    pub fn is_near_next_turn(&self, fix: &Coordinate, next_step: &Step) -> bool {
        next_step.distance_to_start(fix) <= self.near_turn_threshold_m
    }

    /// Classify a fix and build a fresh snapshot.
    ///
    /// `previous` is the last fix processed, used to derive a bearing when the
    /// location provider does not report one.
    pub fn snapshot(
        &self,
        fix: &LocationFix,
        steps: &[Step],
        last_step_index: usize,
        previous: Option<&LocationFix>,
        estimator: &EtaEstimator,
        now: DateTime<Utc>,
    ) -> ProgressSnapshot {
        let position = fix.coordinate;
        let speed_kmh = fix.speed_kmh();
        let bearing = fix_bearing(fix, previous);

        let index = self.determine_current_step(&position, steps, last_step_index);
        let remaining_distance_m = calculate_remaining_distance(&position, steps, index);
        let remaining_duration_s = calculate_remaining_duration(steps, index);
        let eta = estimator.calculate_eta(
            remaining_distance_m,
            speed_kmh.unwrap_or(0.0),
            remaining_duration_s,
            now,
        );

        let Some(step) = steps.get(index) else {
            return ProgressSnapshot {
                current_step_index: 0,
                distance_to_step_end_m: 0.0,
                distance_to_next_step_m: None,
                remaining_distance_m,
                remaining_duration_s,
                distance_from_route_m: 0.0,
                off_route: false,
                near_next_turn: false,
                speed_kmh,
                bearing,
                eta,
                position,
                fix_time: fix.timestamp,
            };
        };

        let next = steps.get(index + 1);
        let distance_from_route_m = step.distance_to(&position);

        ProgressSnapshot {
            current_step_index: index,
            distance_to_step_end_m: step.distance_to_end(&position),
            distance_to_next_step_m: next.map(|n| n.distance_to_start(&position)),
            remaining_distance_m,
            remaining_duration_s,
            distance_from_route_m,
            off_route: distance_from_route_m > self.off_route_threshold_m,
            near_next_turn: next.is_some_and(|n| self.is_near_next_turn(&position, n)),
            speed_kmh,
            bearing,
            eta,
            position,
            fix_time: fix.timestamp,
        }
    }
}

fn fix_bearing(fix: &LocationFix, previous: Option<&LocationFix>) -> Option<f64> {
    if let Some(bearing) = fix.bearing.filter(|b| b.is_finite()) {
        return Some(bearing.rem_euclid(360.0));
    }
    let previous = previous?;
    let moved = geodesy::distance_meters(&previous.coordinate, &fix.coordinate);
    (moved >= MIN_BEARING_MOVEMENT_M)
        .then(|| bearing_degrees(&previous.coordinate, &fix.coordinate))
}

// ============================================================================
// Free Functions (default thresholds)
// ============================================================================

pub fn determine_current_step(fix: &Coordinate, steps: &[Step], last_step_index: usize) -> usize {
    ProgressTracker::default().determine_current_step(fix, steps, last_step_index)
}

pub fn is_off_route(fix: &Coordinate, current_step: &Step) -> bool {
    ProgressTracker::default().is_off_route(fix, current_step)
}

pub fn is_near_next_turn(fix: &Coordinate, next_step: &Step, threshold_m: f64) -> bool {
    next_step.distance_to_start(fix) <= threshold_m
}

/// Distance to the end of the current step plus the planned distance of every
/// later step.
pub fn calculate_remaining_distance(fix: &Coordinate, steps: &[Step], current_step_index: usize) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }
    let index = current_step_index.min(steps.len() - 1);
    let to_end = steps[index].distance_to_end(fix);
    let later: f64 = steps[index + 1..].iter().map(|s| s.distance_m).sum();
    to_end + later
}

/// Planned duration from the current step to the end of the route.
pub fn calculate_remaining_duration(steps: &[Step], current_step_index: usize) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }
    let index = current_step_index.min(steps.len() - 1);
    steps[index..].iter().map(|s| s.duration_s).sum()
}
