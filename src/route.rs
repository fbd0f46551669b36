//! Route model: steps, maneuvers and the provider-facing request/response shapes.
//!
//! A [`PlannedRoute`] is built once from a directions provider answer and is
//! immutable afterwards. Recalculation replaces the whole route.

use std::fmt;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{NavigationError, Result};
use crate::geodesy::{distance_meters, distance_to_polyline, point_to_segment_distance, polyline_length};
use crate::polyline;
use crate::Coordinate;

/// Provider polylines are rounded to 1e-5 degrees, roughly a meter.
const ANCHOR_TOLERANCE_M: f64 = 1.0;

// ============================================================================
// Maneuvers
// ============================================================================

/// Maneuver category of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Maneuver {
    Depart,
    Straight,
    TurnLeft,
    TurnRight,
    SlightLeft,
    SlightRight,
    SharpLeft,
    SharpRight,
    UTurnLeft,
    UTurnRight,
    KeepLeft,
    KeepRight,
    Merge,
    ForkLeft,
    ForkRight,
    RampLeft,
    RampRight,
    RoundaboutLeft,
    RoundaboutRight,
    Ferry,
    Arrive,
    Unknown,
}

impl Maneuver {
    /// Parse a provider maneuver tag such as `turn-slight-left` or `roundabout-right`.
    ///
    /// Unrecognised tags map to [`Maneuver::Unknown`].
    pub fn from_provider(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "depart" => Maneuver::Depart,
            "straight" | "continue" => Maneuver::Straight,
            "turn-left" => Maneuver::TurnLeft,
            "turn-right" => Maneuver::TurnRight,
            "turn-slight-left" => Maneuver::SlightLeft,
            "turn-slight-right" => Maneuver::SlightRight,
            "turn-sharp-left" => Maneuver::SharpLeft,
            "turn-sharp-right" => Maneuver::SharpRight,
            "uturn-left" => Maneuver::UTurnLeft,
            "uturn-right" => Maneuver::UTurnRight,
            "keep-left" => Maneuver::KeepLeft,
            "keep-right" => Maneuver::KeepRight,
            "merge" => Maneuver::Merge,
            "fork-left" => Maneuver::ForkLeft,
            "fork-right" => Maneuver::ForkRight,
            "ramp-left" => Maneuver::RampLeft,
            "ramp-right" => Maneuver::RampRight,
            "roundabout-left" => Maneuver::RoundaboutLeft,
            "roundabout-right" => Maneuver::RoundaboutRight,
            "ferry" | "ferry-train" => Maneuver::Ferry,
            "arrive" => Maneuver::Arrive,
            _ => Maneuver::Unknown,
        }
    }

    /// Short spoken form used in announcements.
    pub fn phrase(&self) -> &'static str {
        match self {
            Maneuver::Depart => "Head out",
            Maneuver::Straight => "Continue straight",
            Maneuver::TurnLeft => "Turn left",
            Maneuver::TurnRight => "Turn right",
            Maneuver::SlightLeft => "Bear left",
            Maneuver::SlightRight => "Bear right",
            Maneuver::SharpLeft => "Turn sharp left",
            Maneuver::SharpRight => "Turn sharp right",
            Maneuver::UTurnLeft | Maneuver::UTurnRight => "Make a U-turn",
            Maneuver::KeepLeft => "Keep left",
            Maneuver::KeepRight => "Keep right",
            Maneuver::Merge => "Merge",
            Maneuver::ForkLeft => "Take the left fork",
            Maneuver::ForkRight => "Take the right fork",
            Maneuver::RampLeft => "Take the ramp on the left",
            Maneuver::RampRight => "Take the ramp on the right",
            Maneuver::RoundaboutLeft | Maneuver::RoundaboutRight => "Enter the roundabout",
            Maneuver::Ferry => "Board the ferry",
            Maneuver::Arrive => "Arrive at your destination",
            Maneuver::Unknown => "Continue",
        }
    }
}

impl fmt::Display for Maneuver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.phrase())
    }
}

/// Human-readable distance for announcements: "150 m", "2.5 km", "12 km".
pub fn format_distance(meters: f64) -> String {
    if !meters.is_finite() || meters < 0.0 {
        return "0 m".to_string();
    }
    if meters >= 10_000.0 {
        format!("{} km", (meters / 1000.0).round() as i64)
    } else if meters >= 1000.0 {
        format!("{:.1} km", meters / 1000.0)
    } else {
        format!("{} m", (meters / 10.0).round() as i64 * 10)
    }
}

// ============================================================================
// Provider Shapes
// ============================================================================

/// How the rider travels; passed through to the directions provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TravelMode {
    #[default]
    Driving,
    Bicycling,
    Walking,
}

impl TravelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TravelMode::Driving => "driving",
            TravelMode::Bicycling => "bicycling",
            TravelMode::Walking => "walking",
        }
    }
}

/// Request sent to the directions provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub origin: Coordinate,
    pub destination: Coordinate,
    #[serde(default)]
    pub mode: TravelMode,
}

/// One step as returned by the directions provider, polyline still encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub start: Coordinate,
    pub end: Coordinate,
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub maneuver: Option<String>,
    pub distance_m: f64,
    pub duration_s: f64,
    #[serde(default)]
    pub polyline: String,
}

/// Directions provider answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    pub steps: Vec<StepResponse>,
    #[serde(default)]
    pub overview_polyline: String,
    #[serde(default)]
    pub total_distance_m: f64,
    #[serde(default)]
    pub total_duration_s: f64,
}

// ============================================================================
// Steps
// ============================================================================

/// One maneuver segment of a planned route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub start: Coordinate,
    pub end: Coordinate,
    pub instruction: String,
    pub maneuver: Maneuver,
    pub distance_m: f64,
    pub duration_s: f64,
    /// First point is `start`, last point is `end`.
    pub polyline: Vec<Coordinate>,
}

impl Step {
    /// Minimum distance from `p` to this step's geometry.
    ///
    /// A polyline with fewer than two points falls back to the start-end segment.
    pub fn distance_to(&self, p: &Coordinate) -> f64 {
        if self.polyline.len() < 2 {
            return point_to_segment_distance(p, &self.start, &self.end);
        }
        distance_to_polyline(p, &self.polyline)
    }

    pub fn distance_to_start(&self, p: &Coordinate) -> f64 {
        distance_meters(p, &self.start)
    }

    pub fn distance_to_end(&self, p: &Coordinate) -> f64 {
        distance_meters(p, &self.end)
    }

    fn from_response(index: usize, response: &StepResponse, precision: u32) -> Result<Self> {
        let decoded = polyline::decode_with_precision(&response.polyline, precision)?;
        let polyline = anchor_polyline(decoded, response.start, response.end);

        let mut maneuver = response
            .maneuver
            .as_deref()
            .map(Maneuver::from_provider)
            .unwrap_or(Maneuver::Unknown);
        if index == 0 && maneuver == Maneuver::Unknown {
            maneuver = Maneuver::Depart;
        }

        let distance_m = if response.distance_m.is_finite() && response.distance_m > 0.0 {
            response.distance_m
        } else {
            polyline_length(&polyline)
        };
        let duration_s = if response.duration_s.is_finite() && response.duration_s > 0.0 {
            response.duration_s
        } else {
            0.0
        };

        Ok(Step {
            index,
            start: response.start,
            end: response.end,
            instruction: response.instruction.trim().to_string(),
            maneuver,
            distance_m,
            duration_s,
            polyline,
        })
    }
}

/// Make sure a step polyline begins at `start` and ends at `end`.
fn anchor_polyline(mut points: Vec<Coordinate>, start: Coordinate, end: Coordinate) -> Vec<Coordinate> {
    if points.is_empty() {
        return vec![start, end];
    }
    if distance_meters(&points[0], &start) > ANCHOR_TOLERANCE_M {
        points.insert(0, start);
    }
    let needs_end = points
        .last()
        .map_or(true, |last| distance_meters(last, &end) > ANCHOR_TOLERANCE_M);
    if needs_end || points.len() < 2 {
        points.push(end);
    }
    points
}

// ============================================================================
// Planned Route
// ============================================================================

/// An ordered, non-empty list of steps plus aggregate totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedRoute {
    pub steps: Vec<Step>,
    /// Overall route geometry
    pub polyline: Vec<Coordinate>,
    pub total_distance_m: f64,
    pub total_duration_s: f64,
}

impl PlannedRoute {
    /// Build a route from a provider answer.
    ///
    /// Decodes every polyline at `precision`, re-indexes the steps and fills in
    /// missing geometry and totals. Fails with [`NavigationError::EmptyRoute`]
    /// when the answer has no steps and with [`NavigationError::Decode`] on a
    /// malformed polyline.
    pub fn from_response(response: &RouteResponse, precision: u32) -> Result<Self> {
        if response.steps.is_empty() {
            warn!("[PlannedRoute] Provider returned no steps");
            return Err(NavigationError::EmptyRoute);
        }

        let steps = response
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| Step::from_response(i, step, precision))
            .collect::<Result<Vec<_>>>()?;

        let mut polyline = polyline::decode_with_precision(&response.overview_polyline, precision)?;
        if polyline.len() < 2 {
            polyline = concat_step_polylines(&steps);
        }

        let total_distance_m = positive_or(response.total_distance_m, || {
            steps.iter().map(|s| s.distance_m).sum()
        });
        let total_duration_s = positive_or(response.total_duration_s, || {
            steps.iter().map(|s| s.duration_s).sum()
        });

        debug!(
            "[PlannedRoute] Built {} steps, {:.0} m, {:.0} s, {} overview points",
            steps.len(),
            total_distance_m,
            total_duration_s,
            polyline.len()
        );

        Ok(Self {
            steps,
            polyline,
            total_distance_m,
            total_duration_s,
        })
    }

    /// Build a route from already-decoded steps, deriving geometry and totals.
    pub fn from_steps(mut steps: Vec<Step>) -> Result<Self> {
        if steps.is_empty() {
            return Err(NavigationError::EmptyRoute);
        }
        for (i, step) in steps.iter_mut().enumerate() {
            step.index = i;
            if step.polyline.len() < 2 {
                step.polyline = vec![step.start, step.end];
            }
        }
        let polyline = concat_step_polylines(&steps);
        let total_distance_m = steps.iter().map(|s| s.distance_m).sum();
        let total_duration_s = steps.iter().map(|s| s.duration_s).sum();
        Ok(Self {
            steps,
            polyline,
            total_distance_m,
            total_duration_s,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }
}

fn positive_or(value: f64, fallback: impl FnOnce() -> f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        fallback()
    }
}

fn concat_step_polylines(steps: &[Step]) -> Vec<Coordinate> {
    let mut line: Vec<Coordinate> = Vec::new();
    for step in steps {
        for point in &step.polyline {
            if line.last() != Some(point) {
                line.push(*point);
            }
        }
    }
    line
}
