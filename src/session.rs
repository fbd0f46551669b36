//! Navigation session value and lifecycle status.
//!
//! A [`Session`] is an immutable value: every change produces a new copy via
//! the `with_*` helpers. The route is shared through an `Arc` so copies made
//! on every fix stay cheap.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::route::{PlannedRoute, RouteRequest, Step, TravelMode};
use crate::Coordinate;

/// Lifecycle status of a navigation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Loading,
    Active,
    Paused,
    Recalculating,
    Arrived,
    Cancelled,
    Error,
}

impl SessionStatus {
    /// Arrived, Cancelled and Error end a run; only `reset` or `start` leave them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Arrived | SessionStatus::Cancelled | SessionStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Loading => "loading",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Recalculating => "recalculating",
            SessionStatus::Arrived => "arrived",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Error => "error",
        }
    }

    /// Inverse of [`SessionStatus::as_str`], used by stores.
    pub fn parse(value: &str) -> Option<Self> {
        let status = match value {
            "idle" => SessionStatus::Idle,
            "loading" => SessionStatus::Loading,
            "active" => SessionStatus::Active,
            "paused" => SessionStatus::Paused,
            "recalculating" => SessionStatus::Recalculating,
            "arrived" => SessionStatus::Arrived,
            "cancelled" => SessionStatus::Cancelled,
            "error" => SessionStatus::Error,
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a `start` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub origin: Coordinate,
    pub destination: Coordinate,
    #[serde(default)]
    pub destination_name: Option<String>,
    #[serde(default)]
    pub mode: TravelMode,
    /// Optional group ride / sharing reference
    #[serde(default)]
    pub group_id: Option<String>,
}

impl StartRequest {
    pub fn new(origin: Coordinate, destination: Coordinate) -> Self {
        Self {
            origin,
            destination,
            destination_name: None,
            mode: TravelMode::default(),
            group_id: None,
        }
    }

    pub fn with_destination_name(mut self, name: impl Into<String>) -> Self {
        self.destination_name = Some(name.into());
        self
    }

    pub fn with_mode(mut self, mode: TravelMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn route_request(&self) -> RouteRequest {
        RouteRequest {
            origin: self.origin,
            destination: self.destination,
            mode: self.mode,
        }
    }
}

/// One navigation run.
///
/// Invariant: `route` has at least one step and `current_step_index` is a
/// valid step index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub destination_name: Option<String>,
    pub route: Arc<PlannedRoute>,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub current_step_index: usize,
    pub group_id: Option<String>,
    pub mode: TravelMode,
    /// Successful reroutes so far
    pub recalculation_count: u32,
}

impl Session {
    /// Create an active session at step 0.
    pub fn new(
        request: &StartRequest,
        route: PlannedRoute,
        generation: u64,
        created_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("nav-{}-{}", created_at.timestamp_millis(), generation),
            origin: request.origin,
            destination: request.destination,
            destination_name: request.destination_name.clone(),
            route: Arc::new(route),
            created_at,
            started_at,
            status: SessionStatus::Active,
            current_step_index: 0,
            group_id: request.group_id.clone(),
            mode: request.mode,
            recalculation_count: 0,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.route.steps
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.route.steps.get(self.current_step_index)
    }

    pub fn next_step(&self) -> Option<&Step> {
        self.route.steps.get(self.current_step_index + 1)
    }

    pub fn is_last_step(&self) -> bool {
        self.current_step_index + 1 >= self.route.steps.len()
    }

    pub fn with_status(&self, status: SessionStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_step_index(&self, index: usize) -> Self {
        let last = self.route.steps.len().saturating_sub(1);
        Self {
            current_step_index: index.min(last),
            ..self.clone()
        }
    }

    /// Replace the route after a reroute; progress restarts at step 0.
    pub fn with_route(&self, route: PlannedRoute) -> Self {
        Self {
            route: Arc::new(route),
            current_step_index: 0,
            recalculation_count: self.recalculation_count + 1,
            ..self.clone()
        }
    }

    /// Request for a new route from `position` to the same destination.
    pub fn reroute_request(&self, position: Coordinate) -> RouteRequest {
        RouteRequest {
            origin: position,
            destination: self.destination,
            mode: self.mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::Maneuver;
    use chrono::TimeZone;

    fn route(n: usize) -> PlannedRoute {
        let steps = (0..n)
            .map(|i| {
                let start = Coordinate::new(0.0, i as f64 * 0.01);
                let end = Coordinate::new(0.0, (i + 1) as f64 * 0.01);
                Step {
                    index: i,
                    start,
                    end,
                    instruction: format!("step {}", i),
                    maneuver: Maneuver::Straight,
                    distance_m: 1_000.0,
                    duration_s: 100.0,
                    polyline: vec![start, end],
                }
            })
            .collect();
        PlannedRoute::from_steps(steps).unwrap()
    }

    fn session() -> Session {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let request = StartRequest::new(Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 0.03))
            .with_destination_name("Harbour")
            .with_group("ride-42");
        Session::new(&request, route(3), 7, at, at)
    }

    #[test]
    fn test_new_session() {
        let s = session();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.current_step_index, 0);
        assert!(s.id.starts_with("nav-"));
        assert!(s.id.ends_with("-7"));
        assert_eq!(s.destination_name.as_deref(), Some("Harbour"));
        assert_eq!(s.group_id.as_deref(), Some("ride-42"));
    }

    #[test]
    fn test_step_index_is_clamped() {
        let s = session().with_step_index(10);
        assert_eq!(s.current_step_index, 2);
        assert!(s.is_last_step());
        assert!(s.next_step().is_none());
    }

    #[test]
    fn test_with_route_resets_progress() {
        let s = session().with_step_index(2);
        let rerouted = s.with_route(route(2));
        assert_eq!(rerouted.current_step_index, 0);
        assert_eq!(rerouted.steps().len(), 2);
        assert_eq!(rerouted.recalculation_count, 1);
        assert_eq!(rerouted.id, s.id);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionStatus::Recalculating.to_string(), "recalculating");
        assert_eq!(SessionStatus::parse("cancelled"), Some(SessionStatus::Cancelled));
        assert_eq!(SessionStatus::parse("bogus"), None);
        assert!(SessionStatus::Error.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert_eq!(
            serde_json::to_string(&SessionStatus::Arrived).unwrap(),
            "\"arrived\""
        );
    }
}
