//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;

use route_navigator::geodesy::{distance_meters, EARTH_RADIUS_M};
use route_navigator::{
    polyline, Coordinate, DirectionsProvider, FixSink, LocationFix, LocationSource,
    NavigationError, Result, RouteRequest, RouteResponse, Session, SessionStatus, SessionStore,
    StepResponse,
};

/// Route crate logs through env_logger; `RUST_LOG=debug` shows per-fix tracking.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const ORIGIN: Coordinate = Coordinate {
    latitude: 52.0,
    longitude: 13.0,
};

/// Move `north_m` / `east_m` meters from `c`.
pub fn offset(c: Coordinate, north_m: f64, east_m: f64) -> Coordinate {
    let dlat = (north_m / EARTH_RADIUS_M).to_degrees();
    let dlng = (east_m / (EARTH_RADIUS_M * c.latitude.to_radians().cos())).to_degrees();
    Coordinate::new(c.latitude + dlat, c.longitude + dlng)
}

/// Corners of the reference ride: 2000 m north, 1500 m east, 1500 m north.
pub fn ride_corners() -> Vec<Coordinate> {
    let a = offset(ORIGIN, 2000.0, 0.0);
    let b = offset(a, 0.0, 1500.0);
    let c = offset(b, 1500.0, 0.0);
    vec![ORIGIN, a, b, c]
}

pub fn destination() -> Coordinate {
    ride_corners()[3]
}

/// One step per consecutive pair of corners, 5 m/s planned pace.
pub fn route_through(corners: &[Coordinate]) -> RouteResponse {
    let maneuvers = [None, Some("turn-right"), Some("turn-left"), Some("straight")];
    let steps: Vec<StepResponse> = corners
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let distance_m = distance_meters(&pair[0], &pair[1]);
            StepResponse {
                start: pair[0],
                end: pair[1],
                instruction: format!("Step {}", i + 1),
                maneuver: maneuvers.get(i).copied().flatten().map(str::to_string),
                distance_m,
                duration_s: distance_m / 5.0,
                polyline: polyline::encode(pair),
            }
        })
        .collect();
    RouteResponse {
        total_distance_m: steps.iter().map(|s| s.distance_m).sum(),
        total_duration_s: steps.iter().map(|s| s.duration_s).sum(),
        overview_polyline: polyline::encode(corners),
        steps,
    }
}

pub fn ride_route() -> RouteResponse {
    route_through(&ride_corners())
}

/// Points every `spacing_m` along `corners`, each corner and the final point included.
pub fn walk(corners: &[Coordinate], spacing_m: f64) -> Vec<Coordinate> {
    let mut points = Vec::new();
    for pair in corners.windows(2) {
        let length = distance_meters(&pair[0], &pair[1]);
        // Leg lengths carry float noise: 2000.0000001 m is still 50 points at 40 m
        let count = (length / spacing_m - 1e-6).ceil().max(1.0) as usize;
        for k in 0..count {
            let t = (k as f64 * spacing_m / length).min(1.0);
            points.push(Coordinate::new(
                pair[0].latitude + (pair[1].latitude - pair[0].latitude) * t,
                pair[0].longitude + (pair[1].longitude - pair[0].longitude) * t,
            ));
        }
    }
    if let Some(last) = corners.last() {
        points.push(*last);
    }
    points
}

pub fn fix(c: Coordinate) -> LocationFix {
    LocationFix::new(c, Utc::now()).with_speed(5.0)
}

// ============================================================================
// Fakes
// ============================================================================

/// Directions provider answering from a script, then with a fallback route.
pub struct FakeDirections {
    delay: Duration,
    script: Mutex<VecDeque<Result<RouteResponse>>>,
    fallback: Option<RouteResponse>,
    requests: Mutex<Vec<RouteRequest>>,
}

impl FakeDirections {
    /// Always answers with `route` after `delay`.
    pub fn answering(route: RouteResponse, delay: Duration) -> Self {
        Self {
            delay,
            script: Mutex::new(VecDeque::new()),
            fallback: Some(route),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always fails.
    pub fn failing(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::from(vec![Err(NavigationError::RouteFetch {
                message: message.to_string(),
            })])),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, result: Result<RouteResponse>) -> Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn requests(&self) -> Vec<RouteRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl DirectionsProvider for FakeDirections {
    fn fetch_route(&self, request: RouteRequest) -> BoxFuture<'_, Result<RouteResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            tokio::time::sleep(self.delay).await;
            let scripted = self.script.lock().unwrap().pop_front();
            match scripted {
                Some(result) => result,
                None => self.fallback.clone().ok_or(NavigationError::RouteFetch {
                    message: "no route scripted".to_string(),
                }),
            }
        })
    }
}

/// Location source that hands its sink to the test.
#[derive(Default)]
pub struct FakeLocation {
    sink: Mutex<Option<FixSink>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeLocation {
    /// Deliver a fix through the current sink. False when the stream is stopped.
    pub fn push(&self, fix: LocationFix) -> bool {
        match self.sink() {
            Some(sink) => sink.send(fix),
            None => false,
        }
    }

    pub fn sink(&self) -> Option<FixSink> {
        self.sink.lock().unwrap().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl LocationSource for FakeLocation {
    fn start(&self, sink: FixSink) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = None;
    }
}

/// Store whose every write fails.
pub struct FailingStore;

impl SessionStore for FailingStore {
    fn save(&self, _session: Session) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            Err(NavigationError::Persistence {
                message: "disk full".to_string(),
            })
        })
    }

    fn update_status(&self, _id: String, _status: SessionStatus) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            Err(NavigationError::Persistence {
                message: "disk full".to_string(),
            })
        })
    }

    fn delete_progress(&self, _id: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async {
            Err(NavigationError::Persistence {
                message: "disk full".to_string(),
            })
        })
    }
}
