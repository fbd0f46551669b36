//! FFI bindings for mobile platforms (iOS/Android).
//!
//! The host app drives a global [`NavigationEngine`] directly: every call
//! returns a JSON [`FfiOutcome`] listing the effects the host must execute
//! (start/stop GPS, fetch a route and report back with the generation,
//! persist, announce) plus the updated navigation state. Timestamps cross the
//! boundary as Unix milliseconds.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::config::NavigationConfig;
use crate::directions::parse_directions;
use crate::engine::{NavigationEngine, NavigationUpdate};
use crate::error::{NavigationError, Result};
use crate::route::{RouteResponse, TravelMode};
use crate::session::StartRequest;
use crate::state::Effect;
use crate::{geodesy, init_logging, polyline, Coordinate, EtaEstimator, LocationFix};

// ============================================================================
// Global Singleton
// ============================================================================

/// Global navigator driven by the host.
static NAVIGATOR: Lazy<Mutex<NavigationEngine>> =
    Lazy::new(|| Mutex::new(NavigationEngine::default()));

/// Run `f` with the global navigator locked.
fn with_navigator<F, R>(f: F) -> R
where
    F: FnOnce(&mut NavigationEngine) -> R,
{
    // A panic while locked leaves the engine in a consistent state (handle
    // swaps state atomically), so recover from poisoning
    let mut engine = NAVIGATOR.lock().unwrap_or_else(|p| p.into_inner());
    f(&mut engine)
}

/// Result of one FFI call, serialized to JSON.
#[derive(Debug, Serialize)]
pub struct FfiOutcome {
    pub effects: Vec<Effect>,
    pub error: Option<String>,
    pub update: NavigationUpdate,
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() }).to_string())
}

fn respond(engine: &NavigationEngine, result: Result<Vec<Effect>>) -> String {
    let (effects, error) = match result {
        Ok(effects) => (effects, None),
        Err(e) => {
            warn!("[Navigator] FFI call failed: {}", e);
            (Vec::new(), Some(e.to_string()))
        }
    };
    to_json(&FfiOutcome {
        effects,
        error,
        update: engine.snapshot(),
    })
}

fn drive<F>(f: F) -> String
where
    F: FnOnce(&mut NavigationEngine) -> Result<Vec<Effect>>,
{
    with_navigator(|engine| {
        let result = f(engine);
        respond(engine, result)
    })
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_mode(mode: &str) -> TravelMode {
    match mode {
        "bicycling" | "cycling" => TravelMode::Bicycling,
        "walking" => TravelMode::Walking,
        _ => TravelMode::Driving,
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Initialize logging and apply a JSON configuration (empty string keeps the
/// defaults). Returns an error message, or an empty string on success.
#[uniffi::export]
pub fn nav_init(config_json: String) -> String {
    init_logging();
    let config = if config_json.trim().is_empty() {
        Ok(NavigationConfig::default())
    } else {
        NavigationConfig::from_json(&config_json)
    };
    match config.and_then(|c| with_navigator(|e| e.set_config(c))) {
        Ok(()) => {
            info!("[Navigator] Initialized");
            String::new()
        }
        Err(e) => e.to_string(),
    }
}

#[uniffi::export]
pub fn nav_start(
    origin_lat: f64,
    origin_lng: f64,
    destination_lat: f64,
    destination_lng: f64,
    destination_name: Option<String>,
    mode: String,
    group_id: Option<String>,
    now_ms: i64,
) -> String {
    let request = StartRequest {
        origin: Coordinate::new(origin_lat, origin_lng),
        destination: Coordinate::new(destination_lat, destination_lng),
        destination_name,
        mode: parse_mode(&mode),
        group_id,
    };
    drive(|e| e.start(request, timestamp(now_ms)))
}

/// Report a provider-neutral route (`RouteResponse` JSON) for `generation`.
#[uniffi::export]
pub fn nav_route_ready(generation: u64, response_json: String, now_ms: i64) -> String {
    let now = timestamp(now_ms);
    match serde_json::from_str::<RouteResponse>(&response_json) {
        Ok(response) => drive(|e| e.route_ready(generation, response, now)),
        Err(err) => {
            let error = NavigationError::RouteFetch {
                message: format!("invalid route payload: {}", err),
            };
            drive(|e| e.route_failed(generation, error, now))
        }
    }
}

/// Report a raw Google Directions JSON answer for `generation`.
#[uniffi::export]
pub fn nav_directions_ready(generation: u64, directions_json: String, now_ms: i64) -> String {
    let now = timestamp(now_ms);
    match parse_directions(&directions_json) {
        Ok(response) => drive(|e| e.route_ready(generation, response, now)),
        Err(error) => drive(|e| e.route_failed(generation, error, now)),
    }
}

#[uniffi::export]
pub fn nav_route_failed(generation: u64, message: String, now_ms: i64) -> String {
    let error = NavigationError::RouteFetch { message };
    drive(|e| e.route_failed(generation, error, timestamp(now_ms)))
}

#[uniffi::export]
pub fn nav_update_location(
    latitude: f64,
    longitude: f64,
    speed_mps: Option<f64>,
    bearing: Option<f64>,
    accuracy_m: Option<f64>,
    fix_time_ms: i64,
    now_ms: i64,
) -> String {
    let fix = LocationFix {
        coordinate: Coordinate::new(latitude, longitude),
        speed_mps,
        bearing,
        accuracy_m,
        timestamp: timestamp(fix_time_ms),
    };
    drive(|e| e.update_location(fix, timestamp(now_ms)))
}

#[uniffi::export]
pub fn nav_pause(now_ms: i64) -> String {
    drive(|e| e.pause(timestamp(now_ms)))
}

#[uniffi::export]
pub fn nav_resume(now_ms: i64) -> String {
    drive(|e| e.resume(timestamp(now_ms)))
}

#[uniffi::export]
pub fn nav_recalculate(now_ms: i64) -> String {
    drive(|e| e.recalculate(timestamp(now_ms)))
}

/// Call when a `schedule_retry` effect's delay has elapsed.
#[uniffi::export]
pub fn nav_retry_due(generation: u64, now_ms: i64) -> String {
    drive(|e| e.retry_due(generation, timestamp(now_ms)))
}

#[uniffi::export]
pub fn nav_end(completed: bool, now_ms: i64) -> String {
    drive(|e| e.end(completed, timestamp(now_ms)))
}

#[uniffi::export]
pub fn nav_reset(now_ms: i64) -> String {
    drive(|e| e.reset(timestamp(now_ms)))
}

/// Current navigation state as `NavigationUpdate` JSON.
#[uniffi::export]
pub fn nav_state_json() -> String {
    with_navigator(|e| to_json(&e.snapshot()))
}

/// Current session as JSON, or `{"error": ...}` when no session exists.
#[uniffi::export]
pub fn nav_session_json() -> String {
    with_navigator(|e| match e.require_session("export session") {
        Ok(session) => to_json(session),
        Err(err) => serde_json::json!({ "error": err.to_string() }).to_string(),
    })
}

// ============================================================================
// Stateless helpers
// ============================================================================

/// Decode a polyline into flat `[lat, lng, lat, lng, ...]`.
/// Malformed input yields the coordinates decoded before the error.
#[uniffi::export]
pub fn polyline_decode(encoded: String, precision: u32) -> Vec<f64> {
    let points = match polyline::decode_with_precision(&encoded, precision) {
        Ok(points) => points,
        Err(e) => {
            warn!("[Navigator] {}", e);
            e.partial
        }
    };
    points
        .iter()
        .flat_map(|p| [p.latitude, p.longitude])
        .collect()
}

/// Encode flat `[lat, lng, ...]` coordinates. A trailing odd value is ignored.
#[uniffi::export]
pub fn polyline_encode(coords: Vec<f64>, precision: u32) -> String {
    let points: Vec<Coordinate> = coords
        .chunks_exact(2)
        .map(|c| Coordinate::new(c[0], c[1]))
        .collect();
    polyline::encode_with_precision(&points, precision)
}

#[uniffi::export]
pub fn geo_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    geodesy::distance_meters(&Coordinate::new(lat1, lng1), &Coordinate::new(lat2, lng2))
}

#[uniffi::export]
pub fn geo_bearing(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    geodesy::bearing_degrees(&Coordinate::new(lat1, lng1), &Coordinate::new(lat2, lng2))
}

/// ETA as Unix milliseconds, using the navigator's configured speed floor and correction.
#[uniffi::export]
pub fn eta_unix_ms(
    remaining_distance_m: f64,
    speed_kmh: f64,
    remaining_duration_s: f64,
    now_ms: i64,
) -> i64 {
    let estimator = with_navigator(|e| EtaEstimator::new(e.config()));
    estimator
        .calculate_eta(
            remaining_distance_m,
            speed_kmh,
            remaining_duration_s,
            timestamp(now_ms),
        )
        .timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_polyline_helpers() {
        let flat = polyline_decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@".to_string(), 5);
        assert_eq!(flat.len(), 6);
        assert!((flat[0] - 38.5).abs() < 1e-9);
        assert_eq!(polyline_encode(flat, 5), "_p~iF~ps|U_ulLnnqC_mqNvxq`@");

        // Partial result on malformed input
        assert_eq!(polyline_decode("_p~iF~ps|U_".to_string(), 5).len(), 2);
    }

    #[test]
    fn test_eta_helper() {
        let now = 1_700_000_000_000;
        assert_eq!(eta_unix_ms(1000.0, 3.0, 120.0, now), now + 120_000);
    }

    #[test]
    fn test_global_navigator_sequence() {
        let now = 1_700_000_000_000;
        let out: Value = serde_json::from_str(&nav_start(
            52.0,
            13.0,
            52.01,
            13.0,
            Some("Museum".to_string()),
            "bicycling".to_string(),
            None,
            now,
        ))
        .unwrap();
        assert!(out["error"].is_null());
        assert_eq!(out["update"]["status"], "loading");
        let generation = out["effects"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["type"] == "fetch_route")
            .map(|e| e["data"]["generation"].as_u64().unwrap())
            .unwrap();

        let a = Coordinate::new(52.0, 13.0);
        let b = Coordinate::new(52.01, 13.0);
        let response = serde_json::json!({
            "steps": [{
                "start": a,
                "end": b,
                "instruction": "Head north",
                "distance_m": 1112.0,
                "duration_s": 300.0,
                "polyline": polyline::encode(&[a, b]),
            }],
            "overview_polyline": polyline::encode(&[a, b]),
            "total_distance_m": 1112.0,
            "total_duration_s": 300.0,
        });
        let out: Value =
            serde_json::from_str(&nav_route_ready(generation, response.to_string(), now)).unwrap();
        assert_eq!(out["update"]["status"], "active");
        let session: Value = serde_json::from_str(&nav_session_json()).unwrap();
        assert_eq!(session["destination_name"], "Museum");

        let out: Value = serde_json::from_str(&nav_reset(now)).unwrap();
        assert!(out["error"].as_str().unwrap().contains("reset"));

        let out: Value = serde_json::from_str(&nav_end(false, now)).unwrap();
        assert_eq!(out["update"]["status"], "cancelled");
        let out: Value = serde_json::from_str(&nav_reset(now)).unwrap();
        assert_eq!(out["update"]["status"], "idle");
    }
}
