//! # Route Navigator
//!
//! Turn-by-turn navigation engine for ride tracking.
//!
//! This library provides:
//! - Google polyline encoding/decoding
//! - Geodesic helpers (haversine distance, bearing, point-to-segment distance)
//! - Route progress tracking (current step, off-route, near-turn, remaining distance)
//! - Blended ETA estimation
//! - A navigation session state machine with a tokio service driving it
//!
//! ## Features
//!
//! - **`http`** - Enable the reqwest-backed directions provider
//! - **`persistence`** - Enable the SQLite session store
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use route_navigator::{geodesy, polyline};
//!
//! let points = polyline::decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@").unwrap();
//! assert_eq!(points.len(), 3);
//!
//! let first_leg = geodesy::distance_meters(&points[0], &points[1]);
//! assert!(first_leg > 200_000.0);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{DecodeError, DecodeErrorKind, NavigationError, OptionExt, Result};

// Tunables (thresholds, debounce, retry policy)
pub mod config;
pub use config::NavigationConfig;

// Polyline codec
pub mod polyline;

// Geographic utilities (distance, bearing, segment projection)
pub mod geodesy;

// Route model (steps, maneuvers, provider shapes)
pub mod route;
pub use route::{
    Maneuver, PlannedRoute, RouteRequest, RouteResponse, Step, StepResponse, TravelMode,
};

// Progress tracking against a planned route
pub mod progress;
pub use progress::{ProgressSnapshot, ProgressTracker};

// ETA estimation
pub mod eta;
pub use eta::{calculate_eta, EtaEstimator};

// Session value and lifecycle status
pub mod session;
pub use session::{Session, SessionStatus, StartRequest};

// Pure state machine (state, event) -> (state, effects)
pub mod state;
pub use state::{Effect, FetchPurpose, NavEvent, NavState, NavigationNotice, RouteFetch};

// Stateful engine owning the current navigation run
pub mod engine;
pub use engine::{NavigationEngine, NavigationUpdate};

// External collaborators (directions, location, persistence)
pub mod collaborators;
pub use collaborators::{DirectionsProvider, LocationSource, SessionStore};

// Directions JSON adapter
pub mod directions;

// Session stores
pub mod store;
pub use store::MemorySessionStore;
#[cfg(feature = "persistence")]
pub use store::SqliteSessionStore;

// Async service (single-writer mailbox around the engine)
pub mod service;
pub use service::{Collaborators, FixSink, NavigationHandle, NavigationService};

// HTTP directions provider
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::HttpDirectionsProvider;

// FFI bindings for mobile platforms (iOS/Android)
#[cfg(feature = "ffi")]
pub mod ffi;

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("RouteNavigatorRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate in degrees.
///
/// # Example
/// ```
/// use route_navigator::Coordinate;
/// let point = Coordinate::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Create a new coordinate.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the coordinate is finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

// geo uses x = longitude, y = latitude
impl From<Coordinate> for geo::Coord<f64> {
    fn from(c: Coordinate) -> Self {
        geo::Coord {
            x: c.longitude,
            y: c.latitude,
        }
    }
}

impl From<Coordinate> for geo::Point<f64> {
    fn from(c: Coordinate) -> Self {
        geo::Point::new(c.longitude, c.latitude)
    }
}

impl From<geo::Coord<f64>> for Coordinate {
    fn from(c: geo::Coord<f64>) -> Self {
        Coordinate::new(c.y, c.x)
    }
}

/// A single position report from the device location provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    /// Ground speed in m/s, if the provider reports one
    pub speed_mps: Option<f64>,
    /// Course over ground in degrees, if the provider reports one
    pub bearing: Option<f64>,
    /// Horizontal accuracy radius in meters
    pub accuracy_m: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LocationFix {
    /// Create a fix with no speed, bearing or accuracy.
    pub fn new(coordinate: Coordinate, timestamp: DateTime<Utc>) -> Self {
        Self {
            coordinate,
            speed_mps: None,
            bearing: None,
            accuracy_m: None,
            timestamp,
        }
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    pub fn with_bearing(mut self, bearing: f64) -> Self {
        self.bearing = Some(bearing);
        self
    }

    /// Speed converted to km/h. Negative or non-finite speeds are treated as unknown.
    pub fn speed_kmh(&self) -> Option<f64> {
        self.speed_mps
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(|s| s * 3.6)
    }
}

// ============================================================================
// Tests
// ============================================================================
