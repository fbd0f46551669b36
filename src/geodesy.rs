//! Geographic utilities.
//!
//! Haversine distance, initial bearing and point-to-segment distance on the
//! WGS84 mean sphere. The segment projection is planar in degree space, which
//! is accurate enough at route-step lengths; the distance to the projected
//! point is always haversine.

use geo::{Closest, ClosestPoint, Line, Point};

use crate::Coordinate;

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

// ============================================================================
// Point-to-point
// ============================================================================

/// Great-circle distance between two coordinates in meters.
///
/// Identical inputs yield exactly 0; the result is never NaN for finite inputs.
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlng = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    // Rounding can push h marginally outside [0, 1] for antipodal points
    let h = h.clamp(0.0, 1.0);

    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Initial bearing from `from` to `to`, in degrees within [0, 360).
///
/// Identical points yield 0.
pub fn bearing_degrees(from: &Coordinate, to: &Coordinate) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let dlng = (to.longitude - from.longitude).to_radians();

    let y = dlng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();

    let bearing = (y.atan2(x).to_degrees() + 360.0) % 360.0;
    if bearing >= 360.0 {
        0.0
    } else {
        bearing
    }
}

// ============================================================================
// Point-to-segment
// ============================================================================

/// Closest point on segment `a`-`b` to `p`, clamped to the segment ends.
///
/// A degenerate segment (`a == b`) projects onto `a`.
pub fn project_onto_segment(p: &Coordinate, a: &Coordinate, b: &Coordinate) -> Coordinate {
    if a == b {
        return *a;
    }

    let line = Line::new(geo::Coord::from(*a), geo::Coord::from(*b));
    let point: Point<f64> = (*p).into();

    match line.closest_point(&point) {
        Closest::Intersection(q) | Closest::SinglePoint(q) => Coordinate::new(q.y(), q.x()),
        Closest::Indeterminate => *a,
    }
}

/// Distance in meters from `p` to the nearest point of segment `a`-`b`.
pub fn point_to_segment_distance(p: &Coordinate, a: &Coordinate, b: &Coordinate) -> f64 {
    let projected = project_onto_segment(p, a, b);
    distance_meters(p, &projected)
}

// ============================================================================
// Point-to-polyline
// ============================================================================

/// Minimum distance in meters from `p` to any segment of `line`.
///
/// An empty polyline is infinitely far away; a single point degrades to a
/// point distance.
pub fn distance_to_polyline(p: &Coordinate, line: &[Coordinate]) -> f64 {
    match line {
        [] => f64::INFINITY,
        [only] => distance_meters(p, only),
        _ => line
            .windows(2)
            .map(|w| point_to_segment_distance(p, &w[0], &w[1]))
            .fold(f64::INFINITY, f64::min),
    }
}

/// Total length of a polyline in meters.
pub fn polyline_length(line: &[Coordinate]) -> f64 {
    line.windows(2)
        .map(|w| distance_meters(&w[0], &w[1]))
        .sum()
}
