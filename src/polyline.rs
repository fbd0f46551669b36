//! Google encoded polyline codec.
//!
//! Each coordinate is scaled by `10^precision`, rounded, and stored as the
//! delta from the previous coordinate. Deltas are zig-zag encoded and written
//! as 5-bit chunks, least significant first, with 0x20 as the continuation
//! bit and every chunk offset by 63 into printable ASCII.
//!
//! Decoding never panics: malformed input yields a [`DecodeError`] carrying the
//! coordinates decoded so far.

use crate::error::{DecodeError, DecodeErrorKind};
use crate::Coordinate;

/// Precision used by Google Directions (1e5).
pub const DEFAULT_PRECISION: u32 = 5;

const CHUNK_OFFSET: u8 = 63;
const CONTINUATION_BIT: u64 = 0x20;
const CHUNK_MASK: u64 = 0x1f;
const MAX_SHIFT: u32 = 60;

/// Decode a polyline at precision 5.
///
/// # Example
/// ```
/// use route_navigator::polyline;
///
/// let points = polyline::decode("_p~iF~ps|U").unwrap();
/// assert_eq!(points.len(), 1);
/// assert!((points[0].latitude - 38.5).abs() < 1e-9);
/// assert!((points[0].longitude + 120.2).abs() < 1e-9);
/// ```
pub fn decode(encoded: &str) -> Result<Vec<Coordinate>, DecodeError> {
    decode_with_precision(encoded, DEFAULT_PRECISION)
}

/// Decode a polyline at the given precision (5 for Google, 6 for polyline6).
pub fn decode_with_precision(
    encoded: &str,
    precision: u32,
) -> Result<Vec<Coordinate>, DecodeError> {
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut points = Vec::with_capacity(bytes.len() / 4);

    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;

    while index < bytes.len() {
        let lat_delta = match read_value(encoded, &mut index) {
            Ok(delta) => delta,
            Err((kind, offset)) => return Err(failure(kind, offset, points)),
        };
        if index >= bytes.len() {
            return Err(failure(DecodeErrorKind::MissingLongitude, index, points));
        }
        let lng_delta = match read_value(encoded, &mut index) {
            Ok(delta) => delta,
            Err((kind, offset)) => return Err(failure(kind, offset, points)),
        };

        lat = match lat.checked_add(lat_delta) {
            Some(v) => v,
            None => return Err(failure(DecodeErrorKind::Overflow, index, points)),
        };
        lng = match lng.checked_add(lng_delta) {
            Some(v) => v,
            None => return Err(failure(DecodeErrorKind::Overflow, index, points)),
        };

        points.push(Coordinate::new(lat as f64 / factor, lng as f64 / factor));
    }

    Ok(points)
}

/// Encode coordinates at precision 5.
///
/// Non-finite components encode as zero.
pub fn encode(points: &[Coordinate]) -> String {
    encode_with_precision(points, DEFAULT_PRECISION)
}

/// Encode coordinates at the given precision.
pub fn encode_with_precision(points: &[Coordinate], precision: u32) -> String {
    let factor = 10f64.powi(precision as i32);
    let mut out = String::with_capacity(points.len() * 8);

    let mut prev_lat: i64 = 0;
    let mut prev_lng: i64 = 0;

    for point in points {
        let lat = scale(point.latitude, factor);
        let lng = scale(point.longitude, factor);
        write_value(lat.wrapping_sub(prev_lat), &mut out);
        write_value(lng.wrapping_sub(prev_lng), &mut out);
        prev_lat = lat;
        prev_lng = lng;
    }

    out
}

fn scale(value: f64, factor: f64) -> i64 {
    // `as` saturates and maps NaN to 0
    (value * factor).round() as i64
}

fn write_value(delta: i64, out: &mut String) {
    let shifted = delta.wrapping_shl(1);
    let mut value = if delta < 0 { !shifted as u64 } else { shifted as u64 };

    while value >= CONTINUATION_BIT {
        let chunk = (CONTINUATION_BIT | (value & CHUNK_MASK)) as u8;
        out.push(char::from(chunk + CHUNK_OFFSET));
        value >>= 5;
    }
    out.push(char::from(value as u8 + CHUNK_OFFSET));
}

/// Read one zig-zag encoded value starting at `index`, advancing it past the value.
fn read_value(encoded: &str, index: &mut usize) -> Result<i64, (DecodeErrorKind, usize)> {
    let bytes = encoded.as_bytes();
    let mut result: u64 = 0;
    let mut shift: u32 = 0;

    loop {
        let Some(&byte) = bytes.get(*index) else {
            return Err((DecodeErrorKind::Truncated, *index));
        };
        if !(CHUNK_OFFSET..=CHUNK_OFFSET + 63).contains(&byte) {
            // Every byte before this one was ASCII, so `index` is a char boundary
            let ch = encoded[*index..].chars().next().unwrap_or(char::REPLACEMENT_CHARACTER);
            return Err((DecodeErrorKind::InvalidCharacter(ch), *index));
        }
        if shift > MAX_SHIFT {
            return Err((DecodeErrorKind::Overflow, *index));
        }

        let chunk = u64::from(byte - CHUNK_OFFSET);
        *index += 1;
        result |= (chunk & CHUNK_MASK) << shift;
        shift += 5;

        if chunk < CONTINUATION_BIT {
            break;
        }
    }

    let value = if result & 1 == 1 {
        !(result >> 1) as i64
    } else {
        (result >> 1) as i64
    };
    Ok(value)
}

fn failure(kind: DecodeErrorKind, offset: usize, partial: Vec<Coordinate>) -> DecodeError {
    DecodeError {
        kind,
        offset,
        partial,
    }
}
