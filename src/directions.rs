//! Google-Directions-style JSON adapter.
//!
//! Converts a directions document (`routes[0].legs[*].steps[*]`) into the
//! provider-neutral [`RouteResponse`]. Only the first route is used; legs are
//! flattened into one step list.

use log::{debug, warn};
use serde::Deserialize;

use crate::error::{NavigationError, Result};
use crate::route::{RouteRequest, RouteResponse, StepResponse};
use crate::Coordinate;

#[derive(Debug, Deserialize)]
struct DirectionsDocument {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    routes: Vec<ApiRoute>,
}

#[derive(Debug, Deserialize)]
struct ApiRoute {
    #[serde(default)]
    overview_polyline: Option<ApiPolyline>,
    #[serde(default)]
    legs: Vec<ApiLeg>,
}

#[derive(Debug, Deserialize)]
struct ApiLeg {
    #[serde(default)]
    distance: Option<ApiValue>,
    #[serde(default)]
    duration: Option<ApiValue>,
    #[serde(default)]
    steps: Vec<ApiStep>,
}

#[derive(Debug, Deserialize)]
struct ApiStep {
    start_location: ApiLatLng,
    end_location: ApiLatLng,
    #[serde(default)]
    html_instructions: String,
    #[serde(default)]
    maneuver: Option<String>,
    #[serde(default)]
    distance: Option<ApiValue>,
    #[serde(default)]
    duration: Option<ApiValue>,
    #[serde(default)]
    polyline: Option<ApiPolyline>,
}

#[derive(Debug, Deserialize)]
struct ApiLatLng {
    lat: f64,
    lng: f64,
}

impl From<ApiLatLng> for Coordinate {
    fn from(p: ApiLatLng) -> Self {
        Coordinate::new(p.lat, p.lng)
    }
}

#[derive(Debug, Deserialize)]
struct ApiValue {
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ApiPolyline {
    points: String,
}

fn value_of(v: Option<ApiValue>) -> f64 {
    v.map(|v| v.value).unwrap_or(0.0)
}

/// Parse a directions JSON document.
///
/// `ZERO_RESULTS` and documents without routes or steps map to
/// [`NavigationError::EmptyRoute`]; any other non-`OK` status is a
/// [`NavigationError::RouteFetch`].
pub fn parse_directions(json: &str) -> Result<RouteResponse> {
    let doc: DirectionsDocument =
        serde_json::from_str(json).map_err(|e| NavigationError::RouteFetch {
            message: format!("invalid directions payload: {}", e),
        })?;

    match doc.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" => return Err(NavigationError::EmptyRoute),
        status => {
            let detail = doc.error_message.unwrap_or_default();
            warn!("[Directions] Provider status {} {}", status, detail);
            return Err(NavigationError::RouteFetch {
                message: if detail.is_empty() {
                    format!("provider status {}", status)
                } else {
                    format!("provider status {}: {}", status, detail)
                },
            });
        }
    }

    let route = doc
        .routes
        .into_iter()
        .next()
        .ok_or(NavigationError::EmptyRoute)?;

    let mut total_distance_m = 0.0;
    let mut total_duration_s = 0.0;
    let mut steps = Vec::new();

    for leg in route.legs {
        total_distance_m += value_of(leg.distance);
        total_duration_s += value_of(leg.duration);
        for step in leg.steps {
            steps.push(StepResponse {
                start: step.start_location.into(),
                end: step.end_location.into(),
                instruction: strip_html(&step.html_instructions),
                maneuver: step.maneuver.filter(|m| !m.is_empty()),
                distance_m: value_of(step.distance),
                duration_s: value_of(step.duration),
                polyline: step.polyline.map(|p| p.points).unwrap_or_default(),
            });
        }
    }

    if steps.is_empty() {
        return Err(NavigationError::EmptyRoute);
    }
    debug!(
        "[Directions] Parsed {} steps, {:.0} m, {:.0} s",
        steps.len(),
        total_distance_m,
        total_duration_s
    );

    Ok(RouteResponse {
        steps,
        overview_polyline: route
            .overview_polyline
            .map(|p| p.points)
            .unwrap_or_default(),
        total_distance_m,
        total_duration_s,
    })
}

/// Remove markup from an instruction and decode the common entities.
///
/// Tags become word breaks so `Turn <b>left</b><div>Destination ahead</div>`
/// reads "Turn left Destination ahead".
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    let words: Vec<&str> = decoded.split_whitespace().collect();
    let mut out = words.join(" ");
    // Inline tags around punctuation leave a stray space: "<b>Main St</b>, then"
    for punct in [",", ".", ";", ":"] {
        out = out.replace(&format!(" {}", punct), punct);
    }
    out
}

/// Query parameters for a directions request.
pub fn query_params(request: &RouteRequest, api_key: &str) -> Vec<(&'static str, String)> {
    vec![
        (
            "origin",
            format!("{},{}", request.origin.latitude, request.origin.longitude),
        ),
        (
            "destination",
            format!(
                "{},{}",
                request.destination.latitude, request.destination.longitude
            ),
        ),
        ("mode", request.mode.as_str().to_string()),
        ("key", api_key.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{PlannedRoute, TravelMode};

    const SAMPLE: &str = r#"{
        "status": "OK",
        "routes": [{
            "overview_polyline": { "points": "_p~iF~ps|U_ulLnnqC_mqNvxq`@" },
            "legs": [{
                "distance": { "text": "620 km", "value": 620000 },
                "duration": { "text": "6 hours", "value": 21600 },
                "steps": [
                    {
                        "start_location": { "lat": 38.5, "lng": -120.2 },
                        "end_location": { "lat": 40.7, "lng": -120.95 },
                        "html_instructions": "Head <b>north</b> on <b>Main St</b>",
                        "distance": { "text": "250 km", "value": 250000 },
                        "duration": { "text": "2 hours", "value": 9000 },
                        "polyline": { "points": "_p~iF~ps|U_ulLnnqC" }
                    },
                    {
                        "start_location": { "lat": 40.7, "lng": -120.95 },
                        "end_location": { "lat": 43.252, "lng": -126.453 },
                        "html_instructions": "Turn <b>left</b> &amp; continue<div style=\"font-size:0.9em\">Destination will be on the right</div>",
                        "maneuver": "turn-left",
                        "distance": { "text": "370 km", "value": 370000 },
                        "duration": { "text": "4 hours", "value": 12600 },
                        "polyline": { "points": "_flwFn`faV_mqNvxq`@" }
                    }
                ]
            }]
        }]
    }"#;

    #[test]
    fn test_parse_sample_document() {
        let response = parse_directions(SAMPLE).unwrap();
        assert_eq!(response.steps.len(), 2);
        assert_eq!(response.total_distance_m, 620_000.0);
        assert_eq!(response.total_duration_s, 21_600.0);
        assert_eq!(response.steps[0].instruction, "Head north on Main St");
        assert_eq!(response.steps[0].maneuver, None);
        assert_eq!(response.steps[1].maneuver.as_deref(), Some("turn-left"));
        assert_eq!(
            response.steps[1].instruction,
            "Turn left & continue Destination will be on the right"
        );
    }

    #[test]
    fn test_sample_builds_planned_route() {
        let response = parse_directions(SAMPLE).unwrap();
        let route = PlannedRoute::from_response(&response, 5).unwrap();
        assert_eq!(route.len(), 2);
        assert_eq!(route.polyline.len(), 3);
        assert!((route.steps[1].end.longitude + 126.453).abs() < 1e-9);
    }

    #[test]
    fn test_provider_errors() {
        let denied = r#"{"status": "REQUEST_DENIED", "error_message": "bad key", "routes": []}"#;
        match parse_directions(denied) {
            Err(NavigationError::RouteFetch { message }) => assert!(message.contains("bad key")),
            other => panic!("unexpected {:?}", other),
        }

        let none = r#"{"status": "ZERO_RESULTS", "routes": []}"#;
        assert!(matches!(parse_directions(none), Err(NavigationError::EmptyRoute)));

        let no_steps = r#"{"status": "OK", "routes": [{"legs": [{"steps": []}]}]}"#;
        assert!(matches!(parse_directions(no_steps), Err(NavigationError::EmptyRoute)));

        assert!(matches!(
            parse_directions("<html>"),
            Err(NavigationError::RouteFetch { .. })
        ));
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("Turn <b>right</b> onto <b>Quai</b>, then"), "Turn right onto Quai, then");
        assert_eq!(strip_html("plain"), "plain");
        assert_eq!(strip_html("a&nbsp;b"), "a b");
    }

    #[test]
    fn test_query_params() {
        let request = RouteRequest {
            origin: Coordinate::new(46.5, 6.6),
            destination: Coordinate::new(46.2, 6.1),
            mode: TravelMode::Bicycling,
        };
        let params = query_params(&request, "k");
        assert_eq!(params[0], ("origin", "46.5,6.6".to_string()));
        assert_eq!(params[2], ("mode", "bicycling".to_string()));
        assert_eq!(params[3], ("key", "k".to_string()));
    }
}
