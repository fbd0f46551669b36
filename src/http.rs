//! HTTP directions provider.
//!
//! Issues Google-Directions-style requests with reqwest and parses the answer
//! with [`crate::directions::parse_directions`]. Timeouts are this adapter's
//! policy; the engine treats a timeout like any other fetch failure.

use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use reqwest::Client;

use crate::collaborators::DirectionsProvider;
use crate::directions::{parse_directions, query_params};
use crate::error::{NavigationError, Result};
use crate::route::{RouteRequest, RouteResponse};

const DEFAULT_BASE_URL: &str = "https://maps.googleapis.com/maps/api/directions/json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpDirectionsProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpDirectionsProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NavigationError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
        })
    }

    /// Point the provider at a different endpoint (proxy, self-hosted backend).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, request: RouteRequest) -> Result<RouteResponse> {
        debug!(
            "[Directions] GET {} ({:?} -> {:?}, {})",
            self.base_url,
            request.origin,
            request.destination,
            request.mode.as_str()
        );

        let response = self
            .client
            .get(&self.base_url)
            .query(&query_params(&request, &self.api_key))
            .send()
            .await
            .map_err(|e| NavigationError::RouteFetch {
                message: if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("request failed: {}", e)
                },
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!("[Directions] HTTP {}", status);
            return Err(NavigationError::RouteFetch {
                message: format!("HTTP {}", status),
            });
        }

        let body = response.text().await.map_err(|e| NavigationError::RouteFetch {
            message: format!("failed to read body: {}", e),
        })?;
        parse_directions(&body)
    }
}

impl DirectionsProvider for HttpDirectionsProvider {
    fn fetch_route(&self, request: RouteRequest) -> BoxFuture<'_, Result<RouteResponse>> {
        Box::pin(self.fetch(request))
    }
}
