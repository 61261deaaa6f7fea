//! Order server API client.
//!
//! Provides authenticated HTTP communication with the theater order server:
//! order submission and the lightweight connectivity probe the sync engine
//! gates on. The surface is a trait so tests drive the sync engine against a
//! scripted in-memory server.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

/// Timeout for a single order submission. A hung request must not stall the
/// whole queue, so failures past this are treated as ordinary submission
/// failures.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout used for the lightweight connectivity probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the order server URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    // Strip trailing slashes again (in case "/api/" was present)
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach order server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid order server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Access token is invalid or expired".to_string(),
        403 => "Terminal not authorized for this theater".to_string(),
        404 => "Order endpoint not found".to_string(),
        s if s >= 500 => format!("Order server error (HTTP {s})"),
        s => format!("Unexpected response from order server (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// API surface
// ---------------------------------------------------------------------------

/// The remote calls the sync engine depends on.
///
/// Submission errors are plain strings: the sync engine records them on the
/// queue record and in the drain summary rather than propagating them.
#[async_trait]
pub trait OrderApi: Send + Sync {
    /// POST one order body to the order-creation endpoint. Returns the
    /// created order JSON on success.
    async fn submit_order(&self, token: &str, payload: &Value) -> Result<Value, String>;

    /// Lightweight connectivity probe.
    async fn check_health(&self) -> bool;
}

/// reqwest-backed client for the theater order server.
pub struct HttpOrderApi {
    base_url: String,
}

impl HttpOrderApi {
    pub fn new(server_url: &str) -> Self {
        Self {
            base_url: normalize_server_url(server_url),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn submit_order(&self, token: &str, payload: &Value) -> Result<Value, String> {
        let url = format!("{}/api/orders", self.base_url);

        let client = Client::builder()
            .timeout(SUBMIT_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        let resp = client
            .post(&url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            // Preserve validation details for queue visibility.
            let detail = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|json| {
                    json.get("message")
                        .or_else(|| json.get("error"))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                })
                .unwrap_or_else(|| status_error(status));
            return Err(format!("{detail} (HTTP {})", status.as_u16()));
        }

        let json: Value = serde_json::from_str(&body_text)
            .map_err(|e| format!("Invalid JSON from order server: {e}"))?;

        // A 2xx with success=false in the body is still a failure.
        if json.get("success").and_then(Value::as_bool) != Some(true) {
            let message = json
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Order server rejected the order");
            return Err(message.to_string());
        }

        info!("Order accepted by server");
        Ok(json.get("order").cloned().unwrap_or(json))
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/api/health", self.base_url);

        let client = match Client::builder().timeout(HEALTH_TIMEOUT).build() {
            Ok(c) => c,
            Err(_) => return false,
        };

        match client.head(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_server_url() {
        assert_eq!(
            normalize_server_url("https://orders.example.com/"),
            "https://orders.example.com"
        );
        assert_eq!(
            normalize_server_url("orders.example.com"),
            "https://orders.example.com"
        );
        assert_eq!(
            normalize_server_url("localhost:3000"),
            "http://localhost:3000"
        );
        assert_eq!(
            normalize_server_url("https://orders.example.com/api/"),
            "https://orders.example.com"
        );
        assert_eq!(
            normalize_server_url("  https://orders.example.com/api  "),
            "https://orders.example.com"
        );
    }

    #[test]
    fn test_status_error_messages() {
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED),
            "Access token is invalid or expired"
        );
        assert_eq!(
            status_error(StatusCode::BAD_GATEWAY),
            "Order server error (HTTP 502)"
        );
        assert_eq!(
            status_error(StatusCode::IM_A_TEAPOT),
            "Unexpected response from order server (HTTP 418)"
        );
    }
}
