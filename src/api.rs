//! HTTP transport to the branch reconciliation server.
//!
//! Provides the `BatchTransport` seam the dispatcher and connectivity
//! monitor run against, plus the reqwest-backed production implementation,
//! server URL normalisation, and connection-string decoding used during
//! terminal provisioning.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::protocol::{SyncBatchRequest, SyncBatchResponse};

/// Timeout for a batch submission (the one network-bound suspension point
/// of a sync pass). A timeout is reported like any other transport failure
/// and retried with backoff.
const BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the lightweight health probe.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Abstract wire transport for the sync protocol.
///
/// A transport-level `Err` from `submit_batch` means no per-item outcomes
/// exist; the dispatcher treats every item of that batch as a transient
/// failure.
pub trait BatchTransport: Send + Sync + 'static {
    /// POST one batch to the server and return its per-item outcome report.
    fn submit_batch(
        &self,
        request: SyncBatchRequest,
    ) -> impl Future<Output = Result<SyncBatchResponse, String>> + Send;

    /// Lightweight reachability probe. Never errors; unreachable is `false`.
    fn check_health(&self) -> impl Future<Output = bool> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the reconciliation server URL:
/// - strip trailing slashes
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

    url
}

// ---------------------------------------------------------------------------
// Connection-string decoding
// ---------------------------------------------------------------------------

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn extract_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            keys.iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str).map(|s| s.trim().to_string()))
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    extract_string_field(raw, &["key"])
}

pub fn extract_server_url_from_connection_string(raw: &str) -> Option<String> {
    extract_string_field(raw, &["url"]).map(|u| normalize_server_url(&u))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    extract_string_field(raw, &["tid", "terminalId"])
}

pub fn extract_branch_id_from_connection_string(raw: &str) -> Option<String> {
    extract_string_field(raw, &["bid", "branchId"])
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach sync server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid sync server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Sync endpoint not found".to_string(),
        s if s >= 500 => format!("Sync server error (HTTP {s})"),
        s => format!("Unexpected response from sync server (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// Production transport
// ---------------------------------------------------------------------------

/// reqwest-backed transport for the batch sync protocol.
pub struct HttpTransport {
    base_url: String,
    api_key: String,
    terminal_id: String,
    batch_client: Client,
    health_client: Client,
}

impl HttpTransport {
    pub fn new(server_url: &str, api_key: &str, terminal_id: &str) -> Result<Self, String> {
        let base_url = normalize_server_url(server_url);
        let resolved_api_key =
            extract_api_key_from_connection_string(api_key).unwrap_or_else(|| api_key.to_string());

        let batch_client = Client::builder()
            .timeout(BATCH_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        let health_client = Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            base_url,
            api_key: resolved_api_key,
            terminal_id: terminal_id.to_string(),
            batch_client,
            health_client,
        })
    }

    /// Build a transport from the credentials stored during provisioning.
    pub fn from_stored_credentials() -> Result<Self, String> {
        let server_url =
            crate::storage::get_credential("server_url").ok_or("Server URL not configured")?;
        let api_key =
            crate::storage::get_credential("pos_api_key").ok_or("API key not configured")?;
        let terminal_id = crate::storage::get_credential("terminal_id").unwrap_or_default();
        Self::new(&server_url, &api_key, &terminal_id)
    }
}

impl BatchTransport for HttpTransport {
    async fn submit_batch(&self, request: SyncBatchRequest) -> Result<SyncBatchResponse, String> {
        let url = format!("{}/sync/batch", self.base_url);
        debug!(
            transactions = request.transactions.len(),
            branch_id = %request.branch_id,
            "Submitting sync batch"
        );

        let resp = self
            .batch_client
            .post(&url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
            .json(&request)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        if !status.is_success() {
            // Preserve validation details for the sync queue's last_error.
            let body_text = resp.text().await.unwrap_or_default();
            let detail = if body_text.trim().is_empty() {
                format!("{} (HTTP {})", status_error(status), status.as_u16())
            } else {
                format!(
                    "{} (HTTP {}): {}",
                    status_error(status),
                    status.as_u16(),
                    body_text.trim()
                )
            };
            return Err(detail);
        }

        resp.json::<SyncBatchResponse>()
            .await
            .map_err(|e| format!("Invalid JSON from sync server: {e}"))
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .health_client
            .get(&url)
            .header("X-POS-API-Key", &self.api_key)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
