//! Signed HTTP dispatch.
//!
//! Boundary to the transport collaborator: issues one delivery attempt,
//! classifies the outcome for the retry engine, and probes reachability for
//! endpoint creation and re-activation. Payloads are signed with HMAC-SHA256
//! under every currently-valid endpoint secret, so receivers validating
//! against either the old or the new secret accept in-flight deliveries
//! during a rotation window.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sluice_core::error::CoreError;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

/// Configuration for the dispatch client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Fallback per-attempt timeout when the endpoint does not set one.
    pub default_timeout: Duration,

    /// User agent string for callbacks.
    pub user_agent: String,

    /// Maximum number of redirects to follow.
    pub max_redirects: u32,

    /// Whether to verify TLS certificates.
    pub verify_tls: bool,

    /// Signature header name used when the endpoint has no override.
    pub signature_header: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            user_agent: "Sluice-Delivery/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
            signature_header: "X-Sluice-Signature".to_string(),
        }
    }
}

/// One delivery attempt, ready to be dispatched.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Delivery being attempted.
    pub delivery_id: Uuid,

    /// Event being delivered.
    pub event_id: Uuid,

    /// Destination URL.
    pub url: String,

    /// Custom headers from the event.
    pub headers: HashMap<String, String>,

    /// Payload to deliver (possibly transformed).
    pub payload: Bytes,

    /// Currently-valid signing secrets, newest first.
    pub secrets: Vec<String>,

    /// Signature header override for this endpoint.
    pub signature_header: Option<String>,

    /// Whether to emit versioned signature values.
    pub advanced_signatures: bool,

    /// 1-based attempt number.
    pub attempt: u32,

    /// Hard per-attempt timeout.
    pub timeout: Duration,
}

/// Classified result of one dispatch attempt.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Whether the endpoint acknowledged with a 2xx.
    pub success: bool,

    /// HTTP status code, if the endpoint responded at all.
    pub status_code: Option<u16>,

    /// Round-trip latency.
    pub latency: Duration,

    /// Classified failure, feeding the retry decision. `None` on success.
    pub error: Option<DeliveryError>,
}

/// HTTP client for webhook dispatch.
///
/// Connection-pooled; safe to share across workers behind an `Arc`.
#[derive(Debug, Clone)]
pub struct DispatcherClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DispatcherClient {
    /// Creates a dispatch client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the underlying HTTP client
    /// cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a dispatch client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the client cannot be built.
    pub fn with_defaults() -> Result<Self, DeliveryError> {
        Self::new(ClientConfig::default())
    }

    /// Issues one signed delivery attempt and classifies the outcome.
    ///
    /// Never returns a `Result`: the outcome always carries the latency and
    /// a classified error when dispatch failed, which is what the retry
    /// engine consumes.
    pub async fn send(&self, request: DispatchRequest) -> DispatchOutcome {
        let started = std::time::Instant::now();

        let span = info_span!(
            "dispatch",
            delivery_id = %request.delivery_id,
            event_id = %request.event_id,
            url = %request.url,
            attempt = request.attempt,
        );

        async move {
            let timeout = if request.timeout.is_zero() {
                self.config.default_timeout
            } else {
                request.timeout
            };

            let signature_header =
                request.signature_header.as_deref().unwrap_or(&self.config.signature_header);
            let signature = signature_value(
                &request.payload,
                &request.secrets,
                request.advanced_signatures,
            );

            let mut http_request = self
                .client
                .post(&request.url)
                .timeout(timeout)
                .body(request.payload.clone())
                .header("content-type", "application/json");

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            http_request = http_request
                .header(signature_header, signature)
                .header("X-Sluice-Event-Id", request.event_id.to_string())
                .header("X-Sluice-Delivery-Id", request.delivery_id.to_string())
                .header("X-Sluice-Attempt", request.attempt.to_string());

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let latency = started.elapsed();
                    warn!(latency_ms = latency.as_millis() as u64, "dispatch failed: {e}");

                    let error = if e.is_timeout() {
                        DeliveryError::timeout(timeout)
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    };
                    return DispatchOutcome {
                        success: false,
                        status_code: None,
                        latency,
                        error: Some(error),
                    };
                },
            };

            let latency = started.elapsed();
            let status = response.status().as_u16();
            debug!(status, latency_ms = latency.as_millis() as u64, "response received");

            let error = match status {
                200..=299 => None,
                400..=499 => Some(DeliveryError::client_error(status)),
                _ => Some(DeliveryError::server_error(status)),
            };

            DispatchOutcome { success: error.is_none(), status_code: Some(status), latency, error }
        }
        .instrument(span)
        .await
    }

    /// Probes an endpoint URL for reachability.
    ///
    /// Used at endpoint creation and re-activation. Any HTTP response counts
    /// as reachable; only transport-level failures are errors.
    ///
    /// # Errors
    ///
    /// Returns a network or timeout error when the target is unreachable.
    pub async fn ping(&self, url: &str, timeout: Duration) -> Result<(), DeliveryError> {
        match self.client.head(url).timeout(timeout).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_timeout() => Err(DeliveryError::timeout(timeout)),
            Err(e) => Err(DeliveryError::network(e.to_string())),
        }
    }
}

/// Builds the signature header value for a payload.
///
/// Each valid secret contributes one HMAC-SHA256 hex digest; digests are
/// comma-joined. Advanced signatures prefix each digest with the scheme
/// version so receivers can evolve validation independently.
pub fn signature_value(payload: &Bytes, secrets: &[String], advanced: bool) -> String {
    secrets
        .iter()
        .filter_map(|secret| sign_payload(payload, secret).ok())
        .map(|digest| if advanced { format!("v1={digest}") } else { digest })
        .collect::<Vec<_>>()
        .join(",")
}

/// HMAC-SHA256 hex digest of the payload under one secret.
///
/// # Errors
///
/// Returns a configuration error for an unusable secret key.
pub fn sign_payload(payload: &[u8], secret: &str) -> Result<String, DeliveryError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| DeliveryError::configuration("invalid signing secret"))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Validates an endpoint URL at creation/update time.
///
/// Rejects non-http(s) schemes always, and plaintext `http` when the
/// project enforces secure endpoints.
///
/// # Errors
///
/// Returns a validation error describing the rejected URL.
pub fn validate_endpoint_url(url: &str, enforce_secure: bool) -> Result<(), CoreError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| CoreError::validation(format!("invalid endpoint url: {e}")))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" if !enforce_secure => Ok(()),
        "http" => Err(CoreError::validation(
            "only https endpoints are allowed when secure endpoints are enforced",
        )),
        scheme => Err(CoreError::validation(format!(
            "unsupported endpoint url scheme: {scheme}"
        ))),
    }
}

/// Headers owned by the dispatcher that must not be copied from the event.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "transfer-encoding"
            | "upgrade"
    )
}
