//! Salesforce HTTP client with secure credential handling and safe logging.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::error::AppError;
use crate::salesforce::auth::Session;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// User agent string for all Salesforce API requests.
const CLIENT_USER_AGENT: &str = concat!("sf-bulk-sync/", env!("CARGO_PKG_VERSION"));

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Query parameter keys (case-insensitive) that should have their values redacted.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "access_token",
    "refresh_token",
    "client_secret",
    "code",
    "token",
    "sid",
    "session",
    "authorization",
];

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// Controls how URLs are sanitized for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// Log only the path component. Strips scheme, host, query, and fragment.
    /// Example: `/services/data/v60.0/jobs/ingest`
    #[default]
    PathOnly,

    /// Log path and query parameters, but redact sensitive values.
    /// Example: `/services/data/v60.0/jobs/query/750.../results?locator=abc`
    PathAndQueryRedacted,
}

// ─────────────────────────────────────────────────────────────────────────────
// URL Sanitization
// ─────────────────────────────────────────────────────────────────────────────

/// Determines if a query parameter key is sensitive and should be redacted.
fn is_sensitive_param(key: &str) -> bool {
    let key_lower = key.to_ascii_lowercase();
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|&sensitive| key_lower == sensitive)
}

/// Sanitizes a URL for safe logging based on the specified mode.
///
/// The result never contains the scheme, host, or fragment.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    let path = url.path();

    match mode {
        LoggingMode::PathOnly => path.to_string(),
        LoggingMode::PathAndQueryRedacted => {
            let query_pairs: Vec<_> = url.query_pairs().collect();
            if query_pairs.is_empty() {
                return path.to_string();
            }

            let redacted_pairs: Vec<String> = query_pairs
                .into_iter()
                .map(|(key, value)| {
                    if is_sensitive_param(&key) {
                        format!("{}=***", key)
                    } else {
                        format!("{}={}", key, value)
                    }
                })
                .collect();

            format!("{}?{}", path, redacted_pairs.join("&"))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Salesforce error mapping
// ─────────────────────────────────────────────────────────────────────────────

/// Salesforce API error response format.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SalesforceApiError {
    pub message: String,
    pub error_code: String,
}

/// Maps a non-success response to an `AppError`.
///
/// - 401 becomes `SessionExpired`
/// - 429 becomes `RateLimited` (with `Retry-After` when present)
/// - 404 becomes `NotFound(not_found)`
/// - `[{errorCode, message}]` bodies become `SalesforceError("[CODE] message")`,
///   except `REQUEST_LIMIT_EXCEEDED` which is `RateLimited`
pub(crate) async fn parse_error_response(
    response: reqwest::Response,
    not_found: &str,
) -> AppError {
    let status = response.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return AppError::SessionExpired;
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        return AppError::RateLimited {
            retry_after_secs: retry_after,
        };
    }

    if status == reqwest::StatusCode::NOT_FOUND {
        return AppError::NotFound(not_found.to_string());
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("Unable to read error body"));

    if let Some(first_error) = parse_api_errors(&body).into_iter().next() {
        if first_error.error_code == "REQUEST_LIMIT_EXCEEDED" {
            return AppError::RateLimited {
                retry_after_secs: None,
            };
        }

        return AppError::SalesforceError(format!(
            "[{}] {}",
            first_error.error_code, first_error.message
        ));
    }

    AppError::SalesforceError(format!(
        "HTTP {} - {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown error")
    ))
}

/// Parses a `[{errorCode, message}]` body; anything else yields no errors.
pub(crate) fn parse_api_errors(body: &str) -> Vec<SalesforceApiError> {
    serde_json::from_str::<Vec<SalesforceApiError>>(body).unwrap_or_default()
}

// ─────────────────────────────────────────────────────────────────────────────
// SalesforceClient
// ─────────────────────────────────────────────────────────────────────────────

/// Body of an outgoing request.
pub(crate) enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Csv(Vec<u8>),
}

/// HTTP client bound to one session.
///
/// Cheap to clone; the wire clients build one per call from the session the
/// orchestrator hands them, so a refreshed session is picked up on the next
/// call.
#[derive(Clone)]
pub struct SalesforceClient {
    /// The underlying HTTP client.
    http: Arc<reqwest::Client>,
    /// Instance URL requests are joined onto.
    base_url: Url,
    /// OAuth access token.
    access_token: SecretString,
    /// Controls URL sanitization for logging.
    logging_mode: LoggingMode,
}

impl SalesforceClient {
    pub fn new(http: Arc<reqwest::Client>, base_url: Url, access_token: SecretString) -> Self {
        Self {
            http,
            base_url,
            access_token,
            logging_mode: LoggingMode::default(),
        }
    }

    /// Builds a client for an established session.
    pub fn for_session(http: Arc<reqwest::Client>, session: &Session) -> Self {
        Self::new(
            http,
            session.instance_url.clone(),
            session.access_token.clone(),
        )
    }

    /// Updates the logging mode for URL sanitization.
    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    /// Builds a full URL by joining the path with the instance URL.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the URL cannot be built.
    pub fn build_url(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|_| AppError::Internal(format!("Invalid path: {}", path)))
    }

    /// Executes an authenticated request with timing and sanitized logging.
    ///
    /// Status codes are returned as-is; callers map failures with
    /// [`parse_error_response`].
    ///
    /// # Security
    ///
    /// - Never logs the Authorization header
    /// - Never logs request/response bodies
    /// - Sanitizes URLs before logging
    /// - Error messages never contain raw URLs or tokens
    pub(crate) async fn execute(
        &self,
        method: Method,
        url: Url,
        body: RequestBody,
    ) -> Result<reqwest::Response, AppError> {
        let start = Instant::now();
        let sanitized_url = sanitize_url_for_logs(&url, self.logging_mode);

        let mut request = self
            .http
            .request(method.clone(), url.as_str())
            .bearer_auth(self.access_token.expose_secret());
        request = match body {
            RequestBody::Empty => request,
            RequestBody::Json(value) => request.json(&value),
            RequestBody::Csv(bytes) => request.header("Content-Type", "text/csv").body(bytes),
        };

        let result = request.send().await;
        let duration_ms = start.elapsed().as_millis();

        match result {
            Ok(response) => {
                let status = response.status();
                let x_request_id = response
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");

                info!(
                    "[SFDC] {} {} {} {}ms {}",
                    method,
                    sanitized_url,
                    status.as_u16(),
                    duration_ms,
                    x_request_id
                );

                Ok(response)
            }
            Err(_) => {
                // The reqwest error may embed the full URL; never surface it
                info!("[SFDC] {} {} FAILED {}ms", method, sanitized_url, duration_ms);
                Err(AppError::ConnectionFailed(
                    "Connection to Salesforce failed".to_string(),
                ))
            }
        }
    }
}

/// Builds the configured HTTP client.
pub fn build_http_client() -> Result<reqwest::Client, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()
        .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
