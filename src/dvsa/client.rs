//! MOT History API HTTP client with token injection and safe logging.

use std::sync::Arc;
use std::time::Instant;

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use tracing::{info, warn};
use url::Url;

use crate::config::{Credentials, HttpSettings};
use crate::dvsa::auth::Authenticator;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Header carrying the API key on every API request.
const API_KEY_HEADER: &str = "X-API-Key";

/// Query keys whose values are masked in logs. Pre-signed bulk download URLs
/// carry their credentials in the query string.
const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "access_token",
    "client_secret",
    "code",
    "token",
    "signature",
    "x-amz-signature",
    "x-amz-credential",
    "x-amz-security-token",
    "sig",
];

// ─────────────────────────────────────────────────────────────────────────────
// LoggingMode
// ─────────────────────────────────────────────────────────────────────────────

/// How much of a URL reaches the logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoggingMode {
    /// Path only.
    /// Example: `/v1/trade/vehicles/bulk-download`
    #[default]
    PathOnly,

    /// Path plus query, with credential values masked (used at `-vv`).
    /// Example: `/bulk/file.zip?X-Amz-Signature=***&X-Amz-Expires=300`
    PathAndQueryRedacted,
}

// ─────────────────────────────────────────────────────────────────────────────
// URL Sanitization
// ─────────────────────────────────────────────────────────────────────────────

/// Exact, case-insensitive match against `SENSITIVE_QUERY_PARAMS`.
fn is_sensitive_param(key: &str) -> bool {
    SENSITIVE_QUERY_PARAMS
        .iter()
        .any(|candidate| key.eq_ignore_ascii_case(candidate))
}

/// Renders `url` for a log line. Scheme, host and fragment are always dropped.
pub fn sanitize_url_for_logs(url: &Url, mode: LoggingMode) -> String {
    let mut rendered = url.path().to_string();
    if mode == LoggingMode::PathOnly {
        return rendered;
    }

    let mut separator = '?';
    for (key, value) in url.query_pairs() {
        rendered.push(separator);
        rendered.push_str(&key);
        rendered.push('=');
        rendered.push_str(if is_sensitive_param(&key) { "***" } else { &value });
        separator = '&';
    }
    rendered
}

// ─────────────────────────────────────────────────────────────────────────────
// ApiClient
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP client for the MOT History API.
///
/// Every request carries a bearer token from the shared `Authenticator` and the
/// API key header. A 401 invalidates the cached token and the request is
/// retried once with a fresh one.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    auth: Arc<Authenticator>,
    api_url: Url,
    api_key: SecretString,
    logging_mode: LoggingMode,
}

impl ApiClient {
    /// Creates a client and its authenticator from static configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if the HTTP client fails to initialize.
    pub fn new(creds: &Credentials, settings: &HttpSettings) -> Result<Self, AppError> {
        let http = settings.build_client()?;
        let auth = Arc::new(Authenticator::new(http.clone(), creds));
        Ok(Self::with_authenticator(http, auth, creds))
    }

    /// Creates a client sharing an existing authenticator.
    pub fn with_authenticator(
        http: reqwest::Client,
        auth: Arc<Authenticator>,
        creds: &Credentials,
    ) -> Self {
        Self {
            http,
            auth,
            api_url: creds.api_url.clone(),
            api_key: creds.api_key.clone(),
            logging_mode: LoggingMode::default(),
        }
    }

    /// Updates the logging mode for URL sanitization.
    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    /// The authenticator used for every request.
    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.auth
    }

    /// Builds a full URL by joining the path with the API base URL.
    pub fn build_url(&self, path: &str) -> Result<Url, AppError> {
        self.api_url
            .join(path)
            .map_err(|_| AppError::Internal(format!("Invalid path: {}", path)))
    }

    /// Executes an authenticated GET and decodes a JSON body.
    ///
    /// # Errors
    ///
    /// - `AppError::Authentication` - no token could be obtained
    /// - `AppError::Api` - non-success status, or a body that does not match `T`
    /// - `AppError::RateLimited` - HTTP 429
    /// - `AppError::ConnectionFailed` - network error
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, AppError> {
        let response = self.request_authed(Method::GET, path).await?;
        let status = response.status();

        if !status.is_success() {
            return Err(parse_error_response(response, status).await);
        }

        let body = response.text().await.map_err(|_| {
            AppError::ConnectionFailed("Failed to read API response body".to_string())
        })?;

        serde_json::from_str(&body).map_err(|e| {
            AppError::api(
                status.as_u16(),
                &format!("Unexpected response shape: {}", e),
            )
        })
    }

    /// Executes an authenticated request with one retry after a 401.
    pub async fn request_authed(
        &self,
        method: Method,
        path: &str,
    ) -> Result<reqwest::Response, AppError> {
        let url = self.build_url(path)?;

        let token = self.auth.get_token().await?;
        let response = self
            .execute_authed_request(method.clone(), url.clone(), token.secret())
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!("[DVSA] Received 401, refreshing token and retrying...");
        self.auth.invalidate(&token).await;

        let token = self.auth.get_token().await?;
        let retry_response = self
            .execute_authed_request(method, url, token.secret())
            .await?;

        if retry_response.status() == StatusCode::UNAUTHORIZED {
            warn!("[DVSA] Still unauthorized after token refresh");
        }

        Ok(retry_response)
    }

    /// Executes a single authenticated request (no retry logic).
    ///
    /// Never logs headers or bodies; the URL is sanitized first.
    async fn execute_authed_request(
        &self,
        method: Method,
        url: Url,
        access_token: &SecretString,
    ) -> Result<reqwest::Response, AppError> {
        let start = Instant::now();
        let sanitized_url = sanitize_url_for_logs(&url, self.logging_mode);

        let result = self
            .http
            .request(method.clone(), url.as_str())
            .bearer_auth(access_token.expose_secret())
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await;
        let duration_ms = start.elapsed().as_millis();

        match result {
            Ok(response) => {
                info!(
                    "[DVSA] {} {} {} {}ms",
                    method,
                    sanitized_url,
                    response.status().as_u16(),
                    duration_ms
                );
                Ok(response)
            }
            Err(e) => {
                info!("[DVSA] {} {} FAILED {}ms", method, sanitized_url, duration_ms);
                let reason = if e.is_timeout() { "timed out" } else { "failed" };
                Err(AppError::ConnectionFailed(format!(
                    "Request to {} {}",
                    sanitized_url, reason
                )))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Handling
// ─────────────────────────────────────────────────────────────────────────────

/// Maps a non-success API response to an `AppError`.
pub(crate) async fn parse_error_response(
    response: reqwest::Response,
    status: StatusCode,
) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        return AppError::RateLimited {
            retry_after_secs: retry_after,
        };
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("Unable to read error body"));

    AppError::api(status.as_u16(), &body)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
