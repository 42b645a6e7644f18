//! OAuth 2.0 client-credentials authentication for the MOT History API.
//!
//! Tokens are cached in memory until shortly before they expire and are
//! never written to disk. Refresh is single-flight: callers that find the
//! cache empty or stale serialize on a mutex and re-check before requesting a
//! new token, so a burst of calls near expiry produces one token request.

use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};
use url::Url;

use crate::config::Credentials;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Tokens are treated as expired this long before the server says they are.
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Lifetime assumed when the token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

// ─────────────────────────────────────────────────────────────────────────────
// AccessToken
// ─────────────────────────────────────────────────────────────────────────────

/// A bearer token and the instant after which it must not be used.
#[derive(Clone)]
pub struct AccessToken {
    secret: SecretString,
    expires_at: Instant,
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AccessToken {
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn same_as(&self, other: &AccessToken) -> bool {
        self.secret.expose_secret() == other.secret.expose_secret()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response Types
// ─────────────────────────────────────────────────────────────────────────────

/// Response from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Authenticator
// ─────────────────────────────────────────────────────────────────────────────

/// Obtains and caches client-credentials access tokens.
///
/// # Thread Safety
///
/// - `cached`: `RwLock` allowing concurrent reads of a valid token.
/// - `refresh_lock`: `Mutex` serializing token requests.
pub struct Authenticator {
    http: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
    scope: String,
    expiry_margin: Duration,
    cached: RwLock<Option<AccessToken>>,
    refresh_lock: Mutex<()>,
}

impl Authenticator {
    pub fn new(http: reqwest::Client, creds: &Credentials) -> Self {
        Self {
            http,
            token_url: creds.token_url.clone(),
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            scope: creds.scope_url.clone(),
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
            cached: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Overrides how long before the server-side expiry a token is renewed.
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Returns a valid access token, requesting one only when the cache is
    /// empty or expired.
    ///
    /// # Errors
    ///
    /// `AppError::Authentication` if the token endpoint is unreachable, rejects
    /// the credentials, or returns an unreadable body.
    pub async fn get_token(&self) -> Result<AccessToken, AppError> {
        if let Some(token) = self.cached_valid().await {
            return Ok(token);
        }

        let _refresh_guard = self.refresh_lock.lock().await;

        // Double-check: another caller may have refreshed while we waited
        if let Some(token) = self.cached_valid().await {
            return Ok(token);
        }

        let token = self.request_token().await?;
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }

    /// Drops the cached token if it is still `rejected`.
    ///
    /// Used after the API answers 401; a token already replaced by another
    /// caller is left alone.
    pub async fn invalidate(&self, rejected: &AccessToken) {
        let mut guard = self.cached.write().await;
        if guard.as_ref().is_some_and(|t| t.same_as(rejected)) {
            *guard = None;
        }
    }

    async fn cached_valid(&self) -> Option<AccessToken> {
        self.cached
            .read()
            .await
            .as_ref()
            .filter(|t| !t.is_expired())
            .cloned()
    }

    /// Performs the client-credentials grant.
    ///
    /// Never logs the client secret or the returned token.
    async fn request_token(&self) -> Result<AccessToken, AppError> {
        info!("[AUTH] Requesting access token...");

        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", self.scope.as_str()),
        ];

        let issued = Instant::now();
        let response = self
            .http
            .post(self.token_url.as_str())
            .form(&params)
            .send()
            .await
            .map_err(|_| {
                error!("[AUTH] Token request failed");
                AppError::Authentication("Token endpoint is unreachable".to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            // Drain the body but keep it out of the error: it can echo the request
            let _ = response.text().await;
            error!("[AUTH] Token request failed with status: {}", status);
            return Err(AppError::Authentication(format!(
                "Token endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let token_response: TokenResponse = response.json().await.map_err(|_| {
            error!("[AUTH] Failed to parse token response");
            AppError::Authentication("Invalid token response".to_string())
        })?;

        if token_response.access_token.is_empty() {
            return Err(AppError::Authentication(
                "Token endpoint returned an empty token".to_string(),
            ));
        }

        let lifetime = Duration::from_secs(
            token_response
                .expires_in
                .unwrap_or(DEFAULT_EXPIRES_IN_SECS),
        );
        let expires_at = issued + lifetime.saturating_sub(self.expiry_margin);

        info!(
            "[AUTH] Access token acquired (valid for {}s)",
            lifetime.as_secs()
        );

        Ok(AccessToken {
            secret: SecretString::from(token_response.access_token),
            expires_at,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
