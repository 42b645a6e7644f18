//! Static configuration for the MOT History API client.
//!
//! Credentials come from `DVSA_*` environment variables (optionally seeded from
//! a `.env` file by the binary). They are loaded once and passed explicitly to
//! the components that need them.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

pub const ENV_CLIENT_ID: &str = "DVSA_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "DVSA_CLIENT_SECRET";
pub const ENV_API_KEY: &str = "DVSA_API_KEY";
pub const ENV_SCOPE_URL: &str = "DVSA_SCOPE_URL";
pub const ENV_TOKEN_URL: &str = "DVSA_TOKEN_URL";
pub const ENV_API_URL: &str = "DVSA_API_URL";

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default number of retries for bulk file downloads.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential download backoff.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// User agent string for all outbound requests.
pub const CLIENT_USER_AGENT: &str = concat!("mot-history/", env!("CARGO_PKG_VERSION"));

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// Credentials issued by the DVSA when registering for the API.
///
/// `client_secret` and `api_key` are wrapped in `SecretString` so they never
/// show up through `Debug` or logging.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: SecretString,
    pub api_key: SecretString,
    /// OAuth scope requested with the client-credentials grant.
    pub scope_url: String,
    /// OAuth token endpoint.
    pub token_url: Url,
    /// Base URL of the MOT History API.
    pub api_url: Url,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("api_key", &"[REDACTED]")
            .field("scope_url", &self.scope_url)
            .field("token_url", &self.token_url.as_str())
            .field("api_url", &self.api_url.as_str())
            .finish()
    }
}

impl Credentials {
    /// Loads credentials from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first missing or invalid variable.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads credentials through an arbitrary key lookup.
    ///
    /// Empty values are treated as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| -> Result<String, AppError> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| AppError::Config(format!("{} is not set", key)))
        };

        let client_id = require(ENV_CLIENT_ID)?;
        let client_secret = SecretString::from(require(ENV_CLIENT_SECRET)?);
        let api_key = SecretString::from(require(ENV_API_KEY)?);
        let scope_url = require(ENV_SCOPE_URL)?;
        let token_url = parse_url(ENV_TOKEN_URL, &require(ENV_TOKEN_URL)?)?;
        let api_url = parse_url(ENV_API_URL, &require(ENV_API_URL)?)?;

        Ok(Self {
            client_id,
            client_secret,
            api_key,
            scope_url,
            token_url,
            api_url,
        })
    }
}

fn parse_url(key: &str, value: &str) -> Result<Url, AppError> {
    let url =
        Url::parse(value).map_err(|e| AppError::Config(format!("{} is not a valid URL: {}", key, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AppError::Config(format!(
            "{} must be an http(s) URL, got scheme '{}'",
            key, other
        ))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HttpSettings
// ─────────────────────────────────────────────────────────────────────────────

/// Timeout and retry policy shared by the API client and the downloader.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Retries after the first attempt for bulk downloads (0 disables retry).
    pub max_retries: u32,
    /// Base delay, doubled on every retry.
    pub retry_backoff: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

impl HttpSettings {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_backoff.saturating_mul(factor)
    }

    /// Builds a `reqwest::Client` with this policy applied.
    pub fn build_client(&self) -> Result<reqwest::Client, AppError> {
        reqwest::Client::builder()
            .user_agent(CLIENT_USER_AGENT)
            .timeout(self.timeout)
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))
    }
}
