use thiserror::Error;

/// Lowercase fragments that mark a message as unsafe to print.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "bearer ",
    "access_token",
    "client_secret",
    "x-api-key",
    "authorization:",
    "x-amz-signature",
];

/// Maximum number of characters of an API error body kept in messages.
const MAX_BODY_CHARS: usize = 300;

fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|fragment| lower.contains(fragment))
}

/// Sanitizes a message for display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// Shortens an API error body so one bad response cannot flood the terminal.
fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_BODY_CHARS {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(MAX_BODY_CHARS).collect();
        format!("{}...", head)
    }
}

/// User-friendly error presentation for the terminal.
#[derive(Debug, Clone)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Configuration ─────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ── Auth ──────────────────────────────────────────────────────────────────
    #[error("Authentication failed: {0}")]
    Authentication(String),

    // ── API ───────────────────────────────────────────────────────────────────
    #[error("API request failed with HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    // ── Bulk files ────────────────────────────────────────────────────────────
    #[error("Download of {file} failed: {message}")]
    Download { file: String, message: String },

    #[error("{}", format_parse_error(file, *line, message))]
    Parse {
        file: String,
        line: Option<u64>,
        message: String,
    },

    #[error("Writing {file} failed: {message}")]
    Output { file: String, message: String },

    // ── Network ───────────────────────────────────────────────────────────────
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

fn format_parse_error(file: &str, line: Option<u64>, message: &str) -> String {
    match line {
        Some(line) => format!("Parsing {} failed at line {}: {}", file, line, message),
        None => format!("Parsing {} failed: {}", file, message),
    }
}

impl AppError {
    /// Builds an `Api` error, trimming the body to a displayable size.
    pub fn api(status: u16, body: &str) -> Self {
        AppError::Api {
            status,
            body: truncate_body(body),
        }
    }

    /// Returns true for errors that abort a bulk run instead of failing one file.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Config(_) | AppError::Authentication(_) | AppError::Internal(_)
        )
    }

    /// Converts the error into a user-friendly presentation suitable for the terminal.
    /// Never leaks secrets, tokens, or pre-signed URL parameters.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            // ── Configuration ─────────────────────────────────────────────────
            AppError::Config(msg) => ErrorPresentation {
                title: "Missing Configuration".into(),
                message: sanitize_message(msg, "The API configuration is incomplete."),
                action: Some(
                    "Set the DVSA_* variables in the environment or in a .env file".into(),
                ),
            },

            AppError::InvalidInput(msg) => ErrorPresentation {
                title: "Invalid Input".into(),
                message: msg.clone(),
                action: None,
            },

            // ── Auth ──────────────────────────────────────────────────────────
            AppError::Authentication(msg) => ErrorPresentation {
                title: "Authentication Failed".into(),
                message: sanitize_message(
                    msg,
                    "The token endpoint did not accept the configured credentials.",
                ),
                action: Some("Check the client credentials and the token URL".into()),
            },

            // ── API ───────────────────────────────────────────────────────────
            AppError::Api { status, body } => {
                let detail = sanitize_message(body, "No further details.");
                let message = if *status == 404 {
                    format!("No matching record was found (HTTP 404). {}", detail)
                } else {
                    format!("The MOT History API returned HTTP {}. {}", status, detail)
                };
                ErrorPresentation {
                    title: "API Error".into(),
                    message,
                    action: match status {
                        401 | 403 => Some("Check DVSA_API_KEY and DVSA_SCOPE_URL".into()),
                        500..=599 => Some("Wait and retry".into()),
                        _ => None,
                    },
                }
            }

            AppError::RateLimited { retry_after_secs } => {
                let wait_msg = match retry_after_secs {
                    Some(secs) => format!("Retry after {} seconds.", secs),
                    None => "Retry shortly.".into(),
                };
                ErrorPresentation {
                    title: "Rate Limited".into(),
                    message: format!("The MOT History API is limiting requests. {}", wait_msg),
                    action: Some("Wait, then run the command again".into()),
                }
            }

            // ── Bulk files ────────────────────────────────────────────────────
            AppError::Download { file, message } => ErrorPresentation {
                title: "Download Failed".into(),
                message: format!(
                    "{}: {}",
                    file,
                    sanitize_message(message, "the transfer did not complete.")
                ),
                action: Some("Run the download again to resume".into()),
            },

            AppError::Parse { file, line, message } => ErrorPresentation {
                title: "Invalid Bulk Data".into(),
                message: format_parse_error(
                    file,
                    *line,
                    &sanitize_message(message, "malformed record"),
                ),
                action: Some("Delete the downloaded file and download it again".into()),
            },

            AppError::Output { file, message } => ErrorPresentation {
                title: "Write Failed".into(),
                message: format!("{}: {}", file, message),
                action: Some("Check free disk space and directory permissions".into()),
            },

            // ── Network ───────────────────────────────────────────────────────
            AppError::ConnectionFailed(_) => ErrorPresentation {
                title: "Network Error".into(),
                message: "Could not connect to the MOT History API. Please check your internet connection.".into(),
                action: Some("Check the connection and DVSA_API_URL".into()),
            },

            // ── Generic ───────────────────────────────────────────────────────
            AppError::Internal(_) => ErrorPresentation {
                title: "Internal Error".into(),
                message: "Something went wrong. Run again with -v for details.".into(),
                action: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<AppError> {
        vec![
            AppError::Config("DVSA_API_KEY is not set".into()),
            AppError::InvalidInput("registration must be alphanumeric".into()),
            AppError::Authentication("token endpoint returned HTTP 401".into()),
            AppError::api(500, "internal error"),
            AppError::api(404, ""),
            AppError::RateLimited { retry_after_secs: Some(30) },
            AppError::RateLimited { retry_after_secs: None },
            AppError::Download {
                file: "2024-02.dat".into(),
                message: "HTTP 500".into(),
            },
            AppError::Parse {
                file: "2024-01.dat".into(),
                line: Some(7),
                message: "expected value".into(),
            },
            AppError::Output {
                file: "2024-01.parquet".into(),
                message: "disk full".into(),
            },
            AppError::ConnectionFailed("request timed out".into()),
            AppError::Internal("join error".into()),
        ]
    }

    #[test]
    fn all_variants_have_nonempty_title_and_message() {
        for variant in all_variants() {
            let presentation = variant.to_presentation();
            assert!(
                !presentation.title.trim().is_empty(),
                "Empty title for {:?}",
                variant
            );
            assert!(
                !presentation.message.trim().is_empty(),
                "Empty message for {:?}",
                variant
            );
        }
    }

    #[test]
    fn file_errors_name_the_file() {
        for variant in all_variants() {
            let file = match &variant {
                AppError::Download { file, .. }
                | AppError::Parse { file, .. }
                | AppError::Output { file, .. } => file.clone(),
                _ => continue,
            };
            assert!(variant.to_string().contains(&file));
            assert!(variant.to_presentation().message.contains(&file));
        }
    }

    #[test]
    fn parse_error_display_includes_line() {
        let err = AppError::Parse {
            file: "bulk.json.gz".into(),
            line: Some(42),
            message: "missing field `registration`".into(),
        };
        assert_eq!(
            err.to_string(),
            "Parsing bulk.json.gz failed at line 42: missing field `registration`"
        );

        let err = AppError::Parse {
            file: "bulk.zip".into(),
            line: None,
            message: "invalid archive".into(),
        };
        assert_eq!(err.to_string(), "Parsing bulk.zip failed: invalid archive");
    }

    #[test]
    fn api_error_body_is_truncated() {
        let body = "x".repeat(5_000);
        match AppError::api(502, &body) {
            AppError::Api { status, body } => {
                assert_eq!(status, 502);
                assert!(body.len() < 400);
                assert!(body.ends_with("..."));
            }
            other => panic!("Expected Api, got {:?}", other),
        }
    }

    #[test]
    fn fatal_classification() {
        assert!(AppError::Authentication("bad".into()).is_fatal());
        assert!(AppError::Config("missing".into()).is_fatal());
        assert!(!AppError::api(500, "").is_fatal());
        assert!(!AppError::Download {
            file: "a".into(),
            message: "b".into()
        }
        .is_fatal());
        assert!(!AppError::Parse {
            file: "a".into(),
            line: None,
            message: "b".into()
        }
        .is_fatal());
    }

    #[test]
    fn rate_limited_suggests_wait_retry() {
        let presentation = AppError::RateLimited { retry_after_secs: Some(30) }.to_presentation();
        let action = presentation.action.expect("RateLimited should have action");
        assert!(action.to_lowercase().contains("wait"));
        assert!(
            presentation.message.contains("30"),
            "RateLimited message should mention retry_after_secs"
        );
    }

    #[test]
    fn no_secret_leakage_in_presentation() {
        let test_cases: Vec<(&str, AppError)> = vec![
            ("Authentication", AppError::Authentication("client_secret=abc rejected".into())),
            ("Api", AppError::api(401, "Authorization: Bearer abc123")),
            (
                "Download",
                AppError::Download {
                    file: "bulk.zip".into(),
                    message: "GET ?X-Amz-Signature=deadbeef failed".into(),
                },
            ),
            ("Config", AppError::Config("x-api-key leaked".into())),
            ("ConnectionFailed", AppError::ConnectionFailed("access_token=xyz".into())),
        ];

        for (label, variant) in test_cases {
            let presentation = variant.to_presentation();
            let output_lower = format!(
                "{} {} {}",
                presentation.title,
                presentation.message,
                presentation.action.as_deref().unwrap_or("")
            )
            .to_ascii_lowercase();

            for pattern in SENSITIVE_PATTERNS {
                assert!(
                    !output_lower.contains(pattern),
                    "{} presentation contains sensitive pattern",
                    label
                );
            }
        }
    }
}
