//! Resumable bulk file downloads.
//!
//! Bodies are streamed chunk by chunk to `<name>.part` and renamed to the
//! final name once complete. An interrupted `.part` is resumed with a
//! `Range` request on the next attempt, so a retry never starts over unless
//! the server ignores the range.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::HttpSettings;
use crate::dvsa::{sanitize_url_for_logs, BulkFileDescriptor, LoggingMode};
use crate::error::AppError;

/// Suffix of in-progress downloads.
pub const PART_SUFFIX: &str = ".part";

/// Returns the bare file name a descriptor is stored under.
///
/// Directory components are dropped so a manifest entry cannot escape the
/// download directory.
pub fn local_file_name(descriptor_name: &str) -> Result<String, AppError> {
    let base = descriptor_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        return Err(AppError::Download {
            file: descriptor_name.to_string(),
            message: "file name is not usable on disk".to_string(),
        });
    }
    Ok(base.to_string())
}

/// Outcome of one transfer attempt.
struct AttemptError {
    error: AppError,
    retryable: bool,
}

impl AttemptError {
    fn fatal(error: AppError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }

    fn transient(error: AppError) -> Self {
        Self {
            error,
            retryable: true,
        }
    }
}

/// Downloads bulk files to a local directory.
pub struct Downloader {
    http: reqwest::Client,
    settings: HttpSettings,
    logging_mode: LoggingMode,
    show_progress: bool,
}

impl Downloader {
    pub fn new(settings: &HttpSettings) -> Result<Self, AppError> {
        Ok(Self::with_client(settings.build_client()?, settings))
    }

    pub fn with_client(http: reqwest::Client, settings: &HttpSettings) -> Self {
        Self {
            http,
            settings: settings.clone(),
            logging_mode: LoggingMode::default(),
            show_progress: false,
        }
    }

    /// Draws a progress bar on stderr while transferring.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn with_logging_mode(mut self, mode: LoggingMode) -> Self {
        self.logging_mode = mode;
        self
    }

    /// Downloads `descriptor` into `destination_dir` and returns the final path.
    ///
    /// An existing complete file is reused without a request. Pre-signed
    /// URLs carry their own authorization, so no token is sent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Download` naming the file when the transfer fails
    /// after all retries, the server answers with a non-retryable status, or
    /// the finished size does not match the manifest.
    pub async fn fetch(
        &self,
        descriptor: &BulkFileDescriptor,
        destination_dir: &Path,
    ) -> Result<PathBuf, AppError> {
        let name = local_file_name(&descriptor.filename)?;
        let url = Url::parse(&descriptor.download_url).map_err(|e| AppError::Download {
            file: name.clone(),
            message: format!("invalid download URL: {}", e),
        })?;

        fs::create_dir_all(destination_dir)
            .await
            .map_err(|e| download_error(&name, format!("cannot create directory: {}", e)))?;

        let final_path = destination_dir.join(&name);
        let part_path = destination_dir.join(format!("{}{}", name, PART_SUFFIX));

        if let Ok(meta) = fs::metadata(&final_path).await {
            if meta.is_file() && descriptor.file_size.map_or(true, |size| size == meta.len()) {
                info!("[DOWNLOAD] {} already present, skipping", name);
                return Ok(final_path);
            }
            warn!(
                "[DOWNLOAD] {} exists with {} bytes, expected {:?}; downloading again",
                name,
                meta.len(),
                descriptor.file_size
            );
        }

        let mut attempt = 0u32;
        loop {
            match self.attempt(&name, &url, &part_path, descriptor.file_size).await {
                Ok(()) => break,
                Err(failure) if failure.retryable && attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = self.settings.backoff_for(attempt);
                    warn!(
                        "[DOWNLOAD] {} attempt {} failed ({}); retrying in {}ms",
                        name,
                        attempt,
                        failure.error,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => return Err(failure.error),
            }
        }

        let written = fs::metadata(&part_path)
            .await
            .map_err(|e| download_error(&name, format!("cannot stat partial file: {}", e)))?
            .len();

        if let Some(expected) = descriptor.file_size {
            if written != expected {
                let _ = fs::remove_file(&part_path).await;
                return Err(download_error(
                    &name,
                    format!("size mismatch: expected {} bytes, got {}", expected, written),
                ));
            }
        }

        fs::rename(&part_path, &final_path)
            .await
            .map_err(|e| download_error(&name, format!("cannot move into place: {}", e)))?;

        info!("[DOWNLOAD] {} complete ({} bytes)", name, written);
        Ok(final_path)
    }

    /// One request, resuming from whatever `.part` already holds.
    async fn attempt(
        &self,
        name: &str,
        url: &Url,
        part_path: &Path,
        expected_size: Option<u64>,
    ) -> Result<(), AttemptError> {
        let offset = fs::metadata(part_path).await.map(|m| m.len()).unwrap_or(0);
        let sanitized = sanitize_url_for_logs(url, self.logging_mode);

        if expected_size.is_some_and(|size| offset == size && size > 0) {
            debug!("[DOWNLOAD] {} partial file already complete", name);
            return Ok(());
        }

        let mut request = self.http.get(url.as_str());
        if offset > 0 {
            debug!("[DOWNLOAD] Resuming {} from byte {}", name, offset);
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await.map_err(|e| {
            let reason = if e.is_timeout() { "timed out" } else { "connection failed" };
            AttemptError::transient(download_error(
                name,
                format!("GET {} {}", sanitized, reason),
            ))
        })?;

        let status = response.status();
        info!("[DOWNLOAD] GET {} {}", sanitized, status.as_u16());

        let append = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => true,
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                // The partial file is at least as long as the resource; start over.
                let _ = fs::remove_file(part_path).await;
                return Err(AttemptError::transient(download_error(
                    name,
                    "server rejected the resume range".to_string(),
                )));
            }
            s if s.is_success() => false,
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                return Err(AttemptError::transient(download_error(
                    name,
                    format!("HTTP {}", s.as_u16()),
                )))
            }
            s => {
                return Err(AttemptError::fatal(download_error(
                    name,
                    format!("HTTP {}", s.as_u16()),
                )))
            }
        };

        let opened = if append {
            OpenOptions::new().append(true).open(part_path).await
        } else {
            if offset > 0 {
                debug!("[DOWNLOAD] Server ignored range for {}, restarting", name);
            }
            fs::File::create(part_path).await
        };
        let mut file = opened.map_err(|e| {
            AttemptError::fatal(download_error(name, format!("cannot open file: {}", e)))
        })?;

        let start = if append { offset } else { 0 };
        let total = expected_size.or_else(|| {
            response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|len| len + start)
        });
        let progress = self.progress_bar(name, total, start);

        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|_| {
                AttemptError::transient(download_error(
                    name,
                    "connection dropped mid-transfer".to_string(),
                ))
            })?;
            file.write_all(&chunk).await.map_err(|e| {
                AttemptError::fatal(download_error(name, format!("write failed: {}", e)))
            })?;
            progress.inc(chunk.len() as u64);
        }

        file.flush()
            .await
            .map_err(|e| AttemptError::fatal(download_error(name, format!("flush failed: {}", e))))?;
        progress.finish_and_clear();
        Ok(())
    }

    fn progress_bar(&self, name: &str, total: Option<u64>, start: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_message(name.to_string());
        pb.set_position(start);
        pb
    }
}

fn download_error(file: &str, message: String) -> AppError {
    AppError::Download {
        file: file.to_string(),
        message,
    }
}
