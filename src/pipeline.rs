//! Bulk fetch-and-convert pipeline.
//!
//! Token → manifest → for each descriptor in listing order: download, parse,
//! write Parquet. One bad file never aborts the run; it is recorded in the
//! `RunSummary` and the next file is attempted. Only configuration and
//! authentication problems stop the run early.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{error, info, warn};

use crate::dvsa::bulk::list_bulk_files;
use crate::dvsa::{ApiClient, BulkFileDescriptor, BulkFileKind};
use crate::error::AppError;
use crate::streaming::{
    artifact_path, local_file_name, write_records, Downloader, OutputArtifact, RecordReader,
    DEFAULT_BATCH_SIZE,
};

// ─────────────────────────────────────────────────────────────────────────────
// Options and results
// ─────────────────────────────────────────────────────────────────────────────

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub download_dir: PathBuf,
    pub output_dir: PathBuf,
    pub include_delta: bool,
    /// Only descriptors whose file name matches are processed.
    pub only: Option<Pattern>,
    pub batch_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("data"),
            output_dir: PathBuf::from("data").join("parquet"),
            include_delta: true,
            only: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// A descriptor that could not be converted.
#[derive(Debug)]
pub struct FailedFile {
    pub file: String,
    pub error: AppError,
}

/// Outcome of one pipeline run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub converted: Vec<OutputArtifact>,
    pub failed: Vec<FailedFile>,
    /// File names listed more than once in the manifest.
    pub skipped_duplicates: Vec<String>,
    /// Descriptors excluded by `include_delta` or `only`.
    pub filtered_out: usize,
}

impl RunSummary {
    /// True when every attempted file was converted.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.converted.len() + self.failed.len()
    }

    pub fn total_rows(&self) -> u64 {
        self.converted.iter().map(|a| a.rows).sum()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BulkPipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Downloads every bulk file in the manifest and converts each to Parquet.
pub struct BulkPipeline {
    client: ApiClient,
    downloader: Downloader,
    options: PipelineOptions,
}

impl BulkPipeline {
    pub fn new(client: ApiClient, downloader: Downloader, options: PipelineOptions) -> Self {
        Self {
            client,
            downloader,
            options,
        }
    }

    /// Runs the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error only when the run cannot start (authentication,
    /// manifest listing) or hits a fatal error. Per-file failures are
    /// reported in the returned `RunSummary`.
    pub async fn run(&self) -> Result<RunSummary, AppError> {
        self.client.authenticator().get_token().await?;

        let manifest = list_bulk_files(&self.client).await?;
        let (selected, mut summary) = self.select(manifest.descriptors());

        info!(
            "[BULK] Processing {} files ({} filtered out, {} duplicates)",
            selected.len(),
            summary.filtered_out,
            summary.skipped_duplicates.len()
        );

        for (index, descriptor) in selected.iter().enumerate() {
            info!(
                "[BULK] [{}/{}] {}",
                index + 1,
                selected.len(),
                descriptor.filename
            );

            match self.process(descriptor).await {
                Ok(artifact) => summary.converted.push(artifact),
                Err(e) if e.is_fatal() => {
                    error!("[BULK] {} aborted the run: {}", descriptor.filename, e);
                    return Err(e);
                }
                Err(e) => {
                    error!("[BULK] {} failed: {}", descriptor.filename, e);
                    summary.failed.push(FailedFile {
                        file: descriptor.filename.clone(),
                        error: e,
                    });
                }
            }
        }

        info!(
            "[BULK] Done: {} converted ({} rows), {} failed",
            summary.converted.len(),
            summary.total_rows(),
            summary.failed.len()
        );
        Ok(summary)
    }

    /// Applies filters and drops repeated file names, keeping listing order.
    ///
    /// Distinct names that would share a downloaded file or an artifact are
    /// not processed: the first one wins and later ones are recorded as
    /// `Output` failures.
    fn select<'a>(
        &self,
        descriptors: impl Iterator<Item = &'a BulkFileDescriptor>,
    ) -> (Vec<&'a BulkFileDescriptor>, RunSummary) {
        let mut summary = RunSummary::default();
        let mut seen = HashSet::new();
        let mut local_names: HashMap<String, &str> = HashMap::new();
        let mut artifacts: HashMap<PathBuf, &str> = HashMap::new();
        let mut selected = Vec::new();

        for descriptor in descriptors {
            if descriptor.kind == BulkFileKind::Delta && !self.options.include_delta {
                summary.filtered_out += 1;
                continue;
            }
            if let Some(pattern) = &self.options.only {
                let name = local_file_name(&descriptor.filename)
                    .unwrap_or_else(|_| descriptor.filename.clone());
                if !pattern.matches(&name) {
                    summary.filtered_out += 1;
                    continue;
                }
            }
            if !seen.insert(descriptor.filename.as_str()) {
                warn!(
                    "[BULK] {} listed more than once, skipping duplicate",
                    descriptor.filename
                );
                summary.skipped_duplicates.push(descriptor.filename.clone());
                continue;
            }

            // Unresolvable names fall through and fail in `process`.
            let local = local_file_name(&descriptor.filename).ok();
            let artifact = artifact_path(&self.options.output_dir, &descriptor.filename).ok();
            let clash = local
                .as_ref()
                .and_then(|name| local_names.get(name))
                .or_else(|| artifact.as_ref().and_then(|path| artifacts.get(path)))
                .copied();
            if let Some(first) = clash {
                warn!(
                    "[BULK] {} resolves to the same files as {}, not processed",
                    descriptor.filename, first
                );
                summary.failed.push(FailedFile {
                    file: descriptor.filename.clone(),
                    error: AppError::Output {
                        file: descriptor.filename.clone(),
                        message: format!("local file or artifact name collides with {}", first),
                    },
                });
                continue;
            }
            if let Some(name) = local {
                local_names.insert(name, descriptor.filename.as_str());
            }
            if let Some(path) = artifact {
                artifacts.insert(path, descriptor.filename.as_str());
            }

            selected.push(descriptor);
        }

        (selected, summary)
    }

    async fn process(&self, descriptor: &BulkFileDescriptor) -> Result<OutputArtifact, AppError> {
        let destination = artifact_path(&self.options.output_dir, &descriptor.filename)?;
        let downloaded = self
            .downloader
            .fetch(descriptor, &self.options.download_dir)
            .await?;
        convert_to(downloaded, destination, self.options.batch_size).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversion
// ─────────────────────────────────────────────────────────────────────────────

/// Converts a bulk file already on disk into `<output_dir>/<stem>.parquet`.
pub async fn convert_local(
    input: &Path,
    output_dir: &Path,
    batch_size: usize,
) -> Result<OutputArtifact, AppError> {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let destination = artifact_path(output_dir, &name)?;
    convert_to(input.to_path_buf(), destination, batch_size).await
}

/// Bulk archive name pattern used when `convert` is given no input.
pub const BULK_ARCHIVE_GLOB: &str = "bulk-light-vehicle_*.zip";

/// Finds the most recently modified bulk archive in `data_dir`.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` when the directory holds no archive
/// matching [`BULK_ARCHIVE_GLOB`].
pub fn latest_bulk_archive(data_dir: &Path) -> Result<PathBuf, AppError> {
    let pattern = format!(
        "{}/{}",
        Pattern::escape(&data_dir.to_string_lossy()),
        BULK_ARCHIVE_GLOB
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| AppError::InvalidInput(format!("invalid data directory: {}", e)))?;

    let latest = paths
        .filter_map(Result::ok)
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max();

    match latest {
        Some((_, path)) => {
            info!("[PARSE] Latest bulk archive is {}", path.display());
            Ok(path)
        }
        None => Err(AppError::InvalidInput(format!(
            "no {} found in {}",
            BULK_ARCHIVE_GLOB,
            data_dir.display()
        ))),
    }
}

/// Parses `input` and writes `destination` off the async runtime.
async fn convert_to(
    input: PathBuf,
    destination: PathBuf,
    batch_size: usize,
) -> Result<OutputArtifact, AppError> {
    if let Some(dir) = destination.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AppError::Output {
                file: dir.display().to_string(),
                message: format!("cannot create directory: {}", e),
            })?;
    }

    tokio::task::spawn_blocking(move || {
        let reader = RecordReader::open(&input)?;
        write_records(reader, &destination, batch_size)
    })
    .await
    .map_err(|e| AppError::Internal(format!("Conversion task failed: {}", e)))?
}
