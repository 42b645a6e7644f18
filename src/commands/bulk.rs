//! Bulk data commands: `bulk-urls`, `download`, `convert` and `inspect`.

use std::io::Write;
use std::path::Path;

use crate::commands::{stdout_error, write_json};
use crate::dvsa::bulk::list_bulk_files;
use crate::dvsa::ApiClient;
use crate::error::AppError;
use crate::pipeline::{convert_local, BulkPipeline, RunSummary};
use crate::streaming::parquet_writer::inspect;
use crate::streaming::OutputArtifact;

/// Prints the bulk download manifest as JSON.
pub async fn print_bulk_urls(client: &ApiClient, out: &mut dyn Write) -> Result<(), AppError> {
    let manifest = list_bulk_files(client).await?;
    write_json(out, &manifest)
}

/// Runs the bulk pipeline and prints its summary.
///
/// Returns the summary so the caller can pick the exit code.
pub async fn download(
    pipeline: &BulkPipeline,
    out: &mut dyn Write,
) -> Result<RunSummary, AppError> {
    let summary = pipeline.run().await?;
    write_summary(&summary, out)?;
    Ok(summary)
}

/// Converts a local bulk file and prints the artifact written.
pub async fn convert(
    input: &Path,
    output_dir: &Path,
    batch_size: usize,
    out: &mut dyn Write,
) -> Result<OutputArtifact, AppError> {
    let artifact = convert_local(input, output_dir, batch_size).await?;
    write_artifact(&artifact, out)?;
    Ok(artifact)
}

/// Prints row count, row groups and schema of an artifact.
pub fn print_inspection(path: &Path, out: &mut dyn Write) -> Result<(), AppError> {
    let (artifact, schema) = inspect(path)?;
    write_artifact(&artifact, out)?;

    for field in schema.fields() {
        writeln!(
            out,
            "  {:<22} {}{}",
            field.name(),
            field.data_type(),
            if field.is_nullable() { "" } else { " not null" }
        )
        .map_err(|e| stdout_error(e.to_string()))?;
    }
    Ok(())
}

fn write_artifact(artifact: &OutputArtifact, out: &mut dyn Write) -> Result<(), AppError> {
    writeln!(
        out,
        "{}: {} rows in {} row groups",
        artifact.path.display(),
        artifact.rows,
        artifact.row_groups
    )
    .map_err(|e| stdout_error(e.to_string()))
}

/// Human-readable end-of-run report.
pub fn write_summary(summary: &RunSummary, out: &mut dyn Write) -> Result<(), AppError> {
    let io = |e: std::io::Error| stdout_error(e.to_string());

    for artifact in &summary.converted {
        write_artifact(artifact, out)?;
    }
    for name in &summary.skipped_duplicates {
        writeln!(out, "skipped duplicate: {}", name).map_err(io)?;
    }
    for failed in &summary.failed {
        let presentation = failed.error.to_presentation();
        writeln!(out, "FAILED {}: {}", failed.file, presentation.message).map_err(io)?;
    }

    writeln!(
        out,
        "{} converted ({} rows), {} failed, {} skipped",
        summary.converted.len(),
        summary.total_rows(),
        summary.failed.len(),
        summary.skipped_duplicates.len() + summary.filtered_out
    )
    .map_err(io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::FailedFile;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn summary_lists_failures_with_file_names() {
        let summary = RunSummary {
            converted: vec![OutputArtifact {
                path: PathBuf::from("out/2024-01.parquet"),
                rows: 3,
                row_groups: 1,
            }],
            failed: vec![FailedFile {
                file: "2024-02.dat".into(),
                error: AppError::Download {
                    file: "2024-02.dat".into(),
                    message: "HTTP 500".into(),
                },
            }],
            skipped_duplicates: vec![],
            filtered_out: 0,
        };

        let mut out = Vec::new();
        write_summary(&summary, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("2024-01.parquet: 3 rows"));
        assert!(text.contains("FAILED 2024-02.dat"));
        assert!(text.contains("1 converted (3 rows), 1 failed"));
    }

    #[tokio::test]
    async fn convert_then_inspect() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("sample.ndjson");
        std::fs::write(
            &input,
            r#"{"registration":"AB12CDE","motTests":[{"completedDate":"2024-01-01T10:00:00Z","testResult":"PASSED"}]}"#,
        )
        .unwrap();

        let mut out = Vec::new();
        let artifact = convert(&input, dir.path(), 0, &mut out).await.unwrap();
        assert_eq!(artifact.rows, 1);

        let mut out = Vec::new();
        print_inspection(&artifact.path, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("1 rows in 1 row groups"));
        assert!(text.contains("registration"));
        assert!(text.contains("not null"));
        assert!(text.contains("defects"));
    }
}
