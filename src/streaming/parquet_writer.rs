//! Columnar output: `VehicleMotRecord` rows to Parquet.
//!
//! Rows are buffered up to the batch size, converted to an Arrow
//! `RecordBatch` through the serde bridge of `arrow::json`, and written as one
//! Snappy-compressed row group per batch. The file only appears under its
//! final name once `finish()` succeeds.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use arrow::json::reader::Decoder;
use arrow::json::{LineDelimitedWriter, ReaderBuilder};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info};

use crate::error::AppError;
use crate::records::VehicleMotRecord;
use crate::streaming::atomic_writer::AtomicFile;

/// Default number of rows per row group.
pub const DEFAULT_BATCH_SIZE: usize = 65_536;

/// Offset form of UTC; arrow resolves it without a timezone database.
const UTC_OFFSET: &str = "+00:00";

/// Suffixes stripped from a bulk file name to get the artifact stem.
const DATA_SUFFIXES: &[&str] = &[".zip", ".gz", ".json", ".jsonl", ".ndjson", ".dat"];

// ─────────────────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────────────────

fn defect_fields() -> Fields {
    Fields::from(vec![
        Field::new("text", DataType::Utf8, true),
        Field::new("type", DataType::Utf8, true),
        Field::new("dangerous", DataType::Boolean, true),
    ])
}

/// The fixed column layout of every artifact.
pub fn mot_record_schema() -> SchemaRef {
    let defect_item = Field::new("item", DataType::Struct(defect_fields()), true);

    Arc::new(Schema::new(vec![
        Field::new("registration", DataType::Utf8, false),
        Field::new("make", DataType::Utf8, true),
        Field::new("model", DataType::Utf8, true),
        Field::new("fuel_type", DataType::Utf8, true),
        Field::new("primary_colour", DataType::Utf8, true),
        Field::new("engine_size", DataType::Int32, true),
        Field::new("first_used_date", DataType::Date32, true),
        Field::new("registration_date", DataType::Date32, true),
        Field::new("manufacture_date", DataType::Date32, true),
        Field::new("mot_test_number", DataType::Utf8, true),
        Field::new(
            "completed_date",
            DataType::Timestamp(TimeUnit::Millisecond, Some(UTC_OFFSET.into())),
            false,
        ),
        Field::new("test_result", DataType::Utf8, false),
        Field::new("expiry_date", DataType::Date32, true),
        Field::new("odometer_value", DataType::Int64, true),
        Field::new("odometer_unit", DataType::Utf8, true),
        Field::new("odometer_result_type", DataType::Utf8, true),
        Field::new("data_source", DataType::Utf8, true),
        Field::new("defects", DataType::List(Arc::new(defect_item)), false),
    ]))
}

// ─────────────────────────────────────────────────────────────────────────────
// Artifact naming
// ─────────────────────────────────────────────────────────────────────────────

/// Maps a bulk file name to `<output_dir>/<stem>.parquet`.
///
/// Any directory part of `source_name` is dropped and the data suffixes are
/// stripped from the end, so `bulk-light-vehicle_01-06-2024.json.gz` and
/// `bulk-light-vehicle_01-06-2024.zip` both map to
/// `bulk-light-vehicle_01-06-2024.parquet`.
pub fn artifact_path(output_dir: &Path, source_name: &str) -> Result<PathBuf, AppError> {
    let base = source_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let mut stem = base;
    loop {
        let lower = stem.to_ascii_lowercase();
        match DATA_SUFFIXES.iter().find(|s| lower.ends_with(*s)) {
            Some(suffix) => stem = &stem[..stem.len() - suffix.len()],
            None => break,
        }
    }

    if stem.is_empty() || stem == "." || stem == ".." {
        return Err(AppError::Output {
            file: source_name.to_string(),
            message: "name has no usable stem for an output file".to_string(),
        });
    }

    Ok(output_dir.join(format!("{}.parquet", stem)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer
// ─────────────────────────────────────────────────────────────────────────────

/// Summary of a finished artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub rows: u64,
    pub row_groups: usize,
}

/// Streams records into a Parquet file.
pub struct ColumnarWriter {
    target: AtomicFile,
    writer: ArrowWriter<File>,
    decoder: Decoder,
    buffer: Vec<VehicleMotRecord>,
    batch_size: usize,
    rows: u64,
}

impl ColumnarWriter {
    /// Opens a writer whose output replaces `destination` on `finish()`.
    ///
    /// A `batch_size` of 0 falls back to `DEFAULT_BATCH_SIZE`.
    pub fn create(destination: impl AsRef<Path>, batch_size: usize) -> Result<Self, AppError> {
        let destination = destination.as_ref();
        let batch_size = if batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            batch_size
        };

        let schema = mot_record_schema();
        let target = AtomicFile::new(destination)?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(batch_size)
            .set_created_by(crate::config::CLIENT_USER_AGENT.to_string())
            .build();

        let writer = ArrowWriter::try_new(target.handle()?, schema.clone(), Some(props))
            .map_err(|e| output_error(destination, e))?;

        let decoder = ReaderBuilder::new(schema)
            .with_batch_size(batch_size)
            .build_decoder()
            .map_err(|e| output_error(destination, e))?;

        Ok(Self {
            target,
            writer,
            decoder,
            buffer: Vec::with_capacity(batch_size.min(DEFAULT_BATCH_SIZE)),
            batch_size,
            rows: 0,
        })
    }

    /// Buffers one record, flushing a row group when the batch is full.
    pub fn write(&mut self, record: VehicleMotRecord) -> Result<(), AppError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.batch_size {
            self.flush_batch()?;
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<(), AppError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = self.to_record_batch()?;
        let path = self.target.final_path().to_path_buf();

        self.writer
            .write(&batch)
            .map_err(|e| output_error(&path, e))?;
        self.writer.flush().map_err(|e| output_error(&path, e))?;

        self.rows += batch.num_rows() as u64;
        debug!(
            "[PARQUET] Wrote row group of {} rows to {}",
            batch.num_rows(),
            path.display()
        );
        self.buffer.clear();
        Ok(())
    }

    fn to_record_batch(&mut self) -> Result<RecordBatch, AppError> {
        let path = self.target.final_path().to_path_buf();

        self.decoder
            .serialize(&self.buffer)
            .map_err(|e| output_error(&path, e))?;

        self.decoder
            .flush()
            .map_err(|e| output_error(&path, e))?
            .ok_or_else(|| AppError::Internal("Arrow decoder produced no batch".to_string()))
    }

    /// Writes the remaining rows and the footer, then moves the file into place.
    pub fn finish(mut self) -> Result<OutputArtifact, AppError> {
        self.flush_batch()?;

        let path = self.target.final_path().to_path_buf();
        let metadata = self.writer.close().map_err(|e| output_error(&path, e))?;
        let path = self.target.commit()?;

        let artifact = OutputArtifact {
            path,
            rows: self.rows,
            row_groups: metadata.row_groups.len(),
        };

        info!(
            "[PARQUET] Wrote {} ({} rows, {} row groups)",
            artifact.path.display(),
            artifact.rows,
            artifact.row_groups
        );
        Ok(artifact)
    }
}

/// Writes every record from `records` to `destination`.
///
/// The first error from the iterator aborts the write and no file is left
/// at `destination`.
pub fn write_records<I>(
    records: I,
    destination: impl AsRef<Path>,
    batch_size: usize,
) -> Result<OutputArtifact, AppError>
where
    I: IntoIterator<Item = Result<VehicleMotRecord, AppError>>,
{
    let mut writer = ColumnarWriter::create(destination, batch_size)?;
    for record in records {
        writer.write(record?)?;
    }
    writer.finish()
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

/// Reads an artifact back into records.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<VehicleMotRecord>, AppError> {
    let path = path.as_ref();
    let mut records = Vec::new();

    for batch in read_batches(path)? {
        let mut json = Vec::new();
        {
            let mut writer = LineDelimitedWriter::new(&mut json);
            writer
                .write(&batch)
                .map_err(|e| read_error(path, e.to_string()))?;
            writer.finish().map_err(|e| read_error(path, e.to_string()))?;
        }

        for line in json.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let record = serde_json::from_slice(line).map_err(|e| read_error(path, e.to_string()))?;
            records.push(record);
        }
    }

    Ok(records)
}

/// Row count, row group count and schema of an artifact, without reading rows.
pub fn inspect(path: impl AsRef<Path>) -> Result<(OutputArtifact, SchemaRef), AppError> {
    let path = path.as_ref();
    let builder = open_reader(path)?;
    let metadata = builder.metadata().clone();
    let schema = builder.schema().clone();

    let artifact = OutputArtifact {
        path: path.to_path_buf(),
        rows: metadata.file_metadata().num_rows().max(0) as u64,
        row_groups: metadata.num_row_groups(),
    };
    Ok((artifact, schema))
}

fn open_reader(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>, AppError> {
    let file = File::open(path).map_err(|e| read_error(path, e.to_string()))?;
    ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| read_error(path, e.to_string()))
}

fn read_batches(path: &Path) -> Result<Vec<RecordBatch>, AppError> {
    let reader = open_reader(path)?
        .build()
        .map_err(|e| read_error(path, e.to_string()))?;

    reader
        .map(|batch| batch.map_err(|e| read_error(path, e.to_string())))
        .collect()
}

fn output_error(path: &Path, e: impl std::fmt::Display) -> AppError {
    AppError::Output {
        file: path.display().to_string(),
        message: e.to_string(),
    }
}

fn read_error(path: &Path, message: String) -> AppError {
    AppError::Parse {
        file: path.display().to_string(),
        line: None,
        message,
    }
}
