//! Streaming file handling for bulk data.
//!
//! This module covers resumable downloads of large bulk files, lazy record
//! parsing of zip/gzip/NDJSON inputs, and Parquet output written atomically
//! with automatic cleanup on failure.

mod atomic_writer;
pub mod downloader;
pub mod parquet_writer;
pub mod parser;

pub use atomic_writer::AtomicFile;
pub use downloader::{local_file_name, Downloader};
pub use parquet_writer::{
    artifact_path, mot_record_schema, read_records, write_records, ColumnarWriter,
    OutputArtifact, DEFAULT_BATCH_SIZE,
};
pub use parser::{sniff_format, InputFormat, RecordReader};
