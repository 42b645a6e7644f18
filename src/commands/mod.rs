//! CLI command handlers.
//!
//! Each handler takes its collaborators explicitly and writes its result to
//! the supplied writer, so `main` only parses flags and maps the outcome to
//! an exit code.

pub mod bulk;
pub mod lookup;

use std::io::Write;

use serde::Serialize;

use crate::error::AppError;

/// Writes `value` as pretty JSON followed by a newline.
pub(crate) fn write_json<T: Serialize>(out: &mut dyn Write, value: &T) -> Result<(), AppError> {
    serde_json::to_writer_pretty(&mut *out, value)
        .map_err(|e| stdout_error(e.to_string()))?;
    writeln!(out).map_err(|e| stdout_error(e.to_string()))
}

pub(crate) fn stdout_error(message: String) -> AppError {
    AppError::Output {
        file: "stdout".to_string(),
        message,
    }
}
