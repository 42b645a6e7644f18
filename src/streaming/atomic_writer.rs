//! Atomic file output with automatic cleanup on failure.
//!
//! Writes go to a temporary file in the same directory as the destination,
//! which replaces the destination on `commit()`. If dropped before
//! committing, the temporary file is deleted.

use std::fs::File;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::AppError;

/// A temporary file that becomes `final_path` only when committed.
pub struct AtomicFile {
    temp: NamedTempFile,
    final_path: PathBuf,
}

impl AtomicFile {
    /// Creates the temporary file next to `final_path`.
    ///
    /// The temporary file must live on the same filesystem as the
    /// destination for the final rename to be atomic.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Output` if the parent directory cannot be
    /// determined or the temporary file cannot be created.
    pub fn new(final_path: impl AsRef<Path>) -> Result<Self, AppError> {
        let final_path = final_path.as_ref().to_path_buf();

        let parent_dir = match final_path.parent() {
            Some(p) if p.as_os_str().is_empty() => Path::new("."),
            Some(p) => p,
            None => {
                return Err(output_error(
                    &final_path,
                    "cannot determine parent directory".to_string(),
                ))
            }
        };

        let temp = tempfile::Builder::new()
            .prefix(".mot-history-")
            .suffix(".tmp")
            .tempfile_in(parent_dir)
            .map_err(|e| {
                output_error(&final_path, format!("failed to create temporary file: {}", e))
            })?;

        Ok(Self { temp, final_path })
    }

    /// Returns a second handle to the temporary file for encoders that take
    /// ownership of their writer.
    pub fn handle(&self) -> Result<File, AppError> {
        self.temp.as_file().try_clone().map_err(|e| {
            output_error(&self.final_path, format!("failed to clone file handle: {}", e))
        })
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Syncs the temporary file and renames it over the final path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Output` if syncing or persisting fails. On error
    /// the temporary file is removed.
    pub fn commit(self) -> Result<PathBuf, AppError> {
        self.temp
            .as_file()
            .sync_all()
            .map_err(|e| output_error(&self.final_path, format!("failed to sync: {}", e)))?;

        self.temp.persist(&self.final_path).map_err(|e| {
            output_error(&self.final_path, format!("failed to persist: {}", e.error))
        })?;

        Ok(self.final_path)
    }
}

fn output_error(path: &Path, message: String) -> AppError {
    AppError::Output {
        file: path.display().to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_successful_commit() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("output.parquet");

        let file = AtomicFile::new(&final_path).expect("Failed to create file");
        let mut handle = file.handle().expect("Failed to clone handle");
        handle.write_all(b"PAR1").expect("Failed to write");
        drop(handle);

        let result_path = file.commit().expect("Failed to commit");

        assert_eq!(result_path, final_path);
        assert_eq!(fs::read(&final_path).unwrap(), b"PAR1");
    }

    #[test]
    fn test_drop_cleanup() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("output.parquet");

        {
            let file = AtomicFile::new(&final_path).expect("Failed to create file");
            let mut handle = file.handle().expect("Failed to clone handle");
            handle.write_all(b"partial").expect("Failed to write");
            // Dropped here without commit()
        }

        let entries_after: Vec<_> = fs::read_dir(temp_dir.path())
            .expect("Failed to read dir")
            .collect();
        assert!(
            entries_after.is_empty(),
            "Directory should be empty after drop (temp file cleaned up)"
        );
        assert!(!final_path.exists());
    }

    #[test]
    fn test_overwrite_behavior() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("output.parquet");
        fs::write(&final_path, "OLD_CONTENT").expect("Failed to write dummy file");

        let file = AtomicFile::new(&final_path).expect("Failed to create file");
        file.handle().unwrap().write_all(b"NEW").unwrap();

        // Old content stays visible until commit
        assert_eq!(fs::read_to_string(&final_path).unwrap(), "OLD_CONTENT");

        file.commit().expect("Failed to commit");
        assert_eq!(fs::read_to_string(&final_path).unwrap(), "NEW");
    }

    #[test]
    fn test_invalid_parent_directory() {
        #[cfg(unix)]
        {
            let result = AtomicFile::new("/");
            assert!(result.is_err(), "Should fail for path with no parent");
        }

        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing").join("out.parquet");
        assert!(matches!(
            AtomicFile::new(&missing),
            Err(AppError::Output { .. })
        ));
    }
}
