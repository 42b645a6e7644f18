//! Lazy record reader for bulk files.
//!
//! A bulk file is newline-delimited JSON with one vehicle per line, either
//! plain, gzip-compressed, or packed (possibly gzipped) inside a zip archive.
//! The format is sniffed from the leading bytes, never from the file name.
//!
//! Zip members are extracted one at a time into a private scratch directory
//! and deleted once read, so at most one member is on disk at any moment.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tempfile::TempDir;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::AppError;
use crate::records::{VehicleHistory, VehicleMotRecord};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Zip members with one of these suffixes are read; everything else is skipped.
const MEMBER_SUFFIXES: &[&str] = &[".json.gz", ".json", ".jsonl", ".ndjson"];

/// Bulk archives also carry delta files, which are published and converted
/// on their own.
const DELTA_MEMBER_PREFIX: &str = "delta-";

/// Container format of a bulk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Zip,
    Gzip,
    Ndjson,
}

/// Detects the container format from the first bytes of `path`.
pub fn sniff_format(path: &Path) -> Result<InputFormat, AppError> {
    let mut file = File::open(path).map_err(|e| parse_error(path, None, e))?;
    let mut head = [0u8; 4];
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => return Err(parse_error(path, None, e)),
        }
    }
    Ok(format_of(&head[..filled]))
}

fn format_of(head: &[u8]) -> InputFormat {
    if head.starts_with(ZIP_MAGIC) {
        InputFormat::Zip
    } else if head.starts_with(GZIP_MAGIC) {
        InputFormat::Gzip
    } else {
        InputFormat::Ndjson
    }
}

/// Opens a plain or gzip-compressed NDJSON file as a line reader.
fn open_lines(path: &Path) -> Result<Box<dyn BufRead + Send>, AppError> {
    let format = sniff_format(path)?;
    let file = File::open(path).map_err(|e| parse_error(path, None, e))?;

    Ok(match format {
        InputFormat::Gzip => Box::new(BufReader::new(MultiGzDecoder::new(file))),
        _ => Box::new(BufReader::new(file)),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// RecordReader
// ─────────────────────────────────────────────────────────────────────────────

/// The NDJSON stream currently being read.
struct LineSource {
    label: String,
    reader: Box<dyn BufRead + Send>,
    line: u64,
    /// Extracted zip member, removed when the source is exhausted.
    scratch_file: Option<PathBuf>,
}

impl Drop for LineSource {
    fn drop(&mut self) {
        if let Some(path) = self.scratch_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct ZipMembers {
    archive: ZipArchive<File>,
    pending: VecDeque<usize>,
    scratch: TempDir,
}

/// Iterator over the records of one bulk file.
///
/// Yields every test of every vehicle in file order. The first malformed
/// line ends iteration with an `AppError::Parse` naming the file (and zip
/// member) and the 1-based line number.
pub struct RecordReader {
    label: String,
    current: Option<LineSource>,
    members: Option<ZipMembers>,
    pending: VecDeque<VehicleMotRecord>,
    buf: String,
    vehicles: u64,
    done: bool,
}

impl RecordReader {
    /// Opens `path`, sniffing its format.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Parse` if the file cannot be opened, a zip
    /// archive's directory is unreadable, or the archive holds no data
    /// members.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let label = display_name(path);
        let format = sniff_format(path)?;
        debug!("[PARSE] {} detected as {:?}", label, format);

        let mut reader = Self {
            label: label.clone(),
            current: None,
            members: None,
            pending: VecDeque::new(),
            buf: String::new(),
            vehicles: 0,
            done: false,
        };

        match format {
            InputFormat::Zip => {
                let file = File::open(path).map_err(|e| parse_error(path, None, e))?;
                let archive = ZipArchive::new(file).map_err(|e| parse_error(path, None, e))?;

                let pending: VecDeque<usize> = (0..archive.len())
                    .filter(|&i| {
                        archive
                            .name_for_index(i)
                            .map(is_data_member)
                            .unwrap_or(false)
                    })
                    .collect();
                if pending.is_empty() {
                    return Err(AppError::Parse {
                        file: label,
                        line: None,
                        message: "archive contains no bulk data members".to_string(),
                    });
                }
                info!(
                    "[PARSE] {} contains {} data members",
                    label,
                    pending.len()
                );

                let scratch = tempfile::Builder::new()
                    .prefix("mot-history-")
                    .tempdir()
                    .map_err(|e| parse_error(path, None, e))?;

                reader.members = Some(ZipMembers {
                    archive,
                    pending,
                    scratch,
                });
            }
            InputFormat::Gzip | InputFormat::Ndjson => {
                reader.current = Some(LineSource {
                    label,
                    reader: open_lines(path)?,
                    line: 0,
                    scratch_file: None,
                });
            }
        }

        Ok(reader)
    }

    /// Number of vehicle lines decoded so far.
    pub fn vehicles_read(&self) -> u64 {
        self.vehicles
    }

    /// Extracts the next data member and makes it the current source.
    /// Returns `Ok(false)` when no members remain.
    fn open_next_member(&mut self) -> Result<bool, AppError> {
        let Some(members) = self.members.as_mut() else {
            return Ok(false);
        };
        let Some(index) = members.pending.pop_front() else {
            return Ok(false);
        };

        let mut entry = members.archive.by_index(index).map_err(|e| AppError::Parse {
            file: self.label.clone(),
            line: None,
            message: e.to_string(),
        })?;
        let label = format!("{}:{}", self.label, entry.name());
        let scratch_path = members.scratch.path().join(format!("member-{}", index));

        let extracted = File::create(&scratch_path)
            .and_then(|mut out| std::io::copy(&mut entry, &mut out));
        if let Err(e) = extracted {
            let _ = std::fs::remove_file(&scratch_path);
            return Err(AppError::Parse {
                file: label,
                line: None,
                message: e.to_string(),
            });
        }
        drop(entry);

        debug!("[PARSE] Extracted {}", label);
        let reader = open_lines(&scratch_path).map_err(|e| relabel(e, &label))?;
        self.current = Some(LineSource {
            label,
            reader,
            line: 0,
            scratch_file: Some(scratch_path),
        });
        Ok(true)
    }

    /// Reads lines until one vehicle is decoded, the source ends, or an error.
    fn read_vehicle(&mut self) -> Result<Option<VehicleHistory>, AppError> {
        let Some(source) = self.current.as_mut() else {
            return Ok(None);
        };

        loop {
            self.buf.clear();
            let n = source.reader.read_line(&mut self.buf).map_err(|e| AppError::Parse {
                file: source.label.clone(),
                line: Some(source.line + 1),
                message: e.to_string(),
            })?;
            if n == 0 {
                return Ok(None);
            }
            source.line += 1;

            let text = self.buf.trim();
            if text.is_empty() {
                continue;
            }

            return serde_json::from_str(text)
                .map(Some)
                .map_err(|e| AppError::Parse {
                    file: source.label.clone(),
                    line: Some(source.line),
                    message: e.to_string(),
                });
        }
    }

    fn advance(&mut self) -> Result<bool, AppError> {
        loop {
            match self.read_vehicle()? {
                Some(vehicle) => {
                    self.vehicles += 1;
                    self.pending.extend(vehicle.into_records());
                    return Ok(true);
                }
                None => {
                    self.current = None;
                    if !self.open_next_member()? {
                        return Ok(false);
                    }
                }
            }
        }
    }
}

impl Iterator for RecordReader {
    type Item = Result<VehicleMotRecord, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    self.current = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn is_data_member(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with('/') {
        return false;
    }
    let base = lower.rsplit('/').next().unwrap_or_default();
    !base.starts_with(DELTA_MEMBER_PREFIX) && MEMBER_SUFFIXES.iter().any(|s| base.ends_with(s))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn parse_error(path: &Path, line: Option<u64>, e: impl std::fmt::Display) -> AppError {
    AppError::Parse {
        file: display_name(path),
        line,
        message: e.to_string(),
    }
}

fn relabel(err: AppError, label: &str) -> AppError {
    match err {
        AppError::Parse { line, message, .. } => AppError::Parse {
            file: label.to_string(),
            line,
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn vehicle_line(registration: &str, tests: usize) -> String {
        let tests: Vec<_> = (0..tests)
            .map(|i| {
                serde_json::json!({
                    "completedDate": format!("2023-0{}-15T10:00:00.000Z", i + 1),
                    "testResult": "PASSED",
                    "odometerValue": format!("{}", 1000 * (i + 1)),
                    "odometerUnit": "KM",
                    "motTestNumber": format!("{}-{}", registration, i),
                })
            })
            .collect();
        serde_json::json!({
            "registration": registration,
            "make": "TOYOTA",
            "motTests": tests,
        })
        .to_string()
    }

    fn ndjson(lines: &[String]) -> Vec<u8> {
        let mut out = lines.join("\n");
        out.push('\n');
        out.into_bytes()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn zip_file(path: &Path, members: &[(&str, Vec<u8>)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in members {
            if name.ends_with('/') {
                writer
                    .add_directory(*name, SimpleFileOptions::default())
                    .unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(data).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    fn registrations(reader: RecordReader) -> Vec<String> {
        reader.map(|r| r.unwrap().registration).collect()
    }

    #[test]
    fn sniffs_formats_by_content() {
        assert_eq!(format_of(b"PK\x03\x04rest"), InputFormat::Zip);
        assert_eq!(format_of(&[0x1f, 0x8b, 8, 0]), InputFormat::Gzip);
        assert_eq!(format_of(b"{\"re"), InputFormat::Ndjson);
        assert_eq!(format_of(b""), InputFormat::Ndjson);
    }

    #[test]
    fn reads_plain_ndjson_skipping_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("2024-01.dat");
        let mut body = ndjson(&[vehicle_line("A1", 2), String::new(), vehicle_line("B2", 1)]);
        body.extend_from_slice(b"\n   \n");
        std::fs::write(&path, body).unwrap();

        let reader = RecordReader::open(&path).unwrap();
        assert_eq!(registrations(reader), vec!["A1", "A1", "B2"]);
    }

    #[test]
    fn reads_gzip_regardless_of_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("misleading.json");
        std::fs::write(&path, gzip(&ndjson(&[vehicle_line("G1", 3)]))).unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let records: Vec<_> = reader.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].odometer_value, Some(3000));
        assert_eq!(reader.vehicles_read(), 1);
    }

    #[test]
    fn reads_zip_members_in_order_and_skips_others() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bulk.zip");
        zip_file(
            &path,
            &[
                ("README.txt", b"not data".to_vec()),
                ("part/", Vec::new()),
                ("part/one.json.gz", gzip(&ndjson(&[vehicle_line("Z1", 1)]))),
                ("part/two.json", ndjson(&[vehicle_line("Z2", 2)])),
            ],
        );

        let reader = RecordReader::open(&path).unwrap();
        assert_eq!(registrations(reader), vec!["Z1", "Z2", "Z2"]);
    }

    #[test]
    fn zip_skips_delta_members() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bulk-light-vehicle_01-06-2024.zip");
        zip_file(
            &path,
            &[
                (
                    "bulk-light-vehicle_01-06-2024_1.json.gz",
                    gzip(&ndjson(&[vehicle_line("BULK1", 1)])),
                ),
                (
                    "delta-light-vehicle_02-06-2024_1.json.gz",
                    gzip(&ndjson(&[vehicle_line("DELTA1", 1)])),
                ),
                (
                    "nested/Delta-light-vehicle_03-06-2024_1.json",
                    ndjson(&[vehicle_line("DELTA2", 1)]),
                ),
            ],
        );

        assert!(!is_data_member("nested/delta-x.json.gz"));
        assert!(is_data_member("nested/bulk-x.json.gz"));

        let reader = RecordReader::open(&path).unwrap();
        assert_eq!(registrations(reader), vec!["BULK1"]);
    }

    #[test]
    fn zip_without_data_members_fails_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.zip");
        zip_file(
            &path,
            &[
                ("README.txt", b"not data".to_vec()),
                ("delta-light-vehicle_02-06-2024_1.json.gz", gzip(&ndjson(&[vehicle_line("D", 1)]))),
            ],
        );

        match RecordReader::open(&path) {
            Err(AppError::Parse { file, line, message }) => {
                assert_eq!(file, "empty.zip");
                assert_eq!(line, None);
                assert!(message.contains("no bulk data members"));
            }
            Err(other) => panic!("Expected Parse, got {:?}", other),
            Ok(_) => panic!("Expected Parse error for archive without data"),
        }
    }

    #[test]
    fn extracted_members_are_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bulk.zip");
        zip_file(
            &path,
            &[
                ("a.json", ndjson(&[vehicle_line("A", 1)])),
                ("b.json", ndjson(&[vehicle_line("B", 1)])),
            ],
        );

        let mut reader = RecordReader::open(&path).unwrap();
        let scratch = reader.members.as_ref().unwrap().scratch.path().to_path_buf();

        assert!(reader.next().unwrap().is_ok());
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 1);
        assert!(reader.next().unwrap().is_ok());
        assert!(reader.next().is_none());
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);

        drop(reader);
        assert!(!scratch.exists());
    }

    #[test]
    fn malformed_line_names_file_and_line_and_stops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.dat");
        let body = ndjson(&[
            vehicle_line("OK1", 1),
            "{\"registration\": ".to_string(),
            vehicle_line("NEVER", 1),
        ]);
        std::fs::write(&path, body).unwrap();

        let results: Vec<_> = RecordReader::open(&path).unwrap().collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(AppError::Parse { file, line, .. }) => {
                assert_eq!(file, "broken.dat");
                assert_eq!(*line, Some(2));
            }
            other => panic!("Expected Parse, got {:?}", other),
        }
    }

    #[test]
    fn schema_mismatch_in_zip_member_names_member() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bulk.zip");
        zip_file(
            &path,
            &[(
                "data.jsonl",
                ndjson(&["{\"make\": \"FORD\"}".to_string()]),
            )],
        );

        let err = RecordReader::open(&path)
            .unwrap()
            .find_map(Result::err)
            .unwrap();
        match err {
            AppError::Parse { file, line, message } => {
                assert_eq!(file, "bulk.zip:data.jsonl");
                assert_eq!(line, Some(1));
                assert!(message.contains("registration"));
            }
            other => panic!("Expected Parse, got {:?}", other),
        }
    }

    #[test]
    fn truncated_gzip_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.json.gz");
        let full = gzip(&ndjson(&[vehicle_line("T1", 1), vehicle_line("T2", 1)]));
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();

        let results: Vec<_> = RecordReader::open(&path).unwrap().collect();
        assert!(matches!(
            results.last(),
            Some(Err(AppError::Parse { .. }))
        ));
    }

    #[test]
    fn corrupt_zip_fails_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.zip");
        std::fs::write(&path, b"PK\x03\x04garbage").unwrap();

        assert!(matches!(
            RecordReader::open(&path),
            Err(AppError::Parse { line: None, .. })
        ));
    }

    #[test]
    fn missing_file_fails_on_open() {
        let dir = TempDir::new().unwrap();
        assert!(RecordReader::open(dir.path().join("absent.dat")).is_err());
    }
}
