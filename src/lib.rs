//! MOT history lookups and bulk export to Parquet.
//!
//! The `dvsa` module talks to the MOT History API, `streaming` downloads,
//! parses and writes bulk files, and `pipeline` ties them together.

pub mod commands;
pub mod config;
pub mod dvsa;
pub mod error;
pub mod pipeline;
pub mod records;
pub mod streaming;

pub use error::AppError;
