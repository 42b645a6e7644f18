//! DVSA MOT History API access layer.
//!
//! - **Client-credentials OAuth** with an in-memory, single-flight token cache
//! - **Safe logging** that never leaks tokens, API keys or pre-signed URLs
//! - **Typed responses** for vehicle lookups and the bulk download manifest

pub mod auth;
pub mod bulk;
pub mod client;
pub mod lookup;

pub use auth::{AccessToken, Authenticator};
pub use bulk::{BulkFileDescriptor, BulkFileKind, BulkManifest};
pub use client::{sanitize_url_for_logs, ApiClient, LoggingMode};
pub use lookup::VehicleLookup;

/// Path of the single-vehicle lookup by registration mark.
pub const REGISTRATION_PATH: &str = "/v1/trade/vehicles/registration";

/// Path of the single-vehicle lookup by VIN.
pub const VIN_PATH: &str = "/v1/trade/vehicles/vin";

/// Path of the bulk download manifest.
pub const BULK_DOWNLOAD_PATH: &str = "/v1/trade/vehicles/bulk-download";
