//! Single-vehicle MOT history lookups by registration mark or VIN.

use tracing::info;

use crate::dvsa::client::ApiClient;
use crate::dvsa::{REGISTRATION_PATH, VIN_PATH};
use crate::error::AppError;
use crate::records::{VehicleHistory, VehicleMotRecord};

/// Longest identifier accepted (VINs are 17 characters; older ones can be shorter).
const MAX_IDENTIFIER_LEN: usize = 20;

/// Looks up the MOT history of one vehicle.
#[derive(Clone)]
pub struct VehicleLookup {
    client: ApiClient,
}

impl VehicleLookup {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Fetches the history for a registration mark (e.g. `"AB12 CDE"`).
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidInput` - the registration is empty or not alphanumeric
    /// - `AppError::Api` - the API answered with a non-success status
    pub async fn by_registration(&self, vrm: &str) -> Result<VehicleHistory, AppError> {
        let vrm = normalize_identifier("registration", vrm)?;
        info!("[DVSA] Looking up vehicle by registration");
        self.client
            .get_json(&format!("{}/{}", REGISTRATION_PATH, vrm))
            .await
    }

    /// Fetches the history for a vehicle identification number.
    pub async fn by_vin(&self, vin: &str) -> Result<VehicleHistory, AppError> {
        let vin = normalize_identifier("VIN", vin)?;
        info!("[DVSA] Looking up vehicle by VIN");
        self.client.get_json(&format!("{}/{}", VIN_PATH, vin)).await
    }

    /// Registration lookup flattened to records, in the order the API returned them.
    pub async fn records_by_registration(
        &self,
        vrm: &str,
    ) -> Result<Vec<VehicleMotRecord>, AppError> {
        Ok(self.by_registration(vrm).await?.into_records())
    }

    /// VIN lookup flattened to records, in the order the API returned them.
    pub async fn records_by_vin(&self, vin: &str) -> Result<Vec<VehicleMotRecord>, AppError> {
        Ok(self.by_vin(vin).await?.into_records())
    }
}

/// Strips spaces and upper-cases an identifier, rejecting anything that would
/// need escaping in a URL path.
fn normalize_identifier(kind: &str, raw: &str) -> Result<String, AppError> {
    let normalized: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.is_empty() {
        return Err(AppError::InvalidInput(format!("{} must not be empty", kind)));
    }
    if normalized.len() > MAX_IDENTIFIER_LEN {
        return Err(AppError::InvalidInput(format!(
            "{} must be at most {} characters",
            kind, MAX_IDENTIFIER_LEN
        )));
    }
    if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::InvalidInput(format!(
            "{} may only contain letters and digits",
            kind
        )));
    }

    Ok(normalized)
}
