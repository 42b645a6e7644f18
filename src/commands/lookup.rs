//! `vrm` and `vin` commands.

use std::io::Write;

use tracing::info;

use crate::commands::write_json;
use crate::dvsa::{ApiClient, VehicleLookup};
use crate::error::AppError;

/// Which identifier a lookup uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VehicleQuery {
    Registration(String),
    Vin(String),
}

/// Looks up one vehicle and prints its MOT records as a JSON array.
///
/// Returns the number of records printed.
pub async fn lookup_vehicle(
    client: &ApiClient,
    query: &VehicleQuery,
    out: &mut dyn Write,
) -> Result<usize, AppError> {
    let lookup = VehicleLookup::new(client.clone());

    let records = match query {
        VehicleQuery::Registration(vrm) => lookup.records_by_registration(vrm).await?,
        VehicleQuery::Vin(vin) => lookup.records_by_vin(vin).await?,
    };

    info!("[DVSA] Lookup returned {} MOT tests", records.len());
    write_json(out, &records)?;
    Ok(records.len())
}
