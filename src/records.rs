//! Vehicle MOT history types.
//!
//! The API and the bulk files both carry one vehicle per JSON object with a
//! nested `motTests` array. `VehicleMotRecord` is the flattened form: one row
//! per test, carrying the vehicle's identifying fields.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types (match the API JSON)
// ─────────────────────────────────────────────────────────────────────────────

/// A vehicle and its MOT test history as returned by the API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleHistory {
    pub registration: String,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub fuel_type: Option<String>,
    #[serde(default)]
    pub primary_colour: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_i32")]
    pub engine_size: Option<i32>,
    #[serde(default, deserialize_with = "lenient::opt_date")]
    pub first_used_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::opt_date")]
    pub registration_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::opt_date")]
    pub manufacture_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::null_as_default")]
    pub mot_tests: Vec<MotTest>,
}

/// A single MOT test event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotTest {
    #[serde(deserialize_with = "lenient::timestamp")]
    pub completed_date: DateTime<Utc>,
    pub test_result: String,
    #[serde(default, deserialize_with = "lenient::opt_date")]
    pub expiry_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub odometer_value: Option<i64>,
    #[serde(default)]
    pub odometer_unit: Option<String>,
    #[serde(default)]
    pub odometer_result_type: Option<String>,
    #[serde(default)]
    pub mot_test_number: Option<String>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default, deserialize_with = "lenient::null_as_default")]
    pub defects: Vec<Defect>,
}

/// A defect or advisory noted during a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defect {
    #[serde(default)]
    pub text: String,
    #[serde(rename = "type", default)]
    pub defect_type: String,
    #[serde(default)]
    pub dangerous: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// VehicleMotRecord
// ─────────────────────────────────────────────────────────────────────────────

/// One row of output: one test for one vehicle.
///
/// Field order and names match `mot_record_schema()` column for column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleMotRecord {
    pub registration: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub fuel_type: Option<String>,
    pub primary_colour: Option<String>,
    pub engine_size: Option<i32>,
    pub first_used_date: Option<NaiveDate>,
    pub registration_date: Option<NaiveDate>,
    pub manufacture_date: Option<NaiveDate>,
    pub mot_test_number: Option<String>,
    pub completed_date: DateTime<Utc>,
    pub test_result: String,
    pub expiry_date: Option<NaiveDate>,
    pub odometer_value: Option<i64>,
    pub odometer_unit: Option<String>,
    pub odometer_result_type: Option<String>,
    pub data_source: Option<String>,
    #[serde(default)]
    pub defects: Vec<Defect>,
}

impl VehicleHistory {
    /// Flattens the history into records, keeping the API's test order.
    pub fn into_records(self) -> Vec<VehicleMotRecord> {
        let VehicleHistory {
            registration,
            make,
            model,
            fuel_type,
            primary_colour,
            engine_size,
            first_used_date,
            registration_date,
            manufacture_date,
            mot_tests,
        } = self;

        mot_tests
            .into_iter()
            .map(|test| VehicleMotRecord {
                registration: registration.clone(),
                make: make.clone(),
                model: model.clone(),
                fuel_type: fuel_type.clone(),
                primary_colour: primary_colour.clone(),
                engine_size,
                first_used_date,
                registration_date,
                manufacture_date,
                mot_test_number: test.mot_test_number,
                completed_date: test.completed_date,
                test_result: test.test_result,
                expiry_date: test.expiry_date,
                odometer_value: test.odometer_value,
                odometer_unit: test.odometer_unit,
                odometer_result_type: test.odometer_result_type,
                data_source: test.data_source,
                defects: test.defects,
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lenient deserializers
// ─────────────────────────────────────────────────────────────────────────────

/// The API encodes numbers as strings and has used more than one date layout
/// over time. These accept every form seen in responses and bulk files.
mod lenient {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Int(i64),
        Float(f64),
        Text(String),
    }

    fn parse_number<E: Error>(raw: Option<NumberOrString>) -> Result<Option<i64>, E> {
        match raw {
            None => Ok(None),
            Some(NumberOrString::Int(n)) => Ok(Some(n)),
            Some(NumberOrString::Float(f)) if f.fract() == 0.0 => Ok(Some(f as i64)),
            Some(NumberOrString::Float(f)) => {
                Err(E::custom(format!("expected a whole number, got {}", f)))
            }
            Some(NumberOrString::Text(s)) => {
                let s = s.trim();
                if s.is_empty() {
                    Ok(None)
                } else {
                    s.parse::<i64>()
                        .map(Some)
                        .map_err(|_| E::custom(format!("expected a number, got {:?}", s)))
                }
            }
        }
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        parse_number(Option::<NumberOrString>::deserialize(d)?)
    }

    pub fn opt_i32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i32>, D::Error> {
        match parse_number::<D::Error>(Option::<NumberOrString>::deserialize(d)?)? {
            None => Ok(None),
            Some(n) => i32::try_from(n)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("number {} out of range", n))),
        }
    }

    pub fn parse_date(s: &str) -> Option<NaiveDate> {
        let s = s.trim();
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .or_else(|_| NaiveDate::parse_from_str(s, "%Y.%m.%d"))
            .ok()
            .or_else(|| parse_timestamp(s).map(|ts| ts.date_naive()))
    }

    pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Some(ts.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y.%m.%d %H:%M:%S"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn opt_date<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDate>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => parse_date(&s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid date {:?}", s))),
        }
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        parse_timestamp(&s)
            .or_else(|| parse_date(&s).map(|date| date.and_time(NaiveTime::MIN).and_utc()))
            .ok_or_else(|| D::Error::custom(format!("invalid timestamp {:?}", s)))
    }

    pub fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Default + Deserialize<'de>,
    {
        Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "registration": "AB12CDE",
            "make": "FORD",
            "model": "FOCUS",
            "firstUsedDate": "2012-03-01",
            "fuelType": "Petrol",
            "primaryColour": "Silver",
            "registrationDate": "2012-03-01",
            "manufactureDate": "2012.02.20",
            "engineSize": "1596",
            "hasOutstandingRecall": "Unknown",
            "motTests": [
                {
                    "completedDate": "2024-02-28T09:15:31.000Z",
                    "testResult": "PASSED",
                    "expiryDate": "2025-02-28",
                    "odometerValue": "81234",
                    "odometerUnit": "MI",
                    "odometerResultType": "READ",
                    "motTestNumber": "123456789012",
                    "dataSource": "DVSA",
                    "defects": [
                        { "text": "Nearside front tyre worn close to legal limit", "type": "ADVISORY", "dangerous": false }
                    ]
                },
                {
                    "completedDate": "2023.02.27 14:02:11",
                    "testResult": "FAILED",
                    "expiryDate": null,
                    "odometerValue": 74000,
                    "odometerUnit": "MI",
                    "odometerResultType": "READ",
                    "motTestNumber": "987654321098",
                    "defects": null
                }
            ]
        })
    }

    #[test]
    fn flattens_one_record_per_test_in_api_order() {
        let history: VehicleHistory = serde_json::from_value(sample_json()).unwrap();
        let records = history.into_records();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].mot_test_number.as_deref(), Some("123456789012"));
        assert_eq!(records[1].mot_test_number.as_deref(), Some("987654321098"));
        assert!(records.iter().all(|r| r.registration == "AB12CDE"));
        assert!(records.iter().all(|r| r.make.as_deref() == Some("FORD")));
    }

    #[test]
    fn parses_string_numbers_and_both_date_layouts() {
        let history: VehicleHistory = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(history.engine_size, Some(1596));
        assert_eq!(
            history.manufacture_date,
            NaiveDate::from_ymd_opt(2012, 2, 20)
        );

        let records = history.into_records();
        assert_eq!(records[0].odometer_value, Some(81234));
        assert_eq!(records[1].odometer_value, Some(74000));
        assert_eq!(
            records[0].completed_date,
            Utc.with_ymd_and_hms(2024, 2, 28, 9, 15, 31).unwrap()
        );
        assert_eq!(
            records[1].completed_date,
            Utc.with_ymd_and_hms(2023, 2, 27, 14, 2, 11).unwrap()
        );
        assert_eq!(records[1].expiry_date, None);
    }

    #[test]
    fn null_defects_become_empty() {
        let records = serde_json::from_value::<VehicleHistory>(sample_json())
            .unwrap()
            .into_records();
        assert_eq!(records[0].defects.len(), 1);
        assert_eq!(records[0].defects[0].defect_type, "ADVISORY");
        assert!(records[1].defects.is_empty());
    }

    #[test]
    fn vehicle_without_tests_has_no_records() {
        let history: VehicleHistory = serde_json::from_value(serde_json::json!({
            "registration": "NEW123",
            "make": "KIA"
        }))
        .unwrap();
        assert!(history.into_records().is_empty());
    }

    #[test]
    fn non_numeric_odometer_is_rejected() {
        let mut json = sample_json();
        json["motTests"][0]["odometerValue"] = serde_json::json!("lots");
        let err = serde_json::from_value::<VehicleHistory>(json).unwrap_err();
        assert!(err.to_string().contains("expected a number"));
    }

    #[test]
    fn missing_registration_is_rejected() {
        let err = serde_json::from_value::<VehicleHistory>(serde_json::json!({
            "make": "FORD",
            "motTests": []
        }))
        .unwrap_err();
        assert!(err.to_string().contains("registration"));
    }

    #[test]
    fn empty_strings_are_null() {
        let history: VehicleHistory = serde_json::from_value(serde_json::json!({
            "registration": "X1",
            "engineSize": "",
            "firstUsedDate": ""
        }))
        .unwrap();
        assert_eq!(history.engine_size, None);
        assert_eq!(history.first_used_date, None);
    }
}
