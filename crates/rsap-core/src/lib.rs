//! Core domain model and error taxonomy for RSAP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rsap-core";

/// Review state of an ingested anomaly record. Transitions one way only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Unconfirmed,
    Confirmed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Unconfirmed => "unconfirmed",
            RecordStatus::Confirmed => "confirmed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "unconfirmed" => Some(RecordStatus::Unconfirmed),
            "confirmed" => Some(RecordStatus::Confirmed),
            _ => None,
        }
    }
}

/// Persisted road-surface anomaly record. Every sensor field is nullable;
/// `detected_at` is a calendar-date string (`YYYY-MM-DD`) compared lexically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: i64,
    pub car_id: Option<String>,
    pub speed: Option<f64>,
    pub location_x: Option<f64>,
    pub location_y: Option<f64>,
    pub object_url: Option<String>,
    pub impact_force: Option<f64>,
    pub z_axis_vibration: Option<f64>,
    pub detected_at: Option<String>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnomalyRecord {
    /// Public identifier exposed over the API.
    pub fn public_id(&self) -> String {
        format_record_id(self.id)
    }
}

/// Normalized row handed from the pipeline into the store, before an id or
/// status has been assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewAnomalyRecord {
    pub car_id: Option<String>,
    pub speed: Option<f64>,
    pub location_x: Option<f64>,
    pub location_y: Option<f64>,
    pub object_url: Option<String>,
    pub impact_force: Option<f64>,
    pub z_axis_vibration: Option<f64>,
    pub detected_at: Option<String>,
}

impl NewAnomalyRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            car_id: self.car_id.clone(),
            location_x: self.location_x,
            location_y: self.location_y,
            detected_at: self.detected_at.clone(),
            impact_force: self.impact_force,
        }
    }
}

/// Dedup key for ingested records. Null fields compare equal to null
/// (`Option` equality here, `IS NOT DISTINCT FROM` in SQL), so re-running a
/// window cannot re-insert rows with missing fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalKey {
    pub car_id: Option<String>,
    pub location_x: Option<f64>,
    pub location_y: Option<f64>,
    pub detected_at: Option<String>,
    pub impact_force: Option<f64>,
}

const PUBLIC_ID_PREFIX: &str = "p-";

pub fn format_record_id(id: i64) -> String {
    format!("{PUBLIC_ID_PREFIX}{id}")
}

/// Parse a public `p-<n>` identifier back to the surrogate id.
pub fn parse_record_id(raw: &str) -> Result<i64, ServiceError> {
    let digits = raw
        .strip_prefix(PUBLIC_ID_PREFIX)
        .ok_or_else(|| ServiceError::InvalidIdentifier(raw.to_string()))?;
    digits
        .parse::<i64>()
        .map_err(|_| ServiceError::InvalidIdentifier(raw.to_string()))
}

/// Converted WGS84 position for a record, rounded to 5 decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub latitude: f64,
    pub longitude: f64,
}

// Affine map from simulator-local meters to lon/lat around a fixed origin.
const ORIGIN_LONGITUDE: f64 = 127.00374;
const ORIGIN_LATITUDE: f64 = 37.55807;
const METERS_PER_LON_DEGREE: f64 = 89_000.0;
const METERS_PER_LAT_DEGREE: f64 = 111_139.0;

pub fn convert_to_lat_lon(location_x: Option<f64>, location_y: Option<f64>) -> Option<LatLon> {
    let (x, y) = (location_x?, location_y?);
    let round5 = |v: f64| (v * 100_000.0).round() / 100_000.0;
    Some(LatLon {
        longitude: round5(ORIGIN_LONGITUDE + x / METERS_PER_LON_DEGREE),
        latitude: round5(ORIGIN_LATITUDE + y / METERS_PER_LAT_DEGREE),
    })
}

/// Typed failure taxonomy shared across the pipeline and the web boundary.
/// Each kind carries a stable numeric code; external monitors key on the
/// codes, so they never change meaning.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("query predicate must not be empty")]
    InvalidPredicate,
    #[error("analytics query failed: {reason}")]
    QueryExecutionFailed { reason: String },
    #[error("analytics query timed out after {waited_secs}s")]
    QueryTimeout { waited_secs: u64 },
    #[error("analytics query was cancelled")]
    QueryCancelled,
    #[error("query results could not be retrieved: {reason}")]
    ResultRetrievalFailed { reason: String },
    #[error("no rows were ingested from a non-empty result set")]
    IngestionFailed,
    #[error("record {0} not found")]
    NotFound(i64),
    #[error("record {0} is already confirmed")]
    AlreadyConfirmed(i64),
    #[error("a pipeline run is already in progress")]
    SchedulerAlreadyRunning,
    #[error("invalid record identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid date range: {0}")]
    InvalidDateRange(String),
    #[error("storage connection failed: {reason}")]
    ConnectionFailed { reason: String },
}

impl ServiceError {
    pub fn code(&self) -> u16 {
        match self {
            ServiceError::QueryExecutionFailed { .. } => 5001,
            ServiceError::QueryTimeout { .. } => 5002,
            ServiceError::QueryCancelled => 5003,
            ServiceError::ResultRetrievalFailed { .. } => 5005,
            ServiceError::ConnectionFailed { .. } => 5011,
            ServiceError::IngestionFailed => 5012,
            ServiceError::InvalidPredicate => 5031,
            ServiceError::NotFound(_) => 5041,
            ServiceError::AlreadyConfirmed(_) => 5042,
            ServiceError::InvalidIdentifier(_) => 5043,
            ServiceError::InvalidDateRange(_) => 5044,
            ServiceError::SchedulerAlreadyRunning => 5061,
        }
    }

    pub fn connection(reason: impl std::fmt::Display) -> Self {
        ServiceError::ConnectionFailed {
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_id_round_trips() {
        assert_eq!(format_record_id(42), "p-42");
        assert_eq!(parse_record_id("p-42").unwrap(), 42);
    }

    #[test]
    fn malformed_public_ids_are_rejected() {
        for raw in ["xyz", "p-", "p-abc", "42", "P-42", "p-4 2"] {
            assert!(matches!(
                parse_record_id(raw),
                Err(ServiceError::InvalidIdentifier(_))
            ));
        }
    }

    #[test]
    fn natural_key_treats_null_as_equal() {
        let a = NewAnomalyRecord {
            car_id: Some("car-7".into()),
            detected_at: Some("2025-08-27".into()),
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a.natural_key(), b.natural_key());

        let c = NewAnomalyRecord {
            location_x: Some(1.0),
            ..a.clone()
        };
        assert_ne!(a.natural_key(), c.natural_key());
    }

    #[test]
    fn coordinate_conversion_is_anchored_at_origin() {
        let at_origin = convert_to_lat_lon(Some(0.0), Some(0.0)).unwrap();
        assert_eq!(at_origin.longitude, 127.00374);
        assert_eq!(at_origin.latitude, 37.55807);

        let east = convert_to_lat_lon(Some(89_000.0), Some(0.0)).unwrap();
        assert_eq!(east.longitude, 128.00374);

        assert!(convert_to_lat_lon(None, Some(1.0)).is_none());
        assert!(convert_to_lat_lon(Some(1.0), None).is_none());
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ServiceError::InvalidPredicate.code(), 5031);
        assert_eq!(ServiceError::QueryTimeout { waited_secs: 300 }.code(), 5002);
        assert_eq!(ServiceError::InvalidDateRange("x".into()).code(), 5044);
        assert_eq!(ServiceError::SchedulerAlreadyRunning.code(), 5061);
    }
}
