//! Data models for the LiDAR ingest pipeline.
//!
//! Wire-level [`Sample`]s are transient; everything else here is either
//! persisted (`Measurement`, `Point`, `Statistics`) or broadcast to
//! observers (`MeasurementUpdate`). JSON field names are camelCase because
//! the device client and the dashboard both speak that dialect.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---

/// Canonical owner identity.
pub type OwnerId = Uuid;

/// Measurement identity.
pub type MeasurementId = Uuid;

/// One raw polar reading as sent by the scanning device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    // ---
    /// Scan angle in degrees.
    pub angle: f64,
    /// Range in millimeters.
    pub distance: f64,
    pub intensity: f64,
    /// Motor (sweep) angle in degrees.
    pub motor_angle: f64,
}

/// A sample converted to Cartesian coordinates in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    // ---
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: f64,
    pub angle: f64,
    /// Raw distance in millimeters.
    pub distance: f64,
    pub motor_angle: f64,
}

/// Aggregate statistics, computed once when a measurement is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    // ---
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
    pub min_z: f64,
    pub max_z: f64,
    pub avg_intensity: f64,
    /// Number of points the statistics were computed over.
    pub point_density: u64,
}

/// Lifecycle state of a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementStatus {
    Collecting,
    Completed,
    Error,
}

impl MeasurementStatus {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementStatus::Collecting => "collecting",
            MeasurementStatus::Completed => "completed",
            MeasurementStatus::Error => "error",
        }
    }

    /// Completed and errored measurements accept no further points.
    pub fn is_frozen(&self) -> bool {
        !matches!(self, MeasurementStatus::Collecting)
    }
}

impl fmt::Display for MeasurementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collecting" => Ok(MeasurementStatus::Collecting),
            "completed" => Ok(MeasurementStatus::Completed),
            "error" => Ok(MeasurementStatus::Error),
            other => Err(format!("unknown measurement status `{other}`")),
        }
    }
}

/// Everything needed to open a new measurement.
#[derive(Debug, Clone)]
pub struct NewMeasurement {
    // ---
    pub owner: OwnerId,
    pub form_id: Option<Uuid>,
    pub device_address: String,
}

/// A measurement without its point cloud.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementSummary {
    // ---
    pub id: MeasurementId,
    pub user_id: OwnerId,
    pub form_id: Option<Uuid>,
    pub device_address: String,
    pub total_points: u64,
    pub stats: Option<Statistics>,
    pub status: MeasurementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A full measurement, points in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    // ---
    #[serde(flatten)]
    pub summary: MeasurementSummary,
    pub points: Vec<Point>,
}

impl Measurement {
    // ---
    pub fn status(&self) -> MeasurementStatus {
        self.summary.status
    }
}

/// State snapshot broadcast to observers after every accepted change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementUpdate {
    // ---
    pub measurement_id: MeasurementId,
    pub user_id: OwnerId,
    pub total_points: u64,
    pub status: MeasurementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Statistics>,
}
