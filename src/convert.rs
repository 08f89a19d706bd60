//! Polar sample to Cartesian point conversion.
//!
//! A wire record is `angle,distance,intensity,motorAngle` with angles in
//! degrees and distance in millimeters. The scan angle tilts the beam out of
//! the horizontal plane, the motor angle sweeps that plane around the
//! vertical axis:
//!
//! ```text
//! z = -d * sin(angle)
//! y =  d * cos(angle) * sin(motor)
//! x =  d * cos(angle) * cos(motor)
//! ```

use tracing::debug;

use crate::error::ParseFailure;
use crate::models::{Point, Sample};
use crate::reassembler::split_batch;

/// Returns at or beyond this range (mm) are out of the sensor's envelope.
pub const MAX_DISTANCE_MM: f64 = 12_000.0;

const MM_PER_M: f64 = 1000.0;

// ---

impl Sample {
    // ---
    /// Read one record. Fields past the fourth are ignored.
    pub fn parse(record: &str) -> Result<Sample, ParseFailure> {
        // ---
        let fail = |reason| ParseFailure {
            record: record.to_string(),
            reason,
        };

        let mut fields = [0.0_f64; 4];
        let mut parts = record.split(',');
        for field in fields.iter_mut() {
            let raw = parts.next().ok_or_else(|| fail("expected four fields"))?;
            let value: f64 = raw.trim().parse().map_err(|_| fail("non-numeric field"))?;
            if !value.is_finite() {
                return Err(fail("non-finite field"));
            }
            *field = value;
        }

        let [angle, distance, intensity, motor_angle] = fields;
        Ok(Sample {
            angle,
            distance,
            intensity,
            motor_angle,
        })
    }

    /// Invalid returns are dropped silently; they are not protocol errors.
    pub fn is_valid(&self) -> bool {
        self.intensity >= 0.0 && self.distance > 0.0 && self.distance < MAX_DISTANCE_MM
    }

    pub fn to_point(&self) -> Option<Point> {
        // ---
        if !self.is_valid() {
            return None;
        }

        let alpha = self.angle.to_radians();
        let mu = self.motor_angle.to_radians();
        let d = self.distance;

        let z = -d * alpha.sin();
        let y = d * alpha.cos() * mu.sin();
        let x = d * alpha.cos() * mu.cos();

        Some(Point {
            x: x / MM_PER_M,
            y: y / MM_PER_M,
            z: z / MM_PER_M,
            intensity: self.intensity,
            angle: self.angle,
            distance: self.distance,
            motor_angle: self.motor_angle,
        })
    }
}

/// Result of converting one batch of records, points in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversion {
    // ---
    pub points: Vec<Point>,
    /// Non-blank records seen.
    pub records: usize,
    /// Records that were not four numbers.
    pub parse_failures: usize,
    /// Well-formed samples outside the validity envelope.
    pub rejected: usize,
}

impl Conversion {
    // ---
    pub fn skipped(&self) -> usize {
        self.parse_failures + self.rejected
    }
}

/// Convert records in order. Blank records are ignored outright.
pub fn convert_records<I, S>(records: I) -> Conversion
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    // ---
    let mut out = Conversion::default();

    for record in records {
        let record = record.as_ref().trim();
        if record.is_empty() {
            continue;
        }
        out.records += 1;

        match Sample::parse(record) {
            Ok(sample) => match sample.to_point() {
                Some(point) => out.points.push(point),
                None => out.rejected += 1,
            },
            Err(failure) => {
                debug!(
                    "Failed to parse sample `{}`: {}",
                    failure.record, failure.reason
                );
                out.parse_failures += 1;
            }
        }
    }

    out
}

/// Convert a whole `;`-separated batch in one pass.
pub fn convert_batch(raw: &str) -> Conversion {
    convert_records(split_batch(raw))
}
