//! Lifecycle of one scan session: begin, append, finalize, fail.
//!
//! Statistics are computed exactly once, at finalization, over the full
//! stored point set. Nothing aggregate is maintained on the append path.
//! Every accepted transition is handed to the [`Publisher`].

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::{
    MeasurementId, MeasurementStatus, MeasurementUpdate, NewMeasurement, OwnerId, Point,
    Statistics,
};
use crate::publisher::Publisher;
use crate::store::MeasurementStore;

// ---

impl Statistics {
    /// Bounds and mean intensity over `points`; all zeros when empty.
    pub fn compute(points: &[Point]) -> Statistics {
        // ---
        let Some(first) = points.first() else {
            return Statistics::default();
        };

        let mut stats = Statistics {
            min_x: first.x,
            max_x: first.x,
            min_y: first.y,
            max_y: first.y,
            min_z: first.z,
            max_z: first.z,
            avg_intensity: 0.0,
            point_density: points.len() as u64,
        };

        let mut intensity_sum = 0.0;
        for p in points {
            stats.min_x = stats.min_x.min(p.x);
            stats.max_x = stats.max_x.max(p.x);
            stats.min_y = stats.min_y.min(p.y);
            stats.max_y = stats.max_y.max(p.y);
            stats.min_z = stats.min_z.min(p.z);
            stats.max_z = stats.max_z.max(p.z);
            intensity_sum += p.intensity;
        }
        stats.avg_intensity = intensity_sum / points.len() as f64;

        stats
    }
}

#[derive(Clone)]
pub struct Aggregator {
    // ---
    store: Arc<dyn MeasurementStore>,
    publisher: Publisher,
}

impl Aggregator {
    // ---
    pub fn new(store: Arc<dyn MeasurementStore>, publisher: Publisher) -> Self {
        Self { store, publisher }
    }

    /// Open a measurement with its first points.
    ///
    /// An opening batch without a single valid point is refused, so an empty
    /// measurement is never persisted.
    pub async fn begin(
        &self,
        owner: OwnerId,
        form_id: Option<Uuid>,
        device_address: &str,
        points: &[Point],
    ) -> Result<MeasurementId, IngestError> {
        // ---
        if owner.is_nil() {
            return Err(IngestError::InvalidOwner);
        }
        if points.is_empty() {
            return Err(IngestError::NoValidPoints);
        }

        let new = NewMeasurement {
            owner,
            form_id,
            device_address: device_address.to_string(),
        };
        let id = self.store.create(new, points).await?;

        info!(
            "Measurement {} opened for owner {} from {} ({} points)",
            id,
            owner,
            device_address,
            points.len()
        );
        self.publisher.publish(MeasurementUpdate {
            measurement_id: id,
            user_id: owner,
            total_points: points.len() as u64,
            status: MeasurementStatus::Collecting,
            stats: None,
        });

        Ok(id)
    }

    /// Append to a `collecting` measurement owned by `owner`; returns the new total.
    pub async fn append(
        &self,
        id: MeasurementId,
        owner: OwnerId,
        points: &[Point],
    ) -> Result<u64, IngestError> {
        // ---
        let total = self
            .store
            .append_points(id, owner, points)
            .await?
            .ok_or(IngestError::MeasurementNotFound)?;

        debug!("Measurement {}: +{} points, {} total", id, points.len(), total);
        self.publisher.publish(MeasurementUpdate {
            measurement_id: id,
            user_id: owner,
            total_points: total,
            status: MeasurementStatus::Collecting,
            stats: None,
        });

        Ok(total)
    }

    /// Compute statistics over every stored point and mark the measurement completed.
    ///
    /// On an already frozen measurement this is a no-op returning whatever
    /// statistics were stored; nothing is recomputed or republished.
    pub async fn finalize(&self, id: MeasurementId) -> Result<Statistics, IngestError> {
        // ---
        let measurement = self
            .store
            .find(id, None)
            .await?
            .ok_or(IngestError::MeasurementNotFound)?;

        if measurement.status().is_frozen() {
            debug!(
                "Measurement {} already {}, finalize ignored",
                id,
                measurement.status()
            );
            return Ok(measurement.summary.stats.unwrap_or_default());
        }

        let stats = Statistics::compute(&measurement.points);
        if !self.store.complete(id, &stats).await? {
            warn!("Measurement {} was frozen while being finalized", id);
            return Err(IngestError::MeasurementNotFound);
        }

        info!(
            "Measurement {} completed: {} points",
            id, stats.point_density
        );
        self.publisher.publish(MeasurementUpdate {
            measurement_id: id,
            user_id: measurement.summary.user_id,
            total_points: measurement.points.len() as u64,
            status: MeasurementStatus::Completed,
            stats: Some(stats),
        });

        Ok(stats)
    }

    /// Mark a `collecting` measurement as errored. Stored points stay readable.
    pub async fn fail(&self, id: MeasurementId, reason: &str) -> Result<(), IngestError> {
        // ---
        if !self.store.fail(id, reason).await? {
            return Err(IngestError::MeasurementNotFound);
        }

        warn!("Measurement {} failed: {}", id, reason);
        if let Some(m) = self.store.find(id, None).await? {
            self.publisher.publish(MeasurementUpdate {
                measurement_id: id,
                user_id: m.summary.user_id,
                total_points: m.summary.total_points,
                status: MeasurementStatus::Error,
                stats: None,
            });
        }

        Ok(())
    }
}
