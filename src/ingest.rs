//! The one ingest path every front end funnels into.
//!
//! Raw listener, authenticated endpoint, relay endpoint and device channel
//! differ only in how they learn the owner and frame their bytes. Once a
//! batch is converted they all call [`Ingestor::ingest`].

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::convert::Conversion;
use crate::error::IngestError;
use crate::models::{MeasurementId, MeasurementStatus, OwnerId, Statistics};
use crate::publisher::Publisher;
use crate::resolver::SessionResolver;
use crate::store::MeasurementStore;

// ---

/// One converted batch and what to do with it.
#[derive(Debug, Clone)]
pub struct Batch {
    // ---
    /// Continue this measurement; `None` opens a new one.
    pub measurement_id: Option<MeasurementId>,
    pub form_id: Option<Uuid>,
    pub device_address: String,
    pub conversion: Conversion,
    /// Finalize after appending.
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    // ---
    pub measurement_id: MeasurementId,
    pub total_points: u64,
    pub status: MeasurementStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Statistics>,
    /// This batch opened the measurement.
    pub created: bool,
    /// Records dropped as malformed or out of range.
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    // ---
    aggregator: Aggregator,
    resolver: SessionResolver,
}

impl Ingestor {
    // ---
    pub fn new(store: Arc<dyn MeasurementStore>, publisher: Publisher) -> Self {
        // ---
        Self {
            aggregator: Aggregator::new(store.clone(), publisher),
            resolver: SessionResolver::new(store),
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub async fn resolve(&self, token: &str) -> Result<OwnerId, IngestError> {
        self.resolver.resolve(token).await
    }

    pub async fn ingest(&self, owner: OwnerId, batch: Batch) -> Result<IngestOutcome, IngestError> {
        // ---
        let points = &batch.conversion.points;

        let (measurement_id, total_points, created) = match batch.measurement_id {
            Some(id) => {
                let total = self.aggregator.append(id, owner, points).await?;
                (id, total, false)
            }
            None => {
                let id = self
                    .aggregator
                    .begin(owner, batch.form_id, &batch.device_address, points)
                    .await?;
                (id, points.len() as u64, true)
            }
        };

        let (status, stats) = if batch.is_last {
            let stats = self.aggregator.finalize(measurement_id).await?;
            (MeasurementStatus::Completed, Some(stats))
        } else {
            (MeasurementStatus::Collecting, None)
        };

        Ok(IngestOutcome {
            measurement_id,
            total_points,
            status,
            stats,
            created,
            skipped: batch.conversion.skipped(),
        })
    }
}
