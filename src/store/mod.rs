//! Persistence boundary for measurements and owner lookup.
//!
//! The store is the only source of truth about whether a measurement is
//! still open. Writers never hold an in-process lock across calls; each
//! mutation is a single conditional update on the stored document.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{
    Measurement, MeasurementId, MeasurementSummary, NewMeasurement, OwnerId, Point, Statistics,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

#[async_trait]
pub trait MeasurementStore: Send + Sync + 'static {
    // ---
    /// Find an owner whose login or display name equals `token`.
    async fn find_owner(&self, token: &str) -> Result<Option<OwnerId>, StoreError>;

    /// Persist a new `collecting` measurement holding `points`.
    async fn create(
        &self,
        new: NewMeasurement,
        points: &[Point],
    ) -> Result<MeasurementId, StoreError>;

    /// Append to a `collecting` measurement owned by `owner`.
    ///
    /// Returns the new total, or `None` when the measurement is missing,
    /// owned by someone else, or frozen.
    async fn append_points(
        &self,
        id: MeasurementId,
        owner: OwnerId,
        points: &[Point],
    ) -> Result<Option<u64>, StoreError>;

    /// Load a measurement with its points, optionally scoped to an owner.
    async fn find(
        &self,
        id: MeasurementId,
        owner: Option<OwnerId>,
    ) -> Result<Option<Measurement>, StoreError>;

    /// Move `collecting` to `completed` with `stats`. `false` if it was not collecting.
    async fn complete(&self, id: MeasurementId, stats: &Statistics) -> Result<bool, StoreError>;

    /// Move `collecting` to `error` with `reason`. `false` if it was not collecting.
    async fn fail(&self, id: MeasurementId, reason: &str) -> Result<bool, StoreError>;

    /// Newest-first summaries for one owner.
    async fn list(&self, owner: OwnerId, limit: u32)
        -> Result<Vec<MeasurementSummary>, StoreError>;

    async fn delete(&self, id: MeasurementId, owner: OwnerId) -> Result<bool, StoreError>;

    /// `collecting` measurements with no write for longer than `idle`.
    async fn stale(&self, idle: Duration) -> Result<Vec<MeasurementId>, StoreError>;
}
