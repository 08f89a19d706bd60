//! In-process store used for local development and tests.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::MeasurementStore;
use crate::error::StoreError;
use crate::models::{
    Measurement, MeasurementId, MeasurementStatus, MeasurementSummary, NewMeasurement, OwnerId,
    Point, Statistics,
};

// ---

#[derive(Debug)]
struct OwnerRecord {
    id: OwnerId,
    login: String,
    display_name: String,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    // ---
    owners: RwLock<Vec<OwnerRecord>>,
    measurements: RwLock<HashMap<MeasurementId, Measurement>>,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an owner and return its canonical identity.
    pub async fn add_owner(&self, login: &str, display_name: &str) -> OwnerId {
        // ---
        let id = Uuid::new_v4();
        self.owners.write().await.push(OwnerRecord {
            id,
            login: login.to_string(),
            display_name: display_name.to_string(),
        });
        id
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    // ---
    async fn find_owner(&self, token: &str) -> Result<Option<OwnerId>, StoreError> {
        // ---
        let owners = self.owners.read().await;
        let by_login = owners.iter().find(|o| o.login == token);
        let found = by_login.or_else(|| owners.iter().find(|o| o.display_name == token));
        Ok(found.map(|o| o.id))
    }

    async fn create(
        &self,
        new: NewMeasurement,
        points: &[Point],
    ) -> Result<MeasurementId, StoreError> {
        // ---
        let now = Utc::now();
        let id = Uuid::new_v4();
        let measurement = Measurement {
            summary: MeasurementSummary {
                id,
                user_id: new.owner,
                form_id: new.form_id,
                device_address: new.device_address,
                total_points: points.len() as u64,
                stats: None,
                status: MeasurementStatus::Collecting,
                error_message: None,
                created_at: now,
                updated_at: now,
            },
            points: points.to_vec(),
        };

        self.measurements.write().await.insert(id, measurement);
        Ok(id)
    }

    async fn append_points(
        &self,
        id: MeasurementId,
        owner: OwnerId,
        points: &[Point],
    ) -> Result<Option<u64>, StoreError> {
        // ---
        let mut measurements = self.measurements.write().await;
        let Some(m) = measurements.get_mut(&id) else {
            return Ok(None);
        };
        if m.summary.user_id != owner || m.summary.status.is_frozen() {
            return Ok(None);
        }

        m.points.extend_from_slice(points);
        m.summary.total_points = m.points.len() as u64;
        m.summary.updated_at = Utc::now();
        Ok(Some(m.summary.total_points))
    }

    async fn find(
        &self,
        id: MeasurementId,
        owner: Option<OwnerId>,
    ) -> Result<Option<Measurement>, StoreError> {
        // ---
        let measurements = self.measurements.read().await;
        Ok(measurements
            .get(&id)
            .filter(|m| owner.map_or(true, |o| m.summary.user_id == o))
            .cloned())
    }

    async fn complete(&self, id: MeasurementId, stats: &Statistics) -> Result<bool, StoreError> {
        // ---
        let mut measurements = self.measurements.write().await;
        match measurements.get_mut(&id) {
            Some(m) if !m.summary.status.is_frozen() => {
                m.summary.status = MeasurementStatus::Completed;
                m.summary.stats = Some(*stats);
                m.summary.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(&self, id: MeasurementId, reason: &str) -> Result<bool, StoreError> {
        // ---
        let mut measurements = self.measurements.write().await;
        match measurements.get_mut(&id) {
            Some(m) if !m.summary.status.is_frozen() => {
                m.summary.status = MeasurementStatus::Error;
                m.summary.error_message = Some(reason.to_string());
                m.summary.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(
        &self,
        owner: OwnerId,
        limit: u32,
    ) -> Result<Vec<MeasurementSummary>, StoreError> {
        // ---
        let measurements = self.measurements.read().await;
        let mut summaries: Vec<MeasurementSummary> = measurements
            .values()
            .filter(|m| m.summary.user_id == owner)
            .map(|m| m.summary.clone())
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit as usize);
        Ok(summaries)
    }

    async fn delete(&self, id: MeasurementId, owner: OwnerId) -> Result<bool, StoreError> {
        // ---
        let mut measurements = self.measurements.write().await;
        let owned = measurements
            .get(&id)
            .is_some_and(|m| m.summary.user_id == owner);
        if owned {
            measurements.remove(&id);
        }
        Ok(owned)
    }

    async fn stale(&self, idle: Duration) -> Result<Vec<MeasurementId>, StoreError> {
        // ---
        let cutoff: DateTime<Utc> = SystemTime::now()
            .checked_sub(idle)
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .into();
        let measurements = self.measurements.read().await;
        Ok(measurements
            .values()
            .filter(|m| !m.summary.status.is_frozen() && m.summary.updated_at < cutoff)
            .map(|m| m.summary.id)
            .collect())
    }
}
