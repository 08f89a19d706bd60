//! PostgreSQL-backed measurement store.
//!
//! Points live in their own table keyed by `(measurement_id, seq)`; `seq` is
//! the arrival index, so reading them back `ORDER BY seq` reproduces
//! insertion order exactly.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::MeasurementStore;
use crate::error::StoreError;
use crate::models::{
    Measurement, MeasurementId, MeasurementStatus, MeasurementSummary, NewMeasurement, OwnerId,
    Point, Statistics,
};

const SELECT_SUMMARY: &str = r#"
    SELECT id, owner_id, form_id, device_address, total_points, status, error_message,
           min_x, max_x, min_y, max_y, min_z, max_z, avg_intensity, point_density,
           created_at, updated_at
    FROM measurements
"#;

// ---

#[derive(Debug, Clone)]
pub struct PgStore {
    // ---
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MeasurementRow {
    // ---
    id: Uuid,
    owner_id: Uuid,
    form_id: Option<Uuid>,
    device_address: String,
    total_points: i64,
    status: String,
    error_message: Option<String>,
    min_x: Option<f64>,
    max_x: Option<f64>,
    min_y: Option<f64>,
    max_y: Option<f64>,
    min_z: Option<f64>,
    max_z: Option<f64>,
    avg_intensity: Option<f64>,
    point_density: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MeasurementRow> for MeasurementSummary {
    type Error = StoreError;

    fn try_from(row: MeasurementRow) -> Result<Self, Self::Error> {
        // ---
        let status: MeasurementStatus = row.status.parse().map_err(StoreError::Corrupt)?;

        // Statistics columns are written together by `complete`.
        let stats = row.point_density.map(|density| Statistics {
            min_x: row.min_x.unwrap_or_default(),
            max_x: row.max_x.unwrap_or_default(),
            min_y: row.min_y.unwrap_or_default(),
            max_y: row.max_y.unwrap_or_default(),
            min_z: row.min_z.unwrap_or_default(),
            max_z: row.max_z.unwrap_or_default(),
            avg_intensity: row.avg_intensity.unwrap_or_default(),
            point_density: density.max(0) as u64,
        });

        Ok(MeasurementSummary {
            id: row.id,
            user_id: row.owner_id,
            form_id: row.form_id,
            device_address: row.device_address,
            total_points: row.total_points.max(0) as u64,
            stats,
            status,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PointRow {
    x: f64,
    y: f64,
    z: f64,
    intensity: f64,
    angle: f64,
    distance: f64,
    motor_angle: f64,
}

impl From<PointRow> for Point {
    fn from(row: PointRow) -> Self {
        Point {
            x: row.x,
            y: row.y,
            z: row.z,
            intensity: row.intensity,
            angle: row.angle,
            distance: row.distance,
            motor_angle: row.motor_angle,
        }
    }
}

/// Bulk insert `points` with sequence numbers starting at `first_seq`.
async fn insert_points(
    conn: &mut PgConnection,
    id: MeasurementId,
    first_seq: i64,
    points: &[Point],
) -> Result<(), sqlx::Error> {
    // ---
    if points.is_empty() {
        return Ok(());
    }

    let seq: Vec<i64> = (first_seq..first_seq + points.len() as i64).collect();
    let column = |field: fn(&Point) -> f64| points.iter().map(field).collect::<Vec<f64>>();

    sqlx::query(
        r#"
        INSERT INTO measurement_points (
            measurement_id, seq, x, y, z, intensity, angle, distance, motor_angle
        )
        SELECT $1::UUID, * FROM UNNEST(
            $2::BIGINT[], $3::FLOAT8[], $4::FLOAT8[], $5::FLOAT8[],
            $6::FLOAT8[], $7::FLOAT8[], $8::FLOAT8[], $9::FLOAT8[]
        )
        "#,
    )
    .bind(id)
    .bind(seq)
    .bind(column(|p| p.x))
    .bind(column(|p| p.y))
    .bind(column(|p| p.z))
    .bind(column(|p| p.intensity))
    .bind(column(|p| p.angle))
    .bind(column(|p| p.distance))
    .bind(column(|p| p.motor_angle))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl MeasurementStore for PgStore {
    // ---
    async fn find_owner(&self, token: &str) -> Result<Option<OwnerId>, StoreError> {
        // ---
        let id = sqlx::query_scalar(
            r#"
            SELECT id FROM users
            WHERE login = $1 OR display_name = $1
            ORDER BY (login = $1) DESC
            LIMIT 1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn create(
        &self,
        new: NewMeasurement,
        points: &[Point],
    ) -> Result<MeasurementId, StoreError> {
        // ---
        let id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO measurements (
                id, owner_id, form_id, device_address, total_points, status
            ) VALUES ($1, $2, $3, $4, $5, 'collecting')
            "#,
        )
        .bind(id)
        .bind(new.owner)
        .bind(new.form_id)
        .bind(&new.device_address)
        .bind(points.len() as i64)
        .execute(&mut *tx)
        .await?;

        insert_points(&mut tx, id, 0, points).await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn append_points(
        &self,
        id: MeasurementId,
        owner: OwnerId,
        points: &[Point],
    ) -> Result<Option<u64>, StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;

        // Row lock serializes appenders on the same measurement.
        let current: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT total_points FROM measurements
            WHERE id = $1 AND owner_id = $2 AND status = 'collecting'
            FOR UPDATE
            "#,
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            return Ok(None);
        };

        insert_points(&mut tx, id, current, points).await?;
        let total = current + points.len() as i64;

        sqlx::query("UPDATE measurements SET total_points = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(total)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(total as u64))
    }

    async fn find(
        &self,
        id: MeasurementId,
        owner: Option<OwnerId>,
    ) -> Result<Option<Measurement>, StoreError> {
        // ---
        let sql = format!("{SELECT_SUMMARY} WHERE id = $1 AND ($2::UUID IS NULL OR owner_id = $2)");
        let row: Option<MeasurementRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let points: Vec<PointRow> = sqlx::query_as(
            r#"
            SELECT x, y, z, intensity, angle, distance, motor_angle
            FROM measurement_points
            WHERE measurement_id = $1
            ORDER BY seq
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Measurement {
            summary: row.try_into()?,
            points: points.into_iter().map(Point::from).collect(),
        }))
    }

    async fn complete(&self, id: MeasurementId, stats: &Statistics) -> Result<bool, StoreError> {
        // ---
        let result = sqlx::query(
            r#"
            UPDATE measurements SET
                status = 'completed',
                min_x = $2, max_x = $3,
                min_y = $4, max_y = $5,
                min_z = $6, max_z = $7,
                avg_intensity = $8,
                point_density = $9,
                updated_at = now()
            WHERE id = $1 AND status = 'collecting'
            "#,
        )
        .bind(id)
        .bind(stats.min_x)
        .bind(stats.max_x)
        .bind(stats.min_y)
        .bind(stats.max_y)
        .bind(stats.min_z)
        .bind(stats.max_z)
        .bind(stats.avg_intensity)
        .bind(stats.point_density as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, id: MeasurementId, reason: &str) -> Result<bool, StoreError> {
        // ---
        let result = sqlx::query(
            r#"
            UPDATE measurements
            SET status = 'error', error_message = $2, updated_at = now()
            WHERE id = $1 AND status = 'collecting'
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(
        &self,
        owner: OwnerId,
        limit: u32,
    ) -> Result<Vec<MeasurementSummary>, StoreError> {
        // ---
        let sql = format!("{SELECT_SUMMARY} WHERE owner_id = $1 ORDER BY created_at DESC LIMIT $2");
        let rows: Vec<MeasurementRow> = sqlx::query_as(&sql)
            .bind(owner)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(MeasurementSummary::try_from).collect()
    }

    async fn delete(&self, id: MeasurementId, owner: OwnerId) -> Result<bool, StoreError> {
        // ---
        let result = sqlx::query("DELETE FROM measurements WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn stale(&self, idle: Duration) -> Result<Vec<MeasurementId>, StoreError> {
        // ---
        let idle_secs = idle.as_secs_f64();
        let ids = sqlx::query_scalar(
            r#"
            SELECT id FROM measurements
            WHERE status = 'collecting'
              AND updated_at < now() - ($1::FLOAT8 * INTERVAL '1 second')
            "#,
        )
        .bind(idle_secs)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
