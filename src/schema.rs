//! Database schema management for `lidarflow`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` when the PostgreSQL backend is
//! selected.

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates `users` (owner directory used by the session resolver),
/// `measurements` (one row per scan session, statistics inline) and
/// `measurement_points` (the point cloud, one row per point). Safe to call
/// on every startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Owners. Credential columns belong to the auth service, not to us.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id           UUID PRIMARY KEY,
            login        TEXT        NOT NULL UNIQUE,
            display_name TEXT        NOT NULL,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurements (
            id             UUID PRIMARY KEY,
            owner_id       UUID        NOT NULL,
            form_id        UUID,
            device_address TEXT        NOT NULL,
            total_points   BIGINT      NOT NULL DEFAULT 0,
            status         TEXT        NOT NULL DEFAULT 'collecting'
                           CHECK (status IN ('collecting', 'completed', 'error')),
            error_message  TEXT,
            min_x          DOUBLE PRECISION,
            max_x          DOUBLE PRECISION,
            min_y          DOUBLE PRECISION,
            max_y          DOUBLE PRECISION,
            min_z          DOUBLE PRECISION,
            max_z          DOUBLE PRECISION,
            avg_intensity  DOUBLE PRECISION,
            point_density  BIGINT,
            created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at     TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurement_points (
            measurement_id UUID   NOT NULL REFERENCES measurements (id) ON DELETE CASCADE,
            seq            BIGINT NOT NULL,
            x              DOUBLE PRECISION NOT NULL,
            y              DOUBLE PRECISION NOT NULL,
            z              DOUBLE PRECISION NOT NULL,
            intensity      DOUBLE PRECISION NOT NULL,
            angle          DOUBLE PRECISION NOT NULL,
            distance       DOUBLE PRECISION NOT NULL,
            motor_angle    DOUBLE PRECISION NOT NULL,
            PRIMARY KEY (measurement_id, seq)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Listing is newest-first per owner
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_measurements_owner_created
            ON measurements (owner_id, created_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_measurements_form_id
            ON measurements (form_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Stale sweep scans open measurements by age
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_measurements_collecting
            ON measurements (updated_at)
            WHERE status = 'collecting';
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Insert owners from `login[:display name]` entries, skipping existing logins.
pub async fn seed_owners(pool: &PgPool, entries: &[String]) -> Result<()> {
    // ---
    for entry in entries {
        let (login, display_name) = split_owner_entry(entry);
        sqlx::query(
            r#"
            INSERT INTO users (id, login, display_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (login) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4())
        .bind(login)
        .bind(display_name)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// `"alice:Alice Martin"` → `("alice", "Alice Martin")`; a bare login is its own display name.
pub fn split_owner_entry(entry: &str) -> (&str, &str) {
    // ---
    match entry.split_once(':') {
        Some((login, name)) if !name.trim().is_empty() => (login.trim(), name.trim()),
        Some((login, _)) => (login.trim(), login.trim()),
        None => (entry.trim(), entry.trim()),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_split_owner_entry() {
        // ---
        assert_eq!(split_owner_entry("alice:Alice Martin"), ("alice", "Alice Martin"));
        assert_eq!(split_owner_entry("bob"), ("bob", "bob"));
        assert_eq!(split_owner_entry(" carol : "), ("carol", "carol"));
    }
}
