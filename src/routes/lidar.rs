//! Authenticated scan endpoints under `/api/lidar`.
//!
//! Owner identity comes from the session token, so these handlers never
//! touch the Session Resolver.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::auth::AuthUser;
use super::reply::{success, ApiError, Success};
use super::AppState;
use crate::convert::convert_batch;
use crate::ingest::{Batch, IngestOutcome};
use crate::models::{Measurement, MeasurementId, MeasurementSummary, OwnerId, Statistics};

/// Page size of the measurement list.
const LIST_LIMIT: u32 = 100;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/api/lidar/measurements", post(create).get(list))
        .route("/api/lidar/measurements/{id}", get(fetch).delete(remove))
        .route("/api/lidar/stream", post(stream))
}

/// Body of the streaming endpoints. Every chunk must hold whole records.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBody {
    // ---
    #[serde(default)]
    pub raw_data: String,
    pub measurement_id: Option<MeasurementId>,
    pub form_id: Option<Uuid>,
    pub robot_ip: Option<String>,
    #[serde(default)]
    pub is_last: bool,
}

/// Convert and ingest one streamed chunk for `owner`.
pub async fn ingest_stream(
    state: &AppState,
    owner: OwnerId,
    body: StreamBody,
    peer: SocketAddr,
) -> Result<IngestOutcome, ApiError> {
    // ---
    let conversion = convert_batch(&body.raw_data);
    debug!(
        "Stream chunk from {}: {} records, {} points",
        peer,
        conversion.records,
        conversion.points.len()
    );

    let batch = Batch {
        measurement_id: body.measurement_id,
        form_id: body.form_id,
        device_address: body.robot_ip.unwrap_or_else(|| peer.ip().to_string()),
        conversion,
        is_last: body.is_last,
    };
    Ok(state.ingestor.ingest(owner, batch).await?)
}

async fn stream(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    user: AuthUser,
    Json(body): Json<StreamBody>,
) -> Result<Json<Success<IngestOutcome>>, ApiError> {
    // ---
    let outcome = ingest_stream(&state, user.id, body, peer).await?;
    Ok(success(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    raw_data: String,
    form_id: Option<Uuid>,
    robot_ip: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Created {
    id: MeasurementId,
    total_points: u64,
    stats: Option<Statistics>,
}

/// `POST /api/lidar/measurements`: a whole scan in one request.
async fn create(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    user: AuthUser,
    Json(body): Json<CreateBody>,
) -> Result<Json<Success<Created>>, ApiError> {
    // ---
    let body = StreamBody {
        raw_data: body.raw_data,
        measurement_id: None,
        form_id: body.form_id,
        robot_ip: body.robot_ip,
        is_last: true,
    };
    let outcome = ingest_stream(&state, user.id, body, peer).await?;
    info!(
        "{} uploaded measurement {} with {} points",
        user.name(), outcome.measurement_id, outcome.total_points
    );

    Ok(success(Created {
        id: outcome.measurement_id,
        total_points: outcome.total_points,
        stats: outcome.stats,
    }))
}

async fn list(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<Success<Vec<MeasurementSummary>>>, ApiError> {
    // ---
    let summaries = state.store.list(user.id, LIST_LIMIT).await?;
    Ok(success(summaries))
}

async fn fetch(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<MeasurementId>,
) -> Result<Json<Success<Measurement>>, ApiError> {
    // ---
    let measurement = state
        .store
        .find(id, Some(user.id))
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(success(measurement))
}

#[derive(Debug, Serialize)]
struct Deleted {
    id: MeasurementId,
}

async fn remove(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<MeasurementId>,
) -> Result<Json<Success<Deleted>>, ApiError> {
    // ---
    if !state.store.delete(id, user.id).await? {
        return Err(ApiError::NotFound);
    }
    info!("{} deleted measurement {}", user.name(), id);
    Ok(success(Deleted { id }))
}
