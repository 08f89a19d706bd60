//! Unauthenticated relay endpoint for proxies that forward device traffic.
//!
//! The relay names the owner in the body; the token is resolved before
//! anything is converted or stored.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use super::lidar::{ingest_stream, StreamBody};
use super::reply::{success, ApiError, Success};
use super::AppState;
use crate::ingest::IngestOutcome;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/api/lidar-public/stream", post(relay))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayBody {
    // ---
    #[serde(default)]
    user_id: String,
    #[serde(flatten)]
    chunk: StreamBody,
}

async fn relay(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(body): Json<RelayBody>,
) -> Result<Json<Success<IngestOutcome>>, ApiError> {
    // ---
    if body.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("userId is required".into()));
    }

    let owner = state.ingestor.resolve(&body.user_id).await?;
    debug!("Relay chunk from {} for owner {}", peer, owner);

    let outcome = ingest_stream(&state, owner, body.chunk, peer).await?;
    Ok(success(outcome))
}
