//! Bidirectional device channel over WebSocket (`/ws/device`).
//!
//! Carries the same wire format as the raw listener, framed as JSON events:
//!
//! ```text
//! -> {"event":"lidar:data","data":{"rawData":"0,1000,50,0;","isLast":false}}
//! <- {"event":"measurement_created","data":{"measurementId":"...","totalPoints":1,...}}
//! -> {"event":"lidar:end"}
//! <- {"event":"lidar:ack","data":{"measurementId":"...","status":"completed",...}}
//! ```
//!
//! Each `lidar:data` payload is a complete batch. Binary frames are raw wire
//! bytes and go through the reassembler, so records may span frames.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::reply::ApiError;
use super::AppState;
use crate::device::{IDLE_REASON, MAX_FRAGMENT};
use crate::error::IngestError;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::models::{MeasurementId, OwnerId};
use crate::session::IngestSession;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/device", get(upgrade))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelQuery {
    owner: String,
    form_id: Option<Uuid>,
    robot_ip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    // ---
    #[serde(default)]
    pub raw_data: String,
    pub measurement_id: Option<MeasurementId>,
    #[serde(default)]
    pub is_last: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ChannelRequest {
    #[serde(rename = "lidar:data")]
    Data(DataPayload),
    #[serde(rename = "lidar:end")]
    End,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ChannelReply {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { user_id: OwnerId },
    #[serde(rename = "measurement_created")]
    Created(IngestOutcome),
    #[serde(rename = "lidar:ack")]
    Ack(IngestOutcome),
    #[serde(rename = "error")]
    Error { kind: &'static str, message: String },
}

/// Resolve the owner, then upgrade. Unknown owners never get a socket.
async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<ChannelQuery>,
) -> Result<Response, ApiError> {
    // ---
    let owner = state.ingestor.resolve(&query.owner).await?;
    let device = query.robot_ip.unwrap_or_else(|| peer.ip().to_string());
    let session = IngestSession::new(owner, device).with_form(query.form_id);

    let ingestor = state.ingestor.clone();
    let idle = state.config.session_idle;
    Ok(ws.on_upgrade(move |socket| run(socket, session, ingestor, idle)))
}

async fn run(mut socket: WebSocket, mut session: IngestSession, ingestor: Ingestor, idle: Duration) {
    // ---
    info!("Device channel open for owner {}", session.owner());
    let hello = ChannelReply::Connected {
        user_id: session.owner(),
    };
    if send(&mut socket, &hello).await.is_err() {
        return;
    }

    loop {
        let message = match timeout(idle, socket.recv()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Device channel receive failed: {}", e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!("Device channel idle for {:?}, closing", idle);
                session.abandon(&ingestor, IDLE_REASON).await;
                return;
            }
        };

        let reply = match message {
            Message::Text(text) => match serde_json::from_str::<ChannelRequest>(text.as_str()) {
                Ok(request) => handle_request(&mut session, &ingestor, request).await,
                Err(e) => Some(ChannelReply::Error {
                    kind: "bad_request",
                    message: e.to_string(),
                }),
            },
            Message::Binary(bytes) => handle_binary(&mut session, &ingestor, &bytes).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Some(reply) = reply {
            if send(&mut socket, &reply).await.is_err() {
                break;
            }
        }

        if session.pending_len() > MAX_FRAGMENT {
            warn!("Device channel fragment exceeds {} bytes, closing", MAX_FRAGMENT);
            let oversized = ChannelReply::Error {
                kind: "oversized_record",
                message: "record exceeds 1 MiB without delimiter".into(),
            };
            let _ = send(&mut socket, &oversized).await;
            break;
        }
    }

    session.close(&ingestor).await;
}

/// Apply one decoded event to the session.
pub async fn handle_request(
    session: &mut IngestSession,
    ingestor: &Ingestor,
    request: ChannelRequest,
) -> Option<ChannelReply> {
    // ---
    let result = match request {
        ChannelRequest::Data(payload) => {
            if let Some(id) = payload.measurement_id {
                session.resume(id);
            }
            session
                .feed_batch(ingestor, &payload.raw_data, payload.is_last)
                .await
        }
        ChannelRequest::End => session.end(ingestor).await,
    };
    reply_for(result)
}

pub async fn handle_binary(
    session: &mut IngestSession,
    ingestor: &Ingestor,
    bytes: &[u8],
) -> Option<ChannelReply> {
    reply_for(session.feed(ingestor, bytes, false).await)
}

fn reply_for(result: Result<Option<IngestOutcome>, IngestError>) -> Option<ChannelReply> {
    // ---
    match result {
        Ok(Some(outcome)) if outcome.created => Some(ChannelReply::Created(outcome)),
        Ok(Some(outcome)) => Some(ChannelReply::Ack(outcome)),
        Ok(None) => None,
        Err(e) => Some(ChannelReply::Error {
            kind: e.kind(),
            message: e.to_string(),
        }),
    }
}

async fn send(socket: &mut WebSocket, reply: &ChannelReply) -> Result<(), axum::Error> {
    // ---
    let text = serde_json::to_string(reply).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}
