//! Live measurement updates for dashboards (`/ws/observe`).
//!
//! Each observer gets its own broadcast receiver. An observer that falls
//! behind skips what it missed and carries on; it never slows ingest down.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use super::AppState;
use crate::models::MeasurementUpdate;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/observe", get(upgrade))
}

/// Frame sent to observers: `{"event":"lidar:update","data":{...}}`.
#[derive(Debug, Serialize)]
pub struct UpdateEvent<'a> {
    event: &'static str,
    data: &'a MeasurementUpdate,
}

impl<'a> UpdateEvent<'a> {
    pub fn new(data: &'a MeasurementUpdate) -> Self {
        Self {
            event: "lidar:update",
            data,
        }
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // ---
    let updates = state.publisher.subscribe();
    ws.on_upgrade(move |socket| run(socket, updates))
}

async fn run(mut socket: WebSocket, mut updates: broadcast::Receiver<MeasurementUpdate>) {
    // ---
    info!("Observer connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    let Ok(text) = serde_json::to_string(&UpdateEvent::new(&update)) else {
                        continue;
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Observer lagged, skipped {} update(s)", missed);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Observer receive failed: {}", e);
                    break;
                }
            },
        }
    }

    info!("Observer disconnected");
}
