//! Route gateway (EMBP): every endpoint file exports a sub-router and this
//! module merges them over one shared [`AppState`].

use std::sync::Arc;

use axum::Router;

use crate::{Config, Ingestor, MeasurementStore, Publisher};

mod auth;
mod channel;
mod health;
mod lidar;
mod observe;
mod relay;
mod reply;

pub use auth::Claims;

// ---

#[derive(Clone)]
pub struct AppState {
    // ---
    pub ingestor: Ingestor,
    pub publisher: Publisher,
    pub store: Arc<dyn MeasurementStore>,
    pub config: Arc<Config>,
}

impl AppState {
    // ---
    pub fn new(store: Arc<dyn MeasurementStore>, config: Config) -> Self {
        // ---
        let publisher = Publisher::new(config.fanout_capacity);
        Self {
            ingestor: Ingestor::new(store.clone(), publisher.clone()),
            publisher,
            store,
            config: Arc::new(config),
        }
    }
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(lidar::router())
        .merge(relay::router())
        .merge(channel::router())
        .merge(observe::router())
        .merge(health::router())
        .with_state(state)
}
