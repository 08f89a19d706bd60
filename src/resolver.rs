//! Maps a caller-supplied owner token to a canonical owner identity.
//!
//! Devices cannot be trusted to hold the canonical id, so they may identify
//! by login or display name instead. A token that already is an id is taken
//! as-is without a lookup.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::OwnerId;
use crate::store::MeasurementStore;

// ---

#[derive(Clone)]
pub struct SessionResolver {
    // ---
    store: Arc<dyn MeasurementStore>,
}

impl SessionResolver {
    // ---
    pub fn new(store: Arc<dyn MeasurementStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, token: &str) -> Result<OwnerId, IngestError> {
        // ---
        let token = token.trim();
        if token.is_empty() {
            return Err(IngestError::UnknownOwner(String::new()));
        }

        if let Ok(id) = Uuid::try_parse(token) {
            return Ok(id);
        }

        let owner = self
            .store
            .find_owner(token)
            .await?
            .ok_or_else(|| IngestError::UnknownOwner(token.to_string()))?;

        debug!("Resolved owner token `{}` to {}", token, owner);
        Ok(owner)
    }
}
