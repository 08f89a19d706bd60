//! Periodic sweep that fails measurements left `collecting` by a device that
//! vanished without an end-of-stream.
//!
//! Works purely off persisted state, so measurements orphaned by a process
//! restart are reclaimed as well.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aggregator::Aggregator;
use crate::error::{IngestError, StoreError};
use crate::store::MeasurementStore;

/// Error reason recorded on swept measurements.
pub const ABANDONED: &str = "abandoned: no data within idle deadline";

// ---

/// Fail every measurement idle for longer than `idle`. Returns how many were failed.
pub async fn sweep(
    store: &dyn MeasurementStore,
    aggregator: &Aggregator,
    idle: Duration,
) -> Result<usize, StoreError> {
    // ---
    let stale = store.stale(idle).await?;

    let mut failed = 0;
    for id in stale {
        match aggregator.fail(id, ABANDONED).await {
            Ok(()) => failed += 1,
            // Finished between the scan and the update.
            Err(IngestError::MeasurementNotFound) => {}
            Err(IngestError::Storage(e)) => return Err(e),
            Err(e) => error!("Unexpected error failing measurement {}: {}", id, e),
        }
    }

    Ok(failed)
}

/// Run [`sweep`] every `every` until the runtime shuts down.
pub fn spawn(
    store: Arc<dyn MeasurementStore>,
    aggregator: Aggregator,
    idle: Duration,
    every: Duration,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            ticker.tick().await;
            match sweep(store.as_ref(), &aggregator, idle).await {
                Ok(0) => {}
                Ok(n) => info!("Stale sweep failed {} abandoned measurement(s)", n),
                Err(e) => error!("Stale sweep failed: {}", e),
            }
        }
    })
}
