//! Fan-out of measurement state changes to observer clients.
//!
//! Backed by a `tokio::sync::broadcast` channel: sending never waits on a
//! receiver, and a receiver that falls more than `capacity` updates behind
//! skips ahead instead of holding up the ingest path. Every observer sees
//! every owner's updates; dashboards filter on `userId` themselves.

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::MeasurementUpdate;

// ---

#[derive(Debug, Clone)]
pub struct Publisher {
    // ---
    tx: broadcast::Sender<MeasurementUpdate>,
}

impl Publisher {
    // ---
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire and forget. Having no observers is not an error.
    pub fn publish(&self, update: MeasurementUpdate) {
        // ---
        match self.tx.send(update) {
            Ok(observers) => trace!("Published update to {} observer(s)", observers),
            Err(_) => trace!("No observers connected, update dropped"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeasurementUpdate> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::MeasurementStatus;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};
    use uuid::Uuid;

    fn update(total_points: u64) -> MeasurementUpdate {
        // ---
        MeasurementUpdate {
            measurement_id: Uuid::nil(),
            user_id: Uuid::nil(),
            total_points,
            status: MeasurementStatus::Collecting,
            stats: None,
        }
    }

    #[test]
    fn test_publish_without_observers_is_silent() {
        // ---
        let publisher = Publisher::new(4);
        publisher.publish(update(1));
        assert_eq!(publisher.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_every_observer_receives_every_update() {
        // ---
        let publisher = Publisher::new(4);
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.publish(update(7));

        assert_eq!(a.recv().await.unwrap().total_points, 7);
        assert_eq!(b.recv().await.unwrap().total_points, 7);
        assert!(matches!(a.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_slow_observer_lags_instead_of_blocking() {
        // ---
        let publisher = Publisher::new(2);
        let mut slow = publisher.subscribe();

        for n in 0..5 {
            publisher.publish(update(n));
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(slow.recv().await.unwrap().total_points, 3);
    }
}
