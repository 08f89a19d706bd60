//! Per-connection ingest state for streaming front ends.
//!
//! Owns the reassembler's trailing fragment, a packet counter and the id of
//! the measurement currently being written. Nothing here outlives the
//! connection; whether a measurement is still open is always decided by the
//! store.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::convert::convert_records;
use crate::error::IngestError;
use crate::ingest::{Batch, IngestOutcome, Ingestor};
use crate::models::{MeasurementId, MeasurementStatus, OwnerId};
use crate::reassembler::{split_batch, Reassembler};

// ---

#[derive(Debug)]
pub struct IngestSession {
    // ---
    owner: OwnerId,
    device_address: String,
    form_id: Option<Uuid>,
    reassembler: Reassembler,
    packets: u64,
    measurement_id: Option<MeasurementId>,
}

impl IngestSession {
    // ---
    pub fn new(owner: OwnerId, device_address: impl Into<String>) -> Self {
        Self::with_reassembler(owner, device_address, Reassembler::new())
    }

    /// Take over a reassembler that already holds part of the stream.
    pub fn with_reassembler(
        owner: OwnerId,
        device_address: impl Into<String>,
        reassembler: Reassembler,
    ) -> Self {
        // ---
        Self {
            owner,
            device_address: device_address.into(),
            form_id: None,
            reassembler,
            packets: 0,
            measurement_id: None,
        }
    }

    pub fn with_form(mut self, form_id: Option<Uuid>) -> Self {
        self.form_id = form_id;
        self
    }

    /// Continue an existing measurement instead of opening a new one.
    pub fn resume(&mut self, id: MeasurementId) {
        self.measurement_id = Some(id);
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn measurement_id(&self) -> Option<MeasurementId> {
        self.measurement_id
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn pending_len(&self) -> usize {
        self.reassembler.pending_len()
    }

    /// Reassemble a chunk without ingesting it.
    pub fn reassemble(&mut self, chunk: &[u8]) -> Vec<String> {
        self.reassembler.push(chunk).collect()
    }

    /// Reassemble and ingest a chunk. `is_last` flushes the trailing fragment
    /// and finalizes the measurement.
    pub async fn feed(
        &mut self,
        ingestor: &Ingestor,
        chunk: &[u8],
        is_last: bool,
    ) -> Result<Option<IngestOutcome>, IngestError> {
        // ---
        let mut records = self.reassemble(chunk);
        if is_last {
            records.extend(self.reassembler.flush());
        }
        self.ingest_records(ingestor, records, is_last).await
    }

    /// Ingest a self-contained batch. The text is split on its own and never
    /// joined with the fragment held back from earlier chunks; `is_last`
    /// still flushes that fragment as a record of its own.
    pub async fn feed_batch(
        &mut self,
        ingestor: &Ingestor,
        raw: &str,
        is_last: bool,
    ) -> Result<Option<IngestOutcome>, IngestError> {
        // ---
        let mut records = Vec::new();
        if is_last {
            records.extend(self.reassembler.flush());
        }
        records.extend(split_batch(raw));
        self.ingest_records(ingestor, records, is_last).await
    }

    /// Ingest already reassembled records as one batch. The held-back
    /// fragment is left alone; `is_last` only finalizes.
    ///
    /// Returns `Ok(None)` when there was nothing to write: no complete record
    /// yet and nothing to close.
    pub async fn ingest_records(
        &mut self,
        ingestor: &Ingestor,
        records: Vec<String>,
        is_last: bool,
    ) -> Result<Option<IngestOutcome>, IngestError> {
        // ---
        self.packets += 1;

        let conversion = convert_records(&records);
        if conversion.points.is_empty() {
            match self.measurement_id {
                None if conversion.records > 0 => return Err(IngestError::NoValidPoints),
                None => return Ok(None),
                Some(_) if conversion.records == 0 && !is_last => return Ok(None),
                // An empty append still has the store confirm the measurement is open.
                Some(_) => {}
            }
        }

        let batch = Batch {
            measurement_id: self.measurement_id,
            form_id: self.form_id,
            device_address: self.device_address.clone(),
            conversion,
            is_last,
        };

        match ingestor.ingest(self.owner, batch).await {
            Ok(outcome) => {
                self.measurement_id = match outcome.status {
                    MeasurementStatus::Collecting => Some(outcome.measurement_id),
                    _ => None,
                };
                debug!(
                    "Packet {} from {}: measurement {} at {} points",
                    self.packets, self.device_address, outcome.measurement_id, outcome.total_points
                );
                Ok(Some(outcome))
            }
            Err(IngestError::MeasurementNotFound) => {
                self.measurement_id = None;
                Err(IngestError::MeasurementNotFound)
            }
            // Storage failures keep the active id so the device can carry on.
            Err(e) => Err(e),
        }
    }

    /// End of stream: flush the fragment and finalize whatever is open.
    pub async fn end(&mut self, ingestor: &Ingestor) -> Result<Option<IngestOutcome>, IngestError> {
        self.feed(ingestor, b"", true).await
    }

    /// Connection closed. Finalizes an open measurement; errors are logged
    /// because there is nobody left to report them to.
    pub async fn close(mut self, ingestor: &Ingestor) {
        // ---
        match self.end(ingestor).await {
            Ok(Some(outcome)) => info!(
                "Session for {} closed, measurement {} finalized with {} points",
                self.device_address, outcome.measurement_id, outcome.total_points
            ),
            Ok(None) => info!(
                "Session for {} closed after {} packets",
                self.device_address, self.packets
            ),
            Err(e) => warn!("Session for {} closed with error: {}", self.device_address, e),
        }
    }

    /// Give up on the open measurement, marking it errored with `reason`.
    pub async fn abandon(self, ingestor: &Ingestor, reason: &str) {
        // ---
        let Some(id) = self.measurement_id else {
            return;
        };
        if let Err(e) = ingestor.aggregator().fail(id, reason).await {
            warn!("Could not mark measurement {} as failed: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::publisher::Publisher;
    use crate::error::StoreError;
    use crate::models::{Measurement, MeasurementSummary, NewMeasurement, Point, Statistics};
    use crate::store::{MeasurementStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Memory store whose appends fail while `fail_appends` is set.
    struct FlakyStore {
        inner: MemoryStore,
        fail_appends: AtomicBool,
    }

    #[async_trait]
    impl MeasurementStore for FlakyStore {
        async fn find_owner(&self, token: &str) -> Result<Option<OwnerId>, StoreError> {
            self.inner.find_owner(token).await
        }

        async fn create(
            &self,
            new: NewMeasurement,
            points: &[Point],
        ) -> Result<MeasurementId, StoreError> {
            self.inner.create(new, points).await
        }

        async fn append_points(
            &self,
            id: MeasurementId,
            owner: OwnerId,
            points: &[Point],
        ) -> Result<Option<u64>, StoreError> {
            // ---
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::Corrupt("disk full".into()));
            }
            self.inner.append_points(id, owner, points).await
        }

        async fn find(
            &self,
            id: MeasurementId,
            owner: Option<OwnerId>,
        ) -> Result<Option<Measurement>, StoreError> {
            self.inner.find(id, owner).await
        }

        async fn complete(&self, id: MeasurementId, stats: &Statistics) -> Result<bool, StoreError> {
            self.inner.complete(id, stats).await
        }

        async fn fail(&self, id: MeasurementId, reason: &str) -> Result<bool, StoreError> {
            self.inner.fail(id, reason).await
        }

        async fn list(
            &self,
            owner: OwnerId,
            limit: u32,
        ) -> Result<Vec<MeasurementSummary>, StoreError> {
            self.inner.list(owner, limit).await
        }

        async fn delete(&self, id: MeasurementId, owner: OwnerId) -> Result<bool, StoreError> {
            self.inner.delete(id, owner).await
        }

        async fn stale(&self, idle: Duration) -> Result<Vec<MeasurementId>, StoreError> {
            self.inner.stale(idle).await
        }
    }

    fn setup() -> (Ingestor, Arc<MemoryStore>) {
        // ---
        let store = Arc::new(MemoryStore::new());
        (Ingestor::new(store.clone(), Publisher::new(16)), store)
    }

    #[tokio::test]
    async fn test_fragments_across_chunks() {
        // ---
        let (ingestor, store) = setup();
        let mut session = IngestSession::new(Uuid::new_v4(), "10.1.1.1");

        assert!(session.feed(&ingestor, b"0,10", false).await.unwrap().is_none());
        let opened = session
            .feed(&ingestor, b"00,50,0;20,6", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.total_points, 1);
        assert_eq!(session.measurement_id(), Some(opened.measurement_id));

        let closed = session.feed(&ingestor, b"00,40,0", true).await.unwrap().unwrap();
        assert_eq!(closed.total_points, 2);
        assert_eq!(closed.status, MeasurementStatus::Completed);
        assert_eq!(session.measurement_id(), None);
        assert_eq!(session.packets(), 3);

        let m = store.find(closed.measurement_id, None).await.unwrap().unwrap();
        assert_eq!(m.points[1].distance, 600.0);
    }

    #[tokio::test]
    async fn test_invalid_opening_packet_is_reported_and_session_survives() {
        // ---
        let (ingestor, _) = setup();
        let mut session = IngestSession::new(Uuid::new_v4(), "10.1.1.1");

        let err = session.feed(&ingestor, b"0,0,5,0;", false).await.unwrap_err();
        assert!(matches!(err, IngestError::NoValidPoints));
        assert_eq!(session.measurement_id(), None);

        let opened = session.feed(&ingestor, b"0,800,5,0;", false).await.unwrap();
        assert!(opened.unwrap().created);
    }

    #[tokio::test]
    async fn test_resume_of_frozen_measurement_is_refused() {
        // ---
        let (ingestor, store) = setup();
        let owner = Uuid::new_v4();
        let mut first = IngestSession::new(owner, "dev");
        let done = first
            .feed(&ingestor, b"0,1000,5,0;", true)
            .await
            .unwrap()
            .unwrap();

        let mut second = IngestSession::new(owner, "dev");
        second.resume(done.measurement_id);
        let err = second.feed(&ingestor, b"0,900,5,0;", false).await.unwrap_err();

        assert!(matches!(err, IngestError::MeasurementNotFound));
        assert_eq!(second.measurement_id(), None);
        let m = store.find(done.measurement_id, None).await.unwrap().unwrap();
        assert_eq!(m.summary.total_points, 1);
    }

    #[tokio::test]
    async fn test_close_finalizes_open_measurement() {
        // ---
        let (ingestor, store) = setup();
        let mut session = IngestSession::new(Uuid::new_v4(), "dev");
        let opened = session
            .feed(&ingestor, b"0,1000,5,0;0,2000,7,0", false)
            .await
            .unwrap()
            .unwrap();

        session.close(&ingestor).await;

        let m = store.find(opened.measurement_id, None).await.unwrap().unwrap();
        assert_eq!(m.status(), MeasurementStatus::Completed);
        assert_eq!(m.summary.total_points, 2);
    }

    #[tokio::test]
    async fn test_abandon_marks_error_and_keeps_points() {
        // ---
        let (ingestor, store) = setup();
        let mut session = IngestSession::new(Uuid::new_v4(), "dev");
        let opened = session
            .feed(&ingestor, b"0,1000,5,0;", false)
            .await
            .unwrap()
            .unwrap();

        session.abandon(&ingestor, "idle timeout").await;

        let m = store.find(opened.measurement_id, None).await.unwrap().unwrap();
        assert_eq!(m.status(), MeasurementStatus::Error);
        assert_eq!(m.summary.error_message.as_deref(), Some("idle timeout"));
        assert_eq!(m.points.len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_measurement_for_retry() {
        // ---
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_appends: AtomicBool::new(false),
        });
        let ingestor = Ingestor::new(store.clone(), Publisher::new(16));
        let mut session = IngestSession::new(Uuid::new_v4(), "dev");

        let opened = session
            .feed(&ingestor, b"0,1000,5,0;", false)
            .await
            .unwrap()
            .unwrap();

        store.fail_appends.store(true, Ordering::SeqCst);
        let err = session.feed(&ingestor, b"0,1100,5,0;", false).await.unwrap_err();
        assert!(matches!(err, IngestError::Storage(_)));
        assert_eq!(session.measurement_id(), Some(opened.measurement_id));

        store.fail_appends.store(false, Ordering::SeqCst);
        let retried = session
            .feed(&ingestor, b"0,1200,5,0;", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.measurement_id, opened.measurement_id);
        assert_eq!(retried.total_points, 2);
        assert!(!retried.created);
    }

    #[tokio::test]
    async fn test_invalid_packet_on_frozen_measurement_is_reported() {
        // ---
        let (ingestor, store) = setup();
        let mut session = IngestSession::new(Uuid::new_v4(), "dev");
        let opened = session
            .feed(&ingestor, b"0,1000,5,0;", false)
            .await
            .unwrap()
            .unwrap();

        ingestor
            .aggregator()
            .fail(opened.measurement_id, "operator stop")
            .await
            .unwrap();

        let err = session.feed(&ingestor, b"0,0,5,0;", false).await.unwrap_err();
        assert!(matches!(err, IngestError::MeasurementNotFound));
        assert_eq!(session.measurement_id(), None);

        let m = store.find(opened.measurement_id, None).await.unwrap().unwrap();
        assert_eq!(m.status(), MeasurementStatus::Error);
        assert_eq!(m.points.len(), 1);
    }

    #[tokio::test]
    async fn test_fragment_only_read_on_open_measurement_is_silent() {
        // ---
        let (ingestor, _) = setup();
        let mut session = IngestSession::new(Uuid::new_v4(), "dev");
        session.feed(&ingestor, b"0,1000,5,0;", false).await.unwrap();

        assert!(session.feed(&ingestor, b"0,20", false).await.unwrap().is_none());
        assert_eq!(session.pending_len(), 4);
    }

    #[tokio::test]
    async fn test_feed_batch_ignores_held_back_fragment() {
        // ---
        let (ingestor, store) = setup();
        let mut session = IngestSession::new(Uuid::new_v4(), "dev");

        let opened = session
            .feed_batch(&ingestor, "0,1000,50,0", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.total_points, 1);

        let done = session
            .feed_batch(&ingestor, "90,2000,60,0", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.total_points, 2);

        let m = store.find(done.measurement_id, None).await.unwrap().unwrap();
        assert_eq!(m.points[0].distance, 1000.0);
        assert_eq!(m.points[1].distance, 2000.0);
    }
}
