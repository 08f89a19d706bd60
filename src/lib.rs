//! `lidarflow`: ingest service for streamed LiDAR scans.
//!
//! Samples arrive over a raw TCP connection, a WebSocket channel or HTTP,
//! are reassembled into records, converted into Cartesian points and
//! accumulated into measurements that are persisted and fanned out to live
//! observers.
//!
//! Module layout follows the Explicit Module Boundary Pattern (EMBP): each
//! module exports a narrow surface and this gateway re-exports what the
//! binary and the integration tests need.

pub mod aggregator;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod ingest;
pub mod models;
pub mod publisher;
pub mod reaper;
pub mod reassembler;
pub mod resolver;
pub mod routes;
pub mod schema;
pub mod session;
pub mod store;

pub use config::Config;
pub use error::{IngestError, StoreError};
pub use ingest::Ingestor;
pub use publisher::Publisher;
pub use routes::AppState;
pub use store::{MeasurementStore, MemoryStore, PgStore};
