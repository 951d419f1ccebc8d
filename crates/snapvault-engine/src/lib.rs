//! snapvault-engine — orchestration over detector, store, and ranking.
//!
//! Wires the pieces together: the selfie search pipeline (detect → fetch
//! candidates → rank → persist accepted matches) and the background ingest
//! worker that processes uploaded photos fire-and-forget with bounded
//! retries.

pub mod config;
pub mod engine;
pub mod ingest;

pub use config::{Config, ConfigError};
pub use engine::{AcceptedMatch, EngineError, SearchEngine, SearchOutcome};
pub use ingest::{spawn_ingest_worker, IngestHandle, IngestJob};
