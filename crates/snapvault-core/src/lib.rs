//! snapvault-core — face embedding comparison and match ranking.
//!
//! Holds the data contracts shared across the system (embeddings, detections,
//! candidates) and the similarity engine that ranks a query embedding against
//! an event's candidate set. Pure computation: nothing here touches storage.

pub mod detector;
pub mod ranking;
pub mod types;

pub use detector::{DetectorError, FaceDetector, MockDetector};
pub use ranking::{rank, RankError, RankParams, DEFAULT_MATCH_LIMIT, DEFAULT_MATCH_THRESHOLD};
pub use types::{
    BoundingBox, Candidate, Detection, DimensionMismatch, Embedding, EmbeddingError,
    MatchCandidate, DEFAULT_EMBEDDING_DIM,
};
