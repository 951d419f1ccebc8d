//! snapvault-store — persistence for events, photos, detections, and matches.
//!
//! Two contracts: [`EmbeddingStore`] owns the event/photo/detection side and
//! assembles candidate sets, [`MatchLedger`] owns accepted-match bookkeeping.
//! [`SqliteStore`] implements both over one serialized SQLite connection;
//! [`MemoryStore`] implements both in memory so the orchestration layer can be
//! tested without a database.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snapvault_core::{Candidate, Detection};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event not found: {0}")]
    EventNotFound(i64),
    #[error("photo not found: {0}")]
    PhotoNotFound(i64),
    #[error("event code already in use: {0}")]
    DuplicateEventCode(String),
    #[error("corrupt stored record for face {face_id}: {reason}")]
    CorruptRecord { face_id: i64, reason: String },
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

/// Lifecycle of a photo from upload to candidate eligibility.
///
/// Only `Processed` photos contribute detections to a candidate set. `Failed`
/// records the exhaustion of ingest retries instead of a silently dropped
/// background error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoStatus {
    Pending,
    Processed,
    Failed,
}

impl PhotoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhotoStatus::Pending => "pending",
            PhotoStatus::Processed => "processed",
            PhotoStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(PhotoStatus::Pending),
            "processed" => Ok(PhotoStatus::Processed),
            "failed" => Ok(PhotoStatus::Failed),
            _ => Err(StoreError::InvalidValue(format!(
                "unknown photo status: {value}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub name: String,
    /// Access code attendees type in; stored uppercase.
    pub code: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Photo {
    pub id: i64,
    pub event_id: i64,
    pub filename: String,
    pub uploaded_by: String,
    pub status: PhotoStatus,
    pub created_at: DateTime<Utc>,
}

/// A persisted, accepted pairing of a searching identity with a target photo.
///
/// Append-only except for the `notified` flag. Deleted only as a cascading
/// side effect of deleting the owning photo or event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: i64,
    pub requester: String,
    pub photo_id: i64,
    pub event_id: i64,
    /// Match confidence as an integer percentage, `round(score × 100)`.
    pub confidence_percent: u8,
    /// Opaque reference to the query selfie, if retained.
    pub selfie_ref: Option<String>,
    pub notified: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for one accepted match.
#[derive(Debug, Clone)]
pub struct NewMatch {
    pub requester: String,
    pub photo_id: i64,
    pub event_id: i64,
    pub confidence_percent: u8,
    pub selfie_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub events: u64,
    pub photos: u64,
    pub processed_photos: u64,
    pub detections: u64,
    pub matches: u64,
}

/// Persistence contract for events, photos, and face detections.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn create_event(
        &self,
        name: &str,
        code: &str,
        description: Option<&str>,
    ) -> Result<Event, StoreError>;
    async fn event(&self, id: i64) -> Result<Option<Event>, StoreError>;
    /// Codes are matched case-insensitively (normalized to uppercase).
    async fn event_by_code(&self, code: &str) -> Result<Option<Event>, StoreError>;
    async fn list_events(&self) -> Result<Vec<Event>, StoreError>;
    async fn set_event_active(&self, id: i64, active: bool) -> Result<bool, StoreError>;
    /// Deletes the event and, by cascade, its photos, detections, and matches.
    async fn delete_event(&self, id: i64) -> Result<bool, StoreError>;

    /// Creates the photo in `Pending` state.
    async fn create_photo(
        &self,
        event_id: i64,
        filename: &str,
        uploaded_by: &str,
    ) -> Result<Photo, StoreError>;
    async fn photo(&self, id: i64) -> Result<Option<Photo>, StoreError>;
    async fn event_photos(&self, event_id: i64) -> Result<Vec<Photo>, StoreError>;
    async fn set_photo_status(&self, id: i64, status: PhotoStatus) -> Result<bool, StoreError>;
    /// Deletes the photo and, by cascade, its detections and matches.
    async fn delete_photo(&self, id: i64) -> Result<bool, StoreError>;

    /// Records one detected face. Duplicates are tolerated: each row is an
    /// independent comparison candidate.
    async fn record_detection(
        &self,
        photo_id: i64,
        detection: &Detection,
    ) -> Result<i64, StoreError>;
    /// All detections belonging to processed photos of the event, in no
    /// guaranteed order; the ranking engine re-sorts.
    async fn candidate_set(&self, event_id: i64) -> Result<Vec<Candidate>, StoreError>;
}

/// Persistence contract for accepted matches.
#[async_trait]
pub trait MatchLedger: Send + Sync {
    /// Records every match of one search in a single transaction, so an
    /// abandoned search never leaves partial rows behind.
    async fn record_matches(&self, matches: &[NewMatch]) -> Result<Vec<i64>, StoreError>;
    async fn matches_for_requester(&self, requester: &str) -> Result<Vec<MatchRecord>, StoreError>;
    async fn matches_for_event(&self, event_id: i64) -> Result<Vec<MatchRecord>, StoreError>;
    /// Flips the `notified` flag, the only mutation a match record permits.
    async fn mark_notified(&self, match_id: i64) -> Result<bool, StoreError>;
    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

pub(crate) fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Stored detection confidence is an integer percentage.
pub(crate) fn confidence_to_percent(confidence: f32) -> u8 {
    (confidence.clamp(0.0, 1.0) * 100.0).round() as u8
}
