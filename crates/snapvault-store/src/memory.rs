//! In-memory store, mirroring the SQLite implementation's semantics
//! (code normalization, cascade deletes, processed-only candidate sets).
//! Used by orchestration tests and ephemeral tooling.

use crate::{
    normalize_code, EmbeddingStore, Event, MatchLedger, MatchRecord, NewMatch, Photo, PhotoStatus,
    StoreError, StoreStats,
};
use async_trait::async_trait;
use chrono::Utc;
use snapvault_core::{Candidate, Detection};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct StoredFace {
    id: i64,
    photo_id: i64,
    detection: Detection,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    events: Vec<Event>,
    photos: Vec<Photo>,
    faces: Vec<StoredFace>,
    matches: Vec<MatchRecord>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Mutex-guarded in-memory implementation of both store contracts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a holder panicked; the data itself
        // is still consistent for these append-mostly records.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EmbeddingStore for MemoryStore {
    async fn create_event(
        &self,
        name: &str,
        code: &str,
        description: Option<&str>,
    ) -> Result<Event, StoreError> {
        let code = normalize_code(code);
        let mut inner = self.lock();
        if inner.events.iter().any(|e| e.code == code) {
            return Err(StoreError::DuplicateEventCode(code));
        }
        let event = Event {
            id: inner.next_id(),
            name: name.to_string(),
            code,
            description: description.map(str::to_string),
            is_active: true,
            created_at: Utc::now(),
        };
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        Ok(self.lock().events.iter().find(|e| e.id == id).cloned())
    }

    async fn event_by_code(&self, code: &str) -> Result<Option<Event>, StoreError> {
        let code = normalize_code(code);
        Ok(self.lock().events.iter().find(|e| e.code == code).cloned())
    }

    async fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        let mut events = self.lock().events.clone();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(events)
    }

    async fn set_event_active(&self, id: i64, active: bool) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.events.iter_mut().find(|e| e.id == id) {
            Some(event) => {
                event.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_event(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let before = inner.events.len();
        inner.events.retain(|e| e.id != id);
        if inner.events.len() == before {
            return Ok(false);
        }
        let photo_ids: Vec<i64> = inner
            .photos
            .iter()
            .filter(|p| p.event_id == id)
            .map(|p| p.id)
            .collect();
        inner.photos.retain(|p| p.event_id != id);
        inner.faces.retain(|f| !photo_ids.contains(&f.photo_id));
        inner.matches.retain(|m| m.event_id != id);
        Ok(true)
    }

    async fn create_photo(
        &self,
        event_id: i64,
        filename: &str,
        uploaded_by: &str,
    ) -> Result<Photo, StoreError> {
        let mut inner = self.lock();
        if !inner.events.iter().any(|e| e.id == event_id) {
            return Err(StoreError::EventNotFound(event_id));
        }
        let photo = Photo {
            id: inner.next_id(),
            event_id,
            filename: filename.to_string(),
            uploaded_by: uploaded_by.to_string(),
            status: PhotoStatus::Pending,
            created_at: Utc::now(),
        };
        inner.photos.push(photo.clone());
        Ok(photo)
    }

    async fn photo(&self, id: i64) -> Result<Option<Photo>, StoreError> {
        Ok(self.lock().photos.iter().find(|p| p.id == id).cloned())
    }

    async fn event_photos(&self, event_id: i64) -> Result<Vec<Photo>, StoreError> {
        Ok(self
            .lock()
            .photos
            .iter()
            .filter(|p| p.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn set_photo_status(&self, id: i64, status: PhotoStatus) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.photos.iter_mut().find(|p| p.id == id) {
            Some(photo) => {
                photo.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_photo(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let before = inner.photos.len();
        inner.photos.retain(|p| p.id != id);
        if inner.photos.len() == before {
            return Ok(false);
        }
        inner.faces.retain(|f| f.photo_id != id);
        inner.matches.retain(|m| m.photo_id != id);
        Ok(true)
    }

    async fn record_detection(
        &self,
        photo_id: i64,
        detection: &Detection,
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        if !inner.photos.iter().any(|p| p.id == photo_id) {
            return Err(StoreError::PhotoNotFound(photo_id));
        }
        let id = inner.next_id();
        inner.faces.push(StoredFace {
            id,
            photo_id,
            detection: detection.clone(),
        });
        Ok(id)
    }

    async fn candidate_set(&self, event_id: i64) -> Result<Vec<Candidate>, StoreError> {
        let inner = self.lock();
        let eligible: Vec<i64> = inner
            .photos
            .iter()
            .filter(|p| p.event_id == event_id && p.status == PhotoStatus::Processed)
            .map(|p| p.id)
            .collect();
        Ok(inner
            .faces
            .iter()
            .filter(|f| eligible.contains(&f.photo_id))
            .map(|f| Candidate {
                face_id: f.id,
                photo_id: f.photo_id,
                embedding: f.detection.embedding.clone(),
            })
            .collect())
    }
}

#[async_trait]
impl MatchLedger for MemoryStore {
    async fn record_matches(&self, matches: &[NewMatch]) -> Result<Vec<i64>, StoreError> {
        let mut inner = self.lock();
        let created_at = Utc::now();
        let mut ids = Vec::with_capacity(matches.len());
        for m in matches {
            let id = inner.next_id();
            inner.matches.push(MatchRecord {
                id,
                requester: m.requester.clone(),
                photo_id: m.photo_id,
                event_id: m.event_id,
                confidence_percent: m.confidence_percent,
                selfie_ref: m.selfie_ref.clone(),
                notified: false,
                created_at,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn matches_for_requester(&self, requester: &str) -> Result<Vec<MatchRecord>, StoreError> {
        let mut records: Vec<MatchRecord> = self
            .lock()
            .matches
            .iter()
            .filter(|m| m.requester == requester)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn matches_for_event(&self, event_id: i64) -> Result<Vec<MatchRecord>, StoreError> {
        let mut records: Vec<MatchRecord> = self
            .lock()
            .matches
            .iter()
            .filter(|m| m.event_id == event_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn mark_notified(&self, match_id: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.matches.iter_mut().find(|m| m.id == match_id) {
            Some(record) => {
                record.notified = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let inner = self.lock();
        Ok(StoreStats {
            events: inner.events.len() as u64,
            photos: inner.photos.len() as u64,
            processed_photos: inner
                .photos
                .iter()
                .filter(|p| p.status == PhotoStatus::Processed)
                .count() as u64,
            detections: inner.faces.len() as u64,
            matches: inner.matches.len() as u64,
        })
    }
}
