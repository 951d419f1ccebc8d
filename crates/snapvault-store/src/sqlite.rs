//! SQLite-backed store.
//!
//! One serialized connection (tokio-rusqlite) serves both contracts. Vectors
//! and bounding boxes are persisted as JSON text; referential cleanup is done
//! by the schema's `ON DELETE CASCADE` so deleting a photo or event takes its
//! detections and matches with it.

use crate::{
    confidence_to_percent, normalize_code, EmbeddingStore, Event, MatchLedger, MatchRecord,
    NewMatch, Photo, PhotoStatus, StoreError, StoreStats,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use snapvault_core::{Candidate, Detection, Embedding};
use std::path::Path;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    code        TEXT NOT NULL UNIQUE,
    description TEXT,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS photos (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id    INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    filename    TEXT NOT NULL,
    uploaded_by TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'pending',
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_vectors (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id     INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    vector       TEXT NOT NULL,
    bounding_box TEXT NOT NULL,
    confidence   INTEGER NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS photo_matches (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    requester  TEXT NOT NULL,
    photo_id   INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    event_id   INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    confidence INTEGER NOT NULL,
    selfie_ref TEXT,
    notified   INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_photos_event ON photos(event_id);
CREATE INDEX IF NOT EXISTS idx_face_vectors_photo ON face_vectors(photo_id);
CREATE INDEX IF NOT EXISTS idx_matches_requester ON photo_matches(requester);
CREATE INDEX IF NOT EXISTS idx_matches_event ON photo_matches(event_id);
"#;

/// SQLite-backed implementation of both store contracts.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.to_path_buf()).await?;
        conn.call(|conn| Ok(conn.execute_batch(SCHEMA)?)).await?;
        tracing::info!(path = %path.display(), "sqlite store opened");
        Ok(Self { conn })
    }

    /// In-memory database, mostly for tests and diagnostics.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        conn.call(|conn| Ok(conn.execute_batch(SCHEMA)?)).await?;
        Ok(Self { conn })
    }
}

fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_status(value: &str) -> rusqlite::Result<PhotoStatus> {
    PhotoStatus::parse(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        name: row.get(1)?,
        code: row.get(2)?,
        description: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
    })
}

fn row_photo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: row.get(0)?,
        event_id: row.get(1)?,
        filename: row.get(2)?,
        uploaded_by: row.get(3)?,
        status: parse_status(&row.get::<_, String>(4)?)?,
        created_at: parse_timestamp(&row.get::<_, String>(5)?)?,
    })
}

fn row_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<MatchRecord> {
    Ok(MatchRecord {
        id: row.get(0)?,
        requester: row.get(1)?,
        photo_id: row.get(2)?,
        event_id: row.get(3)?,
        confidence_percent: row.get::<_, i64>(4)?.clamp(0, 100) as u8,
        selfie_ref: row.get(5)?,
        notified: row.get::<_, i64>(6)? != 0,
        created_at: parse_timestamp(&row.get::<_, String>(7)?)?,
    })
}

const EVENT_COLUMNS: &str = "id, name, code, description, is_active, created_at";
const PHOTO_COLUMNS: &str = "id, event_id, filename, uploaded_by, status, created_at";
const MATCH_COLUMNS: &str =
    "id, requester, photo_id, event_id, confidence, selfie_ref, notified, created_at";

#[async_trait]
impl EmbeddingStore for SqliteStore {
    async fn create_event(
        &self,
        name: &str,
        code: &str,
        description: Option<&str>,
    ) -> Result<Event, StoreError> {
        let name = name.to_string();
        let code = normalize_code(code);
        let code_for_err = code.clone();
        let description = description.map(str::to_string);
        let created_at = Utc::now();

        let created = self
            .conn
            .call(move |conn| {
                let exists: bool = conn
                    .query_row("SELECT 1 FROM events WHERE code = ?1", [&code], |_| Ok(()))
                    .map(|_| true)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(false),
                        other => Err(other),
                    })?;
                if exists {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO events (name, code, description, is_active, created_at)
                     VALUES (?1, ?2, ?3, 1, ?4)",
                    params![name, code, description, created_at.to_rfc3339()],
                )?;
                let id = conn.last_insert_rowid();
                Ok(Some(Event {
                    id,
                    name,
                    code,
                    description,
                    is_active: true,
                    created_at,
                }))
            })
            .await?;

        created.ok_or(StoreError::DuplicateEventCode(code_for_err))
    }

    async fn event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"))?;
                let mut rows = stmt.query_map([id], row_event)?;
                Ok(rows.next().transpose()?)
            })
            .await?)
    }

    async fn event_by_code(&self, code: &str) -> Result<Option<Event>, StoreError> {
        let code = normalize_code(code);
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE code = ?1"))?;
                let mut rows = stmt.query_map([code], row_event)?;
                Ok(rows.next().transpose()?)
            })
            .await?)
    }

    async fn list_events(&self) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events ORDER BY created_at DESC, id DESC"
                ))?;
                let events = stmt
                    .query_map([], row_event)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(events)
            })
            .await?)
    }

    async fn set_event_active(&self, id: i64, active: bool) -> Result<bool, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE events SET is_active = ?2 WHERE id = ?1",
                    params![id, active as i64],
                )?;
                Ok(changed > 0)
            })
            .await?)
    }

    async fn delete_event(&self, id: i64) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let changed = conn.execute("DELETE FROM events WHERE id = ?1", [id])?;
                Ok(changed > 0)
            })
            .await?;
        if deleted {
            tracing::info!(event_id = id, "event deleted (cascading)");
        }
        Ok(deleted)
    }

    async fn create_photo(
        &self,
        event_id: i64,
        filename: &str,
        uploaded_by: &str,
    ) -> Result<Photo, StoreError> {
        let filename = filename.to_string();
        let uploaded_by = uploaded_by.to_string();
        let created_at = Utc::now();

        let created = self
            .conn
            .call(move |conn| {
                let event_exists: bool = conn
                    .query_row("SELECT 1 FROM events WHERE id = ?1", [event_id], |_| Ok(()))
                    .map(|_| true)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(false),
                        other => Err(other),
                    })?;
                if !event_exists {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO photos (event_id, filename, uploaded_by, status, created_at)
                     VALUES (?1, ?2, ?3, 'pending', ?4)",
                    params![event_id, filename, uploaded_by, created_at.to_rfc3339()],
                )?;
                Ok(Some(Photo {
                    id: conn.last_insert_rowid(),
                    event_id,
                    filename,
                    uploaded_by,
                    status: PhotoStatus::Pending,
                    created_at,
                }))
            })
            .await?;

        created.ok_or(StoreError::EventNotFound(event_id))
    }

    async fn photo(&self, id: i64) -> Result<Option<Photo>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {PHOTO_COLUMNS} FROM photos WHERE id = ?1"))?;
                let mut rows = stmt.query_map([id], row_photo)?;
                Ok(rows.next().transpose()?)
            })
            .await?)
    }

    async fn event_photos(&self, event_id: i64) -> Result<Vec<Photo>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {PHOTO_COLUMNS} FROM photos WHERE event_id = ?1 ORDER BY id"
                ))?;
                let photos = stmt
                    .query_map([event_id], row_photo)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(photos)
            })
            .await?)
    }

    async fn set_photo_status(&self, id: i64, status: PhotoStatus) -> Result<bool, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE photos SET status = ?2 WHERE id = ?1",
                    params![id, status.as_str()],
                )?;
                Ok(changed > 0)
            })
            .await?)
    }

    async fn delete_photo(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let changed = conn.execute("DELETE FROM photos WHERE id = ?1", [id])?;
                Ok(changed > 0)
            })
            .await?)
    }

    async fn record_detection(
        &self,
        photo_id: i64,
        detection: &Detection,
    ) -> Result<i64, StoreError> {
        let vector = serde_json::to_string(detection.embedding.values())
            .map_err(|e| StoreError::InvalidValue(format!("serialize vector: {e}")))?;
        let bounding_box = serde_json::to_string(&detection.bounding_box)
            .map_err(|e| StoreError::InvalidValue(format!("serialize bounding box: {e}")))?;
        let confidence = confidence_to_percent(detection.confidence);
        let created_at = Utc::now().to_rfc3339();

        let recorded = self
            .conn
            .call(move |conn| {
                let photo_exists: bool = conn
                    .query_row("SELECT 1 FROM photos WHERE id = ?1", [photo_id], |_| Ok(()))
                    .map(|_| true)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(false),
                        other => Err(other),
                    })?;
                if !photo_exists {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO face_vectors (photo_id, vector, bounding_box, confidence, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![photo_id, vector, bounding_box, confidence as i64, created_at],
                )?;
                Ok(Some(conn.last_insert_rowid()))
            })
            .await?;

        recorded.ok_or(StoreError::PhotoNotFound(photo_id))
    }

    async fn candidate_set(&self, event_id: i64) -> Result<Vec<Candidate>, StoreError> {
        let rows: Vec<(i64, i64, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT f.id, f.photo_id, f.vector
                     FROM face_vectors f
                     JOIN photos p ON p.id = f.photo_id
                     WHERE p.event_id = ?1 AND p.status = 'processed'",
                )?;
                let rows = stmt
                    .query_map([event_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for (face_id, photo_id, vector_json) in rows {
            let values: Vec<f32> = serde_json::from_str(&vector_json).map_err(|e| {
                StoreError::CorruptRecord {
                    face_id,
                    reason: format!("vector json: {e}"),
                }
            })?;
            let embedding = Embedding::new(values).map_err(|e| StoreError::CorruptRecord {
                face_id,
                reason: e.to_string(),
            })?;
            candidates.push(Candidate {
                face_id,
                photo_id,
                embedding,
            });
        }
        Ok(candidates)
    }
}

#[async_trait]
impl MatchLedger for SqliteStore {
    async fn record_matches(&self, matches: &[NewMatch]) -> Result<Vec<i64>, StoreError> {
        if matches.is_empty() {
            return Ok(Vec::new());
        }
        let matches = matches.to_vec();
        let created_at = Utc::now().to_rfc3339();

        Ok(self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut ids = Vec::with_capacity(matches.len());
                for m in &matches {
                    tx.execute(
                        "INSERT INTO photo_matches
                         (requester, photo_id, event_id, confidence, selfie_ref, notified, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                        params![
                            m.requester,
                            m.photo_id,
                            m.event_id,
                            m.confidence_percent as i64,
                            m.selfie_ref,
                            created_at
                        ],
                    )?;
                    ids.push(tx.last_insert_rowid());
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?)
    }

    async fn matches_for_requester(&self, requester: &str) -> Result<Vec<MatchRecord>, StoreError> {
        let requester = requester.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MATCH_COLUMNS} FROM photo_matches
                     WHERE requester = ?1 ORDER BY created_at DESC, id DESC"
                ))?;
                let records = stmt
                    .query_map([requester], row_match)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await?)
    }

    async fn matches_for_event(&self, event_id: i64) -> Result<Vec<MatchRecord>, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {MATCH_COLUMNS} FROM photo_matches
                     WHERE event_id = ?1 ORDER BY created_at DESC, id DESC"
                ))?;
                let records = stmt
                    .query_map([event_id], row_match)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(records)
            })
            .await?)
    }

    async fn mark_notified(&self, match_id: i64) -> Result<bool, StoreError> {
        Ok(self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE photo_matches SET notified = 1 WHERE id = ?1",
                    [match_id],
                )?;
                Ok(changed > 0)
            })
            .await?)
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(self
            .conn
            .call(|conn| {
                let count = |sql: &str| -> rusqlite::Result<u64> {
                    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                        .map(|n| n.max(0) as u64)
                };
                Ok(StoreStats {
                    events: count("SELECT COUNT(*) FROM events")?,
                    photos: count("SELECT COUNT(*) FROM photos")?,
                    processed_photos: count(
                        "SELECT COUNT(*) FROM photos WHERE status = 'processed'",
                    )?,
                    detections: count("SELECT COUNT(*) FROM face_vectors")?,
                    matches: count("SELECT COUNT(*) FROM photo_matches")?,
                })
            })
            .await?)
    }
}
