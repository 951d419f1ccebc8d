//! Selfie search pipeline.
//!
//! A search is a read of whatever candidates exist at invocation time: no
//! lock spans the detector call and the candidate fetch, and accepted matches
//! are persisted in one batch at the end, so an abandoned search never leaves
//! partial ledger rows.

use crate::config::Config;
use snapvault_core::{
    rank, Detection, DetectorError, Embedding, FaceDetector, RankError, RankParams,
};
use snapvault_store::{EmbeddingStore, MatchLedger, NewMatch, StoreError};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no face detected in submitted image")]
    NoFaceDetected,
    #[error("event not found: {0}")]
    EventNotFound(i64),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Rank(#[from] RankError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("detector task failed: {0}")]
    DetectorTask(String),
    #[error("ingest queue closed")]
    QueueClosed,
}

/// One accepted, persisted match from a search.
#[derive(Debug, Clone)]
pub struct AcceptedMatch {
    pub record_id: i64,
    pub photo_id: i64,
    pub face_id: i64,
    /// Similarity score in [0, 1].
    pub score: f32,
    /// `round(score × 100)`, as persisted.
    pub confidence_percent: u8,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub search_id: Uuid,
    /// Opaque reference recorded against the ledger rows for this search.
    pub selfie_ref: String,
    /// Accepted matches, best first.
    pub matches: Vec<AcceptedMatch>,
    /// Size of the candidate set that was ranked.
    pub candidates_considered: usize,
}

/// Orchestrates one selfie search: detect → fetch candidates → rank →
/// persist. Generic over the store so it runs against SQLite in production
/// and the in-memory store in tests.
#[derive(Clone)]
pub struct SearchEngine<S> {
    store: S,
    detector: Arc<dyn FaceDetector>,
    params: RankParams,
}

impl<S> SearchEngine<S>
where
    S: EmbeddingStore + MatchLedger + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, detector: Arc<dyn FaceDetector>, config: &Config) -> Self {
        Self {
            store,
            detector,
            params: RankParams {
                threshold: config.match_threshold,
                limit: config.match_limit,
            },
        }
    }

    pub fn params(&self) -> RankParams {
        self.params
    }

    /// Run a selfie search for `requester` against `event_id`.
    ///
    /// Zero detections in the selfie is the user-facing `NoFaceDetected`
    /// condition. Every search appends new ledger rows for its accepted
    /// matches; history of repeated searches is preserved.
    pub async fn search(
        &self,
        requester: &str,
        event_id: i64,
        selfie: &[u8],
    ) -> Result<SearchOutcome, EngineError> {
        let search_id = Uuid::new_v4();

        if self.store.event(event_id).await?.is_none() {
            return Err(EngineError::EventNotFound(event_id));
        }

        let detections = detect_faces(Arc::clone(&self.detector), selfie.to_vec()).await?;
        let query = best_face(&detections).ok_or(EngineError::NoFaceDetected)?;

        let candidates = self.store.candidate_set(event_id).await?;
        let ranked = rank(query, &candidates, self.params)?;
        tracing::debug!(
            %search_id,
            requester,
            event_id,
            candidates = candidates.len(),
            accepted = ranked.len(),
            "search ranked"
        );

        let selfie_ref = format!("selfie/{search_id}");
        let new_matches: Vec<NewMatch> = ranked
            .iter()
            .map(|m| NewMatch {
                requester: requester.to_string(),
                photo_id: m.photo_id,
                event_id,
                confidence_percent: score_to_percent(m.score),
                selfie_ref: Some(selfie_ref.clone()),
            })
            .collect();

        let record_ids = if new_matches.is_empty() {
            Vec::new()
        } else {
            self.store.record_matches(&new_matches).await?
        };

        let matches = ranked
            .iter()
            .zip(record_ids)
            .map(|(m, record_id)| AcceptedMatch {
                record_id,
                photo_id: m.photo_id,
                face_id: m.face_id,
                score: m.score,
                confidence_percent: score_to_percent(m.score),
            })
            .collect::<Vec<_>>();

        tracing::info!(
            %search_id,
            requester,
            event_id,
            matches = matches.len(),
            "search complete"
        );

        Ok(SearchOutcome {
            search_id,
            selfie_ref,
            matches,
            candidates_considered: candidates.len(),
        })
    }
}

/// Run the (CPU-bound) detector off the async runtime.
pub(crate) async fn detect_faces(
    detector: Arc<dyn FaceDetector>,
    image: Vec<u8>,
) -> Result<Vec<Detection>, EngineError> {
    let detections = tokio::task::spawn_blocking(move || detector.detect(&image))
        .await
        .map_err(|e| EngineError::DetectorTask(e.to_string()))??;
    Ok(detections)
}

/// The query face for a selfie: the detection the model is most confident in.
fn best_face(detections: &[Detection]) -> Option<&Embedding> {
    detections
        .iter()
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|d| &d.embedding)
}

fn score_to_percent(score: f32) -> u8 {
    (score.clamp(0.0, 1.0) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapvault_core::{BoundingBox, MockDetector, DEFAULT_EMBEDDING_DIM};
    use snapvault_store::{MemoryStore, PhotoStatus};

    fn bbox() -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 64.0,
            height: 64.0,
        }
    }

    fn detection(values: Vec<f32>, confidence: f32) -> Detection {
        Detection::new(Embedding::new(values).unwrap(), bbox(), confidence).unwrap()
    }

    fn basis(index: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; DEFAULT_EMBEDDING_DIM];
        v[index] = 1.0;
        v
    }

    /// Detector returning a fixed detection list, whatever the image.
    struct StubDetector {
        detections: Vec<Detection>,
    }

    impl FaceDetector for StubDetector {
        fn detect(&self, _image: &[u8]) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.detections.clone())
        }
    }

    fn engine_with(
        store: MemoryStore,
        detections: Vec<Detection>,
        threshold: f32,
        limit: usize,
    ) -> SearchEngine<MemoryStore> {
        let config = Config {
            match_threshold: threshold,
            match_limit: limit,
            ..Config::default()
        };
        SearchEngine::new(store, Arc::new(StubDetector { detections }), &config)
    }

    /// Seed an event with one processed photo per embedding; returns
    /// (event_id, photo_ids).
    async fn seed_event(store: &MemoryStore, embeddings: &[Vec<f32>]) -> (i64, Vec<i64>) {
        let event = store.create_event("E", "E1", None).await.unwrap();
        let mut photo_ids = Vec::new();
        for (i, values) in embeddings.iter().enumerate() {
            let photo = store
                .create_photo(event.id, &format!("photo-{i}.jpg"), "organizer")
                .await
                .unwrap();
            store
                .record_detection(photo.id, &detection(values.clone(), 0.9))
                .await
                .unwrap();
            store
                .set_photo_status(photo.id, PhotoStatus::Processed)
                .await
                .unwrap();
            photo_ids.push(photo.id);
        }
        (event.id, photo_ids)
    }

    #[tokio::test]
    async fn test_search_persists_matches_above_threshold() {
        let store = MemoryStore::new();
        let (event_id, photo_ids) = seed_event(&store, &[basis(0), basis(1)]).await;

        let engine = engine_with(
            store.clone(),
            vec![detection(basis(0), 0.95)],
            0.6,
            50,
        );
        let outcome = engine.search("user-1", event_id, b"selfie").await.unwrap();

        assert_eq!(outcome.candidates_considered, 2);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].photo_id, photo_ids[0]);
        assert_eq!(outcome.matches[0].confidence_percent, 100);

        let records = store.matches_for_requester("user-1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].photo_id, photo_ids[0]);
        assert_eq!(records[0].confidence_percent, 100);
        assert_eq!(records[0].selfie_ref.as_deref(), Some(outcome.selfie_ref.as_str()));
        assert!(!records[0].notified);
    }

    #[tokio::test]
    async fn test_search_rounds_confidence_percent() {
        let store = MemoryStore::new();
        let mut diagonal = vec![0.0f32; DEFAULT_EMBEDDING_DIM];
        diagonal[0] = 0.7071;
        diagonal[1] = 0.7071;
        let (event_id, _) = seed_event(&store, &[diagonal]).await;

        let engine = engine_with(store.clone(), vec![detection(basis(0), 0.9)], 0.6, 50);
        let outcome = engine.search("user-1", event_id, b"selfie").await.unwrap();

        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].confidence_percent, 71);
    }

    #[tokio::test]
    async fn test_search_no_face_is_user_facing_error() {
        let store = MemoryStore::new();
        let (event_id, _) = seed_event(&store, &[basis(0)]).await;

        let engine = engine_with(store.clone(), vec![], 0.6, 50);
        let err = engine.search("user-1", event_id, b"selfie").await.unwrap_err();
        assert!(matches!(err, EngineError::NoFaceDetected));
        assert!(store.matches_for_requester("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_unknown_event() {
        let store = MemoryStore::new();
        let engine = engine_with(store, vec![detection(basis(0), 0.9)], 0.6, 50);
        let err = engine.search("user-1", 404, b"selfie").await.unwrap_err();
        assert!(matches!(err, EngineError::EventNotFound(404)));
    }

    #[tokio::test]
    async fn test_search_empty_candidate_set_is_zero_matches() {
        let store = MemoryStore::new();
        let event = store.create_event("E", "E1", None).await.unwrap();

        let engine = engine_with(store.clone(), vec![detection(basis(0), 0.9)], 0.6, 50);
        let outcome = engine.search("user-1", event.id, b"selfie").await.unwrap();

        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.candidates_considered, 0);
        assert!(store.matches_for_requester("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_search_appends_history() {
        let store = MemoryStore::new();
        let (event_id, _) = seed_event(&store, &[basis(0)]).await;

        let engine = engine_with(store.clone(), vec![detection(basis(0), 0.9)], 0.6, 50);
        engine.search("user-1", event_id, b"selfie").await.unwrap();
        engine.search("user-1", event_id, b"selfie").await.unwrap();

        assert_eq!(store.matches_for_requester("user-1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_search_uses_most_confident_selfie_face() {
        let store = MemoryStore::new();
        let (event_id, photo_ids) = seed_event(&store, &[basis(0), basis(1)]).await;

        // Two faces in the selfie; the detector is more confident in the
        // second, which matches photo 1.
        let engine = engine_with(
            store,
            vec![detection(basis(0), 0.55), detection(basis(1), 0.97)],
            0.6,
            50,
        );
        let outcome = engine.search("user-1", event_id, b"selfie").await.unwrap();
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].photo_id, photo_ids[1]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_writes_nothing() {
        let store = MemoryStore::new();
        let (event_id, _) = seed_event(&store, &[basis(0), vec![1.0; 64]]).await;

        let engine = engine_with(store.clone(), vec![detection(basis(0), 0.9)], 0.0, 50);
        let err = engine.search("user-1", event_id, b"selfie").await.unwrap_err();
        assert!(matches!(err, EngineError::Rank(RankError::Dimension(_))));
        assert!(store.matches_for_requester("user-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_respects_limit() {
        let store = MemoryStore::new();
        let gallery: Vec<Vec<f32>> = (0..5).map(|_| basis(0)).collect();
        let (event_id, _) = seed_event(&store, &gallery).await;

        let engine = engine_with(store.clone(), vec![detection(basis(0), 0.9)], 0.6, 3);
        let outcome = engine.search("user-1", event_id, b"selfie").await.unwrap();
        assert_eq!(outcome.matches.len(), 3);
        assert_eq!(store.matches_for_requester("user-1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_end_to_end_with_mock_detector() {
        use image::{DynamicImage, ImageFormat, RgbImage};
        use std::io::Cursor;

        let encode = |seed: u8| {
            let img = RgbImage::from_fn(24, 24, |x, y| {
                image::Rgb([seed ^ x as u8, seed.wrapping_add(y as u8), seed])
            });
            let mut out = Vec::new();
            DynamicImage::ImageRgb8(img)
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .unwrap();
            out
        };

        let store = MemoryStore::new();
        let event = store.create_event("E", "E1", None).await.unwrap();
        let detector = Arc::new(MockDetector::new(DEFAULT_EMBEDDING_DIM));

        // Ingest one gallery photo by hand, the way the worker would.
        let gallery_bytes = encode(42);
        let photo = store
            .create_photo(event.id, "gallery.png", "organizer")
            .await
            .unwrap();
        for det in detector.detect(&gallery_bytes).unwrap() {
            store.record_detection(photo.id, &det).await.unwrap();
        }
        store
            .set_photo_status(photo.id, PhotoStatus::Processed)
            .await
            .unwrap();

        let config = Config::default();
        let engine = SearchEngine::new(store.clone(), detector, &config);

        // The same picture matches itself at full confidence...
        let outcome = engine
            .search("user-1", event.id, &gallery_bytes)
            .await
            .unwrap();
        assert!(!outcome.matches.is_empty());
        assert_eq!(outcome.matches[0].photo_id, photo.id);
        assert_eq!(outcome.matches[0].confidence_percent, 100);

        // ...and an unrelated picture does not clear the threshold.
        let other = engine.search("user-2", event.id, &encode(7)).await.unwrap();
        assert!(other.matches.is_empty());
    }
}
