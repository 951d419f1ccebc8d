//! Background photo ingest.
//!
//! Uploads are acknowledged before detection runs: the orchestration creates
//! the photo record, enqueues a job here, and returns. The worker detects
//! faces, records them, and marks the photo processed. Failed attempts are
//! retried a bounded number of times before the photo is marked failed,
//! never silently dropped. A photo is not a search candidate until processed.

use crate::config::Config;
use crate::engine::{detect_faces, EngineError};
use snapvault_core::FaceDetector;
use snapvault_store::{EmbeddingStore, PhotoStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One photo awaiting face detection.
pub struct IngestJob {
    pub photo_id: i64,
    pub image: Vec<u8>,
}

/// Clone-safe handle to the ingest worker. Dropping every handle closes the
/// queue; the worker drains what remains and exits.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestJob>,
}

impl IngestHandle {
    /// Enqueue a photo for processing. Waits only when the queue is full.
    pub async fn submit(&self, photo_id: i64, image: Vec<u8>) -> Result<(), EngineError> {
        self.tx
            .send(IngestJob { photo_id, image })
            .await
            .map_err(|_| EngineError::QueueClosed)
    }
}

/// Spawn the ingest worker task.
///
/// Jobs are processed one at a time in arrival order; each failure is
/// retried up to `config.ingest_retries` times before the photo is marked
/// [`PhotoStatus::Failed`].
pub fn spawn_ingest_worker<S>(
    store: S,
    detector: Arc<dyn FaceDetector>,
    config: &Config,
) -> (IngestHandle, JoinHandle<()>)
where
    S: EmbeddingStore + Clone + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<IngestJob>(config.ingest_queue_depth);
    let retries = config.ingest_retries;
    let retry_delay = config.ingest_retry_delay;
    let max_faces = config.max_faces_per_photo;

    let worker = tokio::spawn(async move {
        tracing::info!("ingest worker started");
        while let Some(job) = rx.recv().await {
            run_job(&store, &detector, &job, retries, retry_delay, max_faces).await;
        }
        tracing::info!("ingest worker exiting");
    });

    (IngestHandle { tx }, worker)
}

async fn run_job<S>(
    store: &S,
    detector: &Arc<dyn FaceDetector>,
    job: &IngestJob,
    retries: u32,
    retry_delay: std::time::Duration,
    max_faces: usize,
) where
    S: EmbeddingStore + Clone + Send + Sync + 'static,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match process_photo(store, detector, job, max_faces).await {
            Ok(faces) => {
                match store
                    .set_photo_status(job.photo_id, PhotoStatus::Processed)
                    .await
                {
                    Ok(_) => {
                        tracing::info!(photo_id = job.photo_id, faces, "photo processed");
                    }
                    Err(err) => {
                        tracing::error!(
                            photo_id = job.photo_id,
                            error = %err,
                            "failed to mark photo processed"
                        );
                    }
                }
                return;
            }
            Err(err) if attempt <= retries => {
                tracing::warn!(
                    photo_id = job.photo_id,
                    attempt,
                    error = %err,
                    "photo ingest failed; retrying"
                );
                tokio::time::sleep(retry_delay).await;
            }
            Err(err) => {
                tracing::error!(
                    photo_id = job.photo_id,
                    attempts = attempt,
                    error = %err,
                    "photo ingest failed; marking photo failed"
                );
                if let Err(status_err) = store
                    .set_photo_status(job.photo_id, PhotoStatus::Failed)
                    .await
                {
                    tracing::error!(
                        photo_id = job.photo_id,
                        error = %status_err,
                        "failed to record failed state"
                    );
                }
                return;
            }
        }
    }
}

/// Detect faces in the uploaded image and record every detection.
///
/// Duplicate detection rows from a retried attempt are tolerated by the
/// store contract: each row is an independent comparison candidate.
async fn process_photo<S>(
    store: &S,
    detector: &Arc<dyn FaceDetector>,
    job: &IngestJob,
    max_faces: usize,
) -> Result<usize, EngineError>
where
    S: EmbeddingStore + Clone + Send + Sync + 'static,
{
    let mut detections = detect_faces(Arc::clone(detector), job.image.clone()).await?;
    if detections.len() > max_faces {
        tracing::warn!(
            photo_id = job.photo_id,
            detected = detections.len(),
            max_faces,
            "capping detections for photo"
        );
        detections.truncate(max_faces);
    }

    for detection in &detections {
        store.record_detection(job.photo_id, detection).await?;
    }
    Ok(detections.len())
}
