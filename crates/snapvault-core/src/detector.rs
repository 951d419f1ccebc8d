//! Face detection boundary.
//!
//! Detection is an external capability: production deployments plug a real
//! model behind [`FaceDetector`]. Swapping the implementation is non-breaking
//! as long as the embedding dimensionality stays constant. The bundled
//! [`MockDetector`] stands in for a model during development and testing.

use crate::types::{BoundingBox, Detection, Embedding, EmbeddingError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("detector produced malformed detection: {0}")]
    Malformed(#[from] EmbeddingError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
}

/// Detects faces in an encoded image and returns one embedding per face.
///
/// Zero detections is a valid outcome, not an error; the orchestration layer
/// decides what an empty result means for a given flow.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, DetectorError>;
}

// --- Mock detector constants ---
const MOCK_MIN_CONFIDENCE: f32 = 0.80;
const MOCK_CONFIDENCE_SPAN: f32 = 0.19;

/// Deterministic stand-in for a production face model.
///
/// Decodes the image, hashes its pixel data, and uses the digest to seed the
/// embedding generator: the same image bytes always yield the same detections,
/// which makes the full ingest → search pipeline testable end to end without
/// model weights. Embeddings are L2-normalized, as a real recognizer's would
/// be.
pub struct MockDetector {
    dim: usize,
}

impl MockDetector {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn face_embedding(&self, rng: &mut StdRng) -> Result<Embedding, EmbeddingError> {
        let mut values: Vec<f32> = (0..self.dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        Embedding::new(values)
    }
}

impl FaceDetector for MockDetector {
    fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, DetectorError> {
        let decoded = image::load_from_memory(image)?;
        let luma = decoded.to_luma8();
        let (width, height) = (luma.width() as f32, luma.height() as f32);

        // Seed from the pixel content, not the container bytes, so the same
        // picture re-encoded with different metadata detects identically.
        let digest = Sha256::digest(luma.as_raw());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));

        let face_count = 1 + (digest[8] as usize % 2);
        let mut detections = Vec::with_capacity(face_count);

        for _ in 0..face_count {
            let embedding = self.face_embedding(&mut rng)?;

            // A plausible face region: somewhere in the frame, between a
            // fifth and half of the smaller image side.
            let side = width.min(height);
            let extent = side * rng.gen_range(0.2f32..0.5);
            let x = rng.gen_range(0.0f32..(width - extent).max(1.0));
            let y = rng.gen_range(0.0f32..(height - extent).max(1.0));
            let bounding_box = BoundingBox {
                x,
                y,
                width: extent,
                height: extent,
            };

            let confidence = MOCK_MIN_CONFIDENCE + rng.gen::<f32>() * MOCK_CONFIDENCE_SPAN;
            detections.push(Detection::new(embedding, bounding_box, confidence)?);
        }

        tracing::debug!(
            faces = detections.len(),
            width,
            height,
            "mock detector processed image"
        );

        Ok(detections)
    }
}
