use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimensionality of embeddings produced by the bundled mock detector.
///
/// The comparison primitives never assume this value (they only require that
/// query and candidate agree), but one deployment uses one dimensionality,
/// and this is the default.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

/// A well-formedness violation in an embedding or detection.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("embedding element {index} is not a finite number")]
    NotFinite { index: usize },
    #[error("detector confidence {0} outside [0, 1]")]
    ConfidenceOutOfRange(f32),
}

/// Two embeddings of different lengths were compared.
///
/// Never recovered from by truncation or padding: a mismatch means the
/// candidate set is corrupt.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Bounding box for a detected face, in pixel units of the source image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector.
///
/// Construct through [`Embedding::new`] so malformed vectors (empty, NaN,
/// infinite) are rejected at ingestion and never reach a candidate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// Build a validated embedding. Every element must be finite and the
    /// vector must be non-empty.
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NotFinite { index });
        }
        Ok(Self { values })
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Compute cosine similarity with another embedding.
    ///
    /// Returns a value in [-1, 1]; higher means more directionally aligned.
    /// If either vector has zero norm the similarity is 0.0, never NaN.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, DimensionMismatch> {
        self.check_dim(other)?;

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        Ok(if denom > 0.0 { dot / denom } else { 0.0 })
    }

    /// Euclidean distance, the alternate scoring primitive. Not used by the
    /// default ranking path.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, DimensionMismatch> {
        self.check_dim(other)?;

        let sum: f32 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        Ok(sum.sqrt())
    }

    fn check_dim(&self, other: &Embedding) -> Result<(), DimensionMismatch> {
        if self.values.len() != other.values.len() {
            return Err(DimensionMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }
        Ok(())
    }
}

/// One detected face: embedding, location, and the detector's own confidence
/// that the region is a face. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub embedding: Embedding,
    pub bounding_box: BoundingBox,
    pub confidence: f32,
}

impl Detection {
    pub fn new(
        embedding: Embedding,
        bounding_box: BoundingBox,
        confidence: f32,
    ) -> Result<Self, EmbeddingError> {
        if !(0.0..=1.0).contains(&confidence) || !confidence.is_finite() {
            return Err(EmbeddingError::ConfidenceOutOfRange(confidence));
        }
        Ok(Self {
            embedding,
            bounding_box,
            confidence,
        })
    }
}

/// One stored detection eligible for comparison against a query.
///
/// The candidate set for an event is assembled by the storage layer; the
/// ranking engine consumes it as-is and never queries storage itself.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Identifier of the stored detection this embedding came from.
    pub face_id: i64,
    /// Photo the face was detected in.
    pub photo_id: i64,
    pub embedding: Embedding,
}

/// A ranked match produced by the similarity engine. Ephemeral: persistence
/// of accepted matches is the orchestration layer's job.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCandidate {
    pub photo_id: i64,
    pub face_id: i64,
    /// Similarity score in [0, 1].
    pub score: f32,
}
