//! Similarity ranking: score a query embedding against an event's candidate
//! set, filter by threshold, and return a bounded, ordered match list.

use crate::types::{Candidate, DimensionMismatch, Embedding, MatchCandidate};
use thiserror::Error;

// --- Scoring policy defaults ---
// The original deployment filtered accepted matches at 0.60; that is the one
// configurable threshold exposed here.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.60;
pub const DEFAULT_MATCH_LIMIT: usize = 50;

#[derive(Error, Debug)]
pub enum RankError {
    #[error(transparent)]
    Dimension(#[from] DimensionMismatch),
    #[error("match threshold {0} outside [0, 1]")]
    ThresholdOutOfRange(f32),
}

/// Per-invocation scoring policy. Not global state: every search carries its
/// own threshold and limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankParams {
    /// Minimum similarity score in [0, 1] for a candidate to be kept.
    pub threshold: f32,
    /// Maximum number of results; candidates ranked beyond it are dropped.
    pub limit: usize,
}

impl Default for RankParams {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            limit: DEFAULT_MATCH_LIMIT,
        }
    }
}

/// Rank `candidates` against `query` by cosine similarity.
///
/// Scores are clamped to [0, 1] (a negative cosine reads as "no alignment").
/// Results are sorted descending by score; ties keep candidate arrival order,
/// so output is deterministic for a fixed input. An empty candidate set
/// yields an empty result.
///
/// Any candidate whose dimensionality differs from the query fails the whole
/// search with [`DimensionMismatch`] and no partial result: a mismatch means
/// the candidate set is corrupt, since embeddings are validated at ingestion.
pub fn rank(
    query: &Embedding,
    candidates: &[Candidate],
    params: RankParams,
) -> Result<Vec<MatchCandidate>, RankError> {
    if !params.threshold.is_finite() || !(0.0..=1.0).contains(&params.threshold) {
        return Err(RankError::ThresholdOutOfRange(params.threshold));
    }

    let mut matches = Vec::new();
    for candidate in candidates {
        let score = query.similarity(&candidate.embedding)?.max(0.0);
        if score >= params.threshold {
            matches.push(MatchCandidate {
                photo_id: candidate.photo_id,
                face_id: candidate.face_id,
                score,
            });
        }
    }

    // Stable sort: equal scores preserve arrival order.
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(params.limit);

    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DEFAULT_EMBEDDING_DIM;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding::new(values).unwrap()
    }

    /// 128-dim basis vector with `value` at `index`.
    fn basis(index: usize, value: f32) -> Embedding {
        let mut v = vec![0.0f32; DEFAULT_EMBEDDING_DIM];
        v[index] = value;
        emb(v)
    }

    fn candidate(face_id: i64, photo_id: i64, embedding: Embedding) -> Candidate {
        Candidate {
            face_id,
            photo_id,
            embedding,
        }
    }

    #[test]
    fn test_empty_candidate_set_is_empty_result() {
        let query = basis(0, 1.0);
        let result = rank(&query, &[], RankParams::default()).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_self_match_scores_one() {
        let query = basis(0, 1.0);
        let cands = vec![candidate(1, 10, query.clone())];
        let result = rank(
            &query,
            &cands,
            RankParams {
                threshold: 0.0,
                limit: 1,
            },
        )
        .unwrap();
        assert_eq!(result.len(), 1);
        assert!((result[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_filters_and_orders() {
        // query = e0; candidates: e0 (1.0), e1 (0.0), (e0+e1)/√2 (≈0.7071)
        let query = basis(0, 1.0);
        let mut diag = vec![0.0f32; DEFAULT_EMBEDDING_DIM];
        diag[0] = 0.7071;
        diag[1] = 0.7071;
        let cands = vec![
            candidate(1, 101, basis(0, 1.0)),
            candidate(2, 102, basis(1, 1.0)),
            candidate(3, 103, emb(diag)),
        ];

        let result = rank(
            &query,
            &cands,
            RankParams {
                threshold: 0.6,
                limit: 50,
            },
        )
        .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].photo_id, 101);
        assert!((result[0].score - 1.0).abs() < 1e-6);
        assert_eq!(result[1].photo_id, 103);
        assert!((result[1].score - 0.7071).abs() < 1e-3);
    }

    #[test]
    fn test_raising_threshold_never_grows_result() {
        let query = basis(0, 1.0);
        let cands: Vec<Candidate> = (0..10)
            .map(|i| {
                let mut v = vec![0.0f32; DEFAULT_EMBEDDING_DIM];
                v[0] = 1.0;
                v[1] = i as f32 * 0.2;
                candidate(i, 100 + i, emb(v))
            })
            .collect();

        let mut prev_len = usize::MAX;
        for threshold in [0.0, 0.2, 0.4, 0.6, 0.8, 1.0] {
            let result = rank(
                &query,
                &cands,
                RankParams {
                    threshold,
                    limit: 50,
                },
            )
            .unwrap();
            assert!(result.len() <= prev_len, "threshold {threshold} grew result");
            prev_len = result.len();
        }
    }

    #[test]
    fn test_limit_bounds_result_to_top_scores() {
        // 60 candidates all above threshold; scores decrease with index.
        let query = basis(0, 1.0);
        let cands: Vec<Candidate> = (0..60)
            .map(|i| {
                let mut v = vec![0.0f32; DEFAULT_EMBEDDING_DIM];
                v[0] = 1.0;
                v[1] = i as f32 * 0.01;
                candidate(i, 1000 + i, emb(v))
            })
            .collect();

        let result = rank(
            &query,
            &cands,
            RankParams {
                threshold: 0.6,
                limit: 50,
            },
        )
        .unwrap();

        assert_eq!(result.len(), 50);
        for pair in result.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        // The 10 weakest candidates (largest off-axis component) were dropped.
        for m in &result {
            assert!(m.photo_id < 1050);
        }
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let query = basis(0, 1.0);
        let cands = vec![
            candidate(7, 1, basis(0, 2.0)),
            candidate(8, 2, basis(0, 1.0)),
            candidate(9, 3, basis(0, 0.5)),
        ];
        // All three score exactly 1.0 (cosine is scale-invariant).
        let result = rank(&query, &cands, RankParams::default()).unwrap();
        let photo_ids: Vec<i64> = result.iter().map(|m| m.photo_id).collect();
        assert_eq!(photo_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_dimension_mismatch_fails_whole_search() {
        let query = basis(0, 1.0);
        let cands = vec![
            candidate(1, 1, basis(0, 1.0)),
            candidate(2, 2, emb(vec![1.0; 64])),
        ];
        let err = rank(&query, &cands, RankParams::default()).unwrap_err();
        assert!(matches!(
            err,
            RankError::Dimension(DimensionMismatch {
                expected: 128,
                actual: 64
            })
        ));
    }

    #[test]
    fn test_zero_query_matches_nothing_above_zero_threshold() {
        let query = emb(vec![0.0; DEFAULT_EMBEDDING_DIM]);
        let cands = vec![candidate(1, 1, basis(0, 1.0))];
        let result = rank(
            &query,
            &cands,
            RankParams {
                threshold: 0.1,
                limit: 50,
            },
        )
        .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_negative_cosine_clamps_to_zero() {
        let query = basis(0, 1.0);
        let cands = vec![candidate(1, 1, basis(0, -1.0))];
        let result = rank(
            &query,
            &cands,
            RankParams {
                threshold: 0.0,
                limit: 50,
            },
        )
        .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].score, 0.0);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let query = basis(0, 1.0);
        assert!(matches!(
            rank(
                &query,
                &[],
                RankParams {
                    threshold: 1.5,
                    limit: 10
                }
            ),
            Err(RankError::ThresholdOutOfRange(_))
        ));
    }
}
