//! Remote face-matching capability.

use crate::types::Identity;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// Rate limiting, timeouts, connection drops. Skipped for the current cycle.
    #[error("transient matcher error: {0}")]
    Transient(String),
    /// The request itself is wrong (malformed image, unknown collection).
    #[error("matcher rejected request: {0}")]
    Permanent(String),
}

impl MatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MatchError::Transient(_))
    }
}

/// One candidate returned by the remote index.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    pub identity: Identity,
    /// Similarity in percent, 0–100.
    pub similarity: f32,
}

/// The remote face index. Billed and rate-limited per call.
#[async_trait]
pub trait RemoteMatcher: Send + Sync {
    /// Search the index for faces in a JPEG image.
    ///
    /// Returns every candidate at or above `threshold`, at most `max_faces`.
    /// An image without any face is an empty result, not an error.
    async fn search(
        &self,
        image_jpeg: &[u8],
        threshold: f32,
        max_faces: u32,
    ) -> Result<Vec<FaceMatch>, MatchError>;

    /// Verify the index is reachable and the collection exists.
    async fn check(&self) -> Result<(), MatchError> {
        Ok(())
    }
}

/// Pick the highest-similarity candidate at or above `threshold`.
///
/// Walks every candidate; ties keep the first one returned.
pub fn best_match(candidates: &[FaceMatch], threshold: f32) -> Option<&FaceMatch> {
    let mut best: Option<&FaceMatch> = None;
    for candidate in candidates {
        if candidate.similarity < threshold {
            continue;
        }
        let is_better = match best {
            None => true,
            Some(prev) => candidate.similarity > prev.similarity,
        };
        if is_better {
            best = Some(candidate);
        }
    }
    best
}
