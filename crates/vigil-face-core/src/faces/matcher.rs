use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::faces::extractor::Embedding;

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.5;

/// Euclidean (L2) distance between two vectors of equal length.
///
/// Panics if the lengths differ; use [`Matcher::compare`] for checked input.
pub fn euclidean_distance(reference: &[f64], live: &[f64]) -> f64 {
    assert_eq!(
        reference.len(),
        live.len(),
        "embedding lengths must match"
    );
    reference
        .iter()
        .zip(live.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    Match { distance: f64 },
    Mismatch { distance: f64 },
    NoFace,
}

impl MatchOutcome {
    pub fn distance(&self) -> Option<f64> {
        match self {
            MatchOutcome::Match { distance } | MatchOutcome::Mismatch { distance } => {
                Some(*distance)
            }
            MatchOutcome::NoFace => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Match { .. })
    }

    pub fn face_detected(&self) -> bool {
        !matches!(self, MatchOutcome::NoFace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    threshold: f64,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl Matcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn distance(&self, reference: &Embedding, live: &Embedding) -> AppResult<f64> {
        if reference.len() != live.len() {
            return Err(AppError::EmbeddingDimension {
                expected: reference.len(),
                found: live.len(),
            });
        }
        Ok(euclidean_distance(reference.as_slice(), live.as_slice()))
    }

    /// A distance exactly at the threshold counts as a match.
    pub fn compare(&self, reference: &Embedding, live: &Embedding) -> AppResult<MatchOutcome> {
        let distance = self.distance(reference, live)?;
        Ok(self.classify(distance))
    }

    pub fn classify(&self, distance: f64) -> MatchOutcome {
        if distance <= self.threshold {
            MatchOutcome::Match { distance }
        } else {
            MatchOutcome::Mismatch { distance }
        }
    }
}
