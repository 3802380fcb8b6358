//! Threshold-adaptive identity matching.
//!
//! Nearest-neighbor search alone cannot decide accept/reject; that takes a
//! distance threshold, and a fixed one trades false accepts against false
//! rejects badly across gallery shapes. The matcher therefore widens the
//! threshold when the best candidate is clearly separated from the runner-up
//! and tightens it when the top two are ambiguous.

use crate::config::EngineConfig;
use crate::index::{IdentityIndex, IndexError};
use crate::types::Embedding;

/// Candidates fetched per recognition query.
pub const DEFAULT_CANDIDATES: usize = 5;

/// Top-2 similarity gap above which the best hit counts as clearly separated.
const SEPARATION_GAP: f32 = 0.1;
/// Gap below which the top two candidates count as ambiguous.
const AMBIGUITY_GAP: f32 = 0.05;

/// Strategy for picking the acceptance threshold from the top-2 similarities.
pub trait ThresholdPolicy {
    fn select(&self, best: f32, second: f32) -> f32;
}

/// Always the configured threshold, regardless of candidate separation.
pub struct FixedThreshold(pub f32);

impl ThresholdPolicy for FixedThreshold {
    fn select(&self, _best: f32, _second: f32) -> f32 {
        self.0
    }
}

/// Gap-adaptive threshold: relaxed on a clear winner, strict on a close
/// contest, default otherwise.
pub struct AdaptiveThreshold {
    pub default: f32,
    pub strict: f32,
    pub relaxed: f32,
}

impl ThresholdPolicy for AdaptiveThreshold {
    fn select(&self, best: f32, second: f32) -> f32 {
        let gap = best - second;
        if gap > SEPARATION_GAP {
            self.relaxed
        } else if gap < AMBIGUITY_GAP {
            self.strict
        } else {
            self.default
        }
    }
}

/// Outcome of a recognition query.
#[derive(Debug, Clone, Copy)]
pub struct Recognition {
    /// Matched owner identity, or `None` on rejection / orphaned top hit.
    pub identity: Option<i64>,
    /// 1 − best similarity. 1.0 when the index is empty.
    pub distance: f32,
    /// The threshold that was applied.
    pub threshold: f32,
}

/// Converts nearest-neighbor results into accept/reject decisions.
pub struct Matcher {
    fixed: FixedThreshold,
    adaptive: AdaptiveThreshold,
}

impl Matcher {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            fixed: FixedThreshold(cfg.recognition_threshold),
            adaptive: AdaptiveThreshold {
                default: cfg.recognition_threshold,
                strict: cfg.recognition_threshold_strict,
                relaxed: cfg.recognition_threshold_relaxed,
            },
        }
    }

    /// Match an embedding against the index.
    ///
    /// An empty index yields `(None, 1.0)` — a guaranteed non-match. A top
    /// hit whose slot was tombstoned resolves to `None` as well: the orphaned
    /// vector may win the search, but it no longer names anyone.
    pub fn recognize(
        &self,
        index: &IdentityIndex,
        embedding: &Embedding,
        k: usize,
        adaptive: bool,
    ) -> Result<Recognition, IndexError> {
        let hits = index.search(embedding, k)?;

        let Some(&(best_slot, best_sim)) = hits.first() else {
            return Ok(Recognition {
                identity: None,
                distance: 1.0,
                threshold: self.fixed.0,
            });
        };

        let second_sim = hits.get(1).map(|&(_, s)| s).unwrap_or(best_sim);
        let distance = 1.0 - best_sim;

        let policy: &dyn ThresholdPolicy = if adaptive {
            &self.adaptive
        } else {
            &self.fixed
        };
        let threshold = policy.select(best_sim, second_sim);

        let identity = if distance <= threshold {
            index.owner_of(best_slot)
        } else {
            None
        };

        tracing::debug!(
            distance,
            threshold,
            matched = identity.is_some(),
            "recognition query"
        );

        Ok(Recognition {
            identity,
            distance,
            threshold,
        })
    }
}
