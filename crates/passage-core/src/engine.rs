//! Engine façade: owns the identity index, matcher and quality filter, and
//! fuses recognition with liveness into the final access decision.
//!
//! The engine is an explicitly constructed object — no ambient globals. Each
//! verification attempt gets its own [`LivenessSession`] from
//! [`AccessEngine::new_session`]; the engine itself holds no per-attempt
//! state.

use std::path::Path;

use thiserror::Error;

use crate::config::{ConfigError, EngineConfig};
use crate::index::{IdentityIndex, IndexError};
use crate::liveness::LivenessSession;
use crate::matcher::{Matcher, Recognition, DEFAULT_CANDIDATES};
use crate::quality::{Precision, QualityFilter};
use crate::types::{Detection, Embedding, GrayFrame, EMBEDDING_DIM};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Final fused verdict for one verification attempt.
///
/// Denials carry the full detail for audit logging; nothing here is meant to
/// be shown to the subject.
#[derive(Debug, Clone, Copy)]
pub struct AccessDecision {
    pub granted: bool,
    pub identity: Option<i64>,
    /// 1 − distance when an identity was found, else 0.
    pub confidence: f32,
    pub liveness_passed: bool,
    pub distance: f32,
}

impl AccessDecision {
    fn denied() -> Self {
        Self {
            granted: false,
            identity: None,
            confidence: 0.0,
            liveness_passed: false,
            distance: 1.0,
        }
    }
}

/// Counters exposed for the service status surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStats {
    /// Vector rows, orphans included.
    pub total_vectors: usize,
    /// Live enrollments (mapping size).
    pub enrolled: usize,
    pub next_slot: u64,
    pub recognition_threshold: f32,
}

/// The identity matching & liveness decision engine.
pub struct AccessEngine {
    config: EngineConfig,
    index: IdentityIndex,
    matcher: Matcher,
    quality: QualityFilter,
}

impl AccessEngine {
    /// Build an engine with an in-memory index (tests, embedding).
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let index = IdentityIndex::in_memory(EMBEDDING_DIM);
        Ok(Self::assemble(config, index))
    }

    /// Build an engine backed by a snapshot file, loading any existing state.
    pub fn open(config: EngineConfig, index_path: &Path) -> Result<Self, EngineError> {
        config.validate()?;
        let index = IdentityIndex::open(EMBEDDING_DIM, index_path)?;
        Ok(Self::assemble(config, index))
    }

    fn assemble(config: EngineConfig, index: IdentityIndex) -> Self {
        let matcher = Matcher::from_config(&config);
        let quality = QualityFilter::from_config(&config);
        Self {
            config,
            index,
            matcher,
            quality,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A fresh liveness session for one verification attempt or stream.
    pub fn new_session(&self) -> LivenessSession {
        LivenessSession::new(self.config.liveness.clone())
    }

    /// Enroll an embedding for an identity. Returns the assigned slot id.
    pub fn enroll(&mut self, embedding: &Embedding, identity: i64) -> Result<u64, EngineError> {
        let slot = self.index.add(embedding, identity)?;
        tracing::info!(slot, identity, "identity enrolled");
        Ok(slot)
    }

    /// Tombstone a slot so it can never resolve to its former owner again.
    pub fn remove_identity(&mut self, slot: u64) -> Result<bool, EngineError> {
        Ok(self.index.remove(slot)?)
    }

    /// Drop every enrollment and restart slot numbering from zero.
    pub fn reset_index(&mut self) -> Result<(), EngineError> {
        Ok(self.index.clear()?)
    }

    /// Adaptive recognition with the default candidate count.
    pub fn recognize(&self, embedding: &Embedding) -> Result<Recognition, EngineError> {
        Ok(self
            .matcher
            .recognize(&self.index, embedding, DEFAULT_CANDIDATES, true)?)
    }

    /// Gate and rank raw detections, returning the single best face.
    pub fn best_detection(
        &self,
        frame: &GrayFrame<'_>,
        detections: Vec<Detection>,
        precision: Precision,
    ) -> Option<Detection> {
        self.quality
            .filter_detections(frame, detections, precision)
            .into_iter()
            .next()
    }

    /// Pure AND-fusion of recognition and liveness.
    ///
    /// Recognition without liveness, or liveness without recognition, both
    /// deny access.
    pub fn decide(
        &self,
        detection: Option<&Detection>,
        liveness_passed: bool,
    ) -> Result<AccessDecision, EngineError> {
        let Some(detection) = detection else {
            return Ok(AccessDecision::denied());
        };

        let recognition = self.recognize(&detection.embedding)?;
        let confidence = match recognition.identity {
            Some(_) => 1.0 - recognition.distance,
            None => 0.0,
        };

        Ok(AccessDecision {
            granted: recognition.identity.is_some() && liveness_passed,
            identity: recognition.identity,
            confidence,
            liveness_passed,
            distance: recognition.distance,
        })
    }

    /// Full per-frame verification: quality-gate the detections, feed the
    /// best face to the liveness session, recognize, fuse.
    pub fn verify(
        &self,
        frame: &GrayFrame<'_>,
        detections: Vec<Detection>,
        session: &mut LivenessSession,
    ) -> Result<AccessDecision, EngineError> {
        let best = self.best_detection(frame, detections, Precision::Default);

        let Some(detection) = best else {
            tracing::debug!("no usable detection in frame");
            return Ok(AccessDecision::denied());
        };

        let liveness_passed = session.add_frame(
            frame,
            &detection.bbox,
            detection.landmarks.as_deref(),
        );

        self.decide(Some(&detection), liveness_passed)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            total_vectors: self.index.len(),
            enrolled: self.index.enrolled(),
            next_slot: self.index.next_slot(),
            recognition_threshold: self.config.recognition_threshold,
        }
    }
}
