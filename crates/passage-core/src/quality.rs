//! Detection quality gate.
//!
//! A raw detection is only trusted as identity evidence after it clears the
//! geometry checks and receives a usability score. Low-quality crops
//! (blurred, badly lit, clipped by the frame edge) are the main source of
//! false accepts downstream, so they are filtered out before the matcher
//! ever sees them.

use crate::config::EngineConfig;
use crate::raster;
use crate::types::{BoundingBox, Detection, GrayFrame};

const ASPECT_RATIO_MIN: f32 = 0.5;
const ASPECT_RATIO_MAX: f32 = 2.0;

// Empirical normalization divisors for the blended score.
const SHARPNESS_DIVISOR: f32 = 1000.0;
const CONTRAST_DIVISOR: f32 = 64.0;
const BRIGHTNESS_TARGET: f32 = 128.0;

const SHARPNESS_WEIGHT: f32 = 0.4;
const BRIGHTNESS_WEIGHT: f32 = 0.3;
const CONTRAST_WEIGHT: f32 = 0.3;

/// Confidence gate selection. `High` is used on critical paths (enrollment),
/// where a marginal detection is worse than no detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Default,
    High,
}

/// Why a detection was rejected before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TooSmall,
    TooLarge,
    OutOfBounds,
    AspectRatio,
}

/// Outcome of evaluating one detection.
#[derive(Debug, Clone, Copy)]
pub struct QualityAssessment {
    pub accepted: bool,
    /// Blended usability score in [0, 1]; 0 when rejected.
    pub score: f32,
    pub reject_reason: Option<RejectReason>,
}

/// Geometry and usability filter for raw detections.
#[derive(Debug, Clone)]
pub struct QualityFilter {
    min_face_size: f32,
    max_face_size: f32,
    confidence: f32,
    confidence_high: f32,
}

impl QualityFilter {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            min_face_size: cfg.min_face_size,
            max_face_size: cfg.max_face_size,
            confidence: cfg.detection_confidence,
            confidence_high: cfg.detection_confidence_high,
        }
    }

    /// The active confidence gate for the given precision mode.
    pub fn confidence_gate(&self, precision: Precision) -> f32 {
        match precision {
            Precision::Default => self.confidence,
            Precision::High => self.confidence_high,
        }
    }

    fn geometry_check(&self, bbox: &BoundingBox, frame: &GrayFrame<'_>) -> Option<RejectReason> {
        let w = bbox.width();
        let h = bbox.height();

        if w < self.min_face_size || h < self.min_face_size {
            return Some(RejectReason::TooSmall);
        }
        if w > self.max_face_size || h > self.max_face_size {
            return Some(RejectReason::TooLarge);
        }
        if !bbox.within(frame.width, frame.height) {
            return Some(RejectReason::OutOfBounds);
        }
        let ar = bbox.aspect_ratio();
        if !(ASPECT_RATIO_MIN..=ASPECT_RATIO_MAX).contains(&ar) {
            return Some(RejectReason::AspectRatio);
        }
        None
    }

    /// Evaluate one detection bounding box against the source frame.
    pub fn evaluate(&self, bbox: &BoundingBox, frame: &GrayFrame<'_>) -> QualityAssessment {
        if let Some(reason) = self.geometry_check(bbox, frame) {
            return QualityAssessment {
                accepted: false,
                score: 0.0,
                reject_reason: Some(reason),
            };
        }

        let score = match raster::crop(frame, bbox) {
            Some(patch) => blended_score(&patch),
            // Zero-area crop: geometrically fine but unusable.
            None => 0.0,
        };

        QualityAssessment {
            accepted: true,
            score,
            reject_reason: None,
        }
    }

    /// Gate, score and rank raw detections.
    ///
    /// Detections below the active confidence gate are discarded before the
    /// quality evaluation runs. Survivors carry their score in
    /// [`Detection::quality`] and are ordered by confidence × quality
    /// descending, so the first entry is the single best face.
    pub fn filter_detections(
        &self,
        frame: &GrayFrame<'_>,
        detections: Vec<Detection>,
        precision: Precision,
    ) -> Vec<Detection> {
        let gate = self.confidence_gate(precision);

        let mut accepted: Vec<Detection> = detections
            .into_iter()
            .filter(|d| d.confidence >= gate)
            .filter_map(|mut d| {
                let assessment = self.evaluate(&d.bbox, frame);
                if assessment.accepted {
                    d.quality = assessment.score;
                    Some(d)
                } else {
                    tracing::debug!(reason = ?assessment.reject_reason, "detection rejected");
                    None
                }
            })
            .collect();

        accepted.sort_by(|a, b| {
            let ka = a.confidence * a.quality;
            let kb = b.confidence * b.quality;
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });

        accepted
    }
}

/// Blend sharpness, brightness and contrast into one [0, 1] score.
fn blended_score(patch: &raster::GrayPatch) -> f32 {
    let sharpness = (raster::laplacian_variance(patch) / SHARPNESS_DIVISOR).min(1.0);
    let brightness = 1.0 - (raster::mean(&patch.data) - BRIGHTNESS_TARGET).abs() / BRIGHTNESS_TARGET;
    let contrast = (raster::stddev(&patch.data) / CONTRAST_DIVISOR).min(1.0);

    (sharpness * SHARPNESS_WEIGHT + brightness * BRIGHTNESS_WEIGHT + contrast * CONTRAST_WEIGHT)
        .clamp(0.0, 1.0)
}
