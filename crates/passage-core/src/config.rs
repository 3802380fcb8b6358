//! Engine configuration.
//!
//! All thresholds live in one validated structure passed to the engine at
//! construction. There are no mutable globals; two engines with different
//! configurations can coexist in one process.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        min: f32,
        max: f32,
        value: f32,
    },
    #[error("recognition thresholds must satisfy strict <= default <= relaxed, got {strict} / {default} / {relaxed}")]
    ThresholdOrdering {
        strict: f32,
        default: f32,
        relaxed: f32,
    },
    #[error("liveness frames_required must be at least 2 and no larger than history_len ({history_len}), got {frames_required}")]
    FrameWindow {
        frames_required: usize,
        history_len: usize,
    },
    #[error("min_face_size ({min}) must not exceed max_face_size ({max})")]
    FaceSizeOrdering { min: f32, max: f32 },
}

/// Thresholds for the liveness state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Frames that must accumulate before a verdict is computed.
    pub frames_required: usize,
    /// Ring capacity for position/texture/EAR history.
    pub history_len: usize,
    /// Minimum mean inter-frame center displacement (pixels).
    pub movement_threshold: f32,
    /// Minimum variance of the recent texture scores.
    pub texture_variance_threshold: f32,
    /// Whether blink detection participates in the verdict.
    pub blink_detection: bool,
    /// Eye-aspect-ratio value below which an eye counts as closed.
    pub ear_threshold: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            frames_required: 3,
            history_len: 10,
            movement_threshold: 0.1,
            texture_variance_threshold: 50.0,
            blink_detection: true,
            ear_threshold: 0.25,
        }
    }
}

/// Full decision-engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Detection confidence gate, default precision.
    pub detection_confidence: f32,
    /// Detection confidence gate, high precision (enrollment and other
    /// critical paths).
    pub detection_confidence_high: f32,
    /// Maximum cosine distance for a positive match.
    pub recognition_threshold: f32,
    /// Tightened threshold applied when the top-2 candidates are ambiguous.
    pub recognition_threshold_strict: f32,
    /// Relaxed threshold applied when the best candidate is clearly separated.
    pub recognition_threshold_relaxed: f32,
    /// Minimum face side length in pixels.
    pub min_face_size: f32,
    /// Maximum face side length in pixels.
    pub max_face_size: f32,
    pub liveness: LivenessConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detection_confidence: 0.25,
            detection_confidence_high: 0.4,
            recognition_threshold: 0.4,
            recognition_threshold_strict: 0.2,
            recognition_threshold_relaxed: 0.45,
            min_face_size: 80.0,
            max_face_size: 2000.0,
            liveness: LivenessConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Check every field against its documented range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("detection_confidence", self.detection_confidence)?;
        check_unit("detection_confidence_high", self.detection_confidence_high)?;
        check_unit("recognition_threshold", self.recognition_threshold)?;
        check_unit(
            "recognition_threshold_strict",
            self.recognition_threshold_strict,
        )?;
        check_unit(
            "recognition_threshold_relaxed",
            self.recognition_threshold_relaxed,
        )?;
        check_unit("ear_threshold", self.liveness.ear_threshold)?;

        if !(self.recognition_threshold_strict <= self.recognition_threshold
            && self.recognition_threshold <= self.recognition_threshold_relaxed)
        {
            return Err(ConfigError::ThresholdOrdering {
                strict: self.recognition_threshold_strict,
                default: self.recognition_threshold,
                relaxed: self.recognition_threshold_relaxed,
            });
        }

        if self.min_face_size > self.max_face_size {
            return Err(ConfigError::FaceSizeOrdering {
                min: self.min_face_size,
                max: self.max_face_size,
            });
        }

        if self.liveness.frames_required < 2
            || self.liveness.frames_required > self.liveness.history_len
        {
            return Err(ConfigError::FrameWindow {
                frames_required: self.liveness.frames_required,
                history_len: self.liveness.history_len,
            });
        }

        if self.liveness.movement_threshold < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "movement_threshold",
                min: 0.0,
                max: f32::MAX,
                value: self.liveness.movement_threshold,
            });
        }
        if self.liveness.texture_variance_threshold < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "texture_variance_threshold",
                min: 0.0,
                max: f32::MAX,
                value: self.liveness.texture_variance_threshold,
            });
        }

        Ok(())
    }
}

fn check_unit(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        return Err(ConfigError::OutOfRange {
            field,
            min: 0.0,
            max: 1.0,
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_confidence_above_one() {
        let cfg = EngineConfig {
            detection_confidence: 1.5,
            ..EngineConfig::default()
        };
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::OutOfRange { field, .. } if field == "detection_confidence"
        ));
    }

    #[test]
    fn rejects_inverted_threshold_ordering() {
        let cfg = EngineConfig {
            recognition_threshold_strict: 0.5,
            recognition_threshold: 0.4,
            recognition_threshold_relaxed: 0.3,
            ..EngineConfig::default()
        };
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::ThresholdOrdering { .. }
        ));
    }

    #[test]
    fn rejects_window_larger_than_history() {
        let mut cfg = EngineConfig::default();
        cfg.liveness.frames_required = 20;
        cfg.liveness.history_len = 10;
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::FrameWindow { .. }
        ));
    }

    #[test]
    fn rejects_single_frame_window() {
        let mut cfg = EngineConfig::default();
        cfg.liveness.frames_required = 1;
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::FrameWindow { .. }
        ));
    }

    #[test]
    fn rejects_inverted_face_sizes() {
        let cfg = EngineConfig {
            min_face_size: 500.0,
            max_face_size: 100.0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::FaceSizeOrdering { .. }
        ));
    }
}
