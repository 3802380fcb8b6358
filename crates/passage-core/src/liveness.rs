//! Temporal liveness detection.
//!
//! A printed photograph held in front of the camera produces a face that
//! neither moves, changes texture, nor blinks. A live subject exhibits
//! involuntary head sway, frame-to-frame texture variation from micro
//! movement and sensor noise, and periodic blinks. This module fuses those
//! three signals over a bounded frame history into a single verdict.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and static screen images (no motion, no
//!   texture variation), most crude replays (no blink when landmarks are
//!   available).
//! - **Does not block:** High-quality video replays with natural motion and
//!   blinks, or 3D masks.
//!
//! One [`LivenessSession`] belongs to exactly one verification attempt or
//! camera stream. Sharing a session across subjects corrupts the motion and
//! texture baselines; owners must [`reset`](LivenessSession::reset) between
//! unrelated attempts.

use std::collections::VecDeque;

use crate::config::LivenessConfig;
use crate::raster;
use crate::types::{BoundingBox, FrameSample, GrayFrame};

/// Side length of the fixed analysis crop used for texture scoring.
const ANALYSIS_SIZE: usize = 64;

/// Landmark count required before blink detection activates (two 6-point eye
/// groups).
const MIN_BLINK_LANDMARKS: usize = 12;

/// EAR samples needed before the falling-edge detector may fire.
const MIN_EAR_SAMPLES: usize = 3;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// History is below the required frame count; every verdict is `false`.
    Collecting,
    /// Enough history has accumulated; the verdict is recomputed per frame.
    Evaluating,
}

/// Raw signal values and per-signal outcomes, for audit logging.
#[derive(Debug, Clone, Copy)]
pub struct LivenessStats {
    pub movement: f32,
    pub texture_variance: f32,
    pub blink_count: u32,
    pub frames_analyzed: usize,
    pub movement_passed: bool,
    pub texture_passed: bool,
    pub blink_passed: bool,
    pub liveness_passed: bool,
}

/// Bounded-history liveness state machine for one verification attempt.
pub struct LivenessSession {
    cfg: LivenessConfig,
    positions: VecDeque<FrameSample>,
    textures: VecDeque<f32>,
    ears: VecDeque<f32>,
    blink_count: u32,
}

impl LivenessSession {
    pub fn new(cfg: LivenessConfig) -> Self {
        let cap = cfg.history_len;
        Self {
            cfg,
            positions: VecDeque::with_capacity(cap),
            textures: VecDeque::with_capacity(cap),
            ears: VecDeque::with_capacity(cap),
            blink_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.textures.len() >= self.cfg.frames_required {
            SessionState::Evaluating
        } else {
            SessionState::Collecting
        }
    }

    /// Feed one frame and recompute the verdict.
    ///
    /// Returns `false` while collecting, when the face crop is empty (no
    /// state is mutated in that case), or when any fused signal fails.
    pub fn add_frame(
        &mut self,
        frame: &GrayFrame<'_>,
        bbox: &BoundingBox,
        landmarks: Option<&[(f32, f32)]>,
    ) -> bool {
        let Some(patch) = raster::crop(frame, bbox) else {
            tracing::debug!("empty face crop, frame ignored");
            return false;
        };

        let resized = raster::resize_bilinear(&patch, ANALYSIS_SIZE, ANALYSIS_SIZE);
        let texture = raster::laplacian_variance(&resized);

        self.textures.push_back(texture);
        self.positions.push_back(FrameSample::from_bbox(bbox));
        while self.textures.len() > self.cfg.history_len {
            self.textures.pop_front();
            self.positions.pop_front();
        }

        if self.cfg.blink_detection {
            if let Some(points) = landmarks {
                if points.len() >= MIN_BLINK_LANDMARKS {
                    let ear = eye_aspect_ratio(points);
                    self.ears.push_back(ear);
                    while self.ears.len() > self.cfg.history_len {
                        self.ears.pop_front();
                    }
                    self.detect_blink();
                }
            }
        }

        if self.textures.len() < self.cfg.frames_required {
            return false;
        }

        let verdict = self.evaluate();
        tracing::trace!(
            texture,
            blink_count = self.blink_count,
            verdict,
            "liveness frame evaluated"
        );
        verdict
    }

    /// Falling-edge blink detector: the latest EAR crossed below the
    /// threshold while the previous sample was at or above it. A held-low
    /// EAR series counts once per crossing, not once per frame.
    fn detect_blink(&mut self) {
        if self.ears.len() < MIN_EAR_SAMPLES {
            return;
        }
        let current = self.ears[self.ears.len() - 1];
        let previous = self.ears[self.ears.len() - 2];
        if current < self.cfg.ear_threshold && previous >= self.cfg.ear_threshold {
            self.blink_count += 1;
            tracing::debug!(count = self.blink_count, "blink registered");
        }
    }

    fn evaluate(&self) -> bool {
        self.movement() >= self.cfg.movement_threshold
            && self.texture_variance() >= self.cfg.texture_variance_threshold
            && self.blink_ok()
    }

    /// Mean Euclidean distance between consecutive centers over the most
    /// recent required window.
    fn movement(&self) -> f32 {
        let n = self.positions.len().min(self.cfg.frames_required);
        if n < 2 {
            return 0.0;
        }
        let recent: Vec<&FrameSample> = self
            .positions
            .iter()
            .skip(self.positions.len() - n)
            .collect();

        let total: f32 = recent
            .windows(2)
            .map(|pair| {
                let dx = pair[1].cx - pair[0].cx;
                let dy = pair[1].cy - pair[0].cy;
                (dx * dx + dy * dy).sqrt()
            })
            .sum();
        total / (n - 1) as f32
    }

    /// Population variance of the recent texture scores. A static photo's
    /// texture is stable; a live face flickers.
    fn texture_variance(&self) -> f32 {
        let n = self.textures.len().min(self.cfg.frames_required);
        if n < 2 {
            return 0.0;
        }
        let recent: Vec<f64> = self
            .textures
            .iter()
            .skip(self.textures.len() - n)
            .map(|&t| t as f64)
            .collect();

        let mean = recent.iter().sum::<f64>() / n as f64;
        let var = recent.iter().map(|t| (t - mean) * (t - mean)).sum::<f64>() / n as f64;
        var as f32
    }

    /// Blink gate. Passes when disabled or when too few EAR samples exist to
    /// judge (no landmarks, short stream) — insufficient data does not
    /// penalize. Otherwise at least one registered blink is required.
    fn blink_ok(&self) -> bool {
        if !self.cfg.blink_detection {
            return true;
        }
        if self.ears.len() < self.cfg.frames_required {
            return true;
        }
        self.blink_count > 0
    }

    pub fn stats(&self) -> LivenessStats {
        let movement = self.movement();
        let texture_variance = self.texture_variance();
        let movement_passed = movement >= self.cfg.movement_threshold;
        let texture_passed = texture_variance >= self.cfg.texture_variance_threshold;
        let blink_passed = self.blink_ok();
        LivenessStats {
            movement,
            texture_variance,
            blink_count: self.blink_count,
            frames_analyzed: self.textures.len(),
            movement_passed,
            texture_passed,
            blink_passed,
            liveness_passed: self.state() == SessionState::Evaluating
                && movement_passed
                && texture_passed
                && blink_passed,
        }
    }

    /// Clear all history. Must be called before reusing the session for an
    /// unrelated verification attempt.
    pub fn reset(&mut self) {
        self.positions.clear();
        self.textures.clear();
        self.ears.clear();
        self.blink_count = 0;
    }
}

/// Average eye-aspect-ratio across the two 6-point eye landmark groups.
///
/// Per eye: EAR = (‖p1−p5‖ + ‖p2−p4‖) / (2·‖p0−p3‖), where p0/p3 are the
/// horizontal corners and the other points the upper/lower lids. Drops
/// sharply when the eye closes.
fn eye_aspect_ratio(points: &[(f32, f32)]) -> f32 {
    let left = single_eye_ear(&points[0..6]);
    let right = single_eye_ear(&points[6..12]);
    (left + right) / 2.0
}

fn single_eye_ear(eye: &[(f32, f32)]) -> f32 {
    let vertical_a = dist(eye[1], eye[5]);
    let vertical_b = dist(eye[2], eye[4]);
    let horizontal = dist(eye[0], eye[3]);
    if horizontal <= f32::EPSILON {
        return 0.0;
    }
    (vertical_a + vertical_b) / (2.0 * horizontal)
}

fn dist(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LivenessConfig;

    const W: u32 = 96;
    const H: u32 = 96;

    fn flat_frame() -> Vec<u8> {
        vec![128u8; (W * H) as usize]
    }

    fn checker_frame() -> Vec<u8> {
        (0..(W * H) as usize)
            .map(|i| {
                let x = i % W as usize;
                let y = i / W as usize;
                if (x + y) % 2 == 0 {
                    0
                } else {
                    255
                }
            })
            .collect()
    }

    fn bbox_at(offset: f32) -> BoundingBox {
        BoundingBox {
            x1: offset,
            y1: offset,
            x2: offset + 64.0,
            y2: offset + 64.0,
        }
    }

    /// Two identical 6-point eyes whose EAR equals `ear` exactly.
    fn landmarks_with_ear(ear: f32) -> Vec<(f32, f32)> {
        let eye = [
            (0.0, 0.0),
            (0.5, ear),
            (1.5, ear),
            (2.0, 0.0),
            (1.5, -ear),
            (0.5, -ear),
        ];
        eye.iter().chain(eye.iter()).copied().collect()
    }

    fn session() -> LivenessSession {
        LivenessSession::new(LivenessConfig::default())
    }

    #[test]
    fn single_eye_ear_geometry() {
        let eye = [
            (0.0, 0.0),
            (1.0, 1.0),
            (2.0, 1.0),
            (3.0, 0.0),
            (2.0, -1.0),
            (1.0, -1.0),
        ];
        // A = 2, B = 2, C = 3 → (2+2)/(2*3)
        assert!((single_eye_ear(&eye) - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn landmark_helper_produces_requested_ear() {
        let lm = landmarks_with_ear(0.3);
        assert!((eye_aspect_ratio(&lm) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn collecting_until_required_frames() {
        let mut s = session();
        let data = checker_frame();
        let frame = GrayFrame::new(&data, W, H).unwrap();

        assert!(!s.add_frame(&frame, &bbox_at(0.0), None));
        assert_eq!(s.state(), SessionState::Collecting);
        assert!(!s.add_frame(&frame, &bbox_at(8.0), None));
        assert_eq!(s.state(), SessionState::Collecting);
        // Third frame crosses the window; verdict is now computed.
        s.add_frame(&frame, &bbox_at(16.0), None);
        assert_eq!(s.state(), SessionState::Evaluating);
    }

    #[test]
    fn static_photo_is_rejected() {
        let mut s = session();
        let data = flat_frame();
        let frame = GrayFrame::new(&data, W, H).unwrap();
        let bbox = bbox_at(10.0);

        for _ in 0..5 {
            assert!(!s.add_frame(&frame, &bbox, None));
        }

        let stats = s.stats();
        assert!(!stats.liveness_passed);
        assert!(stats.movement < 1e-6);
        assert!(stats.texture_variance < 1e-6);
        assert!(!stats.movement_passed);
        assert!(!stats.texture_passed);
    }

    #[test]
    fn live_sequence_passes() {
        let mut s = session();
        let checker = checker_frame();
        let flat = flat_frame();

        // Motion: the box drifts. Texture: crop content alternates between
        // high-frequency and flat. Blink: EAR dips below 0.25 and recovers.
        let frames: [(&Vec<u8>, f32, f32); 4] = [
            (&checker, 0.0, 0.3),
            (&flat, 8.0, 0.3),
            (&checker, 16.0, 0.15),
            (&flat, 24.0, 0.3),
        ];

        let mut last = false;
        for (data, offset, ear) in frames {
            let frame = GrayFrame::new(data, W, H).unwrap();
            last = s.add_frame(&frame, &bbox_at(offset), Some(&landmarks_with_ear(ear)));
        }

        let stats = s.stats();
        assert!(stats.movement_passed, "movement = {}", stats.movement);
        assert!(
            stats.texture_passed,
            "texture variance = {}",
            stats.texture_variance
        );
        assert_eq!(stats.blink_count, 1);
        assert!(stats.blink_passed);
        assert!(last, "final verdict should be live");
    }

    #[test]
    fn no_motion_fails_even_with_texture_and_blink() {
        let mut s = session();
        let checker = checker_frame();
        let flat = flat_frame();
        let bbox = bbox_at(0.0);

        let frames: [(&Vec<u8>, f32); 4] =
            [(&checker, 0.3), (&flat, 0.3), (&checker, 0.15), (&flat, 0.3)];

        let mut last = true;
        for (data, ear) in frames {
            let frame = GrayFrame::new(data, W, H).unwrap();
            last = s.add_frame(&frame, &bbox, Some(&landmarks_with_ear(ear)));
        }

        assert!(!last);
        let stats = s.stats();
        assert!(!stats.movement_passed);
        assert!(stats.texture_passed);
        assert!(stats.blink_passed);
    }

    #[test]
    fn held_low_ear_counts_a_single_blink_per_crossing() {
        let mut s = session();
        let checker = checker_frame();
        let flat = flat_frame();

        // Two crossings with a long closed stretch in the middle.
        let ears = [0.3, 0.3, 0.1, 0.1, 0.1, 0.3, 0.1];
        for (i, &ear) in ears.iter().enumerate() {
            let data = if i % 2 == 0 { &checker } else { &flat };
            let frame = GrayFrame::new(data, W, H).unwrap();
            s.add_frame(
                &frame,
                &bbox_at(i as f32 * 4.0),
                Some(&landmarks_with_ear(ear)),
            );
        }

        assert_eq!(s.stats().blink_count, 2);
    }

    #[test]
    fn missing_landmarks_do_not_penalize() {
        let mut s = session();
        let checker = checker_frame();
        let flat = flat_frame();

        // Moving, texture-varying stream with no landmarks at all: the blink
        // gate passes on insufficient data. (Inherited policy — a short or
        // landmark-less stream can be granted liveness without a blink.)
        let frames: [(&Vec<u8>, f32); 3] = [(&checker, 0.0), (&flat, 8.0), (&checker, 16.0)];
        let mut last = false;
        for (data, offset) in frames {
            let frame = GrayFrame::new(data, W, H).unwrap();
            last = s.add_frame(&frame, &bbox_at(offset), None);
        }

        assert!(last);
        assert!(s.stats().blink_passed);
        assert_eq!(s.stats().blink_count, 0);
    }

    #[test]
    fn blink_required_once_enough_ear_samples_exist() {
        let mut s = session();
        let checker = checker_frame();
        let flat = flat_frame();

        // Eyes stay wide open the whole time — no falling edge.
        let frames: [(&Vec<u8>, f32); 4] = [
            (&checker, 0.0),
            (&flat, 8.0),
            (&checker, 16.0),
            (&flat, 24.0),
        ];
        let mut last = true;
        for (data, offset) in frames {
            let frame = GrayFrame::new(data, W, H).unwrap();
            last = s.add_frame(&frame, &bbox_at(offset), Some(&landmarks_with_ear(0.35)));
        }

        assert!(!last);
        let stats = s.stats();
        assert!(stats.movement_passed);
        assert!(stats.texture_passed);
        assert!(!stats.blink_passed);
    }

    #[test]
    fn blink_detection_disabled_skips_the_gate() {
        let cfg = LivenessConfig {
            blink_detection: false,
            ..LivenessConfig::default()
        };
        let mut s = LivenessSession::new(cfg);
        let checker = checker_frame();
        let flat = flat_frame();

        let frames: [(&Vec<u8>, f32); 3] = [(&checker, 0.0), (&flat, 8.0), (&checker, 16.0)];
        let mut last = false;
        for (data, offset) in frames {
            let frame = GrayFrame::new(data, W, H).unwrap();
            // Open eyes throughout; would fail if the gate were active.
            last = s.add_frame(&frame, &bbox_at(offset), Some(&landmarks_with_ear(0.35)));
        }
        assert!(last);
    }

    #[test]
    fn empty_crop_mutates_nothing() {
        let mut s = session();
        let data = flat_frame();
        let frame = GrayFrame::new(&data, W, H).unwrap();
        let outside = BoundingBox {
            x1: 500.0,
            y1: 500.0,
            x2: 600.0,
            y2: 600.0,
        };

        assert!(!s.add_frame(&frame, &outside, None));
        assert_eq!(s.stats().frames_analyzed, 0);
        assert_eq!(s.state(), SessionState::Collecting);
    }

    #[test]
    fn history_ring_is_bounded() {
        let mut s = session();
        let data = checker_frame();
        let frame = GrayFrame::new(&data, W, H).unwrap();

        for i in 0..25 {
            s.add_frame(&frame, &bbox_at((i % 4) as f32), None);
        }
        assert_eq!(s.stats().frames_analyzed, 10);
    }

    #[test]
    fn reset_clears_all_state() {
        let mut s = session();
        let checker = checker_frame();
        let frame = GrayFrame::new(&checker, W, H).unwrap();

        for i in 0..4 {
            s.add_frame(
                &frame,
                &bbox_at(i as f32 * 8.0),
                Some(&landmarks_with_ear(if i == 2 { 0.1 } else { 0.3 })),
            );
        }
        assert!(s.stats().frames_analyzed > 0);

        s.reset();
        let stats = s.stats();
        assert_eq!(stats.frames_analyzed, 0);
        assert_eq!(stats.blink_count, 0);
        assert_eq!(s.state(), SessionState::Collecting);
    }
}
