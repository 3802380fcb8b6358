use serde::{Deserialize, Serialize};

/// Embedding dimension produced by the upstream face embedder (ArcFace-class
/// models emit 512 floats).
pub const EMBEDDING_DIM: usize = 512;

/// Face bounding box in source-image pixel space.
///
/// Invariant: `x1 < x2` and `y1 < y2` for any box produced by the detector.
/// Boxes are validated (bounds, size, aspect ratio) by the quality filter
/// before they are trusted as identity evidence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Width-over-height ratio. Zero-height boxes yield infinity, which the
    /// quality filter rejects along with every other degenerate shape.
    pub fn aspect_ratio(&self) -> f32 {
        self.width() / self.height()
    }

    /// Whether the box lies entirely inside an image of the given size.
    pub fn within(&self, width: u32, height: u32) -> bool {
        self.x1 >= 0.0 && self.y1 >= 0.0 && self.x2 <= width as f32 && self.y2 <= height as f32
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn l2_norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Return a unit-length copy, or `None` when the vector is degenerate
    /// (zero-length or non-finite norm). Callers must fail closed on `None`.
    pub fn normalized(&self) -> Option<Embedding> {
        let norm = self.l2_norm();
        if !norm.is_finite() || norm <= f32::EPSILON {
            return None;
        }
        Some(Embedding {
            values: self.values.iter().map(|v| v / norm).collect(),
        })
    }

    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Cosine similarity in [-1, 1]. Always processes all dimensions; a
    /// degenerate operand yields 0.0 rather than NaN.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

/// One detected face as delivered by the external detector/embedder.
///
/// Ephemeral — produced per frame, never persisted. `quality` is 0 until the
/// quality filter has scored the detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    pub embedding: Embedding,
    /// Facial landmark points; ≥12 points activate blink detection.
    pub landmarks: Option<Vec<(f32, f32)>>,
    /// Blended quality score in [0, 1], assigned by the quality filter.
    #[serde(default)]
    pub quality: f32,
}

/// Canonical (center, size) form of a bounding box, used by the liveness
/// motion analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameSample {
    pub cx: f32,
    pub cy: f32,
    pub width: f32,
    pub height: f32,
}

impl FrameSample {
    pub fn from_bbox(bbox: &BoundingBox) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            cx,
            cy,
            width: bbox.width(),
            height: bbox.height(),
        }
    }
}

/// Borrowed view of a grayscale raster (`width * height` bytes, row-major).
#[derive(Debug, Clone, Copy)]
pub struct GrayFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

impl<'a> GrayFrame<'a> {
    /// Construct a frame view, rejecting a buffer shorter than the claimed
    /// dimensions.
    pub fn new(data: &'a [u8], width: u32, height: u32) -> Option<Self> {
        if data.len() < (width as usize) * (height as usize) {
            return None;
        }
        Some(Self {
            data,
            width,
            height,
        })
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x < self.width && y < self.height {
            Some(self.data[y as usize * self.width as usize + x as usize])
        } else {
            None
        }
    }
}
