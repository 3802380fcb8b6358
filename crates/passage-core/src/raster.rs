//! Grayscale raster helpers shared by the quality filter and the liveness
//! texture analysis: cropping, bilinear resize, and Laplacian statistics.

use crate::types::{BoundingBox, GrayFrame};

/// An owned grayscale crop.
#[derive(Debug, Clone)]
pub struct GrayPatch {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

/// Extract the face region covered by `bbox`, clamped to the frame.
///
/// Coordinates are truncated to whole pixels. Returns `None` when the
/// clamped region has zero area.
pub fn crop(frame: &GrayFrame<'_>, bbox: &BoundingBox) -> Option<GrayPatch> {
    let fw = frame.width as i64;
    let fh = frame.height as i64;

    let x1 = (bbox.x1 as i64).clamp(0, fw);
    let y1 = (bbox.y1 as i64).clamp(0, fh);
    let x2 = (bbox.x2 as i64).clamp(0, fw);
    let y2 = (bbox.y2 as i64).clamp(0, fh);

    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let width = (x2 - x1) as usize;
    let height = (y2 - y1) as usize;
    let stride = frame.width as usize;

    let mut data = Vec::with_capacity(width * height);
    for y in y1..y2 {
        let row = y as usize * stride;
        data.extend_from_slice(&frame.data[row + x1 as usize..row + x2 as usize]);
    }

    Some(GrayPatch {
        data,
        width,
        height,
    })
}

/// Resize a patch with bilinear interpolation.
pub fn resize_bilinear(patch: &GrayPatch, out_width: usize, out_height: usize) -> GrayPatch {
    let mut data = vec![0u8; out_width * out_height];
    if patch.width == 0 || patch.height == 0 || out_width == 0 || out_height == 0 {
        return GrayPatch {
            data,
            width: out_width,
            height: out_height,
        };
    }

    let sx = patch.width as f32 / out_width as f32;
    let sy = patch.height as f32 / out_height as f32;

    for oy in 0..out_height {
        for ox in 0..out_width {
            let src_x = (ox as f32 + 0.5) * sx - 0.5;
            let src_y = (oy as f32 + 0.5) * sy - 0.5;

            let x0 = src_x.floor().max(0.0) as usize;
            let y0 = src_y.floor().max(0.0) as usize;
            let x1 = (x0 + 1).min(patch.width - 1);
            let y1 = (y0 + 1).min(patch.height - 1);
            let fx = (src_x - x0 as f32).clamp(0.0, 1.0);
            let fy = (src_y - y0 as f32).clamp(0.0, 1.0);

            let sample = |x: usize, y: usize| patch.data[y * patch.width + x] as f32;

            let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
                + sample(x1, y0) * fx * (1.0 - fy)
                + sample(x0, y1) * (1.0 - fx) * fy
                + sample(x1, y1) * fx * fy;

            data[oy * out_width + ox] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    GrayPatch {
        data,
        width: out_width,
        height: out_height,
    }
}

/// Mean pixel intensity.
pub fn mean(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&v| v as f64).sum::<f64>() as f32 / data.len() as f32
}

/// Population standard deviation of pixel intensity.
pub fn stddev(data: &[u8]) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let m = mean(data) as f64;
    let var = data
        .iter()
        .map(|&v| {
            let d = v as f64 - m;
            d * d
        })
        .sum::<f64>()
        / data.len() as f64;
    var.sqrt() as f32
}

/// Variance of the 4-neighbor Laplacian response over the patch interior.
///
/// High values indicate sharp edge structure; a defocused or printed-and-
/// rephotographed face scores low. Patches thinner than 3 pixels have no
/// interior and score 0.
pub fn laplacian_variance(patch: &GrayPatch) -> f32 {
    let w = patch.width;
    let h = patch.height;
    if w < 3 || h < 3 {
        return 0.0;
    }

    let px = |x: usize, y: usize| patch.data[y * w + x] as f64;

    let mut responses = Vec::with_capacity((w - 2) * (h - 2));
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap =
                px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            responses.push(lap);
        }
    }

    let n = responses.len() as f64;
    let m = responses.iter().sum::<f64>() / n;
    let var = responses.iter().map(|r| (r - m) * (r - m)).sum::<f64>() / n;
    var as f32
}
