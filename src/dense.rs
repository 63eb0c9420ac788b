// =============================================================================
// LAGRANGE RELAY — dense.rs
// «Dense interpolation — displacement field between two keyframes»
// =============================================================================
//
//   1. estimate_flow()  — block matching on luma (SAD, ±SEARCH_RADIUS px)
//   2. warp()           — backward warp of the earlier frame by α·flow
//   3. blend            — (1 - 0.3α)·warped + 0.3α·later
//
// Flow field is per pixel: every pixel carries its block's displacement.
// =============================================================================

use ndarray::{Array2, Array3};

use crate::error::{RelayError, Result};
use crate::predictor::Interpolable;
use crate::quality::{self, QualityReport};
use crate::raster::Raster;

pub const BLOCK_SIZE: usize = 8;
pub const SEARCH_RADIUS: isize = 7;
pub const BLEND_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    pub dx: Array2<f64>,
    pub dy: Array2<f64>,
}

impl FlowField {
    pub fn at(&self, y: usize, x: usize) -> (f64, f64) {
        (self.dx[[y, x]], self.dy[[y, x]])
    }

    pub fn mean_magnitude(&self) -> f64 {
        let n = self.dx.len().max(1) as f64;
        self.dx
            .iter()
            .zip(self.dy.iter())
            .map(|(dx, dy)| (dx * dx + dy * dy).sqrt())
            .sum::<f64>()
            / n
    }
}

fn block_sad(
    prev: &Array2<f64>,
    next: &Array2<f64>,
    (by, bx): (usize, usize),
    (bh, bw): (usize, usize),
    (oy, ox): (isize, isize),
) -> f64 {
    let mut sad = 0.0;
    for y in 0..bh {
        for x in 0..bw {
            let ty = (by + y) as isize + oy;
            let tx = (bx + x) as isize + ox;
            sad += (prev[[by + y, bx + x]] - next[[ty as usize, tx as usize]]).abs();
        }
    }
    sad
}

/// Displacement of each block of `prev` that best explains `next`.
/// Ties go to the smaller displacement, so flat regions report no motion.
pub fn estimate_flow(prev: &Array2<f64>, next: &Array2<f64>) -> FlowField {
    let (h, w) = prev.dim();
    let mut dx = Array2::zeros((h, w));
    let mut dy = Array2::zeros((h, w));

    for by in (0..h).step_by(BLOCK_SIZE) {
        for bx in (0..w).step_by(BLOCK_SIZE) {
            let bh = BLOCK_SIZE.min(h - by);
            let bw = BLOCK_SIZE.min(w - bx);
            let mut best = (block_sad(prev, next, (by, bx), (bh, bw), (0, 0)), 0isize, 0isize);

            for oy in -SEARCH_RADIUS..=SEARCH_RADIUS {
                for ox in -SEARCH_RADIUS..=SEARCH_RADIUS {
                    let top = by as isize + oy;
                    let left = bx as isize + ox;
                    if top < 0 || left < 0 || top + bh as isize > h as isize || left + bw as isize > w as isize {
                        continue;
                    }
                    let sad = block_sad(prev, next, (by, bx), (bh, bw), (oy, ox));
                    let closer = ox * ox + oy * oy < best.1 * best.1 + best.2 * best.2;
                    if sad < best.0 || (sad == best.0 && closer) {
                        best = (sad, ox, oy);
                    }
                }
            }

            for y in by..by + bh {
                for x in bx..bx + bw {
                    dx[[y, x]] = best.1 as f64;
                    dy[[y, x]] = best.2 as f64;
                }
            }
        }
    }
    FlowField { dx, dy }
}

/// Intermediate frame at `alpha`: earlier frame moved α of the way along the
/// flow, then lightly blended toward the later frame.
pub fn synthesize(prev: &Raster, next: &Raster, flow: &FlowField, alpha: f64) -> Raster {
    let (h, w, c) = prev.pixels.dim();
    let keep = 1.0 - alpha * BLEND_WEIGHT;
    let mix = alpha * BLEND_WEIGHT;
    let pixels = Array3::from_shape_fn((h, w, c), |(y, x, ch)| {
        let (fx, fy) = flow.at(y, x);
        let warped = prev.sample_bilinear(x as f64 - alpha * fx, y as f64 - alpha * fy, ch);
        let blended = keep * warped + mix * next.pixels[[y, x, ch]] as f64;
        blended.round().clamp(0.0, 255.0) as u8
    });
    Raster::from_pixels(pixels)
}

impl Interpolable for Raster {
    const VERSION: &'static str = "optical_flow_v1";

    fn decode(bytes: &[u8]) -> Result<Self> {
        Raster::decode(bytes)
    }

    fn encode(&self) -> Vec<u8> {
        Raster::encode(self)
    }

    fn interpolate(from: &Self, to: &Self, slots: usize) -> Result<(Vec<Self>, f64)> {
        if !from.same_shape(to) {
            return Err(RelayError::ShapeMismatch(format!(
                "keyframes {:?} and {:?}",
                from.pixels.dim(),
                to.pixels.dim()
            )));
        }
        let flow = estimate_flow(&from.luma(), &to.luma());
        let frames = (1..=slots)
            .map(|i| synthesize(from, to, &flow, i as f64 / (slots + 1) as f64))
            .collect();
        Ok((frames, flow.mean_magnitude()))
    }

    fn assess(synthesized: &Self, reference: &Self) -> Result<QualityReport> {
        quality::assess_raster(synthesized, reference)
    }
}
