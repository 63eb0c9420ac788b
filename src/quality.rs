// =============================================================================
// LAGRANGE RELAY — quality.rs
// «Quality Assessor»
// =============================================================================
//
// Diagnostic similarity between a synthesized sample and the real sample it
// approximates. Never gates emission.
//
//   Dense:  PSNR [0, 50] | SSIM (11x11 Gaussian, sigma 1.5) | histogram match %
//   Scalar: deviation proxy, explicitly approximate
// =============================================================================

use ndarray::Array2;
use serde::Serialize;

use crate::envelope::FrameMetadata;
use crate::error::{RelayError, Result};
use crate::raster::Raster;
use crate::sample::Position;

pub const PSNR_CEILING: f64 = 50.0;
pub const SSIM_C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
pub const SSIM_C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);
pub const SSIM_WINDOW: usize = 11;
pub const SSIM_SIGMA: f64 = 1.5;
pub const HIST_BINS: usize = 8;
/// Distance at which the approximate match estimate falls to 50%.
pub const APPROX_SCALE: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityReport {
    Dense { psnr: f64, ssim: f64, frame_match: f64 },
    /// Heuristic for scalar payloads, not a signal-fidelity metric.
    Approximate { deviation: f64, match_estimate: f64 },
}

impl QualityReport {
    pub fn annotate(&self, metadata: &mut FrameMetadata) {
        match *self {
            QualityReport::Dense { psnr, ssim, frame_match } => {
                metadata.psnr = Some(psnr);
                metadata.ssim = Some(ssim);
                metadata.frame_match = Some(frame_match);
            }
            QualityReport::Approximate { deviation, match_estimate } => {
                metadata.approx_deviation = Some(deviation);
                metadata.approx_match = Some(match_estimate);
            }
        }
    }
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

pub fn assess_raster(synthesized: &Raster, reference: &Raster) -> Result<QualityReport> {
    if !synthesized.same_shape(reference) {
        return Err(RelayError::ShapeMismatch(format!(
            "{:?} vs {:?}",
            synthesized.pixels.dim(),
            reference.pixels.dim()
        )));
    }
    Ok(QualityReport::Dense {
        psnr: round_to(psnr(synthesized, reference), 2),
        ssim: round_to(ssim(synthesized, reference), 4),
        frame_match: round_to(frame_match(synthesized, reference), 1),
    })
}

pub fn assess_position(predicted: &Position, reference: &Position) -> QualityReport {
    let deviation = predicted.distance(reference);
    QualityReport::Approximate {
        deviation: round_to(deviation, 2),
        match_estimate: round_to(100.0 / (1.0 + deviation / APPROX_SCALE), 1),
    }
}

// -----------------------------------------------------------------------------
// PSNR
// -----------------------------------------------------------------------------

/// 20·log10(255/√MSE) clamped to [0, 50]; identical inputs hit the ceiling.
pub fn psnr(a: &Raster, b: &Raster) -> f64 {
    let n = a.pixels.len().max(1) as f64;
    let mse = a
        .pixels
        .iter()
        .zip(b.pixels.iter())
        .map(|(&x, &y)| (x as f64 - y as f64).powi(2))
        .sum::<f64>()
        / n;
    if mse == 0.0 {
        return PSNR_CEILING;
    }
    (20.0 * (255.0 / mse.sqrt()).log10()).clamp(0.0, PSNR_CEILING)
}

// -----------------------------------------------------------------------------
// SSIM
// -----------------------------------------------------------------------------

fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f64> {
    let center = (size / 2) as f64;
    let raw: Vec<f64> = (0..size)
        .map(|i| (-((i as f64 - center).powi(2)) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.into_iter().map(|k| k / sum).collect()
}

/// Mirror index without repeating the edge sample (dcb|abcd|cba).
fn reflect101(mut i: isize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let n = n as isize;
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * n - 2 - i;
        }
    }
    i as usize
}

fn gaussian_blur(img: &Array2<f64>, kernel: &[f64]) -> Array2<f64> {
    let (h, w) = img.dim();
    let r = (kernel.len() / 2) as isize;
    let horizontal = Array2::from_shape_fn((h, w), |(y, x)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, wk)| wk * img[[y, reflect101(x as isize + k as isize - r, w)]])
            .sum::<f64>()
    });
    Array2::from_shape_fn((h, w), |(y, x)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, wk)| wk * horizontal[[reflect101(y as isize + k as isize - r, h), x]])
            .sum::<f64>()
    })
}

pub fn ssim(a: &Raster, b: &Raster) -> f64 {
    let kernel = gaussian_kernel(SSIM_WINDOW, SSIM_SIGMA);
    let x = a.luma();
    let y = b.luma();

    let mu_x = gaussian_blur(&x, &kernel);
    let mu_y = gaussian_blur(&y, &kernel);
    let xx = gaussian_blur(&(&x * &x), &kernel);
    let yy = gaussian_blur(&(&y * &y), &kernel);
    let xy = gaussian_blur(&(&x * &y), &kernel);

    let mut total = 0.0;
    for ((((mx, my), sxx), syy), sxy) in mu_x.iter().zip(mu_y.iter()).zip(xx.iter()).zip(yy.iter()).zip(xy.iter()) {
        let var_x = sxx - mx * mx;
        let var_y = syy - my * my;
        let cov = sxy - mx * my;
        total += ((2.0 * mx * my + SSIM_C1) * (2.0 * cov + SSIM_C2))
            / ((mx * mx + my * my + SSIM_C1) * (var_x + var_y + SSIM_C2));
    }
    total / mu_x.len().max(1) as f64
}

// -----------------------------------------------------------------------------
// Histogram correlation
// -----------------------------------------------------------------------------

fn histogram(r: &Raster) -> Vec<f64> {
    let channels = r.channels();
    let mut hist = vec![0.0; HIST_BINS.pow(channels as u32)];
    let bin_width = 256 / HIST_BINS;
    let (h, w, _) = r.pixels.dim();
    for y in 0..h {
        for x in 0..w {
            let mut idx = 0;
            for c in 0..channels {
                idx = idx * HIST_BINS + r.pixels[[y, x, c]] as usize / bin_width;
            }
            hist[idx] += 1.0;
        }
    }
    hist
}

fn correlation(h1: &[f64], h2: &[f64]) -> f64 {
    let n = h1.len() as f64;
    let m1 = h1.iter().sum::<f64>() / n;
    let m2 = h2.iter().sum::<f64>() / n;
    let (mut num, mut d1, mut d2) = (0.0, 0.0, 0.0);
    for (a, b) in h1.iter().zip(h2) {
        num += (a - m1) * (b - m2);
        d1 += (a - m1).powi(2);
        d2 += (b - m2).powi(2);
    }
    let denom = (d1 * d2).sqrt();
    if denom == 0.0 {
        return if h1 == h2 { 1.0 } else { 0.0 };
    }
    num / denom
}

/// Colour-histogram correlation as a 0–100 percentage.
pub fn frame_match(a: &Raster, b: &Raster) -> f64 {
    correlation(&histogram(a), &histogram(b)).clamp(0.0, 1.0) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn gradient(w: usize, h: usize, shift: usize) -> Raster {
        Raster::from_pixels(Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            (((x + shift) * 7 + y * 3 + c * 40) % 256) as u8
        }))
    }

    #[test]
    fn test_identical_rasters_hit_ceilings() {
        let r = gradient(24, 16, 0);
        match assess_raster(&r, &r).unwrap() {
            QualityReport::Dense { psnr, ssim, frame_match } => {
                assert_eq!(psnr, PSNR_CEILING);
                assert!((ssim - 1.0).abs() < 1e-4);
                assert!((frame_match - 100.0).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_psnr_known_value() {
        let a = Raster::new(8, 8, 1);
        let mut b = Raster::new(8, 8, 1);
        b.pixels.fill(16);
        // MSE = 256 → 20·log10(255/16)
        let expected = 20.0 * (255.0f64 / 16.0).log10();
        assert!((psnr(&a, &b) - expected).abs() < 1e-9);

        let mut white = Raster::new(8, 8, 1);
        white.pixels.fill(255);
        assert!(psnr(&a, &white) >= 0.0);
    }

    #[test]
    fn test_ssim_drops_with_distortion() {
        let a = gradient(32, 32, 0);
        let mut slight = a.clone();
        slight.pixels.mapv_inplace(|p| p.saturating_add(2));
        let mut noisy = a.clone();
        for (i, p) in noisy.pixels.iter_mut().enumerate() {
            *p = p.wrapping_add(((i * 37) % 97) as u8);
        }
        let s_slight = ssim(&a, &slight);
        let s_noisy = ssim(&a, &noisy);
        assert!(s_slight < 1.0);
        assert!(s_noisy < s_slight);
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        assert!(matches!(
            assess_raster(&Raster::new(4, 4, 1), &Raster::new(5, 4, 1)),
            Err(RelayError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_reflect101() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(6, 5), 2);
        assert_eq!(reflect101(-7, 3), 1);
        assert_eq!(reflect101(4, 1), 0);
    }

    #[test]
    fn test_gaussian_blur_keeps_flat_image_and_mass() {
        let kernel = gaussian_kernel(SSIM_WINDOW, SSIM_SIGMA);
        assert!((kernel.iter().sum::<f64>() - 1.0).abs() < 1e-12);

        let flat = Array2::from_elem((9, 13), 42.0);
        let blurred = gaussian_blur(&flat, &kernel);
        assert!(blurred.iter().all(|&v| (v - 42.0).abs() < 1e-9));

        let mut spike = Array2::<f64>::zeros((15, 15));
        spike[[7, 7]] = 100.0;
        let blurred = gaussian_blur(&spike, &kernel);
        assert!((blurred.sum() - 100.0).abs() < 1e-6);
        assert!(blurred[[7, 7]] > blurred[[7, 8]]);
    }

    #[test]
    fn test_approximate_position_quality() {
        let exact = assess_position(&Position::new(1.0, 1.0), &Position::new(1.0, 1.0));
        assert_eq!(exact, QualityReport::Approximate { deviation: 0.0, match_estimate: 100.0 });
        match assess_position(&Position::new(0.0, 0.0), &Position::new(10.0, 0.0)) {
            QualityReport::Approximate { deviation, match_estimate } => {
                assert_eq!(deviation, 10.0);
                assert_eq!(match_estimate, 50.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
