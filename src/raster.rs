// =============================================================================
// LAGRANGE RELAY — raster.rs
// =============================================================================
//
// Dense image payload. Wire layout:
//   magic "LRST" | width u16 LE | height u16 LE | channels u8 | pixels (HWC)
// =============================================================================

use ndarray::{Array2, Array3};

use crate::error::{RelayError, Result};

pub const RASTER_MAGIC: &[u8; 4] = b"LRST";
pub const RASTER_HEADER: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    /// (height, width, channels)
    pub pixels: Array3<u8>,
}

impl Raster {
    pub fn new(width: usize, height: usize, channels: usize) -> Self {
        Raster { pixels: Array3::zeros((height, width, channels)) }
    }

    pub fn from_pixels(pixels: Array3<u8>) -> Self {
        Raster { pixels }
    }

    pub fn width(&self) -> usize { self.pixels.dim().1 }
    pub fn height(&self) -> usize { self.pixels.dim().0 }
    pub fn channels(&self) -> usize { self.pixels.dim().2 }

    pub fn same_shape(&self, other: &Raster) -> bool {
        self.pixels.dim() == other.pixels.dim()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RASTER_HEADER + self.pixels.len());
        buf.extend_from_slice(RASTER_MAGIC);
        buf.extend_from_slice(&(self.width() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.height() as u16).to_le_bytes());
        buf.push(self.channels() as u8);
        buf.extend(self.pixels.iter().copied());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RASTER_HEADER || &bytes[..4] != RASTER_MAGIC {
            return Err(RelayError::malformed("raster header missing"));
        }
        let width = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let height = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        let channels = bytes[8] as usize;
        if channels != 1 && channels != 3 {
            return Err(RelayError::malformed(format!("unsupported channel count {}", channels)));
        }
        let body = &bytes[RASTER_HEADER..];
        if body.len() != width * height * channels {
            return Err(RelayError::malformed(format!(
                "raster body {} bytes, expected {}x{}x{}",
                body.len(), width, height, channels
            )));
        }
        let pixels = Array3::from_shape_vec((height, width, channels), body.to_vec())
            .map_err(|e| RelayError::malformed(e.to_string()))?;
        Ok(Raster { pixels })
    }

    /// Luma plane (BT.601 weights for three channels).
    pub fn luma(&self) -> Array2<f64> {
        let (h, w, c) = self.pixels.dim();
        Array2::from_shape_fn((h, w), |(y, x)| {
            if c == 1 {
                self.pixels[[y, x, 0]] as f64
            } else {
                0.299 * self.pixels[[y, x, 0]] as f64
                    + 0.587 * self.pixels[[y, x, 1]] as f64
                    + 0.114 * self.pixels[[y, x, 2]] as f64
            }
        })
    }

    /// Bilinear sample of one channel at fractional coordinates, clamped to the edges.
    pub fn sample_bilinear(&self, x: f64, y: f64, ch: usize) -> f64 {
        let (h, w, _) = self.pixels.dim();
        let x = x.clamp(0.0, (w - 1) as f64);
        let y = y.clamp(0.0, (h - 1) as f64);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(w - 1);
        let y1 = (y0 + 1).min(h - 1);
        let fx = x - x0 as f64;
        let fy = y - y0 as f64;
        let p = |yy: usize, xx: usize| self.pixels[[yy, xx, ch]] as f64;
        let top = p(y0, x0) * (1.0 - fx) + p(y0, x1) * fx;
        let bottom = p(y1, x0) * (1.0 - fx) + p(y1, x1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut r = Raster::new(4, 2, 3);
        r.pixels[[1, 3, 2]] = 200;
        let bytes = r.encode();
        assert_eq!(bytes.len(), RASTER_HEADER + 4 * 2 * 3);
        assert_eq!(&bytes[..4], RASTER_MAGIC);
        assert_eq!(*bytes.last().unwrap(), 200);
        assert_eq!(Raster::decode(&bytes).unwrap(), r);
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let mut bytes = Raster::new(4, 4, 1).encode();
        bytes.pop();
        assert!(matches!(Raster::decode(&bytes), Err(RelayError::MalformedEnvelope(_))));
        assert!(Raster::decode(b"JPEG").is_err());
    }

    #[test]
    fn test_bilinear_midpoint() {
        let mut r = Raster::new(2, 1, 1);
        r.pixels[[0, 0, 0]] = 0;
        r.pixels[[0, 1, 0]] = 100;
        assert!((r.sample_bilinear(0.5, 0.0, 0) - 50.0).abs() < 1e-9);
        // clamped outside the frame
        assert!((r.sample_bilinear(5.0, -3.0, 0) - 100.0).abs() < 1e-9);
    }
}
