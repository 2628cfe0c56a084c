// ============================================================================
// ADJUSTMENTS: brightness / contrast / saturation parameters
// ============================================================================
//
// The GPU stage runs the same math in WGSL (`gpu::shaders::ADJUST_SHADER`).
// `apply_cpu` is the reference used headless and when the stage is degraded.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::canvas::{Surface, TRANSPARENT, try_alloc_surface};
use crate::error::{EngineError, EngineResult};

/// Rec. 709 luma weights.
pub const LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// Largest accepted multiplier for any adjustment.
pub const MAX_FACTOR: f32 = 4.0;

/// Non-destructive colour adjustments. `1.0` is identity for every field.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Adjustments {
    pub contrast: f32,
    pub saturation: f32,
    pub brightness: f32,
}

impl Default for Adjustments {
    fn default() -> Self {
        Self { contrast: 1.0, saturation: 1.0, brightness: 1.0 }
    }
}

impl Adjustments {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Reject non-finite values and clamp the rest into `[0, MAX_FACTOR]`.
    pub fn validated(self) -> EngineResult<Self> {
        if ![self.contrast, self.saturation, self.brightness].iter().all(|v| v.is_finite()) {
            return Err(EngineError::validation("adjustments must be finite numbers"));
        }
        Ok(Self {
            contrast: self.contrast.clamp(0.0, MAX_FACTOR),
            saturation: self.saturation.clamp(0.0, MAX_FACTOR),
            brightness: self.brightness.clamp(0.0, MAX_FACTOR),
        })
    }

    /// Brightness, then contrast, then saturation. Alpha is untouched.
    pub fn apply_pixel(&self, px: [u8; 4]) -> [u8; 4] {
        let mut c = [px[0] as f32 / 255.0, px[1] as f32 / 255.0, px[2] as f32 / 255.0];
        for v in c.iter_mut() {
            *v *= self.brightness;
            *v = (*v - 0.5) * self.contrast + 0.5;
        }
        let luma = c[0] * LUMA[0] + c[1] * LUMA[1] + c[2] * LUMA[2];
        let mut out = [0u8; 4];
        for (o, v) in out.iter_mut().zip(c) {
            let s = luma + (v - luma) * self.saturation;
            *o = (s.clamp(0.0, 1.0) * 255.0).round() as u8;
        }
        out[3] = px[3];
        out
    }

    /// Adjusted copy of `src`.
    pub fn apply_cpu(&self, src: &Surface) -> EngineResult<Surface> {
        let mut out = try_alloc_surface(src.width(), src.height(), TRANSPARENT)?;
        if self.is_identity() {
            out.as_mut().copy_from_slice(src.as_raw());
            return Ok(out);
        }
        let raw: &[u8] = src.as_raw();
        out.as_mut()
            .par_chunks_mut(4)
            .zip(raw.par_chunks(4))
            .for_each(|(dst, px)| {
                dst.copy_from_slice(&self.apply_pixel([px[0], px[1], px[2], px[3]]));
            });
        Ok(out)
    }
}
