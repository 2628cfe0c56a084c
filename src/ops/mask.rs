// ============================================================================
// MASK PROCESSOR: binarize, inpaint derivation, validity
// ============================================================================

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::canvas::{Surface, TRANSPARENT, try_alloc_surface};
use crate::error::EngineResult;

/// Thresholds used when interpreting the editor mask.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MaskParams {
    /// Alpha (0..1) at or above which a pixel counts as included.
    pub threshold: f32,
    /// Pixels whose brightest channel is at or below this value are treated
    /// as excluded when deriving the inpaint mask.
    pub near_black: u8,
}

impl Default for MaskParams {
    fn default() -> Self {
        Self { threshold: 0.5, near_black: 16 }
    }
}

impl MaskParams {
    pub fn clamped(self) -> Self {
        let threshold = if self.threshold.is_finite() { self.threshold.clamp(0.0, 1.0) } else { 0.5 };
        Self { threshold, ..self }
    }

    #[inline]
    pub fn included(&self, alpha: u8) -> bool {
        alpha as f32 / 255.0 >= self.threshold
    }
}

const INCLUDED: [u8; 4] = [255, 255, 255, 255];
const INPAINT: [u8; 4] = [0, 0, 0, 255];
const PRESERVE: [u8; 4] = [255, 255, 255, 255];

/// Snap every mask pixel to fully included (opaque white) or excluded
/// (transparent). Works on a scratch copy and swaps it in on success, so a
/// failed allocation leaves `mask` untouched.
pub fn binarize(mask: &mut Surface, params: MaskParams) -> EngineResult<()> {
    let mut scratch = try_alloc_surface(mask.width(), mask.height(), TRANSPARENT)?;
    let src: &[u8] = mask.as_raw();
    scratch
        .as_mut()
        .par_chunks_mut(4)
        .zip(src.par_chunks(4))
        .for_each(|(out, px)| {
            if params.included(px[3]) {
                out.copy_from_slice(&INCLUDED);
            }
        });
    *mask = scratch;
    debug!(
        width = mask.width(),
        height = mask.height(),
        threshold = params.threshold,
        "mask binarized"
    );
    Ok(())
}

/// Build the black/white mask the generation service consumes: excluded or
/// near-black editor pixels become opaque black, everything else opaque
/// white.
pub fn derive_inpaint_mask(mask: &Surface, params: MaskParams) -> EngineResult<Surface> {
    let mut out = try_alloc_surface(mask.width(), mask.height(), TRANSPARENT)?;
    let src: &[u8] = mask.as_raw();
    out.as_mut()
        .par_chunks_mut(4)
        .zip(src.par_chunks(4))
        .for_each(|(dst, px)| {
            let darkest = px[0].max(px[1]).max(px[2]);
            let excluded = !params.included(px[3]) || darkest <= params.near_black;
            dst.copy_from_slice(if excluded { &INPAINT } else { &PRESERVE });
        });
    Ok(out)
}

/// True only when the mask holds at least one excluded and at least one
/// included pixel.
pub fn is_valid(mask: &Surface, params: MaskParams) -> bool {
    let alphas = mask.as_raw().par_chunks(4).map(|px| px[3]);
    let (any_in, any_out) = alphas
        .fold(
            || (false, false),
            |(i, o), a| {
                let inc = params.included(a);
                (i || inc, o || !inc)
            },
        )
        .reduce(|| (false, false), |a, b| (a.0 || b.0, a.1 || b.1));
    any_in && any_out
}
