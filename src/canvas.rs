use image::{Rgba, RgbaImage, imageops};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Maximum supported surface dimension in pixels (per axis).
pub const MAX_SURFACE_DIM: u32 = 32_768;

/// Straight (non-premultiplied) RGBA8 pixel surface.
pub type Surface = RgbaImage;

pub const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);
pub const OPAQUE_WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

pub fn validate_dimensions(width: u32, height: u32) -> EngineResult<()> {
    if width == 0 || height == 0 {
        return Err(EngineError::validation(format!(
            "surface dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    if width > MAX_SURFACE_DIM || height > MAX_SURFACE_DIM {
        return Err(EngineError::validation(format!(
            "surface size {}x{} exceeds maximum {}x{}",
            width, height, MAX_SURFACE_DIM, MAX_SURFACE_DIM
        )));
    }
    Ok(())
}

/// Allocate a surface filled with `fill`, reporting allocation failure
/// instead of aborting.
pub fn try_alloc_surface(width: u32, height: u32, fill: Rgba<u8>) -> EngineResult<Surface> {
    validate_dimensions(width, height)?;
    let len = width as usize * height as usize * 4;
    let mut raw: Vec<u8> = Vec::new();
    raw.try_reserve_exact(len).map_err(|e| {
        EngineError::compositing(format!("cannot allocate {}x{} surface: {}", width, height, e))
    })?;
    if fill.0 == [0, 0, 0, 0] {
        raw.resize(len, 0);
    } else {
        for _ in 0..(width as usize * height as usize) {
            raw.extend_from_slice(&fill.0);
        }
    }
    RgbaImage::from_raw(width, height, raw)
        .ok_or_else(|| EngineError::compositing("surface buffer size mismatch"))
}

/// Reset every pixel of `surface` to `color` without reallocating.
pub fn fill_surface(surface: &mut Surface, color: Rgba<u8>) {
    surface
        .as_mut()
        .par_chunks_mut(4)
        .for_each(|px| px.copy_from_slice(&color.0));
}

// ============================================================================
// COMPOSITING RULES
// ============================================================================

/// Pixel-blend operation used when merging a source onto a destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeRule {
    SourceOver,
    /// Destination alpha is reduced by source alpha, colour is untouched.
    DestinationOut,
    /// Only the part of the destination covered by the source survives.
    DestinationIn,
}

impl CompositeRule {
    /// Blend one straight-alpha `src` pixel into `dst`, with the source alpha
    /// scaled by `opacity`.
    #[inline]
    pub fn apply(self, dst: &mut [u8], src: [u8; 4], opacity: f32) {
        let sa = (src[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);
        let da = dst[3] as f32 / 255.0;
        match self {
            CompositeRule::SourceOver => {
                if sa <= 0.0 {
                    return;
                }
                if sa >= 1.0 {
                    dst.copy_from_slice(&src);
                    dst[3] = 255;
                    return;
                }
                let out_a = sa + da * (1.0 - sa);
                let dst_w = da * (1.0 - sa);
                for c in 0..3 {
                    let v = (src[c] as f32 * sa + dst[c] as f32 * dst_w) / out_a;
                    dst[c] = v.round().clamp(0.0, 255.0) as u8;
                }
                dst[3] = (out_a * 255.0).round().min(255.0) as u8;
            }
            CompositeRule::DestinationOut => {
                if sa <= 0.0 {
                    return;
                }
                let out_a = ((da * (1.0 - sa)) * 255.0).round() as u8;
                if out_a == 0 {
                    dst.copy_from_slice(&[0, 0, 0, 0]);
                } else {
                    dst[3] = out_a;
                }
            }
            CompositeRule::DestinationIn => {
                let out_a = ((da * sa) * 255.0).round() as u8;
                if out_a == 0 {
                    dst.copy_from_slice(&[0, 0, 0, 0]);
                } else {
                    dst[3] = out_a;
                }
            }
        }
    }
}

/// Composite `src` over the whole of `dst` with `rule` at `opacity`.
/// Rows are processed in parallel.
pub fn composite_surface(
    dst: &mut Surface,
    src: &Surface,
    rule: CompositeRule,
    opacity: f32,
) -> EngineResult<()> {
    if dst.dimensions() != src.dimensions() {
        return Err(EngineError::validation(format!(
            "cannot composite {:?} onto {:?}",
            src.dimensions(),
            dst.dimensions()
        )));
    }
    let row_bytes = dst.width() as usize * 4;
    dst.as_mut()
        .par_chunks_mut(row_bytes)
        .zip(src.as_raw().par_chunks(row_bytes))
        .for_each(|(drow, srow)| {
            for (d, s) in drow.chunks_exact_mut(4).zip(srow.chunks_exact(4)) {
                rule.apply(d, [s[0], s[1], s[2], s[3]], opacity);
            }
        });
    Ok(())
}

// ============================================================================
// DIRTY RECT
// ============================================================================

/// Pixel rectangle `[x, x + width) × [y, y + height)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DirtyRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DirtyRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn union(self, other: DirtyRect) -> DirtyRect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        DirtyRect::new(x, y, right - x, bottom - y)
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }
}

// ============================================================================
// LAYER STACK
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LayerName {
    Background,
    PermanentStrokes,
    ActiveStroke,
    Mask,
    Preview,
}

impl LayerName {
    /// The layers a snapshot carries; the active stroke is transient and the
    /// preview is derived.
    pub const PERSISTED: [LayerName; 3] =
        [LayerName::Background, LayerName::PermanentStrokes, LayerName::Mask];

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerName::Background => "background",
            LayerName::PermanentStrokes => "permanentStrokes",
            LayerName::ActiveStroke => "activeStroke",
            LayerName::Mask => "mask",
            LayerName::Preview => "preview",
        }
    }

    pub fn is_persisted(&self) -> bool {
        Self::PERSISTED.contains(self)
    }

    /// Fill used when a layer is created or reset: transparent everywhere
    /// except the mask, which starts fully included.
    pub fn default_fill(&self) -> Rgba<u8> {
        match self {
            LayerName::Mask => OPAQUE_WHITE,
            _ => TRANSPARENT,
        }
    }
}

impl std::fmt::Display for LayerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Five same-sized surfaces owned by one editable object.
pub struct LayerStack {
    width: u32,
    height: u32,
    pub(crate) background: Surface,
    pub(crate) permanent_strokes: Surface,
    pub(crate) active_stroke: Surface,
    pub(crate) mask: Surface,
    pub(crate) preview: Surface,
}

impl LayerStack {
    pub fn new(width: u32, height: u32) -> EngineResult<Self> {
        Ok(Self {
            width,
            height,
            background: try_alloc_surface(width, height, LayerName::Background.default_fill())?,
            permanent_strokes: try_alloc_surface(width, height, TRANSPARENT)?,
            active_stroke: try_alloc_surface(width, height, TRANSPARENT)?,
            mask: try_alloc_surface(width, height, LayerName::Mask.default_fill())?,
            preview: try_alloc_surface(width, height, TRANSPARENT)?,
        })
    }

    /// Build a stack sized to `background`.
    pub fn with_background(background: Surface) -> EngineResult<Self> {
        let (w, h) = background.dimensions();
        let mut stack = Self::new(w, h)?;
        stack.background = background;
        Ok(stack)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn layer(&self, name: LayerName) -> &Surface {
        match name {
            LayerName::Background => &self.background,
            LayerName::PermanentStrokes => &self.permanent_strokes,
            LayerName::ActiveStroke => &self.active_stroke,
            LayerName::Mask => &self.mask,
            LayerName::Preview => &self.preview,
        }
    }

    pub(crate) fn layer_mut(&mut self, name: LayerName) -> &mut Surface {
        match name {
            LayerName::Background => &mut self.background,
            LayerName::PermanentStrokes => &mut self.permanent_strokes,
            LayerName::ActiveStroke => &mut self.active_stroke,
            LayerName::Mask => &mut self.mask,
            LayerName::Preview => &mut self.preview,
        }
    }

    /// Reset a layer to fully transparent.
    pub fn clear(&mut self, name: LayerName) {
        fill_surface(self.layer_mut(name), TRANSPARENT);
    }

    /// Reset a layer to its creation state (see [`LayerName::default_fill`]).
    pub fn reset(&mut self, name: LayerName) {
        let fill = name.default_fill();
        fill_surface(self.layer_mut(name), fill);
    }

    /// Swap in a decoded surface. Dimensions must match the stack.
    pub fn replace(&mut self, name: LayerName, surface: Surface) -> EngineResult<()> {
        if surface.dimensions() != self.dimensions() {
            return Err(EngineError::validation(format!(
                "layer {} is {:?}, stack is {:?}",
                name,
                surface.dimensions(),
                self.dimensions()
            )));
        }
        *self.layer_mut(name) = surface;
        Ok(())
    }

    /// Reallocate every surface at the new size. The background is redrawn
    /// scaled; strokes and mask are reset, also when the size is unchanged.
    /// On failure the stack is unchanged.
    pub fn resize(&mut self, width: u32, height: u32) -> EngineResult<()> {
        validate_dimensions(width, height)?;
        let mut next = Self::new(width, height)?;
        next.background = if (width, height) == self.dimensions() {
            self.background.clone()
        } else {
            imageops::resize(&self.background, width, height, imageops::FilterType::Triangle)
        };
        debug!(
            from_w = self.width,
            from_h = self.height,
            to_w = width,
            to_h = height,
            "layer stack resized, stroke and mask history reset"
        );
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimensions_are_rejected() {
        assert!(matches!(LayerStack::new(0, 10), Err(EngineError::Validation(_))));
        assert!(matches!(LayerStack::new(10, 0), Err(EngineError::Validation(_))));
        assert!(matches!(
            LayerStack::new(MAX_SURFACE_DIM + 1, 4),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn all_layers_share_dimensions_after_resize() {
        let mut stack = LayerStack::new(8, 6).unwrap();
        stack.resize(20, 10).unwrap();
        for name in [
            LayerName::Background,
            LayerName::PermanentStrokes,
            LayerName::ActiveStroke,
            LayerName::Mask,
            LayerName::Preview,
        ] {
            assert_eq!(stack.layer(name).dimensions(), (20, 10), "layer {name}");
        }
    }

    #[test]
    fn failed_resize_leaves_stack_untouched() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        stack.permanent_strokes.put_pixel(1, 1, Rgba([9, 9, 9, 255]));
        assert!(stack.resize(0, 4).is_err());
        assert_eq!(stack.dimensions(), (4, 4));
        assert_eq!(stack.permanent_strokes.get_pixel(1, 1).0, [9, 9, 9, 255]);
    }

    #[test]
    fn resize_scales_background_and_resets_history() {
        let bg = RgbaImage::from_pixel(4, 4, Rgba([200, 10, 10, 255]));
        let mut stack = LayerStack::with_background(bg).unwrap();
        stack.permanent_strokes.put_pixel(0, 0, Rgba([0, 0, 255, 255]));
        stack.mask.put_pixel(0, 0, TRANSPARENT);
        stack.resize(8, 8).unwrap();
        assert_eq!(stack.background.get_pixel(3, 3).0, [200, 10, 10, 255]);
        assert_eq!(stack.permanent_strokes.get_pixel(0, 0).0[3], 0);
        assert_eq!(stack.mask.get_pixel(0, 0).0, OPAQUE_WHITE.0, "mask resets to included");
    }

    #[test]
    fn same_size_resize_still_resets_history() {
        let bg = RgbaImage::from_fn(6, 4, |x, y| Rgba([x as u8 * 40, y as u8 * 60, 7, 255]));
        let mut stack = LayerStack::with_background(bg.clone()).unwrap();
        stack.permanent_strokes.put_pixel(2, 2, Rgba([0, 0, 255, 255]));
        stack.active_stroke.put_pixel(1, 1, Rgba([0, 0, 255, 255]));
        stack.mask.put_pixel(3, 1, TRANSPARENT);
        stack.resize(6, 4).unwrap();
        assert_eq!(stack.background, bg, "background kept exactly");
        assert!(stack.permanent_strokes.pixels().all(|p| p.0[3] == 0));
        assert!(stack.active_stroke.pixels().all(|p| p.0[3] == 0));
        assert!(stack.mask.pixels().all(|p| p.0 == OPAQUE_WHITE.0));
    }

    #[test]
    fn fresh_mask_is_fully_included() {
        let stack = LayerStack::new(3, 3).unwrap();
        assert!(stack.mask.pixels().all(|p| p.0[3] == 255));
    }

    #[test]
    fn clear_makes_layer_transparent() {
        let mut stack = LayerStack::new(3, 3).unwrap();
        stack.clear(LayerName::Mask);
        assert!(stack.mask.pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn source_over_opaque_replaces() {
        let mut dst = [10, 20, 30, 255];
        CompositeRule::SourceOver.apply(&mut dst, [200, 100, 50, 255], 1.0);
        assert_eq!(dst, [200, 100, 50, 255]);
    }

    #[test]
    fn source_over_half_blends() {
        let mut dst = [0, 0, 0, 255];
        CompositeRule::SourceOver.apply(&mut dst, [255, 255, 255, 255], 0.5);
        assert_eq!(dst[3], 255);
        assert!((dst[0] as i32 - 128).abs() <= 1, "got {}", dst[0]);
    }

    #[test]
    fn destination_out_full_clears() {
        let mut dst = [10, 20, 30, 200];
        CompositeRule::DestinationOut.apply(&mut dst, [255, 255, 255, 255], 1.0);
        assert_eq!(dst, [0, 0, 0, 0]);
    }

    #[test]
    fn destination_in_keeps_covered_part() {
        let mut dst = [10, 20, 30, 255];
        CompositeRule::DestinationIn.apply(&mut dst, [0, 0, 0, 128], 1.0);
        assert_eq!(dst[..3], [10, 20, 30]);
        assert_eq!(dst[3], 128);
        let mut gone = [10, 20, 30, 255];
        CompositeRule::DestinationIn.apply(&mut gone, [0, 0, 0, 0], 1.0);
        assert_eq!(gone, [0, 0, 0, 0]);
    }

    #[test]
    fn composite_surface_rejects_mismatched_sizes() {
        let mut a = try_alloc_surface(2, 2, TRANSPARENT).unwrap();
        let b = try_alloc_surface(3, 2, TRANSPARENT).unwrap();
        assert!(composite_surface(&mut a, &b, CompositeRule::SourceOver, 1.0).is_err());
    }

    #[test]
    fn dirty_rect_union() {
        let a = DirtyRect::new(2, 2, 4, 4);
        let b = DirtyRect::new(10, 1, 2, 2);
        assert_eq!(a.union(b), DirtyRect::new(2, 1, 10, 5));
        assert_eq!(DirtyRect::default().union(b), b);
    }
}
