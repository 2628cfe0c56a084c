// ============================================================================
// GPU MODULE: shader adjustment stage over the composited preview
// ============================================================================
//
// Architecture:
//   context.rs  - wgpu Device, Queue, adapter init
//   shaders.rs  - WGSL shader source (inline strings)
//   texture.rs  - preview texture with partial upload, display target
//   renderer.rs - AdjustmentStage lifecycle, render, readback
// ============================================================================

pub mod context;
pub mod renderer;
pub mod shaders;
pub mod texture;

pub use context::{GpuContext, GpuPower};
pub use renderer::{AdjustmentStage, DisplaySource, StageState};

use crate::canvas::DirtyRect;

/// Pixels per 256-byte row chunk of an RGBA8 texture.
const PIXEL_ALIGNMENT: u32 = 64;

/// Widen a dirty rect so that `width * 4` is a multiple of 256 bytes,
/// expanding rightward and clamping to the texture bounds.
pub fn align_dirty_rect(rect: DirtyRect, texture_width: u32, texture_height: u32) -> DirtyRect {
    if texture_width == 0 || texture_height == 0 {
        return DirtyRect::new(0, 0, 0, 0);
    }
    let x = rect.x.min(texture_width - 1);
    let y = rect.y.min(texture_height - 1);

    let max_width = texture_width - x;
    let max_height = texture_height - y;
    let w = rect.width.min(max_width);
    let h = rect.height.min(max_height);
    if w == 0 || h == 0 {
        return DirtyRect::new(x, y, 0, 0);
    }

    let aligned_w = w.div_ceil(PIXEL_ALIGNMENT) * PIXEL_ALIGNMENT;
    DirtyRect::new(x, y, aligned_w.min(max_width), h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_width_to_row_chunks() {
        let r = align_dirty_rect(DirtyRect::new(10, 5, 3, 4), 512, 512);
        assert_eq!(r, DirtyRect::new(10, 5, 64, 4));
    }

    #[test]
    fn clamps_to_texture_edge() {
        let r = align_dirty_rect(DirtyRect::new(100, 0, 10, 200), 120, 50);
        assert_eq!(r, DirtyRect::new(100, 0, 20, 50));
    }

    #[test]
    fn empty_stays_empty() {
        assert!(align_dirty_rect(DirtyRect::new(3, 3, 0, 9), 64, 64).is_empty());
        assert!(align_dirty_rect(DirtyRect::new(0, 0, 5, 5), 0, 0).is_empty());
    }
}
