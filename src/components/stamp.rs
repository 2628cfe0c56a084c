// ============================================================================
// STAMP: one textured, rotated footprint at a point
// ============================================================================

use crate::canvas::{CompositeRule, DirtyRect, Surface};
use crate::components::brush::TipMask;
use crate::ops::pigment::Rgb;

/// Draws brush footprints. Holds the temporary stamp buffer so repeated
/// stamps of the same size never reallocate.
#[derive(Default)]
pub struct StampRenderer {
    /// `size × size` RGBA texels: base colour, alpha from the tip.
    buffer: Vec<u8>,
    size: u32,
}

impl StampRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the temporary surface with `color` and cut it down to the tip
    /// with destination-in.
    fn prepare(&mut self, color: Rgb, tip: &TipMask) {
        let n = tip.size.max(1);
        self.size = n;
        let count = n as usize * n as usize;
        self.buffer.clear();
        self.buffer.reserve(count * 4);
        for _ in 0..count {
            self.buffer.extend_from_slice(&[color[0], color[1], color[2], 255]);
        }
        for (texel, &alpha) in self.buffer.chunks_exact_mut(4).zip(tip.data.iter()) {
            CompositeRule::DestinationIn.apply(texel, [0, 0, 0, alpha], 1.0);
        }
    }

    fn texel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.size as usize + x as usize) * 4;
        [self.buffer[i], self.buffer[i + 1], self.buffer[i + 2], self.buffer[i + 3]]
    }

    /// Bilinear alpha at buffer coordinates `(bx, by)` (texel centers at
    /// `i + 0.5`). Outside the buffer reads as zero.
    fn alpha_bilinear(&self, bx: f32, by: f32) -> f32 {
        let n = self.size as i64;
        let sx = bx - 0.5;
        let sy = by - 0.5;
        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;
        let at = |x: i64, y: i64| -> f32 {
            if x < 0 || y < 0 || x >= n || y >= n {
                0.0
            } else {
                self.buffer[((y * n + x) * 4 + 3) as usize] as f32
            }
        };
        let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
        let bot = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
        top * (1.0 - fy) + bot * fy
    }

    /// Draw one footprint of `tip` centered at `point` onto `target`.
    ///
    /// `shade` receives the target pixel coordinates and the stamp texel
    /// (base colour, footprint alpha) and returns the source pixel to
    /// composite with `rule`. Returns the touched rectangle, or `None` when
    /// the stamp lies entirely off the surface.
    pub fn stamp<F>(
        &mut self,
        target: &mut Surface,
        point: (f32, f32),
        color: Rgb,
        tip: &TipMask,
        rotation_deg: f32,
        rule: CompositeRule,
        mut shade: F,
    ) -> Option<DirtyRect>
    where
        F: FnMut(u32, u32, [u8; 4]) -> [u8; 4],
    {
        self.prepare(color, tip);
        let n = self.size;
        let half = n as f32 / 2.0;
        let (tw, th) = target.dimensions();

        // Snap the buffer to the pixel grid so unrotated stamps copy texels 1:1.
        let origin_x = (point.0 - half).round() as i64;
        let origin_y = (point.1 - half).round() as i64;
        let center_x = origin_x as f32 + half;
        let center_y = origin_y as f32 + half;

        let angle = rotation_deg.rem_euclid(360.0);
        let rotated = !tip.radially_symmetric && angle > 0.01 && angle < 359.99;

        let extent = if rotated { half * std::f32::consts::SQRT_2 } else { half };
        let min_x = ((center_x - extent).floor() as i64).max(0);
        let min_y = ((center_y - extent).floor() as i64).max(0);
        let max_x = ((center_x + extent).ceil() as i64).min(tw as i64);
        let max_y = ((center_y + extent).ceil() as i64).min(th as i64);
        if min_x >= max_x || min_y >= max_y {
            return None;
        }

        let (sin_a, cos_a) = (-angle.to_radians()).sin_cos();
        let mut touched: Option<DirtyRect> = None;

        for y in min_y..max_y {
            for x in min_x..max_x {
                let texel = if rotated {
                    let rel_x = x as f32 + 0.5 - center_x;
                    let rel_y = y as f32 + 0.5 - center_y;
                    if tip.disc && rel_x * rel_x + rel_y * rel_y > half * half {
                        continue;
                    }
                    // Inverse-rotate into buffer space
                    let bx = rel_x * cos_a - rel_y * sin_a + half;
                    let by = rel_x * sin_a + rel_y * cos_a + half;
                    if bx < 0.0 || by < 0.0 || bx >= n as f32 || by >= n as f32 {
                        continue;
                    }
                    let a = self.alpha_bilinear(bx, by).round().min(255.0) as u8;
                    [color[0], color[1], color[2], a]
                } else {
                    let bx = x - origin_x;
                    let by = y - origin_y;
                    if bx < 0 || by < 0 || bx >= n as i64 || by >= n as i64 {
                        continue;
                    }
                    self.texel(bx as u32, by as u32)
                };
                if texel[3] == 0 {
                    continue;
                }

                let (ux, uy) = (x as u32, y as u32);
                let src = shade(ux, uy, texel);
                let i = (uy as usize * tw as usize + ux as usize) * 4;
                let raw: &mut [u8] = target.as_mut();
                rule.apply(&mut raw[i..i + 4], src, 1.0);

                let px = DirtyRect::new(ux, uy, 1, 1);
                touched = Some(touched.map_or(px, |r| r.union(px)));
            }
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{TRANSPARENT, try_alloc_surface};
    use crate::components::brush::{TextureKind, TextureLibrary, stamp_size_for};

    fn affected(surface: &Surface) -> Vec<(u32, u32)> {
        surface
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[3] > 0)
            .map(|(x, y, _)| (x, y))
            .collect()
    }

    #[test]
    fn footprint_is_nonempty_and_bounded() {
        let lib = TextureLibrary::builtin();
        let mut renderer = StampRenderer::new();
        let kinds = [
            TextureKind::Soft,
            TextureKind::Round,
            TextureKind::Square,
            TextureKind::Chalk,
            TextureKind::Bristle,
        ];
        for kind in kinds {
            for size in [1.0f32, 2.0, 3.0, 7.0, 16.0, 31.0] {
                for hardness in [0.0f32, 0.5, 1.0] {
                    for rotation in [0.0f32, 37.0] {
                        let mut target = try_alloc_surface(64, 64, TRANSPARENT).unwrap();
                        let tip = lib.rasterize(&kind, stamp_size_for(size), hardness).unwrap();
                        let point = (32.3, 31.8);
                        renderer.stamp(&mut target, point, [0, 0, 255], &tip, rotation, CompositeRule::SourceOver, |_, _, t| t);
                        let px = affected(&target);
                        assert!(!px.is_empty(), "{} size {size} hardness {hardness} empty", kind.name());
                        // Snapping the buffer to the grid moves its center by at most half a pixel.
                        let bound = size / 2.0 + std::f32::consts::SQRT_2 / 2.0 + 0.01;
                        for (x, y) in px {
                            let dx = x as f32 + 0.5 - point.0;
                            let dy = y as f32 + 0.5 - point.1;
                            let d = (dx * dx + dy * dy).sqrt();
                            assert!(d <= bound, "{} size {size}: pixel at {d} > {bound}", kind.name());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn soft_footprint_ignores_rotation() {
        let lib = TextureLibrary::builtin();
        let tip = lib.rasterize(&TextureKind::Soft, 15, 0.3).unwrap();
        let mut renderer = StampRenderer::new();
        let mut a = try_alloc_surface(32, 32, TRANSPARENT).unwrap();
        let mut b = try_alloc_surface(32, 32, TRANSPARENT).unwrap();
        renderer.stamp(&mut a, (16.0, 16.0), [9, 9, 9], &tip, 0.0, CompositeRule::SourceOver, |_, _, t| t);
        renderer.stamp(&mut b, (16.0, 16.0), [9, 9, 9], &tip, 73.0, CompositeRule::SourceOver, |_, _, t| t);
        assert_eq!(a, b);
    }

    #[test]
    fn sub_pixel_brush_touches_one_pixel() {
        let tip = TipMask::soft(stamp_size_for(0.3), 0.0);
        let mut renderer = StampRenderer::new();
        let mut target = try_alloc_surface(8, 8, TRANSPARENT).unwrap();
        let rect = renderer.stamp(&mut target, (4.0, 4.0), [255, 0, 0], &tip, 0.0, CompositeRule::SourceOver, |_, _, t| t);
        assert_eq!(affected(&target).len(), 1);
        assert_eq!(rect.map(|r| (r.width, r.height)), Some((1, 1)));
    }

    #[test]
    fn off_surface_stamp_is_none() {
        let tip = TipMask::soft(5, 1.0);
        let mut renderer = StampRenderer::new();
        let mut target = try_alloc_surface(8, 8, TRANSPARENT).unwrap();
        let rect = renderer.stamp(&mut target, (-40.0, 3.0), [0, 0, 0], &tip, 0.0, CompositeRule::SourceOver, |_, _, t| t);
        assert!(rect.is_none());
        assert!(affected(&target).is_empty());
    }

    #[test]
    fn square_tip_covers_exact_square() {
        let lib = TextureLibrary::builtin();
        let tip = lib.rasterize(&TextureKind::Square, 10, 1.0).unwrap();
        let mut renderer = StampRenderer::new();
        let mut target = try_alloc_surface(20, 20, TRANSPARENT).unwrap();
        let rect = renderer
            .stamp(&mut target, (5.0, 5.0), [1, 2, 3], &tip, 0.0, CompositeRule::SourceOver, |_, _, t| t)
            .unwrap();
        assert_eq!(rect, DirtyRect::new(2, 2, 6, 6));
        assert_eq!(affected(&target).len(), 36);
        assert_eq!(target.get_pixel(7, 7).0, [1, 2, 3, 255]);
        assert_eq!(target.get_pixel(8, 8).0[3], 0);
    }

    #[test]
    fn rotated_square_stays_inside_the_disc() {
        let lib = TextureLibrary::builtin();
        let tip = lib.rasterize(&TextureKind::Square, 40, 1.0).unwrap();
        let mut renderer = StampRenderer::new();
        let mut straight = try_alloc_surface(64, 64, TRANSPARENT).unwrap();
        let mut turned = try_alloc_surface(64, 64, TRANSPARENT).unwrap();
        renderer.stamp(&mut straight, (32.0, 32.0), [0, 0, 0], &tip, 0.0, CompositeRule::SourceOver, |_, _, t| t);
        renderer.stamp(&mut turned, (32.0, 32.0), [0, 0, 0], &tip, 45.0, CompositeRule::SourceOver, |_, _, t| t);
        assert_ne!(straight, turned);
        for (x, y) in affected(&turned) {
            let dx = x as f32 + 0.5 - 32.0;
            let dy = y as f32 + 0.5 - 32.0;
            assert!(dx * dx + dy * dy <= 20.0 * 20.0, "({x}, {y}) outside the brush radius");
        }
    }

    #[test]
    fn shade_overrides_colour_per_pixel() {
        let tip = TipMask::soft(4, 1.0);
        let mut renderer = StampRenderer::new();
        let mut target = try_alloc_surface(8, 8, TRANSPARENT).unwrap();
        renderer.stamp(&mut target, (4.0, 4.0), [0, 0, 0], &tip, 0.0, CompositeRule::SourceOver, |x, _, t| {
            [x as u8 * 10, 0, 0, t[3]]
        });
        assert_eq!(target.get_pixel(3, 3).0[0], 30);
        assert_eq!(target.get_pixel(4, 4).0[0], 40);
    }
}
