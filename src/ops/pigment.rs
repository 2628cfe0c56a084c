// ============================================================================
// PIGMENT MIXING: subtractive colour blending in a latent RYB space
// ============================================================================
//
// Colours are decoded to linear light and mapped to red/yellow/blue pigment
// amounts. Interpolation happens on those amounts and the result is mapped
// back, so yellow and blue meet at green instead of grey.

use std::sync::OnceLock;

use crate::canvas::{CompositeRule, Surface};

pub type Rgb = [u8; 3];

/// Pigment amounts (red, yellow, blue) in linear light, each in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Latent(pub [f32; 3]);

static SRGB_TO_LINEAR: OnceLock<[f32; 256]> = OnceLock::new();

fn srgb_lut() -> &'static [f32; 256] {
    SRGB_TO_LINEAR.get_or_init(|| {
        let mut lut = [0.0f32; 256];
        for (i, v) in lut.iter_mut().enumerate() {
            let c = i as f32 / 255.0;
            *v = if c <= 0.04045 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            };
        }
        lut
    })
}

fn linear_to_srgb(v: f32) -> u8 {
    let v = v.clamp(0.0, 1.0);
    let c = if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    };
    (c * 255.0).round().clamp(0.0, 255.0) as u8
}

fn max3(a: f32, b: f32, c: f32) -> f32 {
    a.max(b).max(c)
}

fn min3(a: f32, b: f32, c: f32) -> f32 {
    a.min(b).min(c)
}

/// Map linear RGB to RYB pigment amounts.
fn rgb_to_ryb([mut r, mut g, mut b]: [f32; 3]) -> [f32; 3] {
    let white = min3(r, g, b);
    r -= white;
    g -= white;
    b -= white;
    let max_g = max3(r, g, b);

    let mut y = r.min(g);
    r -= y;
    g -= y;

    if b > 0.0 && g > 0.0 {
        b /= 2.0;
        g /= 2.0;
    }
    y += g;
    b += g;

    let max_y = max3(r, y, b);
    if max_y > 0.0 {
        let n = max_g / max_y;
        r *= n;
        y *= n;
        b *= n;
    }
    [r + white, y + white, b + white]
}

/// Inverse of [`rgb_to_ryb`].
fn ryb_to_rgb([mut r, mut y, mut b]: [f32; 3]) -> [f32; 3] {
    let white = min3(r, y, b);
    r -= white;
    y -= white;
    b -= white;
    let max_y = max3(r, y, b);

    let mut g = y.min(b);
    y -= g;
    b -= g;

    if b > 0.0 && g > 0.0 {
        b *= 2.0;
        g *= 2.0;
    }
    r += y;
    g += y;

    let max_g = max3(r, g, b);
    if max_g > 0.0 {
        let n = max_y / max_g;
        r *= n;
        g *= n;
        b *= n;
    }
    [r + white, g + white, b + white]
}

pub fn to_latent(rgb: Rgb) -> Latent {
    let lut = srgb_lut();
    Latent(rgb_to_ryb([lut[rgb[0] as usize], lut[rgb[1] as usize], lut[rgb[2] as usize]]))
}

pub fn from_latent(latent: Latent) -> Rgb {
    let [r, g, b] = ryb_to_rgb(latent.0);
    [linear_to_srgb(r), linear_to_srgb(g), linear_to_srgb(b)]
}

/// Blend `a` toward `b` by `ratio` (0 = `a`, 1 = `b`) in pigment space.
pub fn mix(a: Rgb, b: Rgb, ratio: f32) -> Rgb {
    if ratio <= 0.0 || a == b {
        return a;
    }
    if ratio >= 1.0 {
        return b;
    }
    let la = to_latent(a).0;
    let lb = to_latent(b).0;
    let t = ratio;
    from_latent(Latent([
        la[0] + (lb[0] - la[0]) * t,
        la[1] + (lb[1] - la[1]) * t,
        la[2] + (lb[2] - la[2]) * t,
    ]))
}

/// Pixel at `(x, y)`, with coordinates clamped to the surface.
pub fn sample(layer: &Surface, x: i64, y: i64) -> [u8; 4] {
    let cx = x.clamp(0, layer.width() as i64 - 1) as u32;
    let cy = y.clamp(0, layer.height() as i64 - 1) as u32;
    layer.get_pixel(cx, cy).0
}

/// Colour of `top` over `bottom` at one pixel, without touching either.
pub fn sample_over(bottom: &Surface, top: &Surface, x: u32, y: u32) -> [u8; 4] {
    let mut px = bottom.get_pixel(x, y).0;
    CompositeRule::SourceOver.apply(&mut px, top.get_pixel(x, y).0, 1.0);
    px
}

/// Colour a paint stamp deposits at a pixel: the brush colour mixed into
/// the colour underneath, weighted by the stamp's coverage there.
pub fn paint_over(under: [u8; 4], brush: Rgb, coverage: f32) -> Rgb {
    if under[3] == 0 {
        return brush;
    }
    mix([under[0], under[1], under[2]], brush, coverage)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YELLOW: Rgb = [255, 255, 0];
    const BLUE: Rgb = [0, 0, 255];

    #[test]
    fn yellow_and_blue_make_green() {
        let mixed = mix(YELLOW, BLUE, 0.5);
        let naive = [128u8, 128, 128];
        assert!(mixed[1] > naive[1], "green {} vs naive {}", mixed[1], naive[1]);
        let rb = mixed[0] as u32 + mixed[2] as u32;
        let naive_rb = naive[0] as u32 + naive[2] as u32;
        assert!(rb < naive_rb, "red+blue {} vs naive {}", rb, naive_rb);
    }

    #[test]
    fn primaries_round_trip_through_latent_space() {
        for c in [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 255], [0, 0, 0], YELLOW] {
            assert_eq!(from_latent(to_latent(c)), c, "colour {:?}", c);
        }
    }

    #[test]
    fn mix_endpoints_are_exact() {
        let a = [12, 200, 77];
        let b = [250, 3, 90];
        assert_eq!(mix(a, b, 0.0), a);
        assert_eq!(mix(a, b, 1.0), b);
        assert_eq!(mix(a, a, 0.5), a);
    }

    #[test]
    fn transparent_under_colour_keeps_brush() {
        assert_eq!(paint_over([255, 0, 0, 0], BLUE, 0.3), BLUE);
        assert_eq!(paint_over([255, 0, 0, 255], BLUE, 1.0), BLUE);
    }

    #[test]
    fn sample_clamps_coordinates() {
        let mut s = Surface::new(2, 2);
        s.put_pixel(1, 1, image::Rgba([1, 2, 3, 4]));
        assert_eq!(sample(&s, 5, 9), [1, 2, 3, 4]);
        assert_eq!(sample(&s, -3, -3), [0, 0, 0, 0]);
    }
}
