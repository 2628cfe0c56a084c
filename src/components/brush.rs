// ============================================================================
// BRUSH: configuration, tip textures and tip-mask rasterization
// ============================================================================

use std::collections::HashMap;

use image::{GrayImage, Luma, imageops};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Resolution the built-in textures are rasterized at. Tips are resampled
/// from this to the brush size.
pub const BASE_TEXTURE_SIZE: u32 = 128;

/// Largest accepted brush diameter in pixels.
pub const MAX_BRUSH_SIZE: f32 = 4096.0;

/// Identifies a brush tip: the procedural soft gradient, one of the built-in
/// rasterized textures, or an image tip registered at runtime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TextureKind {
    /// Radial gradient generated per size, falloff controlled by hardness.
    #[default]
    Soft,
    Round,
    Square,
    Chalk,
    Bristle,
    /// Image-based tip, identified by the name it was registered under.
    Image(String),
}

impl TextureKind {
    pub fn builtin() -> &'static [TextureKind] {
        &[
            TextureKind::Soft,
            TextureKind::Round,
            TextureKind::Square,
            TextureKind::Chalk,
            TextureKind::Bristle,
        ]
    }

    pub fn name(&self) -> &str {
        match self {
            TextureKind::Soft => "soft",
            TextureKind::Round => "round",
            TextureKind::Square => "square",
            TextureKind::Chalk => "chalk",
            TextureKind::Bristle => "bristle",
            TextureKind::Image(name) => name.as_str(),
        }
    }

    /// Generated per size instead of resampled from the library.
    pub fn is_procedural(&self) -> bool {
        matches!(self, TextureKind::Soft | TextureKind::Square)
    }
}

/// Brush settings as edited by the toolbar. A stroke takes a copy at
/// pointer-down and never reads the live value again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrushConfig {
    /// Footprint diameter in pixels. Values below 1 still stamp one pixel.
    pub size: f32,
    pub color: [u8; 3],
    pub texture: TextureKind,
    /// 0 = fully soft, 1 = hard edge.
    pub hardness: f32,
    /// Fixed tip rotation, ignored when `follow_path` is set.
    pub rotation_degrees: f32,
    /// Rotate each stamp to the instantaneous path tangent.
    pub follow_path: bool,
    /// Stamp spacing as a fraction of `size`.
    pub spacing_ratio: f32,
    /// Opacity applied when the active stroke is committed.
    pub opacity: f32,
}

impl Default for BrushConfig {
    fn default() -> Self {
        Self {
            size: 10.0,
            color: [0, 0, 0],
            texture: TextureKind::Soft,
            hardness: 0.75,
            rotation_degrees: 0.0,
            follow_path: false,
            spacing_ratio: 0.1,
            opacity: 1.0,
        }
    }
}

impl BrushConfig {
    /// Check for non-finite values and clamp the bounded fields.
    pub fn validated(&self) -> EngineResult<Self> {
        let finite = [
            self.size,
            self.hardness,
            self.rotation_degrees,
            self.spacing_ratio,
            self.opacity,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::validation("brush settings must be finite numbers"));
        }
        if self.size < 0.0 {
            return Err(EngineError::validation(format!("brush size {} is negative", self.size)));
        }
        if self.size > MAX_BRUSH_SIZE {
            return Err(EngineError::validation(format!(
                "brush size {} exceeds the maximum of {}",
                self.size, MAX_BRUSH_SIZE
            )));
        }
        Ok(Self {
            size: self.size,
            color: self.color,
            texture: self.texture.clone(),
            hardness: self.hardness.clamp(0.0, 1.0),
            rotation_degrees: self.rotation_degrees.rem_euclid(360.0),
            follow_path: self.follow_path,
            spacing_ratio: self.spacing_ratio.max(0.01),
            opacity: self.opacity.clamp(0.0, 1.0),
        })
    }

    /// Side length of the square stamp buffer.
    pub fn stamp_size(&self) -> u32 {
        stamp_size_for(self.size)
    }

    /// Distance between consecutive stamps, never below one pixel.
    pub fn spacing(&self) -> f32 {
        (self.size * self.spacing_ratio).max(1.0)
    }
}

pub fn stamp_size_for(size: f32) -> u32 {
    if size.is_finite() && size > 1.0 {
        (size.ceil() as u32).max(1)
    } else {
        1
    }
}

// ============================================================================
// TIP MASK
// ============================================================================

/// Alpha footprint of one stamp, `size × size` bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct TipMask {
    pub size: u32,
    pub data: Vec<u8>,
    /// Rotating this mask leaves it unchanged, so stamps skip resampling.
    pub radially_symmetric: bool,
    /// Coverage is confined to the inscribed disc.
    pub disc: bool,
}

impl TipMask {
    pub fn alpha(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.size as usize + x as usize]
    }

    pub fn covered_texels(&self) -> usize {
        self.data.iter().filter(|&&a| a > 0).count()
    }

    /// Procedural soft tip: radial gradient solid up to `hardness * r`,
    /// smoothstep falloff to zero at `r`.
    pub fn soft(size: u32, hardness: f32) -> Self {
        let size = size.max(1);
        let radius = size as f32 / 2.0;
        let n = size as usize;
        let mut data = vec![0u8; n * n];
        for y in 0..size {
            for x in 0..size {
                let dx = x as f32 + 0.5 - radius;
                let dy = y as f32 + 0.5 - radius;
                let t = (dx * dx + dy * dy).sqrt() / radius;
                let a = radial_falloff(t, hardness);
                data[y as usize * n + x as usize] = (a * 255.0).round() as u8;
            }
        }
        // The texel nearest the center always carries some coverage.
        let center = center_index(size);
        if data[center] == 0 {
            data[center] = 255;
        }
        Self { size, data, radially_symmetric: true, disc: true }
    }

    /// Solid square inscribed in the brush disc, centered in the buffer.
    pub fn inscribed_square(size: u32) -> Self {
        let size = size.max(1);
        let mut side = ((size as f32 / std::f32::consts::SQRT_2).floor() as u32).max(1);
        // Keep equal margins on both sides.
        if (size - side) % 2 == 1 && side > 1 {
            side -= 1;
        }
        let offset = (size - side) / 2;
        let n = size as usize;
        let mut data = vec![0u8; n * n];
        for y in offset..offset + side {
            let row = y as usize * n;
            data[row + offset as usize..row + (offset + side) as usize].fill(255);
        }
        Self { size, data, radially_symmetric: false, disc: true }
    }
}

fn center_index(size: u32) -> usize {
    let half = (size / 2) as usize;
    half * size as usize + half
}

/// Alpha at normalized radius `t` (0 = center, 1 = edge).
pub fn radial_falloff(t: f32, hardness: f32) -> f32 {
    if t >= 1.0 {
        return 0.0;
    }
    let inner = hardness.clamp(0.0, 1.0);
    if t <= inner {
        return 1.0;
    }
    let x = 1.0 - ((t - inner) / (1.0 - inner)).clamp(0.0, 1.0);
    x * x * (3.0 - 2.0 * x)
}

type TipKey = (TextureKind, u32, u32);

/// Last-built tip, reused while kind, size and hardness stay the same.
#[derive(Default)]
pub struct TipCache {
    key: Option<TipKey>,
    mask: Option<TipMask>,
}

impl TipCache {
    pub fn get(&mut self, library: &TextureLibrary, brush: &BrushConfig) -> EngineResult<&TipMask> {
        let size = brush.stamp_size();
        let hardness_key = (brush.hardness * 100.0).round() as u32;
        let key = (brush.texture.clone(), size, hardness_key);
        if self.key.as_ref() != Some(&key) || self.mask.is_none() {
            let mask = library.rasterize(&brush.texture, size, brush.hardness)?;
            debug!(kind = brush.texture.name(), size, hardness_key, "tip mask rebuilt");
            self.key = Some(key);
            self.mask = Some(mask);
        }
        self.mask
            .as_ref()
            .ok_or_else(|| EngineError::compositing("tip cache empty after rebuild"))
    }
}

// ============================================================================
// TEXTURE LIBRARY
// ============================================================================

struct SourceTexture {
    mask: GrayImage,
    /// Clip to the inscribed disc after resampling.
    disc: bool,
}

/// Pre-rasterized alpha textures keyed by name. Built once, shared read-only.
pub struct TextureLibrary {
    textures: HashMap<String, SourceTexture>,
}

impl TextureLibrary {
    /// The built-in textures rasterized at [`BASE_TEXTURE_SIZE`].
    pub fn builtin() -> Self {
        let mut textures = HashMap::new();
        let n = BASE_TEXTURE_SIZE;
        textures.insert("round".to_string(), SourceTexture { mask: raster_round(n), disc: true });
        textures.insert("chalk".to_string(), SourceTexture { mask: raster_chalk(n), disc: true });
        textures.insert("bristle".to_string(), SourceTexture { mask: raster_bristle(n), disc: true });
        Self { textures }
    }

    pub fn supports(&self, kind: &TextureKind) -> bool {
        kind.is_procedural() || self.textures.contains_key(kind.name())
    }

    /// Register an image tip from encoded PNG bytes. Alpha is taken from the
    /// image's alpha channel, or from luminance when the image is opaque.
    pub fn register_png(&mut self, name: &str, bytes: &[u8]) -> EngineResult<()> {
        if TextureKind::builtin().iter().any(|k| k.name() == name) {
            return Err(EngineError::validation(format!("'{}' is a built-in texture name", name)));
        }
        let img = image::load_from_memory(bytes)?.to_rgba8();
        let opaque = img.pixels().all(|p| p.0[3] == 255);
        let (w, h) = img.dimensions();
        let mut gray = GrayImage::new(w, h);
        for (x, y, p) in img.enumerate_pixels() {
            let v = if opaque {
                let [r, g, b, _] = p.0;
                (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
            } else {
                p.0[3]
            };
            gray.put_pixel(x, y, Luma([v]));
        }
        let side = BASE_TEXTURE_SIZE;
        let mask = imageops::resize(&gray, side, side, imageops::FilterType::Triangle);
        self.textures.insert(name.to_string(), SourceTexture { mask, disc: true });
        debug!(name, w, h, "image tip registered");
        Ok(())
    }

    /// Resample a texture to `size × size` and apply hardness.
    pub fn rasterize(&self, kind: &TextureKind, size: u32, hardness: f32) -> EngineResult<TipMask> {
        match kind {
            TextureKind::Soft => return Ok(TipMask::soft(size, hardness)),
            TextureKind::Square => return Ok(TipMask::inscribed_square(size)),
            _ => {}
        }
        let src = self
            .textures
            .get(kind.name())
            .ok_or_else(|| EngineError::validation(format!("unsupported texture kind '{}'", kind.name())))?;
        let size = size.max(1);
        let mut data = resample_bilinear(&src.mask, size);

        // Hardness as a contrast threshold: 1.0 leaves the texture as-is,
        // lower values keep only the brightest texels.
        let h = hardness.clamp(0.0, 1.0);
        if h < 0.99 {
            let threshold = (1.0 - h) * 0.6;
            let range = 1.0 - threshold;
            for v in data.iter_mut() {
                let norm = *v as f32 / 255.0;
                let adj = ((norm - threshold) / range).clamp(0.0, 1.0);
                *v = (adj * 255.0).round() as u8;
            }
        }

        if src.disc {
            let radius = size as f32 / 2.0;
            for y in 0..size {
                for x in 0..size {
                    let dx = x as f32 + 0.5 - radius;
                    let dy = y as f32 + 0.5 - radius;
                    if dx * dx + dy * dy > radius * radius {
                        data[y as usize * size as usize + x as usize] = 0;
                    }
                }
            }
        }

        if data.iter().all(|&a| a == 0) {
            data[center_index(size)] = 255;
        }

        Ok(TipMask { size, data, radially_symmetric: false, disc: src.disc })
    }
}

impl Default for TextureLibrary {
    fn default() -> Self {
        Self::builtin()
    }
}

fn resample_bilinear(src: &GrayImage, dst_size: u32) -> Vec<u8> {
    let (sw, sh) = src.dimensions();
    let n = dst_size as usize;
    let mut out = vec![0u8; n * n];
    let scale_x = sw as f32 / dst_size as f32;
    let scale_y = sh as f32 / dst_size as f32;
    for dy in 0..dst_size {
        for dx in 0..dst_size {
            let sx = ((dx as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let sy = ((dy as f32 + 0.5) * scale_y - 0.5).max(0.0);
            let sx0 = (sx.floor() as u32).min(sw - 1);
            let sy0 = (sy.floor() as u32).min(sh - 1);
            let sx1 = (sx0 + 1).min(sw - 1);
            let sy1 = (sy0 + 1).min(sh - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            let v00 = src.get_pixel(sx0, sy0).0[0] as f32;
            let v10 = src.get_pixel(sx1, sy0).0[0] as f32;
            let v01 = src.get_pixel(sx0, sy1).0[0] as f32;
            let v11 = src.get_pixel(sx1, sy1).0[0] as f32;

            let top = v00 * (1.0 - fx) + v10 * fx;
            let bot = v01 * (1.0 - fx) + v11 * fx;
            let val = top * (1.0 - fy) + bot * fy;
            out[dy as usize * n + dx as usize] = val.round().min(255.0) as u8;
        }
    }
    out
}

/// Deterministic per-texel hash in `[0, 1)`.
fn texel_noise(x: u32, y: u32, seed: u32) -> f32 {
    let mut h = x.wrapping_mul(374_761_393) ^ y.wrapping_mul(668_265_263) ^ seed.wrapping_mul(2_246_822_519);
    h = (h ^ (h >> 13)).wrapping_mul(1_274_126_177);
    h ^= h >> 16;
    (h % 10_000) as f32 / 10_000.0
}

fn disc_coverage(x: u32, y: u32, n: u32) -> f32 {
    let r = n as f32 / 2.0;
    let dx = x as f32 + 0.5 - r;
    let dy = y as f32 + 0.5 - r;
    // One texel of antialiasing at the rim.
    (r - (dx * dx + dy * dy).sqrt()).clamp(0.0, 1.0)
}

fn raster_round(n: u32) -> GrayImage {
    GrayImage::from_fn(n, n, |x, y| Luma([(disc_coverage(x, y, n) * 255.0).round() as u8]))
}

fn raster_chalk(n: u32) -> GrayImage {
    GrayImage::from_fn(n, n, |x, y| {
        // Coarse grain: 4×4 cells with per-cell and per-texel noise.
        let grain = 0.55 * texel_noise(x / 4, y / 4, 17) + 0.45 * texel_noise(x, y, 91);
        let v = if grain > 0.35 { grain } else { 0.0 };
        Luma([(disc_coverage(x, y, n) * v * 255.0).round().min(255.0) as u8])
    })
}

fn raster_bristle(n: u32) -> GrayImage {
    GrayImage::from_fn(n, n, |x, y| {
        // Vertical hair streaks with a jittered phase per column band.
        let band = x / 3;
        let phase = texel_noise(band, 0, 53) * std::f32::consts::TAU;
        let streak = 0.5 + 0.5 * (x as f32 * 0.9 + phase).sin();
        let fray = 0.8 + 0.2 * texel_noise(band, y / 8, 7);
        Luma([(disc_coverage(x, y, n) * streak * fray * 255.0).round().min(255.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_pixel_size_still_stamps_one_texel() {
        assert_eq!(stamp_size_for(0.2), 1);
        assert_eq!(stamp_size_for(0.0), 1);
        let mask = TipMask::soft(stamp_size_for(0.2), 0.0);
        assert_eq!(mask.size, 1);
        assert_eq!(mask.data, vec![255]);
    }

    #[test]
    fn soft_mask_falls_off_with_hardness() {
        let hard = TipMask::soft(21, 1.0);
        let soft = TipMask::soft(21, 0.0);
        // Texel just inside the rim
        assert_eq!(hard.alpha(10, 1), 255);
        assert!(soft.alpha(10, 1) < 40, "soft rim alpha {}", soft.alpha(10, 1));
        assert_eq!(soft.alpha(10, 10), 255, "center is solid");
        assert_eq!(hard.alpha(0, 0), 0, "corners lie outside the disc");
    }

    #[test]
    fn spacing_is_at_least_one_pixel() {
        let brush = BrushConfig { size: 2.0, spacing_ratio: 0.1, ..Default::default() };
        assert_eq!(brush.spacing(), 1.0);
        let big = BrushConfig { size: 50.0, spacing_ratio: 0.25, ..Default::default() };
        assert_eq!(big.spacing(), 12.5);
    }

    #[test]
    fn validation_clamps_and_rejects() {
        let wild = BrushConfig { hardness: 3.0, opacity: -1.0, ..Default::default() };
        let v = wild.validated().unwrap();
        assert_eq!(v.hardness, 1.0);
        assert_eq!(v.opacity, 0.0);
        let bad = BrushConfig { size: f32::NAN, ..Default::default() };
        assert!(matches!(bad.validated(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn oversized_brush_is_rejected() {
        let max = BrushConfig { size: MAX_BRUSH_SIZE, ..Default::default() };
        assert!(max.validated().is_ok());
        let huge = BrushConfig { size: 70_000.0, ..Default::default() };
        assert!(matches!(huge.validated(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn unknown_texture_is_a_validation_error() {
        let lib = TextureLibrary::builtin();
        for kind in TextureKind::builtin() {
            assert!(lib.supports(kind), "{}", kind.name());
        }
        let missing = TextureKind::Image("pixie-dust".into());
        assert!(!lib.supports(&missing));
        assert!(matches!(lib.rasterize(&missing, 8, 1.0), Err(EngineError::Validation(_))));
    }

    #[test]
    fn square_tip_is_inscribed_in_the_disc() {
        let lib = TextureLibrary::builtin();
        let mask = lib.rasterize(&TextureKind::Square, 142, 0.2).unwrap();
        assert_eq!(mask.covered_texels(), 100 * 100, "hardness does not soften the square");
        assert_eq!(mask.alpha(20, 20), 0);
        assert_eq!(mask.alpha(21, 21), 255);
        assert_eq!(mask.alpha(120, 120), 255);
        assert_eq!(mask.alpha(121, 71), 0);
        let r = 71.0f32;
        for y in 0..142u32 {
            for x in 0..142u32 {
                if mask.alpha(x, y) > 0 {
                    let dx = x as f32 + 0.5 - r;
                    let dy = y as f32 + 0.5 - r;
                    assert!(dx * dx + dy * dy <= r * r, "texel ({x}, {y}) outside the disc");
                }
            }
        }
        for n in 1..40 {
            let m = TipMask::inscribed_square(n);
            assert!(m.covered_texels() > 0, "size {n}");
        }
    }

    #[test]
    fn disc_textures_are_clipped() {
        let lib = TextureLibrary::builtin();
        for kind in [TextureKind::Round, TextureKind::Chalk, TextureKind::Bristle] {
            let mask = lib.rasterize(&kind, 16, 1.0).unwrap();
            assert_eq!(mask.alpha(0, 0), 0, "{} corner", kind.name());
            assert!(mask.covered_texels() > 0, "{} is empty", kind.name());
        }
    }

    #[test]
    fn registered_png_becomes_a_tip() {
        let img = image::RgbaImage::from_pixel(8, 8, image::Rgba([255, 255, 255, 255]));
        let mut bytes = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        let mut lib = TextureLibrary::builtin();
        lib.register_png("leaf", &bytes).unwrap();
        let kind = TextureKind::Image("leaf".into());
        assert!(lib.supports(&kind));
        let mask = lib.rasterize(&kind, 12, 1.0).unwrap();
        assert_eq!(mask.alpha(6, 6), 255);
        assert!(lib.register_png("round", &bytes).is_err());
    }

    #[test]
    fn tip_cache_reuses_until_key_changes() {
        let lib = TextureLibrary::builtin();
        let mut cache = TipCache::default();
        let brush = BrushConfig { size: 9.0, ..Default::default() };
        let first = cache.get(&lib, &brush).unwrap().clone();
        let again = cache.get(&lib, &brush).unwrap().clone();
        assert_eq!(first, again);
        let bigger = BrushConfig { size: 19.0, ..brush };
        assert_eq!(cache.get(&lib, &bigger).unwrap().size, 19);
    }
}
