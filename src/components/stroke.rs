// ============================================================================
// STROKE: pointer path → spaced stamps → per-tool layer updates
// ============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::canvas::{
    CompositeRule, DirtyRect, LayerName, LayerStack, Surface, TRANSPARENT, composite_surface, try_alloc_surface,
};
use crate::components::brush::{BrushConfig, TextureLibrary, TipCache, TipMask};
use crate::components::stamp::StampRenderer;
use crate::error::{EngineError, EngineResult};
use crate::ops::pigment;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolMode {
    #[default]
    Paint,
    Erase,
    /// Exclude from the mask.
    MaskPaint,
    /// Include in the mask again.
    MaskRestore,
}

impl ToolMode {
    pub fn label(&self) -> &'static str {
        match self {
            ToolMode::Paint => "paint",
            ToolMode::Erase => "erase",
            ToolMode::MaskPaint => "maskPaint",
            ToolMode::MaskRestore => "maskRestore",
        }
    }

    /// Mask tools write the mask directly and skip the active stroke layer.
    pub fn is_mask_tool(&self) -> bool {
        matches!(self, ToolMode::MaskPaint | ToolMode::MaskRestore)
    }

    /// Rule used for each stamp on the tool's target layer.
    pub fn stamp_rule(&self) -> CompositeRule {
        match self {
            ToolMode::Paint | ToolMode::Erase | ToolMode::MaskRestore => CompositeRule::SourceOver,
            ToolMode::MaskPaint => CompositeRule::DestinationOut,
        }
    }

    /// Rule used to apply the active stroke to the permanent layer, both at
    /// commit and in the live preview. `None` for mask tools.
    pub fn commit_rule(&self) -> Option<CompositeRule> {
        match self {
            ToolMode::Paint => Some(CompositeRule::SourceOver),
            ToolMode::Erase => Some(CompositeRule::DestinationOut),
            ToolMode::MaskPaint | ToolMode::MaskRestore => None,
        }
    }
}

/// How a gesture ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrokeEnd {
    Release,
    /// Pointer cancel or leave.
    Cancel,
}

/// Ephemeral path of the current gesture.
#[derive(Clone, Debug, Default)]
pub struct StrokePath {
    pub points: Vec<(f32, f32)>,
    pub last_stamp: (f32, f32),
    pub stamps: usize,
}

impl StrokePath {
    fn start(point: (f32, f32)) -> Self {
        Self { points: vec![point], last_stamp: point, stamps: 0 }
    }

    /// True once the pointer moved after pointer-down.
    pub fn extended(&self) -> bool {
        self.points.len() > 1
    }
}

/// Positions of the stamps emitted between the previous stamp and a new
/// pointer position: `ceil(d / spacing)` points evenly re-divided along the
/// segment, ending exactly at `to`.
pub fn stamp_positions(from: (f32, f32), to: (f32, f32), spacing: f32) -> impl Iterator<Item = (f32, f32)> {
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    let d = (dx * dx + dy * dy).sqrt();
    let count = if d > 0.0 { (d / spacing.max(1.0)).ceil() as usize } else { 0 };
    (1..=count).map(move |k| {
        let t = k as f32 / count as f32;
        (from.0 + dx * t, from.1 + dy * t)
    })
}

/// Snapshot of a running stroke, for the preview composer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActiveStrokeView {
    pub tool: ToolMode,
    pub opacity: f32,
}

/// Result of ending a stroke.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StrokeOutcome {
    pub tool: ToolMode,
    pub stamps: usize,
    /// False when a cancelled zero-length mask gesture was discarded.
    pub committed: bool,
    pub dirty: Option<DirtyRect>,
}

struct Stroke {
    tool: ToolMode,
    brush: BrushConfig,
    tip: TipMask,
    path: StrokePath,
    dirty: Option<DirtyRect>,
}

/// Runs one gesture at a time against a layer stack.
#[derive(Default)]
pub struct StrokeCompositor {
    renderer: StampRenderer,
    tip_cache: TipCache,
    stroke: Option<Stroke>,
    /// Mask as it was at pointer-down, for discarding a cancelled dab.
    mask_scratch: Option<Surface>,
}

impl StrokeCompositor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.stroke.is_some()
    }

    pub fn active_view(&self) -> Option<ActiveStrokeView> {
        self.stroke
            .as_ref()
            .map(|s| ActiveStrokeView { tool: s.tool, opacity: s.brush.opacity })
    }

    pub fn path(&self) -> Option<&StrokePath> {
        self.stroke.as_ref().map(|s| &s.path)
    }

    /// Pointer-down: snapshot the brush, build the tip and emit the first
    /// stamp at `point`. A stroke already running is ended normally first.
    pub fn begin(
        &mut self,
        layers: &mut LayerStack,
        library: &TextureLibrary,
        tool: ToolMode,
        brush: &BrushConfig,
        point: (f32, f32),
    ) -> EngineResult<Option<DirtyRect>> {
        let brush = brush.validated()?;
        if self.stroke.is_some() {
            self.end(layers, StrokeEnd::Release)?;
        }
        let tip = self.tip_cache.get(library, &brush)?.clone();

        if tool.is_mask_tool() {
            self.snapshot_mask(&layers.mask)?;
        }

        debug!(tool = tool.label(), size = brush.size, texture = brush.texture.name(), "stroke begin");
        let mut stroke = Stroke { tool, brush, tip, path: StrokePath::start(point), dirty: None };
        let angle = stroke.brush.rotation_degrees;
        let rect = Self::emit(&mut self.renderer, layers, &mut stroke, point, angle);
        self.stroke = Some(stroke);
        Ok(rect)
    }

    /// Pointer-move: stamp along the segment from the last stamp to `point`.
    /// Returns the union of touched rectangles.
    pub fn extend(&mut self, layers: &mut LayerStack, point: (f32, f32)) -> Option<DirtyRect> {
        let stroke = self.stroke.as_mut()?;
        let from = stroke.path.last_stamp;
        stroke.path.points.push(point);

        let angle = if stroke.brush.follow_path {
            (point.1 - from.1).atan2(point.0 - from.0).to_degrees()
        } else {
            stroke.brush.rotation_degrees
        };

        let spacing = stroke.brush.spacing();
        let mut touched: Option<DirtyRect> = None;
        for pos in stamp_positions(from, point, spacing) {
            if let Some(r) = Self::emit(&mut self.renderer, layers, stroke, pos, angle) {
                touched = Some(touched.map_or(r, |t| t.union(r)));
            }
        }
        touched
    }

    /// Pointer-up, cancel or leave. Paint and erase commit the active stroke;
    /// mask tools already wrote the mask, and a cancelled mask dab with no
    /// movement is rolled back.
    pub fn end(&mut self, layers: &mut LayerStack, how: StrokeEnd) -> EngineResult<Option<StrokeOutcome>> {
        let Some(stroke) = self.stroke.take() else {
            return Ok(None);
        };
        let mut committed = true;

        match stroke.tool {
            ToolMode::Paint => {
                composite_surface(
                    &mut layers.permanent_strokes,
                    &layers.active_stroke,
                    CompositeRule::SourceOver,
                    stroke.brush.opacity,
                )?;
                layers.clear(LayerName::ActiveStroke);
            }
            ToolMode::Erase => {
                composite_surface(
                    &mut layers.permanent_strokes,
                    &layers.active_stroke,
                    CompositeRule::DestinationOut,
                    1.0,
                )?;
                layers.clear(LayerName::ActiveStroke);
            }
            ToolMode::MaskPaint | ToolMode::MaskRestore => {
                if how == StrokeEnd::Cancel && !stroke.path.extended() {
                    if let Some(before) = &self.mask_scratch {
                        layers.mask.as_mut().copy_from_slice(before.as_raw());
                    }
                    committed = false;
                }
            }
        }

        info!(
            tool = stroke.tool.label(),
            stamps = stroke.path.stamps,
            committed,
            cancelled = how == StrokeEnd::Cancel,
            "stroke end"
        );
        Ok(Some(StrokeOutcome {
            tool: stroke.tool,
            stamps: stroke.path.stamps,
            committed,
            dirty: stroke.dirty,
        }))
    }

    /// Drop the running stroke without committing, clearing the active layer.
    /// Used when the stack is resized or restored underneath a gesture.
    pub fn abort(&mut self, layers: &mut LayerStack) {
        if self.stroke.take().is_some() {
            layers.clear(LayerName::ActiveStroke);
            debug!("stroke aborted");
        }
    }

    fn snapshot_mask(&mut self, mask: &Surface) -> EngineResult<()> {
        let reuse = matches!(&self.mask_scratch, Some(s) if s.dimensions() == mask.dimensions());
        if !reuse {
            self.mask_scratch = Some(try_alloc_surface(mask.width(), mask.height(), TRANSPARENT)?);
        }
        let scratch = self
            .mask_scratch
            .as_mut()
            .ok_or_else(|| EngineError::compositing("mask scratch missing"))?;
        scratch.as_mut().copy_from_slice(mask.as_raw());
        Ok(())
    }

    /// Apply one stamp for the stroke's tool.
    fn emit(
        renderer: &mut StampRenderer,
        layers: &mut LayerStack,
        stroke: &mut Stroke,
        pos: (f32, f32),
        angle: f32,
    ) -> Option<DirtyRect> {
        let color = stroke.brush.color;
        let rule = stroke.tool.stamp_rule();
        let rect = match stroke.tool {
            ToolMode::Paint => {
                let background = &layers.background;
                let permanent = &layers.permanent_strokes;
                renderer.stamp(&mut layers.active_stroke, pos, color, &stroke.tip, angle, rule, |x, y, texel| {
                    let under = pigment::sample_over(background, permanent, x, y);
                    let c = pigment::paint_over(under, color, texel[3] as f32 / 255.0);
                    [c[0], c[1], c[2], texel[3]]
                })
            }
            // Any coverage at all clears the pixel at commit.
            ToolMode::Erase => {
                renderer.stamp(&mut layers.active_stroke, pos, color, &stroke.tip, angle, rule, |_, _, _| {
                    [255, 255, 255, 255]
                })
            }
            ToolMode::MaskRestore => {
                renderer.stamp(&mut layers.mask, pos, color, &stroke.tip, angle, rule, |_, _, texel| {
                    [255, 255, 255, texel[3]]
                })
            }
            ToolMode::MaskPaint => {
                renderer.stamp(&mut layers.mask, pos, color, &stroke.tip, angle, rule, |_, _, texel| texel)
            }
        };
        stroke.path.stamps += 1;
        stroke.path.last_stamp = pos;
        if let Some(r) = rect {
            stroke.dirty = Some(stroke.dirty.map_or(r, |d| d.union(r)));
        }
        rect
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::OPAQUE_WHITE;
    use crate::components::brush::TextureKind;
    use image::{Rgba, RgbaImage};

    fn red_stack(w: u32, h: u32) -> LayerStack {
        LayerStack::with_background(RgbaImage::from_pixel(w, h, Rgba([255, 0, 0, 255]))).unwrap()
    }

    fn hard_brush(size: f32) -> BrushConfig {
        BrushConfig { size, hardness: 1.0, color: [0, 0, 255], ..Default::default() }
    }

    fn painted(surface: &Surface) -> usize {
        surface.pixels().filter(|p| p.0[3] > 0).count()
    }

    #[test]
    fn spacing_is_redivided_evenly() {
        let pts: Vec<_> = stamp_positions((0.0, 0.0), (10.0, 0.0), 3.0).collect();
        assert_eq!(pts.len(), 4, "ceil(10 / 3)");
        assert_eq!(pts[0], (2.5, 0.0));
        assert_eq!(pts[3], (10.0, 0.0));
        assert_eq!(stamp_positions((1.0, 1.0), (1.0, 1.0), 3.0).count(), 0);
    }

    #[test]
    fn zero_length_stroke_commits_one_stamp() {
        let lib = TextureLibrary::builtin();
        let mut layers = red_stack(32, 32);
        let mut comp = StrokeCompositor::new();
        comp.begin(&mut layers, &lib, ToolMode::Paint, &hard_brush(5.0), (16.0, 16.0)).unwrap();
        let out = comp.end(&mut layers, StrokeEnd::Release).unwrap().unwrap();
        assert_eq!(out.stamps, 1);
        assert!(out.committed);
        assert!(painted(&layers.permanent_strokes) > 0);
        assert_eq!(painted(&layers.active_stroke), 0, "active stroke cleared");
    }

    #[test]
    fn moves_emit_spaced_stamps() {
        let lib = TextureLibrary::builtin();
        let mut layers = red_stack(64, 64);
        let mut comp = StrokeCompositor::new();
        let brush = BrushConfig { spacing_ratio: 0.5, ..hard_brush(8.0) };
        comp.begin(&mut layers, &lib, ToolMode::Paint, &brush, (10.0, 10.0)).unwrap();
        comp.extend(&mut layers, (30.0, 10.0));
        assert_eq!(comp.path().unwrap().stamps, 1 + 5, "20px at 4px spacing");
        let out = comp.end(&mut layers, StrokeEnd::Release).unwrap().unwrap();
        assert_eq!(out.dirty.map(|r| r.contains(20, 10)), Some(true));
    }

    #[test]
    fn paint_commit_applies_opacity() {
        let lib = TextureLibrary::builtin();
        let mut layers = red_stack(16, 16);
        let mut comp = StrokeCompositor::new();
        let brush = BrushConfig { opacity: 0.5, ..hard_brush(6.0) };
        comp.begin(&mut layers, &lib, ToolMode::Paint, &brush, (8.0, 8.0)).unwrap();
        comp.end(&mut layers, StrokeEnd::Release).unwrap();
        let px = layers.permanent_strokes.get_pixel(8, 8).0;
        assert_eq!(px[..3], [0, 0, 255]);
        assert!((px[3] as i32 - 128).abs() <= 1, "alpha {}", px[3]);
    }

    #[test]
    fn paint_stamps_mix_with_underlying_colour_at_soft_edges() {
        let lib = TextureLibrary::builtin();
        let mut layers = LayerStack::with_background(RgbaImage::from_pixel(32, 32, Rgba([255, 255, 0, 255]))).unwrap();
        let mut comp = StrokeCompositor::new();
        let brush = BrushConfig { size: 20.0, hardness: 0.0, color: [0, 0, 255], ..Default::default() };
        comp.begin(&mut layers, &lib, ToolMode::Paint, &brush, (16.0, 16.0)).unwrap();
        let center = layers.active_stroke.get_pixel(16, 16).0;
        assert!(center[2] > 240 && center[0] < 10, "center {:?}", center);
        // Partial coverage: pigment mix of yellow and blue leans green
        let edge = layers.active_stroke.get_pixel(16, 24).0;
        assert!(edge[3] > 0 && edge[3] < 255, "edge alpha {}", edge[3]);
        assert!(edge[1] > edge[0], "edge {:?}", edge);
    }

    #[test]
    fn erase_removes_paint_but_not_background() {
        let lib = TextureLibrary::builtin();
        let mut layers = red_stack(48, 48);
        let mut comp = StrokeCompositor::new();
        let brush = BrushConfig { opacity: 0.6, ..hard_brush(10.0) };
        comp.begin(&mut layers, &lib, ToolMode::Paint, &brush, (10.0, 24.0)).unwrap();
        comp.extend(&mut layers, (38.0, 24.0));
        comp.end(&mut layers, StrokeEnd::Release).unwrap();
        assert!(layers.permanent_strokes.get_pixel(24, 24).0[3] > 0);

        comp.begin(&mut layers, &lib, ToolMode::Erase, &hard_brush(10.0), (10.0, 24.0)).unwrap();
        comp.extend(&mut layers, (38.0, 24.0));
        comp.end(&mut layers, StrokeEnd::Cancel).unwrap();
        assert_eq!(layers.permanent_strokes.get_pixel(24, 24).0[3], 0);
        assert_eq!(layers.background.get_pixel(24, 24).0, [255, 0, 0, 255]);
    }

    #[test]
    fn soft_erase_clears_its_whole_footprint() {
        let lib = TextureLibrary::builtin();
        let soft = BrushConfig { color: [0, 0, 255], ..Default::default() };
        for opacity in [1.0, 0.5] {
            let mut layers = red_stack(96, 64);
            let mut comp = StrokeCompositor::new();
            let paint = BrushConfig { opacity, ..soft.clone() };
            comp.begin(&mut layers, &lib, ToolMode::Paint, &paint, (10.0, 32.0)).unwrap();
            comp.extend(&mut layers, (86.0, 32.0));
            comp.end(&mut layers, StrokeEnd::Release).unwrap();
            assert!(painted(&layers.permanent_strokes) > 0);

            comp.begin(&mut layers, &lib, ToolMode::Erase, &soft, (10.0, 32.0)).unwrap();
            comp.extend(&mut layers, (86.0, 32.0));
            let footprint: Vec<(u32, u32)> = layers
                .active_stroke
                .enumerate_pixels()
                .filter(|(_, _, p)| p.0[3] > 0)
                .map(|(x, y, _)| (x, y))
                .collect();
            assert!(!footprint.is_empty());
            comp.end(&mut layers, StrokeEnd::Release).unwrap();

            for (x, y) in footprint {
                let a = layers.permanent_strokes.get_pixel(x, y).0[3];
                assert!(a <= 1, "opacity {} left alpha {} at ({}, {})", opacity, a, x, y);
            }
        }
    }

    #[test]
    fn mask_tools_write_the_mask_directly() {
        let lib = TextureLibrary::builtin();
        let mut layers = red_stack(32, 32);
        let mut comp = StrokeCompositor::new();
        comp.begin(&mut layers, &lib, ToolMode::MaskPaint, &hard_brush(8.0), (16.0, 16.0)).unwrap();
        assert_eq!(layers.mask.get_pixel(16, 16).0[3], 0, "excluded immediately");
        assert_eq!(painted(&layers.active_stroke), 0, "active layer bypassed");
        comp.end(&mut layers, StrokeEnd::Release).unwrap();

        comp.begin(&mut layers, &lib, ToolMode::MaskRestore, &hard_brush(8.0), (16.0, 16.0)).unwrap();
        comp.end(&mut layers, StrokeEnd::Release).unwrap();
        assert_eq!(layers.mask.get_pixel(16, 16).0, OPAQUE_WHITE.0);
    }

    #[test]
    fn cancelled_mask_dab_is_discarded() {
        let lib = TextureLibrary::builtin();
        let mut layers = red_stack(32, 32);
        let mut comp = StrokeCompositor::new();
        comp.begin(&mut layers, &lib, ToolMode::MaskPaint, &hard_brush(8.0), (16.0, 16.0)).unwrap();
        let out = comp.end(&mut layers, StrokeEnd::Cancel).unwrap().unwrap();
        assert!(!out.committed);
        assert!(layers.mask.pixels().all(|p| p.0[3] == 255));

        // With movement, a cancel commits like a release.
        comp.begin(&mut layers, &lib, ToolMode::MaskPaint, &hard_brush(8.0), (8.0, 16.0)).unwrap();
        comp.extend(&mut layers, (20.0, 16.0));
        let out = comp.end(&mut layers, StrokeEnd::Cancel).unwrap().unwrap();
        assert!(out.committed);
        assert_eq!(layers.layer(LayerName::Mask).get_pixel(14, 16).0[3], 0);
    }

    #[test]
    fn brush_is_snapshotted_at_pointer_down() {
        let lib = TextureLibrary::builtin();
        let mut layers = red_stack(64, 64);
        let mut comp = StrokeCompositor::new();
        let mut brush = hard_brush(4.0);
        comp.begin(&mut layers, &lib, ToolMode::Paint, &brush, (10.0, 10.0)).unwrap();
        brush.size = 40.0;
        comp.extend(&mut layers, (12.0, 10.0));
        comp.end(&mut layers, StrokeEnd::Release).unwrap();
        assert_eq!(layers.permanent_strokes.get_pixel(10, 25).0[3], 0, "live size change ignored");
    }

    #[test]
    fn unsupported_texture_rejects_stroke() {
        let lib = TextureLibrary::builtin();
        let mut layers = red_stack(8, 8);
        let mut comp = StrokeCompositor::new();
        let brush = BrushConfig { texture: TextureKind::Image("missing".into()), ..Default::default() };
        let err = comp.begin(&mut layers, &lib, ToolMode::Paint, &brush, (4.0, 4.0));
        assert!(matches!(err, Err(EngineError::Validation(_))));
        assert!(!comp.is_active());
    }
}
