// ============================================================================
// PREVIEW COMPOSER: background + permanent + live stroke, clipped by mask
// ============================================================================

use rayon::prelude::*;

use crate::canvas::{CompositeRule, DirtyRect, LayerStack, Surface};
use crate::components::stroke::ActiveStrokeView;

/// Rebuilds the `preview` layer of a stack. Only regions marked dirty are
/// recomposited; the preview buffer itself is reused across calls.
#[derive(Debug, Default)]
pub struct PreviewComposer {
    generation: u64,
    /// Region whose inputs changed since the last recompute.
    pending: Option<DirtyRect>,
    /// Region recomposited since the last [`take_changed`](Self::take_changed).
    changed: Option<DirtyRect>,
    last_view: Option<ActiveStrokeView>,
    last_dims: (u32, u32),
}

impl PreviewComposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every recompute that touched at least one pixel.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mark_dirty(&mut self, rect: DirtyRect) {
        if rect.is_empty() {
            return;
        }
        self.pending = Some(self.pending.map_or(rect, |p| p.union(rect)));
    }

    pub fn mark_all_dirty(&mut self, width: u32, height: u32) {
        self.mark_dirty(DirtyRect::full(width, height));
    }

    /// Region rewritten since the previous call, for partial texture uploads.
    pub fn take_changed(&mut self) -> Option<DirtyRect> {
        self.changed.take()
    }

    /// Recomposite the dirty region of `layers.preview`. Source layers are
    /// only read. Calling this again with nothing marked dirty leaves the
    /// preview untouched.
    pub fn recompute<'a>(&mut self, layers: &'a mut LayerStack, active: Option<ActiveStrokeView>) -> &'a Surface {
        let dims = layers.dimensions();
        if dims != self.last_dims || active != self.last_view {
            self.mark_all_dirty(dims.0, dims.1);
            self.last_dims = dims;
            self.last_view = active;
        }

        let Some(rect) = self.pending.take() else {
            return &layers.preview;
        };
        let rect = clamp_rect(rect, dims.0, dims.1);
        if rect.is_empty() {
            return &layers.preview;
        }

        let width = dims.0 as usize;
        let (stroke_rule, stroke_opacity) = match active {
            Some(view) => match view.tool.commit_rule() {
                Some(CompositeRule::SourceOver) => (Some(CompositeRule::SourceOver), view.opacity),
                Some(rule) => (Some(rule), 1.0),
                None => (None, 0.0),
            },
            None => (None, 0.0),
        };

        let background: &[u8] = layers.background.as_raw();
        let permanent: &[u8] = layers.permanent_strokes.as_raw();
        let stroke: &[u8] = layers.active_stroke.as_raw();
        let mask: &[u8] = layers.mask.as_raw();
        let row_bytes = width * 4;
        let (x0, x1) = (rect.x as usize, rect.right() as usize);
        let (y0, y1) = (rect.y as usize, rect.bottom() as usize);

        let preview: &mut [u8] = layers.preview.as_mut();
        preview[y0 * row_bytes..y1 * row_bytes]
            .par_chunks_mut(row_bytes)
            .enumerate()
            .for_each(|(dy, row)| {
                let y = y0 + dy;
                for x in x0..x1 {
                    let i = (y * width + x) * 4;
                    let px = &mut row[x * 4..x * 4 + 4];

                    // Permanent paint with the live stroke applied, then over
                    // the untouched background.
                    let mut paint = [permanent[i], permanent[i + 1], permanent[i + 2], permanent[i + 3]];
                    if let Some(rule) = stroke_rule {
                        let s = [stroke[i], stroke[i + 1], stroke[i + 2], stroke[i + 3]];
                        rule.apply(&mut paint, s, stroke_opacity);
                    }
                    px.copy_from_slice(&background[i..i + 4]);
                    CompositeRule::SourceOver.apply(px, paint, 1.0);
                    CompositeRule::DestinationIn.apply(px, [0, 0, 0, mask[i + 3]], 1.0);
                }
            });

        self.generation += 1;
        self.changed = Some(self.changed.map_or(rect, |c| c.union(rect)));
        &layers.preview
    }
}

fn clamp_rect(rect: DirtyRect, width: u32, height: u32) -> DirtyRect {
    let x = rect.x.min(width);
    let y = rect.y.min(height);
    let right = rect.right().min(width);
    let bottom = rect.bottom().min(height);
    DirtyRect::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y))
}
