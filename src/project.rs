use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canvas::{
    CompositeRule, DirtyRect, LayerName, LayerStack, Surface, TRANSPARENT, composite_surface, try_alloc_surface,
};
use crate::components::brush::{BrushConfig, TextureLibrary};
use crate::components::stroke::{StrokeCompositor, StrokeEnd, StrokeOutcome, ToolMode};
use crate::error::{EngineError, EngineResult};
use crate::gpu::{AdjustmentStage, DisplaySource, GpuContext};
use crate::io::{EncodedLayer, LayerCapture, PersistenceAdapter, SaveQueue, SaveStats, decode_layer};
use crate::ops::adjust::Adjustments;
use crate::ops::mask::{self, MaskParams};
use crate::ops::preview::PreviewComposer;
use crate::settings::EngineSettings;

/// What the generation service receives for one object.
pub struct GenerationPayload {
    /// Background with committed paint, fully opaque.
    pub source: Surface,
    /// Present only when the mask holds both included and excluded pixels.
    pub inpaint_mask: Option<Surface>,
}

// ============================================================================
// EDITABLE OBJECT
// ============================================================================

/// One image on the canvas with its own layer stack and adjustment stage.
pub struct EditableObject {
    pub id: Uuid,
    layers: LayerStack,
    adjustments: Adjustments,
    tool: ToolMode,
    mask_params: MaskParams,
    compositor: StrokeCompositor,
    preview: PreviewComposer,
    stage: AdjustmentStage,
    /// Changed since the last snapshot was taken.
    unsaved: bool,
}

impl EditableObject {
    pub fn new(id: Uuid, background: Surface, mask_params: MaskParams) -> EngineResult<Self> {
        let layers = LayerStack::with_background(background)?;
        Ok(Self::from_layers(id, layers, mask_params))
    }

    fn from_layers(id: Uuid, layers: LayerStack, mask_params: MaskParams) -> Self {
        let mut preview = PreviewComposer::new();
        preview.mark_all_dirty(layers.width(), layers.height());
        Self {
            id,
            layers,
            adjustments: Adjustments::default(),
            tool: ToolMode::default(),
            mask_params: mask_params.clamped(),
            compositor: StrokeCompositor::new(),
            preview,
            stage: AdjustmentStage::new(),
            unsaved: false,
        }
    }

    /// Rebuild an object from persisted layers. The background is required;
    /// absent strokes or mask keep their defaults.
    pub fn load(id: Uuid, encoded: &[EncodedLayer], mask_params: MaskParams) -> EngineResult<Self> {
        let layers = decode_stack(encoded)?;
        info!(object = %id, width = layers.width(), height = layers.height(), "object loaded");
        Ok(Self::from_layers(id, layers, mask_params))
    }

    pub fn layers(&self) -> &LayerStack {
        &self.layers
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.layers.dimensions()
    }

    pub fn tool(&self) -> ToolMode {
        self.tool
    }

    /// Takes effect at the next pointer-down.
    pub fn set_tool(&mut self, tool: ToolMode) {
        self.tool = tool;
    }

    pub fn adjustments(&self) -> Adjustments {
        self.adjustments
    }

    pub fn set_adjustments(&mut self, adjustments: Adjustments) -> EngineResult<()> {
        self.adjustments = adjustments.validated()?;
        Ok(())
    }

    pub fn is_stroking(&self) -> bool {
        self.compositor.is_active()
    }

    pub fn is_unsaved(&self) -> bool {
        self.unsaved
    }

    pub fn stage(&self) -> &AdjustmentStage {
        &self.stage
    }

    pub fn init_stage(&mut self, ctx: Option<Arc<GpuContext>>) {
        self.stage.init(ctx);
    }

    pub fn teardown_stage(&mut self) {
        self.stage.teardown();
    }

    // ------------------------------------------------------------------------
    // Pointer input, already in object-local pixel coordinates
    // ------------------------------------------------------------------------

    pub fn pointer_down(
        &mut self,
        library: &TextureLibrary,
        brush: &BrushConfig,
        point: (f32, f32),
    ) -> EngineResult<()> {
        match self.compositor.begin(&mut self.layers, library, self.tool, brush, point) {
            Ok(rect) => {
                self.touch(rect);
                Ok(())
            }
            Err(e) => {
                if matches!(e, EngineError::Compositing(_)) {
                    warn!(object = %self.id, error = %e, "stroke aborted");
                    self.compositor.abort(&mut self.layers);
                }
                Err(e)
            }
        }
    }

    pub fn pointer_move(&mut self, point: (f32, f32)) -> Option<DirtyRect> {
        let rect = self.compositor.extend(&mut self.layers, point);
        self.touch(rect);
        rect
    }

    /// Pointer-up, cancel or leave. Returns the outcome when a stroke was
    /// running; the caller persists committed strokes.
    pub fn pointer_up(&mut self, how: StrokeEnd) -> EngineResult<Option<StrokeOutcome>> {
        let outcome = self.compositor.end(&mut self.layers, how)?;
        if let Some(out) = &outcome {
            if let Some(rect) = out.dirty {
                self.preview.mark_dirty(rect);
            }
            self.unsaved |= out.committed;
            self.preview.recompute(&mut self.layers, None);
        }
        Ok(outcome)
    }

    fn touch(&mut self, rect: Option<DirtyRect>) {
        if let Some(rect) = rect {
            self.preview.mark_dirty(rect);
        }
        let view = self.compositor.active_view();
        self.preview.recompute(&mut self.layers, view);
    }

    // ------------------------------------------------------------------------
    // Layers
    // ------------------------------------------------------------------------

    /// Resize every layer. Paint and mask history are cleared and any running
    /// stroke is dropped.
    pub fn resize(&mut self, width: u32, height: u32) -> EngineResult<()> {
        self.layers.resize(width, height)?;
        self.compositor.abort(&mut self.layers);
        self.preview.mark_all_dirty(width, height);
        self.unsaved = true;
        info!(object = %self.id, width, height, "object resized");
        Ok(())
    }

    pub fn clear_layer(&mut self, name: LayerName) -> EngineResult<()> {
        if name == LayerName::Preview {
            return Err(EngineError::validation("the preview layer is derived and cannot be edited"));
        }
        if name == LayerName::Mask {
            self.layers.reset(LayerName::Mask);
        } else {
            self.layers.clear(name);
        }
        let (w, h) = self.dimensions();
        self.preview.mark_all_dirty(w, h);
        self.unsaved |= name.is_persisted();
        Ok(())
    }

    /// Snap the mask to fully included / excluded pixels.
    pub fn binarize_mask(&mut self) -> EngineResult<()> {
        mask::binarize(&mut self.layers.mask, self.mask_params)?;
        let (w, h) = self.dimensions();
        self.preview.mark_all_dirty(w, h);
        self.unsaved = true;
        Ok(())
    }

    pub fn mask_is_valid(&self) -> bool {
        mask::is_valid(&self.layers.mask, self.mask_params)
    }

    pub fn inpaint_mask(&self) -> EngineResult<Surface> {
        mask::derive_inpaint_mask(&self.layers.mask, self.mask_params)
    }

    /// Background with committed paint on top, alpha forced to opaque.
    pub fn flattened_source(&self) -> EngineResult<Surface> {
        let (w, h) = self.dimensions();
        let mut out = try_alloc_surface(w, h, TRANSPARENT)?;
        out.copy_from_slice(self.layers.background.as_raw());
        composite_surface(&mut out, &self.layers.permanent_strokes, CompositeRule::SourceOver, 1.0)?;
        for px in out.pixels_mut() {
            px.0[3] = 255;
        }
        Ok(out)
    }

    pub fn generation_payload(&self) -> EngineResult<GenerationPayload> {
        let source = self.flattened_source()?;
        let inpaint_mask = if self.mask_is_valid() {
            Some(self.inpaint_mask()?)
        } else {
            debug!(object = %self.id, "mask carries no edit, sending full variation");
            None
        };
        Ok(GenerationPayload { source, inpaint_mask })
    }

    // ------------------------------------------------------------------------
    // Preview and display
    // ------------------------------------------------------------------------

    pub fn preview_generation(&self) -> u64 {
        self.preview.generation()
    }

    /// Bring the preview up to date and return it.
    pub fn recompute_preview(&mut self) -> &Surface {
        let view = self.compositor.active_view();
        self.preview.recompute(&mut self.layers, view)
    }

    /// Push the preview through the adjustment stage. Returns what the
    /// display should show.
    pub fn render_display(&mut self) -> DisplaySource {
        let view = self.compositor.active_view();
        self.preview.recompute(&mut self.layers, view);
        let changed = self.preview.take_changed();
        let generation = self.preview.generation();
        self.stage.render(&self.layers.preview, generation, changed, self.adjustments)
    }

    /// The adjusted image on the CPU. Uses the GPU when the stage is ready,
    /// the CPU reference otherwise.
    pub fn export_display(&mut self) -> EngineResult<Surface> {
        if self.render_display() == DisplaySource::Adjusted {
            if let Some(surface) = self.stage.readback()? {
                return Ok(surface);
            }
        }
        self.adjustments.apply_cpu(&self.layers.preview)
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Copy the persisted layers for writing. Encoding is left to the writer.
    pub fn capture(&mut self) -> LayerCapture {
        let layers = LayerName::PERSISTED
            .iter()
            .map(|&name| (name, self.layers.layer(name).clone()))
            .collect();
        self.unsaved = false;
        LayerCapture { object: self.id, layers }
    }

    /// Replace all persisted layers from encoded snapshots. Decoding happens
    /// first; on any failure the object is left as it was.
    pub fn restore(&mut self, encoded: &[EncodedLayer]) -> EngineResult<()> {
        let layers = decode_stack(encoded)?;
        self.compositor.abort(&mut self.layers);
        self.layers = layers;
        let (w, h) = self.dimensions();
        self.preview.mark_all_dirty(w, h);
        self.unsaved = false;
        Ok(())
    }
}

fn decode_stack(encoded: &[EncodedLayer]) -> EngineResult<LayerStack> {
    let mut decoded: HashMap<LayerName, Surface> = HashMap::new();
    for item in encoded {
        let (name, surface) = decode_layer(&item.bytes)?;
        if name != item.layer {
            return Err(EngineError::codec(format!("snapshot for {} decodes as {}", item.layer, name)));
        }
        decoded.insert(name, surface);
    }
    let background = decoded
        .remove(&LayerName::Background)
        .ok_or_else(|| EngineError::validation("persisted object has no background layer"))?;
    let mut layers = LayerStack::with_background(background)?;
    for (name, surface) in decoded {
        layers.replace(name, surface)?;
    }
    Ok(layers)
}

// ============================================================================
// WORKSPACE: arena of editable objects
// ============================================================================

/// Holds every object by value, plus what they share: the brush, the
/// texture library, settings, the GPU device and the persistence seam.
pub struct Workspace {
    settings: EngineSettings,
    brush: BrushConfig,
    library: TextureLibrary,
    gpu: Option<Arc<GpuContext>>,
    objects: HashMap<Uuid, EditableObject>,
    adapter: Option<Arc<dyn PersistenceAdapter>>,
    saver: Option<SaveQueue>,
}

impl Workspace {
    pub fn new(settings: EngineSettings) -> Self {
        let settings = settings.clamped();
        Self {
            brush: settings.brush.clone(),
            settings,
            library: TextureLibrary::builtin(),
            gpu: None,
            objects: HashMap::new(),
            adapter: None,
            saver: None,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Open the GPU device when enabled. Without one every object displays
    /// its uncorrected preview.
    pub fn init_gpu(&mut self) -> Option<&GpuContext> {
        if !self.settings.gpu_enabled {
            debug!("GPU stage disabled in settings");
            return None;
        }
        if self.gpu.is_none() {
            match GpuContext::new(self.settings.gpu_power) {
                Ok(ctx) => self.gpu = Some(Arc::new(ctx)),
                Err(e) => warn!(error = %e, "no GPU, adjustments fall back to uncorrected preview"),
            }
            for obj in self.objects.values_mut() {
                obj.init_stage(self.gpu.clone());
            }
        }
        self.gpu.as_deref()
    }

    /// Route commits to `adapter`, through the background save queue when
    /// the settings enable it.
    pub fn set_persistence(&mut self, adapter: Arc<dyn PersistenceAdapter>) -> EngineResult<()> {
        self.saver = None;
        if self.settings.save_queue {
            self.saver = Some(SaveQueue::new(Arc::clone(&adapter))?);
        }
        self.adapter = Some(adapter);
        Ok(())
    }

    pub fn brush(&self) -> &BrushConfig {
        &self.brush
    }

    /// Replace the shared brush. Running strokes keep the copy they took.
    pub fn set_brush(&mut self, brush: BrushConfig) -> EngineResult<()> {
        let brush = brush.validated()?;
        if !self.library.supports(&brush.texture) {
            return Err(EngineError::validation(format!(
                "unsupported texture kind '{}'",
                brush.texture.name()
            )));
        }
        self.brush = brush;
        Ok(())
    }

    pub fn library(&self) -> &TextureLibrary {
        &self.library
    }

    pub fn library_mut(&mut self) -> &mut TextureLibrary {
        &mut self.library
    }

    // ------------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------------

    pub fn create_object(&mut self, background: Surface) -> EngineResult<Uuid> {
        let id = Uuid::new_v4();
        let mut obj = EditableObject::new(id, background, self.settings.mask)?;
        if self.gpu.is_some() {
            obj.init_stage(self.gpu.clone());
        }
        info!(object = %id, width = obj.dimensions().0, height = obj.dimensions().1, "object created");
        self.objects.insert(id, obj);
        Ok(id)
    }

    /// Load an object back from the persistence adapter.
    pub fn load_object(&mut self, id: Uuid) -> EngineResult<Uuid> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| EngineError::persistence("no persistence adapter configured"))?;
        let encoded = adapter.load(id)?;
        let mut obj = EditableObject::load(id, &encoded, self.settings.mask)?;
        if self.gpu.is_some() {
            obj.init_stage(self.gpu.clone());
        }
        self.objects.insert(id, obj);
        Ok(id)
    }

    pub fn remove_object(&mut self, id: Uuid) -> Option<EditableObject> {
        self.objects.remove(&id)
    }

    pub fn object(&self, id: Uuid) -> Option<&EditableObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: Uuid) -> Option<&mut EditableObject> {
        self.objects.get_mut(&id)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.objects.keys().copied()
    }

    fn require(&mut self, id: Uuid) -> EngineResult<&mut EditableObject> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| EngineError::validation(format!("unknown object {}", id)))
    }

    // ------------------------------------------------------------------------
    // Strokes
    // ------------------------------------------------------------------------

    /// A stroke still running on the object is released (and persisted)
    /// before the new one starts.
    pub fn pointer_down(&mut self, id: Uuid, point: (f32, f32)) -> EngineResult<()> {
        if self.require(id)?.is_stroking() {
            self.pointer_up(id, StrokeEnd::Release)?;
        }
        let obj = self
            .objects
            .get_mut(&id)
            .ok_or_else(|| EngineError::validation(format!("unknown object {}", id)))?;
        obj.pointer_down(&self.library, &self.brush, point)
    }

    pub fn pointer_move(&mut self, id: Uuid, point: (f32, f32)) -> EngineResult<Option<DirtyRect>> {
        Ok(self.require(id)?.pointer_move(point))
    }

    /// End the stroke and persist the object when something was committed.
    /// A failed save is reported but leaves the in-memory layers intact.
    pub fn pointer_up(&mut self, id: Uuid, how: StrokeEnd) -> EngineResult<Option<StrokeOutcome>> {
        let outcome = self.require(id)?.pointer_up(how)?;
        if outcome.is_some_and(|o| o.committed) {
            self.persist(id)?;
        }
        Ok(outcome)
    }

    /// Capture an object and hand it to the persistence adapter. Queued
    /// captures are encoded on the save worker; inline saves encode here.
    pub fn persist(&mut self, id: Uuid) -> EngineResult<()> {
        if self.adapter.is_none() {
            return Ok(());
        }
        self.sync_save_failures();
        let capture = self.require(id)?.capture();
        if let Some(saver) = &self.saver {
            saver.enqueue(capture);
            return Ok(());
        }
        if let Some(adapter) = &self.adapter {
            if let Err(e) = capture.encode().and_then(|snapshot| adapter.save(&snapshot)) {
                warn!(object = %id, error = %e, "save failed, in-memory layers kept");
                if let Some(obj) = self.objects.get_mut(&id) {
                    obj.unsaved = true;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Wait for queued saves to reach the adapter. Objects whose save failed
    /// are marked unsaved again.
    pub fn flush(&mut self) {
        if let Some(saver) = &self.saver {
            saver.flush();
        }
        self.sync_save_failures();
    }

    /// Queue counters, when saves go through the background queue.
    pub fn save_stats(&self) -> Option<SaveStats> {
        self.saver.as_ref().map(SaveQueue::stats)
    }

    fn sync_save_failures(&mut self) {
        let Some(saver) = &self.saver else {
            return;
        };
        for id in saver.take_failures() {
            if let Some(obj) = self.objects.get_mut(&id) {
                obj.unsaved = true;
            }
        }
    }

    pub fn generation_payload(&self, id: Uuid) -> EngineResult<GenerationPayload> {
        self.objects
            .get(&id)
            .ok_or_else(|| EngineError::validation(format!("unknown object {}", id)))?
            .generation_payload()
    }
}
