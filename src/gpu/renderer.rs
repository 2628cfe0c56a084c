// ============================================================================
// ADJUSTMENT STAGE: preview texture → brightness/contrast/saturation pass
// ============================================================================

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, error, info};
use wgpu::util::DeviceExt;

use super::align_dirty_rect;
use super::context::GpuContext;
use super::texture::{DisplayTexture, PreviewTexture};
use crate::canvas::{DirtyRect, Surface};
use crate::error::{EngineError, EngineResult};
use crate::ops::adjust::Adjustments;

/// Uniform block matching `AdjustUniforms` in the WGSL source.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct AdjustUniforms {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub _pad: f32,
}

impl From<Adjustments> for AdjustUniforms {
    fn from(a: Adjustments) -> Self {
        Self { brightness: a.brightness, contrast: a.contrast, saturation: a.saturation, _pad: 0.0 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageState {
    Uninitialized,
    Ready,
    /// Compilation or device setup failed; the stage stays off until torn
    /// down and initialised again.
    Failed(String),
}

/// What the display should show after a render call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisplaySource {
    /// The adjusted image in the stage's display texture.
    Adjusted,
    /// The preview surface as-is.
    Uncorrected,
}

struct AdjustPipeline {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
}

impl AdjustPipeline {
    /// Build the program inside a validation error scope so a bad shader is
    /// reported here instead of poisoning the device later.
    fn compile(device: &wgpu::Device) -> Result<Self, String> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("adjust_shader"),
            source: wgpu::ShaderSource::Wgsl(super::shaders::ADJUST_SHADER.into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("adjust_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("adjust_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("adjust_pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: Default::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            multiview: None,
        });

        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("adjust_uniforms"),
            contents: bytemuck::bytes_of(&AdjustUniforms::from(Adjustments::default())),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(err.to_string());
        }
        Ok(Self { pipeline, bind_group_layout, uniform_buffer })
    }
}

/// Source/target textures sized to one preview.
struct StageTargets {
    source: PreviewTexture,
    display: DisplayTexture,
    bind_group: wgpu::BindGroup,
}

/// Applies [`Adjustments`] to a preview surface on the GPU.
///
/// Lifecycle is explicit: [`init`](Self::init) compiles the program and
/// [`teardown`](Self::teardown) releases everything. Both are safe to call
/// repeatedly.
pub struct AdjustmentStage {
    state: StageState,
    ctx: Option<Arc<GpuContext>>,
    pipeline: Option<AdjustPipeline>,
    targets: Option<StageTargets>,
    uploaded_generation: Option<u64>,
    rendered: Option<(u64, Adjustments)>,
    upload_scratch: Vec<u8>,
    cached_staging: Option<(wgpu::Buffer, u64)>,
}

impl Default for AdjustmentStage {
    fn default() -> Self {
        Self::new()
    }
}

impl AdjustmentStage {
    pub fn new() -> Self {
        Self {
            state: StageState::Uninitialized,
            ctx: None,
            pipeline: None,
            targets: None,
            uploaded_generation: None,
            rendered: None,
            upload_scratch: Vec::new(),
            cached_staging: None,
        }
    }

    pub fn state(&self) -> &StageState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == StageState::Ready
    }

    /// `Uninitialized -> Ready`, or `-> Failed` when there is no device or
    /// the program does not compile. A failure is logged here, once.
    pub fn init(&mut self, ctx: Option<Arc<GpuContext>>) -> &StageState {
        if self.state != StageState::Uninitialized {
            return &self.state;
        }
        let Some(ctx) = ctx else {
            self.fail("no GPU device".to_string());
            return &self.state;
        };
        match AdjustPipeline::compile(&ctx.device) {
            Ok(pipeline) => {
                info!(adapter = %ctx.adapter_name, "adjustment stage ready");
                self.pipeline = Some(pipeline);
                self.ctx = Some(ctx);
                self.state = StageState::Ready;
            }
            Err(msg) => self.fail(format!("adjust program failed to compile: {}", msg)),
        }
        &self.state
    }

    fn fail(&mut self, msg: String) {
        error!(reason = %msg, "adjustment stage disabled, showing uncorrected preview");
        self.pipeline = None;
        self.targets = None;
        self.ctx = None;
        self.state = StageState::Failed(msg);
    }

    /// The failure as an error value, for callers that surface it.
    pub fn failure(&self) -> Option<EngineError> {
        match &self.state {
            StageState::Failed(msg) => Some(EngineError::shader_init(msg.clone())),
            _ => None,
        }
    }

    /// Release all GPU resources and return to `Uninitialized`.
    pub fn teardown(&mut self) {
        if self.state == StageState::Uninitialized && self.ctx.is_none() {
            return;
        }
        self.targets = None;
        self.pipeline = None;
        self.cached_staging = None;
        self.ctx = None;
        self.uploaded_generation = None;
        self.rendered = None;
        self.state = StageState::Uninitialized;
        debug!("adjustment stage torn down");
    }

    /// Upload the preview if its `generation` is new (only `changed` when
    /// possible) and redraw if the preview or `adjustments` changed. The
    /// draw is submitted without waiting for the GPU.
    pub fn render(
        &mut self,
        preview: &Surface,
        generation: u64,
        changed: Option<DirtyRect>,
        adjustments: Adjustments,
    ) -> DisplaySource {
        if self.state != StageState::Ready {
            return DisplaySource::Uncorrected;
        }
        let (Some(ctx), Some(pipeline)) = (self.ctx.clone(), self.pipeline.as_ref()) else {
            return DisplaySource::Uncorrected;
        };
        let (w, h) = preview.dimensions();
        if !ctx.supports_size(w, h) {
            self.fail(format!("preview {}x{} exceeds device limit {}", w, h, ctx.max_texture_dim));
            return DisplaySource::Uncorrected;
        }

        let needs_targets = !matches!(&self.targets, Some(t) if t.source.matches(preview));
        if needs_targets {
            let source = PreviewTexture::new(&ctx.device, w, h);
            let display = DisplayTexture::new(&ctx.device, w, h);
            let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("adjust_bg"),
                layout: &pipeline.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: pipeline.uniform_buffer.as_entire_binding() },
                    wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(&source.view) },
                ],
            });
            self.targets = Some(StageTargets { source, display, bind_group });
            self.uploaded_generation = None;
            self.rendered = None;
        }
        let Some(targets) = self.targets.as_ref() else {
            return DisplaySource::Uncorrected;
        };

        if self.uploaded_generation != Some(generation) {
            match (self.uploaded_generation, changed) {
                (Some(_), Some(rect)) => {
                    let rect = align_dirty_rect(rect, w, h);
                    targets.source.update_rect(&ctx.queue, preview, rect, &mut self.upload_scratch);
                }
                _ => targets.source.upload_full(&ctx.queue, preview),
            }
            self.uploaded_generation = Some(generation);
        }

        if self.rendered == Some((generation, adjustments)) {
            return DisplaySource::Adjusted;
        }

        ctx.queue
            .write_buffer(&pipeline.uniform_buffer, 0, bytemuck::bytes_of(&AdjustUniforms::from(adjustments)));

        let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("adjust_encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("adjust_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &targets.display.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &targets.bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        ctx.submit_one(encoder);
        self.rendered = Some((generation, adjustments));
        debug!(generation, "adjustment pass submitted");
        DisplaySource::Adjusted
    }

    /// Copy the display texture back to the CPU. Blocks on the GPU, so it
    /// is meant for export and tests, never for the pointer path.
    pub fn readback(&mut self) -> EngineResult<Option<Surface>> {
        let (Some(ctx), Some(targets)) = (self.ctx.as_ref(), self.targets.as_ref()) else {
            return Ok(None);
        };
        if self.rendered.is_none() {
            return Ok(None);
        }
        let (width, height) = (targets.display.width, targets.display.height);
        let bytes_per_row = aligned_bytes_per_row(width);
        let buffer_size = (bytes_per_row * height) as u64;

        let reuse = matches!(&self.cached_staging, Some((_, sz)) if *sz >= buffer_size);
        if !reuse {
            let buf = ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("readback_staging"),
                size: buffer_size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            self.cached_staging = Some((buf, buffer_size));
        }
        let Some((staging, _)) = self.cached_staging.as_ref() else {
            return Err(EngineError::compositing("readback staging buffer missing"));
        };

        let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &targets.display.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        ctx.submit_one(encoder);

        let slice = staging.slice(..buffer_size);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EngineError::compositing(format!("readback map failed: {:?}", e))),
            Err(e) => return Err(EngineError::compositing(format!("readback channel closed: {}", e))),
        }

        let actual_row = (width * 4) as usize;
        let mut pixels = Vec::with_capacity(actual_row * height as usize);
        {
            let mapped = slice.get_mapped_range();
            for y in 0..height as usize {
                let start = y * bytes_per_row as usize;
                pixels.extend_from_slice(&mapped[start..start + actual_row]);
            }
        }
        staging.unmap();

        Surface::from_raw(width, height, pixels)
            .map(Some)
            .ok_or_else(|| EngineError::compositing("readback size mismatch"))
    }
}

impl Drop for AdjustmentStage {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn aligned_bytes_per_row(width: u32) -> u32 {
    (width * 4).div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn missing_device_degrades_to_uncorrected() {
        let mut stage = AdjustmentStage::new();
        assert_eq!(stage.state(), &StageState::Uninitialized);
        assert!(matches!(stage.init(None), StageState::Failed(_)));
        assert!(matches!(stage.failure(), Some(EngineError::ShaderInit(_))));

        let preview = Surface::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        let adj = Adjustments { brightness: 2.0, ..Default::default() };
        assert_eq!(stage.render(&preview, 1, None, adj), DisplaySource::Uncorrected);
        assert!(stage.readback().unwrap().is_none());
    }

    #[test]
    fn failure_is_not_retried_until_teardown() {
        let mut stage = AdjustmentStage::new();
        stage.init(None);
        // A later init does not retry a failed stage.
        assert!(matches!(stage.init(None), StageState::Failed(_)));
        stage.teardown();
        stage.teardown();
        assert_eq!(stage.state(), &StageState::Uninitialized);
    }

    #[test]
    fn uniforms_match_shader_layout() {
        assert_eq!(std::mem::size_of::<AdjustUniforms>(), 16);
        let u = AdjustUniforms::from(Adjustments { contrast: 2.0, saturation: 0.5, brightness: 1.5 });
        assert_eq!((u.brightness, u.contrast, u.saturation), (1.5, 2.0, 0.5));
    }

    #[test]
    fn row_alignment() {
        assert_eq!(aligned_bytes_per_row(1), 256);
        assert_eq!(aligned_bytes_per_row(64), 256);
        assert_eq!(aligned_bytes_per_row(65), 512);
    }
}
