// ============================================================================
// PREVIEW TEXTURE: GPU copy of the preview layer with partial upload
// ============================================================================

use crate::canvas::{DirtyRect, Surface};

/// GPU-side copy of one object's preview surface.
///
/// While a stroke is in progress only the rectangle the stroke touched is
/// re-uploaded via `queue.write_texture`.
pub struct PreviewTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl PreviewTexture {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("preview_texture"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view, width, height }
    }

    pub fn matches(&self, surface: &Surface) -> bool {
        surface.dimensions() == (self.width, self.height)
    }

    /// Upload only `rect` of `surface`. The rows are packed into `scratch`,
    /// which is kept by the caller and reused between uploads.
    pub fn update_rect(&self, queue: &wgpu::Queue, surface: &Surface, rect: DirtyRect, scratch: &mut Vec<u8>) {
        if rect.is_empty() {
            return;
        }
        let row_bytes = (self.width * 4) as usize;
        let rect_bytes = (rect.width * 4) as usize;
        let raw: &[u8] = surface.as_raw();

        scratch.clear();
        scratch.reserve(rect_bytes * rect.height as usize);
        for y in rect.y..rect.bottom() {
            let start = y as usize * row_bytes + rect.x as usize * 4;
            scratch.extend_from_slice(&raw[start..start + rect_bytes]);
        }

        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: rect.x, y: rect.y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            scratch.as_slice(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * rect.width),
                rows_per_image: Some(rect.height),
            },
            wgpu::Extent3d { width: rect.width, height: rect.height, depth_or_array_layers: 1 },
        );
    }

    /// Full re-upload of the preview.
    pub fn upload_full(&self, queue: &wgpu::Queue, surface: &Surface) {
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            surface.as_raw(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * self.width),
                rows_per_image: Some(self.height),
            },
            wgpu::Extent3d { width: self.width, height: self.height, depth_or_array_layers: 1 },
        );
    }
}

/// Render target the adjustment pass writes into.
pub struct DisplayTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub width: u32,
    pub height: u32,
}

impl DisplayTexture {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("display_texture"),
            size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view, width, height }
    }
}
