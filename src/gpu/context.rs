// ============================================================================
// GPU CONTEXT: wgpu Device, Queue, and adapter initialization
// ============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

/// Adapter power preference, read from settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GpuPower {
    #[default]
    HighPerformance,
    LowPower,
}

impl GpuPower {
    fn to_wgpu(self) -> wgpu::PowerPreference {
        match self {
            GpuPower::HighPerformance => wgpu::PowerPreference::HighPerformance,
            GpuPower::LowPower => wgpu::PowerPreference::LowPower,
        }
    }
}

/// Device and queue shared by every object's adjustment stage.
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_name: String,
    /// Maximum texture dimension supported by this device.
    pub max_texture_dim: u32,
}

impl GpuContext {
    /// Hardware adapter first, then the software rasterizer. Headless: no
    /// surface is ever attached.
    pub fn new(power: GpuPower) -> EngineResult<Self> {
        if let Some(ctx) = pollster::block_on(Self::new_async(power, false)) {
            info!(adapter = %ctx.adapter_name, "GPU context ready");
            return Ok(ctx);
        }
        warn!("hardware adapter unavailable, trying software fallback");
        match pollster::block_on(Self::new_async(power, true)) {
            Some(ctx) => {
                info!(adapter = %ctx.adapter_name, "GPU context ready (fallback adapter)");
                Ok(ctx)
            }
            None => Err(EngineError::shader_init("no GPU adapter available")),
        }
    }

    async fn new_async(power: GpuPower, force_fallback: bool) -> Option<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: power.to_wgpu(),
                compatible_surface: None,
                force_fallback_adapter: force_fallback,
            })
            .await?;

        let adapter_name = adapter.get_info().name.clone();
        let limits = adapter.limits();

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("layerbrush GPU"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits {
                        max_texture_dimension_2d: limits.max_texture_dimension_2d,
                        ..wgpu::Limits::downlevel_defaults()
                    },
                },
                None,
            )
            .await
            .ok()?;

        Some(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_name,
            max_texture_dim: limits.max_texture_dimension_2d,
        })
    }

    /// Check if a texture of the given dimensions can be created.
    pub fn supports_size(&self, width: u32, height: u32) -> bool {
        width <= self.max_texture_dim && height <= self.max_texture_dim
    }

    /// Submit a single encoder's commands without waiting on completion.
    pub fn submit_one(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_preference_maps_to_wgpu() {
        let low: GpuPower = serde_json::from_str(r#""lowPower""#).unwrap();
        assert_eq!(low.to_wgpu(), wgpu::PowerPreference::LowPower);
        assert_eq!(GpuPower::default().to_wgpu(), wgpu::PowerPreference::HighPerformance);
        assert!(serde_json::from_str::<GpuPower>(r#""integrated""#).is_err());
    }
}
