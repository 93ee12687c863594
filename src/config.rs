//! Renderer configuration
//!
//! Plain values with defaults and builder methods. Loading them from a file
//! is up to the application.

use std::time::Duration;

use glam::Vec4;

use crate::backend::{DescriptorType, Extent2d, TextureFormat};
use crate::descriptor::PoolSizeRatio;
use crate::swapchain::SwapchainConfig;

/// Pre-compiled SPIR-V for every pipeline the renderer builds
#[derive(Debug, Clone, Default)]
pub struct ShaderSet {
    /// Shared by the default, PBR and wireframe pipelines
    pub mesh_vertex: Vec<u32>,
    pub default_fragment: Vec<u32>,
    pub pbr_fragment: Vec<u32>,
    pub wireframe_fragment: Vec<u32>,
    /// Extrudes along normals for the selection outline
    pub outline_vertex: Vec<u32>,
    pub outline_fragment: Vec<u32>,
    pub compute_debug: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub extent: Extent2d,
    pub vsync: bool,
    pub preferred_format: TextureFormat,
    /// Capacity of the first pool of the global descriptor allocator
    pub initial_descriptor_sets: u32,
    /// Capacity of the first pool of each per-frame descriptor allocator
    pub frame_descriptor_sets: u32,
    pub pool_ratios: Vec<PoolSizeRatio>,
    pub clear_color: Vec4,
    /// Run the compute debug pass after the offscreen pass
    pub compute_debug: bool,
    /// Upper bound on a blocking frame fence wait; `Duration::MAX` waits forever
    pub frame_timeout: Duration,
    pub shaders: ShaderSet,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            extent: Extent2d::new(1280, 720),
            vsync: true,
            preferred_format: TextureFormat::Bgra8UnormSrgb,
            initial_descriptor_sets: 64,
            frame_descriptor_sets: 16,
            pool_ratios: vec![
                PoolSizeRatio::new(DescriptorType::UniformBuffer, 2.0),
                PoolSizeRatio::new(DescriptorType::CombinedImageSampler, 2.0),
                PoolSizeRatio::new(DescriptorType::StorageBuffer, 1.0),
                PoolSizeRatio::new(DescriptorType::StorageImage, 1.0),
            ],
            clear_color: Vec4::new(0.1, 0.1, 0.12, 1.0),
            compute_debug: false,
            frame_timeout: Duration::MAX,
            shaders: ShaderSet::default(),
        }
    }
}

impl RendererConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = Extent2d::new(width, height);
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_preferred_format(mut self, format: TextureFormat) -> Self {
        self.preferred_format = format;
        self
    }

    pub fn with_initial_descriptor_sets(mut self, sets: u32) -> Self {
        self.initial_descriptor_sets = sets;
        self
    }

    pub fn with_pool_ratios(mut self, ratios: Vec<PoolSizeRatio>) -> Self {
        self.pool_ratios = ratios;
        self
    }

    pub fn with_clear_color(mut self, color: Vec4) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_compute_debug(mut self, enabled: bool) -> Self {
        self.compute_debug = enabled;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn with_shaders(mut self, shaders: ShaderSet) -> Self {
        self.shaders = shaders;
        self
    }

    pub fn swapchain_config(&self) -> SwapchainConfig {
        SwapchainConfig {
            extent: self.extent,
            vsync: self.vsync,
            preferred_format: self.preferred_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PresentMode;
    use crate::swapchain::choose_present_mode;

    #[test]
    fn test_builders_feed_swapchain_config() {
        let config = RendererConfig::new()
            .with_extent(1920, 1080)
            .with_vsync(false)
            .with_preferred_format(TextureFormat::Rgba8Unorm);
        let swapchain = config.swapchain_config();
        assert_eq!(swapchain.extent, Extent2d::new(1920, 1080));
        assert!(!swapchain.vsync);
        assert_eq!(swapchain.preferred_format, TextureFormat::Rgba8Unorm);
        assert_eq!(
            choose_present_mode(&[PresentMode::Fifo, PresentMode::Mailbox], swapchain.vsync),
            PresentMode::Mailbox
        );
    }

    #[test]
    fn test_default_blocks_until_fence() {
        let config = RendererConfig::default();
        assert_eq!(config.frame_timeout, Duration::MAX);
        assert!(config.vsync);
        assert!(!config.pool_ratios.is_empty());
    }
}
