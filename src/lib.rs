//! # Ember Render
//!
//! Frame orchestration and GPU resource lifecycle core.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`DeletionQueue`] - Deferred, LIFO destruction of GPU objects
//! - [`DescriptorAllocator`] - Descriptor pools that grow instead of failing
//! - [`SwapChain`] - Presentable images with frame-in-flight synchronization
//! - [`RenderCommandQueue`] - Command pattern between scene code and the renderer
//! - [`Renderer`] - Draw/light registries and multi-pass frame recording
//! - [`RenderContext`] - Explicit owner of all of the above
//! - [`scene`] - ECS components and extraction into the renderer
//! - Two devices behind [`GpuDevice`]: Vulkan and Dummy (for testing)
//!
//! ## Example
//!
//! ```ignore
//! use ember_render::{DummyDevice, RenderContext, RendererConfig};
//!
//! let mut context = RenderContext::new(Arc::new(DummyDevice::new()), RendererConfig::default())?;
//! loop {
//!     context.render_frame()?;
//! }
//! ```

pub mod backend;
pub mod command_queue;
pub mod config;
pub mod context;
pub mod deletion_queue;
pub mod descriptor;
pub mod error;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod swapchain;
pub mod window;

// Re-export main types for convenience
pub use backend::{BackendError, DummyDevice, GpuDevice};
pub use command_queue::{FlushReport, RenderBackend, RenderCommand, RenderCommandQueue};
pub use config::{RendererConfig, ShaderSet};
pub use context::{FrameReport, RenderContext};
pub use deletion_queue::{DeletionKind, DeletionQueue, DeletionTask, Releasable};
pub use descriptor::{DescriptorAllocator, PoolSizeRatio, MAX_SETS_PER_POOL};
pub use error::{GraphicsError, GraphicsResult};
pub use renderer::{FrameBegin, ObjectData, RenderStats, Renderer, MAX_LIGHTS_PER_SCENE};
pub use swapchain::{
    AcquireOutcome, SwapChain, SwapchainConfig, SwapchainStatus, MAX_FRAMES_IN_FLIGHT,
};

#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::VulkanDevice;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the library version. Call once at startup, after installing a logger.
pub fn init() {
    log::info!("Ember Render v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_device() {
        let device = DummyDevice::new();
        assert_eq!(device.name(), "Dummy Device");
    }
}
