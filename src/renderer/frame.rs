//! Per-slot frame resources and the offscreen render targets.

use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, CommandBufferHandle, Extent2d, GpuDevice,
    ImageDescriptor, ImageHandle, ImageUsage, ImageViewHandle, TextureFormat,
};
use crate::config::RendererConfig;
use crate::deletion_queue::{DeletionQueue, DeletionTask};
use crate::descriptor::DescriptorAllocator;
use crate::error::{GraphicsError, GraphicsResult};
use crate::renderer::registry::FrameUniform;

pub const OFFSCREEN_COLOR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
pub const OFFSCREEN_DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Resources reused by every frame recorded in one frame-in-flight slot.
///
/// Nothing here may be touched before the slot's fence has signaled.
pub struct FrameData {
    pub command_buffer: CommandBufferHandle,
    pub uniform_buffer: BufferHandle,
    /// Transient sets, recycled each time the slot comes around
    pub descriptors: DescriptorAllocator,
    /// Objects retired while this slot was recording, destroyed on its next
    /// fence wait
    pub deletion_queue: DeletionQueue,
}

impl FrameData {
    pub fn new(device: &dyn GpuDevice, config: &RendererConfig) -> GraphicsResult<Self> {
        let uniform_buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some("frame uniforms".into()),
                size: std::mem::size_of::<FrameUniform>() as u64,
                usage: BufferUsage::UNIFORM,
                host_visible: true,
            })
            .map_err(GraphicsError::creation("frame uniform buffer"))?;

        let command_buffer = match device.allocate_command_buffer() {
            Ok(cmd) => cmd,
            Err(err) => {
                device.destroy_buffer(uniform_buffer);
                return Err(GraphicsError::creation("command buffer")(err));
            }
        };

        Ok(Self {
            command_buffer,
            uniform_buffer,
            descriptors: DescriptorAllocator::new(
                config.frame_descriptor_sets,
                &config.pool_ratios,
            ),
            deletion_queue: DeletionQueue::new(),
        })
    }

    /// Destroy what the slot retired, then hand its own objects to `queue`.
    pub fn release(mut self, device: &dyn GpuDevice, queue: &DeletionQueue) {
        self.deletion_queue.flush(device);
        queue.push(DeletionTask::Buffer(self.uniform_buffer));
        queue.push(DeletionTask::CommandBuffer(self.command_buffer));
        for pool in self.descriptors.drain_pools() {
            queue.push(DeletionTask::DescriptorPool(pool));
        }
    }
}

/// Color and depth attachments the scene is rendered into before being
/// blitted to the swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffscreenTargets {
    pub color_image: ImageHandle,
    pub color_view: ImageViewHandle,
    pub depth_image: ImageHandle,
    pub depth_view: ImageViewHandle,
    pub extent: Extent2d,
}

impl OffscreenTargets {
    pub fn create(device: &dyn GpuDevice, extent: Extent2d) -> GraphicsResult<Self> {
        let mut created = Vec::with_capacity(3);
        let result = Self::create_tracked(device, extent, &mut created);
        if result.is_err() {
            for task in created.into_iter().rev() {
                task.destroy(device);
            }
        }
        result
    }

    fn create_tracked(
        device: &dyn GpuDevice,
        extent: Extent2d,
        created: &mut Vec<DeletionTask>,
    ) -> GraphicsResult<Self> {
        let color_image = device
            .create_image(&ImageDescriptor {
                label: Some("offscreen color".into()),
                extent,
                format: OFFSCREEN_COLOR_FORMAT,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::STORAGE | ImageUsage::COPY_SRC,
            })
            .map_err(GraphicsError::creation("offscreen color image"))?;
        created.push(DeletionTask::Image(color_image));

        let color_view = device
            .create_image_view(color_image, OFFSCREEN_COLOR_FORMAT)
            .map_err(GraphicsError::creation("offscreen color view"))?;
        created.push(DeletionTask::ImageView(color_view));

        let depth_image = device
            .create_image(&ImageDescriptor {
                label: Some("offscreen depth".into()),
                extent,
                format: OFFSCREEN_DEPTH_FORMAT,
                usage: ImageUsage::DEPTH_ATTACHMENT | ImageUsage::SAMPLED,
            })
            .map_err(GraphicsError::creation("offscreen depth image"))?;
        created.push(DeletionTask::Image(depth_image));

        let depth_view = device
            .create_image_view(depth_image, OFFSCREEN_DEPTH_FORMAT)
            .map_err(GraphicsError::creation("offscreen depth view"))?;

        log::debug!(
            "OffscreenTargets: created {}x{} color/depth",
            extent.width,
            extent.height
        );
        Ok(Self {
            color_image,
            color_view,
            depth_image,
            depth_view,
            extent,
        })
    }

    /// Push the targets onto `queue`, views after their images.
    pub fn retire(&self, queue: &DeletionQueue) {
        queue.push(DeletionTask::Image(self.color_image));
        queue.push(DeletionTask::Image(self.depth_image));
        queue.push(DeletionTask::ImageView(self.color_view));
        queue.push(DeletionTask::ImageView(self.depth_view));
    }
}
