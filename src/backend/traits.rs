//! Core backend abstraction traits
//!
//! [`GpuDevice`] is the device/context provider every component in this crate
//! talks to. It is object safe so the renderer can hold an `Arc<dyn GpuDevice>`
//! and swap between the Vulkan device and the in-memory dummy device.

use std::time::Duration;

use thiserror::Error;

use crate::backend::types::*;

/// Raw device-level error
///
/// Components translate these into [`crate::GraphicsError`] or into a
/// recoverable status value before handing anything to their callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    Initialization(String),
    #[error("Descriptor pool out of memory")]
    OutOfPoolMemory,
    #[error("Descriptor pool fragmented")]
    FragmentedPool,
    #[error("Swapchain out of date")]
    OutOfDate,
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Device lost")]
    DeviceLost,
    #[error("Out of host memory")]
    OutOfHostMemory,
    #[error("Out of device memory")]
    OutOfDeviceMemory,
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("API call failed: {0}")]
    Api(String),
}

impl BackendError {
    /// Capacity errors a descriptor allocator recovers from by growing.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, BackendError::OutOfPoolMemory | BackendError::FragmentedPool)
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

macro_rules! define_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub(crate) u64);

            impl $name {
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                pub const fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

define_handle!(
    /// Handle to a GPU buffer
    BufferHandle,
    /// Handle to a GPU image
    ImageHandle,
    /// Handle to an image view
    ImageViewHandle,
    /// Handle to a sampler
    SamplerHandle,
    /// Handle to a graphics or compute pipeline
    PipelineHandle,
    /// Handle to a descriptor pool
    DescriptorPoolHandle,
    /// Handle to a descriptor set allocated from a pool
    DescriptorSetHandle,
    /// Handle to a descriptor set layout
    DescriptorSetLayoutHandle,
    /// Handle to a platform swapchain object
    SwapchainHandle,
    /// Handle to a GPU-GPU signal
    SemaphoreHandle,
    /// Handle to a GPU-CPU signal
    FenceHandle,
    /// Handle to a primary command buffer
    CommandBufferHandle,
);

/// Device/context provider
///
/// All methods take `&self`: implementations guard their own mutable state so
/// the device can be shared between the renderer and worker threads that
/// create resources.
pub trait GpuDevice: Send + Sync + 'static {
    /// Human readable adapter name
    fn name(&self) -> &str;

    // Synchronization

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle>;

    /// Blocks until the fence signals or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. `Duration::MAX` waits forever and a
    /// zero duration only polls.
    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> BackendResult<bool>;

    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()>;

    fn create_semaphore(&self) -> BackendResult<SemaphoreHandle>;

    /// Full device barrier
    fn wait_idle(&self) -> BackendResult<()>;

    // Descriptors

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle>;

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[PoolSize],
    ) -> BackendResult<DescriptorPoolHandle>;

    /// Fails with [`BackendError::OutOfPoolMemory`] or
    /// [`BackendError::FragmentedPool`] when the pool is exhausted.
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle>;

    /// Returns every set allocated from the pool back to it.
    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> BackendResult<()>;

    fn write_uniform_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        buffer: BufferHandle,
        range: u64,
    ) -> BackendResult<()>;

    /// Point `binding` at an image view. `sampler` is required for
    /// [`DescriptorType::CombinedImageSampler`].
    fn write_image_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        ty: DescriptorType,
        view: ImageViewHandle,
        sampler: Option<SamplerHandle>,
    ) -> BackendResult<()>;

    // Resources

    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    fn create_image(&self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;

    fn create_image_view(
        &self,
        image: ImageHandle,
        format: TextureFormat,
    ) -> BackendResult<ImageViewHandle>;

    fn create_sampler(&self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    fn create_pipeline(&self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle>;

    // Destruction

    fn destroy_buffer(&self, buffer: BufferHandle);
    fn destroy_image(&self, image: ImageHandle);
    fn destroy_image_view(&self, view: ImageViewHandle);
    fn destroy_sampler(&self, sampler: SamplerHandle);
    fn destroy_pipeline(&self, pipeline: PipelineHandle);
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);
    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle);
    fn destroy_fence(&self, fence: FenceHandle);
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);
    fn destroy_swapchain(&self, swapchain: SwapchainHandle);
    fn free_command_buffer(&self, command_buffer: CommandBufferHandle);

    // Presentation

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities>;

    fn create_swapchain(&self, desc: &SwapchainDescriptor) -> BackendResult<SwapchainHandle>;

    /// Images owned by the platform swapchain object, in presentation order.
    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>>;

    /// Returns the image index and whether the swapchain is suboptimal.
    ///
    /// Fails with [`BackendError::OutOfDate`] when it must be recreated.
    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        fence: Option<FenceHandle>,
    ) -> BackendResult<(u32, bool)>;

    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<bool>;

    // Command recording

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle>;
    fn begin_commands(&self, cmd: CommandBufferHandle) -> BackendResult<()>;
    fn end_commands(&self, cmd: CommandBufferHandle) -> BackendResult<()>;
    fn cmd_begin_pass(&self, cmd: CommandBufferHandle, pass: &PassDescriptor);
    fn cmd_end_pass(&self, cmd: CommandBufferHandle);
    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    );
    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
        index: u32,
        set: DescriptorSetHandle,
    );
    fn cmd_push_constants(
        &self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        stages: ShaderStages,
        data: &[u8],
    );
    fn cmd_draw_indexed(&self, cmd: CommandBufferHandle, draw: &IndexedDraw);
    fn cmd_dispatch(&self, cmd: CommandBufferHandle, x: u32, y: u32, z: u32);
    fn cmd_image_barrier(&self, cmd: CommandBufferHandle, barrier: &ImageBarrier);
    /// Scaled, format-converting copy. `src` must be in
    /// [`ImageLayout::TransferSrc`] and `dst` in [`ImageLayout::TransferDst`].
    fn cmd_blit_image(
        &self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        src_extent: Extent2d,
        dst: ImageHandle,
        dst_extent: Extent2d,
    );

    fn submit(&self, info: &SubmitInfo) -> BackendResult<()>;

    // Telemetry

    /// Bytes of device memory currently held by live allocations
    fn memory_usage(&self) -> u64;
}
