//! Presentable image chain with frame-in-flight synchronization.
//!
//! ```text
//! Uninitialized ─► Ready ─► Acquiring ─► Presenting ─► Ready ─► ...
//!                    │                                  ▲
//!                    └──────────► Recreating ───────────┘
//!                                                  ... ─► Released
//! ```
//!
//! The chain owns one [`FrameSyncSlot`] per frame in flight. Slots survive
//! recreation; only the images and views are rebuilt. Images returned by the
//! presentation engine belong to the platform swapchain object and are marked
//! external: the chain destroys their views, never the images themselves.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    BackendError, Extent2d, FenceHandle, GpuDevice, ImageHandle, ImageViewHandle, PresentMode,
    SemaphoreHandle, SurfaceCapabilities, SwapchainDescriptor, SwapchainHandle, TextureFormat,
};
use crate::deletion_queue::{DeletionQueue, DeletionTask};
use crate::error::{GraphicsError, GraphicsResult};

/// Maximum number of frames that can be in flight simultaneously.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    Acquiring,
    Presenting,
    Recreating,
    Released,
}

/// Result of requesting the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(u32),
    /// Usable but stale: schedule a recreation soon.
    Suboptimal(u32),
    /// Must recreate before presenting.
    OutOfDate,
}

impl AcquireOutcome {
    pub fn image_index(&self) -> Option<u32> {
        match self {
            AcquireOutcome::Ready(index) | AcquireOutcome::Suboptimal(index) => Some(*index),
            AcquireOutcome::OutOfDate => None,
        }
    }
}

/// Result of a present request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Success,
    Suboptimal,
    OutOfDate,
}

impl SwapchainStatus {
    pub fn needs_recreation(&self) -> bool {
        !matches!(self, SwapchainStatus::Success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub extent: Extent2d,
    pub vsync: bool,
    pub preferred_format: TextureFormat,
}

impl Default for SwapchainConfig {
    fn default() -> Self {
        Self {
            extent: Extent2d::new(1280, 720),
            vsync: true,
            preferred_format: TextureFormat::Bgra8UnormSrgb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainImage {
    pub image: ImageHandle,
    pub view: ImageViewHandle,
    pub index: u32,
    /// Owned elsewhere; the chain never destroys the image itself.
    pub is_external: bool,
}

/// Synchronization primitives of one frame in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSyncSlot {
    pub image_available: SemaphoreHandle,
    pub render_finished: SemaphoreHandle,
    pub in_flight: FenceHandle,
}

pub struct SwapChain {
    device: Arc<dyn GpuDevice>,
    config: SwapchainConfig,
    handle: Option<SwapchainHandle>,
    images: Vec<SwapchainImage>,
    sync: Vec<FrameSyncSlot>,
    extent: Extent2d,
    format: TextureFormat,
    present_mode: PresentMode,
    state: SwapchainState,
}

impl SwapChain {
    /// Create the sync slots and the first image chain.
    pub fn new(device: Arc<dyn GpuDevice>, config: SwapchainConfig) -> GraphicsResult<Self> {
        let mut chain = Self {
            device,
            config,
            handle: None,
            images: Vec::new(),
            sync: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            extent: config.extent,
            format: config.preferred_format,
            present_mode: PresentMode::Fifo,
            state: SwapchainState::Uninitialized,
        };

        let result = chain.create_sync_slots().and_then(|()| chain.init(None));
        if let Err(err) = result {
            // Nothing has been submitted yet, so destroying directly is safe.
            for slot in chain.sync.drain(..) {
                chain.device.destroy_semaphore(slot.image_available);
                chain.device.destroy_semaphore(slot.render_finished);
                chain.device.destroy_fence(slot.in_flight);
            }
            chain.state = SwapchainState::Released;
            return Err(err);
        }
        Ok(chain)
    }

    fn create_sync_slots(&mut self) -> GraphicsResult<()> {
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let image_available = self
                .device
                .create_semaphore()
                .map_err(GraphicsError::creation("semaphore"))?;
            let render_finished = self
                .device
                .create_semaphore()
                .map_err(GraphicsError::creation("semaphore"))?;
            // Signaled so the first wait on each slot returns immediately.
            let in_flight = self
                .device
                .create_fence(true)
                .map_err(GraphicsError::creation("fence"))?;
            self.sync.push(FrameSyncSlot {
                image_available,
                render_finished,
                in_flight,
            });
        }
        Ok(())
    }

    /// Query the surface and build the image chain, chaining `old` if given.
    fn init(&mut self, old: Option<SwapchainHandle>) -> GraphicsResult<()> {
        let caps = self.device.surface_capabilities()?;
        let present_mode = choose_present_mode(&caps.present_modes, self.config.vsync);
        let format = choose_format(&caps.formats, self.config.preferred_format)?;
        let extent = choose_extent(&caps, self.config.extent);
        let image_count = choose_image_count(&caps);

        let handle = self
            .device
            .create_swapchain(&SwapchainDescriptor {
                format,
                extent,
                present_mode,
                image_count,
                old_swapchain: old,
            })
            .map_err(GraphicsError::creation("swapchain"))?;

        let raw_images = match self.device.swapchain_images(handle) {
            Ok(images) => images,
            Err(err) => {
                self.device.destroy_swapchain(handle);
                return Err(err.into());
            }
        };

        let mut images = Vec::with_capacity(raw_images.len());
        for (index, image) in raw_images.into_iter().enumerate() {
            match self.device.create_image_view(image, format) {
                Ok(view) => images.push(SwapchainImage {
                    image,
                    view,
                    index: index as u32,
                    is_external: true,
                }),
                Err(err) => {
                    for created in &images {
                        self.device.destroy_image_view(created.view);
                    }
                    self.device.destroy_swapchain(handle);
                    return Err(GraphicsError::creation("swapchain image view")(err));
                }
            }
        }

        log::info!(
            "SwapChain: {}x{} {:?} {:?}, {} images",
            extent.width,
            extent.height,
            format,
            present_mode,
            images.len()
        );

        self.handle = Some(handle);
        self.images = images;
        self.extent = extent;
        self.format = format;
        self.present_mode = present_mode;
        self.state = SwapchainState::Ready;
        Ok(())
    }

    /// Request the next presentable image.
    ///
    /// `semaphore` is signaled once the image may be written, `fence` (if any)
    /// when the presentation engine has released it.
    pub fn get_next_renderable_image(
        &mut self,
        semaphore: SemaphoreHandle,
        fence: Option<FenceHandle>,
    ) -> GraphicsResult<AcquireOutcome> {
        let handle = self.ready_handle()?;
        match self.device.acquire_next_image(handle, semaphore, fence) {
            Ok((index, suboptimal)) => {
                self.state = SwapchainState::Acquiring;
                if suboptimal {
                    Ok(AcquireOutcome::Suboptimal(index))
                } else {
                    Ok(AcquireOutcome::Ready(index))
                }
            }
            Err(BackendError::OutOfDate) => Ok(AcquireOutcome::OutOfDate),
            Err(err) => Err(err.into()),
        }
    }

    /// Queue `image_index` for presentation once `render_finished` signals.
    pub fn present(
        &mut self,
        image_index: u32,
        render_finished: SemaphoreHandle,
    ) -> GraphicsResult<SwapchainStatus> {
        if self.state != SwapchainState::Acquiring {
            return Err(GraphicsError::InvalidState(format!(
                "present without an acquired image ({:?})",
                self.state
            )));
        }
        let handle = self
            .handle
            .ok_or_else(|| GraphicsError::InvalidState("no swapchain".into()))?;

        self.state = SwapchainState::Presenting;
        let result = self
            .device
            .queue_present(handle, image_index, render_finished);
        self.state = SwapchainState::Ready;
        match result {
            Ok(false) => Ok(SwapchainStatus::Success),
            Ok(true) => Ok(SwapchainStatus::Suboptimal),
            Err(BackendError::OutOfDate) => Ok(SwapchainStatus::OutOfDate),
            Err(err) => Err(err.into()),
        }
    }

    /// Block until the work last submitted with `slot`'s fence completes.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_for_slot(&self, slot: usize, timeout: Duration) -> GraphicsResult<bool> {
        let fence = self.slot(slot)?.in_flight;
        Ok(self.device.wait_for_fence(fence, timeout)?)
    }

    pub fn reset_slot_fence(&self, slot: usize) -> GraphicsResult<()> {
        let fence = self.slot(slot)?.in_flight;
        Ok(self.device.reset_fence(fence)?)
    }

    /// Rebuild the chain at `extent`.
    ///
    /// Waits for the device to go idle, creates the new chain from the old
    /// one and pushes the old views and swapchain object onto `queue`.
    pub fn recreate(&mut self, extent: Extent2d, queue: &DeletionQueue) -> GraphicsResult<()> {
        if extent.is_zero_area() {
            return Err(GraphicsError::InvalidState(format!(
                "cannot recreate swapchain at {}x{}",
                extent.width, extent.height
            )));
        }
        if self.state == SwapchainState::Released {
            return Err(GraphicsError::InvalidState(
                "swapchain already released".into(),
            ));
        }

        self.state = SwapchainState::Recreating;
        self.device.wait_idle()?;

        self.config.extent = extent;
        let old_handle = self.handle.take();
        let old_images = std::mem::take(&mut self.images);
        let result = self.init(old_handle);

        if let Some(old) = old_handle {
            queue.push(DeletionTask::Swapchain(old));
        }
        retire_images(&old_images, queue);

        if result.is_err() {
            self.state = SwapchainState::Uninitialized;
        }
        result
    }

    /// Push every image view, owned image, the swapchain object and the sync
    /// primitives onto `queue`.
    pub fn release(&mut self, queue: &DeletionQueue) {
        if self.state == SwapchainState::Released {
            return;
        }
        for slot in self.sync.drain(..) {
            queue.push(DeletionTask::Fence(slot.in_flight));
            queue.push(DeletionTask::Semaphore(slot.render_finished));
            queue.push(DeletionTask::Semaphore(slot.image_available));
        }
        if let Some(handle) = self.handle.take() {
            queue.push(DeletionTask::Swapchain(handle));
        }
        retire_images(&std::mem::take(&mut self.images), queue);
        self.state = SwapchainState::Released;
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn handle(&self) -> Option<SwapchainHandle> {
        self.handle
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[SwapchainImage] {
        &self.images
    }

    pub fn image(&self, index: u32) -> Option<&SwapchainImage> {
        self.images.get(index as usize)
    }

    pub fn sync_slot(&self, slot: usize) -> Option<&FrameSyncSlot> {
        self.sync.get(slot)
    }

    fn slot(&self, slot: usize) -> GraphicsResult<&FrameSyncSlot> {
        self.sync
            .get(slot)
            .ok_or_else(|| GraphicsError::InvalidState(format!("no frame slot {slot}")))
    }

    fn ready_handle(&self) -> GraphicsResult<SwapchainHandle> {
        match (self.state, self.handle) {
            (SwapchainState::Ready, Some(handle)) => Ok(handle),
            (state, _) => Err(GraphicsError::InvalidState(format!(
                "cannot acquire in state {state:?}"
            ))),
        }
    }
}

impl Drop for SwapChain {
    fn drop(&mut self) {
        if self.state != SwapchainState::Released {
            log::error!("SwapChain dropped without release, GPU objects leaked");
        }
    }
}

/// Views are pushed last so they are destroyed before their images.
fn retire_images(images: &[SwapchainImage], queue: &DeletionQueue) {
    for image in images.iter().filter(|image| !image.is_external) {
        queue.push(DeletionTask::Image(image.image));
    }
    for image in images {
        queue.push(DeletionTask::ImageView(image.view));
    }
}

/// FIFO with vsync. Without it prefer mailbox, then immediate, falling back to
/// FIFO which every surface supports.
pub fn choose_present_mode(supported: &[PresentMode], vsync: bool) -> PresentMode {
    if vsync {
        return PresentMode::Fifo;
    }
    [PresentMode::Mailbox, PresentMode::Immediate]
        .into_iter()
        .find(|mode| supported.contains(mode))
        .unwrap_or(PresentMode::Fifo)
}

pub fn choose_format(
    supported: &[TextureFormat],
    preferred: TextureFormat,
) -> GraphicsResult<TextureFormat> {
    if supported.contains(&preferred) {
        return Ok(preferred);
    }
    supported.first().copied().ok_or_else(|| {
        GraphicsError::Device(BackendError::Unsupported(
            "surface reports no formats".into(),
        ))
    })
}

/// The platform's current extent wins when it reports one.
pub fn choose_extent(caps: &SurfaceCapabilities, requested: Extent2d) -> Extent2d {
    caps.current_extent
        .unwrap_or_else(|| requested.clamp(caps.min_extent, caps.max_extent))
}

pub fn choose_image_count(caps: &SurfaceCapabilities) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}
