//! Frame orchestrator
//!
//! The [`Renderer`] owns every long-lived GPU object, the draw and light
//! registries, and drives one frame at a time through
//! `begin_frame` → `draw_scene` → `end_frame` → `present`.

mod frame;
mod passes;
mod registry;
mod stats;

use std::sync::Arc;
use std::time::Duration;

use glam::{Mat4, Vec3, Vec4};

use crate::backend::{
    BufferDescriptor, BufferUsage, DescriptorType, Extent2d, GpuDevice, ImageBarrier,
    ImageLayout, PassDescriptor, PipelineBindPoint, SamplerDescriptor, SamplerHandle,
    SubmitInfo, Vertex,
};
use crate::command_queue::RenderBackend;
use crate::config::RendererConfig;
use crate::deletion_queue::{DeletionQueue, DeletionTask, Releasable, RetireHook};
use crate::descriptor::DescriptorAllocator;
use crate::error::{GraphicsError, GraphicsResult};
use crate::resources::{
    Material, MaterialDescriptor, MaterialRef, MaterialUniformData, Mesh, MeshData, MeshRef,
};
use crate::scene::LightData;
use crate::swapchain::{
    AcquireOutcome, SwapChain, SwapchainStatus, MAX_FRAMES_IN_FLIGHT,
};

pub use frame::{FrameData, OffscreenTargets, OFFSCREEN_COLOR_FORMAT, OFFSCREEN_DEPTH_FORMAT};
pub use passes::{
    dispatch_size, DrawBuckets, DrawPushConstants, PipelineKind, Pipelines, SetLayouts,
    COMPUTE_TILE_SIZE, OUTLINE_COLOR,
};
pub use registry::{
    DrawQueue, DrawQueueEntry, FrameUniform, LightRegistry, LightRenderInfo, ObjectData,
    MAX_LIGHTS_PER_SCENE,
};
pub use stats::RenderStats;

/// Outcome of starting a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBegin {
    /// Recording has begun into `slot` for swapchain image `image_index`.
    Started { slot: usize, image_index: u32 },
    /// Nothing to render this time: minimized window or a swapchain that had
    /// to be rebuilt first.
    Skipped,
    /// The slot's previous frame is still on the GPU.
    SlotBusy,
}

impl FrameBegin {
    pub fn is_started(&self) -> bool {
        matches!(self, FrameBegin::Started { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePhase {
    Idle,
    Recording,
    Submitted,
}

#[derive(Debug, Clone, Copy)]
struct CameraState {
    view_proj: Mat4,
    position: Vec3,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            view_proj: Mat4::IDENTITY,
            position: Vec3::ZERO,
        }
    }
}

pub struct Renderer {
    device: Arc<dyn GpuDevice>,
    deletion_queue: Arc<DeletionQueue>,
    /// Objects of meshes and materials whose last owner dropped them,
    /// moved into the next started frame's queue
    retired: Arc<DeletionQueue>,
    config: RendererConfig,
    swapchain: SwapChain,
    frames: Vec<FrameData>,
    /// Long-lived sets (materials)
    descriptors: DescriptorAllocator,
    layouts: SetLayouts,
    pipelines: Pipelines,
    sampler: SamplerHandle,
    targets: Option<OffscreenTargets>,
    draws: DrawQueue,
    lights: LightRegistry,
    clear_color: Vec4,
    selected: Option<u64>,
    camera: CameraState,
    frame_slot: usize,
    frame_number: u64,
    current_image: Option<u32>,
    phase: FramePhase,
    pending_extent: Option<Extent2d>,
    needs_recreate: bool,
    stats: RenderStats,
    shut_down: bool,
}

impl Renderer {
    /// Build every GPU object the renderer needs.
    ///
    /// Objects are pushed onto `deletion_queue` as they are created. If any
    /// step fails the queue is flushed and the error is returned as
    /// [`GraphicsError::InitializationFailed`].
    pub fn new(
        device: Arc<dyn GpuDevice>,
        deletion_queue: Arc<DeletionQueue>,
        config: RendererConfig,
    ) -> GraphicsResult<Self> {
        log::info!("Renderer: initializing on {}", device.name());
        let queue = &*deletion_queue;
        let dev = &*device;

        let mut descriptors =
            DescriptorAllocator::new(config.initial_descriptor_sets, &config.pool_ratios);
        let mut swapchain: Option<SwapChain> = None;
        let mut targets: Option<OffscreenTargets> = None;
        let mut frames: Vec<FrameData> = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);

        let built = (|| -> GraphicsResult<(SamplerHandle, SetLayouts, Pipelines)> {
            let sampler = dev
                .create_sampler(&SamplerDescriptor {
                    label: Some("depth sampler".into()),
                    ..Default::default()
                })
                .map_err(GraphicsError::creation("sampler"))
                .map_err(GraphicsError::init("sampler"))?;
            queue.push(DeletionTask::Sampler(sampler));

            let layouts =
                SetLayouts::create(dev, queue).map_err(GraphicsError::init("set layouts"))?;
            let pipelines = Pipelines::create(dev, &layouts, &config.shaders, queue)
                .map_err(GraphicsError::init("pipelines"))?;

            descriptors
                .preallocate(dev)
                .map_err(GraphicsError::init("descriptor allocator"))?;

            let chain = swapchain.insert(
                SwapChain::new(Arc::clone(&device), config.swapchain_config())
                    .map_err(GraphicsError::init("swapchain"))?,
            );
            targets = Some(
                OffscreenTargets::create(dev, chain.extent())
                    .map_err(GraphicsError::init("offscreen targets"))?,
            );

            for _ in 0..MAX_FRAMES_IN_FLIGHT {
                let mut frame =
                    FrameData::new(dev, &config).map_err(GraphicsError::init("frame data"))?;
                let primed = frame.descriptors.preallocate(dev);
                frames.push(frame);
                primed.map_err(GraphicsError::init("frame descriptors"))?;
            }
            Ok((sampler, layouts, pipelines))
        })();

        let (sampler, layouts, pipelines) = match built {
            Ok(parts) => parts,
            Err(err) => {
                log::error!("Renderer: {err}");
                for frame in frames.drain(..) {
                    frame.release(dev, queue);
                }
                if let Some(targets) = targets {
                    targets.retire(queue);
                }
                if let Some(mut chain) = swapchain {
                    chain.release(queue);
                }
                for pool in descriptors.drain_pools() {
                    queue.push(DeletionTask::DescriptorPool(pool));
                }
                queue.flush(dev);
                return Err(err);
            }
        };

        let (Some(swapchain), Some(targets)) = (swapchain, targets) else {
            return Err(GraphicsError::InvalidState(
                "renderer initialization incomplete".into(),
            ));
        };

        log::info!(
            "Renderer: ready, {}x{} {:?}, {} swapchain images",
            swapchain.extent().width,
            swapchain.extent().height,
            swapchain.present_mode(),
            swapchain.image_count()
        );

        Ok(Self {
            clear_color: config.clear_color,
            device,
            deletion_queue,
            retired: Arc::new(DeletionQueue::new()),
            config,
            swapchain,
            frames,
            descriptors,
            layouts,
            pipelines,
            sampler,
            targets: Some(targets),
            draws: DrawQueue::new(),
            lights: LightRegistry::new(),
            selected: None,
            camera: CameraState::default(),
            frame_slot: 0,
            frame_number: 0,
            current_image: None,
            phase: FramePhase::Idle,
            pending_extent: None,
            needs_recreate: false,
            stats: RenderStats::default(),
            shut_down: false,
        })
    }

    /// Start a frame, blocking until the slot's previous frame retires.
    pub fn begin_frame(&mut self) -> GraphicsResult<FrameBegin> {
        self.begin_frame_with_timeout(self.config.frame_timeout)
    }

    /// Start a frame only if the slot is already free.
    pub fn try_begin_frame(&mut self) -> GraphicsResult<FrameBegin> {
        self.begin_frame_with_timeout(Duration::ZERO)
    }

    fn begin_frame_with_timeout(&mut self, timeout: Duration) -> GraphicsResult<FrameBegin> {
        self.ensure_running()?;
        if self.phase != FramePhase::Idle {
            return Err(GraphicsError::InvalidState(format!(
                "begin_frame while {:?}",
                self.phase
            )));
        }

        if self.pending_extent.is_some() || self.needs_recreate {
            let extent = self.pending_extent.unwrap_or(self.config.extent);
            if extent.is_zero_area() {
                log::trace!("Renderer: zero-area framebuffer, skipping frame");
                return Ok(FrameBegin::Skipped);
            }
            self.recreate_swapchain(extent)?;
        }

        let slot = self.frame_slot;
        if !self.swapchain.wait_for_slot(slot, timeout)? {
            log::trace!("Renderer: frame slot {} still in flight", slot);
            return Ok(FrameBegin::SlotBusy);
        }

        let device = &*self.device;
        let frame = &mut self.frames[slot];
        frame.deletion_queue.flush(device);
        // Frames already in flight may still draw with dropped resources.
        self.retired.transfer_to(&frame.deletion_queue);
        frame.descriptors.clear_pools(device)?;

        let sync = *self
            .swapchain
            .sync_slot(slot)
            .ok_or_else(|| GraphicsError::InvalidState(format!("no frame slot {slot}")))?;
        let image_index = match self
            .swapchain
            .get_next_renderable_image(sync.image_available, None)?
        {
            AcquireOutcome::Ready(index) => index,
            AcquireOutcome::Suboptimal(index) => {
                log::debug!("Renderer: swapchain suboptimal, recreating next frame");
                self.needs_recreate = true;
                index
            }
            AcquireOutcome::OutOfDate => {
                log::debug!("Renderer: swapchain out of date, skipping frame");
                let extent = self.pending_extent.unwrap_or(self.config.extent);
                if extent.is_zero_area() {
                    self.needs_recreate = true;
                } else {
                    self.recreate_swapchain(extent)?;
                }
                return Ok(FrameBegin::Skipped);
            }
        };

        // From here on a failure leaves an acquired image behind, which
        // `abort_frame` hands back.
        self.frame_number += 1;
        self.stats.begin_frame(self.frame_number);
        self.current_image = Some(image_index);
        self.phase = FramePhase::Recording;
        self.device.begin_commands(self.frames[slot].command_buffer)?;
        log::trace!(
            "Renderer: frame {} started in slot {} on image {}",
            self.frame_number,
            slot,
            image_index
        );
        Ok(FrameBegin::Started { slot, image_index })
    }

    /// Record the offscreen scene pass, the optional compute pass and the
    /// copy into the acquired swapchain image.
    pub fn draw_scene(&mut self) -> GraphicsResult<()> {
        let image_index = self.recording_image()?;
        let targets = self
            .targets
            .ok_or_else(|| GraphicsError::InvalidState("no offscreen targets".into()))?;
        let swapchain_image = *self.swapchain.image(image_index).ok_or_else(|| {
            GraphicsError::InvalidState(format!("no swapchain image {image_index}"))
        })?;

        let device = &*self.device;
        let frame = &mut self.frames[self.frame_slot];
        let cmd = frame.command_buffer;

        let uniform = self
            .lights
            .pack(self.camera.view_proj, self.camera.position);
        device.write_buffer(frame.uniform_buffer, 0, bytemuck::bytes_of(&uniform))?;
        self.stats.lights_uploaded = uniform.total_lights();

        let frame_set = frame.descriptors.allocate(device, self.layouts.frame)?;
        device.write_uniform_descriptor(
            frame_set,
            0,
            frame.uniform_buffer,
            std::mem::size_of::<FrameUniform>() as u64,
        )?;

        for (_, entry) in self.draws.iter_mut() {
            entry.rendered = false;
        }
        let buckets = DrawBuckets::build(&self.draws, self.selected);

        device.cmd_image_barrier(
            cmd,
            &ImageBarrier::color(
                targets.color_image,
                ImageLayout::Undefined,
                ImageLayout::ColorAttachment,
            ),
        );
        device.cmd_image_barrier(
            cmd,
            &ImageBarrier::depth(
                targets.depth_image,
                ImageLayout::Undefined,
                ImageLayout::DepthAttachment,
            ),
        );

        device.cmd_begin_pass(
            cmd,
            &PassDescriptor {
                label: "offscreen",
                color: targets.color_view,
                depth: Some(targets.depth_view),
                clear_color: Some(self.clear_color.to_array()),
                clear_depth: Some(1.0),
                extent: targets.extent,
            },
        );
        passes::record_draws(
            device,
            cmd,
            &self.pipelines,
            frame_set,
            &mut self.draws,
            &buckets,
            &mut self.stats,
        );
        device.cmd_end_pass(cmd);

        if self.config.compute_debug {
            device.cmd_image_barrier(
                cmd,
                &ImageBarrier::color(
                    targets.color_image,
                    ImageLayout::ColorAttachment,
                    ImageLayout::General,
                ),
            );
            device.cmd_image_barrier(
                cmd,
                &ImageBarrier::depth(
                    targets.depth_image,
                    ImageLayout::DepthAttachment,
                    ImageLayout::DepthReadOnly,
                ),
            );

            let compute_set = frame.descriptors.allocate(device, self.layouts.compute)?;
            device.write_image_descriptor(
                compute_set,
                0,
                DescriptorType::StorageImage,
                targets.color_view,
                None,
            )?;
            device.write_image_descriptor(
                compute_set,
                1,
                DescriptorType::CombinedImageSampler,
                targets.depth_view,
                Some(self.sampler),
            )?;

            let pipeline = self.pipelines.compute_debug;
            device.cmd_bind_pipeline(cmd, PipelineBindPoint::Compute, pipeline);
            device.cmd_bind_descriptor_set(cmd, PipelineBindPoint::Compute, pipeline, 0, frame_set);
            device.cmd_bind_descriptor_set(
                cmd,
                PipelineBindPoint::Compute,
                pipeline,
                1,
                compute_set,
            );
            let (x, y, z) = dispatch_size(targets.extent.width, targets.extent.height);
            device.cmd_dispatch(cmd, x, y, z);

            device.cmd_image_barrier(
                cmd,
                &ImageBarrier::color(
                    targets.color_image,
                    ImageLayout::General,
                    ImageLayout::TransferSrc,
                ),
            );
        } else {
            device.cmd_image_barrier(
                cmd,
                &ImageBarrier::color(
                    targets.color_image,
                    ImageLayout::ColorAttachment,
                    ImageLayout::TransferSrc,
                ),
            );
        }

        device.cmd_image_barrier(
            cmd,
            &ImageBarrier::color(
                swapchain_image.image,
                ImageLayout::Undefined,
                ImageLayout::TransferDst,
            ),
        );
        device.cmd_blit_image(
            cmd,
            targets.color_image,
            targets.extent,
            swapchain_image.image,
            self.swapchain.extent(),
        );
        device.cmd_image_barrier(
            cmd,
            &ImageBarrier::color(
                swapchain_image.image,
                ImageLayout::TransferDst,
                ImageLayout::Present,
            ),
        );

        log::trace!(
            "Renderer: recorded {} draws, {} lights",
            self.stats.draw_calls,
            self.stats.lights_uploaded
        );
        Ok(())
    }

    /// Close the command buffer and submit it.
    ///
    /// The slot fence is reset only here, right before the submission that
    /// signals it again.
    pub fn end_frame(&mut self) -> GraphicsResult<()> {
        self.recording_image()?;
        let slot = self.frame_slot;
        let sync = *self
            .swapchain
            .sync_slot(slot)
            .ok_or_else(|| GraphicsError::InvalidState(format!("no frame slot {slot}")))?;
        let cmd = self.frames[slot].command_buffer;

        self.device.end_commands(cmd)?;
        self.swapchain.reset_slot_fence(slot)?;
        self.device.submit(&SubmitInfo {
            command_buffer: cmd,
            wait_semaphore: Some(sync.image_available),
            signal_semaphore: Some(sync.render_finished),
            fence: Some(sync.in_flight),
        })?;
        self.phase = FramePhase::Submitted;
        Ok(())
    }

    /// Present the submitted frame and advance to the next slot.
    ///
    /// An out-of-date or suboptimal chain is rebuilt at the next frame start.
    pub fn present(&mut self) -> GraphicsResult<SwapchainStatus> {
        self.ensure_running()?;
        if self.phase != FramePhase::Submitted {
            return Err(GraphicsError::InvalidState(format!(
                "present while {:?}",
                self.phase
            )));
        }
        let image_index = self
            .current_image
            .ok_or_else(|| GraphicsError::InvalidState("no acquired image".into()))?;
        let slot = self.frame_slot;
        let render_finished = self
            .swapchain
            .sync_slot(slot)
            .map(|sync| sync.render_finished)
            .ok_or_else(|| GraphicsError::InvalidState(format!("no frame slot {slot}")))?;

        self.phase = FramePhase::Idle;
        self.current_image = None;
        self.frame_slot = (slot + 1) % MAX_FRAMES_IN_FLIGHT;

        let status = self.swapchain.present(image_index, render_finished)?;
        if status.needs_recreation() {
            log::debug!("Renderer: present returned {:?}", status);
            self.needs_recreate = true;
        }
        self.stats.vram_bytes = self.device.memory_usage();
        Ok(status)
    }

    /// Give up on the frame in progress after a failure in `begin_frame`,
    /// `draw_scene` or `end_frame`, so the next frame can start.
    ///
    /// The slot's command buffer is re-recorded with nothing but the
    /// transition of the acquired image to the present layout, submitted with
    /// the slot's semaphores and fence, and presented. A no-op between frames.
    pub fn abort_frame(&mut self) -> GraphicsResult<()> {
        self.ensure_running()?;
        match self.phase {
            FramePhase::Idle => return Ok(()),
            FramePhase::Submitted => return self.present().map(|_| ()),
            FramePhase::Recording => {}
        }

        let slot = self.frame_slot;
        log::warn!(
            "Renderer: aborting frame {} in slot {}",
            self.frame_number,
            slot
        );
        let sync = *self
            .swapchain
            .sync_slot(slot)
            .ok_or_else(|| GraphicsError::InvalidState(format!("no frame slot {slot}")))?;
        let swapchain_image = self
            .current_image
            .and_then(|index| self.swapchain.image(index))
            .map(|image| image.image);
        let cmd = self.frames[slot].command_buffer;
        let device = &*self.device;

        let submitted = device
            .begin_commands(cmd)
            .and_then(|()| {
                if let Some(image) = swapchain_image {
                    device.cmd_image_barrier(
                        cmd,
                        &ImageBarrier::color(image, ImageLayout::Undefined, ImageLayout::Present),
                    );
                }
                device.end_commands(cmd)
            })
            .and_then(|()| device.reset_fence(sync.in_flight))
            .and_then(|()| {
                device.submit(&SubmitInfo {
                    command_buffer: cmd,
                    wait_semaphore: Some(sync.image_available),
                    signal_semaphore: Some(sync.render_finished),
                    fence: Some(sync.in_flight),
                })
            });

        match submitted {
            Ok(()) => {
                self.phase = FramePhase::Submitted;
                self.present().map(|_| ())
            }
            Err(err) => {
                log::error!("Renderer: could not retire aborted frame: {err}");
                self.phase = FramePhase::Idle;
                self.current_image = None;
                self.frame_slot = (slot + 1) % MAX_FRAMES_IN_FLIGHT;
                self.needs_recreate = true;
                Err(err.into())
            }
        }
    }

    /// Note a new framebuffer size. The chain is rebuilt at the next frame
    /// start; a zero-area size pauses rendering until a real one arrives.
    pub fn resize(&mut self, extent: Extent2d) {
        log::debug!("Renderer: resize to {}x{}", extent.width, extent.height);
        self.pending_extent = Some(extent);
    }

    fn recreate_swapchain(&mut self, extent: Extent2d) -> GraphicsResult<()> {
        let device = &*self.device;
        let retired = DeletionQueue::new();
        let result = self.swapchain.recreate(extent, &retired);
        if let Some(targets) = self.targets.take() {
            targets.retire(&retired);
        }
        // The chain waited for the device to go idle.
        retired.flush(device);
        result?;

        self.targets = Some(OffscreenTargets::create(device, self.swapchain.extent())?);
        self.config.extent = extent;
        self.pending_extent = None;
        self.needs_recreate = false;
        self.stats.swapchain_recreations += 1;
        log::info!(
            "Renderer: swapchain recreated at {}x{}",
            self.swapchain.extent().width,
            self.swapchain.extent().height
        );
        Ok(())
    }

    /// Destroy `task` once the most recently started frame has retired.
    ///
    /// Between frames that is the frame just presented, so anything it drew
    /// with stays alive until its slot comes around again.
    pub fn destroy_deferred(&self, task: DeletionTask) {
        let slot = match self.phase {
            FramePhase::Idle => {
                (self.frame_slot + MAX_FRAMES_IN_FLIGHT - 1) % MAX_FRAMES_IN_FLIGHT
            }
            FramePhase::Recording | FramePhase::Submitted => self.frame_slot,
        };
        match self.frames.get(slot) {
            Some(frame) => frame.deletion_queue.push(task),
            None => {
                log::warn!("Renderer: destroying {:?} immediately after shutdown", task);
                task.destroy(&*self.device);
            }
        }
    }

    /// Upload a mesh and track it for release at shutdown.
    pub fn upload_mesh(
        &self,
        name: &str,
        vertices: &[Vertex],
        indices: &[u32],
    ) -> GraphicsResult<MeshRef> {
        let data = MeshData::new(name, vertices.to_vec(), indices.to_vec());
        let mesh = Mesh::upload(&*self.device, &data)?
            .with_retire_hook(RetireHook::new(Arc::clone(&self.retired)));
        let mesh = Arc::new(mesh);
        let releasable: Arc<dyn Releasable> = mesh.clone();
        self.deletion_queue.register(&releasable);
        Ok(mesh)
    }

    /// Upload a material's uniforms and give it a descriptor set from the
    /// global allocator.
    pub fn create_material(&mut self, desc: &MaterialDescriptor) -> GraphicsResult<MaterialRef> {
        let device = &*self.device;
        let uniform = desc.uniform_data();
        let uniform_buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some(format!("{} material", desc.name)),
                size: std::mem::size_of::<MaterialUniformData>() as u64,
                usage: BufferUsage::UNIFORM,
                host_visible: true,
            })
            .map_err(GraphicsError::creation("material buffer"))?;

        let descriptor_set = device
            .write_buffer(uniform_buffer, 0, bytemuck::bytes_of(&uniform))
            .map_err(GraphicsError::from)
            .and_then(|()| self.descriptors.allocate(device, self.layouts.material));
        let descriptor_set = match descriptor_set {
            Ok(set) => set,
            Err(err) => {
                device.destroy_buffer(uniform_buffer);
                return Err(err);
            }
        };
        if let Err(err) = device.write_uniform_descriptor(
            descriptor_set,
            0,
            uniform_buffer,
            std::mem::size_of::<MaterialUniformData>() as u64,
        ) {
            device.destroy_buffer(uniform_buffer);
            return Err(err.into());
        }

        let material = Arc::new(Material {
            name: desc.name.clone(),
            shading: desc.shading,
            uniform_buffer,
            descriptor_set,
            retire: Some(RetireHook::new(Arc::clone(&self.retired))),
        });
        let releasable: Arc<dyn Releasable> = material.clone();
        self.deletion_queue.register(&releasable);
        log::debug!("Renderer: created material '{}'", desc.name);
        Ok(material)
    }

    /// Upload [`MeshData`] built on the CPU (for example [`MeshData::cube`]).
    pub fn upload_mesh_data(&self, data: &MeshData) -> GraphicsResult<MeshRef> {
        self.upload_mesh(&data.name, &data.vertices, &data.indices)
    }

    pub fn submit_light(&mut self, id: u64, light: LightData) -> bool {
        self.lights.submit(id, light)
    }

    pub fn remove_light(&mut self, id: u64) -> bool {
        self.lights.remove(id)
    }

    pub fn set_light_active(&mut self, id: u64, active: bool) -> bool {
        self.lights.set_active(id, active)
    }

    /// Entity drawn with the selection outline.
    pub fn set_selected(&mut self, id: Option<u64>) {
        self.selected = id;
    }

    pub fn set_camera(&mut self, view_proj: Mat4, position: Vec3) {
        self.camera = CameraState {
            view_proj,
            position,
        };
    }

    pub fn clear_color(&self) -> Vec4 {
        self.clear_color
    }

    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    pub fn swapchain(&self) -> &SwapChain {
        &self.swapchain
    }

    pub fn draws(&self) -> &DrawQueue {
        &self.draws
    }

    pub fn lights(&self) -> &LightRegistry {
        &self.lights
    }

    pub fn offscreen_targets(&self) -> Option<&OffscreenTargets> {
        self.targets.as_ref()
    }

    pub fn pipelines(&self) -> &Pipelines {
        &self.pipelines
    }

    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    pub fn frame(&self, slot: usize) -> Option<&FrameData> {
        self.frames.get(slot)
    }

    pub fn global_descriptors(&self) -> &DescriptorAllocator {
        &self.descriptors
    }

    pub fn deletion_queue(&self) -> &Arc<DeletionQueue> {
        &self.deletion_queue
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Wait for the GPU and destroy everything the renderer created.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&mut self) -> GraphicsResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        log::info!("Renderer: shutting down");

        let device = &*self.device;
        let queue = &*self.deletion_queue;
        let idle = device.wait_idle();

        queue.release();
        self.draws.clear();
        self.retired.transfer_to(queue);
        for frame in self.frames.drain(..) {
            frame.release(device, queue);
        }
        for pool in self.descriptors.drain_pools() {
            queue.push(DeletionTask::DescriptorPool(pool));
        }
        if let Some(targets) = self.targets.take() {
            targets.retire(queue);
        }
        self.swapchain.release(queue);
        queue.flush(device);

        idle.map_err(GraphicsError::from)
    }

    fn ensure_running(&self) -> GraphicsResult<()> {
        if self.shut_down {
            Err(GraphicsError::InvalidState("renderer shut down".into()))
        } else {
            Ok(())
        }
    }

    fn recording_image(&self) -> GraphicsResult<u32> {
        self.ensure_running()?;
        match (self.phase, self.current_image) {
            (FramePhase::Recording, Some(index)) => Ok(index),
            (phase, _) => Err(GraphicsError::InvalidState(format!(
                "no frame being recorded ({phase:?})"
            ))),
        }
    }
}

impl RenderBackend for Renderer {
    fn set_clear_color(&mut self, color: Vec4) {
        self.clear_color = color;
    }

    fn push_draw(&mut self, id: u64, object: ObjectData, material: MaterialRef) {
        if self.draws.push(id, object, material) {
            log::trace!("Renderer: replaced draw {id}");
        }
    }

    fn pop_draw(&mut self, id: u64) -> bool {
        self.draws.pop(id)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("Renderer: shutdown on drop failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceCall, DummyDevice, DummyFailure, PipelineHandle};
    use crate::deletion_queue::DeletionKind;
    use crate::resources::ShadingModel;

    fn renderer(device: &Arc<DummyDevice>, config: RendererConfig) -> Renderer {
        let device: Arc<dyn GpuDevice> = device.clone();
        Renderer::new(device, Arc::new(DeletionQueue::new()), config).unwrap()
    }

    #[test]
    fn test_frame_cycle_records_scene() {
        let device = Arc::new(DummyDevice::new());
        let mut renderer = renderer(&device, RendererConfig::default());
        let mesh = renderer.upload_mesh_data(&MeshData::cube(1.0)).unwrap();
        let material = renderer
            .create_material(&MaterialDescriptor::new("red"))
            .unwrap();
        renderer.push_draw(
            1,
            ObjectData {
                mesh: mesh.clone(),
                transform: Mat4::IDENTITY,
            },
            material,
        );

        assert!(renderer.begin_frame().unwrap().is_started());
        renderer.draw_scene().unwrap();
        renderer.end_frame().unwrap();
        assert_eq!(renderer.present().unwrap(), SwapchainStatus::Success);

        assert_eq!(renderer.stats().draw_calls, 1);
        assert_eq!(renderer.stats().indices, 36);
        assert!(renderer.draws().get(1).unwrap().rendered);
        assert_eq!(renderer.frame_slot(), 1);
        assert!(device
            .calls()
            .iter()
            .any(|call| matches!(call, DeviceCall::DrawIndexed { index_count: 36 })));
    }

    #[test]
    fn test_outline_only_for_selected() {
        let device = Arc::new(DummyDevice::new());
        let mut renderer = renderer(&device, RendererConfig::default());
        let mesh = renderer.upload_mesh_data(&MeshData::cube(1.0)).unwrap();
        let pbr = renderer.create_material(&MaterialDescriptor::gold()).unwrap();
        assert_eq!(pbr.shading, ShadingModel::Pbr);
        for id in 0..3 {
            renderer.push_draw(
                id,
                ObjectData {
                    mesh: mesh.clone(),
                    transform: Mat4::IDENTITY,
                },
                pbr.clone(),
            );
        }
        renderer.set_selected(Some(2));

        renderer.begin_frame().unwrap();
        renderer.draw_scene().unwrap();
        assert_eq!(renderer.stats().draw_calls, 4);

        let binds: Vec<_> = device
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                DeviceCall::BindPipeline(pipeline) => Some(pipeline),
                _ => None,
            })
            .collect();
        assert_eq!(
            binds,
            vec![renderer.pipelines().pbr, renderer.pipelines().outline]
        );
        renderer.end_frame().unwrap();
        renderer.present().unwrap();
    }

    #[test]
    fn test_mixed_buckets_bind_in_order() {
        let device = Arc::new(DummyDevice::new());
        let mut renderer = renderer(&device, RendererConfig::default());
        let mesh = renderer.upload_mesh_data(&MeshData::cube(1.0)).unwrap();
        let plain = renderer
            .create_material(&MaterialDescriptor::new("plain"))
            .unwrap();
        let gold = renderer.create_material(&MaterialDescriptor::gold()).unwrap();
        let wire = renderer
            .create_material(&MaterialDescriptor::new("wire").with_shading(ShadingModel::Wireframe))
            .unwrap();
        // Submission order deliberately interleaves the shading models.
        for (id, material) in [(0, &wire), (1, &plain), (2, &gold), (3, &plain), (4, &wire)] {
            renderer.push_draw(
                id,
                ObjectData {
                    mesh: mesh.clone(),
                    transform: Mat4::IDENTITY,
                },
                material.clone(),
            );
        }
        renderer.set_selected(Some(3));

        device.clear_calls();
        renderer.begin_frame().unwrap();
        renderer.draw_scene().unwrap();
        renderer.end_frame().unwrap();
        renderer.present().unwrap();

        let mut per_pipeline: Vec<(PipelineHandle, usize)> = Vec::new();
        for call in device.calls() {
            match call {
                DeviceCall::BindPipeline(pipeline) => per_pipeline.push((pipeline, 0)),
                DeviceCall::DrawIndexed { .. } => {
                    if let Some((_, draws)) = per_pipeline.last_mut() {
                        *draws += 1;
                    }
                }
                _ => {}
            }
        }
        let pipelines = renderer.pipelines();
        assert_eq!(
            per_pipeline,
            vec![
                (pipelines.default, 2),
                (pipelines.pbr, 1),
                (pipelines.wireframe, 2),
                (pipelines.outline, 1),
            ]
        );
        assert_eq!(renderer.stats().draw_calls, 6);
        assert!((0..5).all(|id| renderer.draws().get(id).unwrap().rendered));
    }

    #[test]
    fn test_compute_debug_dispatch() {
        let device = Arc::new(DummyDevice::new());
        let mut renderer = renderer(
            &device,
            RendererConfig::default()
                .with_extent(100, 40)
                .with_compute_debug(true),
        );
        renderer.begin_frame().unwrap();
        renderer.draw_scene().unwrap();
        assert!(device
            .calls()
            .contains(&DeviceCall::Dispatch { x: 7, y: 3, z: 1 }));
        renderer.end_frame().unwrap();
        renderer.present().unwrap();
    }

    #[test]
    fn test_abort_returns_acquired_image() {
        let device = Arc::new(DummyDevice::new());
        let mut renderer = renderer(&device, RendererConfig::default());
        // Nothing to abort between frames.
        renderer.abort_frame().unwrap();
        assert_eq!(renderer.frame_slot(), 0);

        assert!(renderer.begin_frame().unwrap().is_started());
        let fence = renderer.swapchain().sync_slot(0).unwrap().in_flight;
        // The fence stays signaled until a submission is certain.
        assert!(device.is_fence_signaled(fence));

        device.clear_calls();
        renderer.abort_frame().unwrap();
        let calls = device.calls();
        assert!(matches!(
            calls.as_slice(),
            [
                DeviceCall::BeginCommands(_),
                DeviceCall::Barrier {
                    new_layout: ImageLayout::Present,
                    ..
                },
                DeviceCall::EndCommands(_),
                DeviceCall::ResetFence(_),
                DeviceCall::Submit { fence: Some(_) },
                DeviceCall::Present { .. },
            ]
        ), "{calls:?}");
        assert_eq!(renderer.frame_slot(), 1);
        assert!(matches!(
            renderer.draw_scene(),
            Err(GraphicsError::InvalidState(_))
        ));

        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            assert!(renderer.begin_frame().unwrap().is_started());
            renderer.draw_scene().unwrap();
            renderer.end_frame().unwrap();
            renderer.present().unwrap();
        }
    }

    #[test]
    fn test_draw_outside_frame_is_rejected() {
        let device = Arc::new(DummyDevice::new());
        let mut renderer = renderer(&device, RendererConfig::default());
        assert!(matches!(
            renderer.draw_scene(),
            Err(GraphicsError::InvalidState(_))
        ));
        assert!(matches!(
            renderer.present(),
            Err(GraphicsError::InvalidState(_))
        ));
    }

    #[test]
    fn test_deferred_destruction_waits_for_slot() {
        let device = Arc::new(DummyDevice::new());
        let mut renderer = renderer(&device, RendererConfig::default());
        let mesh = Mesh::upload(&*device, &MeshData::cube(1.0)).unwrap();

        renderer.begin_frame().unwrap();
        renderer.destroy_deferred(DeletionTask::Buffer(mesh.vertex_buffer));
        renderer.destroy_deferred(DeletionTask::Buffer(mesh.index_buffer));
        renderer.draw_scene().unwrap();
        renderer.end_frame().unwrap();
        renderer.present().unwrap();
        assert!(device.destroyed().is_empty());

        // Slot 1, then back to slot 0 whose queue holds the buffers.
        for _ in 0..2 {
            renderer.begin_frame().unwrap();
            renderer.draw_scene().unwrap();
            renderer.end_frame().unwrap();
            renderer.present().unwrap();
        }
        assert_eq!(
            device.destroyed(),
            vec![
                DeletionTask::Buffer(mesh.index_buffer),
                DeletionTask::Buffer(mesh.vertex_buffer),
            ]
        );
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Arc::new(DummyDevice::new());
        let mut renderer = renderer(&device, RendererConfig::default());
        let _mesh = renderer.upload_mesh_data(&MeshData::cube(1.0)).unwrap();
        let _material = renderer
            .create_material(&MaterialDescriptor::new("m"))
            .unwrap();

        renderer.shutdown().unwrap();
        renderer.shutdown().unwrap();

        for kind in [
            DeletionKind::Buffer,
            DeletionKind::Image,
            DeletionKind::ImageView,
            DeletionKind::Pipeline,
            DeletionKind::DescriptorPool,
            DeletionKind::DescriptorSetLayout,
            DeletionKind::Sampler,
            DeletionKind::Fence,
            DeletionKind::Semaphore,
            DeletionKind::Swapchain,
        ] {
            assert_eq!(device.live_count(kind), 0, "{kind:?} leaked");
        }
        assert!(matches!(
            renderer.begin_frame(),
            Err(GraphicsError::InvalidState(_))
        ));
    }

    #[test]
    fn test_init_failure_flushes_partial_work() {
        let device = Arc::new(DummyDevice::new());
        device.inject_failure(DummyFailure::Swapchain);
        let dyn_device: Arc<dyn GpuDevice> = device.clone();
        let queue = Arc::new(DeletionQueue::new());

        let err = match Renderer::new(dyn_device, queue.clone(), RendererConfig::default()) {
            Err(err) => err,
            Ok(_) => panic!("initialization should fail"),
        };
        assert!(matches!(
            err,
            GraphicsError::InitializationFailed { what: "swapchain", .. }
        ));
        assert!(queue.is_empty());
        assert_eq!(device.live_count(DeletionKind::Pipeline), 0);
        assert_eq!(device.live_count(DeletionKind::DescriptorPool), 0);
    }
}
