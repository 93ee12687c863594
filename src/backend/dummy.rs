//! Dummy GPU device for testing and headless runs.
//!
//! This device doesn't perform GPU work but tracks every object it hands out,
//! enforces descriptor pool capacity, and implements fences with a real host
//! condition variable. Tests drive it through scripted acquire/present
//! outcomes, injected creation failures and manual fence signaling, then
//! inspect the recorded [`DeviceCall`]s and destroyed objects.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::deletion_queue::{DeletionKind, DeletionTask};

/// Device operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DummyFailure {
    Sampler,
    Pipeline,
    DescriptorPool,
    DescriptorPoolReset,
    DescriptorSetLayout,
    Buffer,
    Image,
    Swapchain,
}

/// Scripted result of the next acquire or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Suboptimal,
    OutOfDate,
    SurfaceLost,
}

/// A device call worth asserting on.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    WaitIdle,
    WaitForFence(FenceHandle),
    ResetFence(FenceHandle),
    CreateSwapchain {
        handle: SwapchainHandle,
        extent: Extent2d,
        present_mode: PresentMode,
        image_count: u32,
        old: Option<SwapchainHandle>,
    },
    CreateDescriptorPool {
        pool: DescriptorPoolHandle,
        max_sets: u32,
    },
    ResetDescriptorPool(DescriptorPoolHandle),
    WriteBuffer {
        buffer: BufferHandle,
        len: usize,
    },
    Acquire {
        swapchain: SwapchainHandle,
        index: u32,
    },
    Present {
        swapchain: SwapchainHandle,
        index: u32,
    },
    BeginCommands(CommandBufferHandle),
    EndCommands(CommandBufferHandle),
    BeginPass {
        label: &'static str,
        extent: Extent2d,
    },
    EndPass,
    BindPipeline(PipelineHandle),
    BindDescriptorSet {
        index: u32,
        set: DescriptorSetHandle,
    },
    PushConstants {
        size: usize,
    },
    DrawIndexed {
        index_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    Barrier {
        image: ImageHandle,
        new_layout: ImageLayout,
    },
    Blit {
        src: ImageHandle,
        dst: ImageHandle,
    },
    Submit {
        fence: Option<FenceHandle>,
    },
}

#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Signal the submit fence immediately, as if the GPU finished instantly.
    pub auto_signal_fences: bool,
    pub capabilities: SurfaceCapabilities,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            auto_signal_fences: true,
            capabilities: SurfaceCapabilities {
                formats: vec![TextureFormat::Bgra8UnormSrgb, TextureFormat::Rgba8Unorm],
                present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox, PresentMode::Immediate],
                current_extent: None,
                min_extent: Extent2d::new(1, 1),
                max_extent: Extent2d::new(4096, 4096),
                min_image_count: 2,
                max_image_count: 8,
            },
        }
    }
}

#[derive(Debug)]
struct PoolState {
    max_sets: u32,
    allocated_sets: u32,
    capacity: HashMap<DescriptorType, u32>,
    used: HashMap<DescriptorType, u32>,
}

#[derive(Debug)]
struct ChainState {
    images: Vec<ImageHandle>,
    next_index: u32,
}

#[derive(Debug, Default)]
struct DummyState {
    next_id: u64,
    fences: HashMap<FenceHandle, bool>,
    semaphores: HashSet<SemaphoreHandle>,
    layouts: HashMap<DescriptorSetLayoutHandle, Vec<DescriptorBinding>>,
    pools: HashMap<DescriptorPoolHandle, PoolState>,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    images: HashMap<ImageHandle, u64>,
    views: HashSet<ImageViewHandle>,
    samplers: HashSet<SamplerHandle>,
    pipelines: HashSet<PipelineHandle>,
    swapchains: HashMap<SwapchainHandle, ChainState>,
    command_buffers: HashSet<CommandBufferHandle>,
    failures: HashSet<DummyFailure>,
    acquire_script: VecDeque<ScriptedOutcome>,
    present_script: VecDeque<ScriptedOutcome>,
    allocation_script: VecDeque<BackendError>,
    calls: Vec<DeviceCall>,
    destroyed: Vec<DeletionTask>,
    submitted_fences: Vec<FenceHandle>,
}

impl DummyState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, failure: DummyFailure) -> BackendResult<()> {
        if self.failures.contains(&failure) {
            Err(BackendError::Api(format!("injected {failure:?} failure")))
        } else {
            Ok(())
        }
    }
}

/// In-memory [`GpuDevice`].
pub struct DummyDevice {
    state: Mutex<DummyState>,
    fence_signaled: Condvar,
    auto_signal_fences: Mutex<bool>,
    capabilities: Mutex<SurfaceCapabilities>,
}

impl DummyDevice {
    pub fn new() -> Self {
        Self::with_config(DummyConfig::default())
    }

    pub fn with_config(config: DummyConfig) -> Self {
        Self {
            state: Mutex::new(DummyState::default()),
            fence_signaled: Condvar::new(),
            auto_signal_fences: Mutex::new(config.auto_signal_fences),
            capabilities: Mutex::new(config.capabilities),
        }
    }

    pub fn set_auto_signal_fences(&self, enabled: bool) {
        *self.auto_signal_fences.lock() = enabled;
    }

    pub fn set_capabilities(&self, capabilities: SurfaceCapabilities) {
        *self.capabilities.lock() = capabilities;
    }

    /// Make every subsequent creation of this kind fail.
    pub fn inject_failure(&self, failure: DummyFailure) {
        self.state.lock().failures.insert(failure);
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn script_acquire(&self, outcome: ScriptedOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    /// Fail the next descriptor set allocation with `err`, whatever the pool
    /// has left.
    pub fn script_allocation_failure(&self, err: BackendError) {
        self.state.lock().allocation_script.push_back(err);
    }

    pub fn script_present(&self, outcome: ScriptedOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }

    /// Simulates GPU completion of the work guarded by `fence`.
    pub fn signal_fence(&self, fence: FenceHandle) {
        let mut state = self.state.lock();
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = true;
        }
        self.fence_signaled.notify_all();
    }

    pub fn is_fence_signaled(&self, fence: FenceHandle) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Objects destroyed so far, in destruction order.
    pub fn destroyed(&self) -> Vec<DeletionTask> {
        self.state.lock().destroyed.clone()
    }

    /// Fences passed to `submit`, in submission order.
    pub fn submitted_fences(&self) -> Vec<FenceHandle> {
        self.state.lock().submitted_fences.clone()
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).cloned()
    }

    /// Number of live objects of the given kind.
    pub fn live_count(&self, kind: DeletionKind) -> usize {
        let state = self.state.lock();
        match kind {
            DeletionKind::Buffer => state.buffers.len(),
            DeletionKind::Image => state.images.len(),
            DeletionKind::ImageView => state.views.len(),
            DeletionKind::Sampler => state.samplers.len(),
            DeletionKind::Pipeline => state.pipelines.len(),
            DeletionKind::DescriptorPool => state.pools.len(),
            DeletionKind::DescriptorSetLayout => state.layouts.len(),
            DeletionKind::Fence => state.fences.len(),
            DeletionKind::Semaphore => state.semaphores.len(),
            DeletionKind::Swapchain => state.swapchains.len(),
            DeletionKind::CommandBuffer => state.command_buffers.len(),
        }
    }

    fn record(&self, call: DeviceCall) {
        self.state.lock().calls.push(call);
    }

    fn destroyed_object(&self, task: DeletionTask, existed: bool) {
        if !existed {
            log::warn!("DummyDevice: destroying unknown {:?}", task);
        }
        log::trace!("DummyDevice: destroyed {:?}", task);
        self.state.lock().destroyed.push(task);
    }
}

impl Default for DummyDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for DummyDevice {
    fn name(&self) -> &str {
        "Dummy Device"
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle> {
        let mut state = self.state.lock();
        let fence = FenceHandle(state.next_id());
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> BackendResult<bool> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitForFence(fence));
        loop {
            match state.fences.get(&fence) {
                None => return Err(BackendError::InvalidHandle(format!("{fence:?}"))),
                Some(true) => return Ok(true),
                Some(false) => {}
            }
            match deadline {
                None => self.fence_signaled.wait(&mut state),
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.fences.get(&fence).copied().unwrap_or(false));
                    }
                }
            }
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::ResetFence(fence));
        match state.fences.get_mut(&fence) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(BackendError::InvalidHandle(format!("{fence:?}"))),
        }
    }

    fn create_semaphore(&self) -> BackendResult<SemaphoreHandle> {
        let mut state = self.state.lock();
        let semaphore = SemaphoreHandle(state.next_id());
        state.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn wait_idle(&self) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DeviceCall::WaitIdle);
        // Idle means every submission has retired.
        for fence in state.submitted_fences.clone() {
            if let Some(signaled) = state.fences.get_mut(&fence) {
                *signaled = true;
            }
        }
        self.fence_signaled.notify_all();
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let mut state = self.state.lock();
        state.check(DummyFailure::DescriptorSetLayout)?;
        let layout = DescriptorSetLayoutHandle(state.next_id());
        state.layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[PoolSize],
    ) -> BackendResult<DescriptorPoolHandle> {
        let mut state = self.state.lock();
        state.check(DummyFailure::DescriptorPool)?;
        let pool = DescriptorPoolHandle(state.next_id());
        let mut capacity = HashMap::new();
        for size in sizes {
            *capacity.entry(size.ty).or_insert(0) += size.count;
        }
        state.pools.insert(
            pool,
            PoolState {
                max_sets,
                allocated_sets: 0,
                capacity,
                used: HashMap::new(),
            },
        );
        state
            .calls
            .push(DeviceCall::CreateDescriptorPool { pool, max_sets });
        log::trace!("DummyDevice: created descriptor pool {pool:?} ({max_sets} sets)");
        Ok(pool)
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        let mut state = self.state.lock();
        if let Some(err) = state.allocation_script.pop_front() {
            return Err(err);
        }
        let bindings = state
            .layouts
            .get(&layout)
            .cloned()
            .ok_or_else(|| BackendError::InvalidHandle(format!("{layout:?}")))?;
        let pool_state = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{pool:?}")))?;

        if pool_state.allocated_sets >= pool_state.max_sets {
            return Err(BackendError::OutOfPoolMemory);
        }
        for binding in &bindings {
            let capacity = pool_state.capacity.get(&binding.ty).copied().unwrap_or(0);
            let used = pool_state.used.get(&binding.ty).copied().unwrap_or(0);
            if used + binding.count > capacity {
                return Err(BackendError::OutOfPoolMemory);
            }
        }
        for binding in &bindings {
            *pool_state.used.entry(binding.ty).or_insert(0) += binding.count;
        }
        pool_state.allocated_sets += 1;
        Ok(DescriptorSetHandle(state.next_id()))
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        state.check(DummyFailure::DescriptorPoolReset)?;
        let pool_state = state
            .pools
            .get_mut(&pool)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{pool:?}")))?;
        pool_state.allocated_sets = 0;
        pool_state.used.clear();
        state.calls.push(DeviceCall::ResetDescriptorPool(pool));
        Ok(())
    }

    fn write_uniform_descriptor(
        &self,
        _set: DescriptorSetHandle,
        _binding: u32,
        buffer: BufferHandle,
        _range: u64,
    ) -> BackendResult<()> {
        if self.state.lock().buffers.contains_key(&buffer) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle(format!("{buffer:?}")))
        }
    }

    fn write_image_descriptor(
        &self,
        _set: DescriptorSetHandle,
        _binding: u32,
        ty: DescriptorType,
        view: ImageViewHandle,
        sampler: Option<SamplerHandle>,
    ) -> BackendResult<()> {
        let state = self.state.lock();
        if !state.views.contains(&view) {
            return Err(BackendError::InvalidHandle(format!("{view:?}")));
        }
        match (ty, sampler) {
            (DescriptorType::CombinedImageSampler, None) => Err(BackendError::InvalidHandle(
                "combined image sampler without sampler".into(),
            )),
            (DescriptorType::CombinedImageSampler, Some(sampler))
                if !state.samplers.contains(&sampler) =>
            {
                Err(BackendError::InvalidHandle(format!("{sampler:?}")))
            }
            (DescriptorType::UniformBuffer | DescriptorType::StorageBuffer, _) => Err(
                BackendError::Unsupported(format!("{ty:?} is not an image descriptor")),
            ),
            _ => Ok(()),
        }
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "DummyDevice: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let mut state = self.state.lock();
        state.check(DummyFailure::Buffer)?;
        let buffer = BufferHandle(state.next_id());
        state.buffers.insert(buffer, vec![0; desc.size as usize]);
        Ok(buffer)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{buffer:?}")))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(BackendError::Api(format!(
                "write of {} bytes at {} overflows {:?}",
                data.len(),
                offset,
                buffer
            )));
        }
        contents[start..end].copy_from_slice(data);
        state.calls.push(DeviceCall::WriteBuffer {
            buffer,
            len: data.len(),
        });
        Ok(())
    }

    fn create_image(&self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        log::trace!(
            "DummyDevice: creating image {:?} ({}x{})",
            desc.label,
            desc.extent.width,
            desc.extent.height
        );
        let mut state = self.state.lock();
        state.check(DummyFailure::Image)?;
        let image = ImageHandle(state.next_id());
        let bytes = desc.extent.width as u64
            * desc.extent.height as u64
            * desc.format.bytes_per_pixel() as u64;
        state.images.insert(image, bytes);
        Ok(image)
    }

    fn create_image_view(
        &self,
        image: ImageHandle,
        _format: TextureFormat,
    ) -> BackendResult<ImageViewHandle> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&image) {
            return Err(BackendError::InvalidHandle(format!("{image:?}")));
        }
        let view = ImageViewHandle(state.next_id());
        state.views.insert(view);
        Ok(view)
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("DummyDevice: creating sampler {:?}", desc.label);
        let mut state = self.state.lock();
        state.check(DummyFailure::Sampler)?;
        let sampler = SamplerHandle(state.next_id());
        state.samplers.insert(sampler);
        Ok(sampler)
    }

    fn create_pipeline(&self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        log::trace!("DummyDevice: creating pipeline {}", desc.label());
        let mut state = self.state.lock();
        state.check(DummyFailure::Pipeline)?;
        let pipeline = PipelineHandle(state.next_id());
        state.pipelines.insert(pipeline);
        Ok(pipeline)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let existed = self.state.lock().buffers.remove(&buffer).is_some();
        self.destroyed_object(DeletionTask::Buffer(buffer), existed);
    }

    fn destroy_image(&self, image: ImageHandle) {
        let existed = self.state.lock().images.remove(&image).is_some();
        self.destroyed_object(DeletionTask::Image(image), existed);
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        let existed = self.state.lock().views.remove(&view);
        self.destroyed_object(DeletionTask::ImageView(view), existed);
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        let existed = self.state.lock().samplers.remove(&sampler);
        self.destroyed_object(DeletionTask::Sampler(sampler), existed);
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        let existed = self.state.lock().pipelines.remove(&pipeline);
        self.destroyed_object(DeletionTask::Pipeline(pipeline), existed);
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let existed = self.state.lock().pools.remove(&pool).is_some();
        self.destroyed_object(DeletionTask::DescriptorPool(pool), existed);
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        let existed = self.state.lock().layouts.remove(&layout).is_some();
        self.destroyed_object(DeletionTask::DescriptorSetLayout(layout), existed);
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let existed = self.state.lock().fences.remove(&fence).is_some();
        self.destroyed_object(DeletionTask::Fence(fence), existed);
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        let existed = self.state.lock().semaphores.remove(&semaphore);
        self.destroyed_object(DeletionTask::Semaphore(semaphore), existed);
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let existed = {
            let mut state = self.state.lock();
            match state.swapchains.remove(&swapchain) {
                Some(chain) => {
                    // Presentable images die with their swapchain.
                    for image in chain.images {
                        state.images.remove(&image);
                    }
                    true
                }
                None => false,
            }
        };
        self.destroyed_object(DeletionTask::Swapchain(swapchain), existed);
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let existed = self.state.lock().command_buffers.remove(&command_buffer);
        self.destroyed_object(DeletionTask::CommandBuffer(command_buffer), existed);
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        Ok(self.capabilities.lock().clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDescriptor) -> BackendResult<SwapchainHandle> {
        let mut state = self.state.lock();
        state.check(DummyFailure::Swapchain)?;
        if let Some(old) = desc.old_swapchain {
            if !state.swapchains.contains_key(&old) {
                return Err(BackendError::InvalidHandle(format!("{old:?}")));
            }
        }
        let handle = SwapchainHandle(state.next_id());
        let mut images = Vec::with_capacity(desc.image_count as usize);
        for _ in 0..desc.image_count {
            let image = ImageHandle(state.next_id());
            state.images.insert(image, 0);
            images.push(image);
        }
        state.swapchains.insert(
            handle,
            ChainState {
                images,
                next_index: 0,
            },
        );
        state.calls.push(DeviceCall::CreateSwapchain {
            handle,
            extent: desc.extent,
            present_mode: desc.present_mode,
            image_count: desc.image_count,
            old: desc.old_swapchain,
        });
        Ok(handle)
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .map(|chain| chain.images.clone())
            .ok_or_else(|| BackendError::InvalidHandle(format!("{swapchain:?}")))
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        _signal: SemaphoreHandle,
        fence: Option<FenceHandle>,
    ) -> BackendResult<(u32, bool)> {
        let mut state = self.state.lock();
        let suboptimal = match state.acquire_script.pop_front() {
            Some(ScriptedOutcome::OutOfDate) => return Err(BackendError::OutOfDate),
            Some(ScriptedOutcome::SurfaceLost) => return Err(BackendError::SurfaceLost),
            Some(ScriptedOutcome::Suboptimal) => true,
            None => false,
        };
        let chain = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{swapchain:?}")))?;
        let index = chain.next_index;
        chain.next_index = (chain.next_index + 1) % chain.images.len().max(1) as u32;
        if let Some(fence) = fence {
            if let Some(signaled) = state.fences.get_mut(&fence) {
                *signaled = true;
            }
            self.fence_signaled.notify_all();
        }
        state.calls.push(DeviceCall::Acquire { swapchain, index });
        Ok((index, suboptimal))
    }

    fn queue_present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        _wait: SemaphoreHandle,
    ) -> BackendResult<bool> {
        let mut state = self.state.lock();
        if !state.swapchains.contains_key(&swapchain) {
            return Err(BackendError::InvalidHandle(format!("{swapchain:?}")));
        }
        state.calls.push(DeviceCall::Present {
            swapchain,
            index: image_index,
        });
        match state.present_script.pop_front() {
            Some(ScriptedOutcome::OutOfDate) => Err(BackendError::OutOfDate),
            Some(ScriptedOutcome::SurfaceLost) => Err(BackendError::SurfaceLost),
            Some(ScriptedOutcome::Suboptimal) => Ok(true),
            None => Ok(false),
        }
    }

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle> {
        let mut state = self.state.lock();
        let cmd = CommandBufferHandle(state.next_id());
        state.command_buffers.insert(cmd);
        Ok(cmd)
    }

    fn begin_commands(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        self.record(DeviceCall::BeginCommands(cmd));
        Ok(())
    }

    fn end_commands(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        self.record(DeviceCall::EndCommands(cmd));
        Ok(())
    }

    fn cmd_begin_pass(&self, _cmd: CommandBufferHandle, pass: &PassDescriptor) {
        self.record(DeviceCall::BeginPass {
            label: pass.label,
            extent: pass.extent,
        });
    }

    fn cmd_end_pass(&self, _cmd: CommandBufferHandle) {
        self.record(DeviceCall::EndPass);
    }

    fn cmd_bind_pipeline(
        &self,
        _cmd: CommandBufferHandle,
        _bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        self.record(DeviceCall::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        _cmd: CommandBufferHandle,
        _bind_point: PipelineBindPoint,
        _pipeline: PipelineHandle,
        index: u32,
        set: DescriptorSetHandle,
    ) {
        self.record(DeviceCall::BindDescriptorSet { index, set });
    }

    fn cmd_push_constants(
        &self,
        _cmd: CommandBufferHandle,
        _pipeline: PipelineHandle,
        _stages: ShaderStages,
        data: &[u8],
    ) {
        self.record(DeviceCall::PushConstants { size: data.len() });
    }

    fn cmd_draw_indexed(&self, _cmd: CommandBufferHandle, draw: &IndexedDraw) {
        self.record(DeviceCall::DrawIndexed {
            index_count: draw.index_count,
        });
    }

    fn cmd_dispatch(&self, _cmd: CommandBufferHandle, x: u32, y: u32, z: u32) {
        self.record(DeviceCall::Dispatch { x, y, z });
    }

    fn cmd_image_barrier(&self, _cmd: CommandBufferHandle, barrier: &ImageBarrier) {
        self.record(DeviceCall::Barrier {
            image: barrier.image,
            new_layout: barrier.new_layout,
        });
    }

    fn cmd_blit_image(
        &self,
        _cmd: CommandBufferHandle,
        src: ImageHandle,
        _src_extent: Extent2d,
        dst: ImageHandle,
        _dst_extent: Extent2d,
    ) {
        self.record(DeviceCall::Blit { src, dst });
    }

    fn submit(&self, info: &SubmitInfo) -> BackendResult<()> {
        let auto_signal = *self.auto_signal_fences.lock();
        let mut state = self.state.lock();
        if !state.command_buffers.contains(&info.command_buffer) {
            return Err(BackendError::InvalidHandle(format!(
                "{:?}",
                info.command_buffer
            )));
        }
        state.calls.push(DeviceCall::Submit { fence: info.fence });
        if let Some(fence) = info.fence {
            state.submitted_fences.push(fence);
            if auto_signal {
                if let Some(signaled) = state.fences.get_mut(&fence) {
                    *signaled = true;
                }
                self.fence_signaled.notify_all();
            }
        }
        Ok(())
    }

    fn memory_usage(&self) -> u64 {
        let state = self.state.lock();
        let buffers: u64 = state.buffers.values().map(|b| b.len() as u64).sum();
        let images: u64 = state.images.values().sum();
        buffers + images
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn uniform_layout(device: &DummyDevice) -> DescriptorSetLayoutHandle {
        device
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::UniformBuffer,
                count: 1,
                stages: ShaderStages::VERTEX_FRAGMENT,
            }])
            .unwrap()
    }

    #[test]
    fn test_pool_enforces_max_sets() {
        let device = DummyDevice::new();
        let layout = uniform_layout(&device);
        let pool = device
            .create_descriptor_pool(
                2,
                &[PoolSize {
                    ty: DescriptorType::UniformBuffer,
                    count: 8,
                }],
            )
            .unwrap();

        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
        assert_eq!(
            device.allocate_descriptor_set(pool, layout),
            Err(BackendError::OutOfPoolMemory)
        );

        device.reset_descriptor_pool(pool).unwrap();
        assert!(device.allocate_descriptor_set(pool, layout).is_ok());
    }

    #[test]
    fn test_pool_enforces_type_capacity() {
        let device = DummyDevice::new();
        let layout = uniform_layout(&device);
        let pool = device
            .create_descriptor_pool(
                16,
                &[PoolSize {
                    ty: DescriptorType::StorageImage,
                    count: 16,
                }],
            )
            .unwrap();

        let err = device.allocate_descriptor_set(pool, layout).unwrap_err();
        assert!(err.is_pool_exhausted());
    }

    #[test]
    fn test_fence_wait_times_out() {
        let device = DummyDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert!(!device
            .wait_for_fence(fence, Duration::from_millis(5))
            .unwrap());
        assert!(!device.wait_for_fence(fence, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_fence_signaled_from_another_thread() {
        let device = Arc::new(DummyDevice::new());
        let fence = device.create_fence(false).unwrap();

        let signaler = {
            let device = Arc::clone(&device);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                device.signal_fence(fence);
            })
        };

        assert!(device.wait_for_fence(fence, Duration::MAX).unwrap());
        signaler.join().unwrap();
    }

    #[test]
    fn test_injected_failure() {
        let device = DummyDevice::new();
        device.inject_failure(DummyFailure::Sampler);
        assert!(device.create_sampler(&SamplerDescriptor::default()).is_err());
        device.clear_failures();
        assert!(device.create_sampler(&SamplerDescriptor::default()).is_ok());
    }

    #[test]
    fn test_swapchain_images_destroyed_with_chain() {
        let device = DummyDevice::new();
        let swapchain = device
            .create_swapchain(&SwapchainDescriptor {
                format: TextureFormat::Bgra8UnormSrgb,
                extent: Extent2d::new(640, 480),
                present_mode: PresentMode::Fifo,
                image_count: 3,
                old_swapchain: None,
            })
            .unwrap();
        assert_eq!(device.swapchain_images(swapchain).unwrap().len(), 3);
        assert_eq!(device.live_count(DeletionKind::Image), 3);

        device.destroy_swapchain(swapchain);
        assert_eq!(device.live_count(DeletionKind::Image), 0);
        assert_eq!(device.destroyed(), vec![DeletionTask::Swapchain(swapchain)]);
    }
}
