//! Vulkan device implementation using ash
//!
//! Targets Vulkan 1.3 with dynamic rendering, so passes need no render pass
//! or framebuffer objects. Every object handed out through [`GpuDevice`] is
//! an id into one of the maps in [`DeviceState`]; the maps and the command
//! pool sit behind a single lock because Vulkan requires external
//! synchronization for pools and queues.

mod conversion;

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::Arc;
use std::time::Duration;

use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use crate::backend::traits::*;
use crate::backend::types::*;

use conversion::*;

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkImage {
    image: vk::Image,
    /// `None` for images owned by the presentation engine
    allocation: Option<Allocation>,
    format: vk::Format,
    extent: vk::Extent2D,
}

struct VkPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

struct VkDescriptorSet {
    set: vk::DescriptorSet,
    pool: u64,
}

struct VkSwapchain {
    swapchain: vk::SwapchainKHR,
    images: Vec<u64>,
}

#[derive(Default)]
struct DeviceState {
    allocator: Option<Allocator>,
    command_pool: vk::CommandPool,
    next_id: u64,
    allocated_bytes: u64,
    buffers: HashMap<u64, VkBuffer>,
    images: HashMap<u64, VkImage>,
    image_views: HashMap<u64, vk::ImageView>,
    samplers: HashMap<u64, vk::Sampler>,
    pipelines: HashMap<u64, VkPipeline>,
    descriptor_set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    descriptor_pools: HashMap<u64, vk::DescriptorPool>,
    descriptor_sets: HashMap<u64, VkDescriptorSet>,
    swapchains: HashMap<u64, VkSwapchain>,
    semaphores: HashMap<u64, vk::Semaphore>,
    fences: HashMap<u64, vk::Fence>,
    command_buffers: HashMap<u64, vk::CommandBuffer>,
}

impl DeviceState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn allocator(&mut self) -> BackendResult<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| BackendError::Api("allocator already released".into()))
    }

    fn free_allocation(&mut self, allocation: Allocation) {
        self.allocated_bytes = self.allocated_bytes.saturating_sub(allocation.size());
        if let Some(allocator) = self.allocator.as_mut() {
            if let Err(err) = allocator.free(allocation) {
                log::error!("VulkanDevice: failed to free allocation: {err}");
            }
        }
    }
}

fn lookup<'a, T>(map: &'a HashMap<u64, T>, id: u64, what: &str) -> BackendResult<&'a T> {
    map.get(&id)
        .ok_or_else(|| BackendError::InvalidHandle(format!("{what} {id}")))
}

fn allocation_error(err: AllocationError) -> BackendError {
    match err {
        AllocationError::OutOfMemory => BackendError::OutOfDeviceMemory,
        other => BackendError::Api(other.to_string()),
    }
}

fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

fn subresource_range(aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Native Vulkan device bound to one window surface
pub struct VulkanDevice {
    name: String,
    _window: Arc<Window>,
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    state: Mutex<DeviceState>,
}

impl VulkanDevice {
    /// Create an instance, a surface for `window` and a logical device with
    /// one graphics+present queue.
    pub fn new(window: Arc<Window>, app_name: &str) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::Initialization(e.to_string()))?;

            let app_name = CString::new(app_name)
                .map_err(|e| BackendError::Initialization(e.to_string()))?;
            let engine_name = CStr::from_bytes_with_nul(b"Ember Render\0")
                .map_err(|e| BackendError::Initialization(e.to_string()))?;

            let app_info = vk::ApplicationInfo {
                p_application_name: app_name.as_ptr(),
                application_version: vk::make_api_version(0, 1, 0, 0),
                p_engine_name: engine_name.as_ptr(),
                engine_version: vk::make_api_version(0, 0, 1, 0),
                api_version: vk::API_VERSION_1_3,
                ..Default::default()
            };

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::Initialization(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::Initialization(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(init_error)?
                .to_vec();

            let instance_info = vk::InstanceCreateInfo {
                p_application_info: &app_info,
                enabled_extension_count: extensions.len() as u32,
                pp_enabled_extension_names: extensions.as_ptr(),
                ..Default::default()
            };

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(init_error)?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = match ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            ) {
                Ok(surface) => surface,
                Err(err) => {
                    log::error!("VulkanDevice: surface creation failed: {err}");
                    instance.destroy_instance(None);
                    return Err(BackendError::SurfaceLost);
                }
            };

            let selected = Self::select_physical_device(&instance, &surface_fn, surface);
            let (physical_device, graphics_queue_family) = match selected {
                Some(selected) => selected,
                None => {
                    surface_fn.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                    return Err(BackendError::Initialization(
                        "No Vulkan 1.3 device can present to this surface".into(),
                    ));
                }
            };

            let properties = instance.get_physical_device_properties(physical_device);
            let name = properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "Unknown Vulkan Device".to_string());

            let queue_priorities = [1.0f32];
            let queue_info = vk::DeviceQueueCreateInfo {
                queue_family_index: graphics_queue_family,
                queue_count: 1,
                p_queue_priorities: queue_priorities.as_ptr(),
                ..Default::default()
            };

            let device_extensions = [swapchain::NAME.as_ptr()];
            let device_features = vk::PhysicalDeviceFeatures {
                fill_mode_non_solid: vk::TRUE,
                ..Default::default()
            };
            let mut features13 = vk::PhysicalDeviceVulkan13Features {
                dynamic_rendering: vk::TRUE,
                ..Default::default()
            };

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(std::slice::from_ref(&queue_info))
                .enabled_extension_names(&device_extensions)
                .enabled_features(&device_features)
                .push_next(&mut features13);

            let device = match instance.create_device(physical_device, &device_info, None) {
                Ok(device) => device,
                Err(err) => {
                    surface_fn.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                    return Err(init_error(err));
                }
            };

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);
            let swapchain_fn = swapchain::Device::new(&instance, &device);

            let allocator = match Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            }) {
                Ok(allocator) => allocator,
                Err(err) => {
                    device.destroy_device(None);
                    surface_fn.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                    return Err(BackendError::Initialization(err.to_string()));
                }
            };

            let pool_info = vk::CommandPoolCreateInfo {
                queue_family_index: graphics_queue_family,
                flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
                ..Default::default()
            };
            let command_pool = match device.create_command_pool(&pool_info, None) {
                Ok(pool) => pool,
                Err(err) => {
                    drop(allocator);
                    device.destroy_device(None);
                    surface_fn.destroy_surface(surface, None);
                    instance.destroy_instance(None);
                    return Err(init_error(err));
                }
            };

            log::info!("VulkanDevice: using {name} (queue family {graphics_queue_family})");

            Ok(Self {
                name,
                _window: window,
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                surface,
                physical_device,
                device,
                graphics_queue,
                state: Mutex::new(DeviceState {
                    allocator: Some(allocator),
                    command_pool,
                    ..Default::default()
                }),
            })
        }
    }

    /// Get the Vulkan instance
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Prefers a discrete GPU among devices that support Vulkan 1.3 and can
    /// present to `surface`.
    fn select_physical_device(
        instance: &ash::Instance,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<(vk::PhysicalDevice, u32)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices().ok()? };

        let mut candidates: Vec<_> = physical_devices
            .into_iter()
            .filter_map(|pd| {
                let properties = unsafe { instance.get_physical_device_properties(pd) };
                if properties.api_version < vk::API_VERSION_1_3 {
                    return None;
                }
                let family = Self::find_queue_family(instance, pd, surface_fn, surface)?;
                let discrete = properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
                Some((discrete, pd, family))
            })
            .collect();
        candidates.sort_by_key(|(discrete, _, _)| !discrete);
        candidates.first().map(|&(_, pd, family)| (pd, family))
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        for (index, family) in queue_families.iter().enumerate() {
            let supports_graphics = family
                .queue_flags
                .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };

            if supports_graphics && supports_surface {
                return Some(index as u32);
            }
        }
        None
    }

    fn create_shader_module(&self, spirv: &[u32]) -> BackendResult<vk::ShaderModule> {
        if spirv.is_empty() {
            return Err(BackendError::Unsupported("empty SPIR-V module".into()));
        }
        let info = vk::ShaderModuleCreateInfo::default().code(spirv);
        unsafe {
            self.device
                .create_shader_module(&info, None)
                .map_err(map_vk_error)
        }
    }

    fn create_pipeline_layout(
        &self,
        state: &DeviceState,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constant_size: u32,
        push_stages: vk::ShaderStageFlags,
    ) -> BackendResult<vk::PipelineLayout> {
        let layouts = set_layouts
            .iter()
            .map(|h| lookup(&state.descriptor_set_layouts, h.0, "descriptor set layout").copied())
            .collect::<BackendResult<Vec<_>>>()?;
        let ranges = [vk::PushConstantRange {
            stage_flags: push_stages,
            offset: 0,
            size: push_constant_size,
        }];
        let mut info = vk::PipelineLayoutCreateInfo::default().set_layouts(&layouts);
        if push_constant_size > 0 {
            info = info.push_constant_ranges(&ranges);
        }
        unsafe {
            self.device
                .create_pipeline_layout(&info, None)
                .map_err(map_vk_error)
        }
    }

    fn create_graphics_pipeline(
        &self,
        state: &DeviceState,
        desc: &GraphicsPipelineDescriptor,
    ) -> BackendResult<VkPipeline> {
        let layout = self.create_pipeline_layout(
            state,
            &desc.set_layouts,
            desc.push_constant_size,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        )?;

        let modules = self.create_shader_module(&desc.vertex_spirv).and_then(|vertex| {
            match self.create_shader_module(&desc.fragment_spirv) {
                Ok(fragment) => Ok((vertex, fragment)),
                Err(err) => {
                    unsafe { self.device.destroy_shader_module(vertex, None) };
                    Err(err)
                }
            }
        });
        let (vertex, fragment) = match modules {
            Ok(modules) => modules,
            Err(err) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(err);
            }
        };

        let entry_point = CStr::from_bytes_with_nul(b"main\0")
            .map_err(|e| BackendError::Api(e.to_string()))?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex)
                .name(entry_point),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(entry_point),
        ];

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes = [
            (0, vk::Format::R32G32B32_SFLOAT, 0),
            (1, vk::Format::R32G32B32_SFLOAT, 12),
            (2, vk::Format::R32G32_SFLOAT, 24),
            (3, vk::Format::R32G32B32A32_SFLOAT, 32),
        ]
        .map(|(location, format, offset)| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset,
        });
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(convert_polygon_mode(desc.polygon_mode))
            .cull_mode(convert_cull_mode(desc.cull_mode))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = match desc.depth {
            Some(depth) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(depth.write_enabled)
                .depth_compare_op(convert_compare_op(depth.compare)),
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [convert_format(desc.color_format)];
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(
                desc.depth
                    .map(|depth| convert_format(depth.format))
                    .unwrap_or(vk::Format::UNDEFINED),
            );

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .push_next(&mut rendering);

        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        unsafe {
            self.device.destroy_shader_module(vertex, None);
            self.device.destroy_shader_module(fragment, None);
        }

        match result {
            Ok(pipelines) => Ok(VkPipeline {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, err)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                Err(map_vk_error(err))
            }
        }
    }

    fn create_compute_pipeline(
        &self,
        state: &DeviceState,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<VkPipeline> {
        let layout = self.create_pipeline_layout(
            state,
            &desc.set_layouts,
            desc.push_constant_size,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let module = match self.create_shader_module(&desc.spirv) {
            Ok(module) => module,
            Err(err) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                return Err(err);
            }
        };

        let entry_point = CStr::from_bytes_with_nul(b"main\0")
            .map_err(|e| BackendError::Api(e.to_string()))?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(entry_point);
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let result = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        };
        unsafe { self.device.destroy_shader_module(module, None) };

        match result {
            Ok(pipelines) => Ok(VkPipeline {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, err)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                Err(map_vk_error(err))
            }
        }
    }
}

impl GpuDevice for VulkanDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_fence(&self, signaled: bool) -> BackendResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo {
            flags,
            ..Default::default()
        };
        let fence = unsafe { self.device.create_fence(&info, None).map_err(map_vk_error)? };
        let mut state = self.state.lock();
        let id = state.next_id();
        state.fences.insert(id, fence);
        Ok(FenceHandle(id))
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> BackendResult<bool> {
        let fence = *lookup(&self.state.lock().fences, fence.0, "fence")?;
        let result = unsafe {
            self.device
                .wait_for_fences(&[fence], true, timeout_nanos(timeout))
        };
        match result {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(map_vk_error(err)),
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> BackendResult<()> {
        let fence = *lookup(&self.state.lock().fences, fence.0, "fence")?;
        unsafe { self.device.reset_fences(&[fence]).map_err(map_vk_error) }
    }

    fn create_semaphore(&self) -> BackendResult<SemaphoreHandle> {
        let info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe {
            self.device
                .create_semaphore(&info, None)
                .map_err(map_vk_error)?
        };
        let mut state = self.state.lock();
        let id = state.next_id();
        state.semaphores.insert(id, semaphore);
        Ok(SemaphoreHandle(id))
    }

    fn wait_idle(&self) -> BackendResult<()> {
        // Queue access needs external sync with submit and present.
        let _state = self.state.lock();
        unsafe { self.device.device_wait_idle().map_err(map_vk_error) }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: convert_descriptor_type(b.ty),
                descriptor_count: b.count,
                stage_flags: convert_stages(b.stages),
                ..Default::default()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe {
            self.device
                .create_descriptor_set_layout(&info, None)
                .map_err(map_vk_error)?
        };
        let mut state = self.state.lock();
        let id = state.next_id();
        state.descriptor_set_layouts.insert(id, layout);
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[PoolSize],
    ) -> BackendResult<DescriptorPoolHandle> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .filter(|size| size.count > 0)
            .map(|size| vk::DescriptorPoolSize {
                ty: convert_descriptor_type(size.ty),
                descriptor_count: size.count,
            })
            .collect();
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            self.device
                .create_descriptor_pool(&info, None)
                .map_err(map_vk_error)?
        };
        let mut state = self.state.lock();
        let id = state.next_id();
        state.descriptor_pools.insert(id, pool);
        Ok(DescriptorPoolHandle(id))
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> BackendResult<DescriptorSetHandle> {
        let mut state = self.state.lock();
        let vk_pool = *lookup(&state.descriptor_pools, pool.0, "descriptor pool")?;
        let vk_layout = *lookup(&state.descriptor_set_layouts, layout.0, "descriptor set layout")?;
        let layouts = [vk_layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk_pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&info)
                .map_err(map_vk_error)?
        };
        let set = sets
            .first()
            .copied()
            .ok_or_else(|| BackendError::Api("no descriptor set returned".into()))?;
        let id = state.next_id();
        state
            .descriptor_sets
            .insert(id, VkDescriptorSet { set, pool: pool.0 });
        Ok(DescriptorSetHandle(id))
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> BackendResult<()> {
        let mut state = self.state.lock();
        let vk_pool = *lookup(&state.descriptor_pools, pool.0, "descriptor pool")?;
        unsafe {
            self.device
                .reset_descriptor_pool(vk_pool, vk::DescriptorPoolResetFlags::empty())
                .map_err(map_vk_error)?;
        }
        state.descriptor_sets.retain(|_, set| set.pool != pool.0);
        Ok(())
    }

    fn write_uniform_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        buffer: BufferHandle,
        range: u64,
    ) -> BackendResult<()> {
        let state = self.state.lock();
        let vk_set = lookup(&state.descriptor_sets, set.0, "descriptor set")?.set;
        let vk_buffer = lookup(&state.buffers, buffer.0, "buffer")?.buffer;
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: vk_buffer,
            offset: 0,
            range,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(vk_set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn write_image_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        ty: DescriptorType,
        view: ImageViewHandle,
        sampler: Option<SamplerHandle>,
    ) -> BackendResult<()> {
        let state = self.state.lock();
        let vk_set = lookup(&state.descriptor_sets, set.0, "descriptor set")?.set;
        let vk_view = *lookup(&state.image_views, view.0, "image view")?;
        let (image_layout, vk_sampler) = match ty {
            DescriptorType::StorageImage => (vk::ImageLayout::GENERAL, vk::Sampler::null()),
            DescriptorType::CombinedImageSampler => {
                let sampler = sampler.ok_or_else(|| {
                    BackendError::InvalidHandle("combined image sampler without sampler".into())
                })?;
                (
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    *lookup(&state.samplers, sampler.0, "sampler")?,
                )
            }
            other => {
                return Err(BackendError::Unsupported(format!(
                    "{other:?} is not an image descriptor"
                )))
            }
        };
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk_sampler,
            image_view: vk_view,
            image_layout,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(vk_set)
            .dst_binding(binding)
            .descriptor_type(convert_descriptor_type(ty))
            .image_info(&image_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer_info = vk::BufferCreateInfo {
            size: desc.size,
            usage: convert_buffer_usage(desc.usage),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(map_vk_error)?
        };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let mut state = self.state.lock();
        let allocation = state.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.label.as_deref().unwrap_or("buffer"),
                    requirements,
                    location,
                    linear: true,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(allocation_error)
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };
        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(err) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            state.free_allocation(allocation);
            return Err(map_vk_error(err));
        }

        state.allocated_bytes += allocation.size();
        let id = state.next_id();
        state.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation,
                size: desc.size,
            },
        );
        Ok(BufferHandle(id))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut state = self.state.lock();
        let vk_buffer = state
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        let end = offset + data.len() as u64;
        if end > vk_buffer.size {
            return Err(BackendError::Api(format!(
                "write of {} bytes at {offset} overflows buffer of {} bytes",
                data.len(),
                vk_buffer.size
            )));
        }
        let mapped = vk_buffer
            .allocation
            .mapped_slice_mut()
            .ok_or_else(|| BackendError::Unsupported("buffer is not host visible".into()))?;
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        let format = convert_format(desc.format);
        let extent = vk::Extent2D {
            width: desc.extent.width,
            height: desc.extent.height,
        };
        let image_info = vk::ImageCreateInfo {
            image_type: vk::ImageType::TYPE_2D,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            format,
            tiling: vk::ImageTiling::OPTIMAL,
            initial_layout: vk::ImageLayout::UNDEFINED,
            usage: convert_image_usage(desc.usage),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            samples: vk::SampleCountFlags::TYPE_1,
            ..Default::default()
        };
        let image = unsafe {
            self.device
                .create_image(&image_info, None)
                .map_err(map_vk_error)?
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let mut state = self.state.lock();
        let allocation = state.allocator().and_then(|allocator| {
            allocator
                .allocate(&AllocationCreateDesc {
                    name: desc.label.as_deref().unwrap_or("image"),
                    requirements,
                    location: MemoryLocation::GpuOnly,
                    linear: false,
                    allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                })
                .map_err(allocation_error)
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };
        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(err) = bound {
            unsafe { self.device.destroy_image(image, None) };
            state.free_allocation(allocation);
            return Err(map_vk_error(err));
        }

        state.allocated_bytes += allocation.size();
        let id = state.next_id();
        state.images.insert(
            id,
            VkImage {
                image,
                allocation: Some(allocation),
                format,
                extent,
            },
        );
        Ok(ImageHandle(id))
    }

    fn create_image_view(
        &self,
        image: ImageHandle,
        format: TextureFormat,
    ) -> BackendResult<ImageViewHandle> {
        let mut state = self.state.lock();
        let vk_image = lookup(&state.images, image.0, "image")?;
        let aspect_mask = if format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let view_info = vk::ImageViewCreateInfo {
            image: vk_image.image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: vk_image.format,
            components: vk::ComponentMapping::default(),
            subresource_range: subresource_range(aspect_mask),
            ..Default::default()
        };
        let view = unsafe {
            self.device
                .create_image_view(&view_info, None)
                .map_err(map_vk_error)?
        };
        let id = state.next_id();
        state.image_views.insert(id, view);
        Ok(ImageViewHandle(id))
    }

    fn create_sampler(&self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let address_mode = convert_address_mode(desc.address_mode);
        let sampler_info = vk::SamplerCreateInfo {
            mag_filter: convert_filter(desc.mag_filter),
            min_filter: convert_filter(desc.min_filter),
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: address_mode,
            address_mode_v: address_mode,
            address_mode_w: address_mode,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_OPAQUE_BLACK,
            ..Default::default()
        };
        let sampler = unsafe {
            self.device
                .create_sampler(&sampler_info, None)
                .map_err(map_vk_error)?
        };
        let mut state = self.state.lock();
        let id = state.next_id();
        state.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_pipeline(&self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        let mut state = self.state.lock();
        let pipeline = match desc {
            PipelineDescriptor::Graphics(graphics) => {
                self.create_graphics_pipeline(&state, graphics)?
            }
            PipelineDescriptor::Compute(compute) => self.create_compute_pipeline(&state, compute)?,
        };
        log::debug!("VulkanDevice: created pipeline '{}'", desc.label());
        let id = state.next_id();
        state.pipelines.insert(id, pipeline);
        Ok(PipelineHandle(id))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if let Some(vk_buffer) = state.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(vk_buffer.buffer, None) };
            state.free_allocation(vk_buffer.allocation);
        }
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut state = self.state.lock();
        match state.images.get(&image.0) {
            Some(vk_image) if vk_image.allocation.is_none() => {
                log::warn!("VulkanDevice: image {} belongs to a swapchain", image.0);
            }
            Some(_) => {
                if let Some(vk_image) = state.images.remove(&image.0) {
                    unsafe { self.device.destroy_image(vk_image.image, None) };
                    if let Some(allocation) = vk_image.allocation {
                        state.free_allocation(allocation);
                    }
                }
            }
            None => {}
        }
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        if let Some(view) = self.state.lock().image_views.remove(&view.0) {
            unsafe { self.device.destroy_image_view(view, None) };
        }
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        if let Some(sampler) = self.state.lock().samplers.remove(&sampler.0) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        if let Some(pipeline) = self.state.lock().pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
        }
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state.lock();
        if let Some(vk_pool) = state.descriptor_pools.remove(&pool.0) {
            unsafe { self.device.destroy_descriptor_pool(vk_pool, None) };
            state.descriptor_sets.retain(|_, set| set.pool != pool.0);
        }
    }

    fn destroy_descriptor_set_layout(&self, layout: DescriptorSetLayoutHandle) {
        if let Some(layout) = self.state.lock().descriptor_set_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        if let Some(fence) = self.state.lock().fences.remove(&fence.0) {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        if let Some(semaphore) = self.state.lock().semaphores.remove(&semaphore.0) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut state = self.state.lock();
        if let Some(vk_swapchain) = state.swapchains.remove(&swapchain.0) {
            for image in &vk_swapchain.images {
                state.images.remove(image);
            }
            unsafe {
                self.swapchain_fn
                    .destroy_swapchain(vk_swapchain.swapchain, None)
            };
        }
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let mut state = self.state.lock();
        if let Some(cmd) = state.command_buffers.remove(&command_buffer.0) {
            unsafe {
                self.device
                    .free_command_buffers(state.command_pool, &[cmd])
            };
        }
    }

    fn surface_capabilities(&self) -> BackendResult<SurfaceCapabilities> {
        unsafe {
            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(map_vk_error)?;
            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(map_vk_error)?;
            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(map_vk_error)?;

            let current_extent = if capabilities.current_extent.width != u32::MAX {
                Some(Extent2d::new(
                    capabilities.current_extent.width,
                    capabilities.current_extent.height,
                ))
            } else {
                None
            };

            Ok(SurfaceCapabilities {
                formats: formats
                    .iter()
                    .filter(|f| f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
                    .filter_map(|f| convert_format_back(f.format))
                    .collect(),
                present_modes: present_modes
                    .into_iter()
                    .filter_map(convert_present_mode_back)
                    .collect(),
                current_extent,
                min_extent: Extent2d::new(
                    capabilities.min_image_extent.width,
                    capabilities.min_image_extent.height,
                ),
                max_extent: Extent2d::new(
                    capabilities.max_image_extent.width,
                    capabilities.max_image_extent.height,
                ),
                min_image_count: capabilities.min_image_count,
                max_image_count: capabilities.max_image_count,
            })
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDescriptor) -> BackendResult<SwapchainHandle> {
        let capabilities = unsafe {
            self.surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(map_vk_error)?
        };

        let mut state = self.state.lock();
        let old_swapchain = match desc.old_swapchain {
            Some(old) => lookup(&state.swapchains, old.0, "swapchain")?.swapchain,
            None => vk::SwapchainKHR::null(),
        };

        let format = convert_format(desc.format);
        let extent = vk::Extent2D {
            width: desc.extent.width,
            height: desc.extent.height,
        };
        let swapchain_info = vk::SwapchainCreateInfoKHR {
            surface: self.surface,
            min_image_count: desc.image_count,
            image_format: format,
            image_color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: capabilities.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: convert_present_mode(desc.present_mode),
            clipped: vk::TRUE,
            old_swapchain,
            ..Default::default()
        };

        let swapchain = unsafe {
            self.swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(map_vk_error)?
        };
        let vk_images = match unsafe { self.swapchain_fn.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { self.swapchain_fn.destroy_swapchain(swapchain, None) };
                return Err(map_vk_error(err));
            }
        };

        let mut images = Vec::with_capacity(vk_images.len());
        for image in vk_images {
            let id = state.next_id();
            state.images.insert(
                id,
                VkImage {
                    image,
                    allocation: None,
                    format,
                    extent,
                },
            );
            images.push(id);
        }

        let id = state.next_id();
        state
            .swapchains
            .insert(id, VkSwapchain { swapchain, images });
        Ok(SwapchainHandle(id))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> BackendResult<Vec<ImageHandle>> {
        let state = self.state.lock();
        let vk_swapchain = lookup(&state.swapchains, swapchain.0, "swapchain")?;
        Ok(vk_swapchain.images.iter().copied().map(ImageHandle).collect())
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
        fence: Option<FenceHandle>,
    ) -> BackendResult<(u32, bool)> {
        let (vk_swapchain, vk_semaphore, vk_fence) = {
            let state = self.state.lock();
            let vk_fence = match fence {
                Some(fence) => *lookup(&state.fences, fence.0, "fence")?,
                None => vk::Fence::null(),
            };
            (
                lookup(&state.swapchains, swapchain.0, "swapchain")?.swapchain,
                *lookup(&state.semaphores, signal.0, "semaphore")?,
                vk_fence,
            )
        };
        unsafe {
            self.swapchain_fn
                .acquire_next_image(vk_swapchain, u64::MAX, vk_semaphore, vk_fence)
                .map_err(map_vk_error)
        }
    }

    fn queue_present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> BackendResult<bool> {
        let state = self.state.lock();
        let swapchains = [lookup(&state.swapchains, swapchain.0, "swapchain")?.swapchain];
        let wait_semaphores = [*lookup(&state.semaphores, wait.0, "semaphore")?];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        unsafe {
            self.swapchain_fn
                .queue_present(self.graphics_queue, &present_info)
                .map_err(map_vk_error)
        }
    }

    fn allocate_command_buffer(&self) -> BackendResult<CommandBufferHandle> {
        let mut state = self.state.lock();
        let alloc_info = vk::CommandBufferAllocateInfo {
            command_pool: state.command_pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let buffers = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(map_vk_error)?
        };
        let cmd = buffers
            .first()
            .copied()
            .ok_or_else(|| BackendError::Api("no command buffer returned".into()))?;
        let id = state.next_id();
        state.command_buffers.insert(id, cmd);
        Ok(CommandBufferHandle(id))
    }

    fn begin_commands(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let state = self.state.lock();
        let vk_cmd = *lookup(&state.command_buffers, cmd.0, "command buffer")?;
        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            self.device
                .reset_command_buffer(vk_cmd, vk::CommandBufferResetFlags::empty())
                .map_err(map_vk_error)?;
            self.device
                .begin_command_buffer(vk_cmd, &begin_info)
                .map_err(map_vk_error)
        }
    }

    fn end_commands(&self, cmd: CommandBufferHandle) -> BackendResult<()> {
        let state = self.state.lock();
        let vk_cmd = *lookup(&state.command_buffers, cmd.0, "command buffer")?;
        unsafe { self.device.end_command_buffer(vk_cmd).map_err(map_vk_error) }
    }

    fn cmd_begin_pass(&self, cmd: CommandBufferHandle, pass: &PassDescriptor) {
        let state = self.state.lock();
        let (Some(&vk_cmd), Some(&color_view)) = (
            state.command_buffers.get(&cmd.0),
            state.image_views.get(&pass.color.0),
        ) else {
            log::warn!("VulkanDevice: pass '{}' uses an unknown handle", pass.label);
            return;
        };

        let color_attachments = [vk::RenderingAttachmentInfo::default()
            .image_view(color_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(if pass.clear_color.is_some() {
                vk::AttachmentLoadOp::CLEAR
            } else {
                vk::AttachmentLoadOp::LOAD
            })
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: pass.clear_color.unwrap_or([0.0; 4]),
                },
            })];

        let depth_attachment = pass
            .depth
            .and_then(|depth| state.image_views.get(&depth.0).copied())
            .map(|depth_view| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(depth_view)
                    .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                    .load_op(if pass.clear_depth.is_some() {
                        vk::AttachmentLoadOp::CLEAR
                    } else {
                        vk::AttachmentLoadOp::LOAD
                    })
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: pass.clear_depth.unwrap_or(1.0),
                            stencil: 0,
                        },
                    })
            });

        let extent = vk::Extent2D {
            width: pass.extent.width,
            height: pass.extent.height,
        };
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.cmd_begin_rendering(vk_cmd, &rendering_info);
            self.device.cmd_set_viewport(vk_cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(vk_cmd, 0, &[render_area]);
        }
    }

    fn cmd_end_pass(&self, cmd: CommandBufferHandle) {
        if let Some(&vk_cmd) = self.state.lock().command_buffers.get(&cmd.0) {
            unsafe { self.device.cmd_end_rendering(vk_cmd) };
        }
    }

    fn cmd_bind_pipeline(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        let state = self.state.lock();
        if let (Some(&vk_cmd), Some(vk_pipeline)) = (
            state.command_buffers.get(&cmd.0),
            state.pipelines.get(&pipeline.0),
        ) {
            unsafe {
                self.device.cmd_bind_pipeline(
                    vk_cmd,
                    convert_bind_point(bind_point),
                    vk_pipeline.pipeline,
                )
            };
        }
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferHandle,
        bind_point: PipelineBindPoint,
        pipeline: PipelineHandle,
        index: u32,
        set: DescriptorSetHandle,
    ) {
        let state = self.state.lock();
        if let (Some(&vk_cmd), Some(vk_pipeline), Some(vk_set)) = (
            state.command_buffers.get(&cmd.0),
            state.pipelines.get(&pipeline.0),
            state.descriptor_sets.get(&set.0),
        ) {
            unsafe {
                self.device.cmd_bind_descriptor_sets(
                    vk_cmd,
                    convert_bind_point(bind_point),
                    vk_pipeline.layout,
                    index,
                    &[vk_set.set],
                    &[],
                )
            };
        }
    }

    fn cmd_push_constants(
        &self,
        cmd: CommandBufferHandle,
        pipeline: PipelineHandle,
        stages: ShaderStages,
        data: &[u8],
    ) {
        let state = self.state.lock();
        if let (Some(&vk_cmd), Some(vk_pipeline)) = (
            state.command_buffers.get(&cmd.0),
            state.pipelines.get(&pipeline.0),
        ) {
            unsafe {
                self.device.cmd_push_constants(
                    vk_cmd,
                    vk_pipeline.layout,
                    convert_stages(stages),
                    0,
                    data,
                )
            };
        }
    }

    fn cmd_draw_indexed(&self, cmd: CommandBufferHandle, draw: &IndexedDraw) {
        let state = self.state.lock();
        if let (Some(&vk_cmd), Some(vertex), Some(index)) = (
            state.command_buffers.get(&cmd.0),
            state.buffers.get(&draw.vertex_buffer.0),
            state.buffers.get(&draw.index_buffer.0),
        ) {
            unsafe {
                self.device
                    .cmd_bind_vertex_buffers(vk_cmd, 0, &[vertex.buffer], &[0]);
                self.device
                    .cmd_bind_index_buffer(vk_cmd, index.buffer, 0, vk::IndexType::UINT32);
                self.device
                    .cmd_draw_indexed(vk_cmd, draw.index_count, 1, 0, 0, 0);
            }
        }
    }

    fn cmd_dispatch(&self, cmd: CommandBufferHandle, x: u32, y: u32, z: u32) {
        if let Some(&vk_cmd) = self.state.lock().command_buffers.get(&cmd.0) {
            unsafe { self.device.cmd_dispatch(vk_cmd, x, y, z) };
        }
    }

    fn cmd_image_barrier(&self, cmd: CommandBufferHandle, barrier: &ImageBarrier) {
        let state = self.state.lock();
        let (Some(&vk_cmd), Some(vk_image)) = (
            state.command_buffers.get(&cmd.0),
            state.images.get(&barrier.image.0),
        ) else {
            return;
        };
        let (old_layout, src_access, src_stage) = layout_access(barrier.old_layout);
        let (new_layout, dst_access, dst_stage) = layout_access(barrier.new_layout);
        let aspect_mask = if barrier.depth {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let image_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(vk_image.image)
            .subresource_range(subresource_range(aspect_mask));
        unsafe {
            self.device.cmd_pipeline_barrier(
                vk_cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[image_barrier],
            )
        };
    }

    fn cmd_blit_image(
        &self,
        cmd: CommandBufferHandle,
        src: ImageHandle,
        src_extent: Extent2d,
        dst: ImageHandle,
        dst_extent: Extent2d,
    ) {
        let state = self.state.lock();
        let (Some(&vk_cmd), Some(src_image), Some(dst_image)) = (
            state.command_buffers.get(&cmd.0),
            state.images.get(&src.0),
            state.images.get(&dst.0),
        ) else {
            return;
        };
        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let corner = |extent: Extent2d| vk::Offset3D {
            x: extent.width as i32,
            y: extent.height as i32,
            z: 1,
        };
        let region = vk::ImageBlit {
            src_subresource: layers,
            src_offsets: [vk::Offset3D::default(), corner(src_extent)],
            dst_subresource: layers,
            dst_offsets: [vk::Offset3D::default(), corner(dst_extent)],
        };
        log::trace!(
            "VulkanDevice: blit {}x{} -> {}x{}",
            src_image.extent.width,
            src_image.extent.height,
            dst_image.extent.width,
            dst_image.extent.height
        );
        unsafe {
            self.device.cmd_blit_image(
                vk_cmd,
                src_image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
                vk::Filter::LINEAR,
            )
        };
    }

    fn submit(&self, info: &SubmitInfo) -> BackendResult<()> {
        let state = self.state.lock();
        let command_buffers = [*lookup(&state.command_buffers, info.command_buffer.0, "command buffer")?];
        let wait_semaphores = match info.wait_semaphore {
            Some(semaphore) => vec![*lookup(&state.semaphores, semaphore.0, "semaphore")?],
            None => Vec::new(),
        };
        let wait_stages = vec![
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER;
            wait_semaphores.len()
        ];
        let signal_semaphores = match info.signal_semaphore {
            Some(semaphore) => vec![*lookup(&state.semaphores, semaphore.0, "semaphore")?],
            None => Vec::new(),
        };
        let fence = match info.fence {
            Some(fence) => *lookup(&state.fences, fence.0, "fence")?,
            None => vk::Fence::null(),
        };

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
                .map_err(map_vk_error)
        }
    }

    fn memory_usage(&self) -> u64 {
        self.state.lock().allocated_bytes
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let state = self.state.get_mut();

            for (_, buffer) in state.buffers.drain() {
                self.device.destroy_buffer(buffer.buffer, None);
                if let Some(allocator) = state.allocator.as_mut() {
                    let _ = allocator.free(buffer.allocation);
                }
            }
            for (_, image) in state.images.drain() {
                if let Some(allocation) = image.allocation {
                    self.device.destroy_image(image.image, None);
                    if let Some(allocator) = state.allocator.as_mut() {
                        let _ = allocator.free(allocation);
                    }
                }
            }

            // Drop the allocator before destroying the device
            drop(state.allocator.take());

            for (_, view) in state.image_views.drain() {
                self.device.destroy_image_view(view, None);
            }
            for (_, sampler) in state.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, pipeline) in state.pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }
            state.descriptor_sets.clear();
            for (_, pool) in state.descriptor_pools.drain() {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, layout) in state.descriptor_set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            for (_, semaphore) in state.semaphores.drain() {
                self.device.destroy_semaphore(semaphore, None);
            }
            for (_, fence) in state.fences.drain() {
                self.device.destroy_fence(fence, None);
            }
            state.command_buffers.clear();
            self.device.destroy_command_pool(state.command_pool, None);

            for (_, swapchain) in state.swapchains.drain() {
                self.swapchain_fn.destroy_swapchain(swapchain.swapchain, None);
            }

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}
