//! Plain-data descriptors shared between backends

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

use crate::backend::traits::{
    BufferHandle, CommandBufferHandle, DescriptorSetLayoutHandle, FenceHandle, ImageHandle,
    ImageViewHandle, SemaphoreHandle, SwapchainHandle,
};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
        }
    }
}

bitflags! {
    /// Usage flags for images.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_ATTACHMENT = 1 << 5;
    }
}

bitflags! {
    /// Usage flags for buffers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

bitflags! {
    /// Shader stages that can see a binding or push constant range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

/// Width and height of a surface, image or pass in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimized window reports a zero-area framebuffer.
    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn clamp(self, min: Extent2d, max: Extent2d) -> Self {
        Self {
            width: self.width.clamp(min.width, max.width.max(min.width)),
            height: self.height.clamp(min.height, max.height.max(min.height)),
        }
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Presentation mode of a swapchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// No vsync, tearing possible
    Immediate,
    /// Low-latency triple buffering
    Mailbox,
    /// Vsync, always supported
    Fifo,
    FifoRelaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    StorageBuffer,
    CombinedImageSampler,
    StorageImage,
}

/// One binding slot of a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Number of descriptors of one type a pool can hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub ty: DescriptorType,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub size: u64,
    pub usage: BufferUsage,
    /// Host-visible memory that `write_buffer` can map.
    pub host_visible: bool,
}

#[derive(Debug, Clone)]
pub struct ImageDescriptor {
    pub label: Option<String>,
    pub extent: Extent2d,
    pub format: TextureFormat,
    pub usage: ImageUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub address_mode: AddressMode,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolygonMode {
    Fill,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Less,
    LessEqual,
    Greater,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    pub format: TextureFormat,
    pub write_enabled: bool,
    pub compare: CompareFunction,
}

/// Graphics pipeline built from pre-compiled SPIR-V
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDescriptor {
    pub label: String,
    pub vertex_spirv: Vec<u32>,
    pub fragment_spirv: Vec<u32>,
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constant_size: u32,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub color_format: TextureFormat,
    pub depth: Option<DepthState>,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: String,
    pub spirv: Vec<u32>,
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constant_size: u32,
}

#[derive(Debug, Clone)]
pub enum PipelineDescriptor {
    Graphics(GraphicsPipelineDescriptor),
    Compute(ComputePipelineDescriptor),
}

impl PipelineDescriptor {
    pub fn label(&self) -> &str {
        match self {
            PipelineDescriptor::Graphics(desc) => &desc.label,
            PipelineDescriptor::Compute(desc) => &desc.label,
        }
    }

    pub fn bind_point(&self) -> PipelineBindPoint {
        match self {
            PipelineDescriptor::Graphics(_) => PipelineBindPoint::Graphics,
            PipelineDescriptor::Compute(_) => PipelineBindPoint::Compute,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

/// What the presentation surface supports right now
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    pub formats: Vec<TextureFormat>,
    pub present_modes: Vec<PresentMode>,
    /// `None` when the platform lets the swapchain pick the extent.
    pub current_extent: Option<Extent2d>,
    pub min_extent: Extent2d,
    pub max_extent: Extent2d,
    pub min_image_count: u32,
    /// Zero means no upper bound.
    pub max_image_count: u32,
}

#[derive(Debug, Clone)]
pub struct SwapchainDescriptor {
    pub format: TextureFormat,
    pub extent: Extent2d,
    pub present_mode: PresentMode,
    pub image_count: u32,
    /// Chained into creation so in-flight presentation can finish.
    pub old_swapchain: Option<SwapchainHandle>,
}

/// Attachments and clear values of a dynamic rendering pass
#[derive(Debug, Clone)]
pub struct PassDescriptor {
    pub label: &'static str,
    pub color: ImageViewHandle,
    pub depth: Option<ImageViewHandle>,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
    pub extent: Extent2d,
}

/// Layout an image is in between commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    ColorAttachment,
    DepthAttachment,
    /// Storage image access from compute
    General,
    DepthReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub depth: bool,
}

impl ImageBarrier {
    pub fn color(image: ImageHandle, old_layout: ImageLayout, new_layout: ImageLayout) -> Self {
        Self {
            image,
            old_layout,
            new_layout,
            depth: false,
        }
    }

    pub fn depth(image: ImageHandle, old_layout: ImageLayout, new_layout: ImageLayout) -> Self {
        Self {
            image,
            old_layout,
            new_layout,
            depth: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedDraw {
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitInfo {
    pub command_buffer: CommandBufferHandle,
    pub wait_semaphore: Option<SemaphoreHandle>,
    pub signal_semaphore: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

/// Standard vertex with position, normal, UV, and tangent
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
            tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
        }
    }
}
