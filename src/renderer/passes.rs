//! Pipelines and pass recording for the offscreen scene render.
//!
//! ```text
//!  offscreen pass ──► [compute debug] ──► blit to swapchain image
//!  ┌──────────────────────────────┐
//!  │ Default │ Pbr │ Wireframe │ Outline(selected) │
//!  └──────────────────────────────┘
//! ```

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::backend::{
    CommandBufferHandle, CompareFunction, ComputePipelineDescriptor, CullMode, DepthState,
    DescriptorBinding, DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorType,
    GpuDevice, GraphicsPipelineDescriptor, IndexedDraw, PipelineBindPoint, PipelineDescriptor,
    PipelineHandle, PolygonMode, ShaderStages,
};
use crate::config::ShaderSet;
use crate::deletion_queue::{DeletionQueue, DeletionTask};
use crate::error::{GraphicsError, GraphicsResult};
use crate::renderer::frame::{OFFSCREEN_COLOR_FORMAT, OFFSCREEN_DEPTH_FORMAT};
use crate::renderer::registry::DrawQueue;
use crate::renderer::stats::RenderStats;
use crate::resources::ShadingModel;

/// Workgroup edge of the compute debug shader.
pub const COMPUTE_TILE_SIZE: u32 = 16;

/// Color the selection outline is drawn with.
pub const OUTLINE_COLOR: Vec4 = Vec4::new(1.0, 0.6, 0.1, 1.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Default,
    Pbr,
    Wireframe,
    Outline,
    ComputeDebug,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 5] = [
        PipelineKind::Default,
        PipelineKind::Pbr,
        PipelineKind::Wireframe,
        PipelineKind::Outline,
        PipelineKind::ComputeDebug,
    ];

    pub fn for_shading(shading: ShadingModel) -> Self {
        match shading {
            ShadingModel::Default => PipelineKind::Default,
            ShadingModel::Pbr => PipelineKind::Pbr,
            ShadingModel::Wireframe => PipelineKind::Wireframe,
        }
    }

    pub fn bind_point(self) -> PipelineBindPoint {
        match self {
            PipelineKind::ComputeDebug => PipelineBindPoint::Compute,
            _ => PipelineBindPoint::Graphics,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PipelineKind::Default => "default",
            PipelineKind::Pbr => "pbr",
            PipelineKind::Wireframe => "wireframe",
            PipelineKind::Outline => "outline",
            PipelineKind::ComputeDebug => "compute debug",
        }
    }
}

/// Per-draw push constants
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawPushConstants {
    pub model: Mat4,
    pub color: Vec4,
}

const DRAW_PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<DrawPushConstants>() as u32;

/// Descriptor set layouts shared by every pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetLayouts {
    /// Set 0: frame uniform (camera and lights)
    pub frame: DescriptorSetLayoutHandle,
    /// Set 1 of graphics pipelines: material uniform
    pub material: DescriptorSetLayoutHandle,
    /// Set 1 of the compute pipeline: offscreen color (storage) and depth
    pub compute: DescriptorSetLayoutHandle,
}

impl SetLayouts {
    /// Each layout is pushed onto `queue` as soon as it exists.
    pub fn create(device: &dyn GpuDevice, queue: &DeletionQueue) -> GraphicsResult<Self> {
        let frame = device
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::UniformBuffer,
                count: 1,
                stages: ShaderStages::VERTEX_FRAGMENT | ShaderStages::COMPUTE,
            }])
            .map_err(GraphicsError::creation("frame set layout"))?;
        queue.push(DeletionTask::DescriptorSetLayout(frame));

        let material = device
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::UniformBuffer,
                count: 1,
                stages: ShaderStages::FRAGMENT,
            }])
            .map_err(GraphicsError::creation("material set layout"))?;
        queue.push(DeletionTask::DescriptorSetLayout(material));

        let compute = device
            .create_descriptor_set_layout(&[
                DescriptorBinding {
                    binding: 0,
                    ty: DescriptorType::StorageImage,
                    count: 1,
                    stages: ShaderStages::COMPUTE,
                },
                DescriptorBinding {
                    binding: 1,
                    ty: DescriptorType::CombinedImageSampler,
                    count: 1,
                    stages: ShaderStages::COMPUTE,
                },
            ])
            .map_err(GraphicsError::creation("compute set layout"))?;
        queue.push(DeletionTask::DescriptorSetLayout(compute));

        Ok(Self {
            frame,
            material,
            compute,
        })
    }
}

/// One pipeline per [`PipelineKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipelines {
    pub default: PipelineHandle,
    pub pbr: PipelineHandle,
    pub wireframe: PipelineHandle,
    pub outline: PipelineHandle,
    pub compute_debug: PipelineHandle,
}

impl Pipelines {
    pub fn create(
        device: &dyn GpuDevice,
        layouts: &SetLayouts,
        shaders: &ShaderSet,
        queue: &DeletionQueue,
    ) -> GraphicsResult<Self> {
        let build = |kind: PipelineKind| -> GraphicsResult<PipelineHandle> {
            let desc = pipeline_descriptor(kind, layouts, shaders);
            let pipeline = device
                .create_pipeline(&desc)
                .map_err(GraphicsError::creation("pipeline"))?;
            queue.push(DeletionTask::Pipeline(pipeline));
            log::debug!("Pipelines: created {} pipeline", kind.label());
            Ok(pipeline)
        };

        Ok(Self {
            default: build(PipelineKind::Default)?,
            pbr: build(PipelineKind::Pbr)?,
            wireframe: build(PipelineKind::Wireframe)?,
            outline: build(PipelineKind::Outline)?,
            compute_debug: build(PipelineKind::ComputeDebug)?,
        })
    }

    pub fn get(&self, kind: PipelineKind) -> PipelineHandle {
        match kind {
            PipelineKind::Default => self.default,
            PipelineKind::Pbr => self.pbr,
            PipelineKind::Wireframe => self.wireframe,
            PipelineKind::Outline => self.outline,
            PipelineKind::ComputeDebug => self.compute_debug,
        }
    }
}

fn pipeline_descriptor(
    kind: PipelineKind,
    layouts: &SetLayouts,
    shaders: &ShaderSet,
) -> PipelineDescriptor {
    if kind == PipelineKind::ComputeDebug {
        return PipelineDescriptor::Compute(ComputePipelineDescriptor {
            label: kind.label().to_string(),
            spirv: shaders.compute_debug.clone(),
            set_layouts: vec![layouts.frame, layouts.compute],
            push_constant_size: 0,
        });
    }

    let (vertex, fragment) = match kind {
        PipelineKind::Pbr => (&shaders.mesh_vertex, &shaders.pbr_fragment),
        PipelineKind::Wireframe => (&shaders.mesh_vertex, &shaders.wireframe_fragment),
        PipelineKind::Outline => (&shaders.outline_vertex, &shaders.outline_fragment),
        _ => (&shaders.mesh_vertex, &shaders.default_fragment),
    };

    PipelineDescriptor::Graphics(GraphicsPipelineDescriptor {
        label: kind.label().to_string(),
        vertex_spirv: vertex.clone(),
        fragment_spirv: fragment.clone(),
        set_layouts: vec![layouts.frame, layouts.material],
        push_constant_size: DRAW_PUSH_CONSTANT_SIZE,
        polygon_mode: if kind == PipelineKind::Wireframe {
            PolygonMode::Line
        } else {
            PolygonMode::Fill
        },
        // The outline is the back faces of an extruded hull.
        cull_mode: if kind == PipelineKind::Outline {
            CullMode::Front
        } else {
            CullMode::Back
        },
        color_format: OFFSCREEN_COLOR_FORMAT,
        depth: Some(DepthState {
            format: OFFSCREEN_DEPTH_FORMAT,
            write_enabled: kind != PipelineKind::Outline,
            compare: CompareFunction::LessEqual,
        }),
    })
}

/// Draw ids grouped by pipeline, each bucket in id order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrawBuckets {
    pub default: Vec<u64>,
    pub pbr: Vec<u64>,
    pub wireframe: Vec<u64>,
    /// Only the selected entity gets an outline.
    pub outline: Option<u64>,
}

impl DrawBuckets {
    pub fn build(draws: &DrawQueue, selected: Option<u64>) -> Self {
        let mut buckets = Self::default();
        for (id, entry) in draws.iter() {
            match PipelineKind::for_shading(entry.material.shading) {
                PipelineKind::Pbr => buckets.pbr.push(id),
                PipelineKind::Wireframe => buckets.wireframe.push(id),
                _ => buckets.default.push(id),
            }
        }
        buckets.outline = selected.filter(|id| draws.contains(*id));
        buckets
    }

    /// Buckets in recording order.
    pub fn ordered(&self) -> [(PipelineKind, &[u64]); 4] {
        [
            (PipelineKind::Default, self.default.as_slice()),
            (PipelineKind::Pbr, self.pbr.as_slice()),
            (PipelineKind::Wireframe, self.wireframe.as_slice()),
            (PipelineKind::Outline, self.outline.as_slice()),
        ]
    }
}

/// Record every bucket into the open offscreen pass.
pub(crate) fn record_draws(
    device: &dyn GpuDevice,
    cmd: CommandBufferHandle,
    pipelines: &Pipelines,
    frame_set: DescriptorSetHandle,
    draws: &mut DrawQueue,
    buckets: &DrawBuckets,
    stats: &mut RenderStats,
) {
    for (kind, ids) in buckets.ordered() {
        if ids.is_empty() {
            continue;
        }
        let pipeline = pipelines.get(kind);
        device.cmd_bind_pipeline(cmd, PipelineBindPoint::Graphics, pipeline);
        device.cmd_bind_descriptor_set(cmd, PipelineBindPoint::Graphics, pipeline, 0, frame_set);

        for id in ids {
            let Some(entry) = draws.get_mut(*id) else {
                continue;
            };
            device.cmd_bind_descriptor_set(
                cmd,
                PipelineBindPoint::Graphics,
                pipeline,
                1,
                entry.material.descriptor_set,
            );
            let push = DrawPushConstants {
                model: entry.transform,
                color: if kind == PipelineKind::Outline {
                    OUTLINE_COLOR
                } else {
                    Vec4::ONE
                },
            };
            device.cmd_push_constants(
                cmd,
                pipeline,
                ShaderStages::VERTEX_FRAGMENT,
                bytemuck::bytes_of(&push),
            );
            device.cmd_draw_indexed(
                cmd,
                &IndexedDraw {
                    vertex_buffer: entry.mesh.vertex_buffer,
                    index_buffer: entry.mesh.index_buffer,
                    index_count: entry.mesh.index_count,
                },
            );
            entry.rendered = true;
            stats.record_draw(entry.mesh.vertex_count, entry.mesh.index_count);
        }
    }
}

/// Workgroup counts covering `width` x `height` pixels.
pub fn dispatch_size(width: u32, height: u32) -> (u32, u32, u32) {
    (
        width.div_ceil(COMPUTE_TILE_SIZE),
        height.div_ceil(COMPUTE_TILE_SIZE),
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyDevice;

    #[test]
    fn test_dispatch_covers_partial_tiles() {
        assert_eq!(dispatch_size(1920, 1080), (120, 68, 1));
        assert_eq!(dispatch_size(16, 16), (1, 1, 1));
        assert_eq!(dispatch_size(17, 1), (2, 1, 1));
    }

    #[test]
    fn test_push_constant_size() {
        assert_eq!(DRAW_PUSH_CONSTANT_SIZE, 80);
    }

    #[test]
    fn test_pipeline_descriptors() {
        let device = DummyDevice::new();
        let queue = DeletionQueue::new();
        let layouts = SetLayouts::create(&device, &queue).unwrap();
        let shaders = ShaderSet::default();

        match pipeline_descriptor(PipelineKind::Wireframe, &layouts, &shaders) {
            PipelineDescriptor::Graphics(desc) => {
                assert_eq!(desc.polygon_mode, PolygonMode::Line);
                assert_eq!(desc.set_layouts, vec![layouts.frame, layouts.material]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match pipeline_descriptor(PipelineKind::Outline, &layouts, &shaders) {
            PipelineDescriptor::Graphics(desc) => assert_eq!(desc.cull_mode, CullMode::Front),
            other => panic!("unexpected {other:?}"),
        }
        let compute = pipeline_descriptor(PipelineKind::ComputeDebug, &layouts, &shaders);
        assert_eq!(compute.bind_point(), PipelineBindPoint::Compute);

        queue.flush(&device);
    }

    #[test]
    fn test_pipelines_pushed_in_creation_order() {
        let device = DummyDevice::new();
        let queue = DeletionQueue::new();
        let layouts = SetLayouts::create(&device, &queue).unwrap();
        let pipelines =
            Pipelines::create(&device, &layouts, &ShaderSet::default(), &queue).unwrap();

        let pending = queue.pending();
        assert_eq!(pending.len(), 3 + PipelineKind::ALL.len());
        assert_eq!(
            pending.last(),
            Some(&DeletionTask::Pipeline(pipelines.compute_debug))
        );
        queue.flush(&device);
    }
}
