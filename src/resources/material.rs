//! Material definitions and their GPU counterpart

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::backend::{BufferHandle, DescriptorSetHandle};
use crate::deletion_queue::{DeletionQueue, DeletionTask, Releasable, RetireHook};

/// Which pipeline draws a material
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ShadingModel {
    /// Unlit base color
    #[default]
    Default,
    Pbr,
    Wireframe,
}

/// Material properties, before upload
#[derive(Debug, Clone)]
pub struct MaterialDescriptor {
    pub name: String,
    pub shading: ShadingModel,
    pub base_color: Vec4,
    pub metallic: f32,
    pub roughness: f32,
    pub emissive: Vec3,
    pub emissive_strength: f32,
}

impl Default for MaterialDescriptor {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            shading: ShadingModel::Default,
            base_color: Vec4::ONE,
            metallic: 0.0,
            roughness: 0.5,
            emissive: Vec3::ZERO,
            emissive_strength: 1.0,
        }
    }
}

impl MaterialDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_shading(mut self, shading: ShadingModel) -> Self {
        self.shading = shading;
        self
    }

    pub fn with_base_color(mut self, color: Vec4) -> Self {
        self.base_color = color;
        self
    }

    pub fn with_metallic(mut self, metallic: f32) -> Self {
        self.metallic = metallic.clamp(0.0, 1.0);
        self
    }

    pub fn with_roughness(mut self, roughness: f32) -> Self {
        self.roughness = roughness.clamp(0.0, 1.0);
        self
    }

    pub fn with_emissive(mut self, emissive: Vec3, strength: f32) -> Self {
        self.emissive = emissive;
        self.emissive_strength = strength;
        self
    }

    pub fn uniform_data(&self) -> MaterialUniformData {
        MaterialUniformData {
            base_color: self.base_color,
            metallic_roughness: [self.metallic, self.roughness, 0.0, 0.0],
            emissive: self.emissive.extend(self.emissive_strength),
        }
    }

    // Presets

    pub fn plastic(color: Vec3) -> Self {
        Self::new("plastic")
            .with_shading(ShadingModel::Pbr)
            .with_base_color(color.extend(1.0))
            .with_roughness(0.4)
    }

    pub fn metal(color: Vec3, roughness: f32) -> Self {
        Self::new("metal")
            .with_shading(ShadingModel::Pbr)
            .with_base_color(color.extend(1.0))
            .with_metallic(1.0)
            .with_roughness(roughness)
    }

    pub fn gold() -> Self {
        Self::metal(Vec3::new(1.0, 0.766, 0.336), 0.3)
    }

    pub fn wireframe(color: Vec3) -> Self {
        Self::new("wireframe")
            .with_shading(ShadingModel::Wireframe)
            .with_base_color(color.extend(1.0))
    }
}

/// Material uniform data for GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MaterialUniformData {
    pub base_color: Vec4,
    pub metallic_roughness: [f32; 4], // x=metallic, y=roughness
    pub emissive: Vec4,               // xyz=emissive, w=strength
}

/// Uploaded material: a uniform buffer bound through one descriptor set.
#[derive(Debug)]
pub struct Material {
    pub name: String,
    pub shading: ShadingModel,
    pub uniform_buffer: BufferHandle,
    /// Allocated from the renderer's global descriptor allocator, which owns
    /// the backing pool. Sets are reclaimed with their pool, never one by one.
    pub descriptor_set: DescriptorSetHandle,
    pub(crate) retire: Option<RetireHook>,
}

pub type MaterialRef = Arc<Material>;

impl Releasable for Material {
    fn release(&self, queue: &DeletionQueue) {
        if self.retire.as_ref().map_or(true, RetireHook::claim) {
            queue.push(DeletionTask::Buffer(self.uniform_buffer));
        }
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        if let Some(hook) = &self.retire {
            if hook.claim() {
                log::trace!("Material '{}': retiring uniform buffer", self.name);
                hook.queue().push(DeletionTask::Buffer(self.uniform_buffer));
            }
        }
    }
}

static_assertions::assert_impl_all!(Material: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout() {
        assert_eq!(std::mem::size_of::<MaterialUniformData>(), 48);
        let data = MaterialDescriptor::gold().uniform_data();
        assert_eq!(data.metallic_roughness[0], 1.0);
        assert_eq!(data.metallic_roughness[1], 0.3);
    }

    #[test]
    fn test_builder_clamps() {
        let desc = MaterialDescriptor::new("x").with_metallic(2.0).with_roughness(-1.0);
        assert_eq!(desc.metallic, 1.0);
        assert_eq!(desc.roughness, 0.0);
        assert_eq!(desc.shading, ShadingModel::Default);
    }
}
