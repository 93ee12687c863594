//! Per-frame draw and light registries.
//!
//! Both are keyed by an opaque `u64` (usually an entity GUID). Submitting the
//! same key again replaces the previous entry; removing an absent key is a
//! logged no-op.

use std::collections::BTreeMap;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use crate::resources::{MaterialRef, MeshRef};
use crate::scene::{GpuLightData, LightData, LightType};

/// Shader-visible cap on active lights of each type.
pub const MAX_LIGHTS_PER_SCENE: usize = 16;

/// Mesh and world transform of a drawable object.
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub mesh: MeshRef,
    pub transform: Mat4,
}

#[derive(Debug, Clone)]
pub struct DrawQueueEntry {
    pub mesh: MeshRef,
    pub transform: Mat4,
    pub material: MaterialRef,
    /// Set once the entry has been recorded in the current frame.
    pub rendered: bool,
}

#[derive(Debug, Default)]
pub struct DrawQueue {
    entries: BTreeMap<u64, DrawQueueEntry>,
}

impl DrawQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `id`. Returns `true` if it replaced one.
    pub fn push(&mut self, id: u64, object: ObjectData, material: MaterialRef) -> bool {
        self.entries
            .insert(
                id,
                DrawQueueEntry {
                    mesh: object.mesh,
                    transform: object.transform,
                    material,
                    rendered: false,
                },
            )
            .is_some()
    }

    /// Remove the entry for `id`. Returns `false` if there was none.
    pub fn pop(&mut self, id: u64) -> bool {
        if self.entries.remove(&id).is_some() {
            true
        } else {
            log::warn!("DrawQueue: no draw entry for id {id}");
            false
        }
    }

    pub fn get(&self, id: u64) -> Option<&DrawQueueEntry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut DrawQueueEntry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &DrawQueueEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut DrawQueueEntry)> {
        self.entries.iter_mut().map(|(id, entry)| (*id, entry))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightRenderInfo {
    pub data: LightData,
    pub ty: LightType,
    pub active: bool,
}

/// Registered lights with per-type active counters.
///
/// A submission that would push a type past [`MAX_LIGHTS_PER_SCENE`] active
/// lights is rejected with a warning and leaves the registry unchanged.
#[derive(Debug, Default)]
pub struct LightRegistry {
    lights: BTreeMap<u64, LightRenderInfo>,
    active: [usize; 3],
}

impl LightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the light for `id` as active.
    pub fn submit(&mut self, id: u64, data: LightData) -> bool {
        let ty = data.ty();
        let previous = self.lights.get(&id).copied();
        let counted = matches!(previous, Some(info) if info.active && info.ty == ty);

        if !counted && self.active[ty.index()] >= MAX_LIGHTS_PER_SCENE {
            log::warn!(
                "LightRegistry: rejecting {:?} light {}, {} already active",
                ty,
                id,
                MAX_LIGHTS_PER_SCENE
            );
            return false;
        }

        if let Some(info) = previous {
            if info.active && !counted {
                self.active[info.ty.index()] -= 1;
            }
        }
        if !counted {
            self.active[ty.index()] += 1;
        }
        self.lights.insert(
            id,
            LightRenderInfo {
                data,
                ty,
                active: true,
            },
        );
        true
    }

    /// Toggle a registered light. Activation obeys the per-type cap.
    pub fn set_active(&mut self, id: u64, active: bool) -> bool {
        let Some(info) = self.lights.get_mut(&id) else {
            log::warn!("LightRegistry: no light for id {id}");
            return false;
        };
        if info.active == active {
            return true;
        }
        let slot = &mut self.active[info.ty.index()];
        if active {
            if *slot >= MAX_LIGHTS_PER_SCENE {
                log::warn!(
                    "LightRegistry: cannot activate {:?} light {}, cap reached",
                    info.ty,
                    id
                );
                return false;
            }
            *slot += 1;
        } else {
            *slot -= 1;
        }
        info.active = active;
        true
    }

    pub fn remove(&mut self, id: u64) -> bool {
        match self.lights.remove(&id) {
            Some(info) => {
                if info.active {
                    self.active[info.ty.index()] -= 1;
                }
                true
            }
            None => {
                log::warn!("LightRegistry: no light for id {id}");
                false
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&LightRenderInfo> {
        self.lights.get(&id)
    }

    pub fn active_count(&self, ty: LightType) -> usize {
        self.active[ty.index()]
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.lights.keys().copied()
    }

    /// Pack the active lights into the frame uniform layout, in id order.
    pub fn pack(&self, view_proj: Mat4, camera_position: Vec3) -> FrameUniform {
        let mut uniform = FrameUniform {
            view_proj,
            camera_position: camera_position.extend(1.0),
            ..FrameUniform::zeroed()
        };
        for info in self.lights.values().filter(|info| info.active) {
            let slot = info.ty.index();
            let count = uniform.light_counts[slot] as usize;
            if count >= MAX_LIGHTS_PER_SCENE {
                continue;
            }
            let target = match info.ty {
                LightType::Directional => &mut uniform.directional_lights,
                LightType::Point => &mut uniform.point_lights,
                LightType::Spot => &mut uniform.spot_lights,
            };
            target[count] = info.data.to_gpu_data();
            uniform.light_counts[slot] += 1;
        }
        uniform
    }
}

/// Per-frame uniform block: camera plus every active light.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniform {
    pub view_proj: Mat4,
    /// w = 1
    pub camera_position: Vec4,
    /// x = directional, y = point, z = spot
    pub light_counts: [u32; 4],
    pub directional_lights: [GpuLightData; MAX_LIGHTS_PER_SCENE],
    pub point_lights: [GpuLightData; MAX_LIGHTS_PER_SCENE],
    pub spot_lights: [GpuLightData; MAX_LIGHTS_PER_SCENE],
}

impl FrameUniform {
    pub fn total_lights(&self) -> u32 {
        self.light_counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, DescriptorSetHandle};
    use crate::resources::{Material, Mesh, ShadingModel};
    use std::sync::Arc;

    fn mesh(name: &str) -> MeshRef {
        Arc::new(Mesh {
            name: name.to_string(),
            vertex_buffer: BufferHandle::from_raw(1),
            index_buffer: BufferHandle::from_raw(2),
            vertex_count: 3,
            index_count: 3,
            retire: None,
        })
    }

    fn material(name: &str) -> MaterialRef {
        Arc::new(Material {
            name: name.to_string(),
            shading: ShadingModel::Default,
            uniform_buffer: BufferHandle::from_raw(3),
            descriptor_set: DescriptorSetHandle::from_raw(4),
            retire: None,
        })
    }

    fn point(x: f32) -> LightData {
        LightData::point(Vec3::new(x, 0.0, 0.0), Vec3::ONE, 1.0, 5.0)
    }

    #[test]
    fn test_push_replaces_entry() {
        let mut queue = DrawQueue::new();
        let (mesh_a, mesh_b) = (mesh("a"), mesh("b"));
        let (mat_a, mat_b) = (material("a"), material("b"));

        assert!(!queue.push(
            7,
            ObjectData {
                mesh: mesh_a,
                transform: Mat4::IDENTITY,
            },
            mat_a,
        ));
        let moved = Mat4::from_translation(Vec3::X);
        assert!(queue.push(
            7,
            ObjectData {
                mesh: mesh_b.clone(),
                transform: moved,
            },
            mat_b.clone(),
        ));

        assert_eq!(queue.len(), 1);
        let entry = queue.get(7).unwrap();
        assert!(Arc::ptr_eq(&entry.mesh, &mesh_b));
        assert!(Arc::ptr_eq(&entry.material, &mat_b));
        assert_eq!(entry.transform, moved);
    }

    #[test]
    fn test_pop_absent_is_soft() {
        let mut queue = DrawQueue::new();
        queue.push(
            1,
            ObjectData {
                mesh: mesh("a"),
                transform: Mat4::IDENTITY,
            },
            material("a"),
        );
        assert!(!queue.pop(99));
        assert_eq!(queue.len(), 1);
        assert!(queue.pop(1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_light_cap_rejects_extra() {
        let mut lights = LightRegistry::new();
        for id in 0..MAX_LIGHTS_PER_SCENE as u64 {
            assert!(lights.submit(id, point(id as f32)));
        }
        assert!(!lights.submit(100, point(100.0)));
        assert_eq!(lights.active_count(LightType::Point), MAX_LIGHTS_PER_SCENE);
        assert!(lights.get(100).is_none());

        // Replacing an existing light never counts twice.
        assert!(lights.submit(3, point(42.0)));
        assert_eq!(lights.active_count(LightType::Point), MAX_LIGHTS_PER_SCENE);

        // Other types have their own budget.
        assert!(lights.submit(200, LightData::directional(Vec3::NEG_Y, Vec3::ONE, 1.0)));
    }

    #[test]
    fn test_type_change_moves_count() {
        let mut lights = LightRegistry::new();
        lights.submit(1, point(0.0));
        lights.submit(1, LightData::directional(Vec3::NEG_Y, Vec3::ONE, 1.0));
        assert_eq!(lights.active_count(LightType::Point), 0);
        assert_eq!(lights.active_count(LightType::Directional), 1);
    }

    #[test]
    fn test_set_active_and_remove() {
        let mut lights = LightRegistry::new();
        lights.submit(1, point(0.0));
        assert!(lights.set_active(1, false));
        assert_eq!(lights.active_count(LightType::Point), 0);
        assert!(lights.set_active(1, true));
        assert_eq!(lights.active_count(LightType::Point), 1);

        assert!(lights.remove(1));
        assert!(!lights.remove(1));
        assert!(!lights.set_active(1, true));
        assert_eq!(lights.active_count(LightType::Point), 0);
    }

    #[test]
    fn test_pack_skips_inactive() {
        let mut lights = LightRegistry::new();
        lights.submit(1, point(1.0));
        lights.submit(2, point(2.0));
        lights.submit(3, LightData::directional(Vec3::NEG_Y, Vec3::ONE, 1.0));
        lights.set_active(1, false);

        let uniform = lights.pack(Mat4::IDENTITY, Vec3::ZERO);
        assert_eq!(uniform.light_counts, [1, 1, 0, 0]);
        assert_eq!(uniform.point_lights[0].position.x, 2.0);
        assert_eq!(uniform.total_lights(), 2);
    }

    #[test]
    fn test_frame_uniform_size() {
        assert_eq!(std::mem::size_of::<FrameUniform>(), 64 + 16 + 16 + 3 * 16 * 64);
    }
}
