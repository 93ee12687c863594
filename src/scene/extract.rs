//! World → renderer synchronization
//!
//! Each frame the extractor walks the ECS world, turns every renderable
//! entity into a [`RenderCommand::PushDraw`], and issues
//! [`RenderCommand::PopDraw`] for entities that disappeared since the previous
//! pass. Lights and the active camera go straight to the [`Renderer`].

use std::collections::BTreeSet;

use bevy_ecs::prelude::*;

use crate::command_queue::{RenderCommand, RenderCommandQueue};
use crate::renderer::{ObjectData, Renderer};
use crate::resources::{MaterialRef, MeshRef};
use crate::scene::{Camera, SceneLight, Transform};

/// Stable id an entity is known by in the draw and light registries
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityGuid(pub u64);

/// Mesh and material an entity is drawn with
#[derive(Component, Debug, Clone)]
pub struct Renderable {
    pub mesh: MeshRef,
    pub material: MaterialRef,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub draws: usize,
    pub removed_draws: usize,
    pub lights: usize,
    pub removed_lights: usize,
    pub camera_found: bool,
}

#[derive(Debug, Default)]
pub struct SceneExtractor {
    draw_ids: BTreeSet<u64>,
    light_ids: BTreeSet<u64>,
}

impl SceneExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extract(
        &mut self,
        world: &mut World,
        commands: &mut RenderCommandQueue,
        renderer: &mut Renderer,
    ) -> ExtractReport {
        let mut report = ExtractReport::default();

        let mut draw_ids = BTreeSet::new();
        let mut renderables = world.query::<(&EntityGuid, &Transform, &Renderable)>();
        for (guid, transform, renderable) in renderables.iter(world) {
            draw_ids.insert(guid.0);
            commands.submit(RenderCommand::PushDraw {
                id: guid.0,
                object: ObjectData {
                    mesh: renderable.mesh.clone(),
                    transform: transform.matrix(),
                },
                material: renderable.material.clone(),
            });
            report.draws += 1;
        }
        for id in self.draw_ids.difference(&draw_ids) {
            commands.submit(RenderCommand::PopDraw { id: *id });
            report.removed_draws += 1;
        }
        self.draw_ids = draw_ids;

        let mut light_ids = BTreeSet::new();
        let mut lights = world.query::<(&EntityGuid, &SceneLight)>();
        for (guid, light) in lights.iter(world) {
            // A rejected update keeps whatever the entity registered before.
            light_ids.insert(guid.0);
            if renderer.submit_light(guid.0, light.0) {
                report.lights += 1;
            }
        }
        for id in self.light_ids.difference(&light_ids) {
            if renderer.remove_light(*id) {
                report.removed_lights += 1;
            }
        }
        self.light_ids = light_ids;

        let aspect = renderer.swapchain().extent().aspect_ratio();
        let mut cameras = world.query::<(&Transform, &Camera)>();
        if let Some((transform, camera)) = cameras.iter(world).find(|(_, camera)| camera.active) {
            renderer.set_camera(camera.view_proj(transform.position, aspect), transform.position);
            report.camera_found = true;
        }

        log::trace!("SceneExtractor: {:?}", report);
        report
    }
}
