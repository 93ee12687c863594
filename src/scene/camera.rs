//! Camera component

use bevy_ecs::prelude::*;
use glam::{Mat4, Vec3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        height: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_4,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            near,
            far,
        }
    }

    /// Projection matrix for a framebuffer with the given aspect ratio.
    pub fn matrix(&self, aspect: f32) -> Mat4 {
        match *self {
            Projection::Perspective { fov_y, near, far } => {
                Mat4::perspective_rh(fov_y, aspect, near, far)
            }
            Projection::Orthographic { height, near, far } => {
                let half_h = height / 2.0;
                let half_w = half_h * aspect;
                Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, near, far)
            }
        }
    }
}

/// Viewpoint the scene is rendered from.
///
/// The position comes from the entity's [`Transform`](super::Transform).
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub target: Vec3,
    pub up: Vec3,
    pub projection: Projection,
    /// Only the first active camera found is used.
    pub active: bool,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            target: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::default(),
            active: true,
        }
    }
}

impl Camera {
    pub fn looking_at(target: Vec3) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    pub fn view_matrix(&self, position: Vec3) -> Mat4 {
        Mat4::look_at_rh(position, self.target, self.up)
    }

    pub fn view_proj(&self, position: Vec3, aspect: f32) -> Mat4 {
        self.projection.matrix(aspect) * self.view_matrix(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn test_target_projects_to_center() {
        let camera = Camera::looking_at(Vec3::ZERO);
        let clip = camera.view_proj(Vec3::new(0.0, 0.0, 5.0), 16.0 / 9.0) * Vec4::W;
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 1e-5);
        assert!(ndc.y.abs() < 1e-5);
    }
}
