//! Light types for the scene

use bevy_ecs::prelude::*;
use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LightType {
    Directional,
    Point,
    Spot,
}

impl LightType {
    pub const ALL: [LightType; 3] = [LightType::Directional, LightType::Point, LightType::Spot];

    pub fn index(self) -> usize {
        match self {
            LightType::Directional => 0,
            LightType::Point => 1,
            LightType::Spot => 2,
        }
    }
}

/// Light parameters; the variant decides the [`LightType`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightData {
    Directional {
        direction: Vec3,
        color: Vec3,
        intensity: f32,
    },
    Point {
        position: Vec3,
        color: Vec3,
        intensity: f32,
        radius: f32,
    },
    Spot {
        position: Vec3,
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        radius: f32,
        inner_angle: f32, // radians
        outer_angle: f32, // radians
    },
}

impl LightData {
    pub fn directional(direction: Vec3, color: Vec3, intensity: f32) -> Self {
        LightData::Directional {
            direction: direction.normalize_or_zero(),
            color,
            intensity,
        }
    }

    pub fn point(position: Vec3, color: Vec3, intensity: f32, radius: f32) -> Self {
        LightData::Point {
            position,
            color,
            intensity,
            radius,
        }
    }

    pub fn spot(
        position: Vec3,
        direction: Vec3,
        color: Vec3,
        intensity: f32,
        radius: f32,
        inner_angle: f32,
        outer_angle: f32,
    ) -> Self {
        LightData::Spot {
            position,
            direction: direction.normalize_or_zero(),
            color,
            intensity,
            radius,
            inner_angle,
            outer_angle,
        }
    }

    pub fn ty(&self) -> LightType {
        match self {
            LightData::Directional { .. } => LightType::Directional,
            LightData::Point { .. } => LightType::Point,
            LightData::Spot { .. } => LightType::Spot,
        }
    }

    /// Convert to GPU data format
    pub fn to_gpu_data(&self) -> GpuLightData {
        match *self {
            LightData::Directional {
                direction,
                color,
                intensity,
            } => GpuLightData {
                position: Vec4::new(0.0, 0.0, 0.0, f32::MAX),
                color_intensity: color.extend(intensity),
                direction_type: direction.extend(2.0),
                spot_params: Vec4::ZERO,
            },
            LightData::Point {
                position,
                color,
                intensity,
                radius,
            } => GpuLightData {
                position: position.extend(radius),
                color_intensity: color.extend(intensity),
                direction_type: Vec4::ZERO,
                spot_params: Vec4::ZERO,
            },
            LightData::Spot {
                position,
                direction,
                color,
                intensity,
                radius,
                inner_angle,
                outer_angle,
            } => GpuLightData {
                position: position.extend(radius),
                color_intensity: color.extend(intensity),
                direction_type: direction.extend(1.0),
                spot_params: Vec4::new(inner_angle.cos(), outer_angle.cos(), 0.0, 0.0),
            },
        }
    }
}

/// Light attached to an entity
#[derive(Component, Debug, Clone, Copy)]
pub struct SceneLight(pub LightData);

/// GPU-friendly light data structure
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct GpuLightData {
    /// xyz = position, w = radius
    pub position: Vec4,
    /// xyz = color, w = intensity
    pub color_intensity: Vec4,
    /// xyz = direction, w = light type (0=point, 1=spot, 2=directional)
    pub direction_type: Vec4,
    /// x = cos(inner_angle), y = cos(outer_angle)
    pub spot_params: Vec4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_type_tags() {
        let dir = LightData::directional(Vec3::NEG_Y * 4.0, Vec3::ONE, 1.0);
        assert_eq!(dir.ty(), LightType::Directional);
        assert_eq!(dir.to_gpu_data().direction_type, Vec4::new(0.0, -1.0, 0.0, 2.0));

        let point = LightData::point(Vec3::X, Vec3::ONE, 2.0, 5.0);
        assert_eq!(point.to_gpu_data().position, Vec4::new(1.0, 0.0, 0.0, 5.0));
        assert_eq!(point.to_gpu_data().direction_type.w, 0.0);

        let spot = LightData::spot(Vec3::ZERO, Vec3::Z, Vec3::ONE, 1.0, 3.0, 0.0, 0.0);
        assert_eq!(spot.to_gpu_data().spot_params.x, 1.0);
        assert_eq!(spot.to_gpu_data().direction_type.w, 1.0);
    }
}
