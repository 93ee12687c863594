//! ECS scene components and extraction into the renderer

mod camera;
mod extract;
mod light;
mod transform;

pub use camera::*;
pub use extract::*;
pub use light::*;
pub use transform::*;
