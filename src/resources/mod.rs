//! GPU resources the renderer draws with
//!
//! Meshes and materials are shared through `Arc` and release their GPU
//! objects through the deletion queue.

mod material;
mod mesh;

pub use material::*;
pub use mesh::*;
