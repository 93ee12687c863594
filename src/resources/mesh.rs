//! Mesh data and its GPU counterpart

use std::sync::Arc;

use glam::{Vec2, Vec3};

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GpuDevice, Vertex};
use crate::deletion_queue::{DeletionQueue, DeletionTask, Releasable, RetireHook};
use crate::error::{GraphicsError, GraphicsResult};

/// CPU-side vertex and index data
#[derive(Debug, Clone)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn new(name: &str, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            name: name.to_string(),
            vertices,
            indices,
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Axis-aligned cube centered at the origin, four vertices per face
    pub fn cube(size: f32) -> Self {
        let half = size * 0.5;
        // (outward normal, face up)
        let faces = [
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::Z),
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
        ];
        let corners = [
            (-1.0, -1.0, Vec2::new(0.0, 1.0)),
            (1.0, -1.0, Vec2::new(1.0, 1.0)),
            (1.0, 1.0, Vec2::new(1.0, 0.0)),
            (-1.0, 1.0, Vec2::new(0.0, 0.0)),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, up) in faces {
            let right = up.cross(normal);
            let base = vertices.len() as u32;
            for (x, y, uv) in corners {
                let position = (normal + right * x + up * y) * half;
                let mut vertex = Vertex::new(position, normal, uv);
                vertex.tangent = right.extend(1.0);
                vertices.push(vertex);
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self::new("cube", vertices, indices)
    }
}

/// Mesh resident in GPU buffers
#[derive(Debug)]
pub struct Mesh {
    pub name: String,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Set for meshes the renderer tracks; hands the buffers back on drop.
    pub(crate) retire: Option<RetireHook>,
}

pub type MeshRef = Arc<Mesh>;

impl Mesh {
    /// Create host-visible vertex/index buffers and fill them.
    pub fn upload(device: &dyn GpuDevice, data: &MeshData) -> GraphicsResult<Self> {
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&data.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&data.indices);

        let vertex_buffer = device
            .create_buffer(&BufferDescriptor {
                label: Some(format!("{} vertices", data.name)),
                size: vertex_bytes.len() as u64,
                usage: BufferUsage::VERTEX,
                host_visible: true,
            })
            .map_err(GraphicsError::creation("vertex buffer"))?;

        let index_buffer = match device.create_buffer(&BufferDescriptor {
            label: Some(format!("{} indices", data.name)),
            size: index_bytes.len() as u64,
            usage: BufferUsage::INDEX,
            host_visible: true,
        }) {
            Ok(buffer) => buffer,
            Err(err) => {
                device.destroy_buffer(vertex_buffer);
                return Err(GraphicsError::creation("index buffer")(err));
            }
        };

        let written = device
            .write_buffer(vertex_buffer, 0, vertex_bytes)
            .and_then(|()| device.write_buffer(index_buffer, 0, index_bytes));
        if let Err(err) = written {
            device.destroy_buffer(index_buffer);
            device.destroy_buffer(vertex_buffer);
            return Err(err.into());
        }

        Ok(Self {
            name: data.name.clone(),
            vertex_buffer,
            index_buffer,
            vertex_count: data.vertices.len() as u32,
            index_count: data.indices.len() as u32,
            retire: None,
        })
    }

    /// Hand the buffers to `hook`'s queue when the last owner drops the mesh.
    pub fn with_retire_hook(mut self, hook: RetireHook) -> Self {
        self.retire = Some(hook);
        self
    }

    fn push_buffers(&self, queue: &DeletionQueue) {
        queue.push(DeletionTask::Buffer(self.vertex_buffer));
        queue.push(DeletionTask::Buffer(self.index_buffer));
    }
}

impl Releasable for Mesh {
    fn release(&self, queue: &DeletionQueue) {
        if self.retire.as_ref().map_or(true, RetireHook::claim) {
            self.push_buffers(queue);
        }
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        if let Some(hook) = &self.retire {
            if hook.claim() {
                log::trace!("Mesh '{}': retiring buffers", self.name);
                self.push_buffers(hook.queue());
            }
        }
    }
}
