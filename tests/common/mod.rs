//! Shared setup for the frame orchestration integration tests.
//!
//! Every test runs against the dummy device, which records device calls and
//! destroyed objects so ordering can be asserted without a GPU.

#![allow(dead_code)]

use std::sync::Arc;

use ember_render::backend::{DeviceCall, DummyDevice, GpuDevice};
use ember_render::resources::{MaterialDescriptor, MaterialRef, MeshData, MeshRef};
use ember_render::{RenderContext, RendererConfig};

/// Install the test logger once per binary.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A context on a fresh dummy device plus a handle to inspect that device.
pub struct TestContext {
    pub device: Arc<DummyDevice>,
    pub context: RenderContext,
}

impl TestContext {
    pub fn new(config: RendererConfig) -> Self {
        init_logging();
        let device = Arc::new(DummyDevice::new());
        let dyn_device: Arc<dyn GpuDevice> = device.clone();
        let context = RenderContext::new(dyn_device, config).unwrap();
        Self { device, context }
    }

    pub fn with_default_config() -> Self {
        Self::new(RendererConfig::default())
    }

    /// Upload a unit cube and a material for it.
    pub fn cube(&mut self, material: MaterialDescriptor) -> (MeshRef, MaterialRef) {
        let renderer = self.context.renderer_mut();
        let mesh = renderer.upload_mesh_data(&MeshData::cube(1.0)).unwrap();
        let material = renderer.create_material(&material).unwrap();
        (mesh, material)
    }
}

/// Position of the first call matching `predicate`.
pub fn position_of(calls: &[DeviceCall], predicate: impl Fn(&DeviceCall) -> bool) -> Option<usize> {
    calls.iter().position(predicate)
}

/// Every draw issued, in recording order.
pub fn draw_calls(calls: &[DeviceCall]) -> Vec<u32> {
    calls
        .iter()
        .filter_map(|call| match call {
            DeviceCall::DrawIndexed { index_count } => Some(*index_count),
            _ => None,
        })
        .collect()
}
