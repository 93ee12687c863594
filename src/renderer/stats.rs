/// Real-time counters for telemetry overlays.
///
/// Per-frame counters are reset when a frame starts; `frame_number`,
/// `vram_bytes` and `swapchain_recreations` carry over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frame_number: u64,
    pub draw_calls: u32,
    pub vertices: u64,
    pub indices: u64,
    pub lights_uploaded: u32,
    pub vram_bytes: u64,
    pub swapchain_recreations: u32,
}

impl RenderStats {
    pub(crate) fn begin_frame(&mut self, frame_number: u64) {
        self.frame_number = frame_number;
        self.draw_calls = 0;
        self.vertices = 0;
        self.indices = 0;
        self.lights_uploaded = 0;
    }

    pub(crate) fn record_draw(&mut self, vertex_count: u32, index_count: u32) {
        self.draw_calls += 1;
        self.vertices += vertex_count as u64;
        self.indices += index_count as u64;
    }

    pub fn triangles(&self) -> u64 {
        self.indices / 3
    }
}
