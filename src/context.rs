//! Explicit owner of everything a running renderer needs.
//!
//! Nothing in this crate is global: the device, the shared deletion queue,
//! the renderer and its command queue all live here and are handed to whoever
//! needs them.

use std::sync::Arc;

use crate::backend::{Extent2d, GpuDevice};
use crate::command_queue::{FlushReport, RenderCommand, RenderCommandQueue};
use crate::config::RendererConfig;
use crate::deletion_queue::DeletionQueue;
use crate::error::GraphicsResult;
use crate::renderer::{FrameBegin, Renderer};
use crate::swapchain::SwapchainStatus;

/// What happened during [`RenderContext::render_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub commands: FlushReport,
    pub begin: FrameBegin,
    /// `None` when the frame was skipped.
    pub present: Option<SwapchainStatus>,
}

pub struct RenderContext {
    device: Arc<dyn GpuDevice>,
    deletion_queue: Arc<DeletionQueue>,
    renderer: Renderer,
    commands: RenderCommandQueue,
}

impl RenderContext {
    pub fn new(device: Arc<dyn GpuDevice>, config: RendererConfig) -> GraphicsResult<Self> {
        let deletion_queue = Arc::new(DeletionQueue::new());
        let renderer = Renderer::new(Arc::clone(&device), Arc::clone(&deletion_queue), config)?;
        Ok(Self {
            device,
            deletion_queue,
            renderer,
            commands: RenderCommandQueue::new(),
        })
    }

    /// Queue a command for the next frame. Returns `false` after shutdown.
    pub fn submit(&mut self, command: RenderCommand) -> bool {
        self.commands.submit(command)
    }

    /// Apply queued commands, then record, submit and present one frame.
    ///
    /// A frame that fails part way is aborted before the error is returned,
    /// so the next call starts cleanly.
    pub fn render_frame(&mut self) -> GraphicsResult<FrameReport> {
        let commands = self.commands.flush(&mut self.renderer);
        let begin = match self.renderer.begin_frame() {
            Ok(begin) => begin,
            Err(err) => {
                if let Err(abort_err) = self.renderer.abort_frame() {
                    log::error!("RenderContext: abort after failed frame: {abort_err}");
                }
                return Err(err);
            }
        };
        if !begin.is_started() {
            return Ok(FrameReport {
                commands,
                begin,
                present: None,
            });
        }

        let recorded = self
            .renderer
            .draw_scene()
            .and_then(|()| self.renderer.end_frame());
        if let Err(err) = recorded {
            if let Err(abort_err) = self.renderer.abort_frame() {
                log::error!("RenderContext: abort after failed frame: {abort_err}");
            }
            return Err(err);
        }
        let present = self.renderer.present()?;
        Ok(FrameReport {
            commands,
            begin,
            present: Some(present),
        })
    }

    pub fn resize(&mut self, extent: Extent2d) {
        self.renderer.resize(extent);
    }

    /// Drain pending commands, close the queue and tear the renderer down.
    pub fn shutdown(&mut self) -> GraphicsResult<()> {
        if !self.commands.is_closed() {
            let report = self.commands.shutdown(&mut self.renderer);
            log::debug!("RenderContext: drained {} commands on shutdown", report.executed);
        }
        self.renderer.shutdown()
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn deletion_queue(&self) -> &Arc<DeletionQueue> {
        &self.deletion_queue
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    pub fn commands(&self) -> &RenderCommandQueue {
        &self.commands
    }

    /// Renderer and command queue together, for scene extraction.
    pub fn split_mut(&mut self) -> (&mut Renderer, &mut RenderCommandQueue) {
        (&mut self.renderer, &mut self.commands)
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            log::error!("RenderContext: shutdown failed: {err}");
        }
    }
}
