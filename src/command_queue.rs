//! Command-pattern queue between scene code and the renderer.
//!
//! Commands are plain data. They are executed in submission order against the
//! [`RenderBackend`] handed to [`RenderCommandQueue::flush`].

use std::collections::VecDeque;

use glam::Vec4;

use crate::renderer::ObjectData;
use crate::resources::MaterialRef;

/// Target of [`RenderCommand`]s.
pub trait RenderBackend {
    fn set_clear_color(&mut self, color: Vec4);

    /// Insert or overwrite the draw entry for `id`.
    fn push_draw(&mut self, id: u64, object: ObjectData, material: MaterialRef);

    /// Remove the draw entry for `id`. Returns `false` if there was none.
    fn pop_draw(&mut self, id: u64) -> bool;
}

#[derive(Debug, Clone)]
pub enum RenderCommand {
    SetClearColor(Vec4),
    PushDraw {
        id: u64,
        object: ObjectData,
        material: MaterialRef,
    },
    PopDraw {
        id: u64,
    },
}

impl RenderCommand {
    /// Apply the command. Returns `false` if it had no effect.
    pub fn execute(self, backend: &mut dyn RenderBackend) -> bool {
        match self {
            RenderCommand::SetClearColor(color) => {
                backend.set_clear_color(color);
                true
            }
            RenderCommand::PushDraw {
                id,
                object,
                material,
            } => {
                backend.push_draw(id, object, material);
                true
            }
            RenderCommand::PopDraw { id } => backend.pop_draw(id),
        }
    }
}

/// Outcome of a flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub executed: usize,
    /// Commands that had no effect, such as popping an absent entry
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct RenderCommandQueue {
    commands: VecDeque<RenderCommand>,
    closed: bool,
}

impl RenderCommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. Returns `false` once the queue has shut down.
    pub fn submit(&mut self, command: RenderCommand) -> bool {
        if self.closed {
            log::warn!("RenderCommandQueue: submit after shutdown ignored");
            return false;
        }
        self.commands.push_back(command);
        true
    }

    /// Execute every queued command in submission order.
    pub fn flush(&mut self, backend: &mut dyn RenderBackend) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(command) = self.commands.pop_front() {
            log::trace!("RenderCommandQueue: executing {:?}", CommandKind::of(&command));
            report.executed += 1;
            if !command.execute(backend) {
                report.failed += 1;
            }
        }
        report
    }

    /// Flush the remaining commands and refuse new ones.
    pub fn shutdown(&mut self, backend: &mut dyn RenderBackend) -> FlushReport {
        let report = self.flush(backend);
        self.closed = true;
        report
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for RenderCommandQueue {
    fn drop(&mut self) {
        if !self.commands.is_empty() {
            log::error!(
                "RenderCommandQueue dropped with {} unexecuted commands",
                self.commands.len()
            );
        }
    }
}

#[derive(Debug)]
enum CommandKind {
    SetClearColor,
    PushDraw(u64),
    PopDraw(u64),
}

impl CommandKind {
    fn of(command: &RenderCommand) -> Self {
        match command {
            RenderCommand::SetClearColor(_) => CommandKind::SetClearColor,
            RenderCommand::PushDraw { id, .. } => CommandKind::PushDraw(*id),
            RenderCommand::PopDraw { id } => CommandKind::PopDraw(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, DescriptorSetHandle};
    use crate::renderer::DrawQueue;
    use crate::resources::{Material, Mesh, ShadingModel};
    use glam::Mat4;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingBackend {
        clear: Option<Vec4>,
        draws: DrawQueue,
        log: Vec<String>,
    }

    impl RenderBackend for RecordingBackend {
        fn set_clear_color(&mut self, color: Vec4) {
            self.log.push("clear".into());
            self.clear = Some(color);
        }

        fn push_draw(&mut self, id: u64, object: ObjectData, material: MaterialRef) {
            self.log.push(format!("push {id}"));
            self.draws.push(id, object, material);
        }

        fn pop_draw(&mut self, id: u64) -> bool {
            self.log.push(format!("pop {id}"));
            self.draws.pop(id)
        }
    }

    fn object() -> (ObjectData, MaterialRef) {
        let mesh = Arc::new(Mesh {
            name: "tri".into(),
            vertex_buffer: BufferHandle::from_raw(1),
            index_buffer: BufferHandle::from_raw(2),
            vertex_count: 3,
            index_count: 3,
            retire: None,
        });
        let material = Arc::new(Material {
            name: "flat".into(),
            shading: ShadingModel::Default,
            uniform_buffer: BufferHandle::from_raw(3),
            descriptor_set: DescriptorSetHandle::from_raw(4),
            retire: None,
        });
        (
            ObjectData {
                mesh,
                transform: Mat4::IDENTITY,
            },
            material,
        )
    }

    #[test]
    fn test_flush_in_submission_order() {
        let mut queue = RenderCommandQueue::new();
        let mut backend = RecordingBackend::default();
        let (object, material) = object();

        queue.submit(RenderCommand::PushDraw {
            id: 1,
            object,
            material,
        });
        queue.submit(RenderCommand::SetClearColor(Vec4::new(0.1, 0.2, 0.3, 1.0)));
        queue.submit(RenderCommand::PopDraw { id: 1 });
        queue.submit(RenderCommand::PopDraw { id: 1 });

        let report = queue.flush(&mut backend);
        assert_eq!(report, FlushReport { executed: 4, failed: 1 });
        assert_eq!(backend.log, vec!["push 1", "clear", "pop 1", "pop 1"]);
        assert_eq!(backend.clear, Some(Vec4::new(0.1, 0.2, 0.3, 1.0)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shutdown_drains_and_closes() {
        let mut queue = RenderCommandQueue::new();
        let mut backend = RecordingBackend::default();
        queue.submit(RenderCommand::SetClearColor(Vec4::ONE));

        let report = queue.shutdown(&mut backend);
        assert_eq!(report.executed, 1);
        assert!(queue.is_closed());
        assert!(!queue.submit(RenderCommand::PopDraw { id: 5 }));
        assert!(queue.is_empty());
    }
}
