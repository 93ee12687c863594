//! Window integration using winit
//!
//! The renderer only needs two things from a window: the current framebuffer
//! size and a notification when it changes. [`ResizeTracker`] turns winit's
//! stream of resize events into at most one pending extent per frame.

use winit::event::WindowEvent;
use winit::window::Window as WinitWindow;

use crate::backend::Extent2d;

/// Anything that can report its drawable size in physical pixels.
pub trait FramebufferSource {
    fn framebuffer_extent(&self) -> Extent2d;
}

impl FramebufferSource for WinitWindow {
    fn framebuffer_extent(&self) -> Extent2d {
        let size = self.inner_size();
        Extent2d::new(size.width, size.height)
    }
}

impl FramebufferSource for Extent2d {
    fn framebuffer_extent(&self) -> Extent2d {
        *self
    }
}

/// Coalesces resize notifications.
#[derive(Debug, Clone, Copy)]
pub struct ResizeTracker {
    current: Extent2d,
    pending: Option<Extent2d>,
    close_requested: bool,
}

impl ResizeTracker {
    pub fn new(source: &dyn FramebufferSource) -> Self {
        Self {
            current: source.framebuffer_extent(),
            pending: None,
            close_requested: false,
        }
    }

    /// Record a new framebuffer size. Repeats of the current size are ignored.
    pub fn notify(&mut self, extent: Extent2d) {
        if extent == self.current && self.pending.is_none() {
            return;
        }
        self.current = extent;
        self.pending = Some(extent);
    }

    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => self.notify(Extent2d::new(size.width, size.height)),
            WindowEvent::CloseRequested => self.close_requested = true,
            _ => {}
        }
    }

    /// Latest size since the last call, if it changed and is drawable.
    ///
    /// A zero-area size (minimized window) stays pending until a real size
    /// arrives.
    pub fn take_resize(&mut self) -> Option<Extent2d> {
        match self.pending {
            Some(extent) if !extent.is_zero_area() => self.pending.take(),
            _ => None,
        }
    }

    /// The window is minimized and there is nothing to draw.
    pub fn is_minimized(&self) -> bool {
        self.current.is_zero_area()
    }

    pub fn extent(&self) -> Extent2d {
        self.current
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesces_to_latest() {
        let mut tracker = ResizeTracker::new(&Extent2d::new(1280, 720));
        tracker.notify(Extent2d::new(1000, 700));
        tracker.notify(Extent2d::new(800, 600));
        assert_eq!(tracker.take_resize(), Some(Extent2d::new(800, 600)));
        assert_eq!(tracker.take_resize(), None);
    }

    #[test]
    fn test_same_size_is_ignored() {
        let mut tracker = ResizeTracker::new(&Extent2d::new(1280, 720));
        tracker.notify(Extent2d::new(1280, 720));
        assert_eq!(tracker.take_resize(), None);
    }

    #[test]
    fn test_minimized_holds_until_restored() {
        let mut tracker = ResizeTracker::new(&Extent2d::new(1280, 720));
        tracker.notify(Extent2d::new(0, 0));
        assert!(tracker.is_minimized());
        assert_eq!(tracker.take_resize(), None);

        tracker.notify(Extent2d::new(1280, 720));
        assert!(!tracker.is_minimized());
        assert_eq!(tracker.take_resize(), Some(Extent2d::new(1280, 720)));
    }
}
