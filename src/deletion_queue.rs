//! Deferred destruction of GPU objects.
//!
//! GPU commands run asynchronously, so an object can't be destroyed the moment
//! the CPU side is done with it: in-flight frames may still reference it.
//! Objects are pushed here as tagged [`DeletionTask`]s and destroyed together
//! once the owner knows the GPU is past them.
//!
//! # Ordering
//!
//! ```text
//! push(pool) push(set layout) push(pipeline)      flush()
//!   ┌──────┬──────────┬──────────┐          destroy pipeline
//!   │ pool │  layout  │ pipeline │   ──►    destroy layout
//!   └──────┴──────────┴──────────┘          destroy pool
//! ```
//!
//! Objects are usually created in dependency order, so destroying them in
//! reverse insertion order never destroys a dependency before its dependent.
//!
//! Besides tasks, the queue keeps weak references to [`Releasable`] resources
//! (materials, for example). [`DeletionQueue::release`] asks each live one to
//! push its own tasks. Resources whose last owner goes away first hand their
//! objects over through a [`RetireHook`] instead.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::backend::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, DescriptorSetLayoutHandle,
    FenceHandle, GpuDevice, ImageHandle, ImageViewHandle, PipelineHandle, SamplerHandle,
    SemaphoreHandle, SwapchainHandle,
};

/// Kind of GPU object a [`DeletionTask`] destroys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionKind {
    Buffer,
    Image,
    ImageView,
    Sampler,
    Pipeline,
    DescriptorPool,
    DescriptorSetLayout,
    Fence,
    Semaphore,
    Swapchain,
    CommandBuffer,
}

/// A GPU object pending destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletionTask {
    Buffer(BufferHandle),
    Image(ImageHandle),
    ImageView(ImageViewHandle),
    Sampler(SamplerHandle),
    Pipeline(PipelineHandle),
    DescriptorPool(DescriptorPoolHandle),
    DescriptorSetLayout(DescriptorSetLayoutHandle),
    Fence(FenceHandle),
    Semaphore(SemaphoreHandle),
    Swapchain(SwapchainHandle),
    CommandBuffer(CommandBufferHandle),
}

impl DeletionTask {
    pub fn kind(&self) -> DeletionKind {
        match self {
            DeletionTask::Buffer(_) => DeletionKind::Buffer,
            DeletionTask::Image(_) => DeletionKind::Image,
            DeletionTask::ImageView(_) => DeletionKind::ImageView,
            DeletionTask::Sampler(_) => DeletionKind::Sampler,
            DeletionTask::Pipeline(_) => DeletionKind::Pipeline,
            DeletionTask::DescriptorPool(_) => DeletionKind::DescriptorPool,
            DeletionTask::DescriptorSetLayout(_) => DeletionKind::DescriptorSetLayout,
            DeletionTask::Fence(_) => DeletionKind::Fence,
            DeletionTask::Semaphore(_) => DeletionKind::Semaphore,
            DeletionTask::Swapchain(_) => DeletionKind::Swapchain,
            DeletionTask::CommandBuffer(_) => DeletionKind::CommandBuffer,
        }
    }

    /// Destroy the object immediately.
    ///
    /// The caller must know the GPU no longer uses it.
    pub fn destroy(self, device: &dyn GpuDevice) {
        match self {
            DeletionTask::Buffer(buffer) => device.destroy_buffer(buffer),
            DeletionTask::Image(image) => device.destroy_image(image),
            DeletionTask::ImageView(view) => device.destroy_image_view(view),
            DeletionTask::Sampler(sampler) => device.destroy_sampler(sampler),
            DeletionTask::Pipeline(pipeline) => device.destroy_pipeline(pipeline),
            DeletionTask::DescriptorPool(pool) => device.destroy_descriptor_pool(pool),
            DeletionTask::DescriptorSetLayout(layout) => {
                device.destroy_descriptor_set_layout(layout)
            }
            DeletionTask::Fence(fence) => device.destroy_fence(fence),
            DeletionTask::Semaphore(semaphore) => device.destroy_semaphore(semaphore),
            DeletionTask::Swapchain(swapchain) => device.destroy_swapchain(swapchain),
            DeletionTask::CommandBuffer(cmd) => device.free_command_buffer(cmd),
        }
    }
}

/// A resource that knows which GPU objects it owns.
pub trait Releasable: Send + Sync {
    /// Push every owned GPU object onto `queue`.
    fn release(&self, queue: &DeletionQueue);
}

/// Thread-safe LIFO queue of pending GPU object destruction.
#[derive(Default)]
pub struct DeletionQueue {
    tasks: Mutex<VecDeque<DeletionTask>>,
    registered: Mutex<Vec<Weak<dyn Releasable>>>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task`. Callable from any thread.
    pub fn push(&self, task: DeletionTask) {
        self.tasks.lock().push_back(task);
    }

    /// Track `resource` for the next [`release`](Self::release) pass.
    ///
    /// Only a weak reference is kept: registering never extends a lifetime.
    /// Entries whose resource is already gone are pruned here.
    pub fn register(&self, resource: &Arc<dyn Releasable>) {
        let mut registered = self.registered.lock();
        registered.retain(|entry| entry.strong_count() > 0);
        registered.push(Arc::downgrade(resource));
    }

    /// Ask every registered resource that is still alive to push its objects.
    ///
    /// The registered list is drained. Already pushed tasks stay queued.
    pub fn release(&self) {
        let registered = std::mem::take(&mut *self.registered.lock());
        let mut released = 0usize;
        for resource in registered.iter().filter_map(Weak::upgrade) {
            resource.release(self);
            released += 1;
        }
        if released > 0 {
            log::debug!("DeletionQueue: released {} registered resources", released);
        }
    }

    /// Destroy every queued object in reverse insertion order.
    ///
    /// A no-op on an empty queue. Tasks pushed concurrently land in the next
    /// flush.
    pub fn flush(&self, device: &dyn GpuDevice) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        log::debug!("DeletionQueue: destroying {} objects", tasks.len());
        for task in tasks.into_iter().rev() {
            task.destroy(device);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Registered resources awaiting a release pass. Entries dropped since
    /// the last `register` are counted until the next one prunes them.
    pub fn registered_count(&self) -> usize {
        self.registered.lock().len()
    }

    /// Move every pending task onto `other`, keeping insertion order.
    pub fn transfer_to(&self, other: &DeletionQueue) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        other.tasks.lock().extend(tasks);
    }

    /// Snapshot of the pending tasks in insertion order.
    pub fn pending(&self) -> Vec<DeletionTask> {
        self.tasks.lock().iter().copied().collect()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        let pending = self.tasks.get_mut().len();
        if pending > 0 {
            log::error!("DeletionQueue dropped with {} unflushed objects", pending);
        }
    }
}

/// Hands a resource's GPU objects to a queue exactly once.
///
/// Whichever comes first wins: a [`DeletionQueue::release`] pass while the
/// resource is alive, or the drop of its last owner.
pub struct RetireHook {
    queue: Arc<DeletionQueue>,
    retired: AtomicBool,
}

impl RetireHook {
    pub fn new(queue: Arc<DeletionQueue>) -> Self {
        Self {
            queue,
            retired: AtomicBool::new(false),
        }
    }

    /// Returns `true` only on the first call.
    pub fn claim(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    /// Queue the objects are handed to on drop.
    pub fn queue(&self) -> &DeletionQueue {
        &self.queue
    }
}

impl fmt::Debug for RetireHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetireHook")
            .field("retired", &self.retired.load(Ordering::Acquire))
            .finish()
    }
}

static_assertions::assert_impl_all!(DeletionQueue: Send, Sync);
static_assertions::assert_impl_all!(RetireHook: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResource {
        buffer: BufferHandle,
        releases: AtomicUsize,
    }

    impl Releasable for CountingResource {
        fn release(&self, queue: &DeletionQueue) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            queue.push(DeletionTask::Buffer(self.buffer));
        }
    }

    #[test]
    fn test_flush_is_lifo() {
        let device = DummyDevice::new();
        let queue = DeletionQueue::new();
        for i in 0..5 {
            queue.push(DeletionTask::Buffer(BufferHandle::from_raw(i)));
        }

        queue.flush(&device);

        let order: Vec<u64> = device
            .destroyed()
            .into_iter()
            .map(|task| match task {
                DeletionTask::Buffer(buffer) => buffer.raw(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(order, vec![4, 3, 2, 1, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let device = DummyDevice::new();
        let queue = DeletionQueue::new();
        queue.flush(&device);
        queue.flush(&device);
        assert!(device.destroyed().is_empty());
    }

    #[test]
    fn test_release_keeps_tasks_and_drains_registry() {
        let device = DummyDevice::new();
        let queue = DeletionQueue::new();
        queue.push(DeletionTask::Sampler(SamplerHandle::from_raw(7)));

        let resource = Arc::new(CountingResource {
            buffer: BufferHandle::from_raw(9),
            releases: AtomicUsize::new(0),
        });
        let as_releasable: Arc<dyn Releasable> = resource.clone();
        queue.register(&as_releasable);

        queue.release();
        assert_eq!(resource.releases.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.registered_count(), 0);

        // A second pass has nothing left to release.
        queue.release();
        assert_eq!(resource.releases.load(Ordering::SeqCst), 1);

        queue.flush(&device);
        assert_eq!(
            device.destroyed(),
            vec![
                DeletionTask::Buffer(BufferHandle::from_raw(9)),
                DeletionTask::Sampler(SamplerHandle::from_raw(7)),
            ]
        );
    }

    #[test]
    fn test_register_does_not_extend_lifetime() {
        let queue = DeletionQueue::new();
        let resource: Arc<dyn Releasable> = Arc::new(CountingResource {
            buffer: BufferHandle::from_raw(1),
            releases: AtomicUsize::new(0),
        });
        queue.register(&resource);
        drop(resource);

        queue.release();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_from_worker_threads() {
        let device = DummyDevice::new();
        let queue = Arc::new(DeletionQueue::new());
        let workers: Vec<_> = (0..4u64)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        queue.push(DeletionTask::Buffer(BufferHandle::from_raw(worker * 100 + i)));
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(queue.len(), 100);
        queue.flush(&device);
        assert_eq!(device.destroyed().len(), 100);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_register_prunes_dropped_resources() {
        let queue = DeletionQueue::new();
        for i in 0..10 {
            let resource: Arc<dyn Releasable> = Arc::new(CountingResource {
                buffer: BufferHandle::from_raw(i),
                releases: AtomicUsize::new(0),
            });
            queue.register(&resource);
        }
        assert_eq!(queue.registered_count(), 1);
    }

    #[test]
    fn test_transfer_keeps_order() {
        let device = DummyDevice::new();
        let retired = DeletionQueue::new();
        let slot = DeletionQueue::new();
        slot.push(DeletionTask::Buffer(BufferHandle::from_raw(1)));
        retired.push(DeletionTask::Buffer(BufferHandle::from_raw(2)));
        retired.push(DeletionTask::Buffer(BufferHandle::from_raw(3)));

        retired.transfer_to(&slot);
        assert!(retired.is_empty());
        assert_eq!(slot.len(), 3);

        slot.flush(&device);
        assert_eq!(
            device.destroyed(),
            vec![
                DeletionTask::Buffer(BufferHandle::from_raw(3)),
                DeletionTask::Buffer(BufferHandle::from_raw(2)),
                DeletionTask::Buffer(BufferHandle::from_raw(1)),
            ]
        );
    }

    #[test]
    fn test_retire_hook_claims_once() {
        let hook = RetireHook::new(Arc::new(DeletionQueue::new()));
        assert!(hook.claim());
        assert!(!hook.claim());
    }

    #[test]
    fn test_task_kind() {
        assert_eq!(
            DeletionTask::Swapchain(SwapchainHandle::from_raw(1)).kind(),
            DeletionKind::Swapchain
        );
        assert_eq!(
            DeletionTask::ImageView(ImageViewHandle::from_raw(1)).kind(),
            DeletionKind::ImageView
        );
    }
}
