//! Growable descriptor set allocator.
//!
//! Each pool lives in exactly one of three places: `current` (the pool
//! allocations go to), `ready` (empty, reusable) or `full` (exhausted, waiting
//! for [`DescriptorAllocator::clear_pools`]). When the current pool runs out
//! the allocator moves it to `full` and continues with a fresh pool, so
//! callers never see capacity failures.

use crate::backend::{
    BackendError, DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle,
    DescriptorType, GpuDevice, PoolSize,
};
use crate::error::{GraphicsError, GraphicsResult};

/// Upper bound on sets per pool.
pub const MAX_SETS_PER_POOL: u32 = 4092;

const GROWTH_FACTOR: f32 = 1.5;

/// How many descriptors of `ty` a pool reserves per set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSizeRatio {
    pub ty: DescriptorType,
    pub ratio: f32,
}

impl PoolSizeRatio {
    pub const fn new(ty: DescriptorType, ratio: f32) -> Self {
        Self { ty, ratio }
    }
}

#[derive(Debug, Default)]
pub struct DescriptorAllocator {
    ratios: Vec<PoolSizeRatio>,
    current: Option<DescriptorPoolHandle>,
    ready: Vec<DescriptorPoolHandle>,
    full: Vec<DescriptorPoolHandle>,
    next_capacity: u32,
}

impl DescriptorAllocator {
    pub fn new(initial_set_count: u32, ratios: &[PoolSizeRatio]) -> Self {
        let mut allocator = Self::default();
        allocator.init(initial_set_count, ratios);
        allocator
    }

    /// Record the ratio table and the capacity of the first pool.
    ///
    /// Pools are created lazily on the first allocation.
    pub fn init(&mut self, initial_set_count: u32, ratios: &[PoolSizeRatio]) {
        self.ratios = ratios.to_vec();
        self.next_capacity = initial_set_count.clamp(1, MAX_SETS_PER_POOL);
    }

    /// Create the first pool now instead of on the first allocation.
    pub fn preallocate(&mut self, device: &dyn GpuDevice) -> GraphicsResult<()> {
        if self.current.is_none() {
            let pool = self.get_pool(device)?;
            self.current = Some(pool);
        }
        Ok(())
    }

    pub fn allocate(
        &mut self,
        device: &dyn GpuDevice,
        layout: DescriptorSetLayoutHandle,
    ) -> GraphicsResult<DescriptorSetHandle> {
        let pool = self.take_current(device)?;
        match device.allocate_descriptor_set(pool, layout) {
            Ok(set) => {
                self.current = Some(pool);
                Ok(set)
            }
            Err(err) if err.is_pool_exhausted() => {
                log::debug!("DescriptorAllocator: pool {:?} exhausted, growing", pool);
                self.full.push(pool);
                let fresh = self.get_pool(device)?;
                self.current = Some(fresh);
                device
                    .allocate_descriptor_set(fresh, layout)
                    .map_err(GraphicsError::DescriptorAllocation)
            }
            Err(err) => {
                self.current = Some(pool);
                Err(GraphicsError::DescriptorAllocation(err))
            }
        }
    }

    /// Reset every pool and make all of them reusable.
    ///
    /// Every set handed out so far becomes invalid.
    ///
    /// A pool only becomes ready once its reset succeeded. On failure the
    /// remaining pools stay in `full`, still owned, and the call can be retried.
    pub fn clear_pools(&mut self, device: &dyn GpuDevice) -> GraphicsResult<()> {
        for pool in &self.ready {
            device.reset_descriptor_pool(*pool)?;
        }
        if let Some(pool) = self.current.take() {
            self.full.push(pool);
        }
        while let Some(&pool) = self.full.last() {
            device.reset_descriptor_pool(pool)?;
            self.full.pop();
            self.ready.push(pool);
        }
        Ok(())
    }

    /// Destroy every pool.
    pub fn destroy_pools(&mut self, device: &dyn GpuDevice) {
        for pool in self.drain_pools() {
            device.destroy_descriptor_pool(pool);
        }
    }

    /// Hand every pool over to the caller, leaving the allocator empty.
    pub fn drain_pools(&mut self) -> Vec<DescriptorPoolHandle> {
        self.current
            .take()
            .into_iter()
            .chain(self.ready.drain(..))
            .chain(self.full.drain(..))
            .collect()
    }

    /// Total number of pools owned.
    pub fn pool_count(&self) -> usize {
        self.current.iter().count() + self.ready.len() + self.full.len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn full_count(&self) -> usize {
        self.full.len()
    }

    /// Set capacity of the next pool that has to be created.
    pub fn next_pool_capacity(&self) -> u32 {
        self.next_capacity
    }

    fn take_current(&mut self, device: &dyn GpuDevice) -> GraphicsResult<DescriptorPoolHandle> {
        match self.current.take() {
            Some(pool) => Ok(pool),
            None => self.get_pool(device),
        }
    }

    fn get_pool(&mut self, device: &dyn GpuDevice) -> GraphicsResult<DescriptorPoolHandle> {
        if let Some(pool) = self.ready.pop() {
            return Ok(pool);
        }
        let capacity = self.next_capacity.max(1);
        let pool = self
            .create_pool(device, capacity)
            .map_err(GraphicsError::creation("descriptor pool"))?;
        self.next_capacity =
            ((capacity as f32 * GROWTH_FACTOR) as u32).min(MAX_SETS_PER_POOL);
        log::debug!(
            "DescriptorAllocator: created pool {:?} with {} sets",
            pool,
            capacity
        );
        Ok(pool)
    }

    fn create_pool(
        &self,
        device: &dyn GpuDevice,
        max_sets: u32,
    ) -> Result<DescriptorPoolHandle, BackendError> {
        let sizes: Vec<PoolSize> = self
            .ratios
            .iter()
            .map(|ratio| PoolSize {
                ty: ratio.ty,
                count: ((ratio.ratio * max_sets as f32) as u32).max(1),
            })
            .collect();
        device.create_descriptor_pool(max_sets, &sizes)
    }
}

impl Drop for DescriptorAllocator {
    fn drop(&mut self) {
        let leaked = self.pool_count();
        if leaked > 0 {
            log::error!(
                "DescriptorAllocator dropped with {} pools still alive",
                leaked
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        DescriptorBinding, DummyDevice, DummyFailure, ShaderStages,
    };
    use crate::deletion_queue::DeletionKind;

    fn ratios() -> Vec<PoolSizeRatio> {
        vec![PoolSizeRatio::new(DescriptorType::UniformBuffer, 1.0)]
    }

    fn layout(device: &DummyDevice) -> DescriptorSetLayoutHandle {
        device
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::UniformBuffer,
                count: 1,
                stages: ShaderStages::VERTEX_FRAGMENT,
            }])
            .unwrap()
    }

    #[test]
    fn test_lazy_first_pool() {
        let mut allocator = DescriptorAllocator::new(4, &ratios());
        assert_eq!(allocator.pool_count(), 0);
        assert_eq!(allocator.next_pool_capacity(), 4);
        allocator.destroy_pools(&DummyDevice::new());
    }

    #[test]
    fn test_preallocate_creates_one_pool() {
        let device = DummyDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocator::new(4, &ratios());
        allocator.preallocate(&device).unwrap();
        allocator.preallocate(&device).unwrap();
        assert_eq!(allocator.pool_count(), 1);

        allocator.allocate(&device, layout).unwrap();
        assert_eq!(allocator.pool_count(), 1);
        allocator.destroy_pools(&device);
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let device = DummyDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocator::new(4, &ratios());

        for _ in 0..4 {
            allocator.allocate(&device, layout).unwrap();
        }
        assert_eq!(allocator.pool_count(), 1);
        assert_eq!(allocator.next_pool_capacity(), 6);

        allocator.allocate(&device, layout).unwrap();
        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(allocator.full_count(), 1);
        assert_eq!(allocator.next_pool_capacity(), 9);

        allocator.destroy_pools(&device);
        assert_eq!(device.live_count(DeletionKind::DescriptorPool), 0);
    }

    #[test]
    fn test_capacity_is_capped() {
        let device = DummyDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocator::new(4000, &ratios());
        allocator.allocate(&device, layout).unwrap();
        assert_eq!(allocator.next_pool_capacity(), MAX_SETS_PER_POOL);
        allocator.destroy_pools(&device);
    }

    #[test]
    fn test_clear_pools_recycles_everything() {
        let device = DummyDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocator::new(2, &ratios());
        for _ in 0..5 {
            allocator.allocate(&device, layout).unwrap();
        }
        let pools = allocator.pool_count();

        allocator.clear_pools(&device).unwrap();
        assert_eq!(allocator.ready_count(), pools);
        assert_eq!(allocator.full_count(), 0);

        // Recycled pools are reused before new ones are created.
        allocator.allocate(&device, layout).unwrap();
        assert_eq!(allocator.pool_count(), pools);
        allocator.destroy_pools(&device);
    }

    #[test]
    fn test_failed_reset_keeps_pools_owned() {
        let device = DummyDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocator::new(1, &ratios());
        for _ in 0..3 {
            allocator.allocate(&device, layout).unwrap();
        }
        assert_eq!(allocator.pool_count(), 3);

        device.inject_failure(DummyFailure::DescriptorPoolReset);
        assert!(allocator.clear_pools(&device).is_err());
        assert_eq!(allocator.pool_count(), 3);
        assert_eq!(allocator.ready_count(), 0);

        device.clear_failures();
        allocator.clear_pools(&device).unwrap();
        assert_eq!(allocator.ready_count(), 3);
        assert_eq!(allocator.full_count(), 0);

        allocator.destroy_pools(&device);
        assert_eq!(device.live_count(DeletionKind::DescriptorPool), 0);
    }

    #[test]
    fn test_fragmented_pool_grows_and_retries() {
        let device = DummyDevice::new();
        let layout = layout(&device);
        let mut allocator = DescriptorAllocator::new(8, &ratios());
        allocator.preallocate(&device).unwrap();

        device.script_allocation_failure(BackendError::FragmentedPool);
        allocator.allocate(&device, layout).unwrap();
        assert_eq!(allocator.pool_count(), 2);
        assert_eq!(allocator.full_count(), 1);
        assert_eq!(allocator.next_pool_capacity(), 18);

        // Any other error is returned as is and keeps the current pool.
        device.script_allocation_failure(BackendError::Api("device lost".into()));
        assert_eq!(
            allocator.allocate(&device, layout),
            Err(GraphicsError::DescriptorAllocation(BackendError::Api(
                "device lost".into()
            )))
        );
        assert_eq!(allocator.pool_count(), 2);
        allocator.allocate(&device, layout).unwrap();
        assert_eq!(allocator.pool_count(), 2);

        allocator.destroy_pools(&device);
    }

    #[test]
    fn test_second_failure_is_fatal() {
        let device = DummyDevice::new();
        // Layout needs a descriptor type the ratio table never provides.
        let storage_layout = device
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::StorageImage,
                count: 1,
                stages: ShaderStages::COMPUTE,
            }])
            .unwrap();
        let mut allocator = DescriptorAllocator::new(4, &ratios());

        let err = allocator.allocate(&device, storage_layout).unwrap_err();
        assert_eq!(
            err,
            GraphicsError::DescriptorAllocation(BackendError::OutOfPoolMemory)
        );
        allocator.destroy_pools(&device);
    }

    #[test]
    fn test_pool_creation_failure_propagates() {
        let device = DummyDevice::new();
        let layout = layout(&device);
        device.inject_failure(DummyFailure::DescriptorPool);
        let mut allocator = DescriptorAllocator::new(4, &ratios());
        assert!(matches!(
            allocator.allocate(&device, layout),
            Err(GraphicsError::ResourceCreation { .. })
        ));
    }
}
