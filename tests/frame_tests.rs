//! Frame orchestration integration tests.
//!
//! These drive a full [`RenderContext`] on the dummy device and check the
//! ordering guarantees between frames: the in-flight cap, swapchain
//! recreation, deferred destruction and shutdown.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec4};
use rstest::rstest;

use common::{draw_calls, position_of, TestContext};
use ember_render::backend::{
    DeviceCall, DummyDevice, DummyFailure, Extent2d, GpuDevice, PresentMode, ScriptedOutcome,
};
use ember_render::renderer::ObjectData;
use ember_render::resources::{MaterialDescriptor, Mesh, MeshData};
use ember_render::{
    DeletionKind, DeletionTask, FrameBegin, GraphicsError, RenderCommand, RenderContext,
    RendererConfig, SwapchainStatus, MAX_FRAMES_IN_FLIGHT,
};

fn push_cube(ctx: &mut TestContext, id: u64) {
    let (mesh, material) = ctx.cube(MaterialDescriptor::new("cube"));
    assert!(ctx.context.submit(RenderCommand::PushDraw {
        id,
        object: ObjectData {
            mesh,
            transform: Mat4::IDENTITY,
        },
        material,
    }));
}

// ============================================================================
// Frame Cap
// ============================================================================

/// A third frame cannot start while both slots are still on the GPU.
#[test]
fn test_frame_cap_blocks_until_slot_retires() {
    let mut ctx = TestContext::with_default_config();
    ctx.device.set_auto_signal_fences(false);

    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        let report = ctx.context.render_frame().unwrap();
        assert!(report.begin.is_started());
    }

    let fence = ctx
        .context
        .renderer()
        .swapchain()
        .sync_slot(0)
        .unwrap()
        .in_flight;
    assert!(!ctx.device.is_fence_signaled(fence));

    let device = Arc::clone(&ctx.device);
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        device.signal_fence(fence);
    });

    let start = Instant::now();
    let begin = ctx.context.renderer_mut().begin_frame().unwrap();
    let waited = start.elapsed();
    signaller.join().unwrap();

    assert!(matches!(begin, FrameBegin::Started { slot: 0, .. }), "{begin:?}");
    assert!(waited >= Duration::from_millis(40), "waited only {waited:?}");

    let renderer = ctx.context.renderer_mut();
    renderer.draw_scene().unwrap();
    renderer.end_frame().unwrap();
    renderer.present().unwrap();
    ctx.device.set_auto_signal_fences(true);
}

#[test]
fn test_try_begin_frame_reports_busy_slot() {
    let mut ctx = TestContext::with_default_config();
    ctx.device.set_auto_signal_fences(false);

    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        assert!(ctx.context.render_frame().unwrap().begin.is_started());
    }

    let calls_before = ctx.device.calls().len();
    assert_eq!(
        ctx.context.renderer_mut().try_begin_frame().unwrap(),
        FrameBegin::SlotBusy
    );
    // Nothing was acquired or recorded for the refused frame.
    assert!(!ctx.device.calls()[calls_before..]
        .iter()
        .any(|call| matches!(call, DeviceCall::Acquire { .. } | DeviceCall::BeginCommands(_))));

    let fence = ctx
        .context
        .renderer()
        .swapchain()
        .sync_slot(0)
        .unwrap()
        .in_flight;
    ctx.device.signal_fence(fence);
    assert!(ctx
        .context
        .renderer_mut()
        .try_begin_frame()
        .unwrap()
        .is_started());
    let renderer = ctx.context.renderer_mut();
    renderer.draw_scene().unwrap();
    renderer.end_frame().unwrap();
    renderer.present().unwrap();
}

/// Every submit signals the fence of the slot it was recorded in.
#[test]
fn test_slots_alternate() {
    let mut ctx = TestContext::with_default_config();
    for _ in 0..4 {
        ctx.context.render_frame().unwrap();
    }
    let swapchain = ctx.context.renderer().swapchain();
    let slot0 = swapchain.sync_slot(0).unwrap().in_flight;
    let slot1 = swapchain.sync_slot(1).unwrap().in_flight;
    assert_eq!(
        ctx.device.submitted_fences(),
        vec![slot0, slot1, slot0, slot1]
    );
}

// ============================================================================
// Swapchain Recreation
// ============================================================================

#[rstest]
#[case::vsync(true, PresentMode::Fifo)]
#[case::no_vsync(false, PresentMode::Mailbox)]
fn test_present_mode_follows_vsync(#[case] vsync: bool, #[case] expected: PresentMode) {
    let ctx = TestContext::new(RendererConfig::default().with_vsync(vsync));
    assert_eq!(ctx.context.renderer().swapchain().present_mode(), expected);
}

#[test]
fn test_resize_recreates_after_idle() {
    let mut ctx = TestContext::new(
        RendererConfig::default()
            .with_extent(1920, 1080)
            .with_vsync(true),
    );
    push_cube(&mut ctx, 1);
    ctx.context.render_frame().unwrap();

    let old_handle = ctx.context.renderer().swapchain().handle().unwrap();
    let old_views: Vec<_> = ctx
        .context
        .renderer()
        .swapchain()
        .images()
        .iter()
        .map(|image| image.view)
        .collect();
    let old_targets = *ctx.context.renderer().offscreen_targets().unwrap();
    assert_eq!(old_targets.extent, Extent2d::new(1920, 1080));

    ctx.device.clear_calls();
    ctx.context.resize(Extent2d::new(800, 600));
    let report = ctx.context.render_frame().unwrap();
    assert!(report.begin.is_started());

    let calls = ctx.device.calls();
    let idle = position_of(&calls, |call| matches!(call, DeviceCall::WaitIdle)).unwrap();
    let create = position_of(&calls, |call| {
        matches!(
            call,
            DeviceCall::CreateSwapchain {
                extent: Extent2d {
                    width: 800,
                    height: 600
                },
                present_mode: PresentMode::Fifo,
                old: Some(old),
                ..
            } if *old == old_handle
        )
    })
    .unwrap();
    assert!(idle < create);

    let destroyed = ctx.device.destroyed();
    assert!(destroyed.contains(&DeletionTask::Swapchain(old_handle)));
    for view in old_views {
        assert!(destroyed.contains(&DeletionTask::ImageView(view)));
    }
    assert!(destroyed.contains(&DeletionTask::Image(old_targets.color_image)));
    assert!(destroyed.contains(&DeletionTask::Image(old_targets.depth_image)));

    let renderer = ctx.context.renderer();
    assert_eq!(renderer.swapchain().extent(), Extent2d::new(800, 600));
    assert_eq!(
        renderer.offscreen_targets().unwrap().extent,
        Extent2d::new(800, 600)
    );
    assert_eq!(renderer.stats().swapchain_recreations, 1);
    assert_eq!(ctx.device.live_count(DeletionKind::Swapchain), 1);
}

#[test]
fn test_minimized_window_skips_frames() {
    let mut ctx = TestContext::with_default_config();
    ctx.context.resize(Extent2d::new(0, 0));
    for _ in 0..3 {
        let report = ctx.context.render_frame().unwrap();
        assert_eq!(report.begin, FrameBegin::Skipped);
        assert_eq!(report.present, None);
    }
    assert_eq!(ctx.context.renderer().stats().swapchain_recreations, 0);

    ctx.context.resize(Extent2d::new(1024, 768));
    assert!(ctx.context.render_frame().unwrap().begin.is_started());
    assert_eq!(
        ctx.context.renderer().swapchain().extent(),
        Extent2d::new(1024, 768)
    );
}

#[test]
fn test_out_of_date_acquire_skips_and_recovers() {
    let mut ctx = TestContext::with_default_config();
    ctx.device.script_acquire(ScriptedOutcome::OutOfDate);

    let report = ctx.context.render_frame().unwrap();
    assert_eq!(report.begin, FrameBegin::Skipped);
    assert_eq!(ctx.context.renderer().stats().swapchain_recreations, 1);

    let report = ctx.context.render_frame().unwrap();
    assert!(report.begin.is_started());
    assert_eq!(report.present, Some(SwapchainStatus::Success));
}

#[test]
fn test_suboptimal_present_recreates_next_frame() {
    let mut ctx = TestContext::with_default_config();
    ctx.device.script_present(ScriptedOutcome::Suboptimal);

    let report = ctx.context.render_frame().unwrap();
    assert_eq!(report.present, Some(SwapchainStatus::Suboptimal));
    assert_eq!(ctx.context.renderer().stats().swapchain_recreations, 0);

    ctx.context.render_frame().unwrap();
    assert_eq!(ctx.context.renderer().stats().swapchain_recreations, 1);
}

#[test]
fn test_surface_lost_is_an_error() {
    let mut ctx = TestContext::with_default_config();
    ctx.device.script_acquire(ScriptedOutcome::SurfaceLost);
    let err = ctx.context.render_frame().unwrap_err();
    assert!(matches!(err, GraphicsError::SurfaceLost), "{err:?}");
}

// ============================================================================
// Draw Registry
// ============================================================================

#[test]
fn test_push_replaces_and_pop_removes() {
    let mut ctx = TestContext::with_default_config();
    push_cube(&mut ctx, 7);
    push_cube(&mut ctx, 7);
    let report = ctx.context.render_frame().unwrap();
    assert_eq!(report.commands.executed, 2);
    assert_eq!(ctx.context.renderer().draws().len(), 1);
    assert_eq!(draw_calls(&ctx.device.calls()), vec![36]);

    ctx.device.clear_calls();
    ctx.context.submit(RenderCommand::PopDraw { id: 7 });
    ctx.context.submit(RenderCommand::PopDraw { id: 7 });
    let report = ctx.context.render_frame().unwrap();
    assert_eq!(report.commands.executed, 2);
    assert_eq!(report.commands.failed, 1);
    assert!(ctx.context.renderer().draws().is_empty());
    assert!(draw_calls(&ctx.device.calls()).is_empty());
}

#[test]
fn test_clear_color_reaches_pass() {
    let mut ctx = TestContext::with_default_config();
    let color = Vec4::new(0.2, 0.3, 0.4, 1.0);
    ctx.context.submit(RenderCommand::SetClearColor(color));
    ctx.context.render_frame().unwrap();
    assert_eq!(ctx.context.renderer().clear_color(), color);
}

// ============================================================================
// Deferred Destruction
// ============================================================================

#[test]
fn test_deferred_destroy_waits_for_slot() {
    let mut ctx = TestContext::with_default_config();
    // Not tracked by the renderer, so only the deferred pushes destroy it.
    let mesh = Mesh::upload(&*ctx.device, &MeshData::cube(1.0)).unwrap();
    // Between frames the deferred queue is the one of the frame just presented.
    let (vertex, index) = (mesh.vertex_buffer, mesh.index_buffer);

    ctx.context.render_frame().unwrap();
    let slot = ctx.context.renderer().frame_slot();
    ctx.context
        .renderer()
        .destroy_deferred(DeletionTask::Buffer(vertex));
    ctx.context
        .renderer()
        .destroy_deferred(DeletionTask::Buffer(index));

    // The slot is reused after MAX_FRAMES_IN_FLIGHT frames.
    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        assert!(!ctx
            .device
            .destroyed()
            .contains(&DeletionTask::Buffer(vertex)));
        ctx.context.render_frame().unwrap();
    }
    assert_eq!(ctx.context.renderer().frame_slot(), slot);

    let destroyed = ctx.device.destroyed();
    let index_pos = destroyed
        .iter()
        .position(|task| *task == DeletionTask::Buffer(index))
        .unwrap();
    let vertex_pos = destroyed
        .iter()
        .position(|task| *task == DeletionTask::Buffer(vertex))
        .unwrap();
    assert!(index_pos < vertex_pos);
}

#[test]
fn test_dropped_resources_destroyed_after_slot_reuse() {
    let mut ctx = TestContext::with_default_config();
    let baseline = ctx.device.live_count(DeletionKind::Buffer);

    for _ in 0..8 {
        let (mesh, material) = ctx.cube(MaterialDescriptor::new("scratch"));
        drop(mesh);
        drop(material);
    }
    assert_eq!(ctx.device.live_count(DeletionKind::Buffer), baseline + 8 * 3);
    assert!(ctx.context.deletion_queue().registered_count() <= 2);

    // Retired at the first frame start, destroyed when that slot comes back.
    for _ in 0..MAX_FRAMES_IN_FLIGHT {
        ctx.context.render_frame().unwrap();
        assert_eq!(ctx.device.live_count(DeletionKind::Buffer), baseline + 8 * 3);
    }
    ctx.context.render_frame().unwrap();
    assert_eq!(ctx.device.live_count(DeletionKind::Buffer), baseline);
}

#[test]
fn test_resources_dropped_before_shutdown_are_freed() {
    let mut ctx = TestContext::with_default_config();
    push_cube(&mut ctx, 1);
    ctx.context.render_frame().unwrap();
    for _ in 0..4 {
        let _ = ctx.cube(MaterialDescriptor::new("scratch"));
    }
    let (mesh, material) = ctx.cube(MaterialDescriptor::new("kept"));

    ctx.context.shutdown().unwrap();
    assert_eq!(ctx.device.live_count(DeletionKind::Buffer), 0);

    // Already released by shutdown, dropping them now destroys nothing twice.
    let destroyed = ctx.device.destroyed().len();
    drop(mesh);
    drop(material);
    assert_eq!(ctx.device.destroyed().len(), destroyed);
    assert!(ctx.context.deletion_queue().is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[rstest]
#[case::sampler(DummyFailure::Sampler)]
#[case::layouts(DummyFailure::DescriptorSetLayout)]
#[case::pipeline(DummyFailure::Pipeline)]
#[case::pool(DummyFailure::DescriptorPool)]
#[case::swapchain(DummyFailure::Swapchain)]
#[case::image(DummyFailure::Image)]
#[case::buffer(DummyFailure::Buffer)]
fn test_init_failure_leaves_nothing_alive(#[case] failure: DummyFailure) {
    common::init_logging();
    let device = Arc::new(DummyDevice::new());
    device.inject_failure(failure);
    let dyn_device: Arc<dyn GpuDevice> = device.clone();

    let err = match RenderContext::new(dyn_device, RendererConfig::default()) {
        Ok(_) => panic!("initialization should fail with {failure:?}"),
        Err(err) => err,
    };
    assert!(
        matches!(err, GraphicsError::InitializationFailed { .. }),
        "{err:?}"
    );
    for kind in [
        DeletionKind::Buffer,
        DeletionKind::Image,
        DeletionKind::ImageView,
        DeletionKind::Sampler,
        DeletionKind::Pipeline,
        DeletionKind::DescriptorPool,
        DeletionKind::DescriptorSetLayout,
        DeletionKind::Swapchain,
        DeletionKind::CommandBuffer,
    ] {
        assert_eq!(device.live_count(kind), 0, "{kind:?} leaked");
    }
}

#[test]
fn test_shutdown_drains_commands_and_releases_everything() {
    let mut ctx = TestContext::with_default_config();
    push_cube(&mut ctx, 1);
    ctx.context.render_frame().unwrap();
    push_cube(&mut ctx, 2);

    ctx.context.shutdown().unwrap();
    assert!(ctx.context.commands().is_closed());
    assert!(ctx.context.commands().is_empty());
    assert!(ctx.context.renderer().is_shut_down());
    assert!(!ctx.context.submit(RenderCommand::PopDraw { id: 1 }));
    assert!(ctx.context.deletion_queue().is_empty());

    for kind in [
        DeletionKind::Buffer,
        DeletionKind::Image,
        DeletionKind::ImageView,
        DeletionKind::Sampler,
        DeletionKind::Pipeline,
        DeletionKind::DescriptorPool,
        DeletionKind::DescriptorSetLayout,
        DeletionKind::Fence,
        DeletionKind::Semaphore,
        DeletionKind::Swapchain,
        DeletionKind::CommandBuffer,
    ] {
        assert_eq!(ctx.device.live_count(kind), 0, "{kind:?} leaked");
    }

    // Idempotent
    ctx.context.shutdown().unwrap();
    assert!(ctx.context.render_frame().is_err());
}

#[test]
fn test_failed_frame_is_aborted_and_rendering_recovers() {
    let mut config = RendererConfig::default().with_compute_debug(true);
    config.frame_descriptor_sets = 1;
    let mut ctx = TestContext::new(config);

    // The compute set needs a second pool, which cannot be created.
    ctx.device.inject_failure(DummyFailure::DescriptorPool);
    ctx.device.clear_calls();
    let err = ctx.context.render_frame().unwrap_err();
    assert!(matches!(err, GraphicsError::ResourceCreation { .. }), "{err:?}");

    let calls = ctx.device.calls();
    let submit = position_of(&calls, |call| matches!(call, DeviceCall::Submit { .. }))
        .expect("aborted frame is still submitted");
    let present = position_of(&calls, |call| matches!(call, DeviceCall::Present { .. }))
        .expect("acquired image is handed back");
    assert!(submit < present);
    assert!(draw_calls(&calls).is_empty());
    assert_eq!(ctx.context.renderer().frame_slot(), 1);

    ctx.device.clear_failures();
    for _ in 0..3 {
        let report = ctx.context.render_frame().unwrap();
        assert!(report.begin.is_started());
        assert_eq!(report.present, Some(SwapchainStatus::Success));
    }

    ctx.context.shutdown().unwrap();
    assert_eq!(ctx.device.live_count(DeletionKind::DescriptorPool), 0);
}
