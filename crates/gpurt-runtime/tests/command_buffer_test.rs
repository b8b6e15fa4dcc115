//! Integration test: command buffers
//!
//! Drives command buffers through their lifecycle on the null driver and
//! checks what actually reaches the driver: redundant state is elided,
//! `end_rendering` is deferred and merged across passes over the same
//! targets, and sync tokens follow submissions across resets.
//!
//! Run with: cargo test --test command_buffer_test -- --nocapture

use std::sync::Arc;
use std::time::Duration;

use ash::vk::{self, Handle};
use gpurt_core::config::SyncConfig;
use gpurt_runtime::driver::RecordedCommand;
use gpurt_runtime::{
    ColorAttachment, CommandBufferState, Device, Driver, ErrorClass, GraphicsState,
    LayoutBinding, LayoutDesc, NullDriver, Pipeline, PipelineDesc, PipelineLayoutDesc,
    PushConstantRange, Rect, RenderTargets, RuntimeConfig, RuntimeError, ShaderDesc, Viewport,
};

/// Null driver whose fences only signal when told to. Waits are bounded so a
/// broken test fails instead of hanging.
fn make_manual_device() -> (Arc<NullDriver>, Device) {
    gpurt_common::logging::try_init_logging();
    let null = Arc::new(NullDriver::manual());
    let driver: Arc<dyn Driver> = null.clone();
    let config = RuntimeConfig {
        sync: SyncConfig {
            default_wait_timeout_ns: 200_000_000,
        },
        ..RuntimeConfig::default()
    };
    let device = Device::new(driver, config).expect("device");
    (null, device)
}

fn spirv(seed: u32) -> Vec<u32> {
    vec![0x0723_0203, 0x0001_0000, seed, 8, 0]
}

fn pipeline_layout(device: &Device) -> Arc<gpurt_runtime::PipelineLayout> {
    let set_layout = device
        .create_descriptor_set_layout(&LayoutDesc::new(vec![LayoutBinding::new(
            0,
            vk::DescriptorType::UNIFORM_BUFFER,
            1,
            vk::ShaderStageFlags::ALL,
        )]))
        .expect("set layout");
    device
        .create_pipeline_layout(
            &PipelineLayoutDesc::new(vec![set_layout]).with_push_constants(PushConstantRange {
                stages: vk::ShaderStageFlags::ALL,
                offset: 0,
                size: 16,
            }),
        )
        .expect("pipeline layout")
}

fn graphics_pipeline(device: &Device, seed: u32) -> Arc<Pipeline> {
    let vs = device
        .create_shader_module(&ShaderDesc::new(spirv(seed), vk::ShaderStageFlags::VERTEX))
        .expect("vs");
    let fs = device
        .create_shader_module(&ShaderDesc::new(spirv(seed + 1), vk::ShaderStageFlags::FRAGMENT))
        .expect("fs");
    let state = GraphicsState::default().with_color_format(vk::Format::R8G8B8A8_UNORM);
    device
        .create_pipeline(&PipelineDesc::graphics(vec![vs, fs], pipeline_layout(device), state))
        .expect("graphics pipeline")
}

fn compute_pipeline(device: &Device) -> Arc<Pipeline> {
    let cs = device
        .create_shader_module(&ShaderDesc::new(spirv(99), vk::ShaderStageFlags::COMPUTE))
        .expect("cs");
    device
        .create_pipeline(&PipelineDesc::compute(cs, pipeline_layout(device)))
        .expect("compute pipeline")
}

fn targets(view: u64) -> RenderTargets {
    RenderTargets::new(Rect::from_extent(640, 480)).with_color(ColorAttachment::cleared(
        vk::ImageView::from_raw(view),
        [0.0, 0.0, 0.0, 1.0],
    ))
}

fn is_end(c: &RecordedCommand) -> bool {
    matches!(c, RecordedCommand::EndRendering)
}

fn is_begin(c: &RecordedCommand) -> bool {
    matches!(c, RecordedCommand::BeginRendering(_))
}

#[test]
fn test_lifecycle_state_machine() {
    let (null, device) = make_manual_device();
    let mut cb = device.create_command_buffer().expect("command buffer");
    assert_eq!(cb.state(), CommandBufferState::Initial);

    match cb.submit() {
        Err(RuntimeError::InvalidState { op, state }) => {
            println!("submit from initial rejected: {} while {}", op, state);
            assert_eq!(state, "initial");
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }

    cb.begin().expect("begin");
    assert_eq!(cb.state(), CommandBufferState::Recording);
    match cb.reset() {
        Err(e @ RuntimeError::InvalidState { .. }) => {
            assert_eq!(e.class(), ErrorClass::StateViolation);
        }
        other => panic!("expected InvalidState on reset while recording, got {:?}", other),
    }

    cb.end().expect("end");
    assert_eq!(cb.state(), CommandBufferState::Executable);

    let token = cb.submit().expect("submit");
    assert_eq!(cb.state(), CommandBufferState::Pending);
    assert_eq!(token.submit_id(), 1);
    assert_eq!(null.submit_count(), 1);

    match cb.reset() {
        Err(RuntimeError::StillInFlight { submit_id }) => {
            println!("reset rejected while submission {} in flight", submit_id);
            assert_eq!(submit_id, 1);
        }
        other => panic!("expected StillInFlight, got {:?}", other),
    }
    assert_eq!(cb.state(), CommandBufferState::Pending);

    assert!(null.complete_fence(cb.tracker().fence()));
    assert_eq!(cb.poll().expect("poll"), CommandBufferState::Complete);

    cb.reset().expect("reset after completion");
    assert_eq!(cb.state(), CommandBufferState::Initial);

    // Second round reuses the same fence.
    cb.begin().expect("begin again");
    cb.end().expect("end again");
    let second = cb.submit().expect("resubmit");
    assert_eq!(second.submit_id(), 2);
    null.complete_all();
    assert!(second.wait_for_complete().expect("wait"));
    assert_eq!(cb.poll().expect("poll"), CommandBufferState::Complete);
}

#[test]
fn test_redundant_state_is_elided() {
    let (null, device) = make_manual_device();
    let pipeline = graphics_pipeline(&device, 1);
    let mut cb = device.create_command_buffer().expect("command buffer");

    cb.begin().expect("begin");
    cb.bind_pipeline(&pipeline).expect("bind");
    cb.bind_pipeline(&pipeline).expect("bind again");
    cb.set_viewport(Viewport::from_extent(640, 480)).expect("viewport");
    cb.set_viewport(Viewport::from_extent(640, 480)).expect("viewport again");
    cb.set_scissor(Rect::from_extent(640, 480)).expect("scissor");
    cb.set_scissor(Rect::from_extent(640, 480)).expect("scissor again");
    cb.set_scissor(Rect::from_extent(320, 240)).expect("scissor changed");

    let vb = vk::Buffer::from_raw(0x7000);
    cb.bind_vertex_buffers(0, &[(vb, 0)]).expect("vertex buffers");
    cb.bind_vertex_buffers(0, &[(vb, 0)]).expect("vertex buffers again");
    cb.bind_vertex_buffers(0, &[(vb, 256)]).expect("vertex buffers moved");

    let ib = vk::Buffer::from_raw(0x7001);
    cb.bind_index_buffer(ib, 0, vk::IndexType::UINT16).expect("index buffer");
    cb.bind_index_buffer(ib, 0, vk::IndexType::UINT16).expect("index buffer again");

    // Push constants are never elided.
    cb.push_constants(vk::ShaderStageFlags::ALL, 0, &[1.0f32, 2.0, 3.0, 4.0])
        .expect("push");
    cb.push_constants(vk::ShaderStageFlags::ALL, 0, &[1.0f32, 2.0, 3.0, 4.0])
        .expect("push again");

    let commands = null.commands(cb.handle());
    let count = |pred: fn(&RecordedCommand) -> bool| commands.iter().filter(|c| pred(c)).count();
    assert_eq!(count(|c| matches!(c, RecordedCommand::BindPipeline { .. })), 1);
    assert_eq!(count(|c| matches!(c, RecordedCommand::SetViewport(_))), 1);
    assert_eq!(count(|c| matches!(c, RecordedCommand::SetScissor(_))), 2);
    assert_eq!(count(|c| matches!(c, RecordedCommand::BindVertexBuffers { .. })), 2);
    assert_eq!(count(|c| matches!(c, RecordedCommand::BindIndexBuffer { .. })), 1);
    assert_eq!(count(|c| matches!(c, RecordedCommand::PushConstants { .. })), 2);

    let stats = cb.stats();
    println!("stats: {:?}", stats);
    assert_eq!(stats.emitted, commands.len() as u64);
    assert_eq!(stats.elided, 5);

    cb.end().expect("end");
}

#[test]
fn test_end_rendering_is_deferred_and_merged() {
    let (null, device) = make_manual_device();
    let pipeline = graphics_pipeline(&device, 1);
    let mut cb = device.create_command_buffer().expect("command buffer");

    cb.begin().expect("begin");
    cb.bind_pipeline(&pipeline).expect("bind");

    cb.begin_rendering(&targets(0x100)).expect("pass 1");
    cb.draw(3, 1, 0, 0).expect("draw 1");
    cb.end_rendering().expect("end pass 1");
    assert!(!cb.in_rendering());

    // Same targets: the deferred end and this begin cancel out.
    cb.begin_rendering(&targets(0x100)).expect("pass 2");
    assert!(cb.in_rendering());
    cb.draw(3, 1, 0, 0).expect("draw 2");
    cb.end_rendering().expect("end pass 2");

    // Different targets: the deferred end is emitted first.
    cb.begin_rendering(&targets(0x200)).expect("pass 3");
    cb.draw(6, 1, 0, 0).expect("draw 3");
    cb.end_rendering().expect("end pass 3");

    let before_end = null.commands(cb.handle());
    assert_eq!(before_end.iter().filter(|c| is_begin(c)).count(), 2);
    assert_eq!(before_end.iter().filter(|c| is_end(c)).count(), 1);

    cb.end().expect("end");
    let commands = null.commands(cb.handle());
    let shape: Vec<&str> = commands
        .iter()
        .map(|c| match c {
            RecordedCommand::BindPipeline { .. } => "bind",
            RecordedCommand::BeginRendering(_) => "begin",
            RecordedCommand::EndRendering => "end",
            RecordedCommand::Draw { .. } => "draw",
            other => panic!("unexpected command {:?}", other),
        })
        .collect();
    println!("recorded: {:?}", shape);
    assert_eq!(
        shape,
        vec!["bind", "begin", "draw", "draw", "end", "begin", "draw", "end"]
    );
}

#[test]
fn test_end_rendering_without_pass_is_rejected() {
    let (_null, device) = make_manual_device();
    let mut cb = device.create_command_buffer().expect("command buffer");
    cb.begin().expect("begin");

    match cb.end_rendering() {
        Err(RuntimeError::InvalidState { op, .. }) => assert_eq!(op, "end_rendering"),
        other => panic!("expected InvalidState, got {:?}", other),
    }

    cb.begin_rendering(&targets(0x100)).expect("pass");
    cb.end_rendering().expect("end pass");
    match cb.end_rendering() {
        Err(RuntimeError::InvalidState { .. }) => println!("double end rejected"),
        other => panic!("expected InvalidState on double end, got {:?}", other),
    }
    cb.end().expect("end");
}

#[test]
fn test_draw_and_dispatch_preconditions() {
    let (null, device) = make_manual_device();
    let graphics = graphics_pipeline(&device, 1);
    let compute = compute_pipeline(&device);
    let mut cb = device.create_command_buffer().expect("command buffer");
    cb.begin().expect("begin");

    match cb.draw(3, 1, 0, 0) {
        Err(RuntimeError::NoPipelineBound { op }) => assert_eq!(op, "draw"),
        other => panic!("expected NoPipelineBound, got {:?}", other),
    }
    match cb.push_constant_bytes(vk::ShaderStageFlags::ALL, 0, &[0u8; 4]) {
        Err(RuntimeError::NoPipelineBound { .. }) => {}
        other => panic!("expected NoPipelineBound for push constants, got {:?}", other),
    }

    cb.bind_pipeline(&graphics).expect("bind graphics");
    match cb.draw(3, 1, 0, 0) {
        Err(RuntimeError::InvalidState { state, .. }) => {
            println!("draw outside a pass rejected: {}", state);
        }
        other => panic!("expected InvalidState, got {:?}", other),
    }

    cb.begin_rendering(&targets(0x100)).expect("pass");
    match cb.draw_indexed(3, 1, 0, 0, 0) {
        Err(RuntimeError::InvalidState { op, .. }) => assert_eq!(op, "draw_indexed"),
        other => panic!("expected InvalidState without index buffer, got {:?}", other),
    }
    match cb.dispatch(1, 1, 1) {
        Err(RuntimeError::NoPipelineBound { op }) => assert_eq!(op, "dispatch"),
        other => panic!("expected NoPipelineBound for dispatch, got {:?}", other),
    }

    // A dispatch closes the open pass before it is recorded.
    cb.bind_pipeline(&compute).expect("bind compute");
    cb.dispatch(8, 8, 1).expect("dispatch");
    assert!(!cb.in_rendering());

    let commands = null.commands(cb.handle());
    let end_at = commands.iter().position(is_end).expect("end emitted");
    let dispatch_at = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::Dispatch { x: 8, y: 8, z: 1 }))
        .expect("dispatch recorded");
    assert!(end_at < dispatch_at);
    cb.end().expect("end");

    assert_eq!(cb.retained(), (2, 0));
}

#[test]
fn test_retained_objects_released_on_reset() {
    let (null, device) = make_manual_device();
    let pipeline = graphics_pipeline(&device, 40);
    let pool = device.create_binding_pool().expect("pool");
    let instance = pool
        .allocate(&pipeline.layout().set_layouts()[0])
        .expect("instance");
    instance
        .write(0, 0, gpurt_runtime::BindingResource::whole_buffer(vk::Buffer::from_raw(0x5000)))
        .expect("write");

    let mut cb = device.create_command_buffer().expect("command buffer");
    cb.begin().expect("begin");
    cb.bind_pipeline(&pipeline).expect("bind");
    cb.bind_binding_set(0, &instance).expect("bind set");
    cb.bind_binding_set(0, &instance).expect("bind set again");
    cb.end().expect("end");
    assert_eq!(cb.retained(), (1, 1));
    assert_eq!(cb.stats().elided, 1);

    let handle = pipeline.handle();
    drop(pipeline);
    drop(instance);
    // The command buffer still holds both.
    assert_eq!(device.cache_counts().pipelines, 1);
    assert_eq!(pool.live_count(), 1);

    let token = cb.submit().expect("submit");
    null.complete_all();
    token.wait_for_complete().expect("wait");
    cb.reset().expect("reset");
    assert_eq!(cb.retained(), (0, 0));
    assert_eq!(device.cache_counts().pipelines, 0);
    assert_eq!(pool.live_count(), 0);
    println!("pipeline {:?} released after reset", handle);
}

#[test]
fn test_sync_token_follows_submissions() {
    let (null, device) = make_manual_device();
    let mut cb = device.create_command_buffer().expect("command buffer");

    let never = cb.get_sync();
    assert_eq!(never.submit_id(), 0);
    assert!(never.is_complete().expect("query"), "never-submitted token is complete");

    cb.begin().expect("begin");
    cb.end().expect("end");
    let first = cb.submit().expect("submit");
    assert!(!first.is_complete().expect("query"));
    assert!(first.same_tracker(&cb.get_sync()));

    match first.wait_timeout(Duration::from_millis(5)) {
        Ok(false) => println!("bounded wait timed out as expected"),
        other => panic!("expected timeout, got {:?}", other),
    }
    match first.wait_or_timeout(1_000_000) {
        Err(RuntimeError::Timeout { timeout_ns }) => assert_eq!(timeout_ns, 1_000_000),
        other => panic!("expected Timeout, got {:?}", other),
    }

    null.complete_all();
    assert!(first.is_complete().expect("query"));
    cb.reset().expect("reset");

    cb.begin().expect("begin");
    cb.end().expect("end");
    let second = cb.submit().expect("submit");

    // The old token refers to finished work even though the fence was reset.
    assert!(first.is_complete().expect("query old"));
    assert!(!second.is_complete().expect("query new"));
    assert!(first.same_tracker(&second));

    null.complete_all();
    assert!(second.wait_for_complete().expect("wait"));
}

#[test]
fn test_token_outlives_command_buffer() {
    let (null, device) = make_manual_device();
    let mut cb = device.create_command_buffer().expect("command buffer");
    cb.begin().expect("begin");
    cb.end().expect("end");
    let token = cb.submit().expect("submit");
    null.complete_all();
    drop(cb);

    assert!(token.is_complete().expect("query"));
    println!("token after drop: {:?}", token);
}

#[test]
fn test_wait_list_drained_by_submit() {
    let (null, device) = make_manual_device();
    let mut producer = device.create_command_buffer().expect("producer");
    let mut consumer = device.create_command_buffer().expect("consumer");

    producer.begin().expect("begin");
    producer.end().expect("end");
    let produced = producer.submit_signaling().expect("submit producer");
    let semaphore = produced.claim_semaphore().expect("semaphore signaled");
    assert_eq!(semaphore, producer.tracker().semaphore());
    assert!(null.semaphore_signaled(semaphore));

    consumer
        .wait_list()
        .add_wait(semaphore, vk::PipelineStageFlags::COMPUTE_SHADER);
    assert!(!consumer.wait_list().is_empty());

    consumer.begin().expect("begin");
    consumer.end().expect("end");
    consumer.submit().expect("submit consumer");
    assert!(consumer.wait_list().is_empty());
    assert!(!null.semaphore_signaled(semaphore), "wait consumed the signal");
    assert_eq!(null.submit_count(), 2);

    assert_eq!(null.complete_all(), 2);
}

#[test]
fn test_plain_submit_leaves_semaphore_unsignaled() {
    let (null, device) = make_manual_device();
    let mut cb = device.create_command_buffer().expect("command buffer");
    let semaphore = cb.tracker().semaphore();

    for round in 1..=3u64 {
        cb.begin().expect("begin");
        cb.end().expect("end");
        let token = cb.submit().expect("submit");
        assert_eq!(token.submit_id(), round);
        assert!(!null.semaphore_signaled(semaphore));
        assert_eq!(token.claim_semaphore(), None);
        null.complete_all();
        cb.reset().expect("reset");
    }
    println!("three plain submissions, semaphore never signaled");
}

#[test]
fn test_signaling_submit_requires_claim() {
    let (null, device) = make_manual_device();
    let mut cb = device.create_command_buffer().expect("command buffer");
    let mut waiter = device.create_command_buffer().expect("waiter");

    cb.begin().expect("begin");
    cb.end().expect("end");
    let first = cb.submit_signaling().expect("first signaling submit");
    null.complete_all();
    cb.reset().expect("reset");

    // The signal from the first round is still unclaimed.
    cb.begin().expect("begin");
    cb.end().expect("end");
    match cb.submit_signaling() {
        Err(e @ RuntimeError::SemaphoreUnclaimed { .. }) => {
            println!("second signal refused: {}", e);
            assert_eq!(e.class(), ErrorClass::StateViolation);
        }
        other => panic!("expected SemaphoreUnclaimed, got {:?}", other),
    }
    assert_eq!(cb.state(), CommandBufferState::Executable);
    assert_eq!(cb.submit_id(), 1);

    let semaphore = first.claim_semaphore().expect("claim");
    assert_eq!(first.claim_semaphore(), None, "claimed only once");
    waiter
        .wait_list()
        .add_wait(semaphore, vk::PipelineStageFlags::ALL_COMMANDS);
    waiter.begin().expect("begin waiter");
    waiter.end().expect("end waiter");
    waiter.submit().expect("submit waiter");

    let second = cb.submit_signaling().expect("signal after claim");
    assert_eq!(second.submit_id(), 2);
    assert_eq!(first.claim_semaphore(), None, "stale token cannot claim");
    assert_eq!(second.claim_semaphore(), Some(semaphore));
    null.complete_all();
}

#[test]
fn test_failed_submit_leaves_tracker_unchanged() {
    let (null, device) = make_manual_device();
    let mut cb = device.create_command_buffer().expect("command buffer");

    cb.begin().expect("begin");
    cb.end().expect("end");
    cb.submit().expect("submit");
    null.complete_all();
    cb.reset().expect("reset");

    cb.begin().expect("begin");
    cb.end().expect("end");
    let external = vk::Semaphore::from_raw(0xdead);
    cb.wait_list()
        .add_wait(external, vk::PipelineStageFlags::TOP_OF_PIPE);

    null.set_device_lost(true);
    match cb.submit_signaling() {
        Err(e @ RuntimeError::Driver { .. }) => println!("submit failed: {}", e),
        other => panic!("expected Driver error, got {:?}", other),
    }

    println!("state after failed submit: {}, submit_id {}", cb.state(), cb.submit_id());
    assert_eq!(cb.state(), CommandBufferState::Executable);
    assert_eq!(cb.submit_id(), 1);
    assert!(!cb.wait_list().is_empty(), "drained waits were restored");

    // The token names the last real submission, which finished. No fence
    // query is needed, so even a lost device answers at once.
    let token = cb.get_sync();
    assert_eq!(token.submit_id(), 1);
    assert!(token.is_complete().expect("query"));
    let started = std::time::Instant::now();
    assert!(token.wait_timeout(Duration::from_secs(5)).expect("wait"));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(token.claim_semaphore(), None);

    // Retry once the device is back; the restored wait goes with it.
    null.set_device_lost(false);
    let retried = cb.submit_signaling().expect("retry");
    assert_eq!(retried.submit_id(), 2);
    assert!(cb.wait_list().is_empty());
    assert!(!retried.is_complete().expect("query"));
    assert!(retried.claim_semaphore().is_some());
    assert_eq!(null.submit_count(), 2);

    null.complete_all();
    assert!(retried.wait_for_complete().expect("wait"));
}

#[test]
fn test_mesh_tasks_require_driver_support() {
    gpurt_common::logging::try_init_logging();
    let null = Arc::new(NullDriver::manual().without_mesh_tasks());
    let driver: Arc<dyn Driver> = null.clone();
    let device = Device::new(driver, RuntimeConfig::default()).expect("device");
    let pipeline = graphics_pipeline(&device, 70);
    let mut cb = device.create_command_buffer().expect("command buffer");

    cb.begin().expect("begin");
    cb.bind_pipeline(&pipeline).expect("bind");
    cb.begin_rendering(&targets(0x300)).expect("pass");
    let before = cb.stats();
    match cb.draw_mesh_tasks(4, 1, 1) {
        Err(e @ RuntimeError::Unsupported { .. }) => {
            println!("mesh draw refused: {}", e);
            assert_eq!(e.class(), ErrorClass::Driver);
        }
        other => panic!("expected Unsupported, got {:?}", other),
    }
    assert_eq!(cb.stats(), before);
    assert!(!null
        .commands(cb.handle())
        .iter()
        .any(|c| matches!(c, RecordedCommand::DrawMeshTasks { .. })));

    cb.draw(3, 1, 0, 0).expect("plain draw still works");
    cb.end().expect("end");
}

#[test]
fn test_device_loss_surfaces_as_driver_error() {
    let (null, device) = make_manual_device();
    let mut cb = device.create_command_buffer().expect("command buffer");
    cb.begin().expect("begin");
    cb.end().expect("end");
    let token = cb.submit().expect("submit");

    null.set_device_lost(true);
    match token.is_complete() {
        Err(e @ RuntimeError::Driver { .. }) => {
            println!("device loss reported: {}", e);
            assert_eq!(e.class(), ErrorClass::Driver);
        }
        other => panic!("expected Driver error, got {:?}", other),
    }

    null.set_device_lost(false);
    null.complete_all();
    assert!(token.wait_for_complete().expect("wait"));
}
