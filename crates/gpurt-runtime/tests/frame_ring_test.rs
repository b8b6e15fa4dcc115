//! Integration test: frame ring
//!
//! Submits frames against a null driver whose fences only signal on demand,
//! so the ring has to grow instead of waiting, and checks that a bounded
//! ring waits on its oldest frame once it reaches `max_frames`.
//!
//! Run with: cargo test --test frame_ring_test -- --nocapture

use std::sync::Arc;

use ash::vk;
use gpurt_core::config::{FrameRingConfig, SyncConfig};
use gpurt_runtime::driver::ObjectKind;
use gpurt_runtime::{
    CommandBufferState, Device, Driver, NullDriver, RuntimeConfig, RuntimeError,
};

fn make_device(frame_ring: FrameRingConfig, wait_timeout_ns: u64) -> (Arc<NullDriver>, Device) {
    gpurt_common::logging::try_init_logging();
    let null = Arc::new(NullDriver::manual());
    let driver: Arc<dyn Driver> = null.clone();
    let config = RuntimeConfig {
        sync: SyncConfig {
            default_wait_timeout_ns: wait_timeout_ns,
        },
        frame_ring,
        ..RuntimeConfig::default()
    };
    let device = Device::new(driver, config).expect("device");
    (null, device)
}

fn record_empty(ring: &mut gpurt_runtime::FrameRing) {
    let cb = ring.current().command_buffer();
    cb.begin().expect("begin");
    cb.end().expect("end");
}

#[test]
fn test_ring_reuses_completed_frames() {
    let (null, device) = make_device(FrameRingConfig::default(), 200_000_000);
    let mut ring = device.create_frame_ring().expect("ring");
    assert_eq!(ring.len(), 2);

    for frame in 0..6 {
        let index = ring.current_index();
        record_empty(&mut ring);
        let token = ring.submit().expect("submit");
        null.complete_all();
        token.wait_for_complete().expect("wait");
        println!("frame {} submitted from slot {}", frame, index);
    }

    assert_eq!(ring.len(), 2, "completed frames are reused");
    assert_eq!(
        ring.current().command_buffer().state(),
        CommandBufferState::Initial
    );
    assert_eq!(null.submit_count(), 6);
}

#[test]
fn test_ring_grows_while_gpu_lags() {
    let (null, device) = make_device(FrameRingConfig::default(), 200_000_000);
    let mut ring = device.create_frame_ring().expect("ring");

    let mut tokens = Vec::new();
    for _ in 0..5 {
        record_empty(&mut ring);
        tokens.push(ring.submit().expect("submit"));
    }
    println!("ring grew to {} frames", ring.len());
    assert_eq!(ring.len(), 6);
    assert!(tokens.iter().all(|t| !t.is_complete().expect("query")));

    // Each growth inserts right after the submitted frame, so the ring never
    // lands on a frame that is still in flight.
    assert_eq!(
        ring.current().command_buffer().state(),
        CommandBufferState::Initial
    );

    null.complete_all();
    for token in &tokens {
        assert!(token.wait_for_complete().expect("wait"));
    }

    // After the GPU catches up the grown ring is recycled without growing.
    let len = ring.len();
    for _ in 0..len * 2 {
        record_empty(&mut ring);
        ring.submit().expect("submit");
        null.complete_all();
    }
    assert_eq!(ring.len(), len);
}

#[test]
fn test_bounded_ring_waits_on_oldest_frame() {
    let config = FrameRingConfig {
        initial_frames: 2,
        max_frames: Some(2),
    };
    let (null, device) = make_device(config, 5_000_000);
    let mut ring = device.create_frame_ring().expect("ring");

    record_empty(&mut ring);
    ring.submit().expect("first submit");
    record_empty(&mut ring);

    // The next frame is still in flight and the ring may not grow.
    match ring.submit() {
        Err(RuntimeError::Timeout { timeout_ns }) => {
            println!("bounded ring timed out after {}ns", timeout_ns);
            assert_eq!(timeout_ns, 5_000_000);
        }
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert_eq!(ring.len(), 2);
    assert_eq!(ring.current_index(), 1);
    assert_eq!(
        ring.current().command_buffer().state(),
        CommandBufferState::Executable,
        "a timed-out submit leaves the frame unsubmitted"
    );

    null.complete_all();
    ring.submit().expect("retry after completion");
    assert_eq!(ring.current_index(), 0);
    assert_eq!(
        ring.current().command_buffer().state(),
        CommandBufferState::Initial
    );
    assert_eq!(null.submit_count(), 2);
    null.complete_all();
}

#[test]
fn test_frame_objects_released_with_ring() {
    let (null, device) = make_device(FrameRingConfig::default(), 200_000_000);
    let mut ring = device.create_frame_ring().expect("ring");

    let present = ring.current().present_semaphore();
    let completion = ring.current().completion_semaphore();
    assert_ne!(present, completion);
    assert_ne!(ring.current().fence(), vk::Fence::null());

    record_empty(&mut ring);
    ring.submit().expect("submit");
    null.complete_all();
    drop(ring);

    for kind in [ObjectKind::CommandBuffer, ObjectKind::Fence, ObjectKind::Semaphore] {
        println!("{:?}: live {}", kind, null.live(kind));
        assert_eq!(null.live(kind), 0);
    }
}

#[test]
fn test_ring_drops_promptly_after_failed_submit() {
    let unbounded = SyncConfig::default().default_wait_timeout_ns;
    let (null, device) = make_device(FrameRingConfig::default(), unbounded);
    let mut ring = device.create_frame_ring().expect("ring");

    for _ in 0..2 {
        record_empty(&mut ring);
        ring.submit().expect("submit");
        null.complete_all();
    }
    assert_eq!(ring.current_index(), 0);

    record_empty(&mut ring);
    null.set_device_lost(true);
    match ring.submit() {
        Err(e @ RuntimeError::Driver { .. }) => println!("frame submit failed: {}", e),
        other => panic!("expected Driver error, got {:?}", other),
    }
    null.set_device_lost(false);
    assert_eq!(ring.current_index(), 0);
    assert_eq!(
        ring.current().command_buffer().state(),
        CommandBufferState::Executable
    );
    assert!(ring
        .current()
        .command_buffer()
        .get_sync()
        .is_complete()
        .expect("query"));

    let started = std::time::Instant::now();
    drop(ring);
    println!("ring dropped in {:?}", started.elapsed());
    assert!(started.elapsed() < std::time::Duration::from_secs(1));
    assert_eq!(null.live(ObjectKind::Fence), 0);
}
