//! Integration test: shared registry
//!
//! A device-scoped registry shares one object between subsystems by name
//! while holding only weak references to it.
//!
//! Run with: cargo test --test registry_test -- --nocapture

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk;
use gpurt_runtime::{
    Device, Driver, LayoutBinding, LayoutDesc, NullDriver, RuntimeError, SamplerDesc,
    SharedRegistry,
};

/// A set of objects several features want to share.
struct PostProcessKit {
    samplers: Vec<Arc<gpurt_runtime::Sampler>>,
    layout: Arc<gpurt_runtime::DescriptorSetLayout>,
}

fn build_kit(device: &Device) -> gpurt_runtime::Result<PostProcessKit> {
    let samplers = vec![
        device.create_sampler(&SamplerDesc::default())?,
        device.create_sampler(&SamplerDesc::nearest().clamped())?,
    ];
    let layout = device.create_descriptor_set_layout(&LayoutDesc::new(vec![LayoutBinding::new(
        0,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        2,
        vk::ShaderStageFlags::FRAGMENT,
    )]))?;
    Ok(PostProcessKit { samplers, layout })
}

#[test]
fn test_create_once_share_many() {
    gpurt_common::logging::try_init_logging();
    let null = Arc::new(NullDriver::immediate());
    let driver: Arc<dyn Driver> = null.clone();
    let device = Device::with_defaults(driver).expect("device");
    let builds = AtomicUsize::new(0);

    let init = || {
        builds.fetch_add(1, Ordering::Relaxed);
        build_kit(&device)
    };
    let bloom = device.shared().get_or_init("post-process", init).expect("bloom");
    let tonemap = device
        .shared()
        .get_or_init("post-process", || {
            builds.fetch_add(1, Ordering::Relaxed);
            build_kit(&device)
        })
        .expect("tonemap");

    assert!(Arc::ptr_eq(&bloom, &tonemap));
    assert_eq!(builds.load(Ordering::Relaxed), 1);
    assert_eq!(bloom.samplers.len(), 2);
    println!("shared kit live under {:?}", device.shared().live_names());

    // The registry does not keep the kit alive.
    let layout_handle = bloom.layout.handle();
    drop(bloom);
    drop(tonemap);
    assert!(device.shared().get::<PostProcessKit>("post-process").is_none());
    assert_eq!(device.cache_counts().samplers, 0);
    assert_eq!(device.shared().purge(), 1);

    let again = device
        .shared()
        .get_or_init("post-process", || {
            builds.fetch_add(1, Ordering::Relaxed);
            build_kit(&device)
        })
        .expect("rebuilt");
    assert_eq!(builds.load(Ordering::Relaxed), 2);
    assert_ne!(again.layout.handle(), layout_handle);
}

#[test]
fn test_type_mismatch_is_reported() {
    let registry = SharedRegistry::new();
    let number = registry
        .get_or_init("value", || Ok(41u32))
        .expect("insert u32");

    match registry.get_or_init("value", || Ok(String::from("forty-one"))) {
        Err(e @ RuntimeError::RegistryTypeMismatch { .. }) => println!("rejected: {}", e),
        other => panic!("expected RegistryTypeMismatch, got {:?}", other),
    }
    assert!(registry.get::<String>("value").is_none());
    assert_eq!(*registry.get::<u32>("value").expect("still there"), *number);
}

#[test]
fn test_failed_init_registers_nothing() {
    let registry = SharedRegistry::new();
    let result: gpurt_runtime::Result<Arc<u64>> =
        registry.get_or_init("broken", || Err(RuntimeError::Config("no".to_string())));
    match result {
        Err(RuntimeError::Config(msg)) => assert_eq!(msg, "no"),
        other => panic!("expected Config error, got {:?}", other),
    }
    assert!(registry.live_names().is_empty());
    assert_eq!(*registry.get_or_init("broken", || Ok(7u64)).expect("retry"), 7);
}
