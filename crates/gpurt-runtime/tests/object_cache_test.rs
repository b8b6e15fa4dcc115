//! Integration test: structural object caches
//!
//! Exercises the per-device caches against the null driver: identical
//! descriptors share one driver object, dropping the last holder destroys it
//! and clears the cache entry, and hit verification reports collisions.
//!
//! Run with: cargo test --test object_cache_test -- --nocapture

use std::sync::Arc;

use ash::vk;
use gpurt_core::config::CacheConfig;
use gpurt_runtime::cache::{Cached, ObjectCache, Registration};
use gpurt_runtime::driver::ObjectKind;
use gpurt_runtime::{
    Device, Driver, GraphicsState, LayoutBinding, LayoutDesc, NullDriver, PipelineDesc,
    PipelineLayoutDesc, PushConstantRange, RuntimeConfig, RuntimeError, SamplerDesc, ShaderDesc,
};

fn make_device(verify_hits: bool) -> (Arc<NullDriver>, Device) {
    gpurt_common::logging::try_init_logging();
    let null = Arc::new(NullDriver::immediate());
    let driver: Arc<dyn Driver> = null.clone();
    let config = RuntimeConfig {
        cache: CacheConfig { verify_hits },
        ..RuntimeConfig::default()
    };
    let device = Device::new(driver, config).expect("device");
    (null, device)
}

fn spirv(seed: u32) -> Vec<u32> {
    vec![0x0723_0203, 0x0001_0000, seed, 16, 0]
}

fn uniform_layout() -> LayoutDesc {
    LayoutDesc::new(vec![
        LayoutBinding::new(0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::ALL_GRAPHICS),
        LayoutBinding::new(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4, vk::ShaderStageFlags::FRAGMENT),
    ])
}

#[test]
fn test_identical_shader_desc_shares_object() {
    let (null, device) = make_device(false);

    let desc = ShaderDesc::new(spirv(1), vk::ShaderStageFlags::VERTEX);
    let a = device.create_shader_module(&desc).expect("first create");
    let b = device.create_shader_module(&desc.clone()).expect("second create");

    assert!(Arc::ptr_eq(&a, &b), "identical descriptors must hit the cache");
    assert_eq!(null.created(ObjectKind::ShaderModule), 1);
    assert_eq!(device.cache_counts().shader_modules, 1);
    println!("shader module shared: hash {:#018x}", a.hash());

    let other = device
        .create_shader_module(&ShaderDesc::new(spirv(1), vk::ShaderStageFlags::FRAGMENT))
        .expect("different stage");
    assert!(!Arc::ptr_eq(&a, &other));
    assert_eq!(null.created(ObjectKind::ShaderModule), 2);
}

#[test]
fn test_drop_destroys_and_unregisters() {
    let (null, device) = make_device(false);

    let desc = SamplerDesc::nearest().clamped();
    let first = device.create_sampler(&desc).expect("create sampler");
    let first_handle = first.handle();
    let clone = Arc::clone(&first);
    drop(first);
    assert_eq!(null.live(ObjectKind::Sampler), 1, "a holder remains");

    drop(clone);
    assert_eq!(null.live(ObjectKind::Sampler), 0);
    assert_eq!(device.cache_counts().samplers, 0);

    // A later request builds a fresh object rather than resurrecting the old one.
    let again = device.create_sampler(&desc).expect("recreate sampler");
    assert_ne!(again.handle(), first_handle);
    assert_eq!(null.created(ObjectKind::Sampler), 2);
    println!("sampler recreated after drop: {:?}", again);
}

#[test]
fn test_layout_rejects_gaps() {
    let (_null, device) = make_device(false);

    let desc = LayoutDesc::new(vec![
        LayoutBinding::new(0, vk::DescriptorType::SAMPLER, 1, vk::ShaderStageFlags::FRAGMENT),
        LayoutBinding::new(2, vk::DescriptorType::SAMPLER, 1, vk::ShaderStageFlags::FRAGMENT),
    ]);
    match device.create_descriptor_set_layout(&desc) {
        Err(RuntimeError::NonContiguousLayout { position, binding }) => {
            println!("rejected gap at position {} (binding {})", position, binding);
            assert_eq!((position, binding), (1, 2));
        }
        other => panic!("expected NonContiguousLayout, got {:?}", other),
    }
}

#[test]
fn test_pipeline_chain_is_deduplicated() {
    let (null, device) = make_device(false);

    let build = || {
        let set_layout = device
            .create_descriptor_set_layout(&uniform_layout())
            .expect("set layout");
        let layout = device
            .create_pipeline_layout(
                &PipelineLayoutDesc::new(vec![set_layout]).with_push_constants(PushConstantRange {
                    stages: vk::ShaderStageFlags::VERTEX,
                    offset: 0,
                    size: 64,
                }),
            )
            .expect("pipeline layout");
        let vs = device
            .create_shader_module(&ShaderDesc::new(spirv(10), vk::ShaderStageFlags::VERTEX))
            .expect("vs");
        let fs = device
            .create_shader_module(&ShaderDesc::new(spirv(11), vk::ShaderStageFlags::FRAGMENT))
            .expect("fs");
        let state = GraphicsState::default().with_color_format(vk::Format::B8G8R8A8_UNORM);
        device
            .create_pipeline(&PipelineDesc::graphics(vec![vs, fs], layout, state))
            .expect("pipeline")
    };

    let a = build();
    let b = build();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(null.created(ObjectKind::Pipeline), 1);
    assert_eq!(null.created(ObjectKind::PipelineLayout), 1);
    assert_eq!(null.created(ObjectKind::DescriptorSetLayout), 1);
    assert_eq!(null.created(ObjectKind::ShaderModule), 2);

    let counts = device.cache_counts();
    println!("cache counts: {:?}", counts);
    assert_eq!(counts.pipelines, 1);

    // The pipeline keeps its layout and stages alive.
    drop(a);
    assert_eq!(device.cache_counts().pipeline_layouts, 1);
    drop(b);
    let counts = device.cache_counts();
    assert_eq!(counts.pipelines, 0);
    assert_eq!(counts.pipeline_layouts, 0);
    assert_eq!(counts.shader_modules, 0);
    assert_eq!(null.live(ObjectKind::Pipeline), 0);
}

#[test]
fn test_failed_create_leaves_no_entry() {
    let (null, device) = make_device(false);

    match device.create_shader_module(&ShaderDesc::new(Vec::new(), vk::ShaderStageFlags::COMPUTE)) {
        Err(RuntimeError::Driver { op, result }) => {
            println!("{} failed as expected: {:?}", op, result);
        }
        other => panic!("expected Driver error, got {:?}", other),
    }
    assert_eq!(device.cache_counts().shader_modules, 0);
    assert_eq!(null.created(ObjectKind::ShaderModule), 0);
}

/// Test-only cached object whose structural hash is chosen by the caller.
struct Tagged {
    desc: String,
    registration: Registration<Tagged>,
}

impl Cached for Tagged {
    type Desc = String;
    const KIND: &'static str = "tagged";

    fn desc(&self) -> &String {
        &self.desc
    }
}

impl Drop for Tagged {
    fn drop(&mut self) {
        self.registration.unregister(self);
    }
}

#[test]
fn test_collision_trusted_without_verification() {
    let cache: ObjectCache<Tagged> = ObjectCache::new(false);
    let make = |desc: &str| {
        let desc = desc.to_string();
        move |registration: Registration<Tagged>| -> gpurt_runtime::Result<Tagged> {
            Ok(Tagged { desc, registration })
        }
    };

    let a = cache.get_or_create(42, &"alpha".to_string(), make("alpha")).expect("alpha");
    let b = cache.get_or_create(42, &"beta".to_string(), make("beta")).expect("beta");
    assert!(Arc::ptr_eq(&a, &b), "unverified cache trusts the hash");
    assert_eq!(b.desc(), "alpha");
    println!("unverified collision resolved to {:?}", b.desc());
}

#[test]
fn test_collision_detected_with_verification() {
    let cache: ObjectCache<Tagged> = ObjectCache::new(true);
    let make = |desc: &str| {
        let desc = desc.to_string();
        move |registration: Registration<Tagged>| -> gpurt_runtime::Result<Tagged> {
            Ok(Tagged { desc, registration })
        }
    };

    let a = cache.get_or_create(42, &"alpha".to_string(), make("alpha")).expect("alpha");
    match cache.get_or_create(42, &"beta".to_string(), make("beta")) {
        Err(RuntimeError::HashCollision { kind, hash }) => {
            println!("collision reported: {} {:#x}", kind, hash);
            assert_eq!(kind, "tagged");
            assert_eq!(hash, 42);
        }
        other => panic!("expected HashCollision, got {:?}", other.map(|t| t.desc().clone())),
    }

    let same = cache.get_or_create(42, &"alpha".to_string(), make("alpha")).expect("verified hit");
    assert!(Arc::ptr_eq(&a, &same));

    drop(a);
    drop(same);
    assert!(cache.is_empty());
}

#[test]
fn test_shader_bytes_must_be_whole_words() {
    let (null, device) = make_device(false);
    let words = spirv(5);
    let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();

    let desc = ShaderDesc::from_bytes(&bytes, vk::ShaderStageFlags::VERTEX).expect("whole words");
    assert_eq!(desc.code, words);

    bytes.push(0xff);
    match ShaderDesc::from_bytes(&bytes, vk::ShaderStageFlags::VERTEX) {
        Err(RuntimeError::MalformedShader { len }) => {
            println!("rejected {} byte module", len);
            assert_eq!(len, words.len() * 4 + 1);
        }
        other => panic!("expected MalformedShader, got {:?}", other),
    }

    let module = device.create_shader_module(&desc).expect("module");
    assert_eq!(null.live(ObjectKind::ShaderModule), 1);
    drop(module);
}
