//! Integration test: runtime configuration and error classes
//!
//! Loads gpurt.toml variants from a temp directory, checks defaults and
//! validation, and pins the error taxonomy callers branch on.
//!
//! Run with: cargo test --test config_test -- --nocapture

use std::path::PathBuf;

use ash::vk;
use gpurt_core::config::{DescriptorKind, RuntimeConfig};
use gpurt_core::hash::{combine, combine_unordered, fx_hash, hash_words};
use gpurt_core::{ErrorClass, RuntimeError};

fn write_temp(name: &str, content: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gpurt-config-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write config");
    path
}

#[test]
fn test_defaults() {
    let config = RuntimeConfig::default();
    assert!(!config.cache.verify_hits);
    assert_eq!(config.sync.default_wait_timeout_ns, i64::MAX as u64);
    assert_eq!(config.binding_pool.max_sets, 256);
    assert_eq!(config.frame_ring.initial_frames, 2);
    assert_eq!(config.frame_ring.max_frames, None);
    config.validate().expect("defaults are valid");

    let sizes = config.binding_pool.driver_pool_sizes();
    assert_eq!(sizes.len(), DescriptorKind::ALL.len());
    println!("default pool sizes: {:?}", sizes);
}

#[test]
fn test_load_partial_file() {
    let path = write_temp(
        "partial.toml",
        r#"
[cache]
verify_hits = true

[binding_pool]
max_sets = 32
pool_sizes = [
    { kind = "uniform_buffer", count = 16 },
    { kind = "uniform_buffer", count = 8 },
    { kind = "combined_image_sampler", count = 64 },
]

[frame_ring]
max_frames = 4
"#,
    );
    let config = RuntimeConfig::load(path.to_str().expect("utf-8 path")).expect("load");
    assert!(config.cache.verify_hits);
    assert_eq!(config.binding_pool.max_sets, 32);
    assert_eq!(config.frame_ring.initial_frames, 2);
    assert_eq!(config.frame_ring.max_frames, Some(4));
    assert_eq!(config.sync.default_wait_timeout_ns, i64::MAX as u64);

    // Duplicate kinds are summed.
    let sizes = config.binding_pool.driver_pool_sizes();
    let uniform = sizes
        .iter()
        .find(|s| s.ty == vk::DescriptorType::UNIFORM_BUFFER)
        .expect("uniform size");
    assert_eq!(uniform.descriptor_count, 24);
    assert_eq!(sizes.len(), 2);
}

#[test]
fn test_roundtrip_through_toml() {
    let mut config = RuntimeConfig::default();
    config.sync.default_wait_timeout_ns = 1_000_000_000;
    config.frame_ring.max_frames = Some(3);
    let text = config.to_toml().expect("serialize");
    println!("{}", text);

    let path = write_temp("roundtrip.toml", &text);
    let loaded = RuntimeConfig::load(path.to_str().expect("utf-8 path")).expect("reload");
    assert_eq!(loaded, config);
}

#[test]
fn test_invalid_configs_rejected() {
    let cases = [
        ("zero_sets.toml", "[binding_pool]\nmax_sets = 0\n"),
        ("zero_frames.toml", "[frame_ring]\ninitial_frames = 0\n"),
        ("max_below_initial.toml", "[frame_ring]\ninitial_frames = 3\nmax_frames = 2\n"),
        ("bad_kind.toml", "[[binding_pool.pool_sizes]]\nkind = \"acceleration_structure\"\ncount = 1\n"),
    ];
    for (name, content) in cases {
        let path = write_temp(name, content);
        match RuntimeConfig::load(path.to_str().expect("utf-8 path")) {
            Err(e @ RuntimeError::Config(_)) => {
                println!("{}: {}", name, e);
                assert_eq!(e.class(), ErrorClass::Config);
            }
            other => panic!("{}: expected Config error, got {:?}", name, other),
        }
        // The lenient loader falls back to defaults instead.
        assert_eq!(
            RuntimeConfig::load_or_default(path.to_str().expect("utf-8 path")),
            RuntimeConfig::default()
        );
    }
}

#[test]
fn test_missing_file() {
    match RuntimeConfig::load("/nonexistent/gpurt.toml") {
        Err(e @ RuntimeError::Io(_)) => assert_eq!(e.class(), ErrorClass::Config),
        other => panic!("expected Io error, got {:?}", other),
    }
    assert_eq!(
        RuntimeConfig::load_or_default("/nonexistent/gpurt.toml"),
        RuntimeConfig::default()
    );
}

#[test]
fn test_error_classes() {
    let cases = [
        (RuntimeError::StillInFlight { submit_id: 3 }, ErrorClass::StateViolation),
        (RuntimeError::PoolDestroyed, ErrorClass::StateViolation),
        (RuntimeError::PoolExhausted { max_sets: 4 }, ErrorClass::Allocation),
        (
            RuntimeError::driver("allocate_descriptor_sets", vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            ErrorClass::Allocation,
        ),
        (
            RuntimeError::driver("create_pipeline", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            ErrorClass::Allocation,
        ),
        (
            RuntimeError::driver("queue_submit", vk::Result::ERROR_DEVICE_LOST),
            ErrorClass::Driver,
        ),
        (RuntimeError::IncompleteBinding { binding: 0, element: 2 }, ErrorClass::ContentMismatch),
        (RuntimeError::DuplicateContent { hash: 1 }, ErrorClass::ContentMismatch),
        (RuntimeError::Timeout { timeout_ns: 10 }, ErrorClass::Driver),
        (RuntimeError::SemaphoreUnclaimed { submit_id: 2 }, ErrorClass::StateViolation),
        (
            RuntimeError::Unsupported {
                op: "draw_mesh_tasks",
                feature: "VK_EXT_mesh_shader",
            },
            ErrorClass::Driver,
        ),
        (RuntimeError::MalformedShader { len: 7 }, ErrorClass::ContentMismatch),
    ];
    for (error, class) in cases {
        println!("{:?} -> {}", class, error);
        assert_eq!(error.class(), class);
    }

    match RuntimeError::driver("allocate_descriptor_sets", vk::Result::ERROR_FRAGMENTED_POOL) {
        RuntimeError::DescriptorAllocation(result) => {
            assert_eq!(result, vk::Result::ERROR_FRAGMENTED_POOL)
        }
        other => panic!("expected DescriptorAllocation, got {:?}", other),
    }
}

#[test]
fn test_hash_helpers() {
    let words = [0x0723_0203u32, 0x0001_0000, 7];
    assert_eq!(hash_words(&words), hash_words(&words.to_vec()));
    assert_ne!(hash_words(&words), hash_words(&[0x0723_0203u32, 0x0001_0000, 8]));

    assert_eq!(fx_hash(&(1u32, "a")), fx_hash(&(1u32, "a")));
    assert_ne!(combine(1, 2), combine(2, 1));
    assert_eq!(
        combine_unordered([10u64, 20, 30]),
        combine_unordered([30u64, 10, 20])
    );
    assert_ne!(combine_unordered([1u64, 1]), combine_unordered([2u64]));
}
