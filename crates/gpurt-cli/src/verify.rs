use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use serde::Serialize;

use gpurt_core::config::{default_config_path, BindingPoolConfig, RuntimeConfig};
use gpurt_runtime::driver::Completion;
use gpurt_runtime::{
    BindingResource, CacheCounts, DescriptorSetLayout, Device, Driver, GraphicsState,
    LayoutBinding, LayoutDesc, NullDriver, Pipeline, PipelineDesc, PipelineLayoutDesc,
    ResourceBindingInstance, ResourceBindingPool, RuntimeError, Sampler, SamplerDesc, ShaderDesc,
};

use crate::shaders;
use crate::vulkan;
use crate::Backend;

/// How long a submission may take before the check fails.
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

// ── Check result types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<String>,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: &str) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.to_string(),
            details: Vec::new(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Pass, message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Fail, message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Warn, message)
    }

    fn skip(name: &str, message: &str) -> Self {
        Self::new(name, CheckStatus::Skip, message)
    }

    fn detail(mut self, detail: &str) -> Self {
        self.details.push(detail.to_string());
        self
    }
}

/// Turn an error escaping a check into a failed result for that check.
fn record(name: &str, outcome: anyhow::Result<CheckResult>) -> CheckResult {
    outcome.unwrap_or_else(|e| CheckResult::fail(name, &format!("{:#}", e)))
}

// ── Main entry point ────────────────────────────────────────────────────────

/// Run every check and print the report. Returns `false` if any check failed.
pub fn run_verify(
    backend: Backend,
    latency_ms: u64,
    config_path: Option<&str>,
    json: bool,
) -> anyhow::Result<bool> {
    let mut results: Vec<CheckResult> = Vec::new();

    // Check 1: Configuration
    let config = check_config(config_path, &mut results);

    // Check 2: Driver
    let device = check_driver(backend, latency_ms, config, &mut results);

    const SCENARIO: [&str; 8] = [
        "Pipeline sharing",
        "Scenario fixture",
        "Submission",
        "Incomplete binding",
        "Binding cache",
        "Pool exhaustion",
        "Frame ring",
        "Release",
    ];

    match device {
        Some(device) => {
            run_scenario(&device, &mut results);

            // Check 9: everything created above has been dropped by now.
            results.push(check_release(&device));
        }
        None => {
            for name in SCENARIO {
                results.push(CheckResult::skip(name, "No device available"));
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print_results_pretty(backend, &results);
    }

    Ok(!results
        .iter()
        .any(|r| matches!(r.status, CheckStatus::Fail)))
}

fn run_scenario(device: &Device, results: &mut Vec<CheckResult>) {
    // Check 3: Pipeline sharing
    results.push(record("Pipeline sharing", check_pipeline_sharing(device)));

    let fixture = match Fixture::new(device) {
        Ok(fixture) => fixture,
        Err(e) => {
            results.push(CheckResult::fail("Scenario fixture", &format!("{:#}", e)));
            for name in ["Submission", "Incomplete binding", "Binding cache"] {
                results.push(CheckResult::skip(name, "Fixture could not be built"));
            }
            results.push(record("Pool exhaustion", check_pool_exhaustion(device, None)));
            results.push(record("Frame ring", check_frame_ring(device)));
            return;
        }
    };

    // Check 4: Submission observed through its sync token
    results.push(record("Submission", check_submission(device, &fixture)));

    // Check 5 + 6: Incomplete promotion, then a complete one
    match check_incomplete_binding(&fixture) {
        Ok((result, partial)) => {
            results.push(result);
            results.push(record("Binding cache", check_binding_cache(&fixture, partial)));
        }
        Err(e) => {
            results.push(CheckResult::fail("Incomplete binding", &format!("{:#}", e)));
            results.push(CheckResult::skip("Binding cache", "No partial instance to complete"));
        }
    }

    // Check 7: Pool exhaustion
    results.push(record(
        "Pool exhaustion",
        check_pool_exhaustion(device, Some(&fixture.set_layout)),
    ));

    // Check 8: Frame ring
    results.push(record("Frame ring", check_frame_ring(device)));
}

// ── Check 1: Configuration ──────────────────────────────────────────────────

fn check_config(config_path: Option<&str>, results: &mut Vec<CheckResult>) -> RuntimeConfig {
    let path = config_path
        .map(str::to_string)
        .unwrap_or_else(default_config_path);

    if !std::path::Path::new(&path).exists() {
        let result = if config_path.is_some() {
            CheckResult::fail("Configuration", &format!("Config file not found: {}", path))
        } else {
            CheckResult::warn("Configuration", &format!("Config file not found: {}", path))
        };
        results.push(result.detail("Using default configuration"));
        return RuntimeConfig::default();
    }

    match RuntimeConfig::load(&path) {
        Ok(config) => {
            let max_frames = config
                .frame_ring
                .max_frames
                .map(|m| m.to_string())
                .unwrap_or_else(|| "unbounded".to_string());
            results.push(
                CheckResult::pass("Configuration", &format!("Loaded from {}", path))
                    .detail(&format!("Verify cache hits: {}", config.cache.verify_hits))
                    .detail(&format!(
                        "Default wait timeout: {}ns",
                        config.sync.default_wait_timeout_ns
                    ))
                    .detail(&format!("Binding pool max sets: {}", config.binding_pool.max_sets))
                    .detail(&format!(
                        "Frame ring: {} initial, max {}",
                        config.frame_ring.initial_frames, max_frames
                    )),
            );
            config
        }
        Err(e) => {
            results.push(
                CheckResult::fail("Configuration", &format!("Failed to load {}: {}", path, e))
                    .detail("Using default configuration"),
            );
            RuntimeConfig::default()
        }
    }
}

// ── Check 2: Driver ─────────────────────────────────────────────────────────

fn check_driver(
    backend: Backend,
    latency_ms: u64,
    config: RuntimeConfig,
    results: &mut Vec<CheckResult>,
) -> Option<Device> {
    let (driver, result): (Arc<dyn Driver>, CheckResult) = match backend {
        Backend::Null => {
            let latency = Duration::from_millis(latency_ms);
            let driver: Arc<dyn Driver> = Arc::new(NullDriver::new(Completion::Latency(latency)));
            let result = CheckResult::pass("Driver", "Null driver")
                .detail(&format!("Fence latency: {}ms", latency_ms));
            (driver, result)
        }
        Backend::Vulkan => match vulkan::create_device() {
            Ok(vk_device) => {
                let result = CheckResult::pass(
                    "Driver",
                    &format!("Vulkan device: {}", vk_device.device_name),
                )
                .detail(&format!(
                    "API version: {}.{}.{}",
                    vk::api_version_major(vk_device.api_version),
                    vk::api_version_minor(vk_device.api_version),
                    vk::api_version_patch(vk_device.api_version)
                ))
                .detail(&format!(
                    "Queue family: {}",
                    vk_device.driver.queue_family_index()
                ));
                let driver: Arc<dyn Driver> = vk_device.driver;
                (driver, result)
            }
            Err(e) => {
                results.push(
                    CheckResult::fail("Driver", &format!("Cannot open Vulkan device: {:#}", e))
                        .detail("Run with --backend null to check the runtime without a GPU"),
                );
                return None;
            }
        },
    };

    match Device::new(driver, config) {
        Ok(device) => {
            results.push(result);
            Some(device)
        }
        Err(e) => {
            results.push(CheckResult::fail(
                "Driver",
                &format!("Device context rejected: {}", e),
            ));
            None
        }
    }
}

// ── Check 3: Pipeline sharing ───────────────────────────────────────────────

fn check_pipeline_sharing(device: &Device) -> anyhow::Result<CheckResult> {
    let vertex = shaders::fullscreen_vertex()?;
    let fragment = shaders::uv_fragment()?;
    let layout = device.create_pipeline_layout(&PipelineLayoutDesc::new(Vec::new()))?;

    let make_pipeline = || -> anyhow::Result<Arc<Pipeline>> {
        let vs = device.create_shader_module(&ShaderDesc::new(
            vertex.clone(),
            vk::ShaderStageFlags::VERTEX,
        ))?;
        let fs = device.create_shader_module(&ShaderDesc::new(
            fragment.clone(),
            vk::ShaderStageFlags::FRAGMENT,
        ))?;
        let state = GraphicsState::default().with_color_format(vk::Format::B8G8R8A8_SRGB);
        Ok(device.create_pipeline(&PipelineDesc::graphics(
            vec![vs, fs],
            Arc::clone(&layout),
            state,
        ))?)
    };

    let first = make_pipeline()?;
    let second = make_pipeline()?;
    let counts = device.cache_counts();

    let result = if Arc::ptr_eq(&first, &second) && counts.pipelines == 1 {
        CheckResult::pass("Pipeline sharing", "Identical descriptions share one pipeline")
    } else {
        CheckResult::fail("Pipeline sharing", "Identical descriptions created two pipelines")
    };
    Ok(result
        .detail(&format!("Pipeline hash: {:#018x}", first.hash()))
        .detail(&format!(
            "Live: {} shader modules, {} pipelines",
            counts.shader_modules, counts.pipelines
        )))
}

// ── Scenario fixture ────────────────────────────────────────────────────────

/// Objects shared by the binding checks: a compute pipeline whose set 0
/// holds one sampler at binding 0 and three at binding 1.
struct Fixture {
    set_layout: Arc<DescriptorSetLayout>,
    pipeline: Arc<Pipeline>,
    pool: ResourceBindingPool,
    samplers: [Arc<Sampler>; 2],
}

impl Fixture {
    fn new(device: &Device) -> anyhow::Result<Self> {
        let linear = device.create_sampler(&SamplerDesc::default())?;
        let nearest = device.create_sampler(&SamplerDesc::nearest().clamped())?;

        let set_layout = device.create_descriptor_set_layout(&LayoutDesc::new(vec![
            LayoutBinding::new(0, vk::DescriptorType::SAMPLER, 1, vk::ShaderStageFlags::COMPUTE),
            LayoutBinding::new(1, vk::DescriptorType::SAMPLER, 3, vk::ShaderStageFlags::COMPUTE),
        ]))?;
        let layout =
            device.create_pipeline_layout(&PipelineLayoutDesc::new(vec![Arc::clone(&set_layout)]))?;
        let compute = device.create_shader_module(&ShaderDesc::new(
            shaders::empty_compute()?,
            vk::ShaderStageFlags::COMPUTE,
        ))?;
        let pipeline = device.create_pipeline(&PipelineDesc::compute(compute, layout))?;
        let pool = device.create_binding_pool()?;

        Ok(Self {
            set_layout,
            pipeline,
            pool,
            samplers: [linear, nearest],
        })
    }

    /// Every slot of the layout with its resource.
    fn slots(&self) -> [(u32, u32, BindingResource); 4] {
        let linear = BindingResource::Sampler(self.samplers[0].handle());
        let nearest = BindingResource::Sampler(self.samplers[1].handle());
        [(0, 0, linear), (1, 0, nearest), (1, 1, linear), (1, 2, nearest)]
    }

    fn fill(&self, instance: &ResourceBindingInstance, count: usize) -> gpurt_runtime::Result<()> {
        for (binding, element, resource) in self.slots().into_iter().take(count) {
            instance.write(binding, element, resource)?;
        }
        Ok(())
    }
}

// ── Check 4: Submission ─────────────────────────────────────────────────────

fn check_submission(device: &Device, fixture: &Fixture) -> anyhow::Result<CheckResult> {
    let instance = fixture.pool.allocate(&fixture.set_layout)?;
    fixture.fill(&instance, 4)?;

    let mut cb = device.create_command_buffer()?;
    cb.begin()?;
    cb.bind_pipeline(&fixture.pipeline)?;
    cb.bind_binding_set(0, &instance)?;
    cb.dispatch(1, 1, 1)?;
    // Rebinding the same objects is elided.
    cb.bind_pipeline(&fixture.pipeline)?;
    cb.bind_binding_set(0, &instance)?;
    cb.dispatch(1, 1, 1)?;
    cb.end()?;

    let token = cb.submit()?;
    let complete_at_submit = token.is_complete()?;
    let completed = token.wait_timeout(SUBMIT_TIMEOUT)?;
    let stats = cb.stats();

    let result = if completed {
        cb.reset()?;
        CheckResult::pass(
            "Submission",
            &format!("Submission {} completed", token.submit_id()),
        )
    } else {
        CheckResult::fail(
            "Submission",
            &format!(
                "Submission {} did not complete within {:?}",
                token.submit_id(),
                SUBMIT_TIMEOUT
            ),
        )
    };
    Ok(result
        .detail(&format!("Complete when first queried: {}", complete_at_submit))
        .detail(&format!(
            "Commands: {} emitted, {} elided",
            stats.emitted, stats.elided
        )))
}

// ── Check 5: Incomplete binding ─────────────────────────────────────────────

fn check_incomplete_binding(
    fixture: &Fixture,
) -> anyhow::Result<(CheckResult, ResourceBindingInstance)> {
    let partial = fixture.pool.allocate(&fixture.set_layout)?;
    fixture.fill(&partial, 3)?;

    let result = match partial.commit_cached() {
        Err(e @ RuntimeError::IncompleteBinding { .. }) if !partial.is_cached() => {
            CheckResult::pass("Incomplete binding", "Promotion of a partial instance rejected")
                .detail(&e.to_string())
        }
        Err(e) => CheckResult::fail(
            "Incomplete binding",
            &format!("Unexpected error: {}", e),
        ),
        Ok(hash) => CheckResult::fail(
            "Incomplete binding",
            &format!("Partial instance was cached as {:#018x}", hash),
        ),
    };
    Ok((result, partial))
}

// ── Check 6: Binding cache ──────────────────────────────────────────────────

fn check_binding_cache(
    fixture: &Fixture,
    partial: ResourceBindingInstance,
) -> anyhow::Result<CheckResult> {
    let (binding, element, resource) = fixture.slots()[3];
    partial.write(binding, element, resource)?;
    let hash = partial.commit_cached()?;
    let found = fixture
        .pool
        .find_cached(hash)
        .is_some_and(|cached| cached.same_instance(&partial));
    drop(partial);

    // Same content written in a different order hashes identically.
    let fresh = fixture.pool.allocate(&fixture.set_layout)?;
    for (binding, element, resource) in fixture.slots().into_iter().rev() {
        fresh.write(binding, element, resource)?;
    }
    let fresh_hash = fresh.commit_cached()?;

    let result = if found && fresh_hash == hash {
        CheckResult::pass("Binding cache", "Completed instance promoted and found by content")
    } else if !found {
        CheckResult::fail("Binding cache", "Committed instance missing from the pool registry")
    } else {
        CheckResult::fail("Binding cache", "Identical content produced a different hash")
    };
    Ok(result
        .detail(&format!("Content hash: {:#018x}", hash))
        .detail(&format!("Cached instances: {}", fixture.pool.cached_count())))
}

// ── Check 7: Pool exhaustion ────────────────────────────────────────────────

fn check_pool_exhaustion(
    device: &Device,
    set_layout: Option<&Arc<DescriptorSetLayout>>,
) -> anyhow::Result<CheckResult> {
    let Some(set_layout) = set_layout else {
        return Ok(CheckResult::skip("Pool exhaustion", "No set layout available"));
    };
    let max_sets = 3;
    let pool = device.create_binding_pool_with(&BindingPoolConfig {
        max_sets,
        ..device.config().binding_pool.clone()
    })?;

    let held = (0..max_sets)
        .map(|_| pool.allocate(set_layout))
        .collect::<gpurt_runtime::Result<Vec<_>>>()?;

    let result = match pool.allocate(set_layout) {
        Err(e @ RuntimeError::PoolExhausted { .. }) => {
            CheckResult::pass("Pool exhaustion", "Allocation past max_sets reported")
                .detail(&e.to_string())
                .detail(&format!("Error class: {:?}", e.class()))
        }
        Err(e) => CheckResult::fail("Pool exhaustion", &format!("Unexpected error: {}", e)),
        Ok(_) => CheckResult::fail(
            "Pool exhaustion",
            &format!("Allocated {} sets from a pool of {}", held.len() + 1, max_sets),
        ),
    };

    drop(held);
    let recovered = pool.allocate(set_layout).is_ok();
    Ok(result.detail(&format!(
        "Allocation after release: {}",
        if recovered { "ok" } else { "failed" }
    )))
}

// ── Check 8: Frame ring ─────────────────────────────────────────────────────

fn check_frame_ring(device: &Device) -> anyhow::Result<CheckResult> {
    const FRAMES: usize = 8;

    let mut ring = device.create_frame_ring()?;
    let initial = ring.len();
    let mut tokens = Vec::with_capacity(FRAMES);
    for _ in 0..FRAMES {
        let cb = ring.current().command_buffer();
        cb.begin()?;
        cb.end()?;
        tokens.push(ring.submit()?);
    }
    let grown = ring.len();

    let mut incomplete = 0;
    for token in &tokens {
        if !token.wait_timeout(SUBMIT_TIMEOUT)? {
            incomplete += 1;
        }
    }

    let result = if incomplete == 0 {
        CheckResult::pass("Frame ring", &format!("{} frames submitted and completed", FRAMES))
    } else {
        CheckResult::fail(
            "Frame ring",
            &format!("{} of {} frames did not complete", incomplete, FRAMES),
        )
    };
    Ok(result.detail(&format!("Ring size: {} initial, {} after submitting", initial, grown)))
}

// ── Check 9: Release ────────────────────────────────────────────────────────

fn check_release(device: &Device) -> CheckResult {
    let counts = device.cache_counts();
    if counts == CacheCounts::default() {
        CheckResult::pass("Release", "All cached objects destroyed after last use")
    } else {
        CheckResult::fail("Release", "Cached objects outlived their users")
            .detail(&format!("{:?}", counts))
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

fn print_results_pretty(backend: Backend, results: &[CheckResult]) {
    println!();
    println!("gpurt Runtime Verification ({:?} backend)", backend);
    println!("=======================================");
    println!();

    let mut pass_count = 0u32;
    let mut fail_count = 0u32;
    let mut warn_count = 0u32;

    for result in results {
        let (icon, color_start, color_end) = match result.status {
            CheckStatus::Pass => {
                pass_count += 1;
                ("[PASS]", "\x1b[32m", "\x1b[0m")
            }
            CheckStatus::Fail => {
                fail_count += 1;
                ("[FAIL]", "\x1b[31m", "\x1b[0m")
            }
            CheckStatus::Warn => {
                warn_count += 1;
                ("[WARN]", "\x1b[33m", "\x1b[0m")
            }
            CheckStatus::Skip => ("[SKIP]", "\x1b[90m", "\x1b[0m"),
        };

        println!(
            "  {}{}{} {} - {}",
            color_start, icon, color_end, result.name, result.message
        );
        for detail in &result.details {
            println!("         {}", detail);
        }
        println!();
    }

    println!("---------------------------------------");
    println!(
        "  {} passed, {} failed, {} warnings",
        pass_count, fail_count, warn_count
    );
    println!();
}
