//! WGSL test shaders compiled to SPIR-V with naga.

use anyhow::anyhow;

const VERTEX_WGSL: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn main(@builtin(vertex_index) vertex_index: u32) -> VertexOutput {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(3.0, -1.0),
        vec2<f32>(-1.0, 3.0),
    );
    var out: VertexOutput;
    out.position = vec4<f32>(positions[vertex_index], 0.0, 1.0);
    out.uv = positions[vertex_index] * 0.5 + vec2<f32>(0.5, 0.5);
    return out;
}
"#;

const FRAGMENT_WGSL: &str = r#"
@fragment
fn main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return vec4<f32>(uv, 0.0, 1.0);
}
"#;

const COMPUTE_WGSL: &str = r#"
@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
}
"#;

pub fn fullscreen_vertex() -> anyhow::Result<Vec<u32>> {
    compile_wgsl(VERTEX_WGSL, naga::ShaderStage::Vertex, "main")
}

pub fn uv_fragment() -> anyhow::Result<Vec<u32>> {
    compile_wgsl(FRAGMENT_WGSL, naga::ShaderStage::Fragment, "main")
}

pub fn empty_compute() -> anyhow::Result<Vec<u32>> {
    compile_wgsl(COMPUTE_WGSL, naga::ShaderStage::Compute, "main")
}

/// Compile WGSL to SPIR-V words.
fn compile_wgsl(
    source: &str,
    stage: naga::ShaderStage,
    entry_point: &str,
) -> anyhow::Result<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| anyhow!("failed to parse WGSL: {}", e.emit_to_string(source)))?;

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::empty(),
    )
    .validate(&module)
    .map_err(|e| anyhow!("WGSL validation failed: {}", e))?;

    let options = naga::back::spv::Options {
        lang_version: (1, 0),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: entry_point.to_string(),
    };

    let mut writer = naga::back::spv::Writer::new(&options)?;
    let mut words = Vec::new();
    writer.write(&module, &info, Some(&pipeline_options), &None, &mut words)?;
    Ok(words)
}
