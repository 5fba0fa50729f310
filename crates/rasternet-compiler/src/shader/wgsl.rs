//! WGSL source assembly shared by every raster program.

use crate::layout::GpuResourceLayout;
use crate::{Error, Result};
use std::fmt::Write;

/// Full-screen vertex stage: two triangles, six vertices, no buffers.
const VERTEX_STAGE: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(-1.0, 1.0),
        vec2<f32>(-1.0, 1.0),
        vec2<f32>(1.0, -1.0),
        vec2<f32>(1.0, 1.0),
    );
    return vec4<f32>(corners[index], 0.0, 1.0);
}
"#;

const DRAW_PARAMS: &str = r#"
struct DrawParams {
    slice: u32,
    group_offset: u32,
    pad0: u32,
    pad1: u32,
}

@group(0) @binding(0) var<uniform> params: DrawParams;
"#;

/// Incrementally builds the source of one program.
pub(crate) struct WgslWriter {
    source: String,
}

impl WgslWriter {
    pub fn new(label: &str) -> Self {
        let mut source = String::new();
        let _ = writeln!(source, "// {label}");
        source.push_str(DRAW_PARAMS);
        Self { source }
    }

    pub fn const_u32(&mut self, name: &str, value: usize) {
        let _ = writeln!(self.source, "const {name}: u32 = {value}u;");
    }

    pub fn const_i32(&mut self, name: &str, value: i64) {
        let _ = writeln!(self.source, "const {name}: i32 = {value};");
    }

    pub fn const_f32(&mut self, name: &str, value: f32) {
        let _ = writeln!(self.source, "const {name}: f32 = {value:?};");
    }

    pub fn raw(&mut self, text: &str) {
        self.source.push_str(text);
        if !text.ends_with('\n') {
            self.source.push('\n');
        }
    }

    /// Bind a texture and emit its layout constants and load helpers:
    /// `load_{role}(s, g)` returns a texel, `load_{role}_channel(s, c)` one
    /// channel.
    pub fn texture_input(&mut self, role: &str, binding: u32, layout: &GpuResourceLayout) {
        let p = role.to_ascii_uppercase();
        let _ = writeln!(
            self.source,
            "\n@group(0) @binding({binding}) var {role}_tex: texture_2d_array<f32>;"
        );
        self.layout_consts(&p, layout);
        let _ = write!(
            self.source,
            r#"
fn load_{role}(s: u32, g: u32) -> vec4<f32> {{
    let per_layer = {p}_TEX_W * {p}_TEX_H;
    let local = s % per_layer;
    let layer = (s / per_layer) * {p}_LPS + g;
    return textureLoad({role}_tex, vec2<i32>(i32(local % {p}_TEX_W), i32(local / {p}_TEX_W)), i32(layer), 0);
}}

fn load_{role}_channel(s: u32, c: u32) -> f32 {{
    let texel = load_{role}(s, c / 4u);
    return texel[c % 4u];
}}
"#
        );
    }

    pub fn layout_consts(&mut self, prefix: &str, layout: &GpuResourceLayout) {
        self.const_u32(&format!("{prefix}_TEX_W"), layout.width);
        self.const_u32(&format!("{prefix}_TEX_H"), layout.height);
        self.const_u32(&format!("{prefix}_LPS"), layout.layers_per_slice);
        self.const_u32(&format!("{prefix}_SPATIAL"), layout.spatial);
        self.const_u32(&format!("{prefix}_CHANNELS"), layout.channels);
        self.const_u32(&format!("{prefix}_GROUPS"), layout.channel_groups);
    }

    /// Append the op body, the vertex stage and the fragment wrapper that
    /// writes `render_targets` outputs with padded lanes masked.
    pub fn finish(mut self, output: &GpuResourceLayout, compute_body: &str) -> String {
        self.source.push('\n');
        self.layout_consts("OUT", output);
        let _ = write!(
            self.source,
            "\nfn compute(s: u32, g: u32) -> vec4<f32> {{\n{compute_body}}}\n"
        );
        self.source.push_str(VERTEX_STAGE);

        self.source.push_str("\nstruct FragmentOutput {\n");
        for i in 0..output.render_targets {
            let _ = writeln!(self.source, "    @location({i}) out{i}: vec4<f32>,");
        }
        self.source.push_str("}\n");

        self.source.push_str(
            r#"
fn output_texel(s: u32, g: u32) -> vec4<f32> {
    if s >= OUT_SPATIAL || g >= OUT_GROUPS {
        return vec4<f32>(0.0);
    }
    let lanes = vec4<u32>(0u, 1u, 2u, 3u) + vec4<u32>(g * 4u);
    return select(vec4<f32>(0.0), compute(s, g), lanes < vec4<u32>(OUT_CHANNELS));
}

@fragment
fn fs_main(@builtin(position) position: vec4<f32>) -> FragmentOutput {
    let x = u32(position.x);
    let y = u32(position.y);
    let s = params.slice * OUT_TEX_W * OUT_TEX_H + y * OUT_TEX_W + x;
    var out: FragmentOutput;
"#,
        );
        for i in 0..output.render_targets {
            let _ = writeln!(
                self.source,
                "    out.out{i} = output_texel(s, params.group_offset + {i}u);"
            );
        }
        self.source.push_str("    return out;\n}\n");
        self.source
    }
}

/// Parse and validate generated WGSL.
///
/// # Errors
/// Returns `ShaderCompilation` with the rendered diagnostic.
pub(crate) fn validate(node: &str, source: &str) -> Result<naga::Module> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        Error::ShaderCompilation(format!(
            "node '{node}': {}",
            e.emit_to_string(source)
        ))
    })?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::default(),
    )
    .validate(&module)
    .map_err(|e| {
        Error::ShaderCompilation(format!(
            "node '{node}': {}",
            e.emit_to_string(source)
        ))
    })?;

    Ok(module)
}
