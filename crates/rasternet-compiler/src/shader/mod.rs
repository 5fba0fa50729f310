//! WGSL raster program generation.
//!
//! Every op node becomes one render program: a shared full-screen vertex
//! stage plus a fragment stage that evaluates `compute(s, g)` for each
//! attached output layer. Shape constants are baked into the source as WGSL
//! `const` declarations, so a program is a pure function of the op kind,
//! its resolved parameters and the layouts it reads and writes.

mod ops;
mod wgsl;

pub use ops::ProgramParams;

use crate::cache::{ProgramCache, ProgramKey, ShaderArtifact};
use crate::layout::{DrawCall, GpuResourceLayout};
use crate::{Error, Result};
use rasternet_core::{OpKind, OperationNode, TensorValue};
use std::sync::Arc;
use wgsl::WgslWriter;

/// Bind group slot of the draw-parameter uniform block.
pub const DRAW_PARAMS_BINDING: u32 = 0;

/// Size in bytes of the `DrawParams` uniform block.
pub const DRAW_PARAMS_SIZE: u64 = 16;

/// Where the resource behind a binding comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindingSource {
    /// Texture written at run time: a runtime input or an op output.
    Node(String),
    /// Texture uploaded once from a constant.
    Weight(String),
    /// The per-draw `DrawParams` uniform block.
    DrawParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplingType {
    Texture2DArray,
    ParamsBlock,
}

/// One entry of a program's bind group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBinding {
    pub name: String,
    pub binding: u32,
    pub source: BindingSource,
    pub sampling: SamplingType,
}

/// How a program's output is written: draws of `render_targets` layers each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPlan {
    pub render_targets: usize,
    pub draws: Vec<DrawCall>,
}

/// A texture input of a program.
#[derive(Debug, Clone, Copy)]
pub struct ProgramInput<'a> {
    pub source: &'a BindingSource,
    pub layout: &'a GpuResourceLayout,
}

/// Compiled raster program of one op node.
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub node: String,
    pub kind: OpKind,
    pub params: ProgramParams,
    pub shader: Arc<ShaderArtifact>,
    pub bindings: Vec<UniformBinding>,
    pub attachments: AttachmentPlan,
    pub output_layout: GpuResourceLayout,
}

impl CompiledProgram {
    pub fn source(&self) -> &str {
        &self.shader.source
    }

    /// Texture bindings in binding order.
    pub fn texture_bindings(&self) -> impl Iterator<Item = &UniformBinding> {
        self.bindings
            .iter()
            .filter(|b| b.sampling == SamplingType::Texture2DArray)
    }
}

/// Number of leading node inputs bound as textures.
///
/// A resize reads its size operand at compile time, so only the image is
/// bound.
pub fn bound_input_count(node: &OperationNode) -> usize {
    match node.kind {
        OpKind::ResizeBilinear => 1,
        _ => node.inputs.len(),
    }
}

/// Generate, validate and cache the program for `node`.
///
/// # Errors
/// Returns `UnsupportedOp` for kinds without a program, parameter errors of
/// the node, and `ShaderCompilation` if the generated WGSL does not validate.
pub fn compile_program(
    cache: &mut ProgramCache,
    node: &OperationNode,
    inputs: &[ProgramInput<'_>],
    size_input: Option<&TensorValue>,
    output: &GpuResourceLayout,
) -> Result<CompiledProgram> {
    let layouts: Vec<&GpuResourceLayout> = inputs.iter().map(|input| input.layout).collect();
    let params = ProgramParams::resolve(node, &layouts, size_input)?;

    let roles = params.roles();
    if roles.len() != inputs.len() {
        return Err(Error::GraphBuild(format!(
            "node '{}' ({}) binds {} textures, expected {}",
            node.name,
            node.kind,
            inputs.len(),
            roles.len()
        )));
    }

    let key = ProgramKey {
        kind: node.kind.clone(),
        params,
        inputs: layouts.iter().map(|&l| l.clone()).collect(),
        output: output.clone(),
    };
    let shader = cache.get_or_try_insert(key, || {
        let source = generate_source(node, &params, &layouts, output);
        let module = wgsl::validate(&node.name, &source)?;
        Ok(ShaderArtifact { source, module })
    })?;

    let mut bindings = vec![UniformBinding {
        name: "params".to_string(),
        binding: DRAW_PARAMS_BINDING,
        source: BindingSource::DrawParams,
        sampling: SamplingType::ParamsBlock,
    }];
    bindings.extend(roles.iter().zip(inputs).enumerate().map(|(i, (role, input))| {
        UniformBinding {
            name: role.to_string(),
            binding: i as u32 + 1,
            source: input.source.clone(),
            sampling: SamplingType::Texture2DArray,
        }
    }));

    let attachments = AttachmentPlan {
        render_targets: output.render_targets,
        draws: output.draw_calls(),
    };
    tracing::debug!(
        node = %node.name,
        kind = %node.kind,
        draws = attachments.draws.len(),
        render_targets = attachments.render_targets,
        "compiled program"
    );

    Ok(CompiledProgram {
        node: node.name.clone(),
        kind: node.kind.clone(),
        params,
        shader,
        bindings,
        attachments,
        output_layout: output.clone(),
    })
}

fn generate_source(
    node: &OperationNode,
    params: &ProgramParams,
    inputs: &[&GpuResourceLayout],
    output: &GpuResourceLayout,
) -> String {
    let mut writer = WgslWriter::new(&format!("{} program", node.kind));
    for (i, (role, layout)) in params.roles().iter().zip(inputs).enumerate() {
        writer.texture_input(role, i as u32 + 1, layout);
    }
    let body = params.emit(&mut writer, &node.kind, inputs, output);
    writer.finish(output, &body)
}
