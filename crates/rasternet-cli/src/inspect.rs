//! Offline views of a compiled model: schedule, layouts and shaders.
//!
//! Compilation here runs without a device, against the default hardware
//! limits.

use anyhow::{Context, Result};
use rasternet_compiler::{
    BindingSource, CompileOptions, CompiledGraph, EngineOptions, GpuResourceLayout, HardwareLimits,
};
use rasternet_model::LoadedModel;

fn compile_offline(
    model: &LoadedModel,
    options: &EngineOptions,
    compile_options: &CompileOptions,
) -> Result<CompiledGraph> {
    rasternet_compiler::compile(model, options, &HardwareLimits::default(), compile_options)
        .context("Failed to compile model")
}

fn describe_layout(layout: &GpuResourceLayout) -> String {
    format!(
        "{:?} -> {}x{}x{} ({} slice(s), {} channel group(s), {} target(s))",
        layout.shape,
        layout.width,
        layout.height,
        layout.layers,
        layout.slices,
        layout.channel_groups,
        layout.render_targets
    )
}

pub fn print_compiled(
    model: &LoadedModel,
    options: &EngineOptions,
    compile_options: &CompileOptions,
) -> Result<()> {
    let compiled = compile_offline(model, options, compile_options)?;
    let schedule = compiled.schedule();

    println!("Inputs:");
    for input in schedule.inputs() {
        let layout = compiled
            .layout(&input.node)
            .map(describe_layout)
            .unwrap_or_else(|| format!("{:?}", input.shape));
        println!("  {} ({}, node '{}'): {layout}", input.name, input.dtype, input.node);
    }

    println!("Outputs:");
    for output in schedule.outputs() {
        println!("  {} <- {}", output.name, output.node);
    }

    println!("Weights:");
    let mut weights: Vec<_> = compiled.weights().collect();
    weights.sort_by_key(|(name, _, _)| *name);
    for (name, _, layout) in weights {
        println!("  {name}: {}", describe_layout(layout));
    }

    println!(
        "Programs ({} nodes, {} unique shaders):",
        compiled.programs().len(),
        compiled.unique_shaders()
    );
    for program in compiled.programs() {
        println!(
            "  {} [{}]: {}",
            program.node,
            program.kind,
            describe_layout(&program.output_layout)
        );
        for binding in &program.bindings {
            let source = match &binding.source {
                BindingSource::Node(node) => format!("node '{node}'"),
                BindingSource::Weight(name) => format!("weight '{name}'"),
                BindingSource::DrawParams => "draw params".to_string(),
            };
            println!("      @binding({}) {}: {source}", binding.binding, binding.name);
        }
        println!(
            "      {} draw(s) of {} target(s)",
            program.attachments.draws.len(),
            program.attachments.render_targets
        );
    }

    Ok(())
}

pub fn print_shader(
    model: &LoadedModel,
    options: &EngineOptions,
    compile_options: &CompileOptions,
    node: &str,
) -> Result<()> {
    let compiled = compile_offline(model, options, compile_options)?;
    let program = compiled.program(node).with_context(|| {
        let known: Vec<&str> = compiled.programs().iter().map(|p| p.node.as_str()).collect();
        format!("No program for node '{node}', compiled nodes: {known:?}")
    })?;
    println!("{}", program.source());
    Ok(())
}
