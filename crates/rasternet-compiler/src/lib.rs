//! Raster program compiler for rasternet.
//!
//! This crate turns a loaded model into a [`CompiledGraph`]: the schedule of
//! op nodes, the texture layout of every tensor the GPU touches, and one
//! validated WGSL render program per op node. It never talks to a device;
//! `rasternet-runtime` executes the result.
//!
//! Compilation runs in fixed stages:
//! 1. **Build** - Normalize the model into an operation graph
//! 2. **Schedule** - Order the dependency closure of the outputs, bind input
//!    shapes and infer every node's descriptor
//! 3. **Layout** - Compute texture layouts and render-target batching
//! 4. **Codegen** - Generate, validate and cache raster programs
//!
//! # Example
//!
//! ```no_run
//! use rasternet_compiler::{CompileOptions, EngineOptions, HardwareLimits, compile};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let model = rasternet_model::load_model("model/model.json").await?;
//! let compiled = compile(
//!     &model,
//!     &EngineOptions::default(),
//!     &HardwareLimits::default(),
//!     &CompileOptions::default(),
//! )?;
//! println!("{} programs", compiled.programs().len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod layout;
pub mod options;
pub mod shader;

pub use cache::{ProgramCache, ProgramKey, ShaderArtifact};
pub use layout::{DrawCall, GpuResourceLayout};
pub use options::{
    EngineOptions, HardwareLimits, LayoutLimits, LayoutOptions, RenderTargetBreakpoint,
    Transformations,
};
pub use shader::{
    AttachmentPlan, BindingSource, CompiledProgram, DRAW_PARAMS_BINDING, DRAW_PARAMS_SIZE,
    ProgramInput, ProgramParams, SamplingType, UniformBinding, compile_program,
};

pub use rasternet_core::{Error, Result};

use rasternet_core::{Graph, GraphBuilder, OpKind, Schedule, Scheduler, TensorValue};
use rasternet_model::LoadedModel;
use std::collections::{HashMap, HashSet};

/// Compilation stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Build,
    Schedule,
    Layout,
    Codegen,
}

/// Per-compile choices.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Requested outputs; empty means the signature outputs, then the sinks.
    pub outputs: Vec<String>,
    /// Concrete shapes for inputs whose declared shape has unknown
    /// dimensions, written as they are passed at run time.
    pub input_shapes: HashMap<String, Vec<usize>>,
}

/// The compiled form of a model, ready for a runtime to execute.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    schedule: Schedule,
    programs: Vec<CompiledProgram>,
    layouts: HashMap<String, GpuResourceLayout>,
    options: EngineOptions,
}

impl CompiledGraph {
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Programs in execution order.
    pub fn programs(&self) -> &[CompiledProgram] {
        &self.programs
    }

    pub fn program(&self, node: &str) -> Option<&CompiledProgram> {
        self.programs.iter().find(|p| p.node == node)
    }

    /// Layout of a node's texture, for every node that has one.
    pub fn layout(&self, node: &str) -> Option<&GpuResourceLayout> {
        self.layouts.get(node)
    }

    pub fn layouts(&self) -> impl Iterator<Item = (&str, &GpuResourceLayout)> {
        self.layouts.iter().map(|(name, layout)| (name.as_str(), layout))
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Constants that live in textures, with their layouts.
    pub fn weights(&self) -> impl Iterator<Item = (&str, &TensorValue, &GpuResourceLayout)> {
        self.schedule.constants().iter().filter_map(|(name, value)| {
            self.layouts
                .get(name)
                .map(|layout| (name.as_str(), value, layout))
        })
    }

    /// Number of distinct shaders across all programs.
    pub fn unique_shaders(&self) -> usize {
        let mut seen = HashSet::new();
        self.programs
            .iter()
            .filter(|p| seen.insert(std::sync::Arc::as_ptr(&p.shader)))
            .count()
    }
}

/// Compile a loaded model.
///
/// # Errors
/// Returns `ResourceLimit` if the options exceed `limits` or a tensor does
/// not fit, `GraphBuild`/`InputValidation`/`Shape` errors from building and
/// scheduling, `UnsupportedOp` for ops without a program, and
/// `ShaderCompilation` if generated WGSL fails validation.
#[tracing::instrument(skip_all, fields(format = ?model.description.model_topology.format(), num_weights = model.weights.len()))]
pub fn compile(
    model: &LoadedModel,
    options: &EngineOptions,
    limits: &HardwareLimits,
    compile_options: &CompileOptions,
) -> Result<CompiledGraph> {
    let graph = {
        let _span = tracing::debug_span!("stage", name = ?Stage::Build).entered();
        GraphBuilder::new().build_model(model)?
    };
    compile_graph(&graph, options, limits, compile_options)
}

/// Compile an already built graph.
///
/// # Errors
/// See [`compile`].
#[tracing::instrument(skip_all, fields(num_nodes = graph.nodes().len()))]
pub fn compile_graph(
    graph: &Graph,
    options: &EngineOptions,
    limits: &HardwareLimits,
    compile_options: &CompileOptions,
) -> Result<CompiledGraph> {
    options.validate(limits)?;

    let schedule = {
        let _span = tracing::debug_span!("stage", name = ?Stage::Schedule).entered();
        let outputs: Vec<&str> = compile_options.outputs.iter().map(String::as_str).collect();
        Scheduler::new(graph, options.execution_mode())
            .with_input_shapes(compile_options.input_shapes.clone())
            .schedule(&outputs, None)?
    };

    let layouts = {
        let _span = tracing::debug_span!("stage", name = ?Stage::Layout).entered();
        compute_layouts(&schedule, options, limits)?
    };

    let programs = {
        let _span = tracing::debug_span!("stage", name = ?Stage::Codegen).entered();
        generate_programs(&schedule, &layouts)?
    };

    let compiled = CompiledGraph {
        schedule,
        programs,
        layouts,
        options: options.clone(),
    };
    tracing::info!(
        programs = compiled.programs.len(),
        shaders = compiled.unique_shaders(),
        textures = compiled.layouts.len(),
        "compiled graph"
    );
    Ok(compiled)
}

/// Nodes whose tensors live in textures: runtime inputs, op outputs, bound
/// operands and requested outputs.
fn texture_nodes(schedule: &Schedule) -> HashSet<&str> {
    let mut nodes: HashSet<&str> = schedule.inputs().iter().map(|s| s.node.as_str()).collect();
    for node in schedule.op_nodes() {
        nodes.insert(node.name.as_str());
        nodes.extend(
            node.inputs
                .iter()
                .take(shader::bound_input_count(node))
                .map(|input| input.node.as_str()),
        );
    }
    nodes.extend(schedule.outputs().iter().map(|o| o.node.as_str()));
    nodes
}

fn compute_layouts(
    schedule: &Schedule,
    options: &EngineOptions,
    limits: &HardwareLimits,
) -> Result<HashMap<String, GpuResourceLayout>> {
    let layout_limits = options.layout_limits(limits);
    let layout_options = options.layout_options();

    texture_nodes(schedule)
        .into_iter()
        .map(|name| {
            let desc = schedule.descriptor(name).ok_or_else(|| {
                Error::GraphBuild(format!("node '{name}' has no inferred descriptor"))
            })?;
            let layout = GpuResourceLayout::compute(name, desc, &layout_limits, &layout_options)?;
            Ok((name.to_string(), layout))
        })
        .collect()
}

fn generate_programs(
    schedule: &Schedule,
    layouts: &HashMap<String, GpuResourceLayout>,
) -> Result<Vec<CompiledProgram>> {
    let mut cache = ProgramCache::new();
    let layout_of = |name: &str| {
        layouts
            .get(name)
            .ok_or_else(|| Error::GraphBuild(format!("node '{name}' has no texture layout")))
    };

    let mut programs = Vec::new();
    for node in schedule.op_nodes() {
        let bound = &node.inputs[..shader::bound_input_count(node)];
        let sources: Vec<BindingSource> = bound
            .iter()
            .map(|input| {
                if schedule.constants().contains_key(&input.node) {
                    BindingSource::Weight(input.node.clone())
                } else {
                    BindingSource::Node(input.node.clone())
                }
            })
            .collect();
        let inputs = bound
            .iter()
            .zip(&sources)
            .map(|(input, source)| {
                Ok(ProgramInput {
                    source,
                    layout: layout_of(&input.node)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let size_input = match node.kind {
            OpKind::ResizeBilinear => node
                .inputs
                .get(1)
                .and_then(|input| schedule.constants().get(&input.node)),
            _ => None,
        };

        programs.push(compile_program(
            &mut cache,
            node,
            &inputs,
            size_input,
            layout_of(&node.name)?,
        )?);
    }

    tracing::debug!(programs = programs.len(), cached = cache.len(), "generated programs");
    Ok(programs)
}
