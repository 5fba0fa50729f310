//! Compiled graph execution on render pipelines.
//!
//! An [`Engine`] owns every GPU resource of one compiled graph: weight
//! textures uploaded at compile time, then at prepare time the input,
//! intermediate and output textures, one render pipeline per distinct
//! shader, one uniform buffer and bind group per draw, and a readback
//! buffer shared by all outputs.

use crate::error::{Result, RuntimeError};
use crate::runtime::{DeviceErrors, Runtime};
use crate::state::{EngineEvent, EngineState};
use crate::tensor::Tensor;
use crate::texture::{TEXTURE_FORMAT, TextureManager, readback_size};
use rasternet_compiler::{
    BindingSource, CompileOptions, CompiledGraph, CompiledProgram, DRAW_PARAMS_SIZE, DrawCall,
    EngineOptions, HardwareLimits, compile,
};
use rasternet_core::{NamedTensorMap, TensorValue};
use rasternet_model::LoadedModel;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Mirror of the WGSL `DrawParams` uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct DrawParams {
    slice: u32,
    group_offset: u32,
    pad: [u32; 2],
}

impl From<DrawCall> for DrawParams {
    fn from(draw: DrawCall) -> Self {
        Self {
            slice: draw.slice as u32,
            group_offset: draw.group_offset as u32,
            pad: [0; 2],
        }
    }
}

/// Pipeline and bind group layout shared by programs with the same source.
struct RasterPipeline {
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

struct PreparedDraw {
    bind_group: wgpu::BindGroup,
    /// Output layers attached as color targets, in `@location` order.
    targets: Vec<wgpu::TextureView>,
    _params: wgpu::Buffer,
}

struct PreparedProgram {
    node: String,
    pipeline: Arc<RasterPipeline>,
    draws: Vec<PreparedDraw>,
}

/// GPU resources built by [`Engine::prepare`].
struct PreparedGraph {
    programs: Vec<PreparedProgram>,
    readback: wgpu::Buffer,
    pipelines: usize,
}

/// Executes a compiled graph.
///
/// # Example
/// ```no_run
/// # use rasternet_runtime::{Runtime, Tensor};
/// # use rasternet_compiler::{CompileOptions, EngineOptions};
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let runtime = Runtime::new().await?;
///     let model = rasternet_model::load_model("model/model.json").await?;
///
///     let mut engine = runtime.engine(EngineOptions::default())?;
///     engine.compile(&model, &CompileOptions::default())?;
///
///     let input = Tensor::from_vec(vec![0.5f32; 9], &[1, 3, 3, 1])?;
///     let outputs = engine.run(&[("input", input)])?;
///     println!("{}", outputs["conv"].to_nested()?);
///     Ok(())
/// }
/// ```
pub struct Engine {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    errors: DeviceErrors,
    options: EngineOptions,
    limits: HardwareLimits,
    state: EngineState,
    compiled: Option<CompiledGraph>,
    textures: TextureManager,
    prepared: Option<PreparedGraph>,
}

impl Engine {
    /// Create an engine, validating `options` against the device.
    ///
    /// # Errors
    /// Returns `ResourceLimit` for options the device cannot honor.
    pub fn new(runtime: &Runtime, options: EngineOptions) -> Result<Self> {
        let limits = runtime.hardware_limits();
        options.validate(&limits)?;
        Ok(Self {
            device: Arc::clone(runtime.device()),
            queue: Arc::clone(runtime.queue()),
            errors: runtime.errors().clone(),
            textures: TextureManager::new(
                Arc::clone(runtime.device()),
                Arc::clone(runtime.queue()),
            ),
            options,
            limits,
            state: EngineState::Uninitialized,
            compiled: None,
            prepared: None,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn compiled(&self) -> Option<&CompiledGraph> {
        self.compiled.as_ref()
    }

    /// Compile `model` and upload its weights.
    ///
    /// Replaces any previously compiled graph and releases its resources.
    ///
    /// # Errors
    /// Returns the compiler's errors unchanged; a device error while
    /// uploading weights moves the engine to `Failed`.
    #[tracing::instrument(skip_all, fields(outputs = ?compile_options.outputs))]
    pub fn compile(&mut self, model: &LoadedModel, compile_options: &CompileOptions) -> Result<()> {
        let next = self.state.transition(EngineEvent::Compile)?;

        self.prepared = None;
        self.textures.clear();
        self.compiled = None;
        self.state = EngineState::Uninitialized;

        let compiled = compile(model, &self.options, &self.limits, compile_options)?;
        let uploaded = self.upload_weights(&compiled);
        self.settle(uploaded)?;

        self.compiled = Some(compiled);
        self.state = next;
        Ok(())
    }

    fn upload_weights(&mut self, compiled: &CompiledGraph) -> Result<()> {
        for (name, value, layout) in compiled.weights() {
            let values = weight_values(name, value)?;
            self.textures.allocate(name, layout);
            self.textures.upload(name, &values)?;
        }
        self.check_device()?;
        tracing::debug!(weights = self.textures.len(), "weights uploaded");
        Ok(())
    }

    /// Allocate per-run resources and build pipelines and bind groups.
    ///
    /// Idempotent once `Ready`.
    ///
    /// # Errors
    /// Returns `Precondition` before `compile` or after a failure, and
    /// `GpuExecution` if the device rejects a resource.
    #[tracing::instrument(skip_all)]
    pub fn prepare(&mut self) -> Result<()> {
        let next = self.state.transition(EngineEvent::Prepare)?;
        if self.prepared.is_none() {
            let prepared = self.build_prepared();
            let prepared = self.settle(prepared)?;
            self.prepared = Some(prepared);
        }
        self.state = next;
        Ok(())
    }

    fn build_prepared(&mut self) -> Result<PreparedGraph> {
        let compiled = self
            .compiled
            .as_ref()
            .ok_or_else(|| RuntimeError::precondition("no graph compiled"))?;

        for (name, layout) in compiled.layouts() {
            self.textures.allocate(name, layout);
        }

        let mut pipelines: HashMap<&str, Arc<RasterPipeline>> = HashMap::new();
        let mut programs = Vec::with_capacity(compiled.programs().len());
        for program in compiled.programs() {
            let pipeline = match pipelines.get(program.source()) {
                Some(pipeline) => Arc::clone(pipeline),
                None => {
                    let pipeline = Arc::new(create_pipeline(&self.device, program));
                    pipelines.insert(program.source(), Arc::clone(&pipeline));
                    pipeline
                }
            };
            let draws = self.prepare_draws(program, &pipeline)?;
            programs.push(PreparedProgram {
                node: program.node.clone(),
                pipeline,
                draws,
            });
        }

        let readback_bytes = compiled
            .schedule()
            .outputs()
            .iter()
            .filter_map(|output| compiled.layout(&output.node))
            .map(readback_size)
            .max()
            .unwrap_or(0);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Output readback"),
            size: readback_bytes.max(wgpu::COPY_BUFFER_ALIGNMENT),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        self.check_device()?;
        tracing::debug!(
            programs = programs.len(),
            pipelines = pipelines.len(),
            textures = self.textures.len(),
            readback_bytes,
            "engine prepared"
        );
        Ok(PreparedGraph {
            programs,
            readback,
            pipelines: pipelines.len(),
        })
    }

    fn prepare_draws(
        &self,
        program: &CompiledProgram,
        pipeline: &RasterPipeline,
    ) -> Result<Vec<PreparedDraw>> {
        let output = self.textures.get(&program.node)?;
        program
            .attachments
            .draws
            .iter()
            .map(|&draw| {
                let params = self
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(&format!("DrawParams: {}", program.node)),
                        contents: bytemuck::bytes_of(&DrawParams::from(draw)),
                        usage: wgpu::BufferUsages::UNIFORM,
                    });

                let mut entries = Vec::with_capacity(program.bindings.len());
                for binding in &program.bindings {
                    let resource = match &binding.source {
                        BindingSource::DrawParams => params.as_entire_binding(),
                        BindingSource::Node(name) | BindingSource::Weight(name) => {
                            wgpu::BindingResource::TextureView(&self.textures.get(name)?.view)
                        }
                    };
                    entries.push(wgpu::BindGroupEntry {
                        binding: binding.binding,
                        resource,
                    });
                }
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&format!("Bind Group: {}", program.node)),
                    layout: &pipeline.bind_group_layout,
                    entries: &entries,
                });

                let targets = (0..program.attachments.render_targets)
                    .map(|i| {
                        output.layer_view(output.layout.layer(draw.slice, draw.group_offset + i))
                    })
                    .collect();

                Ok(PreparedDraw {
                    bind_group,
                    targets,
                    _params: params,
                })
            })
            .collect()
    }

    /// Run the graph on `inputs` and read back every output.
    ///
    /// Inputs are named by signature name or placeholder node name. A
    /// compiled but unprepared engine is prepared first.
    ///
    /// # Errors
    /// Returns `InputValidation` for unknown, missing or mismatched inputs
    /// (the engine stays `Ready`), `Precondition` before `compile` or after
    /// a failure, and `GpuExecution` when the device fails (the engine
    /// becomes `Failed`).
    #[tracing::instrument(skip_all, fields(num_inputs = inputs.len()))]
    pub fn run(&mut self, inputs: &[(&str, Tensor)]) -> Result<HashMap<String, Tensor>> {
        if self.state == EngineState::Compiled {
            self.prepare()?;
        }
        let running = self.state.transition(EngineEvent::BeginRun)?;

        let provided = inputs
            .iter()
            .map(|(name, tensor)| Ok((name.to_string(), tensor.to_value(name)?)))
            .collect::<Result<NamedTensorMap>>()?;
        let bound = self.bind_inputs(&provided)?;

        self.state = running;
        let outputs = self.execute(&bound);
        let outputs = self.settle(outputs)?;
        self.state = self.state.transition(EngineEvent::FinishRun)?;
        Ok(outputs)
    }

    /// Validated runtime inputs keyed by placeholder node.
    fn bind_inputs(&self, provided: &NamedTensorMap) -> Result<NamedTensorMap> {
        let compiled = match &self.compiled {
            Some(compiled) if self.state.is_compiled() => compiled,
            _ => {
                return Err(RuntimeError::precondition(format!(
                    "cannot bind inputs while {}",
                    self.state
                )));
            }
        };
        let lookup = compiled.schedule().bind_inputs(provided)?;
        Ok(lookup.inputs().clone())
    }

    fn execute(&self, inputs: &NamedTensorMap) -> Result<HashMap<String, Tensor>> {
        let (compiled, prepared) = match (&self.compiled, &self.prepared) {
            (Some(compiled), Some(prepared)) if self.state.is_compiled() => (compiled, prepared),
            _ => {
                return Err(RuntimeError::precondition(format!(
                    "cannot execute while {}",
                    self.state
                )));
            }
        };

        for (node, value) in inputs {
            let values = value.to_f32_vec().ok_or_else(|| {
                RuntimeError::TensorError(format!("input '{node}' is not numeric"))
            })?;
            self.textures.upload(node, &values)?;
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Graph execution"),
            });
        for program in &prepared.programs {
            let _span = tracing::debug_span!("program", node = %program.node).entered();
            for (i, draw) in program.draws.iter().enumerate() {
                let attachments: Vec<Option<wgpu::RenderPassColorAttachment<'_>>> = draw
                    .targets
                    .iter()
                    .map(|view| {
                        Some(wgpu::RenderPassColorAttachment {
                            view,
                            depth_slice: None,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                                store: wgpu::StoreOp::Store,
                            },
                        })
                    })
                    .collect();
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(&program.node),
                    color_attachments: &attachments,
                    ..Default::default()
                });
                pass.set_pipeline(&program.pipeline.pipeline);
                pass.set_bind_group(0, &draw.bind_group, &[]);
                pass.draw(0..6, 0..1);
                tracing::trace!(draw = i, targets = draw.targets.len(), "draw");
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        self.check_device()?;

        let mut outputs = HashMap::new();
        for output in compiled.schedule().outputs() {
            let descriptor = compiled.schedule().descriptor(&output.node).ok_or_else(|| {
                RuntimeError::gpu(format!("output '{}' has no descriptor", output.name))
            })?;
            let values = self.textures.download(&output.node, &prepared.readback)?;
            self.check_device()?;
            outputs.insert(
                output.name.clone(),
                Tensor::from_readback(values, descriptor)?,
            );
        }
        Ok(outputs)
    }

    /// Surface an error recorded by the device since the last check.
    fn check_device(&self) -> Result<()> {
        match self.errors.take() {
            Some(message) => Err(RuntimeError::gpu(message)),
            None => Ok(()),
        }
    }

    /// Apply the lifecycle consequence of `result` failing.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            let device_failure = err.is_device_failure();
            if device_failure {
                tracing::error!(error = %err, "device failure, engine needs recompiling");
                self.prepared = None;
            }
            self.state = self.state.after_error(device_failure);
        }
        result
    }

    /// Number of render pipelines built by `prepare`.
    pub fn pipeline_count(&self) -> usize {
        self.prepared.as_ref().map_or(0, |p| p.pipelines)
    }
}

fn weight_values(name: &str, value: &TensorValue) -> Result<Vec<f32>> {
    value.to_f32_vec().ok_or_else(|| {
        RuntimeError::TensorError(format!(
            "weight '{name}' of dtype {} cannot be stored in a texture",
            value.dtype()
        ))
    })
}

fn create_pipeline(device: &wgpu::Device, program: &CompiledProgram) -> RasterPipeline {
    let label = format!("{} program", program.kind);
    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&label),
        source: wgpu::ShaderSource::Wgsl(program.source().into()),
    });

    let entries: Vec<wgpu::BindGroupLayoutEntry> = program
        .bindings
        .iter()
        .map(|binding| wgpu::BindGroupLayoutEntry {
            binding: binding.binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: match binding.source {
                BindingSource::DrawParams => wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(DRAW_PARAMS_SIZE),
                },
                BindingSource::Node(_) | BindingSource::Weight(_) => wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2Array,
                    multisampled: false,
                },
            },
            count: None,
        })
        .collect();
    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&label),
        entries: &entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&label),
        bind_group_layouts: &[&bind_group_layout],
        immediate_size: 0,
    });

    let targets: Vec<Option<wgpu::ColorTargetState>> = (0..program.attachments.render_targets)
        .map(|_| {
            Some(wgpu::ColorTargetState {
                format: TEXTURE_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })
        })
        .collect();

    let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(&label),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &module,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers: &[],
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: &module,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &targets,
        }),
        multiview_mask: None,
        cache: None,
    });

    tracing::debug!(kind = %program.kind, render_targets = targets.len(), "created render pipeline");
    RasterPipeline {
        pipeline,
        bind_group_layout,
    }
}
