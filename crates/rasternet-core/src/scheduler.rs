//! Scheduling: dependency closure, topological order, input validation and
//! identity elision.
//!
//! The scheduler turns a [`Graph`] into a [`Schedule`]: the nodes needed by
//! the requested outputs in dependency order, with identity nodes removed and
//! their consumers re-pointed to the identity's input, plus the output
//! descriptor of every scheduled node.

use crate::graph::{Graph, OperationNode};
use crate::name::parse_node_name;
use crate::shape::infer_output;
use crate::types::OpKind;
use crate::{
    AttrValue, DataType, Error, NamedTensorMap, Result, TensorDescriptor, TensorValue,
};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{HashMap, HashSet};

/// Execution-wide structural settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionMode {
    /// When false, the engine runs without a leading batch dimension: declared
    /// input shapes lose their first dimension and every runtime input must
    /// have a leading dimension of 1, which is stripped.
    pub has_batch_dimension: bool,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self {
            has_batch_dimension: true,
        }
    }
}

/// A requested output and the node that produces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    /// Name the caller asked for (external signature name or node name).
    pub name: String,
    /// Producing node after identity elision.
    pub node: String,
}

/// A runtime input expected by a schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    /// External name from the signature, or the node name when unsigned.
    pub name: String,
    /// Placeholder node the input feeds.
    pub node: String,
    pub dtype: DataType,
    /// Declared constraint; `-1` matches any size.
    pub declared: Option<Vec<i64>>,
    /// Concrete shape the schedule was built for.
    pub shape: Vec<usize>,
}

/// Read-only view over constants and bound runtime inputs.
///
/// The two maps are kept apart and never mutated after binding.
#[derive(Debug)]
pub struct TensorLookup<'a> {
    constants: &'a NamedTensorMap,
    inputs: NamedTensorMap,
}

impl<'a> TensorLookup<'a> {
    pub fn get(&self, node: &str) -> Option<&TensorValue> {
        self.inputs.get(node).or_else(|| self.constants.get(node))
    }

    pub fn constants(&self) -> &NamedTensorMap {
        self.constants
    }

    /// Runtime inputs keyed by placeholder node name.
    pub fn inputs(&self) -> &NamedTensorMap {
        &self.inputs
    }
}

/// Ordered, validated execution plan of a graph.
#[derive(Debug, Clone)]
pub struct Schedule {
    nodes: Vec<OperationNode>,
    descriptors: HashMap<String, TensorDescriptor>,
    inputs: Vec<InputSpec>,
    outputs: Vec<ResolvedOutput>,
    constants: NamedTensorMap,
    mode: ExecutionMode,
}

impl Schedule {
    /// Scheduled nodes in dependency order, including data nodes.
    pub fn nodes(&self) -> &[OperationNode] {
        &self.nodes
    }

    /// Scheduled nodes that run a program.
    pub fn op_nodes(&self) -> impl Iterator<Item = &OperationNode> {
        self.nodes.iter().filter(|n| !n.kind.is_data())
    }

    pub fn descriptor(&self, node: &str) -> Option<&TensorDescriptor> {
        self.descriptors.get(node)
    }

    pub fn inputs(&self) -> &[InputSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ResolvedOutput] {
        &self.outputs
    }

    /// Constants reachable from the requested outputs.
    pub fn constants(&self) -> &NamedTensorMap {
        &self.constants
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Validate runtime inputs and bind them for execution.
    ///
    /// Names map through the signature; the batch dimension is stripped when
    /// the mode has none; shapes must satisfy the declared constraint and
    /// equal the shape the schedule was built for; dtypes must match exactly.
    ///
    /// # Errors
    /// Returns `InputValidation` naming the input and the offending dimension
    /// or dtype.
    pub fn bind_inputs(&self, provided: &NamedTensorMap) -> Result<TensorLookup<'_>> {
        let mut inputs = NamedTensorMap::new();

        let unknown: Vec<&str> = provided
            .keys()
            .filter(|name| !self.inputs.iter().any(|spec| spec.name == **name || spec.node == **name))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(Error::InputValidation(format!(
                "unknown input names {unknown:?}, expected {:?}",
                self.inputs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>()
            )));
        }

        for spec in &self.inputs {
            let value = provided
                .get(&spec.name)
                .or_else(|| provided.get(&spec.node))
                .ok_or_else(|| Error::InputValidation(format!("missing input '{}'", spec.name)))?;
            let value = prepare_input(spec, value, self.mode)?;

            if value.shape() != spec.shape.as_slice() {
                return Err(Error::InputValidation(format!(
                    "input '{}': graph was compiled for shape {:?}, got {:?}",
                    spec.name,
                    spec.shape,
                    value.shape()
                )));
            }
            inputs.insert(spec.node.clone(), value);
        }

        Ok(TensorLookup {
            constants: &self.constants,
            inputs,
        })
    }
}

/// Strip the batch dimension if needed and check shape and dtype against
/// the declared constraint.
fn prepare_input(spec: &InputSpec, value: &TensorValue, mode: ExecutionMode) -> Result<TensorValue> {
    let value = match strip_batch(spec, value.shape(), mode)? {
        Some(shape) => value.reshaped(&spec.name, shape)?,
        None => value.clone(),
    };

    if value.dtype() != spec.dtype {
        return Err(Error::InputValidation(format!(
            "input '{}': expected dtype {}, got {}",
            spec.name,
            spec.dtype,
            value.dtype()
        )));
    }

    check_declared(spec, value.shape())?;
    Ok(value)
}

/// Shape without its leading batch dimension, when the mode has none.
fn strip_batch(spec: &InputSpec, shape: &[usize], mode: ExecutionMode) -> Result<Option<Vec<usize>>> {
    if mode.has_batch_dimension {
        return Ok(None);
    }
    match shape {
        [1, rest @ ..] => Ok(Some(rest.to_vec())),
        shape => Err(Error::InputValidation(format!(
            "input '{}': expected a leading batch dimension of 1 to strip, got shape {shape:?}",
            spec.name
        ))),
    }
}

fn check_declared(spec: &InputSpec, shape: &[usize]) -> Result<()> {
    let Some(declared) = &spec.declared else {
        return Ok(());
    };
    if declared.len() != shape.len() {
        return Err(Error::InputValidation(format!(
            "input '{}': expected rank {} (shape {declared:?}), got shape {shape:?}",
            spec.name,
            declared.len(),
        )));
    }
    for (i, (&want, &got)) in declared.iter().zip(shape).enumerate() {
        if want != -1 && want != got as i64 {
            return Err(Error::InputValidation(format!(
                "input '{}' dimension {i}: expected {want}, got {got}",
                spec.name
            )));
        }
    }
    Ok(())
}

fn parse_dtype(node: &str, value: Option<&AttrValue>) -> Result<DataType> {
    match value.and_then(AttrValue::as_str) {
        None | Some("float32") | Some("DT_FLOAT") => Ok(DataType::Float32),
        Some("int32") | Some("DT_INT32") => Ok(DataType::Int32),
        Some("bool") | Some("DT_BOOL") => Ok(DataType::Bool),
        Some("string") | Some("DT_STRING") => Ok(DataType::String),
        Some(other) => Err(Error::GraphBuild(format!(
            "placeholder '{node}' has unsupported dtype '{other}'"
        ))),
    }
}

/// Orders and validates a graph for a set of requested outputs.
pub struct Scheduler<'g> {
    graph: &'g Graph,
    mode: ExecutionMode,
    input_shapes: HashMap<String, Vec<usize>>,
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g Graph, mode: ExecutionMode) -> Self {
        Self {
            graph,
            mode,
            input_shapes: HashMap::new(),
        }
    }

    /// Concrete input shapes to schedule for when no runtime inputs are
    /// given, keyed by input name and written as they would be passed at
    /// run time (batch dimension included).
    pub fn with_input_shapes(mut self, shapes: HashMap<String, Vec<usize>>) -> Self {
        self.input_shapes = shapes;
        self
    }

    /// Build the schedule for `outputs`.
    ///
    /// An empty output list falls back to the signature outputs, then to the
    /// graph's sink nodes. When `runtime_inputs` is given, the inputs are
    /// validated and their shapes become the concrete input shapes;
    /// otherwise declared shapes are used, with a leading `-1` batch
    /// dimension read as 1, unless [`Scheduler::with_input_shapes`] names
    /// the input.
    ///
    /// # Errors
    /// Returns `InputValidation` for unresolvable outputs or bad inputs,
    /// `GraphBuild` for cycles or undeclared input dimensions, and any shape
    /// inference error of the scheduled ops.
    #[tracing::instrument(skip_all, fields(num_nodes = self.graph.nodes().len(), num_outputs = outputs.len()))]
    pub fn schedule(
        &self,
        outputs: &[&str],
        runtime_inputs: Option<&NamedTensorMap>,
    ) -> Result<Schedule> {
        let (dep_graph, indices) = self.build_dependency_graph();
        let order = petgraph::algo::toposort(&dep_graph, None).map_err(|cycle| {
            Error::GraphBuild(format!(
                "graph contains a cycle through node '{}'",
                self.graph.nodes()[dep_graph[cycle.node_id()]].name
            ))
        })?;

        let outputs = self.resolve_outputs(outputs)?;

        // Dependency closure of the requested outputs.
        let mut needed = HashSet::new();
        let reversed = Reversed(&dep_graph);
        for output in &outputs {
            let start = indices[output.node.as_str()];
            let mut dfs = Dfs::new(reversed, start);
            while let Some(idx) = dfs.next(reversed) {
                needed.insert(idx);
            }
        }

        let mut nodes = Vec::with_capacity(needed.len());
        for idx in order.into_iter().filter(|idx| needed.contains(idx)) {
            let node = &self.graph.nodes()[dep_graph[idx]];
            if node.kind == OpKind::Identity {
                tracing::debug!(node = %node.name, "eliding identity node");
                continue;
            }
            let mut node = node.clone();
            for input in &mut node.inputs {
                input.node = self.resolve_identity(&input.node).to_string();
            }
            node.weights = node
                .inputs
                .iter()
                .filter(|input| self.graph.constants().contains_key(&input.node))
                .map(|input| input.node.clone())
                .collect();
            nodes.push(node);
        }

        let inputs = self.input_specs(&nodes, runtime_inputs)?;
        let constants: NamedTensorMap = nodes
            .iter()
            .filter(|n| n.kind == OpKind::Const)
            .map(|n| (n.name.clone(), self.graph.constants()[&n.name].clone()))
            .collect();

        let descriptors = infer_descriptors(&nodes, &inputs, &constants)?;

        tracing::debug!(
            scheduled = nodes.len(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            "schedule built"
        );

        let schedule = Schedule {
            nodes,
            descriptors,
            inputs,
            outputs,
            constants,
            mode: self.mode,
        };

        if let Some(provided) = runtime_inputs {
            schedule.bind_inputs(provided)?;
        }
        Ok(schedule)
    }

    fn build_dependency_graph(&self) -> (DiGraph<usize, ()>, HashMap<&'g str, NodeIndex>) {
        let mut dep_graph = DiGraph::new();
        let mut indices = HashMap::new();

        for (i, node) in self.graph.nodes().iter().enumerate() {
            indices.insert(node.name.as_str(), dep_graph.add_node(i));
        }
        for node in self.graph.nodes() {
            let consumer = indices[node.name.as_str()];
            for producer in node.input_nodes() {
                dep_graph.add_edge(indices[producer], consumer, ());
            }
        }

        (dep_graph, indices)
    }

    /// Follow identity chains to the producing node.
    fn resolve_identity<'a>(&'a self, mut name: &'a str) -> &'a str {
        while let Some(node) = self.graph.node(name)
            && node.kind == OpKind::Identity
            && let Some(input) = node.inputs.first()
        {
            name = &input.node;
        }
        name
    }

    fn resolve_outputs(&self, requested: &[&str]) -> Result<Vec<ResolvedOutput>> {
        let signature = self.graph.signature();

        let names: Vec<String> = if !requested.is_empty() {
            requested.iter().map(|s| s.to_string()).collect()
        } else if let Some(sig) = signature.filter(|s| !s.outputs.is_empty()) {
            sig.outputs.keys().cloned().collect()
        } else {
            self.graph.sinks().iter().map(|n| n.name.clone()).collect()
        };

        if names.is_empty() {
            return Err(Error::InputValidation(
                "no outputs requested and the graph declares none".to_string(),
            ));
        }

        names
            .into_iter()
            .map(|name| {
                let reference = signature
                    .and_then(|sig| sig.outputs.get(&name))
                    .map(|spec| spec.name.as_str())
                    .unwrap_or(&name);
                let node = parse_node_name(reference)?.node;
                if self.graph.node(&node).is_none() {
                    return Err(Error::InputValidation(format!(
                        "requested output '{name}' resolves to '{node}', which is not a node of the graph"
                    )));
                }
                let node = self.resolve_identity(&node).to_string();
                Ok(ResolvedOutput { name, node })
            })
            .collect()
    }

    /// Input specs for every scheduled placeholder.
    fn input_specs(
        &self,
        nodes: &[OperationNode],
        runtime_inputs: Option<&NamedTensorMap>,
    ) -> Result<Vec<InputSpec>> {
        let signature = self.graph.signature();
        let mut specs = Vec::new();

        for node in nodes.iter().filter(|n| n.kind == OpKind::Placeholder) {
            let signed = signature.and_then(|sig| {
                sig.inputs.iter().find(|(_, spec)| {
                    parse_node_name(&spec.name).is_ok_and(|p| p.node == node.name)
                })
            });

            let (name, dtype, declared) = match signed {
                Some((external, spec)) => (
                    external.clone(),
                    spec.dtype,
                    spec.shape.clone().or_else(|| declared_shape(node)),
                ),
                None => (
                    node.name.clone(),
                    parse_dtype(&node.name, node.attr("dtype"))?,
                    declared_shape(node),
                ),
            };

            let declared = match declared {
                Some(shape) if !self.mode.has_batch_dimension => {
                    Some(shape.into_iter().skip(1).collect())
                }
                other => other,
            };

            let mut spec = InputSpec {
                name,
                node: node.name.clone(),
                dtype,
                declared,
                shape: Vec::new(),
            };

            spec.shape = match runtime_inputs {
                Some(provided) => {
                    let value = provided
                        .get(&spec.name)
                        .or_else(|| provided.get(&spec.node))
                        .ok_or_else(|| {
                            Error::InputValidation(format!("missing input '{}'", spec.name))
                        })?;
                    prepare_input(&spec, value, self.mode)?.shape().to_vec()
                }
                None => match self
                    .input_shapes
                    .get(&spec.name)
                    .or_else(|| self.input_shapes.get(&spec.node))
                {
                    Some(shape) => {
                        let shape = strip_batch(&spec, shape, self.mode)?
                            .unwrap_or_else(|| shape.clone());
                        check_declared(&spec, &shape)?;
                        shape
                    }
                    None => self.concrete_shape(&spec)?,
                },
            };

            specs.push(spec);
        }

        Ok(specs)
    }

    fn concrete_shape(&self, spec: &InputSpec) -> Result<Vec<usize>> {
        let declared = spec.declared.as_ref().ok_or_else(|| {
            Error::GraphBuild(format!(
                "input '{}' declares no shape; provide an input to compile against",
                spec.name
            ))
        })?;

        declared
            .iter()
            .enumerate()
            .map(|(i, &dim)| match dim {
                -1 if i == 0 && self.mode.has_batch_dimension => Ok(1),
                d if d >= 0 => Ok(d as usize),
                _ => Err(Error::GraphBuild(format!(
                    "input '{}' dimension {i} is unknown; provide an input to compile against",
                    spec.name
                ))),
            })
            .collect()
    }
}

fn declared_shape(node: &OperationNode) -> Option<Vec<i64>> {
    node.attr("shape")
        .and_then(AttrValue::as_numbers)
        .map(|dims| dims.into_iter().map(|d| d as i64).collect())
}

fn infer_descriptors(
    nodes: &[OperationNode],
    inputs: &[InputSpec],
    constants: &NamedTensorMap,
) -> Result<HashMap<String, TensorDescriptor>> {
    let mut descriptors: HashMap<String, TensorDescriptor> = HashMap::new();

    for node in nodes {
        let desc = match node.kind {
            OpKind::Placeholder => {
                let spec = inputs
                    .iter()
                    .find(|s| s.node == node.name)
                    .ok_or_else(|| {
                        Error::GraphBuild(format!("placeholder '{}' has no input spec", node.name))
                    })?;
                TensorDescriptor::new(spec.shape.clone(), spec.dtype)
            }
            OpKind::Const => constants[&node.name].descriptor().clone(),
            _ => {
                let input_descs = node
                    .input_nodes()
                    .map(|name| {
                        descriptors.get(name).ok_or_else(|| {
                            Error::GraphBuild(format!(
                                "node '{}' is scheduled before its input '{name}'",
                                node.name
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                infer_output(node, &input_descs, |i| {
                    node.inputs
                        .get(i)
                        .and_then(|input| constants.get(&input.node))
                        .cloned()
                })?
            }
        };
        tracing::trace!(node = %node.name, shape = ?desc.shape, "inferred descriptor");
        descriptors.insert(node.name.clone(), desc);
    }

    Ok(descriptors)
}
