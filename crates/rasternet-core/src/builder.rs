//! Normalization of graph models and layers models into one `Graph`.

use crate::graph::{Graph, NodeInput, OperationNode};
use crate::name::NodeNameCache;
use crate::params::required_attr;
use crate::types::{LayerClass, OpKind};
use crate::{AttrValue, Error, NamedTensorMap, Result, TensorValue};
use rasternet_model::{
    GraphTopology, LayerDef, LayersTopology, LoadedModel, ModelDescription, ModelTopology,
    Signature,
};
use std::collections::BTreeMap;

/// Layers model tensors beyond kernel and bias are not modeled.
const MAX_LAYER_WEIGHTS: usize = 2;

/// Builds a normalized [`Graph`] from a model description and its weights.
///
/// Owns the node-name cache for the duration of one build.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    names: NodeNameCache,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a loaded model.
    pub fn build_model(&mut self, model: &LoadedModel) -> Result<Graph> {
        self.build(&model.description, &model.weights)
    }

    /// Build from a description and a weight map keyed by weight name.
    ///
    /// # Errors
    /// Returns `GraphBuild` when an input reference does not resolve, a
    /// layer has more than two weights, a `Const` has no weight, or an
    /// attribute required by the op kind is absent.
    #[tracing::instrument(skip_all, fields(format = ?description.model_topology.format()))]
    pub fn build(
        &mut self,
        description: &ModelDescription,
        weights: &NamedTensorMap,
    ) -> Result<Graph> {
        let graph = match &description.model_topology {
            ModelTopology::Graph(topology) => {
                self.build_graph_model(topology, weights, description.signature.clone())?
            }
            ModelTopology::Layers(topology) => {
                Self::build_layers_model(topology, weights, description.signature.clone())?
            }
        };
        tracing::debug!(
            nodes = graph.nodes().len(),
            constants = graph.constants().len(),
            "graph built"
        );
        Ok(graph)
    }

    // ── Graph models ──────────────────────────────────────────────────

    fn build_graph_model(
        &mut self,
        topology: &GraphTopology,
        weights: &NamedTensorMap,
        signature: Option<Signature>,
    ) -> Result<Graph> {
        let mut nodes = Vec::with_capacity(topology.node.len());
        let mut constants = NamedTensorMap::new();

        for def in &topology.node {
            let kind = OpKind::from_graph_op(&def.op);

            let mut inputs = Vec::with_capacity(def.input.len());
            for reference in &def.input {
                // Control dependencies carry no data.
                if reference.starts_with('^') {
                    continue;
                }
                let parsed = self.names.parse(reference)?;
                inputs.push(NodeInput {
                    node: parsed.node,
                    output_index: parsed.output_index,
                    output_name: parsed.output_name,
                });
            }

            let mut node = OperationNode {
                name: def.name.clone(),
                kind,
                inputs,
                attributes: def.attr.clone(),
                weights: Vec::new(),
            };

            if node.kind == OpKind::Const {
                let value = weights.get(&def.name).ok_or_else(|| {
                    Error::GraphBuild(format!("Const node '{}' has no weight tensor", def.name))
                })?;
                constants.insert(def.name.clone(), value.clone());
            }
            if node.kind.is_fused() {
                normalize_fused_ops(&mut node)?;
            }

            nodes.push(node);
        }

        finish(nodes, constants, signature)
    }

    // ── Layers models ─────────────────────────────────────────────────

    fn build_layers_model(
        topology: &LayersTopology,
        weights: &NamedTensorMap,
        signature: Option<Signature>,
    ) -> Result<Graph> {
        let mut input_nodes = Vec::new();
        let mut nodes = Vec::new();
        let mut constants = NamedTensorMap::new();

        for layer in &topology.layers {
            let class = LayerClass::from_class_name(&layer.class_name);

            if layer.weights.len() > MAX_LAYER_WEIGHTS {
                return Err(Error::GraphBuild(format!(
                    "layer '{}' has {} weights, at most {MAX_LAYER_WEIGHTS} (kernel and bias) are supported",
                    layer.name,
                    layer.weights.len()
                )));
            }

            if class == LayerClass::InputLayer {
                input_nodes.push(input_layer_node(layer)?);
                continue;
            }

            if layer.inbound_layers.is_empty() {
                return Err(Error::GraphBuild(format!(
                    "layer '{}' ({}) has no input nodes",
                    layer.name, layer.class_name
                )));
            }

            let mut node = OperationNode::new(&layer.name, layer_op_kind(&class, layer))
                .with_inputs(layer.inbound_layers.iter().cloned());
            node.attributes = layer_attributes(&class, layer);

            for (index, weight_name) in layer.weights.iter().enumerate() {
                let value = weights.get(weight_name).ok_or_else(|| {
                    Error::GraphBuild(format!(
                        "layer '{}' references weight '{weight_name}' which was not loaded",
                        layer.name
                    ))
                })?;
                let const_name = weight_node_name(&layer.name, index);
                constants.insert(const_name.clone(), value.clone());
                nodes.push(OperationNode::new(&const_name, OpKind::Const));
                node.inputs.push(NodeInput::new(&const_name));
            }

            nodes.push(node);
        }

        // Input layers go to the front, in declaration order.
        input_nodes.extend(nodes);
        finish(input_nodes, constants, signature)
    }
}

/// Deterministic name of the synthetic Const node for a layer weight.
pub fn weight_node_name(layer: &str, index: usize) -> String {
    format!("{layer}/weight_{index}")
}

fn finish(
    mut nodes: Vec<OperationNode>,
    constants: NamedTensorMap,
    signature: Option<Signature>,
) -> Result<Graph> {
    for node in &mut nodes {
        check_required_attributes(node)?;
        node.weights = node
            .inputs
            .iter()
            .filter(|input| constants.contains_key(&input.node))
            .map(|input| input.node.clone())
            .collect();
    }
    let graph = Graph::new(nodes, constants, signature)?;

    for node in graph.nodes() {
        for input in &node.inputs {
            if input.output_index > 0 {
                return Err(Error::GraphBuild(format!(
                    "node '{}' reads output {} of '{}', which has a single output",
                    node.name, input.output_index, input.node
                )));
            }
        }
        if node.kind == OpKind::Identity && node.inputs.len() != 1 {
            return Err(Error::GraphBuild(format!(
                "Identity node '{}' has {} inputs, expected 1",
                node.name,
                node.inputs.len()
            )));
        }
    }
    Ok(graph)
}

fn check_required_attributes(node: &OperationNode) -> Result<()> {
    if node.kind.is_convolution() {
        required_attr(node, "strides")?;
        required_attr(node, "padding")?;
    }
    if node.kind == OpKind::ResizeBilinear
        && node.inputs.len() < 2
        && node.attr("size").is_none()
        && node.attr("scale").is_none()
    {
        required_attr(node, "size")?;
    }
    Ok(())
}

/// Fold `fused_ops` of a fused convolution into an `activation` attribute.
fn normalize_fused_ops(node: &mut OperationNode) -> Result<()> {
    let fused = required_attr(node, "fused_ops")?.as_strings().ok_or_else(|| {
        Error::GraphBuild(format!(
            "node '{}': fused_ops must be a list of strings",
            node.name
        ))
    })?;

    let activation = match fused.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["BiasAdd"] => "linear",
        ["BiasAdd", "Relu"] => "relu",
        ["BiasAdd", "Relu6"] => "relu6",
        other => {
            return Err(Error::GraphBuild(format!(
                "node '{}': unsupported fused ops {other:?}",
                node.name
            )));
        }
    };
    node.attributes
        .insert("activation".to_string(), AttrValue::String(activation.to_string()));
    Ok(())
}

fn input_layer_node(layer: &LayerDef) -> Result<OperationNode> {
    let shape = layer
        .config
        .get("batch_input_shape")
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            Error::GraphBuild(format!(
                "input layer '{}' has no batch_input_shape",
                layer.name
            ))
        })?
        .iter()
        .map(|dim| dim.as_f64().unwrap_or(-1.0))
        .collect();

    let dtype = layer
        .config
        .get("dtype")
        .and_then(|v| v.as_str())
        .unwrap_or("float32");

    Ok(OperationNode::new(&layer.name, OpKind::Placeholder)
        .with_attr("shape", AttrValue::Numbers(shape))
        .with_attr("dtype", AttrValue::String(dtype.to_string())))
}

fn config_str<'a>(layer: &'a LayerDef, key: &str) -> Option<&'a str> {
    layer.config.get(key).and_then(|v| v.as_str())
}

fn layer_op_kind(class: &LayerClass, layer: &LayerDef) -> OpKind {
    match class {
        LayerClass::InputLayer => OpKind::Placeholder,
        LayerClass::Conv2D => OpKind::Conv2D,
        LayerClass::DepthwiseConv2D => OpKind::DepthwiseConv2D,
        LayerClass::ReLU => OpKind::Relu,
        LayerClass::Activation => match config_str(layer, "activation") {
            Some("relu") => OpKind::Relu,
            Some("linear") => OpKind::Identity,
            other => OpKind::Unsupported(format!("Activation({})", other.unwrap_or("?"))),
        },
        LayerClass::Add => OpKind::Add,
        LayerClass::Multiply => OpKind::Mul,
        LayerClass::UpSampling2D => match config_str(layer, "interpolation") {
            Some("bilinear") => OpKind::ResizeBilinear,
            other => OpKind::Unsupported(format!("UpSampling2D({})", other.unwrap_or("nearest"))),
        },
        LayerClass::Unsupported(name) => OpKind::Unsupported(name.clone()),
    }
}

/// Translate a layer config into op attributes.
fn layer_attributes(class: &LayerClass, layer: &LayerDef) -> BTreeMap<String, AttrValue> {
    let mut attrs = BTreeMap::new();
    let numbers = |key: &str| -> Option<AttrValue> {
        let value = layer.config.get(key)?;
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(AttrValue::Number),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| v.as_f64())
                .collect::<Option<Vec<_>>>()
                .map(AttrValue::Numbers),
            _ => None,
        }
    };

    match class {
        LayerClass::Conv2D | LayerClass::DepthwiseConv2D => {
            for key in ["strides", "kernel_size", "dilation_rate"] {
                if let Some(value) = numbers(key) {
                    let key = if key == "dilation_rate" { "dilations" } else { key };
                    attrs.insert(key.to_string(), value);
                }
            }
            if let Some(padding) = config_str(layer, "padding") {
                attrs.insert("padding".to_string(), AttrValue::String(padding.to_string()));
            }
            let activation = config_str(layer, "activation").unwrap_or("linear");
            attrs.insert(
                "activation".to_string(),
                AttrValue::String(activation.to_string()),
            );
        }
        LayerClass::UpSampling2D => {
            if let Some(size) = numbers("size") {
                attrs.insert("scale".to_string(), size);
            }
            for key in ["align_corners", "half_pixel_centers"] {
                if let Some(flag) = layer.config.get(key).and_then(|v| v.as_bool()) {
                    attrs.insert(key.to_string(), AttrValue::Bool(flag));
                }
            }
        }
        _ => {}
    }

    attrs
}

/// Convenience: build a graph directly from parts, used by tests and tools.
pub fn graph_from_nodes(
    nodes: Vec<OperationNode>,
    constants: Vec<(&str, TensorValue)>,
) -> Result<Graph> {
    let constants = constants
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    finish(nodes, constants, None)
}
