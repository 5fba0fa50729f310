//! Operation graph IR.

use crate::types::OpKind;
use crate::{AttrValue, Error, NamedTensorMap, Result, Signature};
use std::collections::{BTreeMap, HashMap};

/// Reference from a node to one output of another node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeInput {
    pub node: String,
    pub output_index: usize,
    pub output_name: Option<String>,
}

impl NodeInput {
    /// Reference to output 0 of `node`.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output_index: 0,
            output_name: None,
        }
    }
}

/// One operation of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationNode {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<NodeInput>,
    pub attributes: BTreeMap<String, AttrValue>,
    /// Inputs that resolve to constant weight tensors, in input order.
    pub weights: Vec<String>,
}

impl OperationNode {
    pub fn new(name: impl Into<String>, kind: OpKind) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs: Vec::new(),
            attributes: BTreeMap::new(),
            weights: Vec::new(),
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(NodeInput::new).collect();
        self
    }

    pub fn with_attr(mut self, key: &str, value: AttrValue) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }

    /// Names of the nodes this node reads, in input order.
    pub fn input_nodes(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|input| input.node.as_str())
    }
}

/// A normalized operation graph plus its constant tensors.
///
/// Nodes are kept in build order; lookups by name go through an index.
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<OperationNode>,
    index: HashMap<String, usize>,
    constants: NamedTensorMap,
    signature: Option<Signature>,
}

impl Graph {
    /// Assemble a graph, checking name uniqueness and input references.
    ///
    /// # Errors
    /// Returns `GraphBuild` for duplicate node names, inputs naming a node
    /// that does not exist, or `Const` nodes without a tensor.
    pub fn new(
        nodes: Vec<OperationNode>,
        constants: NamedTensorMap,
        signature: Option<Signature>,
    ) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if node.name.is_empty() {
                return Err(Error::GraphBuild("node with an empty name".to_string()));
            }
            if index.insert(node.name.clone(), i).is_some() {
                return Err(Error::GraphBuild(format!(
                    "node name '{}' is used more than once",
                    node.name
                )));
            }
        }

        for node in &nodes {
            for input in &node.inputs {
                if !index.contains_key(&input.node) {
                    return Err(Error::GraphBuild(format!(
                        "node '{}' references unknown input '{}'",
                        node.name, input.node
                    )));
                }
            }
            if node.kind == OpKind::Const && !constants.contains_key(&node.name) {
                return Err(Error::GraphBuild(format!(
                    "Const node '{}' has no weight tensor",
                    node.name
                )));
            }
        }

        Ok(Self {
            nodes,
            index,
            constants,
            signature,
        })
    }

    pub fn nodes(&self) -> &[OperationNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&OperationNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn constants(&self) -> &NamedTensorMap {
        &self.constants
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Placeholder nodes in build order.
    pub fn placeholders(&self) -> impl Iterator<Item = &OperationNode> {
        self.nodes.iter().filter(|n| n.kind == OpKind::Placeholder)
    }

    /// Nodes that no other node consumes, in build order.
    pub fn sinks(&self) -> Vec<&OperationNode> {
        let consumed: std::collections::HashSet<&str> =
            self.nodes.iter().flat_map(|n| n.input_nodes()).collect();
        self.nodes
            .iter()
            .filter(|n| !consumed.contains(n.name.as_str()) && !n.kind.is_data())
            .collect()
    }
}
