//! Operation graph IR, graph building and scheduling for rasternet.
//!
//! This crate provides the host-side half of the compiler:
//! - The operation graph IR (`Graph`, `OperationNode`, `OpKind`)
//! - `GraphBuilder`, which normalizes graph models and layers models
//! - Node-name parsing with an explicit `NodeNameCache`
//! - `Scheduler`, which orders the dependency closure of the requested
//!   outputs, validates runtime inputs and elides identity nodes
//! - Static shape inference and typed op parameters
//! - A CPU reference evaluator used as a correctness oracle

pub mod builder;
pub mod graph;
pub mod name;
pub mod params;
pub mod reference;
pub mod scheduler;
pub mod shape;
pub mod types;

pub use builder::{GraphBuilder, graph_from_nodes, weight_node_name};
pub use graph::{Graph, NodeInput, OperationNode};
pub use name::{NodeNameCache, ParsedName, parse_node_name};
pub use params::{Activation, ConvGeometry, ConvParams, Padding, ResizeParams, image_dims};
pub use scheduler::{ExecutionMode, InputSpec, ResolvedOutput, Schedule, Scheduler, TensorLookup};
pub use shape::{broadcast_shape, infer_output};
pub use types::{LayerClass, OpKind};

pub use rasternet_model::{
    AttrValue, DataType, ModelError, NamedTensorMap, Signature, TensorData, TensorDescriptor,
    TensorSpec, TensorValue,
};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the compiler and the runtime.
///
/// Messages name the offending node or tensor and, where it applies, the
/// expected and actual values. Nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The model description is malformed or incomplete.
    #[error("Graph build error: {0}")]
    GraphBuild(String),

    /// Runtime inputs or requested outputs disagree with the graph.
    #[error("Input validation error: {0}")]
    InputValidation(String),

    /// The op kind has no raster program.
    #[error("Unsupported operation '{kind}' at node '{node}'")]
    UnsupportedOp { node: String, kind: String },

    /// A layout or configuration exceeds what the device supports.
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// An operation was invoked before its required setup step.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A draw, upload or readback failed on the device.
    #[error("GPU execution error: {0}")]
    GpuExecution(String),

    /// Generated shader source failed validation.
    #[error("Shader compilation error: {0}")]
    ShaderCompilation(String),

    /// Shapes cannot be combined by an op.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Model loading or weight decoding failed.
    #[error(transparent)]
    Model(#[from] ModelError),
}
