//! Model description records and weight decoding for rasternet.
//!
//! This crate is the boundary between serialized models and the rest of the
//! workspace. It provides:
//! - Serde records for graph models and layers models (`ModelDescription`)
//! - The weights manifest and the little-endian weight codec, including
//!   affine `uint8`/`uint16` and `float16` quantization
//! - Typed tensor values (`TensorValue`) produced by the decoder
//! - An explicitly constructed `RouterRegistry` of IO handlers and the async
//!   `load_model` entry point
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> rasternet_model::Result<()> {
//! let model = rasternet_model::load_model("models/mobilenet/model.json").await?;
//! println!("{} weights decoded", model.weights.len());
//! # Ok(())
//! # }
//! ```

pub mod io;
pub mod record;
pub mod tensor;
pub mod weights;

pub use io::{
    FileSystemHandler, IoHandler, LoadFuture, LoadRouter, LoadedModel, MemoryHandler,
    ModelArtifacts, RouterRegistry, SaveFuture, SaveRouter, load_model, load_model_with,
};
pub use record::{
    AttrValue, GraphNodeDef, GraphTopology, LayerDef, LayersTopology, ModelDescription,
    ModelFormat, ModelTopology, Signature, TensorSpec,
};
pub use tensor::{DataType, NamedTensorMap, TensorData, TensorDescriptor, TensorValue};
pub use weights::{
    Quantization, QuantizationDtype, WeightEntry, WeightGroup, decode_weights, encode_weights,
};

use std::path::PathBuf;

/// Result type for model loading and weight decoding.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while reading model descriptions or decoding weights.
///
/// Every decoding error aborts the model load; nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed model JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid model description: {0}")]
    InvalidModel(String),

    #[error("Unsupported dtype '{dtype}' for weight '{name}'")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("Invalid quantization for weight '{name}': {reason}")]
    Quantization { name: String, reason: String },

    #[error("Weight '{name}' needs {needed} bytes but only {available} remain in the buffer")]
    TruncatedWeights {
        name: String,
        needed: usize,
        available: usize,
    },

    #[error("Tensor '{name}' has {actual} values but shape {shape:?} needs {expected}")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("No IO handler registered for '{0}'")]
    NoHandler(String),

    #[error("{count} IO handlers matched '{url}', expected exactly one")]
    AmbiguousHandler { url: String, count: usize },

    #[error("Operation not supported by this handler: {0}")]
    Unsupported(String),
}
