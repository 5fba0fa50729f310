//! Shared models for the compiler integration tests.

#![allow(dead_code)]

use rasternet_core::{NamedTensorMap, TensorData, TensorValue};
use rasternet_model::{LoadedModel, ModelDescription};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn loaded_model(json: &str, weights: Vec<(&str, TensorValue)>) -> LoadedModel {
    let description = ModelDescription::from_json(json).expect("model JSON should parse");
    let weights: NamedTensorMap = weights
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    LoadedModel {
        description,
        weights,
    }
}

/// Graph model computing `relu(x * w + b)` behind an identity output, with a
/// signature mapping `image` → `x` and `scores` → `out`.
pub fn signed_graph_model() -> LoadedModel {
    let json = r#"{
        "format": "graph-model",
        "modelTopology": {"node": [
            {"name": "x", "op": "Placeholder", "attr": {"shape": [-1, 2, 2, 4]}},
            {"name": "w", "op": "Const"},
            {"name": "b", "op": "Const"},
            {"name": "mul", "op": "Mul", "input": ["x", "w"]},
            {"name": "add", "op": "AddV2", "input": ["mul:0", "b"]},
            {"name": "relu", "op": "Relu", "input": ["add"]},
            {"name": "out", "op": "Identity", "input": ["relu"]}
        ]},
        "signature": {
            "inputs": {"image": {"name": "x:0", "dtype": "float32", "shape": [-1, 2, 2, 4]}},
            "outputs": {"scores": {"name": "out:0", "dtype": "float32"}}
        }
    }"#;
    loaded_model(
        json,
        vec![
            ("w", TensorValue::from_f32(&[4], vec![1.0, -1.0, 2.0, 0.5])),
            ("b", TensorValue::from_f32(&[4], vec![0.0, 1.0, -3.0, 0.25])),
        ],
    )
}

/// Graph model upsampling a `[1, 2, 2, 3]` image to 4×4 with a constant
/// size operand.
pub fn resize_graph_model() -> LoadedModel {
    let json = r#"{
        "format": "graph-model",
        "modelTopology": {"node": [
            {"name": "image", "op": "Placeholder", "attr": {"shape": [1, 2, 2, 3]}},
            {"name": "size", "op": "Const"},
            {"name": "up", "op": "ResizeBilinear", "input": ["image", "size"],
             "attr": {"align_corners": false, "half_pixel_centers": true}}
        ]}
    }"#;
    let size = TensorValue::new("size", vec![2], TensorData::I32(vec![4, 4]))
        .expect("size tensor should be valid");
    loaded_model(json, vec![("size", size)])
}

/// Graph model with an op no program exists for.
pub fn unsupported_graph_model() -> LoadedModel {
    let json = r#"{
        "format": "graph-model",
        "modelTopology": {"node": [
            {"name": "a", "op": "Placeholder", "attr": {"shape": [2, 2]}},
            {"name": "mm", "op": "MatMul", "input": ["a", "a"]}
        ]}
    }"#;
    loaded_model(json, Vec::new())
}

/// Graph model whose input has an unknown spatial dimension.
pub fn open_shape_graph_model() -> LoadedModel {
    let json = r#"{
        "format": "graph-model",
        "modelTopology": {"node": [
            {"name": "x", "op": "Placeholder", "attr": {"shape": [-1, -1, 8]}},
            {"name": "relu", "op": "Relu", "input": ["x"]}
        ]}
    }"#;
    loaded_model(json, Vec::new())
}
