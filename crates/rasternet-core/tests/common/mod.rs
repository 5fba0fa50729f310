//! Shared model builders for the core integration tests.

#![allow(dead_code)]

use rasternet_core::{NamedTensorMap, TensorValue};
use rasternet_model::{LoadedModel, ModelDescription};

/// Install a debug subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Build a loaded model from a description JSON string and named weights.
pub fn loaded_model(json: &str, weights: Vec<(&str, TensorValue)>) -> LoadedModel {
    let description = ModelDescription::from_json(json).expect("model JSON should parse");
    LoadedModel {
        description,
        weights: tensor_map(weights),
    }
}

pub fn tensor_map(pairs: Vec<(&str, TensorValue)>) -> NamedTensorMap {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Layers model: `InputLayer [null, 3, 3, 1]` followed by one `Conv2D` with a
/// 3×3 kernel of 2.0, bias 1.0 and same padding.
///
/// # Arguments
/// * `activation` - Keras activation name of the conv layer
pub fn conv_layers_model(activation: &str) -> LoadedModel {
    let json = format!(
        r#"{{
            "format": "layers-model",
            "modelTopology": {{"layers": [
                {{"name": "input", "class_name": "InputLayer",
                  "config": {{"batch_input_shape": [null, 3, 3, 1]}}}},
                {{"name": "conv", "class_name": "Conv2D", "inbound_layers": ["input"],
                  "config": {{"strides": [1, 1], "padding": "same", "kernel_size": [3, 3],
                             "activation": "{activation}"}},
                  "weights": ["conv/kernel", "conv/bias"]}}
            ]}}
        }}"#
    );
    loaded_model(
        &json,
        vec![
            ("conv/kernel", TensorValue::from_f32(&[3, 3, 1, 1], vec![2.0; 9])),
            ("conv/bias", TensorValue::from_f32(&[1], vec![1.0])),
        ],
    )
}

/// Graph model computing `relu(x * w + b)` through an identity output node,
/// with a signature mapping `image` → `x` and `scores` → `out`.
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

/// `0, 1, ..., n-1` as a float tensor of the given shape.
pub fn iota(shape: &[usize]) -> TensorValue {
    let count: usize = shape.iter().product();
    TensorValue::from_f32(shape, (0..count).map(|v| v as f32).collect())
}
