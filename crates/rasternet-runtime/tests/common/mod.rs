//! Shared models and helpers for the GPU integration tests.

#![allow(dead_code)]

use rasternet_core::reference::evaluate;
use rasternet_core::{NamedTensorMap, TensorValue};
use rasternet_model::{LoadedModel, ModelDescription};
use rasternet_runtime::{Engine, Tensor};

/// Absolute tolerance between GPU output and the host reference.
pub const TOLERANCE: f32 = 0.1;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn loaded_model(json: &str, weights: Vec<(&str, TensorValue)>) -> LoadedModel {
    let description = ModelDescription::from_json(json).expect("model JSON should parse");
    LoadedModel {
        description,
        weights: weights
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    }
}

/// `InputLayer [null, 3, 3, 1]` followed by a `Conv2D` with a 3×3 kernel of
/// 2.0, bias 1.0 and same padding.
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

/// A single `Relu` over a `[1, h, w, c]` placeholder named `x`.
pub fn relu_graph_model(shape: [usize; 4]) -> LoadedModel {
    let json = format!(
        r#"{{
            "format": "graph-model",
            "modelTopology": {{"node": [
                {{"name": "x", "op": "Placeholder", "attr": {{"shape": {shape:?}}}}},
                {{"name": "relu", "op": "Relu", "input": ["x"]}}
            ]}}
        }}"#
    );
    loaded_model(&json, Vec::new())
}

/// `relu(x * w + b)` behind an identity output, with a signature mapping
/// `image` → `x` and `scores` → `out`.
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

/// `a + b` over two int32 placeholders of shape `[1, 2, 2, 1]`.
pub fn int_add_graph_model() -> LoadedModel {
    let json = r#"{
        "format": "graph-model",
        "modelTopology": {"node": [
            {"name": "a", "op": "Placeholder", "attr": {"shape": [1, 2, 2, 1], "dtype": "int32"}},
            {"name": "b", "op": "Placeholder", "attr": {"shape": [1, 2, 2, 1], "dtype": "int32"}},
            {"name": "sum", "op": "AddV2", "input": ["a", "b"]}
        ]}
    }"#;
    loaded_model(json, Vec::new())
}

/// Strided depthwise conv (multiplier 2, relu6) followed by a bilinear
/// upsample with half-pixel centers.
pub fn depthwise_resize_model() -> LoadedModel {
    let json = r#"{
        "format": "graph-model",
        "modelTopology": {"node": [
            {"name": "x", "op": "Placeholder", "attr": {"shape": [1, 5, 5, 3]}},
            {"name": "k", "op": "Const"},
            {"name": "b", "op": "Const"},
            {"name": "size", "op": "Const"},
            {"name": "dw", "op": "FusedDepthwiseConv2dNative", "input": ["x", "k", "b"],
             "attr": {"strides": [1, 2, 2, 1], "padding": "SAME",
                      "fused_ops": ["BiasAdd", "Relu6"]}},
            {"name": "up", "op": "ResizeBilinear", "input": ["dw", "size"],
             "attr": {"align_corners": false, "half_pixel_centers": true}}
        ]}
    }"#;
    let kernel: Vec<f32> = (0..3 * 3 * 3 * 2).map(|i| ((i % 7) as f32 - 3.0) * 0.25).collect();
    let size = TensorValue::new("size", vec![2], rasternet_core::TensorData::I32(vec![6, 6]))
        .expect("size tensor should be valid");
    loaded_model(
        json,
        vec![
            ("k", TensorValue::from_f32(&[3, 3, 3, 2], kernel)),
            ("b", TensorValue::from_f32(&[6], vec![0.5, -0.5, 1.0, 0.0, 0.25, -1.0])),
            ("size", size),
        ],
    )
}

/// Deterministic values in `[-2, 2)`.
pub fn ramp(shape: &[usize]) -> Tensor {
    let count: usize = shape.iter().product();
    let values = (0..count).map(|i| ((i * 37 % 101) as f32 / 25.0) - 2.0).collect();
    Tensor::from_vec(values, shape).expect("ramp fills its shape")
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() < TOLERANCE,
            "index {i}: got {a}, expected {e}"
        );
    }
}

/// Run `inputs` on the GPU and on the host reference, and compare every
/// output.
pub fn assert_matches_reference(engine: &mut Engine, inputs: &[(&str, Tensor)]) {
    let gpu = engine.run(inputs).expect("GPU run should succeed");

    let compiled = engine.compiled().expect("engine should be compiled");
    let provided: NamedTensorMap = inputs
        .iter()
        .map(|(name, tensor)| (name.to_string(), tensor.to_value(name).unwrap()))
        .collect();
    let lookup = compiled.schedule().bind_inputs(&provided).unwrap();
    let reference = evaluate(compiled.schedule(), &lookup).unwrap();

    assert_eq!(gpu.len(), reference.len());
    for (name, expected) in &reference {
        let actual = &gpu[name];
        assert_eq!(actual.shape(), expected.shape(), "shape of '{name}'");
        assert_close(&actual.to_vec::<f32>().unwrap(), expected.as_f32().unwrap());
    }
}
