//! End-to-end compilation of small models.

mod common;

use common::{
    init_tracing, open_shape_graph_model, resize_graph_model, signed_graph_model,
    unsupported_graph_model,
};
use rasternet_compiler::{
    BindingSource, CompileOptions, EngineOptions, Error, HardwareLimits, RenderTargetBreakpoint,
    compile, compile_graph,
};
use rasternet_core::{OpKind, OperationNode, TensorValue, graph_from_nodes};
use std::collections::HashMap;

#[test]
fn test_compile_signed_graph_model() {
    init_tracing();
    let compiled = compile(
        &signed_graph_model(),
        &EngineOptions::default(),
        &HardwareLimits::default(),
        &CompileOptions::default(),
    )
    .unwrap();

    let kinds: Vec<&OpKind> = compiled.programs().iter().map(|p| &p.kind).collect();
    assert_eq!(kinds, [&OpKind::Mul, &OpKind::Add, &OpKind::Relu]);
    assert_eq!(compiled.unique_shaders(), 3);

    let mul = compiled.program("mul").unwrap();
    assert_eq!(mul.bindings[1].source, BindingSource::Node("x".into()));
    assert_eq!(mul.bindings[2].source, BindingSource::Weight("w".into()));
    assert!(mul.source().contains("fn index_rhs"));

    let mut weights: Vec<&str> = compiled.weights().map(|(name, _, _)| name).collect();
    weights.sort_unstable();
    assert_eq!(weights, ["b", "w"]);

    let out = compiled.layout("relu").unwrap();
    assert_eq!(out.shape, vec![1, 2, 2, 4]);
    assert_eq!((out.width, out.height, out.layers), (2, 2, 1));
    assert_eq!(compiled.schedule().outputs()[0].name, "scores");
}

#[test]
fn test_requested_internal_output() {
    let options = CompileOptions {
        outputs: vec!["mul".to_string()],
        ..CompileOptions::default()
    };
    let compiled = compile(
        &signed_graph_model(),
        &EngineOptions::default(),
        &HardwareLimits::default(),
        &options,
    )
    .unwrap();
    assert_eq!(compiled.programs().len(), 1);
    assert!(compiled.layout("b").is_none());
}

#[test]
fn test_identical_nodes_share_one_shader() {
    let nodes = vec![
        OperationNode::new("x", OpKind::Placeholder).with_attr(
            "shape",
            rasternet_core::AttrValue::Numbers(vec![1.0, 4.0, 4.0, 3.0]),
        ),
        OperationNode::new("r1", OpKind::Relu).with_inputs(["x"]),
        OperationNode::new("r2", OpKind::Relu).with_inputs(["r1"]),
        OperationNode::new("r3", OpKind::Relu).with_inputs(["r2"]),
    ];
    let graph = graph_from_nodes(nodes, Vec::<(&str, TensorValue)>::new()).unwrap();
    let compiled = compile_graph(
        &graph,
        &EngineOptions::default(),
        &HardwareLimits::default(),
        &CompileOptions::default(),
    )
    .unwrap();
    assert_eq!(compiled.programs().len(), 3);
    assert_eq!(compiled.unique_shaders(), 1);
}

#[test]
fn test_resize_size_operand_is_not_a_texture() {
    let compiled = compile(
        &resize_graph_model(),
        &EngineOptions::default(),
        &HardwareLimits::default(),
        &CompileOptions::default(),
    )
    .unwrap();
    let up = compiled.program("up").unwrap();
    assert_eq!(up.texture_bindings().count(), 1);
    assert_eq!(compiled.layout("up").unwrap().shape, vec![1, 4, 4, 3]);
    assert!(compiled.layout("size").is_none());
    assert_eq!(compiled.weights().count(), 0);
}

#[test]
fn test_unsupported_op_fails() {
    let err = compile(
        &unsupported_graph_model(),
        &EngineOptions::default(),
        &HardwareLimits::default(),
        &CompileOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnsupportedOp { ref kind, .. } if kind == "MatMul"));
}

#[test]
fn test_breakpoint_beyond_device_fails() {
    let options = EngineOptions {
        render_target_breakpoints: vec![RenderTargetBreakpoint {
            output_texture_element_count: 0,
            number_of_render_targets: 4,
        }],
        ..EngineOptions::default()
    };
    let err = compile(
        &signed_graph_model(),
        &options,
        &HardwareLimits::default(),
        &CompileOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::ResourceLimit(_)));
}

#[test]
fn test_breakpoints_batch_render_targets() {
    let options = EngineOptions::from_json(
        r#"{"render_target_breakpoints": [
            {"output_texture_element_count": 0, "number_of_render_targets": 2}
        ]}"#,
    )
    .unwrap();
    let compile_options = CompileOptions {
        input_shapes: HashMap::from([("x".to_string(), vec![1, 3, 8])]),
        ..CompileOptions::default()
    };
    let compiled = compile(
        &open_shape_graph_model(),
        &options,
        &HardwareLimits::default(),
        &compile_options,
    )
    .unwrap();
    let relu = compiled.program("relu").unwrap();
    assert_eq!(relu.attachments.render_targets, 2);
    assert_eq!(relu.attachments.draws.len(), 1);
    assert!(relu.source().contains("@location(1) out1"));
}

#[test]
fn test_unknown_dimension_needs_input_shape() {
    let err = compile(
        &open_shape_graph_model(),
        &EngineOptions::default(),
        &HardwareLimits::default(),
        &CompileOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::GraphBuild(ref msg) if msg.contains("unknown")));
}

#[test]
fn test_tensor_beyond_texture_limits_fails() {
    let limits = HardwareLimits {
        max_texture_dimension: 2,
        max_array_layers: 1,
        max_render_targets: 2,
    };
    let compile_options = CompileOptions {
        input_shapes: HashMap::from([("x".to_string(), vec![1, 64, 8])]),
        ..CompileOptions::default()
    };
    let err = compile(
        &open_shape_graph_model(),
        &EngineOptions::default(),
        &limits,
        &compile_options,
    )
    .unwrap_err();
    assert!(matches!(err, Error::ResourceLimit(_)));
}
