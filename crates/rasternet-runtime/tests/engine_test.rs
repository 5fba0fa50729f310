//! GPU execution against the host reference.
//!
//! These tests need a GPU adapter:
//! `cargo test -p rasternet-runtime -- --ignored`

mod common;

use common::{
    assert_close, assert_matches_reference, conv_layers_model, depthwise_resize_model,
    init_tracing, int_add_graph_model, ramp, relu_graph_model, signed_graph_model,
};
use rasternet_compiler::{CompileOptions, EngineOptions, RenderTargetBreakpoint};
use rasternet_core::{DataType, Error};
use rasternet_runtime::{EngineState, Runtime, RuntimeError, Tensor};

fn iota(shape: &[usize]) -> Tensor {
    let count: usize = shape.iter().product();
    Tensor::from_vec((0..count).map(|v| v as f32).collect(), shape).unwrap()
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_conv_without_batch_dimension() {
    init_tracing();
    let runtime = Runtime::new().await.unwrap();
    let options = EngineOptions {
        has_batch_dimension: false,
        ..EngineOptions::default()
    };
    let mut engine = runtime.engine(options).unwrap();
    engine
        .compile(&conv_layers_model("linear"), &CompileOptions::default())
        .unwrap();

    let outputs = engine.run(&[("input", iota(&[1, 3, 3, 1]))]).unwrap();
    let conv = &outputs["conv"];
    assert_eq!(conv.shape(), &[3, 3, 1]);
    assert_close(
        &conv.to_vec::<f32>().unwrap(),
        &[17.0, 31.0, 25.0, 43.0, 73.0, 55.0, 41.0, 67.0, 49.0],
    );
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_relu_zeroes_negatives() {
    let runtime = Runtime::new().await.unwrap();
    let mut engine = runtime.engine(EngineOptions::default()).unwrap();
    engine
        .compile(&relu_graph_model([1, 3, 3, 1]), &CompileOptions::default())
        .unwrap();

    let input = Tensor::from_vec((-2..7).map(|v| v as f32).collect(), &[1, 3, 3, 1]).unwrap();
    let outputs = engine.run(&[("x", input)]).unwrap();
    assert_eq!(
        outputs["relu"].to_vec::<f32>().unwrap(),
        vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );
    assert_eq!(
        outputs["relu"].to_nested().unwrap(),
        serde_json::json!([[[[0.0], [0.0], [0.0]], [[1.0], [2.0], [3.0]], [[4.0], [5.0], [6.0]]]])
    );
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_int_outputs_keep_their_dtype() {
    let runtime = Runtime::new().await.unwrap();
    let mut engine = runtime.engine(EngineOptions::default()).unwrap();
    engine
        .compile(&int_add_graph_model(), &CompileOptions::default())
        .unwrap();

    let a = Tensor::from_vec(vec![1i32, -2, 3, 40], &[1, 2, 2, 1]).unwrap();
    let b = Tensor::from_vec(vec![5i32, 6, -7, 2], &[1, 2, 2, 1]).unwrap();
    let outputs = engine.run(&[("a", a), ("b", b)]).unwrap();

    let sum = &outputs["sum"];
    assert_eq!(sum.dtype(), DataType::Int32);
    assert_eq!(sum.to_vec::<i32>().unwrap(), vec![6, 4, -4, 42]);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_signed_graph_matches_reference() {
    init_tracing();
    let runtime = Runtime::new().await.unwrap();
    let mut engine = runtime.engine(EngineOptions::default()).unwrap();
    engine
        .compile(&signed_graph_model(), &CompileOptions::default())
        .unwrap();
    assert_matches_reference(&mut engine, &[("image", ramp(&[1, 2, 2, 4]))]);
    assert_eq!(engine.pipeline_count(), 3);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_depthwise_and_resize_match_reference() {
    let runtime = Runtime::new().await.unwrap();
    let mut engine = runtime.engine(EngineOptions::default()).unwrap();
    engine
        .compile(&depthwise_resize_model(), &CompileOptions::default())
        .unwrap();
    assert_matches_reference(&mut engine, &[("x", ramp(&[1, 5, 5, 3]))]);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_multiple_render_targets_match_reference() {
    let runtime = Runtime::new().await.unwrap();
    if runtime.hardware_limits().max_render_targets < 2 {
        return;
    }
    let options = EngineOptions {
        render_target_breakpoints: vec![RenderTargetBreakpoint {
            output_texture_element_count: 1,
            number_of_render_targets: 2,
        }],
        ..EngineOptions::default()
    };
    let mut engine = runtime.engine(options).unwrap();
    engine
        .compile(&relu_graph_model([1, 3, 3, 16]), &CompileOptions::default())
        .unwrap();

    let program = engine.compiled().unwrap().program("relu").unwrap();
    assert_eq!(program.attachments.render_targets, 2);
    assert_eq!(program.attachments.draws.len(), 2);
    assert_matches_reference(&mut engine, &[("x", ramp(&[1, 3, 3, 16]))]);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_sliced_textures_match_reference() {
    let runtime = Runtime::new().await.unwrap();
    let options = EngineOptions {
        canvas_width: 2,
        canvas_height: 2,
        ..EngineOptions::default()
    };
    let mut engine = runtime.engine(options).unwrap();
    engine
        .compile(&signed_graph_model(), &CompileOptions::default())
        .unwrap();
    assert_matches_reference(&mut engine, &[("image", ramp(&[1, 2, 2, 4]))]);

    engine
        .compile(&depthwise_resize_model(), &CompileOptions::default())
        .unwrap();
    let up = engine.compiled().unwrap().layout("up").unwrap();
    assert!(up.slices > 1);
    assert_matches_reference(&mut engine, &[("x", ramp(&[1, 5, 5, 3]))]);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_repeated_runs_are_identical() {
    let runtime = Runtime::new().await.unwrap();
    let mut engine = runtime.engine(EngineOptions::default()).unwrap();
    engine
        .compile(&signed_graph_model(), &CompileOptions::default())
        .unwrap();

    let first = engine.run(&[("image", ramp(&[1, 2, 2, 4]))]).unwrap();
    let other = engine.run(&[("image", iota(&[1, 2, 2, 4]))]).unwrap();
    let second = engine.run(&[("image", ramp(&[1, 2, 2, 4]))]).unwrap();
    assert_eq!(first["scores"], second["scores"]);
    assert_ne!(first["scores"], other["scores"]);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_lifecycle_errors() {
    let runtime = Runtime::new().await.unwrap();
    let mut engine = runtime.engine(EngineOptions::default()).unwrap();
    assert_eq!(engine.state(), EngineState::Uninitialized);

    let err = engine.run(&[("image", ramp(&[1, 2, 2, 4]))]).unwrap_err();
    assert!(matches!(err, RuntimeError::Engine(Error::Precondition(_))));
    assert!(matches!(
        engine.prepare(),
        Err(RuntimeError::Engine(Error::Precondition(_)))
    ));

    engine
        .compile(&signed_graph_model(), &CompileOptions::default())
        .unwrap();
    assert_eq!(engine.state(), EngineState::Compiled);
    engine.prepare().unwrap();
    assert_eq!(engine.state(), EngineState::Ready);
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_input_mismatch_keeps_engine_ready() {
    let runtime = Runtime::new().await.unwrap();
    let mut engine = runtime.engine(EngineOptions::default()).unwrap();
    engine
        .compile(&signed_graph_model(), &CompileOptions::default())
        .unwrap();

    let err = engine.run(&[("image", ramp(&[1, 3, 2, 4]))]).unwrap_err();
    assert!(matches!(err, RuntimeError::Engine(Error::InputValidation(_))));
    assert_eq!(engine.state(), EngineState::Ready);

    let err = engine.run(&[("pixels", ramp(&[1, 2, 2, 4]))]).unwrap_err();
    assert!(matches!(err, RuntimeError::Engine(Error::InputValidation(_))));

    let ints = Tensor::from_vec(vec![1i32; 16], &[1, 2, 2, 4]).unwrap();
    let err = engine.run(&[("image", ints)]).unwrap_err();
    assert!(matches!(err, RuntimeError::Engine(Error::InputValidation(_))));

    engine.run(&[("image", ramp(&[1, 2, 2, 4]))]).unwrap();
}

#[pollster::test]
#[ignore = "requires GPU"]
async fn test_breakpoints_beyond_device_rejected() {
    let runtime = Runtime::new().await.unwrap();
    let options = EngineOptions {
        render_target_breakpoints: vec![RenderTargetBreakpoint {
            output_texture_element_count: 0,
            number_of_render_targets: runtime.hardware_limits().max_render_targets + 1,
        }],
        ..EngineOptions::default()
    };
    assert!(matches!(
        runtime.engine(options),
        Err(RuntimeError::Engine(Error::ResourceLimit(_)))
    ));
}
