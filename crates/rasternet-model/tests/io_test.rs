//! Loading models through the router registry.

use rasternet_model::{
    IoHandler, MemoryHandler, ModelArtifacts, ModelDescription, ModelError, QuantizationDtype,
    RouterRegistry, TensorValue, WeightGroup, encode_weights, load_model, load_model_with,
};

fn conv_description() -> ModelDescription {
    ModelDescription::from_json(
        r#"{
            "format": "layers-model",
            "modelTopology": {"layers": [
                {"name": "input", "class_name": "InputLayer",
                 "config": {"batch_input_shape": [null, 3, 3, 1]}},
                {"name": "conv", "class_name": "Conv2D", "inbound_layers": ["input"],
                 "config": {"filters": 1, "kernel_size": [3, 3], "strides": [1, 1],
                            "padding": "same", "activation": "linear"},
                 "weights": ["conv/kernel", "conv/bias"]}
            ]}
        }"#,
    )
    .expect("description should parse")
}

fn conv_artifacts(quantize: Option<QuantizationDtype>) -> ModelArtifacts {
    let weights = vec![
        (
            "conv/kernel".to_string(),
            TensorValue::from_f32(&[3, 3, 1, 1], vec![2.0; 9]),
        ),
        ("conv/bias".to_string(), TensorValue::from_f32(&[1], vec![1.0])),
    ];
    let (weight_data, entries) = encode_weights(&weights, quantize).unwrap();

    let mut description = conv_description();
    description.weights_manifest = vec![WeightGroup {
        paths: vec!["group1-shard1of1.bin".to_string()],
        weights: entries,
    }];
    ModelArtifacts {
        description,
        weight_data,
    }
}

#[tokio::test]
async fn test_save_then_load_from_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.json");
    let url = path.to_str().unwrap().to_string();

    let registry = RouterRegistry::with_defaults();
    let artifacts = conv_artifacts(None);
    registry
        .resolve_save(&url)
        .unwrap()
        .save(&artifacts)
        .await
        .expect("save should succeed");

    assert!(dir.path().join("weights.bin").exists());

    let model = load_model(&url).await.expect("load should succeed");
    assert_eq!(model.weights.len(), 2);
    assert_eq!(model.weights["conv/kernel"].shape(), &[3, 3, 1, 1]);
    assert_eq!(model.weights["conv/bias"].as_f32().unwrap(), &[1.0]);
}

#[tokio::test]
async fn test_load_reads_shards_in_manifest_order() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = conv_artifacts(None);

    // Split the weight bytes over two shard files.
    let (first, second) = artifacts.weight_data.split_at(20);
    std::fs::write(dir.path().join("a.bin"), first).unwrap();
    std::fs::write(dir.path().join("b.bin"), second).unwrap();

    let mut description = artifacts.description.clone();
    description.weights_manifest[0].paths = vec!["a.bin".into(), "b.bin".into()];
    std::fs::write(
        dir.path().join("model.json"),
        serde_json::to_vec(&description).unwrap(),
    )
    .unwrap();

    let url = format!("file://{}", dir.path().join("model.json").display());
    let model = load_model(&url).await.unwrap();
    assert_eq!(model.weights["conv/kernel"].as_f32().unwrap(), &[2.0; 9]);
}

#[tokio::test]
async fn test_missing_shard_aborts_load() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = conv_artifacts(None);
    std::fs::write(
        dir.path().join("model.json"),
        serde_json::to_vec(&artifacts.description).unwrap(),
    )
    .unwrap();

    let err = load_model(dir.path().join("model.json").to_str().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::Io { .. }), "got {err}");
}

#[tokio::test]
async fn test_custom_memory_router() {
    let artifacts = conv_artifacts(Some(QuantizationDtype::Uint8));
    let mut registry = RouterRegistry::new();
    registry.register_load_router(Box::new(move |url: &str| {
        (url == "memory://conv")
            .then(|| Box::new(MemoryHandler::new(artifacts.clone())) as Box<dyn IoHandler>)
    }));

    let model = load_model_with(&registry, "memory://conv").await.unwrap();
    let kernel = model.weights["conv/kernel"].as_f32().unwrap();
    assert!(kernel.iter().all(|&v| (v - 2.0).abs() < 1e-6));

    let err = load_model_with(&registry, "memory://other").await.unwrap_err();
    assert!(matches!(err, ModelError::NoHandler(_)));
}

#[tokio::test]
async fn test_memory_handler_cannot_save() {
    let handler = MemoryHandler::new(conv_artifacts(None));
    let artifacts = conv_artifacts(None);
    let err = handler.save(&artifacts).await.unwrap_err();
    assert!(matches!(err, ModelError::Unsupported(_)));
}
