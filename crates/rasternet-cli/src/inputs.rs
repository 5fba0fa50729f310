//! Parsing of `name=value` arguments and construction of input tensors.

use anyhow::{Context, Result, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rasternet_compiler::CompiledGraph;
use rasternet_core::{DataType, NamedTensorMap};
use rasternet_runtime::Tensor;
use std::path::Path;

fn split_arg(arg: &str) -> Result<(&str, &str)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() && !value.is_empty() => Ok((name, value)),
        _ => bail!("Invalid argument '{arg}', expected name=value"),
    }
}

/// Parse `name=1,224,224,3`.
pub fn parse_shape_arg(arg: &str) -> Result<(String, Vec<usize>)> {
    let (name, dims) = split_arg(arg)?;
    let shape = dims
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid dimension '{d}' in '{arg}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((name.to_string(), shape))
}

/// Read `name=file.json`, where the file holds a nested JSON array.
pub async fn load_input_arg(arg: &str) -> Result<(String, Tensor)> {
    let (name, path) = split_arg(arg)?;
    let path = Path::new(path);
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read input '{name}' from {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Input file {} is not valid JSON", path.display()))?;
    let tensor = Tensor::from_nested(&value)
        .with_context(|| format!("Input file {} is not a rectangular array", path.display()))?;
    Ok((name.to_string(), tensor))
}

/// Random tensors for every compiled input not already in `provided`.
///
/// Floats are uniform in `[-1, 1)`, ints in `[0, 10)`. The leading batch
/// dimension is restored when the graph was compiled without one.
pub fn random_inputs(
    compiled: &CompiledGraph,
    provided: &[(String, Tensor)],
    seed: u64,
) -> Result<Vec<(String, Tensor)>> {
    let schedule = compiled.schedule();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut generated = Vec::new();

    for spec in schedule.inputs() {
        if provided
            .iter()
            .any(|(name, _)| *name == spec.name || *name == spec.node)
        {
            continue;
        }
        let mut shape = spec.shape.clone();
        if !schedule.mode().has_batch_dimension {
            shape.insert(0, 1);
        }
        let count: usize = shape.iter().product();
        let tensor = match spec.dtype {
            DataType::Float32 => Tensor::from_vec(
                (0..count).map(|_| rng.random_range(-1.0f32..1.0)).collect(),
                &shape,
            )?,
            DataType::Int32 => {
                Tensor::from_vec((0..count).map(|_| rng.random_range(0i32..10)).collect(), &shape)?
            }
            other => bail!(
                "Cannot generate random values for input '{}' of dtype {other}",
                spec.name
            ),
        };
        tracing::info!(input = %spec.name, shape = ?shape, "generated random input");
        generated.push((spec.name.clone(), tensor));
    }

    Ok(generated)
}

/// Host tensors keyed by input name, for the reference evaluator.
pub fn to_value_map(feeds: &[(String, Tensor)]) -> Result<NamedTensorMap> {
    let mut values = NamedTensorMap::new();
    for (name, tensor) in feeds {
        values.insert(name.clone(), tensor.to_value(name)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shape_arg() {
        let (name, shape) = parse_shape_arg("image=1,224,224,3").unwrap();
        assert_eq!(name, "image");
        assert_eq!(shape, vec![1, 224, 224, 3]);
    }

    #[test]
    fn test_parse_shape_arg_rejects_garbage() {
        assert!(parse_shape_arg("image").is_err());
        assert!(parse_shape_arg("=1,2").is_err());
        assert!(parse_shape_arg("image=1,x").is_err());
    }

    #[tokio::test]
    async fn test_load_input_arg_reads_nested_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        tokio::fs::write(&path, "[[1.0, 2.0], [3.0, 4.0]]").await.unwrap();

        let (name, tensor) = load_input_arg(&format!("x={}", path.display())).await.unwrap();
        assert_eq!(name, "x");
        assert_eq!(tensor.shape(), &[2, 2]);
        assert_eq!(tensor.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_load_input_arg_missing_file() {
        let err = load_input_arg("x=/nonexistent/rasternet.json").await.unwrap_err();
        assert!(err.to_string().contains("Failed to read input 'x'"));
    }
}
