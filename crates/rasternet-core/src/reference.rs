//! CPU reference evaluator.
//!
//! Evaluates a [`Schedule`] on the host with the same semantics as the
//! generated shaders. Used as a correctness oracle by tests and by the CLI
//! `verify` command.

use crate::graph::OperationNode;
use crate::params::{ConvGeometry, ConvParams, ResizeParams, image_dims};
use crate::scheduler::{Schedule, TensorLookup};
use crate::shape::broadcast_shape;
use crate::types::OpKind;
use crate::{Error, NamedTensorMap, Result, TensorValue};
use std::collections::HashMap;

/// Host tensor used during evaluation.
#[derive(Debug, Clone)]
struct HostTensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl HostTensor {
    fn from_value(name: &str, value: &TensorValue) -> Result<Self> {
        let values = value.to_f32_vec().ok_or_else(|| {
            Error::InputValidation(format!("tensor '{name}' is not numeric"))
        })?;
        Ok(Self {
            shape: value.shape().to_vec(),
            values,
        })
    }
}

/// Evaluate every scheduled op and return the requested outputs, keyed by
/// output name.
///
/// # Errors
/// Propagates shape and parameter errors of the scheduled nodes, and
/// `InputValidation` for non-numeric tensors.
#[tracing::instrument(skip_all, fields(num_nodes = schedule.nodes().len()))]
pub fn evaluate(schedule: &Schedule, lookup: &TensorLookup<'_>) -> Result<NamedTensorMap> {
    let mut values: HashMap<&str, HostTensor> = HashMap::new();

    for node in schedule.nodes() {
        let tensor = match node.kind {
            OpKind::Placeholder | OpKind::Const => {
                let value = lookup.get(&node.name).ok_or_else(|| {
                    Error::InputValidation(format!("no value bound for '{}'", node.name))
                })?;
                HostTensor::from_value(&node.name, value)?
            }
            _ => {
                let inputs = node
                    .input_nodes()
                    .map(|name| {
                        values.get(name).ok_or_else(|| {
                            Error::GraphBuild(format!(
                                "node '{}' evaluated before its input '{name}'",
                                node.name
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                evaluate_node(node, &inputs, lookup)?
            }
        };
        values.insert(node.name.as_str(), tensor);
    }

    schedule
        .outputs()
        .iter()
        .map(|output| {
            let tensor = values.get(output.node.as_str()).ok_or_else(|| {
                Error::GraphBuild(format!("output node '{}' was not evaluated", output.node))
            })?;
            let value = TensorValue::from_f32(&tensor.shape, tensor.values.clone());
            Ok((output.name.clone(), value))
        })
        .collect()
}

fn evaluate_node(
    node: &OperationNode,
    inputs: &[&HostTensor],
    lookup: &TensorLookup<'_>,
) -> Result<HostTensor> {
    match &node.kind {
        OpKind::Add => elementwise(node, inputs, |a, b| a + b),
        OpKind::Mul => elementwise(node, inputs, |a, b| a * b),
        OpKind::Relu => Ok(HostTensor {
            shape: inputs[0].shape.clone(),
            values: inputs[0].values.iter().map(|&x| x.max(0.0)).collect(),
        }),
        kind if kind.is_convolution() => conv2d(node, inputs, kind.is_depthwise()),
        OpKind::ResizeBilinear => {
            let size = node
                .inputs
                .get(1)
                .and_then(|input| lookup.get(&input.node));
            resize_bilinear(node, inputs[0], size)
        }
        _ => Err(Error::UnsupportedOp {
            node: node.name.clone(),
            kind: node.kind.to_string(),
        }),
    }
}

fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Flat index into `shape` for an output coordinate, with broadcasting.
fn broadcast_index(coord: &[usize], shape: &[usize], shape_strides: &[usize]) -> usize {
    let offset = coord.len() - shape.len();
    shape
        .iter()
        .zip(shape_strides)
        .enumerate()
        .map(|(i, (&dim, &stride))| if dim == 1 { 0 } else { coord[offset + i] * stride })
        .sum()
}

fn elementwise(
    node: &OperationNode,
    inputs: &[&HostTensor],
    op: impl Fn(f32, f32) -> f32,
) -> Result<HostTensor> {
    let [a, b] = inputs else {
        return Err(Error::GraphBuild(format!(
            "node '{}' expects 2 inputs, got {}",
            node.name,
            inputs.len()
        )));
    };
    let shape = broadcast_shape(&a.shape, &b.shape)?;
    let out_strides = strides(&shape);
    let (a_strides, b_strides) = (strides(&a.shape), strides(&b.shape));
    let count: usize = shape.iter().product();

    let mut coord = vec![0; shape.len()];
    let values = (0..count)
        .map(|flat| {
            let mut rem = flat;
            for (c, s) in coord.iter_mut().zip(&out_strides) {
                *c = rem / s;
                rem %= s;
            }
            op(
                a.values[broadcast_index(&coord, &a.shape, &a_strides)],
                b.values[broadcast_index(&coord, &b.shape, &b_strides)],
            )
        })
        .collect();

    Ok(HostTensor { shape, values })
}

fn conv2d(node: &OperationNode, inputs: &[&HostTensor], depthwise: bool) -> Result<HostTensor> {
    let params = ConvParams::from_node(node)?;
    let (input, kernel) = (inputs[0], inputs[1]);
    let bias = inputs.get(2);
    let g = ConvGeometry::resolve(&node.name, &params, &input.shape, &kernel.shape, depthwise)?;

    let mut values = Vec::with_capacity(g.out_h * g.out_w * g.out_c);
    for oy in 0..g.out_h {
        for ox in 0..g.out_w {
            for co in 0..g.out_c {
                let mut acc = bias.map_or(0.0, |b| b.values[co]);
                for ky in 0..g.kernel_h {
                    let Some(iy) = (oy * g.stride_h + ky).checked_sub(g.pad_top) else {
                        continue;
                    };
                    if iy >= g.in_h {
                        continue;
                    }
                    for kx in 0..g.kernel_w {
                        let Some(ix) = (ox * g.stride_w + kx).checked_sub(g.pad_left) else {
                            continue;
                        };
                        if ix >= g.in_w {
                            continue;
                        }
                        let pixel = (iy * g.in_w + ix) * g.in_c;
                        let tap = ky * g.kernel_w + kx;
                        if depthwise {
                            let ci = co / g.multiplier;
                            acc += input.values[pixel + ci] * kernel.values[tap * g.out_c + co];
                        } else {
                            for ci in 0..g.in_c {
                                acc += input.values[pixel + ci]
                                    * kernel.values[(tap * g.in_c + ci) * g.out_c + co];
                            }
                        }
                    }
                }
                values.push(params.activation.apply(acc));
            }
        }
    }

    Ok(HostTensor {
        shape: g.output_shape(&input.shape),
        values,
    })
}

fn resize_bilinear(
    node: &OperationNode,
    input: &HostTensor,
    size: Option<&TensorValue>,
) -> Result<HostTensor> {
    let params = ResizeParams::resolve(node, &input.shape, size)?;
    let (in_h, in_w, c) = image_dims(&node.name, &input.shape)?;
    let scale_h = params.scale(in_h, params.out_h);
    let scale_w = params.scale(in_w, params.out_w);

    // (top, bottom, frac) per output coordinate along one axis.
    let taps = |dst: usize, scale: f32, extent: usize| {
        let src = params.source_coord(dst, scale);
        let floor = src.floor();
        let lo = (floor.max(0.0) as usize).min(extent - 1);
        let hi = (src.ceil().max(0.0) as usize).min(extent - 1);
        (lo, hi, src - floor)
    };

    let mut values = Vec::with_capacity(params.out_h * params.out_w * c);
    for oy in 0..params.out_h {
        let (top, bottom, fy) = taps(oy, scale_h, in_h);
        for ox in 0..params.out_w {
            let (left, right, fx) = taps(ox, scale_w, in_w);
            for ch in 0..c {
                let at = |y: usize, x: usize| input.values[(y * in_w + x) * c + ch];
                let upper = at(top, left) + (at(top, right) - at(top, left)) * fx;
                let lower = at(bottom, left) + (at(bottom, right) - at(bottom, left)) * fx;
                values.push(upper + (lower - upper) * fy);
            }
        }
    }

    Ok(HostTensor {
        shape: params.output_shape(&input.shape),
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::graph_from_nodes;
    use crate::scheduler::{ExecutionMode, Scheduler};
    use crate::{AttrValue, Graph};

    fn run(graph: &Graph, output: &str, inputs: Vec<(&str, TensorValue)>) -> TensorValue {
        let inputs: NamedTensorMap = inputs.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        let schedule = Scheduler::new(graph, ExecutionMode::default())
            .schedule(&[output], Some(&inputs))
            .unwrap();
        let lookup = schedule.bind_inputs(&inputs).unwrap();
        evaluate(&schedule, &lookup).unwrap().remove(output).unwrap()
    }

    fn image_placeholder(name: &str) -> OperationNode {
        OperationNode::new(name, OpKind::Placeholder)
            .with_attr("shape", AttrValue::Numbers(vec![3.0, 3.0, 1.0]))
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-4, "index {i}: {a} vs {e}");
        }
    }

    #[test]
    fn test_conv_same_padding_with_bias() {
        let graph = graph_from_nodes(
            vec![
                image_placeholder("x"),
                OperationNode::new("k", OpKind::Const),
                OperationNode::new("b", OpKind::Const),
                OperationNode::new("conv", OpKind::FusedConv2D)
                    .with_inputs(["x", "k", "b"])
                    .with_attr("strides", AttrValue::Numbers(vec![1.0, 1.0, 1.0, 1.0]))
                    .with_attr("padding", AttrValue::String("SAME".into())),
            ],
            vec![
                ("k", TensorValue::from_f32(&[3, 3, 1, 1], vec![2.0; 9])),
                ("b", TensorValue::from_f32(&[1], vec![1.0])),
            ],
        )
        .unwrap();
        let x = TensorValue::from_f32(&[3, 3, 1], (0..9).map(|v| v as f32).collect());
        let out = run(&graph, "conv", vec![("x", x)]);
        assert_eq!(out.shape(), &[3, 3, 1]);
        assert_close(
            out.as_f32().unwrap(),
            &[17.0, 31.0, 25.0, 43.0, 73.0, 55.0, 41.0, 67.0, 49.0],
        );
    }

    #[test]
    fn test_relu() {
        let graph = graph_from_nodes(
            vec![
                image_placeholder("x"),
                OperationNode::new("relu", OpKind::Relu).with_inputs(["x"]),
            ],
            vec![],
        )
        .unwrap();
        let x = TensorValue::from_f32(&[3, 3, 1], (-2..7).map(|v| v as f32).collect());
        let out = run(&graph, "relu", vec![("x", x)]);
        assert_close(
            out.as_f32().unwrap(),
            &[0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        );
    }

    #[test]
    fn test_add_broadcasts_channel_vector() {
        let graph = graph_from_nodes(
            vec![
                OperationNode::new("x", OpKind::Placeholder)
                    .with_attr("shape", AttrValue::Numbers(vec![2.0, 2.0])),
                OperationNode::new("c", OpKind::Const),
                OperationNode::new("add", OpKind::Add).with_inputs(["x", "c"]),
            ],
            vec![("c", TensorValue::from_f32(&[2], vec![10.0, 20.0]))],
        )
        .unwrap();
        let x = TensorValue::from_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let out = run(&graph, "add", vec![("x", x)]);
        assert_close(out.as_f32().unwrap(), &[11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_depthwise_multiplier() {
        let graph = graph_from_nodes(
            vec![
                OperationNode::new("x", OpKind::Placeholder)
                    .with_attr("shape", AttrValue::Numbers(vec![1.0, 1.0, 2.0])),
                OperationNode::new("k", OpKind::Const),
                OperationNode::new("dw", OpKind::DepthwiseConv2D)
                    .with_inputs(["x", "k"])
                    .with_attr("strides", AttrValue::Numbers(vec![1.0, 1.0]))
                    .with_attr("padding", AttrValue::String("VALID".into())),
            ],
            vec![("k", TensorValue::from_f32(&[1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]))],
        )
        .unwrap();
        let x = TensorValue::from_f32(&[1, 1, 2], vec![5.0, 7.0]);
        let out = run(&graph, "dw", vec![("x", x)]);
        assert_eq!(out.shape(), &[1, 1, 4]);
        assert_close(out.as_f32().unwrap(), &[5.0, 10.0, 21.0, 28.0]);
    }

    #[test]
    fn test_resize_align_corners() {
        let graph = graph_from_nodes(
            vec![
                OperationNode::new("x", OpKind::Placeholder)
                    .with_attr("shape", AttrValue::Numbers(vec![1.0, 2.0, 1.0])),
                OperationNode::new("up", OpKind::ResizeBilinear)
                    .with_inputs(["x"])
                    .with_attr("size", AttrValue::Numbers(vec![1.0, 3.0]))
                    .with_attr("align_corners", AttrValue::Bool(true)),
            ],
            vec![],
        )
        .unwrap();
        let x = TensorValue::from_f32(&[1, 2, 1], vec![0.0, 4.0]);
        let out = run(&graph, "up", vec![("x", x)]);
        assert_eq!(out.shape(), &[1, 3, 1]);
        assert_close(out.as_f32().unwrap(), &[0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_resize_half_pixel_clamps_edges() {
        let graph = graph_from_nodes(
            vec![
                OperationNode::new("x", OpKind::Placeholder)
                    .with_attr("shape", AttrValue::Numbers(vec![1.0, 2.0, 1.0])),
                OperationNode::new("up", OpKind::ResizeBilinear)
                    .with_inputs(["x"])
                    .with_attr("size", AttrValue::Numbers(vec![1.0, 4.0]))
                    .with_attr("half_pixel_centers", AttrValue::Bool(true)),
            ],
            vec![],
        )
        .unwrap();
        let x = TensorValue::from_f32(&[1, 2, 1], vec![0.0, 4.0]);
        let out = run(&graph, "up", vec![("x", x)]);
        // Source coords: -0.25, 0.25, 0.75, 1.25.
        assert_close(out.as_f32().unwrap(), &[0.0, 1.0, 3.0, 4.0]);
    }
}
