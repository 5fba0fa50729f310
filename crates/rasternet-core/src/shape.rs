//! Static shape inference for the supported op kinds.

use crate::graph::OperationNode;
use crate::params::{ConvGeometry, ConvParams, ResizeParams};
use crate::types::OpKind;
use crate::{Error, Result, TensorDescriptor, TensorValue};
use std::ops::RangeInclusive;

/// Compute NumPy-style broadcast output shape from two input shapes.
///
/// Shapes are aligned from the rightmost dimension; dimensions match if they
/// are equal or one of them is 1; missing leading dimensions count as 1.
///
/// # Example
///
/// ```text
/// broadcast_shape(&[3, 3, 4], &[4])       -> [3, 3, 4]
/// broadcast_shape(&[1, 3, 3, 1], &[3, 1]) -> [1, 3, 3, 1]
/// ```
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |shape: &[usize], i: usize| {
        let offset = rank - shape.len();
        if i < offset { 1 } else { shape[i - offset] }
    };

    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (da, db) if da == db => Ok(da),
            (1, db) => Ok(db),
            (da, 1) => Ok(da),
            (da, db) => Err(Error::Shape(format!(
                "cannot broadcast shapes {a:?} and {b:?}: dimension {i} is {da} vs {db}"
            ))),
        })
        .collect()
}

fn expect_inputs(
    node: &OperationNode,
    inputs: &[&TensorDescriptor],
    range: RangeInclusive<usize>,
) -> Result<()> {
    if range.contains(&inputs.len()) {
        Ok(())
    } else {
        Err(Error::GraphBuild(format!(
            "node '{}' ({}) expects {}..={} inputs, got {}",
            node.name,
            node.kind,
            range.start(),
            range.end(),
            inputs.len()
        )))
    }
}

/// Infer the output descriptor of an op node.
///
/// `constant_input` returns the constant tensor behind input `i`, if any; it
/// is used by ops whose output shape depends on a constant operand.
///
/// # Errors
/// Returns `UnsupportedOp` for kinds without a program, `GraphBuild` for a
/// wrong number of inputs and `Shape` for incompatible shapes.
pub fn infer_output(
    node: &OperationNode,
    inputs: &[&TensorDescriptor],
    constant_input: impl Fn(usize) -> Option<TensorValue>,
) -> Result<TensorDescriptor> {
    match &node.kind {
        OpKind::Add | OpKind::Mul => {
            expect_inputs(node, inputs, 2..=2)?;
            let shape = broadcast_shape(&inputs[0].shape, &inputs[1].shape)
                .map_err(|e| Error::Shape(format!("node '{}': {e}", node.name)))?;
            Ok(TensorDescriptor::new(shape, inputs[0].dtype))
        }
        OpKind::Relu | OpKind::Identity => {
            expect_inputs(node, inputs, 1..=1)?;
            Ok(inputs[0].clone())
        }
        kind if kind.is_convolution() => {
            let min_inputs = if kind.is_fused() { 3 } else { 2 };
            expect_inputs(node, inputs, min_inputs..=3)?;
            let params = ConvParams::from_node(node)?;
            let geometry = ConvGeometry::resolve(
                &node.name,
                &params,
                &inputs[0].shape,
                &inputs[1].shape,
                kind.is_depthwise(),
            )?;
            if let Some(bias) = inputs.get(2)
                && bias.element_count() != geometry.out_c
            {
                return Err(Error::Shape(format!(
                    "node '{}': bias has {} values, expected {}",
                    node.name,
                    bias.element_count(),
                    geometry.out_c
                )));
            }
            Ok(TensorDescriptor::new(
                geometry.output_shape(&inputs[0].shape),
                inputs[0].dtype,
            ))
        }
        OpKind::ResizeBilinear => {
            expect_inputs(node, inputs, 1..=2)?;
            let size = if inputs.len() == 2 { constant_input(1) } else { None };
            let params = ResizeParams::resolve(node, &inputs[0].shape, size.as_ref())?;
            Ok(TensorDescriptor::new(
                params.output_shape(&inputs[0].shape),
                inputs[0].dtype,
            ))
        }
        OpKind::Placeholder | OpKind::Const => Err(Error::GraphBuild(format!(
            "node '{}' ({}) carries data; its shape is declared, not inferred",
            node.name, node.kind
        ))),
        _ => Err(Error::UnsupportedOp {
            node: node.name.clone(),
            kind: node.kind.to_string(),
        }),
    }
}
