//! Typed op parameters read from node attributes.
//!
//! The shader compiler, shape inference and the reference evaluator all go
//! through these types, so attribute parsing lives in exactly one place.

use crate::graph::OperationNode;
use crate::{AttrValue, Error, Result, TensorValue};

/// Spatial padding mode of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Padding {
    Same,
    Valid,
}

impl Padding {
    pub fn parse(node: &str, value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "same" => Ok(Padding::Same),
            "valid" => Ok(Padding::Valid),
            other => Err(Error::GraphBuild(format!(
                "node '{node}': unsupported padding '{other}', expected 'same' or 'valid'"
            ))),
        }
    }
}

/// Activation applied to an op's output in the same pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Relu6,
}

impl Activation {
    pub fn parse(node: &str, value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "linear" | "none" => Ok(Activation::None),
            "relu" => Ok(Activation::Relu),
            "relu6" => Ok(Activation::Relu6),
            other => Err(Error::GraphBuild(format!(
                "node '{node}': unsupported activation '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Activation::None => "linear",
            Activation::Relu => "relu",
            Activation::Relu6 => "relu6",
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Relu => x.max(0.0),
            Activation::Relu6 => x.clamp(0.0, 6.0),
        }
    }
}

/// Read a required attribute.
pub fn required_attr<'a>(node: &'a OperationNode, key: &str) -> Result<&'a AttrValue> {
    node.attr(key).ok_or_else(|| {
        Error::GraphBuild(format!(
            "node '{}' ({}) is missing required attribute '{key}'",
            node.name, node.kind
        ))
    })
}

/// Parameters of a (depthwise) 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvParams {
    pub stride_h: usize,
    pub stride_w: usize,
    pub padding: Padding,
    pub activation: Activation,
}

impl ConvParams {
    /// Read `strides`, `padding`, `activation` and `dilations` from a node.
    ///
    /// Strides may be given as `[1, h, w, 1]`, `[h, w]` or a single value.
    pub fn from_node(node: &OperationNode) -> Result<Self> {
        let strides = required_attr(node, "strides")?
            .as_numbers()
            .ok_or_else(|| attr_error(node, "strides", "expected a list of numbers"))?;
        let (stride_h, stride_w) = match strides.as_slice() {
            [_, h, w, _] | [h, w] => (*h, *w),
            [s] => (*s, *s),
            _ => return Err(attr_error(node, "strides", "expected 1, 2 or 4 values")),
        };
        if stride_h < 1.0 || stride_w < 1.0 {
            return Err(attr_error(node, "strides", "strides must be positive"));
        }

        let padding = required_attr(node, "padding")?
            .as_str()
            .ok_or_else(|| attr_error(node, "padding", "expected a string"))
            .and_then(|p| Padding::parse(&node.name, p))?;

        let activation = match node.attr("activation").and_then(AttrValue::as_str) {
            Some(a) => Activation::parse(&node.name, a)?,
            None => Activation::None,
        };

        if let Some(dilations) = node.attr("dilations").and_then(AttrValue::as_numbers)
            && dilations.iter().any(|&d| d != 1.0)
        {
            return Err(Error::UnsupportedOp {
                node: node.name.clone(),
                kind: format!("{} with dilations {dilations:?}", node.kind),
            });
        }

        Ok(Self {
            stride_h: stride_h as usize,
            stride_w: stride_w as usize,
            padding,
            activation,
        })
    }
}

fn attr_error(node: &OperationNode, key: &str, reason: &str) -> Error {
    Error::GraphBuild(format!(
        "node '{}': invalid attribute '{key}': {reason}",
        node.name
    ))
}

/// Height, width and channels of an image tensor.
///
/// Accepts `[H, W, C]` or `[1, H, W, C]`.
pub fn image_dims(node: &str, shape: &[usize]) -> Result<(usize, usize, usize)> {
    match shape {
        [h, w, c] | [1, h, w, c] => Ok((*h, *w, *c)),
        [n, _, _, _] => Err(Error::Shape(format!(
            "node '{node}': batch size {n} is not supported, expected 1"
        ))),
        _ => Err(Error::Shape(format!(
            "node '{node}': expected an HWC or NHWC image, got shape {shape:?}"
        ))),
    }
}

/// Fully resolved geometry of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvGeometry {
    pub in_h: usize,
    pub in_w: usize,
    pub in_c: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub out_c: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    /// Channel multiplier of a depthwise convolution; 1 otherwise.
    pub multiplier: usize,
}

fn output_extent(
    node: &str,
    input: usize,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<(usize, usize)> {
    if input == 0 || stride == 0 {
        return Err(Error::Shape(format!(
            "node '{node}': empty spatial extent or zero stride"
        )));
    }
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let total = ((out - 1) * stride + kernel).saturating_sub(input);
            Ok((out, total / 2))
        }
        Padding::Valid => {
            if input < kernel {
                return Err(Error::Shape(format!(
                    "node '{node}': kernel extent {kernel} exceeds input extent {input} with valid padding"
                )));
            }
            Ok(((input - kernel + 1).div_ceil(stride), 0))
        }
    }
}

impl ConvGeometry {
    /// Resolve geometry from the input shape and the kernel shape.
    ///
    /// Regular kernels are `[kh, kw, in_c, out_c]`; depthwise kernels are
    /// `[kh, kw, in_c, multiplier]`.
    pub fn resolve(
        node: &str,
        params: &ConvParams,
        input_shape: &[usize],
        kernel_shape: &[usize],
        depthwise: bool,
    ) -> Result<Self> {
        let (in_h, in_w, in_c) = image_dims(node, input_shape)?;
        let [kernel_h, kernel_w, kernel_in, kernel_out] = *kernel_shape else {
            return Err(Error::Shape(format!(
                "node '{node}': expected a 4D kernel, got shape {kernel_shape:?}"
            )));
        };
        if kernel_in != in_c {
            return Err(Error::Shape(format!(
                "node '{node}': kernel expects {kernel_in} input channels, input has {in_c}"
            )));
        }

        let (out_h, pad_top) = output_extent(node, in_h, kernel_h, params.stride_h, params.padding)?;
        let (out_w, pad_left) = output_extent(node, in_w, kernel_w, params.stride_w, params.padding)?;

        let (out_c, multiplier) = if depthwise {
            (in_c * kernel_out, kernel_out)
        } else {
            (kernel_out, 1)
        };

        Ok(Self {
            in_h,
            in_w,
            in_c,
            kernel_h,
            kernel_w,
            out_h,
            out_w,
            out_c,
            stride_h: params.stride_h,
            stride_w: params.stride_w,
            pad_top,
            pad_left,
            multiplier,
        })
    }

    /// Output shape with the same rank as the input.
    pub fn output_shape(&self, input_shape: &[usize]) -> Vec<usize> {
        let mut shape = input_shape.to_vec();
        let rank = shape.len();
        shape[rank - 3] = self.out_h;
        shape[rank - 2] = self.out_w;
        shape[rank - 1] = self.out_c;
        shape
    }
}

/// Parameters of a bilinear resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResizeParams {
    pub out_h: usize,
    pub out_w: usize,
    pub align_corners: bool,
    pub half_pixel_centers: bool,
}

impl ResizeParams {
    /// Resolve the target size from the `size` attribute, a constant second
    /// input, or a `scale` factor over the input's spatial dims.
    pub fn resolve(
        node: &OperationNode,
        input_shape: &[usize],
        size_input: Option<&TensorValue>,
    ) -> Result<Self> {
        let (in_h, in_w, _) = image_dims(&node.name, input_shape)?;

        let size = if let Some(size) = node.attr("size").and_then(AttrValue::as_numbers) {
            size
        } else if let Some(value) = size_input {
            value.to_f32_vec().unwrap_or_default().into_iter().map(f64::from).collect()
        } else if let Some(scale) = node.attr("scale").and_then(AttrValue::as_numbers) {
            match scale.as_slice() {
                [sh, sw] => vec![in_h as f64 * sh, in_w as f64 * sw],
                [s] => vec![in_h as f64 * s, in_w as f64 * s],
                _ => return Err(attr_error(node, "scale", "expected 1 or 2 values")),
            }
        } else {
            return Err(Error::GraphBuild(format!(
                "node '{}' (ResizeBilinear) needs a 'size' attribute, a constant size input or a 'scale'",
                node.name
            )));
        };

        let [out_h, out_w] = size.as_slice() else {
            return Err(attr_error(node, "size", "expected [height, width]"));
        };
        if *out_h < 1.0 || *out_w < 1.0 {
            return Err(attr_error(node, "size", "target size must be positive"));
        }

        let flag = |key: &str| node.attr(key).and_then(AttrValue::as_bool).unwrap_or(false);
        Ok(Self {
            out_h: *out_h as usize,
            out_w: *out_w as usize,
            align_corners: flag("align_corners"),
            half_pixel_centers: flag("half_pixel_centers"),
        })
    }

    /// Ratio between input and output extents along one axis.
    pub fn scale(&self, input: usize, output: usize) -> f32 {
        if self.align_corners && output > 1 {
            (input as f32 - 1.0) / (output as f32 - 1.0)
        } else {
            input as f32 / output as f32
        }
    }

    /// Source coordinate for an output coordinate.
    pub fn source_coord(&self, dst: usize, scale: f32) -> f32 {
        if self.half_pixel_centers {
            (dst as f32 + 0.5) * scale - 0.5
        } else {
            dst as f32 * scale
        }
    }

    pub fn output_shape(&self, input_shape: &[usize]) -> Vec<usize> {
        let mut shape = input_shape.to_vec();
        let rank = shape.len();
        shape[rank - 3] = self.out_h;
        shape[rank - 2] = self.out_w;
        shape
    }
}
