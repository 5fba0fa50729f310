//! Per-op program templates.
//!
//! Each op kind resolves its typed parameters once (`ProgramParams`) and
//! emits the body of `compute(s, g)`: the value of channel group `g` at
//! spatial position `s` of the output.

use super::wgsl::WgslWriter;
use crate::layout::GpuResourceLayout;
use crate::{Error, Result};
use rasternet_core::{
    Activation, ConvGeometry, ConvParams, OpKind, OperationNode, ResizeParams, TensorValue,
    image_dims,
};
use std::fmt::Write;

/// Resolved parameters a program is generated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramParams {
    Elementwise,
    Relu,
    Conv {
        geometry: ConvGeometry,
        activation: Activation,
        depthwise: bool,
        has_bias: bool,
    },
    Resize {
        params: ResizeParams,
        in_h: usize,
        in_w: usize,
    },
}

impl ProgramParams {
    /// Resolve parameters for `node` given its bound input layouts.
    ///
    /// `size_input` is the constant size operand of a resize, if any.
    ///
    /// # Errors
    /// Returns `UnsupportedOp` for kinds without a program.
    pub fn resolve(
        node: &OperationNode,
        inputs: &[&GpuResourceLayout],
        size_input: Option<&TensorValue>,
    ) -> Result<Self> {
        match &node.kind {
            OpKind::Add | OpKind::Mul => Ok(ProgramParams::Elementwise),
            OpKind::Relu => Ok(ProgramParams::Relu),
            kind if kind.is_convolution() => {
                let params = ConvParams::from_node(node)?;
                let geometry = ConvGeometry::resolve(
                    &node.name,
                    &params,
                    &inputs[0].shape,
                    &inputs[1].shape,
                    kind.is_depthwise(),
                )?;
                Ok(ProgramParams::Conv {
                    geometry,
                    activation: params.activation,
                    depthwise: kind.is_depthwise(),
                    has_bias: inputs.len() > 2,
                })
            }
            OpKind::ResizeBilinear => {
                let params = ResizeParams::resolve(node, &inputs[0].shape, size_input)?;
                let (in_h, in_w, _) = image_dims(&node.name, &inputs[0].shape)?;
                Ok(ProgramParams::Resize {
                    params,
                    in_h,
                    in_w,
                })
            }
            _ => Err(Error::UnsupportedOp {
                node: node.name.clone(),
                kind: node.kind.to_string(),
            }),
        }
    }

    /// Binding role of each texture input, in binding order.
    pub fn roles(&self) -> &'static [&'static str] {
        match self {
            ProgramParams::Elementwise => &["lhs", "rhs"],
            ProgramParams::Relu | ProgramParams::Resize { .. } => &["input"],
            ProgramParams::Conv { has_bias: true, .. } => &["input", "kernel", "bias"],
            ProgramParams::Conv { .. } => &["input", "kernel"],
        }
    }

    /// Emit op constants and return the `compute` body.
    pub(crate) fn emit(
        &self,
        writer: &mut WgslWriter,
        kind: &OpKind,
        inputs: &[&GpuResourceLayout],
        output: &GpuResourceLayout,
    ) -> String {
        match self {
            ProgramParams::Elementwise => {
                let op = if *kind == OpKind::Mul { "*" } else { "+" };
                elementwise_body(writer, op, inputs, output)
            }
            ProgramParams::Relu => {
                "    return max(load_input(s, g), vec4<f32>(0.0));\n".to_string()
            }
            ProgramParams::Conv {
                geometry,
                activation,
                depthwise,
                has_bias,
            } => conv_body(writer, geometry, *activation, *depthwise, *has_bias),
            ProgramParams::Resize {
                params,
                in_h,
                in_w,
            } => resize_body(writer, params, *in_h, *in_w),
        }
    }
}

fn activate(activation: Activation, value: &str) -> String {
    match activation {
        Activation::None => value.to_string(),
        Activation::Relu => format!("max({value}, vec4<f32>(0.0))"),
        Activation::Relu6 => format!("clamp({value}, vec4<f32>(0.0), vec4<f32>(6.0))"),
    }
}

// ── Elementwise ─────────────────────────────────────────────────────

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Emit `index_{role}(s, c) -> vec2<u32>`, mapping an output element to the
/// broadcast source element `(spatial, channel)` of an input.
fn broadcast_index_fn(writer: &mut WgslWriter, role: &str, input: &[usize], output: &[usize]) {
    let out_strides = row_major_strides(output);
    let in_strides = row_major_strides(input);
    let offset = output.len() - input.len();

    let mut body = String::new();
    let _ = writeln!(body, "fn index_{role}(s: u32, c: u32) -> vec2<u32> {{");
    let _ = writeln!(body, "    var rem = s * OUT_CHANNELS + c;");
    let _ = writeln!(body, "    var j = 0u;");
    for (dim, &out_stride) in out_strides.iter().enumerate() {
        let in_stride = dim
            .checked_sub(offset)
            .filter(|&d| input[d] != 1)
            .map_or(0, |d| in_strides[d]);
        if in_stride != 0 {
            let _ = writeln!(body, "    j += (rem / {out_stride}u) * {in_stride}u;");
        }
        let _ = writeln!(body, "    rem = rem % {out_stride}u;");
    }
    let channels = input.last().copied().unwrap_or(1);
    let _ = writeln!(body, "    return vec2<u32>(j / {channels}u, j % {channels}u);");
    body.push_str("}\n");
    writer.raw(&body);
}

fn elementwise_body(
    writer: &mut WgslWriter,
    op: &str,
    inputs: &[&GpuResourceLayout],
    output: &GpuResourceLayout,
) -> String {
    let (lhs, rhs) = (inputs[0], inputs[1]);
    if lhs.shape == output.shape && rhs.shape == output.shape {
        return format!("    return load_lhs(s, g) {op} load_rhs(s, g);\n");
    }

    broadcast_index_fn(writer, "lhs", &lhs.shape, &output.shape);
    broadcast_index_fn(writer, "rhs", &rhs.shape, &output.shape);
    format!(
        r#"    var result = vec4<f32>(0.0);
    for (var lane = 0u; lane < 4u; lane++) {{
        let c = g * 4u + lane;
        if c < OUT_CHANNELS {{
            let a = index_lhs(s, c);
            let b = index_rhs(s, c);
            result[lane] = load_lhs_channel(a.x, a.y) {op} load_rhs_channel(b.x, b.y);
        }}
    }}
    return result;
"#
    )
}

// ── Convolution ─────────────────────────────────────────────────────

fn conv_body(
    writer: &mut WgslWriter,
    g: &ConvGeometry,
    activation: Activation,
    depthwise: bool,
    has_bias: bool,
) -> String {
    writer.const_u32("IN_H", g.in_h);
    writer.const_u32("IN_W", g.in_w);
    writer.const_u32("IN_C", g.in_c);
    writer.const_u32("KERNEL_H", g.kernel_h);
    writer.const_u32("KERNEL_W", g.kernel_w);
    writer.const_u32("OUT_X", g.out_w);
    writer.const_u32("STRIDE_H", g.stride_h);
    writer.const_u32("STRIDE_W", g.stride_w);
    writer.const_i32("PAD_TOP", g.pad_top as i64);
    writer.const_i32("PAD_LEFT", g.pad_left as i64);
    writer.const_u32("MULTIPLIER", g.multiplier);

    let accumulate = if depthwise {
        r#"            for (var lane = 0u; lane < 4u; lane++) {
                let co = g * 4u + lane;
                if co < OUT_CHANNELS {
                    let ci = co / MULTIPLIER;
                    acc[lane] += load_input_channel(pixel, ci)
                        * load_kernel_channel(tap * IN_C + ci, co % MULTIPLIER);
                }
            }"#
    } else {
        r#"            for (var gi = 0u; gi < INPUT_GROUPS; gi++) {
                let x = load_input(pixel, gi);
                for (var lane = 0u; lane < 4u; lane++) {
                    let ci = gi * 4u + lane;
                    if ci < IN_C {
                        acc += x[lane] * load_kernel(tap * IN_C + ci, g);
                    }
                }
            }"#
    };

    let init = if has_bias {
        "load_bias(0u, g)"
    } else {
        "vec4<f32>(0.0)"
    };

    format!(
        r#"    let oy = s / OUT_X;
    let ox = s % OUT_X;
    var acc = {init};
    for (var ky = 0u; ky < KERNEL_H; ky++) {{
        let iy = i32(oy * STRIDE_H + ky) - PAD_TOP;
        if iy < 0 || iy >= i32(IN_H) {{
            continue;
        }}
        for (var kx = 0u; kx < KERNEL_W; kx++) {{
            let ix = i32(ox * STRIDE_W + kx) - PAD_LEFT;
            if ix < 0 || ix >= i32(IN_W) {{
                continue;
            }}
            let pixel = u32(iy) * IN_W + u32(ix);
            let tap = ky * KERNEL_W + kx;
{accumulate}
        }}
    }}
    return {};
"#,
        activate(activation, "acc")
    )
}

// ── Resize ──────────────────────────────────────────────────────────

fn resize_body(writer: &mut WgslWriter, p: &ResizeParams, in_h: usize, in_w: usize) -> String {
    writer.const_u32("IN_H", in_h);
    writer.const_u32("IN_W", in_w);
    writer.const_u32("OUT_X", p.out_w);
    writer.const_f32("SCALE_H", p.scale(in_h, p.out_h));
    writer.const_f32("SCALE_W", p.scale(in_w, p.out_w));
    writer.const_f32("PIXEL_OFFSET", if p.half_pixel_centers { 0.5 } else { 0.0 });
    writer.raw(
        r#"
fn source_coord(dst: u32, scale: f32) -> f32 {
    return (f32(dst) + PIXEL_OFFSET) * scale - PIXEL_OFFSET;
}

fn clamp_index(v: f32, extent: u32) -> u32 {
    return u32(clamp(v, 0.0, f32(extent - 1u)));
}
"#,
    );

    r#"    let oy = s / OUT_X;
    let ox = s % OUT_X;
    let sy = source_coord(oy, SCALE_H);
    let sx = source_coord(ox, SCALE_W);
    let top = clamp_index(floor(sy), IN_H);
    let bottom = clamp_index(ceil(sy), IN_H);
    let left = clamp_index(floor(sx), IN_W);
    let right = clamp_index(ceil(sx), IN_W);
    let dy = sy - floor(sy);
    let dx = sx - floor(sx);
    let tl = load_input(top * IN_W + left, g);
    let tr = load_input(top * IN_W + right, g);
    let bl = load_input(bottom * IN_W + left, g);
    let br = load_input(bottom * IN_W + right, g);
    let upper = tl + (tr - tl) * dx;
    let lower = bl + (br - bl) * dx;
    return upper + (lower - upper) * dy;
"#
    .to_string()
}
