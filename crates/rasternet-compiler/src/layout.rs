//! Texture layout of tensors.
//!
//! A tensor of shape `[..., C]` is stored in an `Rgba32Float` 2D array
//! texture. The last dimension is split into channel groups of four lanes,
//! one group per array layer; the leading dimensions are flattened into
//! `spatial` positions laid out row-major over a `width × height` grid. When
//! the grid cannot hold every spatial position, the range is split into
//! slices, each with its own run of `layers_per_slice` layers:
//!
//! ```text
//! layer = slice * layers_per_slice + channel_group
//! texel = (local % width, local / width)      local = spatial % (width * height)
//! lane  = channel % 4
//! ```

use crate::options::{LayoutLimits, LayoutOptions};
use crate::{Error, Result};
use rasternet_core::{DataType, TensorDescriptor};

/// One full-screen pass writing `render_targets` consecutive layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawCall {
    pub slice: usize,
    /// First channel group written by this draw.
    pub group_offset: usize,
}

/// Placement of one tensor in texture memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GpuResourceLayout {
    pub shape: Vec<usize>,
    pub element_count: usize,
    pub channels: usize,
    pub padded_channels: usize,
    pub spatial: usize,
    pub channel_groups: usize,
    pub width: usize,
    pub height: usize,
    pub slices: usize,
    pub layers_per_slice: usize,
    pub layers: usize,
    pub render_targets: usize,
}

impl GpuResourceLayout {
    /// Compute the layout of a tensor.
    ///
    /// # Errors
    /// Returns `ResourceLimit` for string tensors and for tensors that need
    /// more array layers than the device provides.
    pub fn compute(
        name: &str,
        desc: &TensorDescriptor,
        limits: &LayoutLimits,
        options: &LayoutOptions,
    ) -> Result<Self> {
        if desc.dtype == DataType::String {
            return Err(Error::ResourceLimit(format!(
                "tensor '{name}' holds strings, which cannot be stored in textures"
            )));
        }

        let (channels, spatial) = match desc.shape.split_last() {
            Some((&c, leading)) => (c, leading.iter().product::<usize>()),
            None => (1, 1),
        };
        if channels == 0 || spatial == 0 {
            return Err(Error::ResourceLimit(format!(
                "tensor '{name}' with shape {:?} is empty",
                desc.shape
            )));
        }

        let channel_groups = channels.div_ceil(4);
        let padded_channels = if options.pad_channels {
            channel_groups * 4
        } else {
            channels
        };

        let width = ceil_sqrt(spatial).clamp(1, limits.max_width);
        let height = spatial.div_ceil(width).clamp(1, limits.max_height);
        let slices = spatial.div_ceil(width * height);

        let padded_element_count = spatial * padded_channels;
        let requested = options.render_targets_for(padded_element_count);
        let render_targets = requested.min(channel_groups).max(1);
        if render_targets < requested {
            tracing::warn!(
                tensor = name,
                requested,
                channel_groups,
                "render targets clamped to the number of channel groups"
            );
        }

        let layers_per_slice = channel_groups.div_ceil(render_targets) * render_targets;
        let layers = slices * layers_per_slice;
        if layers > limits.max_layers {
            return Err(Error::ResourceLimit(format!(
                "tensor '{name}' with shape {:?} needs {layers} texture layers ({slices} slices × {layers_per_slice}), the device supports {}",
                desc.shape, limits.max_layers
            )));
        }

        let layout = Self {
            shape: desc.shape.clone(),
            element_count: desc.element_count(),
            channels,
            padded_channels,
            spatial,
            channel_groups,
            width,
            height,
            slices,
            layers_per_slice,
            layers,
            render_targets,
        };
        tracing::debug!(
            tensor = name,
            width,
            height,
            layers,
            render_targets,
            "computed layout"
        );
        Ok(layout)
    }

    pub fn texels_per_layer(&self) -> usize {
        self.width * self.height
    }

    /// Number of floats in the texture, padded lanes included.
    pub fn texel_capacity(&self) -> usize {
        self.texels_per_layer() * 4 * self.layers
    }

    pub fn padded_element_count(&self) -> usize {
        self.spatial * self.padded_channels
    }

    pub fn layer(&self, slice: usize, group: usize) -> usize {
        slice * self.layers_per_slice + group
    }

    /// Offset in the packed buffer of element `(spatial, channel)`.
    fn packed_offset(&self, s: usize, c: usize) -> usize {
        let per_layer = self.texels_per_layer();
        let layer = self.layer(s / per_layer, c / 4);
        (layer * per_layer + s % per_layer) * 4 + c % 4
    }

    /// Pack row-major values into the per-layer texel buffer.
    ///
    /// The result holds `texel_capacity()` floats, layer after layer; padded
    /// lanes and unused texels are zero.
    ///
    /// # Errors
    /// Returns `InputValidation` if `values` does not hold `element_count`
    /// values.
    pub fn pack(&self, values: &[f32]) -> Result<Vec<f32>> {
        if values.len() != self.element_count {
            return Err(Error::InputValidation(format!(
                "cannot pack {} values into a layout for shape {:?} ({} elements)",
                values.len(),
                self.shape,
                self.element_count
            )));
        }
        let mut packed = vec![0.0; self.texel_capacity()];
        for (i, &value) in values.iter().enumerate() {
            packed[self.packed_offset(i / self.channels, i % self.channels)] = value;
        }
        Ok(packed)
    }

    /// Recover the row-major values from a packed texel buffer.
    ///
    /// # Errors
    /// Returns `GpuExecution` if `packed` is shorter than `texel_capacity()`.
    pub fn unpad(&self, packed: &[f32]) -> Result<Vec<f32>> {
        if packed.len() < self.texel_capacity() {
            return Err(Error::GpuExecution(format!(
                "readback of {} floats is too short for shape {:?}, expected {}",
                packed.len(),
                self.shape,
                self.texel_capacity()
            )));
        }
        Ok((0..self.element_count)
            .map(|i| packed[self.packed_offset(i / self.channels, i % self.channels)])
            .collect())
    }

    /// Draws needed to write every layer, grouped `render_targets` at a time.
    pub fn draw_calls(&self) -> Vec<DrawCall> {
        (0..self.slices)
            .flat_map(|slice| {
                (0..self.layers_per_slice)
                    .step_by(self.render_targets)
                    .map(move |group_offset| DrawCall {
                        slice,
                        group_offset,
                    })
            })
            .collect()
    }
}

fn ceil_sqrt(n: usize) -> usize {
    let root = n.isqrt();
    if root * root == n { root } else { root + 1 }
}
