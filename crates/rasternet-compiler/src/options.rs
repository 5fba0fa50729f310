//! Engine configuration.
//!
//! `EngineOptions` is deserialized from JSON (field names in snake_case) or
//! built from defaults, and validated against the device's
//! [`HardwareLimits`] before anything is compiled.

use crate::{Error, Result};
use rasternet_core::ExecutionMode;
use serde::{Deserialize, Serialize};

/// Device limits that bound texture layouts and draw batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareLimits {
    pub max_texture_dimension: usize,
    pub max_array_layers: usize,
    /// Color attachments usable at once with an `Rgba32Float` format.
    pub max_render_targets: usize,
}

impl Default for HardwareLimits {
    /// wgpu's default limits: 8192 texels, 256 layers, and 32 color
    /// attachment bytes per sample (two 16-byte `Rgba32Float` targets).
    fn default() -> Self {
        Self {
            max_texture_dimension: 8192,
            max_array_layers: 256,
            max_render_targets: 2,
        }
    }
}

/// Bounds used by the layout engine, derived from options and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutLimits {
    pub max_width: usize,
    pub max_height: usize,
    pub max_layers: usize,
}

/// Chooses a render-target count by output size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderTargetBreakpoint {
    /// Padded element count at which this breakpoint applies.
    pub output_texture_element_count: usize,
    pub number_of_render_targets: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transformations {
    /// Report channels rounded up to a multiple of 4. See
    /// [`LayoutOptions::pad_channels`].
    pub pad_channels: bool,
}

impl Default for Transformations {
    fn default() -> Self {
        Self { pad_channels: true }
    }
}

/// Options controlling texture layout and draw batching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutOptions {
    /// Count channels rounded up to a multiple of 4 in `padded_channels`
    /// and in the element count that selects render-target breakpoints.
    ///
    /// Texel storage does not change: channels always occupy
    /// `ceil(C / 4)` groups of four lanes and unused lanes are zero, so
    /// width, height and layers are the same either way.
    pub pad_channels: bool,
    pub breakpoints: Vec<RenderTargetBreakpoint>,
}

impl LayoutOptions {
    /// Reject breakpoints the hardware cannot honor.
    ///
    /// # Errors
    /// Returns `ResourceLimit` if a breakpoint asks for zero render targets or
    /// more than `limits.max_render_targets`.
    pub fn validate(&self, limits: &HardwareLimits) -> Result<()> {
        for bp in &self.breakpoints {
            if bp.number_of_render_targets == 0 {
                return Err(Error::ResourceLimit(format!(
                    "render target breakpoint at {} elements asks for zero render targets",
                    bp.output_texture_element_count
                )));
            }
            if bp.number_of_render_targets > limits.max_render_targets {
                return Err(Error::ResourceLimit(format!(
                    "render target breakpoint at {} elements asks for {} render targets, the device supports {}",
                    bp.output_texture_element_count,
                    bp.number_of_render_targets,
                    limits.max_render_targets
                )));
            }
        }
        Ok(())
    }

    /// Render targets for an output of `padded_element_count` elements.
    ///
    /// Breakpoints are scanned in order; each one whose threshold is met
    /// overrides the previous choice. Defaults to 1.
    pub fn render_targets_for(&self, padded_element_count: usize) -> usize {
        self.breakpoints
            .iter()
            .rev()
            .find(|bp| padded_element_count >= bp.output_texture_element_count)
            .map_or(1, |bp| bp.number_of_render_targets)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub canvas_width: usize,
    pub canvas_height: usize,
    /// Largest texture dimension to use; clamped to the device limit.
    pub viewport_max_size: usize,
    pub has_batch_dimension: bool,
    pub transformations: Transformations,
    pub render_target_breakpoints: Vec<RenderTargetBreakpoint>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            canvas_width: 2048,
            canvas_height: 2048,
            viewport_max_size: 4096,
            has_batch_dimension: true,
            transformations: Transformations::default(),
            render_target_breakpoints: Vec::new(),
        }
    }
}

impl EngineOptions {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::GraphBuild(format!("invalid engine options: {e}")))
    }

    /// Check the options against the device.
    ///
    /// # Errors
    /// Returns `ResourceLimit` for zero-sized canvases and for breakpoints
    /// the device cannot honor.
    pub fn validate(&self, limits: &HardwareLimits) -> Result<()> {
        if self.canvas_width == 0 || self.canvas_height == 0 || self.viewport_max_size == 0 {
            return Err(Error::ResourceLimit(format!(
                "canvas {}x{} with viewport max size {} leaves no room for textures",
                self.canvas_width, self.canvas_height, self.viewport_max_size
            )));
        }
        self.layout_options().validate(limits)
    }

    pub fn layout_options(&self) -> LayoutOptions {
        LayoutOptions {
            pad_channels: self.transformations.pad_channels,
            breakpoints: self.render_target_breakpoints.clone(),
        }
    }

    pub fn layout_limits(&self, limits: &HardwareLimits) -> LayoutLimits {
        let max_size = self.viewport_max_size.min(limits.max_texture_dimension);
        LayoutLimits {
            max_width: self.canvas_width.min(max_size),
            max_height: self.canvas_height.min(max_size),
            max_layers: limits.max_array_layers,
        }
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode {
            has_batch_dimension: self.has_batch_dimension,
        }
    }
}
