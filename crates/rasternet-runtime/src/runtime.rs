//! Runtime initialization and GPU device management.

use crate::engine::Engine;
use crate::error::{Result, RuntimeError};
use rasternet_compiler::{EngineOptions, HardwareLimits};
use std::sync::{Arc, Mutex};

/// Bytes per sample of one `Rgba32Float` color attachment.
const RGBA32_FLOAT_BYTES: u32 = 16;

/// First uncaptured device error, shared with the device's error handler.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceErrors {
    first: Arc<Mutex<Option<String>>>,
}

impl DeviceErrors {
    fn record(&self, error: wgpu::Error) {
        if let Ok(mut first) = self.first.lock() {
            first.get_or_insert_with(|| error.to_string());
        }
    }

    /// Take the recorded error, if any.
    pub fn take(&self) -> Option<String> {
        self.first.lock().ok().and_then(|mut first| first.take())
    }
}

/// Main entry point for GPU execution.
///
/// Owns the device and queue and the limits derived from the adapter.
///
/// # Example
/// ```no_run
/// # use rasternet_runtime::Runtime;
/// #[pollster::main]
/// async fn main() -> anyhow::Result<()> {
///     let runtime = Runtime::new().await?;
///     println!("{:?}", runtime.hardware_limits());
///     Ok(())
/// }
/// ```
pub struct Runtime {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    adapter_info: wgpu::AdapterInfo,
    limits: HardwareLimits,
    errors: DeviceErrors,
}

impl Runtime {
    /// Initialize the runtime with the default GPU adapter.
    ///
    /// # Errors
    /// Returns `InitError` if no suitable GPU is found or initialization fails.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| RuntimeError::InitError(format!("no suitable GPU adapter: {e}")))?;

        Self::with_adapter(&adapter).await
    }

    /// Initialize the runtime with a specific GPU adapter.
    ///
    /// The device is requested with the adapter's full limits, so more color
    /// attachments and larger textures are available than wgpu's defaults.
    ///
    /// # Errors
    /// Returns `InitError` if device creation fails.
    pub async fn with_adapter(adapter: &wgpu::Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();
        let device_limits = adapter.limits();

        let device_desc = wgpu::DeviceDescriptor {
            label: Some("rasternet"),
            required_limits: device_limits.clone(),
            ..Default::default()
        };
        let (device, queue) = adapter
            .request_device(&device_desc)
            .await
            .map_err(|e| RuntimeError::InitError(format!("failed to create device: {e}")))?;

        let errors = DeviceErrors::default();
        let handler_errors = errors.clone();
        device.on_uncaptured_error(Arc::new(move |error| handler_errors.record(error)));

        let limits = hardware_limits(&device_limits);
        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            max_texture_dimension = limits.max_texture_dimension,
            max_array_layers = limits.max_array_layers,
            max_render_targets = limits.max_render_targets,
            "GPU runtime initialized"
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_info,
            limits,
            errors,
        })
    }

    /// Create an engine on this runtime's device.
    ///
    /// # Errors
    /// Returns `ResourceLimit` if `options` exceed the device limits.
    pub fn engine(&self, options: EngineOptions) -> Result<Engine> {
        Engine::new(self, options)
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn hardware_limits(&self) -> HardwareLimits {
        self.limits
    }

    pub(crate) fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub(crate) fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    pub(crate) fn errors(&self) -> &DeviceErrors {
        &self.errors
    }
}

/// Layout-relevant limits of a device.
///
/// Every render target is `Rgba32Float`, so the usable count is bounded by
/// both the attachment count and the bytes-per-sample budget.
pub fn hardware_limits(limits: &wgpu::Limits) -> HardwareLimits {
    let by_bytes = limits.max_color_attachment_bytes_per_sample / RGBA32_FLOAT_BYTES;
    HardwareLimits {
        max_texture_dimension: limits.max_texture_dimension_2d as usize,
        max_array_layers: limits.max_texture_array_layers as usize,
        max_render_targets: limits.max_color_attachments.min(by_bytes).max(1) as usize,
    }
}
