//! Texture allocation, upload and readback.

use crate::error::{Result, RuntimeError};
use rasternet_compiler::GpuResourceLayout;
use std::collections::HashMap;
use std::sync::Arc;

/// Every tensor texture stores four `f32` channels per texel.
pub(crate) const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;

const TEXEL_BYTES: usize = 16;

/// A tensor stored as a 2D array texture.
#[derive(Debug)]
pub(crate) struct GpuTexture {
    pub texture: wgpu::Texture,
    /// View over every layer, for sampling.
    pub view: wgpu::TextureView,
    pub layout: GpuResourceLayout,
}

impl GpuTexture {
    fn new(device: &wgpu::Device, name: &str, layout: &GpuResourceLayout) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("Tensor: {name}")),
            size: extent(layout),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TEXTURE_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&format!("Tensor view: {name}")),
            dimension: Some(wgpu::TextureViewDimension::D2Array),
            ..Default::default()
        });
        Self {
            texture,
            view,
            layout: layout.clone(),
        }
    }

    /// Single-layer view, for use as a color attachment.
    pub fn layer_view(&self, layer: usize) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some("Tensor layer"),
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_array_layer: layer as u32,
            array_layer_count: Some(1),
            ..Default::default()
        })
    }
}

fn extent(layout: &GpuResourceLayout) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: layout.width as u32,
        height: layout.height as u32,
        depth_or_array_layers: layout.layers as u32,
    }
}

/// Row pitch of a readback copy, aligned as buffer copies require.
fn padded_bytes_per_row(width: usize) -> usize {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
    (width * TEXEL_BYTES).div_ceil(align) * align
}

/// Size of the readback buffer needed for `layout`.
pub(crate) fn readback_size(layout: &GpuResourceLayout) -> u64 {
    (padded_bytes_per_row(layout.width) * layout.height * layout.layers) as u64
}

/// Owns the textures of one engine, keyed by node name.
pub(crate) struct TextureManager {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    textures: HashMap<String, GpuTexture>,
}

impl TextureManager {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        Self {
            device,
            queue,
            textures: HashMap::new(),
        }
    }

    /// Allocate the texture for `name` unless it already exists.
    pub fn allocate(&mut self, name: &str, layout: &GpuResourceLayout) {
        if self.textures.contains_key(name) {
            return;
        }
        tracing::debug!(
            name,
            width = layout.width,
            height = layout.height,
            layers = layout.layers,
            "allocating texture"
        );
        self.textures
            .insert(name.to_string(), GpuTexture::new(&self.device, name, layout));
    }

    /// Pack `values` into the texture's layout and write every layer.
    ///
    /// # Errors
    /// Returns `InputValidation` if the value count disagrees with the
    /// layout, `GpuExecution` if the texture does not exist.
    pub fn upload(&self, name: &str, values: &[f32]) -> Result<()> {
        let gpu_texture = self.get(name)?;
        let layout = &gpu_texture.layout;
        let packed = layout.pack(values)?;

        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &gpu_texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&packed),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some((layout.width * TEXEL_BYTES) as u32),
                rows_per_image: Some(layout.height as u32),
            },
            extent(layout),
        );
        Ok(())
    }

    /// Read a texture back through `readback` and unpad it to the tensor's
    /// flat values. Layers are copied one by one into consecutive regions.
    ///
    /// # Errors
    /// Returns `GpuExecution` if the buffer is too small, mapping fails or
    /// the device reports an error.
    pub fn download(&self, name: &str, readback: &wgpu::Buffer) -> Result<Vec<f32>> {
        let gpu_texture = self.get(name)?;
        let layout = &gpu_texture.layout;
        let row_pitch = padded_bytes_per_row(layout.width);
        let layer_bytes = row_pitch * layout.height;
        let size = readback_size(layout);
        if size > readback.size() {
            return Err(RuntimeError::gpu(format!(
                "readback buffer of {} bytes cannot hold '{name}' ({size} bytes)",
                readback.size()
            )));
        }

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback encoder"),
            });
        for layer in 0..layout.layers {
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture: &gpu_texture.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: layer as u32,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: readback,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: (layer * layer_bytes) as u64,
                        bytes_per_row: Some(row_pitch as u32),
                        rows_per_image: Some(layout.height as u32),
                    },
                },
                wgpu::Extent3d {
                    width: layout.width as u32,
                    height: layout.height as u32,
                    depth_or_array_layers: 1,
                },
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..size);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| RuntimeError::gpu(format!("GPU poll failed during readback: {e:?}")))?;

        receiver
            .recv()
            .map_err(|e| RuntimeError::gpu(format!("readback map result lost: {e}")))??;

        let flat = {
            let mapped = slice.get_mapped_range();
            let row_bytes = layout.width * TEXEL_BYTES;
            let mut flat = Vec::with_capacity(layout.texel_capacity());
            for row in mapped.chunks_exact(row_pitch) {
                flat.extend_from_slice(&bytemuck::pod_collect_to_vec::<u8, f32>(&row[..row_bytes]));
            }
            flat
        };
        readback.unmap();

        Ok(layout.unpad(&flat)?)
    }

    pub fn get(&self, name: &str) -> Result<&GpuTexture> {
        self.textures
            .get(name)
            .ok_or_else(|| RuntimeError::gpu(format!("no texture allocated for '{name}'")))
    }

    pub fn clear(&mut self) {
        self.textures.clear();
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_pitch_alignment() {
        assert_eq!(padded_bytes_per_row(1), 256);
        assert_eq!(padded_bytes_per_row(16), 256);
        assert_eq!(padded_bytes_per_row(17), 512);
    }
}
