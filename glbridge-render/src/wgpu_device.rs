//! Offscreen `wgpu` device.
//!
//! The drawing buffer is an `Rgba8Unorm` texture. GL conventions are kept at
//! the boundary: rectangles arrive with a bottom-left origin and are flipped
//! to wgpu's top-left origin for copies and read-backs.
//!
//! Covers state, clears, buffers, textures, read-back and presentation.
//! Shader, program and draw ops report `INVALID_OPERATION`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use wgpu::{
    Device, DeviceDescriptor, Extent3d, Instance, InstanceDescriptor, Queue,
    RequestAdapterOptions, Texture, TextureFormat, TextureUsages,
};

use glbridge_core::op::{BufferPayload, BufferTarget, ClearMask};
use glbridge_core::{
    codes, ContextAttributes, ContextState, ElementType, HostAllocator, NativeError, ObjectName,
    OwnedBuffer, Op, PowerPreference, Rect, Value,
};

use crate::device::{image_len, zeroed, GraphicsDevice, SurfaceSource};

const BYTES_PER_PIXEL: u32 = 4;
const FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

#[derive(Error, Debug)]
pub enum WgpuSetupError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,
    #[error("Failed to request device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

impl From<WgpuSetupError> for NativeError {
    fn from(err: WgpuSetupError) -> Self {
        NativeError::context_lost(err.to_string())
    }
}

fn power_preference(pref: PowerPreference) -> wgpu::PowerPreference {
    match pref {
        PowerPreference::Default => wgpu::PowerPreference::None,
        PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
    }
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

// ───────────────────────────────────────────────────────────────────
// Surface
// ───────────────────────────────────────────────────────────────────

/// Headless surface backed by the system's default GPU adapter.
#[derive(Debug, Clone)]
pub struct WgpuSurface {
    label: String,
    width: u32,
    height: u32,
}

impl WgpuSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            label: "wgpu".to_string(),
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl SurfaceSource for WgpuSurface {
    fn describe(&self) -> String {
        format!("{} {}x{}", self.label, self.width, self.height)
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn open(self: Box<Self>, attributes: &ContextAttributes) -> Result<Box<dyn GraphicsDevice>, NativeError> {
        let device = pollster::block_on(WgpuDevice::new_headless(
            self.label,
            self.width,
            self.height,
            attributes.clone(),
        ))?;
        Ok(Box::new(device))
    }
}

// ───────────────────────────────────────────────────────────────────
// Device
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct GpuBuffer {
    shadow: Vec<u8>,
    buffer: Option<wgpu::Buffer>,
}

pub struct WgpuDevice {
    label: String,
    device: Device,
    queue: Queue,
    target: Texture,
    attributes: ContextAttributes,
    state: ContextState,
    next_name: ObjectName,
    buffers: HashMap<ObjectName, GpuBuffer>,
    textures: HashMap<ObjectName, Option<Texture>>,
    released: bool,
}

impl WgpuDevice {
    /// Create a device rendering into an offscreen texture.
    pub async fn new_headless(
        label: String,
        width: u32,
        height: u32,
        attributes: ContextAttributes,
    ) -> Result<Self, WgpuSetupError> {
        let instance = Instance::new(&InstanceDescriptor::default());

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference: power_preference(attributes.power_preference),
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(WgpuSetupError::NoAdapter)?;

        let (device, queue) = adapter
            .request_device(&DeviceDescriptor {
                label: Some("glbridge-offscreen"),
                ..Default::default()
            }, None)
            .await?;

        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("drawing-buffer"),
            size: Extent3d { width, height, depth_or_array_layers: 1 },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC | TextureUsages::COPY_DST,
            view_formats: &[],
        });

        log::info!("{label}: wgpu device ready ({width}x{height}, {:?})", adapter.get_info().backend);

        Ok(Self {
            label,
            device,
            queue,
            target,
            attributes,
            state: ContextState::new(width, height),
            next_name: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            released: false,
        })
    }

    fn alloc_name(&mut self) -> ObjectName {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    /// Intersection of a GL rect with the drawing buffer, as (x0, y0, x1, y1).
    fn clip(&self, rect: Rect) -> Option<(u32, u32, u32, u32)> {
        let w = i64::from(self.state.drawing_buffer_width);
        let h = i64::from(self.state.drawing_buffer_height);
        let x0 = i64::from(rect.x).clamp(0, w);
        let y0 = i64::from(rect.y).clamp(0, h);
        let x1 = (i64::from(rect.x) + i64::from(rect.width)).clamp(0, w);
        let y1 = (i64::from(rect.y) + i64::from(rect.height)).clamp(0, h);
        (x0 < x1 && y0 < y1).then(|| (x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }

    fn clear_full(&self, color: [f32; 4]) {
        let view = self.target.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("glbridge-clear"),
        });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("clear-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: f64::from(color[0]),
                            g: f64::from(color[1]),
                            b: f64::from(color[2]),
                            a: f64::from(color[3]),
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn clear(&self, mask: ClearMask) {
        if !mask.contains(ClearMask::COLOR) {
            return;
        }
        if !self.state.scissor_test {
            self.clear_full(self.state.clear_color);
            return;
        }
        let Some((x0, y0, x1, y1)) = self.clip(self.state.scissor_box) else {
            return;
        };
        let rgba = self.state.clear_color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        let (w, h) = (x1 - x0, y1 - y0);
        let texels: Vec<u8> = rgba.iter().copied().cycle().take((w * h * BYTES_PER_PIXEL) as usize).collect();
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d { x: x0, y: self.state.drawing_buffer_height - y1, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            &texels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(w * BYTES_PER_PIXEL),
                rows_per_image: Some(h),
            },
            Extent3d { width: w, height: h, depth_or_array_layers: 1 },
        );
    }

    fn upload(&self, name: ObjectName, store: &mut GpuBuffer) {
        if store.shadow.is_empty() {
            store.buffer = None;
            return;
        }
        let size = align_to(store.shadow.len() as u64, wgpu::COPY_BUFFER_ALIGNMENT);
        let buffer = store.buffer.take().filter(|b| b.size() == size).unwrap_or_else(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("gl-buffer-{name}")),
                size,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::INDEX,
                mapped_at_creation: false,
            })
        });
        let mut padded = store.shadow.clone();
        padded.resize(size as usize, 0);
        self.queue.write_buffer(&buffer, 0, &padded);
        store.buffer = Some(buffer);
    }

    fn bound_buffer_name(&self, target: BufferTarget) -> Result<ObjectName, NativeError> {
        let name = self
            .state
            .buffer_binding(target)
            .ok_or_else(|| NativeError::invalid_operation("no buffer bound to target"))?;
        if !self.buffers.contains_key(&name) {
            return Err(NativeError::invalid_operation(format!("buffer {name} was deleted")));
        }
        Ok(name)
    }

    fn write_buffer(&mut self, target: BufferTarget, offset: Option<usize>, data: &[u8]) -> Result<(), NativeError> {
        let name = self.bound_buffer_name(target)?;
        let mut store = self.buffers.remove(&name).unwrap_or_default();
        let result = match offset {
            None => {
                store.shadow = data.to_vec();
                Ok(())
            }
            Some(offset) => match offset.checked_add(data.len()).filter(|end| *end <= store.shadow.len()) {
                Some(end) => {
                    store.shadow[offset..end].copy_from_slice(data);
                    Ok(())
                }
                None => Err(NativeError::invalid_value(format!(
                    "{} bytes at offset {offset} exceed buffer of {} bytes",
                    data.len(),
                    store.shadow.len()
                ))),
            },
        };
        if result.is_ok() {
            self.upload(name, &mut store);
        }
        self.buffers.insert(name, store);
        result
    }

    fn tex_image(&mut self, width: u32, height: u32, data: Option<&OwnedBuffer>) -> Result<(), NativeError> {
        let name = self
            .state
            .texture_2d
            .filter(|n| self.textures.contains_key(n))
            .ok_or_else(|| NativeError::invalid_operation("no texture bound"))?;
        let max = self.device.limits().max_texture_dimension_2d;
        if width > max || height > max {
            return Err(NativeError::invalid_value(format!(
                "texImage2D {width}x{height} exceeds the device maximum of {max}"
            )));
        }
        let expected = image_len(width, height)?;
        if let Some(d) = data {
            if d.byte_len() < expected {
                return Err(NativeError::invalid_operation(format!(
                    "texImage2D needs {expected} bytes, got {}",
                    d.byte_len()
                )));
            }
        }
        if width == 0 || height == 0 {
            self.textures.insert(name, None);
            return Ok(());
        }
        let size = Extent3d { width, height, depth_or_array_layers: 1 };
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("gl-texture-{name}")),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FORMAT,
            usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
            view_formats: &[],
        });
        if let Some(d) = data {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &d.bytes()[..expected],
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(width * BYTES_PER_PIXEL),
                    rows_per_image: Some(height),
                },
                size,
            );
        }
        if let Some(Some(old)) = self.textures.insert(name, Some(texture)) {
            old.destroy();
        }
        Ok(())
    }

    fn read_pixels(&self, rect: Rect, allocator: &Arc<dyn HostAllocator>) -> Result<OwnedBuffer, NativeError> {
        let out_stride = image_len(rect.width, 1)?;
        let mut out = OwnedBuffer::zeroed_in(allocator, ElementType::Uint8, image_len(rect.width, rect.height)?);
        let Some((x0, y0, x1, y1)) = self.clip(rect) else {
            return Ok(out);
        };
        let (w, h) = (x1 - x0, y1 - y0);
        let tex_top = self.state.drawing_buffer_height - y1;
        let padded_row = align_to(u64::from(w * BYTES_PER_PIXEL), u64::from(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT));

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("read-pixels-staging"),
            size: padded_row * u64::from(h),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("glbridge-read-pixels"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d { x: x0, y: tex_top, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row as u32),
                    rows_per_image: Some(h),
                },
            },
            Extent3d { width: w, height: h, depth_or_array_layers: 1 },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|_| NativeError::context_lost("read-back was abandoned"))?
            .map_err(|e| NativeError::new(codes::OUT_OF_MEMORY, e.to_string()))?;

        {
            let mapped = slice.get_mapped_range();
            let dst = out.bytes_mut();
            let row_bytes = (w * BYTES_PER_PIXEL) as usize;
            let ox = ((i64::from(x0) - i64::from(rect.x)) as usize) * BYTES_PER_PIXEL as usize;
            for y in y0..y1 {
                // Texture rows run top-down, GL rows bottom-up.
                let src_row = (y1 - 1 - y) as usize * padded_row as usize;
                let oy = (i64::from(y) - i64::from(rect.y)) as usize;
                let at = oy * out_stride + ox;
                dst[at..at + row_bytes].copy_from_slice(&mapped[src_row..src_row + row_bytes]);
            }
        }
        staging.unmap();
        Ok(out)
    }

    fn run(&mut self, op: &Op, allocator: &Arc<dyn HostAllocator>) -> Result<Value, NativeError> {
        match op {
            Op::Viewport(_) | Op::Scissor(_) | Op::SetCapability { .. } | Op::ClearColor(_) => {}
            Op::Clear(mask) => self.clear(*mask),
            Op::CreateBuffer => {
                let name = self.alloc_name();
                self.buffers.insert(name, GpuBuffer::default());
                return Ok(Value::Name(name));
            }
            Op::BindBuffer { buffer: Some(name), .. } if !self.buffers.contains_key(name) => {
                return Err(NativeError::invalid_operation(format!("buffer {name} does not exist")));
            }
            Op::BindBuffer { .. } => {}
            Op::BufferData { target, data, .. } => match data {
                BufferPayload::Size(n) => self.write_buffer(*target, None, &zeroed(*n)?)?,
                BufferPayload::Bytes(b) => self.write_buffer(*target, None, b.bytes())?,
            },
            Op::BufferSubData { target, offset, data } => self.write_buffer(*target, Some(*offset), data.bytes())?,
            Op::DeleteBuffer(name) => {
                if let Some(buffer) = self.buffers.remove(name).and_then(|b| b.buffer) {
                    buffer.destroy();
                }
            }
            Op::CreateTexture => {
                let name = self.alloc_name();
                self.textures.insert(name, None);
                return Ok(Value::Name(name));
            }
            Op::BindTexture(Some(name)) if !self.textures.contains_key(name) => {
                return Err(NativeError::invalid_operation(format!("texture {name} does not exist")));
            }
            Op::BindTexture(_) => {}
            Op::TexImage2D { width, height, data } => self.tex_image(*width, *height, data.as_ref())?,
            Op::DeleteTexture(name) => {
                if let Some(Some(texture)) = self.textures.remove(name) {
                    texture.destroy();
                }
            }
            Op::CreateShader(_)
            | Op::ShaderSource { .. }
            | Op::CompileShader(_)
            | Op::AttachShader { .. }
            | Op::CreateProgram
            | Op::LinkProgram(_)
            | Op::UseProgram(_)
            | Op::DeleteProgram(_)
            | Op::DrawArrays { .. }
            | Op::DrawElements { .. } => {
                return Err(NativeError::invalid_operation(format!(
                    "{} is not supported by the wgpu backend",
                    op.name()
                )));
            }
            Op::ReadPixels(rect) => return Ok(Value::Bytes(self.read_pixels(*rect, allocator)?)),
            Op::Flush => {
                let _ = self.device.poll(wgpu::Maintain::Poll);
            }
            Op::Finish => {
                let _ = self.device.poll(wgpu::Maintain::Wait);
            }
            Op::GetError => return Ok(Value::Int(i64::from(codes::NO_ERROR))),
        }
        Ok(Value::None)
    }
}

impl GraphicsDevice for WgpuDevice {
    fn label(&self) -> &str {
        &self.label
    }

    fn drawing_buffer_size(&self) -> (u32, u32) {
        (self.state.drawing_buffer_width, self.state.drawing_buffer_height)
    }

    fn execute(&mut self, op: &Op, allocator: &Arc<dyn HostAllocator>) -> Result<Value, NativeError> {
        if self.released {
            return Err(NativeError::context_lost("device already released"));
        }
        let value = self.run(op, allocator)?;
        if let Some(next) = self.state.apply(op, &value) {
            self.state = next;
        }
        log::trace!("{}: {}", self.label, op.name());
        Ok(value)
    }

    fn present(&mut self) -> Result<(), NativeError> {
        if self.released {
            return Err(NativeError::context_lost("device already released"));
        }
        let _ = self.device.poll(wgpu::Maintain::Poll);
        if !self.attributes.preserve_drawing_buffer {
            self.clear_full([0.0; 4]);
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for (_, store) in self.buffers.drain() {
            if let Some(buffer) = store.buffer {
                buffer.destroy();
            }
        }
        for texture in self.textures.drain().filter_map(|(_, t)| t) {
            texture.destroy();
        }
        self.target.destroy();
        let _ = self.device.poll(wgpu::Maintain::Wait);
        log::debug!("{}: released", self.label);
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use glbridge_core::system_allocator;

    fn headless(w: u32, h: u32) -> Option<WgpuDevice> {
        // May fail in CI without GPU; callers skip.
        pollster::block_on(WgpuDevice::new_headless("test".into(), w, h, ContextAttributes::default())).ok()
    }

    #[test]
    fn test_clear_and_read_back() {
        let Some(mut dev) = headless(4, 4) else {
            return;
        };
        let alloc = system_allocator();
        dev.execute(&Op::ClearColor([1.0, 0.0, 0.0, 1.0]), &alloc).unwrap();
        dev.execute(&Op::Clear(ClearMask::COLOR), &alloc).unwrap();
        let bytes = dev
            .execute(&Op::ReadPixels(Rect::new(0, 0, 4, 4)), &alloc)
            .unwrap()
            .into_bytes()
            .unwrap();
        assert_eq!(bytes.byte_len(), 64);
        assert_eq!(&bytes.bytes()[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_scissored_clear_is_bottom_left() {
        let Some(mut dev) = headless(2, 2) else {
            return;
        };
        let alloc = system_allocator();
        dev.execute(&Op::ClearColor([0.0, 0.0, 1.0, 1.0]), &alloc).unwrap();
        dev.execute(&Op::Scissor(Rect::new(0, 0, 2, 1)), &alloc).unwrap();
        dev.execute(
            &Op::SetCapability { cap: glbridge_core::op::Capability::ScissorTest, enabled: true },
            &alloc,
        )
        .unwrap();
        dev.execute(&Op::Clear(ClearMask::COLOR), &alloc).unwrap();
        let bytes = dev
            .execute(&Op::ReadPixels(Rect::new(0, 0, 1, 2)), &alloc)
            .unwrap()
            .into_bytes()
            .unwrap();
        // Row 0 (bottom) cleared, row 1 untouched.
        assert_eq!(&bytes.bytes()[..4], &[0, 0, 255, 255]);
        assert_eq!(&bytes.bytes()[4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_programs_unsupported() {
        let Some(mut dev) = headless(1, 1) else {
            return;
        };
        let err = dev.execute(&Op::CreateProgram, &system_allocator()).unwrap_err();
        assert_eq!(err.code, codes::INVALID_OPERATION);
        dev.release();
        assert!(dev.execute(&Op::Flush, &system_allocator()).is_err());
    }
}
