//! CPU reference device.
//!
//! ```text
//!  SoftwareSurface ──open()──► SoftwareDevice
//!                                 ├── framebuffer  RGBA8, row 0 = bottom
//!                                 ├── objects      buffers / textures / shaders / programs
//!                                 └── probe        optional DeviceProbe (tests)
//! ```
//!
//! Implements GL object semantics and error codes without rasterizing
//! geometry: draws are validated and counted, clears and read-backs work on a
//! real pixel buffer.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use glbridge_core::op::{BufferPayload, BufferTarget, ClearMask, IndexType, ShaderKind};
use glbridge_core::{
    ContextAttributes, ContextState, ElementType, HostAllocator, NativeError, ObjectName,
    OwnedBuffer, Op, Rect, Value,
};

use crate::device::{image_len, zeroed, GraphicsDevice, SurfaceSource};

const BYTES_PER_PIXEL: usize = 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Probe
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ProbeState {
    ops: Vec<&'static str>,
    presents: usize,
    released: bool,
    hold_after: Option<&'static str>,
    held: bool,
    resume: bool,
}

/// Instrumentation shared between a [`SoftwareDevice`] and a test.
///
/// Records what the render thread did and can park it right after a given
/// op, so a test can act while later commands are still queued.
#[derive(Debug, Clone, Default)]
pub struct DeviceProbe {
    inner: Arc<(Mutex<ProbeState>, Condvar)>,
}

impl DeviceProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every op the device executed, in order.
    pub fn executed(&self) -> Vec<&'static str> {
        lock(&self.inner.0).ops.clone()
    }

    pub fn executed_count(&self) -> usize {
        lock(&self.inner.0).ops.len()
    }

    pub fn presents(&self) -> usize {
        lock(&self.inner.0).presents
    }

    pub fn is_released(&self) -> bool {
        lock(&self.inner.0).released
    }

    /// Park the render thread after the next execution of `op_name`.
    pub fn hold_after(&self, op_name: &'static str) {
        let mut state = lock(&self.inner.0);
        state.hold_after = Some(op_name);
        state.held = false;
        state.resume = false;
    }

    /// Block until the render thread is parked. Returns `false` on timeout.
    pub fn wait_until_held(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (mutex, cond) = &*self.inner;
        let mut state = lock(mutex);
        while !state.held {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Let a parked render thread continue.
    pub fn release_hold(&self) {
        let (mutex, cond) = &*self.inner;
        let mut state = lock(mutex);
        state.resume = true;
        cond.notify_all();
    }

    fn record(&self, name: &'static str) {
        let (mutex, cond) = &*self.inner;
        let mut state = lock(mutex);
        state.ops.push(name);
        if state.hold_after != Some(name) {
            return;
        }
        state.hold_after = None;
        state.held = true;
        cond.notify_all();
        while !state.resume {
            state = cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.held = false;
        state.resume = false;
    }

    fn record_present(&self) {
        lock(&self.inner.0).presents += 1;
    }

    fn record_release(&self) {
        lock(&self.inner.0).released = true;
    }
}

// ───────────────────────────────────────────────────────────────────
// Surface
// ───────────────────────────────────────────────────────────────────

/// Headless surface that opens a [`SoftwareDevice`].
#[derive(Debug, Clone)]
pub struct SoftwareSurface {
    label: String,
    width: u32,
    height: u32,
    probe: Option<DeviceProbe>,
    available: bool,
}

impl SoftwareSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            label: "software".to_string(),
            width,
            height,
            probe: None,
            available: true,
        }
    }

    /// A surface whose native context cannot be created.
    pub fn unavailable(width: u32, height: u32) -> Self {
        Self {
            available: false,
            ..Self::new(width, height)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_probe(mut self, probe: DeviceProbe) -> Self {
        self.probe = Some(probe);
        self
    }
}

impl SurfaceSource for SoftwareSurface {
    fn describe(&self) -> String {
        format!("{} {}x{}", self.label, self.width, self.height)
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn open(self: Box<Self>, attributes: &ContextAttributes) -> Result<Box<dyn GraphicsDevice>, NativeError> {
        if !self.available {
            return Err(NativeError::context_lost(format!(
                "{}: no native context available",
                self.label
            )));
        }
        let mut device = SoftwareDevice::new(self.label, self.width, self.height, attributes.clone());
        device.probe = self.probe;
        Ok(Box::new(device))
    }
}

// ───────────────────────────────────────────────────────────────────
// Device
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Texture {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Shader {
    kind: ShaderKind,
    source: String,
    compiled: bool,
}

#[derive(Debug, Default)]
struct Program {
    shaders: Vec<ObjectName>,
    linked: bool,
}

pub struct SoftwareDevice {
    label: String,
    attributes: ContextAttributes,
    state: ContextState,
    pixels: Vec<u8>,
    next_name: ObjectName,
    buffers: HashMap<ObjectName, Vec<u8>>,
    textures: HashMap<ObjectName, Texture>,
    shaders: HashMap<ObjectName, Shader>,
    programs: HashMap<ObjectName, Program>,
    draw_calls: u64,
    probe: Option<DeviceProbe>,
    released: bool,
}

impl SoftwareDevice {
    pub fn new(label: impl Into<String>, width: u32, height: u32, attributes: ContextAttributes) -> Self {
        Self {
            label: label.into(),
            attributes,
            state: ContextState::new(width, height),
            pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
            next_name: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
            draw_calls: 0,
            probe: None,
            released: false,
        }
    }

    pub fn draw_calls(&self) -> u64 {
        self.draw_calls
    }

    /// RGBA of one pixel, origin bottom-left.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.state.drawing_buffer_width || y >= self.state.drawing_buffer_height {
            return None;
        }
        let at = (y as usize * self.state.drawing_buffer_width as usize + x as usize) * BYTES_PER_PIXEL;
        let mut rgba = [0; 4];
        rgba.copy_from_slice(&self.pixels[at..at + BYTES_PER_PIXEL]);
        Some(rgba)
    }

    /// Size and texels of a texture object.
    pub fn texture(&self, name: ObjectName) -> Option<(u32, u32, &[u8])> {
        self.textures
            .get(&name)
            .map(|t| (t.width, t.height, t.data.as_slice()))
    }

    fn alloc_name(&mut self) -> ObjectName {
        let name = self.next_name;
        self.next_name += 1;
        name
    }

    fn bound_buffer(&mut self, target: BufferTarget) -> Result<&mut Vec<u8>, NativeError> {
        let name = self
            .state
            .buffer_binding(target)
            .ok_or_else(|| NativeError::invalid_operation("no buffer bound to target"))?;
        self.buffers
            .get_mut(&name)
            .ok_or_else(|| NativeError::invalid_operation(format!("buffer {name} was deleted")))
    }

    /// Intersection of `rect` with the drawing buffer, as (x0, y0, x1, y1).
    fn clip(&self, rect: Rect) -> Option<(usize, usize, usize, usize)> {
        let w = i64::from(self.state.drawing_buffer_width);
        let h = i64::from(self.state.drawing_buffer_height);
        let x0 = i64::from(rect.x).clamp(0, w);
        let y0 = i64::from(rect.y).clamp(0, h);
        let x1 = (i64::from(rect.x) + i64::from(rect.width)).clamp(0, w);
        let y1 = (i64::from(rect.y) + i64::from(rect.height)).clamp(0, h);
        (x0 < x1 && y0 < y1).then(|| (x0 as usize, y0 as usize, x1 as usize, y1 as usize))
    }

    fn clear(&mut self, mask: ClearMask) {
        if !mask.contains(ClearMask::COLOR) {
            return;
        }
        let area = if self.state.scissor_test {
            self.state.scissor_box
        } else {
            Rect::new(0, 0, self.state.drawing_buffer_width, self.state.drawing_buffer_height)
        };
        let Some((x0, y0, x1, y1)) = self.clip(area) else {
            return;
        };
        let rgba = self.state.clear_color.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8);
        let stride = self.state.drawing_buffer_width as usize * BYTES_PER_PIXEL;
        for y in y0..y1 {
            let row = &mut self.pixels[y * stride..(y + 1) * stride];
            for px in row[x0 * BYTES_PER_PIXEL..x1 * BYTES_PER_PIXEL].chunks_exact_mut(BYTES_PER_PIXEL) {
                px.copy_from_slice(&rgba);
            }
        }
    }

    fn read_pixels(&self, rect: Rect, allocator: &Arc<dyn HostAllocator>) -> Result<OwnedBuffer, NativeError> {
        let out_stride = image_len(rect.width, 1)?;
        let mut out = OwnedBuffer::zeroed_in(allocator, ElementType::Uint8, image_len(rect.width, rect.height)?);
        let Some((x0, y0, x1, y1)) = self.clip(rect) else {
            return Ok(out);
        };
        let stride = self.state.drawing_buffer_width as usize * BYTES_PER_PIXEL;
        let dst = out.bytes_mut();
        for y in y0..y1 {
            let oy = (y as i64 - i64::from(rect.y)) as usize;
            let ox = (x0 as i64 - i64::from(rect.x)) as usize;
            let src = &self.pixels[y * stride + x0 * BYTES_PER_PIXEL..y * stride + x1 * BYTES_PER_PIXEL];
            let at = oy * out_stride + ox * BYTES_PER_PIXEL;
            dst[at..at + src.len()].copy_from_slice(src);
        }
        Ok(out)
    }

    fn check_draw(&self) -> Result<(), NativeError> {
        let program = self
            .state
            .current_program
            .ok_or_else(|| NativeError::invalid_operation("no program in use"))?;
        if !self.programs.get(&program).is_some_and(|p| p.linked) {
            return Err(NativeError::invalid_operation(format!("program {program} is not linked")));
        }
        match self.state.array_buffer {
            Some(name) if self.buffers.contains_key(&name) => Ok(()),
            _ => Err(NativeError::invalid_operation("no array buffer bound")),
        }
    }

    fn draw_elements(&self, count: u32, index_type: IndexType, offset: usize) -> Result<(), NativeError> {
        self.check_draw()?;
        let indices = self
            .state
            .element_array_buffer
            .and_then(|name| self.buffers.get(&name))
            .ok_or_else(|| NativeError::invalid_operation("no element array buffer bound"))?;
        if offset % index_type.size() != 0 {
            return Err(NativeError::invalid_operation("offset is not a multiple of the index size"));
        }
        let end = (count as usize)
            .checked_mul(index_type.size())
            .and_then(|len| len.checked_add(offset))
            .filter(|end| *end <= indices.len())
            .ok_or_else(|| {
                NativeError::invalid_operation(format!(
                    "{count} indices at offset {offset} exceed element buffer of {} bytes",
                    indices.len()
                ))
            })?;
        log::trace!("drawElements reads index bytes {offset}..{end}");
        Ok(())
    }

    fn run(&mut self, op: &Op, allocator: &Arc<dyn HostAllocator>) -> Result<Value, NativeError> {
        match op {
            Op::Viewport(_) | Op::Scissor(_) | Op::SetCapability { .. } | Op::ClearColor(_) => {}
            Op::Clear(mask) => self.clear(*mask),
            Op::CreateBuffer => {
                let name = self.alloc_name();
                self.buffers.insert(name, Vec::new());
                return Ok(Value::Name(name));
            }
            Op::BindBuffer { buffer: Some(name), .. } if !self.buffers.contains_key(name) => {
                return Err(NativeError::invalid_operation(format!("buffer {name} does not exist")));
            }
            Op::BindBuffer { .. } => {}
            Op::BufferData { target, data, .. } => {
                let bytes = match data {
                    BufferPayload::Size(n) => zeroed(*n)?,
                    BufferPayload::Bytes(b) => b.bytes().to_vec(),
                };
                *self.bound_buffer(*target)? = bytes;
            }
            Op::BufferSubData { target, offset, data } => {
                let store = self.bound_buffer(*target)?;
                let end = offset
                    .checked_add(data.byte_len())
                    .filter(|end| *end <= store.len())
                    .ok_or_else(|| {
                        NativeError::invalid_value(format!(
                            "{} bytes at offset {offset} exceed buffer of {} bytes",
                            data.byte_len(),
                            store.len()
                        ))
                    })?;
                store[*offset..end].copy_from_slice(data.bytes());
            }
            Op::DeleteBuffer(name) => {
                self.buffers.remove(name);
            }
            Op::CreateTexture => {
                let name = self.alloc_name();
                self.textures.insert(name, Texture::default());
                return Ok(Value::Name(name));
            }
            Op::BindTexture(Some(name)) if !self.textures.contains_key(name) => {
                return Err(NativeError::invalid_operation(format!("texture {name} does not exist")));
            }
            Op::BindTexture(_) => {}
            Op::TexImage2D { width, height, data } => {
                let expected = image_len(*width, *height)?;
                let bytes = match data {
                    Some(d) if d.byte_len() < expected => {
                        return Err(NativeError::invalid_operation(format!(
                            "texImage2D needs {expected} bytes, got {}",
                            d.byte_len()
                        )));
                    }
                    Some(d) => d.bytes()[..expected].to_vec(),
                    None => zeroed(expected)?,
                };
                let texture = self
                    .state
                    .texture_2d
                    .and_then(|name| self.textures.get_mut(&name))
                    .ok_or_else(|| NativeError::invalid_operation("no texture bound"))?;
                *texture = Texture { width: *width, height: *height, data: bytes };
            }
            Op::DeleteTexture(name) => {
                self.textures.remove(name);
            }
            Op::CreateShader(kind) => {
                let name = self.alloc_name();
                self.shaders.insert(name, Shader { kind: *kind, source: String::new(), compiled: false });
                return Ok(Value::Name(name));
            }
            Op::ShaderSource { shader, source } => {
                self.shader_mut(*shader)?.source = source.clone();
            }
            Op::CompileShader(shader) => {
                let shader = self.shader_mut(*shader)?;
                shader.compiled = !shader.source.trim().is_empty();
            }
            Op::AttachShader { program, shader } => {
                if !self.shaders.contains_key(shader) {
                    return Err(NativeError::invalid_value(format!("shader {shader} does not exist")));
                }
                let program = self.program_mut(*program)?;
                if program.shaders.contains(shader) {
                    return Err(NativeError::invalid_operation("shader is already attached"));
                }
                program.shaders.push(*shader);
            }
            Op::CreateProgram => {
                let name = self.alloc_name();
                self.programs.insert(name, Program::default());
                return Ok(Value::Name(name));
            }
            Op::LinkProgram(name) => {
                let attached = self.program_mut(*name)?.shaders.clone();
                let compiled = |kind| {
                    attached
                        .iter()
                        .filter_map(|s| self.shaders.get(s))
                        .any(|s| s.kind == kind && s.compiled)
                };
                let linked = compiled(ShaderKind::Vertex) && compiled(ShaderKind::Fragment);
                self.program_mut(*name)?.linked = linked;
            }
            Op::UseProgram(Some(name)) => {
                if !self.programs.get(name).is_some_and(|p| p.linked) {
                    return Err(NativeError::invalid_operation(format!("program {name} is not linked")));
                }
            }
            Op::UseProgram(None) => {}
            Op::DeleteProgram(name) => {
                self.programs.remove(name);
            }
            Op::DrawArrays { .. } => {
                self.check_draw()?;
                self.draw_calls += 1;
            }
            Op::DrawElements { count, index_type, offset, .. } => {
                self.draw_elements(*count, *index_type, *offset)?;
                self.draw_calls += 1;
            }
            Op::ReadPixels(rect) => return Ok(Value::Bytes(self.read_pixels(*rect, allocator)?)),
            Op::Flush | Op::Finish => {}
            Op::GetError => return Ok(Value::Int(i64::from(glbridge_core::codes::NO_ERROR))),
        }
        Ok(Value::None)
    }

    fn shader_mut(&mut self, name: ObjectName) -> Result<&mut Shader, NativeError> {
        self.shaders
            .get_mut(&name)
            .ok_or_else(|| NativeError::invalid_value(format!("shader {name} does not exist")))
    }

    fn program_mut(&mut self, name: ObjectName) -> Result<&mut Program, NativeError> {
        self.programs
            .get_mut(&name)
            .ok_or_else(|| NativeError::invalid_value(format!("program {name} does not exist")))
    }
}

impl GraphicsDevice for SoftwareDevice {
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
        let result = self.run(op, allocator);
        if let Ok(value) = &result {
            if let Some(next) = self.state.apply(op, value) {
                self.state = next;
            }
        }
        if let Some(probe) = &self.probe {
            probe.record(op.name());
        }
        result
    }

    fn present(&mut self) -> Result<(), NativeError> {
        if self.released {
            return Err(NativeError::context_lost("device already released"));
        }
        if !self.attributes.preserve_drawing_buffer {
            self.pixels.fill(0);
        }
        if let Some(probe) = &self.probe {
            probe.record_present();
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.buffers.clear();
        self.textures.clear();
        self.shaders.clear();
        self.programs.clear();
        self.pixels = Vec::new();
        log::debug!("{}: released", self.label);
        if let Some(probe) = &self.probe {
            probe.record_release();
        }
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use glbridge_core::op::{BufferUsage, Capability, DrawMode};
    use glbridge_core::{codes, system_allocator};

    fn device(w: u32, h: u32) -> SoftwareDevice {
        SoftwareDevice::new("test", w, h, ContextAttributes::default())
    }

    fn exec(dev: &mut SoftwareDevice, op: Op) -> Result<Value, NativeError> {
        dev.execute(&op, &system_allocator())
    }

    #[test]
    fn test_clear_fills_framebuffer() {
        let mut dev = device(4, 4);
        exec(&mut dev, Op::ClearColor([1.0, 0.0, 0.0, 1.0])).unwrap();
        exec(&mut dev, Op::Clear(ClearMask::COLOR)).unwrap();
        assert_eq!(dev.pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(dev.pixel(3, 3), Some([255, 0, 0, 255]));
        assert_eq!(dev.pixel(4, 0), None);
    }

    #[test]
    fn test_scissored_clear() {
        let mut dev = device(4, 4);
        exec(&mut dev, Op::ClearColor([0.0, 1.0, 0.0, 1.0])).unwrap();
        exec(&mut dev, Op::Scissor(Rect::new(2, 2, 10, 10))).unwrap();
        exec(&mut dev, Op::SetCapability { cap: Capability::ScissorTest, enabled: true }).unwrap();
        exec(&mut dev, Op::Clear(ClearMask::COLOR)).unwrap();
        assert_eq!(dev.pixel(0, 0), Some([0, 0, 0, 0]));
        assert_eq!(dev.pixel(3, 3), Some([0, 255, 0, 255]));
    }

    #[test]
    fn test_read_pixels_clips_with_zeros() {
        let mut dev = device(2, 2);
        exec(&mut dev, Op::ClearColor([1.0, 1.0, 1.0, 1.0])).unwrap();
        exec(&mut dev, Op::Clear(ClearMask::COLOR)).unwrap();

        let bytes = exec(&mut dev, Op::ReadPixels(Rect::new(1, 0, 2, 1)))
            .unwrap()
            .into_bytes()
            .unwrap();
        assert_eq!(bytes.byte_len(), 8);
        assert_eq!(&bytes.bytes()[..4], &[255; 4]);
        assert_eq!(&bytes.bytes()[4..], &[0; 4]);
    }

    #[test]
    fn test_buffer_lifecycle() {
        let mut dev = device(1, 1);
        let name = exec(&mut dev, Op::CreateBuffer).unwrap().as_name().unwrap();
        exec(&mut dev, Op::BindBuffer { target: BufferTarget::Array, buffer: Some(name) }).unwrap();
        exec(
            &mut dev,
            Op::BufferData {
                target: BufferTarget::Array,
                data: BufferPayload::Size(8),
                usage: BufferUsage::Static,
            },
        )
        .unwrap();

        let patch = OwnedBuffer::from_slice_in(&system_allocator(), ElementType::Uint8, &[1, 2]);
        let err = exec(
            &mut dev,
            Op::BufferSubData { target: BufferTarget::Array, offset: 7, data: patch.clone() },
        )
        .unwrap_err();
        assert_eq!(err.code, codes::INVALID_VALUE);
        exec(&mut dev, Op::BufferSubData { target: BufferTarget::Array, offset: 6, data: patch }).unwrap();

        exec(&mut dev, Op::DeleteBuffer(name)).unwrap();
        let err = exec(&mut dev, Op::BindBuffer { target: BufferTarget::Array, buffer: Some(name) })
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_OPERATION);
    }

    #[test]
    fn test_oversized_requests_fail_without_aborting() {
        let mut dev = device(2, 2);
        let name = exec(&mut dev, Op::CreateBuffer).unwrap().as_name().unwrap();
        exec(&mut dev, Op::BindBuffer { target: BufferTarget::Array, buffer: Some(name) }).unwrap();
        let err = exec(
            &mut dev,
            Op::BufferData {
                target: BufferTarget::Array,
                data: BufferPayload::Size(usize::MAX),
                usage: BufferUsage::Static,
            },
        )
        .unwrap_err();
        assert_eq!(err.code, codes::OUT_OF_MEMORY);

        let patch = OwnedBuffer::from_slice_in(&system_allocator(), ElementType::Uint8, &[1, 2]);
        let err = exec(
            &mut dev,
            Op::BufferSubData { target: BufferTarget::Array, offset: usize::MAX, data: patch },
        )
        .unwrap_err();
        assert_eq!(err.code, codes::INVALID_VALUE);

        let texture = exec(&mut dev, Op::CreateTexture).unwrap().as_name().unwrap();
        exec(&mut dev, Op::BindTexture(Some(texture))).unwrap();
        let err = exec(&mut dev, Op::TexImage2D { width: u32::MAX, height: u32::MAX, data: None }).unwrap_err();
        assert_eq!(err.code, codes::OUT_OF_MEMORY);

        if usize::BITS == 64 {
            let err = exec(&mut dev, Op::ReadPixels(Rect::new(0, 0, 0x8000_0000, 0x8000_0000))).unwrap_err();
            assert_eq!(err.code, codes::OUT_OF_MEMORY);
        }

        // The device keeps working afterwards
        exec(&mut dev, Op::ClearColor([1.0, 0.0, 0.0, 1.0])).unwrap();
        exec(&mut dev, Op::Clear(ClearMask::COLOR)).unwrap();
        assert_eq!(dev.pixel(1, 1), Some([255, 0, 0, 255]));
    }

    #[test]
    fn test_draw_requires_linked_program() {
        let mut dev = device(1, 1);
        let draw = Op::DrawArrays { mode: DrawMode::Triangles, first: 0, count: 3 };
        assert_eq!(exec(&mut dev, draw.clone()).unwrap_err().code, codes::INVALID_OPERATION);

        let vs = exec(&mut dev, Op::CreateShader(ShaderKind::Vertex)).unwrap().as_name().unwrap();
        let fs = exec(&mut dev, Op::CreateShader(ShaderKind::Fragment)).unwrap().as_name().unwrap();
        let program = exec(&mut dev, Op::CreateProgram).unwrap().as_name().unwrap();
        for shader in [vs, fs] {
            exec(&mut dev, Op::ShaderSource { shader, source: "void main() {}".into() }).unwrap();
            exec(&mut dev, Op::CompileShader(shader)).unwrap();
            exec(&mut dev, Op::AttachShader { program, shader }).unwrap();
        }
        exec(&mut dev, Op::LinkProgram(program)).unwrap();
        exec(&mut dev, Op::UseProgram(Some(program))).unwrap();

        let vbo = exec(&mut dev, Op::CreateBuffer).unwrap().as_name().unwrap();
        exec(&mut dev, Op::BindBuffer { target: BufferTarget::Array, buffer: Some(vbo) }).unwrap();
        exec(&mut dev, draw).unwrap();
        assert_eq!(dev.draw_calls(), 1);
    }

    #[test]
    fn test_link_fails_without_fragment_shader() {
        let mut dev = device(1, 1);
        let vs = exec(&mut dev, Op::CreateShader(ShaderKind::Vertex)).unwrap().as_name().unwrap();
        let program = exec(&mut dev, Op::CreateProgram).unwrap().as_name().unwrap();
        exec(&mut dev, Op::ShaderSource { shader: vs, source: "void main() {}".into() }).unwrap();
        exec(&mut dev, Op::CompileShader(vs)).unwrap();
        exec(&mut dev, Op::AttachShader { program, shader: vs }).unwrap();
        exec(&mut dev, Op::LinkProgram(program)).unwrap();
        let err = exec(&mut dev, Op::UseProgram(Some(program))).unwrap_err();
        assert_eq!(err.code, codes::INVALID_OPERATION);
    }

    #[test]
    fn test_present_discards_unless_preserved() {
        let mut dev = device(1, 1);
        exec(&mut dev, Op::ClearColor([1.0; 4])).unwrap();
        exec(&mut dev, Op::Clear(ClearMask::COLOR)).unwrap();
        dev.present().unwrap();
        assert_eq!(dev.pixel(0, 0), Some([0; 4]));

        let attrs = ContextAttributes { preserve_drawing_buffer: true, ..Default::default() };
        let mut dev = SoftwareDevice::new("kept", 1, 1, attrs);
        exec(&mut dev, Op::ClearColor([1.0; 4])).unwrap();
        exec(&mut dev, Op::Clear(ClearMask::COLOR)).unwrap();
        dev.present().unwrap();
        assert_eq!(dev.pixel(0, 0), Some([255; 4]));
    }

    #[test]
    fn test_unavailable_surface() {
        let surface: Box<dyn SurfaceSource> = Box::new(SoftwareSurface::unavailable(8, 8));
        let err = surface.open(&ContextAttributes::default()).err().unwrap();
        assert_eq!(err.code, codes::CONTEXT_LOST_WEBGL);
    }

    #[test]
    fn test_probe_records_and_holds() {
        let probe = DeviceProbe::new();
        let surface: Box<dyn SurfaceSource> =
            Box::new(SoftwareSurface::new(2, 2).with_probe(probe.clone()));
        let mut dev = surface.open(&ContextAttributes::default()).unwrap();

        probe.hold_after("flush");
        let worker = std::thread::spawn(move || {
            let alloc = system_allocator();
            dev.execute(&Op::Flush, &alloc).unwrap();
            dev.execute(&Op::Finish, &alloc).unwrap();
            dev.release();
        });

        assert!(probe.wait_until_held(Duration::from_secs(5)));
        assert_eq!(probe.executed(), vec!["flush"]);
        probe.release_hold();
        worker.join().unwrap();

        assert_eq!(probe.executed(), vec!["flush", "finish"]);
        assert!(probe.is_released());
    }
}
