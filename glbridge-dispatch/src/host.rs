//! Host API surface: the function table script code calls into.
//!
//! Every operation is classified once, in [`OP_TABLE`]:
//!
//! | class | runs on | answers from |
//! |-------|---------|--------------|
//! | immediate | calling thread | cached context state |
//! | deferred | render thread | the native device |
//!
//! Deferred arguments are decoded and validated here, on the calling thread;
//! buffer arguments are copied into owned memory before the command is
//! queued, so the render thread only ever sees a well-formed [`Op`].

use std::sync::Arc;

use glbridge_core::op::{
    BufferPayload, BufferTarget, BufferUsage, Capability, ClearMask, DrawMode, IndexType,
    ShaderKind,
};
use glbridge_core::{
    as_native_view, gl, write_back, Args, BridgeError, BridgeResult, ContextId, HostAllocator,
    Limits, ObjectName, OwnedBuffer, Op, Rect, ScriptBuffer, Value,
};

use crate::completion::Pending;
use crate::dispatcher::on_render_thread;
use crate::registry::{ContextRegistry, GraphicsContext};
use crate::stats::AtomicDispatchStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Immediate,
    Deferred,
}

type ImmediateFn = fn(&GraphicsContext, &Args) -> BridgeResult<Value>;
type EncodeFn = fn(&Args, &Encoding) -> BridgeResult<Op>;

/// What deferred encoders need besides the call's arguments.
#[derive(Clone)]
pub(crate) struct Encoding {
    pub allocator: Arc<dyn HostAllocator>,
    pub limits: Limits,
}

#[derive(Clone, Copy)]
enum Handler {
    Immediate(ImmediateFn),
    Deferred(EncodeFn),
}

/// One entry of the host function table.
#[derive(Clone, Copy)]
pub struct OpSpec {
    pub name: &'static str,
    handler: Handler,
    /// Argument naming a script array filled from the result on resolve.
    pub output: Option<&'static str>,
}

impl OpSpec {
    const fn immediate(name: &'static str, f: ImmediateFn) -> Self {
        Self { name, handler: Handler::Immediate(f), output: None }
    }

    const fn deferred(name: &'static str, f: EncodeFn) -> Self {
        Self { name, handler: Handler::Deferred(f), output: None }
    }

    const fn deferred_into(name: &'static str, f: EncodeFn, output: &'static str) -> Self {
        Self { name, handler: Handler::Deferred(f), output: Some(output) }
    }

    pub fn class(&self) -> OpClass {
        match self.handler {
            Handler::Immediate(_) => OpClass::Immediate,
            Handler::Deferred(_) => OpClass::Deferred,
        }
    }
}

pub static OP_TABLE: &[OpSpec] = &[
    // Immediate
    OpSpec::immediate("getParameter", get_parameter),
    OpSpec::immediate("isContextLost", is_context_lost),
    OpSpec::immediate("getContextAttributes", get_context_attributes),
    OpSpec::immediate("drawingBufferSize", drawing_buffer_size),
    // State
    OpSpec::deferred("viewport", |a, _| Ok(Op::Viewport(rect(a)?))),
    OpSpec::deferred("scissor", |a, _| Ok(Op::Scissor(rect(a)?))),
    OpSpec::deferred("enable", |a, _| capability(a, true)),
    OpSpec::deferred("disable", |a, _| capability(a, false)),
    OpSpec::deferred("clearColor", clear_color),
    OpSpec::deferred("clear", |a, _| Ok(Op::Clear(ClearMask::try_from(a.uint("mask")?)?))),
    // Buffers
    OpSpec::deferred("createBuffer", |_, _| Ok(Op::CreateBuffer)),
    OpSpec::deferred("bindBuffer", bind_buffer),
    OpSpec::deferred("bufferData", buffer_data),
    OpSpec::deferred("bufferSubData", buffer_sub_data),
    OpSpec::deferred("deleteBuffer", |a, _| Ok(Op::DeleteBuffer(name(a, "buffer")?))),
    // Textures
    OpSpec::deferred("createTexture", |_, _| Ok(Op::CreateTexture)),
    OpSpec::deferred("bindTexture", bind_texture),
    OpSpec::deferred("texImage2D", tex_image_2d),
    OpSpec::deferred("deleteTexture", |a, _| Ok(Op::DeleteTexture(name(a, "texture")?))),
    // Shaders and programs
    OpSpec::deferred("createShader", |a, _| Ok(Op::CreateShader(ShaderKind::try_from(a.uint("type")?)?))),
    OpSpec::deferred("shaderSource", shader_source),
    OpSpec::deferred("compileShader", |a, _| Ok(Op::CompileShader(name(a, "shader")?))),
    OpSpec::deferred("attachShader", |a, _| {
        Ok(Op::AttachShader { program: name(a, "program")?, shader: name(a, "shader")? })
    }),
    OpSpec::deferred("createProgram", |_, _| Ok(Op::CreateProgram)),
    OpSpec::deferred("linkProgram", |a, _| Ok(Op::LinkProgram(name(a, "program")?))),
    OpSpec::deferred("useProgram", |a, _| Ok(Op::UseProgram(opt_name(a, "program")?))),
    OpSpec::deferred("deleteProgram", |a, _| Ok(Op::DeleteProgram(name(a, "program")?))),
    // Drawing
    OpSpec::deferred("drawArrays", draw_arrays),
    OpSpec::deferred("drawElements", draw_elements),
    // Read-back and sync
    OpSpec::deferred_into("readPixels", read_pixels, "pixels"),
    OpSpec::deferred("flush", |_, _| Ok(Op::Flush)),
    OpSpec::deferred("finish", |_, _| Ok(Op::Finish)),
    OpSpec::deferred("getError", |_, _| Ok(Op::GetError)),
];

pub fn lookup(name: &str) -> Option<&'static OpSpec> {
    OP_TABLE.iter().find(|spec| spec.name == name)
}

// ───────────────────────────────────────────────────────────────────
// Immediate handlers
// ───────────────────────────────────────────────────────────────────

fn get_parameter(ctx: &GraphicsContext, args: &Args) -> BridgeResult<Value> {
    ctx.state().parameter(args.uint("pname")?)
}

fn is_context_lost(ctx: &GraphicsContext, _: &Args) -> BridgeResult<Value> {
    Ok(Value::Bool(ctx.is_lost() || ctx.is_disposed()))
}

fn get_context_attributes(ctx: &GraphicsContext, _: &Args) -> BridgeResult<Value> {
    Ok(Value::Attributes(ctx.attributes().clone()))
}

fn drawing_buffer_size(ctx: &GraphicsContext, _: &Args) -> BridgeResult<Value> {
    let state = ctx.state();
    Ok(Value::Ints(vec![
        state.drawing_buffer_width.into(),
        state.drawing_buffer_height.into(),
    ]))
}

// ───────────────────────────────────────────────────────────────────
// Encoders
// ───────────────────────────────────────────────────────────────────

fn rect(args: &Args) -> BridgeResult<Rect> {
    Ok(Rect::new(
        args.int32("x")?,
        args.int32("y")?,
        args.uint("width")?,
        args.uint("height")?,
    ))
}

/// A GL object name; 0 is the null object and not accepted here.
fn name(args: &Args, arg: &str) -> BridgeResult<ObjectName> {
    opt_name(args, arg)?.ok_or_else(|| BridgeError::invalid_argument(format!("argument `{arg}` must name an object")))
}

/// A GL object name where null or 0 means "unbind".
fn opt_name(args: &Args, arg: &str) -> BridgeResult<Option<ObjectName>> {
    Ok(args.opt_uint(arg)?.filter(|n| *n != 0))
}

fn expect_enum(args: &Args, arg: &str, expected: u32) -> BridgeResult<()> {
    let value = args.uint(arg)?;
    if value != expected {
        return Err(BridgeError::invalid_argument(format!(
            "argument `{arg}` must be 0x{expected:04X}, got 0x{value:04X}"
        )));
    }
    Ok(())
}

fn copy_buffer(handle: &ScriptBuffer, env: &Encoding) -> BridgeResult<OwnedBuffer> {
    let view = as_native_view(handle)?;
    env.limits.buffer_bytes(view.byte_len())?;
    Ok(view.copy_out(&env.allocator))
}

/// Validate a Uint8 pixel array holding at least `needed` bytes.
fn check_pixels(handle: &ScriptBuffer, needed: usize) -> BridgeResult<()> {
    let view = as_native_view(handle)?;
    if !view.element().is_bytes() {
        return Err(BridgeError::invalid_argument(format!(
            "pixels must be a Uint8Array, got {}",
            view.element().name()
        )));
    }
    if view.byte_len() < needed {
        return Err(BridgeError::invalid_argument(format!(
            "pixels holds {} bytes, {needed} required",
            view.byte_len()
        )));
    }
    Ok(())
}

fn capability(args: &Args, enabled: bool) -> BridgeResult<Op> {
    let cap = Capability::try_from(args.uint("cap")?)?;
    Ok(Op::SetCapability { cap, enabled })
}

fn clear_color(args: &Args, _: &Encoding) -> BridgeResult<Op> {
    let mut rgba = [0.0f32; 4];
    for (slot, arg) in rgba.iter_mut().zip(["red", "green", "blue", "alpha"]) {
        *slot = args.float(arg)? as f32;
    }
    Ok(Op::ClearColor(rgba))
}

fn bind_buffer(args: &Args, _: &Encoding) -> BridgeResult<Op> {
    Ok(Op::BindBuffer {
        target: BufferTarget::try_from(args.uint("target")?)?,
        buffer: opt_name(args, "buffer")?,
    })
}

fn buffer_data(args: &Args, env: &Encoding) -> BridgeResult<Op> {
    let target = BufferTarget::try_from(args.uint("target")?)?;
    let usage = BufferUsage::try_from(args.uint("usage")?)?;
    let data = match (args.opt_buffer("data")?, args.opt_uint("size")?) {
        (Some(_), Some(_)) => {
            return Err(BridgeError::invalid_argument("bufferData takes `data` or `size`, not both"))
        }
        (Some(handle), None) => BufferPayload::Bytes(copy_buffer(handle, env)?),
        (None, Some(size)) => BufferPayload::Size(env.limits.buffer_bytes(size as usize)?),
        (None, None) => return Err(BridgeError::invalid_argument("bufferData needs `data` or `size`")),
    };
    Ok(Op::BufferData { target, data, usage })
}

fn buffer_sub_data(args: &Args, env: &Encoding) -> BridgeResult<Op> {
    Ok(Op::BufferSubData {
        target: BufferTarget::try_from(args.uint("target")?)?,
        offset: args.uint("offset")? as usize,
        data: copy_buffer(args.buffer("data")?, env)?,
    })
}

fn bind_texture(args: &Args, _: &Encoding) -> BridgeResult<Op> {
    expect_enum(args, "target", gl::TEXTURE_2D)?;
    Ok(Op::BindTexture(opt_name(args, "texture")?))
}

fn tex_image_2d(args: &Args, env: &Encoding) -> BridgeResult<Op> {
    expect_enum(args, "target", gl::TEXTURE_2D)?;
    expect_enum(args, "format", gl::RGBA)?;
    expect_enum(args, "type", gl::UNSIGNED_BYTE)?;
    let width = args.uint("width")?;
    let height = args.uint("height")?;
    let needed = env.limits.image_bytes(width, height)?;
    let data = match args.opt_buffer("pixels")? {
        Some(handle) => {
            check_pixels(handle, needed)?;
            Some(as_native_view(handle)?.copy_range_out(&env.allocator, 0, needed)?)
        }
        None => None,
    };
    Ok(Op::TexImage2D { width, height, data })
}

fn shader_source(args: &Args, _: &Encoding) -> BridgeResult<Op> {
    Ok(Op::ShaderSource {
        shader: name(args, "shader")?,
        source: args.str("source")?.to_string(),
    })
}

fn draw_arrays(args: &Args, _: &Encoding) -> BridgeResult<Op> {
    Ok(Op::DrawArrays {
        mode: DrawMode::try_from(args.uint("mode")?)?,
        first: args.uint("first")?,
        count: args.uint("count")?,
    })
}

fn draw_elements(args: &Args, _: &Encoding) -> BridgeResult<Op> {
    Ok(Op::DrawElements {
        mode: DrawMode::try_from(args.uint("mode")?)?,
        count: args.uint("count")?,
        index_type: IndexType::try_from(args.uint("type")?)?,
        offset: args.uint("offset")? as usize,
    })
}

/// The read result comes back as an owned copy. `pixels`, when given, is
/// checked here and filled from that copy on the caller's side; the queued
/// command never references it.
fn read_pixels(args: &Args, env: &Encoding) -> BridgeResult<Op> {
    let rect = rect(args)?;
    expect_enum(args, "format", gl::RGBA)?;
    expect_enum(args, "type", gl::UNSIGNED_BYTE)?;
    let needed = env.limits.image_bytes(rect.width, rect.height)?;
    if let Some(handle) = args.opt_buffer("pixels")? {
        check_pixels(handle, needed)?;
    }
    Ok(Op::ReadPixels(rect))
}

// ───────────────────────────────────────────────────────────────────
// Surface
// ───────────────────────────────────────────────────────────────────

/// Outcome of a host call.
#[derive(Debug)]
pub enum Invocation {
    Immediate(Value),
    Pending(Pending<Value>),
}

impl Invocation {
    pub fn is_immediate(&self) -> bool {
        matches!(self, Invocation::Immediate(_))
    }

    pub fn into_pending(self) -> Option<Pending<Value>> {
        match self {
            Invocation::Pending(p) => Some(p),
            Invocation::Immediate(_) => None,
        }
    }

    /// Await the value whichever way it is delivered.
    pub async fn value(self) -> BridgeResult<Value> {
        match self {
            Invocation::Immediate(v) => Ok(v),
            Invocation::Pending(p) => p.await,
        }
    }
}

/// Entry point for script calls. Cheap to clone.
#[derive(Clone)]
pub struct HostApi {
    registry: Arc<ContextRegistry>,
    stats: Arc<AtomicDispatchStats>,
    encoding: Encoding,
}

impl HostApi {
    pub(crate) fn new(
        registry: Arc<ContextRegistry>,
        stats: Arc<AtomicDispatchStats>,
        allocator: Arc<dyn HostAllocator>,
        limits: Limits,
    ) -> Self {
        Self {
            registry,
            stats,
            encoding: Encoding { allocator, limits },
        }
    }

    /// `invoke(contextId, opName, args)`.
    pub fn invoke(&self, context: ContextId, op: &str, args: &Args) -> BridgeResult<Invocation> {
        let spec = lookup(op);
        if spec.is_some_and(|s| s.class() == OpClass::Deferred) && on_render_thread() {
            return Err(BridgeError::ReentrantCall);
        }
        let spec = spec.ok_or_else(|| BridgeError::invalid_argument(format!("unknown operation `{op}`")))?;
        let ctx = self.registry.get(context)?;

        match spec.handler {
            Handler::Immediate(answer) => {
                let value = answer(&ctx, args)?;
                AtomicDispatchStats::bump(&self.stats.immediate);
                Ok(Invocation::Immediate(value))
            }
            Handler::Deferred(encode) => {
                if ctx.is_disposed() || ctx.is_lost() {
                    return Err(BridgeError::ContextLost(context));
                }
                let command = encode(args, &self.encoding)?;
                let destination = match spec.output {
                    Some(arg) => args.opt_buffer(arg)?.cloned(),
                    None => None,
                };
                let mut pending = ctx.submit(command)?;
                AtomicDispatchStats::bump(&self.stats.submitted);
                if let Some(destination) = destination {
                    pending = pending.and_then(move |value| {
                        if let Value::Bytes(owned) = &value {
                            write_back(owned, &destination)?;
                        }
                        Ok(value)
                    });
                }
                Ok(Invocation::Pending(pending))
            }
        }
    }

    /// Same as [`invoke`](Self::invoke) with JSON arguments.
    pub fn invoke_json(&self, context: ContextId, op: &str, args: &serde_json::Value) -> BridgeResult<Invocation> {
        self.invoke(context, op, &Args::from_json(args)?)
    }
}
