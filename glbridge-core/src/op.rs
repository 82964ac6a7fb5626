//! Encoded graphics operations and their results.
//!
//! An [`Op`] is the validated, self-contained payload of a deferred
//! command: every enum has been decoded and every buffer argument has been
//! copied into an [`OwnedBuffer`], so nothing in it borrows script memory.

use serde::{Deserialize, Serialize};

use crate::attributes::ContextAttributes;
use crate::buffer::OwnedBuffer;
use crate::error::{BridgeError, BridgeResult};
use crate::ids::ObjectName;

/// GL enum values as script code passes them.
pub mod gl {
    // Clear bits
    pub const DEPTH_BUFFER_BIT: u32 = 0x0100;
    pub const STENCIL_BUFFER_BIT: u32 = 0x0400;
    pub const COLOR_BUFFER_BIT: u32 = 0x4000;

    // Draw modes
    pub const POINTS: u32 = 0x0000;
    pub const LINES: u32 = 0x0001;
    pub const LINE_LOOP: u32 = 0x0002;
    pub const LINE_STRIP: u32 = 0x0003;
    pub const TRIANGLES: u32 = 0x0004;
    pub const TRIANGLE_STRIP: u32 = 0x0005;
    pub const TRIANGLE_FAN: u32 = 0x0006;

    // Capabilities
    pub const CULL_FACE: u32 = 0x0B44;
    pub const DEPTH_TEST: u32 = 0x0B71;
    pub const BLEND: u32 = 0x0BE2;
    pub const SCISSOR_TEST: u32 = 0x0C11;

    // Buffers
    pub const ARRAY_BUFFER: u32 = 0x8892;
    pub const ELEMENT_ARRAY_BUFFER: u32 = 0x8893;
    pub const STREAM_DRAW: u32 = 0x88E0;
    pub const STATIC_DRAW: u32 = 0x88E4;
    pub const DYNAMIC_DRAW: u32 = 0x88E8;

    // Types and formats
    pub const UNSIGNED_BYTE: u32 = 0x1401;
    pub const UNSIGNED_SHORT: u32 = 0x1403;
    pub const UNSIGNED_INT: u32 = 0x1405;
    pub const RGBA: u32 = 0x1908;

    // Textures
    pub const TEXTURE_2D: u32 = 0x0DE1;

    // Shaders
    pub const FRAGMENT_SHADER: u32 = 0x8B30;
    pub const VERTEX_SHADER: u32 = 0x8B31;

    // getParameter names
    pub const VIEWPORT: u32 = 0x0BA2;
    pub const SCISSOR_BOX: u32 = 0x0C10;
    pub const COLOR_CLEAR_VALUE: u32 = 0x0C22;
    pub const TEXTURE_BINDING_2D: u32 = 0x8069;
    pub const ARRAY_BUFFER_BINDING: u32 = 0x8894;
    pub const ELEMENT_ARRAY_BUFFER_BINDING: u32 = 0x8895;
    pub const CURRENT_PROGRAM: u32 = 0x8B8D;
}

fn unknown_enum(what: &str, value: u32) -> BridgeError {
    BridgeError::invalid_argument(format!("unknown {what} 0x{value:04X}"))
}

/// Integer rectangle in drawing-buffer coordinates (origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn to_ints(self) -> Vec<i64> {
        vec![
            self.x.into(),
            self.y.into(),
            self.width.into(),
            self.height.into(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Blend,
    CullFace,
    DepthTest,
    ScissorTest,
}

impl TryFrom<u32> for Capability {
    type Error = BridgeError;

    fn try_from(value: u32) -> BridgeResult<Self> {
        match value {
            gl::BLEND => Ok(Capability::Blend),
            gl::CULL_FACE => Ok(Capability::CullFace),
            gl::DEPTH_TEST => Ok(Capability::DepthTest),
            gl::SCISSOR_TEST => Ok(Capability::ScissorTest),
            other => Err(unknown_enum("capability", other)),
        }
    }
}

/// Bitmask of buffers to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearMask(u32);

impl ClearMask {
    pub const COLOR: ClearMask = ClearMask(gl::COLOR_BUFFER_BIT);
    pub const DEPTH: ClearMask = ClearMask(gl::DEPTH_BUFFER_BIT);
    pub const STENCIL: ClearMask = ClearMask(gl::STENCIL_BUFFER_BIT);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ClearMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl TryFrom<u32> for ClearMask {
    type Error = BridgeError;

    fn try_from(value: u32) -> BridgeResult<Self> {
        let known = gl::COLOR_BUFFER_BIT | gl::DEPTH_BUFFER_BIT | gl::STENCIL_BUFFER_BIT;
        if value & !known != 0 {
            return Err(BridgeError::invalid_argument(format!(
                "clear mask 0x{value:04X} has unknown bits"
            )));
        }
        Ok(ClearMask(value))
    }
}

impl std::ops::BitOr for ClearMask {
    type Output = ClearMask;

    fn bitor(self, rhs: Self) -> Self {
        ClearMask(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    Array,
    ElementArray,
}

impl TryFrom<u32> for BufferTarget {
    type Error = BridgeError;

    fn try_from(value: u32) -> BridgeResult<Self> {
        match value {
            gl::ARRAY_BUFFER => Ok(BufferTarget::Array),
            gl::ELEMENT_ARRAY_BUFFER => Ok(BufferTarget::ElementArray),
            other => Err(unknown_enum("buffer target", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Static,
    Dynamic,
    Stream,
}

impl TryFrom<u32> for BufferUsage {
    type Error = BridgeError;

    fn try_from(value: u32) -> BridgeResult<Self> {
        match value {
            gl::STATIC_DRAW => Ok(BufferUsage::Static),
            gl::DYNAMIC_DRAW => Ok(BufferUsage::Dynamic),
            gl::STREAM_DRAW => Ok(BufferUsage::Stream),
            other => Err(unknown_enum("buffer usage", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

impl TryFrom<u32> for DrawMode {
    type Error = BridgeError;

    fn try_from(value: u32) -> BridgeResult<Self> {
        match value {
            gl::POINTS => Ok(DrawMode::Points),
            gl::LINES => Ok(DrawMode::Lines),
            gl::LINE_LOOP => Ok(DrawMode::LineLoop),
            gl::LINE_STRIP => Ok(DrawMode::LineStrip),
            gl::TRIANGLES => Ok(DrawMode::Triangles),
            gl::TRIANGLE_STRIP => Ok(DrawMode::TriangleStrip),
            gl::TRIANGLE_FAN => Ok(DrawMode::TriangleFan),
            other => Err(unknown_enum("draw mode", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U8,
    U16,
    U32,
}

impl IndexType {
    pub const fn size(self) -> usize {
        match self {
            IndexType::U8 => 1,
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

impl TryFrom<u32> for IndexType {
    type Error = BridgeError;

    fn try_from(value: u32) -> BridgeResult<Self> {
        match value {
            gl::UNSIGNED_BYTE => Ok(IndexType::U8),
            gl::UNSIGNED_SHORT => Ok(IndexType::U16),
            gl::UNSIGNED_INT => Ok(IndexType::U32),
            other => Err(unknown_enum("index type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl TryFrom<u32> for ShaderKind {
    type Error = BridgeError;

    fn try_from(value: u32) -> BridgeResult<Self> {
        match value {
            gl::VERTEX_SHADER => Ok(ShaderKind::Vertex),
            gl::FRAGMENT_SHADER => Ok(ShaderKind::Fragment),
            other => Err(unknown_enum("shader type", other)),
        }
    }
}

/// Contents for `bufferData`: a size to zero-allocate or uploaded bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferPayload {
    Size(usize),
    Bytes(OwnedBuffer),
}

impl BufferPayload {
    pub fn byte_len(&self) -> usize {
        match self {
            BufferPayload::Size(n) => *n,
            BufferPayload::Bytes(b) => b.byte_len(),
        }
    }
}

/// A validated deferred operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Viewport(Rect),
    Scissor(Rect),
    SetCapability { cap: Capability, enabled: bool },
    ClearColor([f32; 4]),
    Clear(ClearMask),
    CreateBuffer,
    BindBuffer { target: BufferTarget, buffer: Option<ObjectName> },
    BufferData { target: BufferTarget, data: BufferPayload, usage: BufferUsage },
    BufferSubData { target: BufferTarget, offset: usize, data: OwnedBuffer },
    DeleteBuffer(ObjectName),
    CreateTexture,
    BindTexture(Option<ObjectName>),
    TexImage2D { width: u32, height: u32, data: Option<OwnedBuffer> },
    DeleteTexture(ObjectName),
    CreateShader(ShaderKind),
    ShaderSource { shader: ObjectName, source: String },
    CompileShader(ObjectName),
    AttachShader { program: ObjectName, shader: ObjectName },
    CreateProgram,
    LinkProgram(ObjectName),
    UseProgram(Option<ObjectName>),
    DeleteProgram(ObjectName),
    DrawArrays { mode: DrawMode, first: u32, count: u32 },
    DrawElements { mode: DrawMode, count: u32, index_type: IndexType, offset: usize },
    ReadPixels(Rect),
    Flush,
    Finish,
    GetError,
}

impl Op {
    /// Script-facing operation name.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Viewport(_) => "viewport",
            Op::Scissor(_) => "scissor",
            Op::SetCapability { enabled: true, .. } => "enable",
            Op::SetCapability { enabled: false, .. } => "disable",
            Op::ClearColor(_) => "clearColor",
            Op::Clear(_) => "clear",
            Op::CreateBuffer => "createBuffer",
            Op::BindBuffer { .. } => "bindBuffer",
            Op::BufferData { .. } => "bufferData",
            Op::BufferSubData { .. } => "bufferSubData",
            Op::DeleteBuffer(_) => "deleteBuffer",
            Op::CreateTexture => "createTexture",
            Op::BindTexture(_) => "bindTexture",
            Op::TexImage2D { .. } => "texImage2D",
            Op::DeleteTexture(_) => "deleteTexture",
            Op::CreateShader(_) => "createShader",
            Op::ShaderSource { .. } => "shaderSource",
            Op::CompileShader(_) => "compileShader",
            Op::AttachShader { .. } => "attachShader",
            Op::CreateProgram => "createProgram",
            Op::LinkProgram(_) => "linkProgram",
            Op::UseProgram(_) => "useProgram",
            Op::DeleteProgram(_) => "deleteProgram",
            Op::DrawArrays { .. } => "drawArrays",
            Op::DrawElements { .. } => "drawElements",
            Op::ReadPixels(_) => "readPixels",
            Op::Flush => "flush",
            Op::Finish => "finish",
            Op::GetError => "getError",
        }
    }
}

/// Result of a host operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    /// Name of a freshly created GL object.
    Name(ObjectName),
    /// Owned copy of native bytes (e.g. `readPixels`).
    Bytes(OwnedBuffer),
    Attributes(ContextAttributes),
}

impl Value {
    pub fn as_name(&self) -> Option<ObjectName> {
        match self {
            Value::Name(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<OwnedBuffer> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_decoding() {
        assert_eq!(BufferTarget::try_from(gl::ARRAY_BUFFER).unwrap(), BufferTarget::Array);
        assert_eq!(DrawMode::try_from(gl::TRIANGLES).unwrap(), DrawMode::Triangles);
        assert_eq!(IndexType::try_from(gl::UNSIGNED_SHORT).unwrap().size(), 2);
        assert!(matches!(
            Capability::try_from(0x1234),
            Err(BridgeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_clear_mask() {
        let mask = ClearMask::try_from(gl::COLOR_BUFFER_BIT | gl::DEPTH_BUFFER_BIT).unwrap();
        assert!(mask.contains(ClearMask::COLOR));
        assert!(!mask.contains(ClearMask::STENCIL));
        assert!(ClearMask::try_from(0x0001).is_err());
        assert_eq!((ClearMask::COLOR | ClearMask::STENCIL).bits(), 0x4400);
    }

    #[test]
    fn test_op_names() {
        let enable = Op::SetCapability { cap: Capability::ScissorTest, enabled: true };
        assert_eq!(enable.name(), "enable");
        assert_eq!(Op::ReadPixels(Rect::default()).name(), "readPixels");
    }
}
