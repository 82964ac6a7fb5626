//! Cached mirror of a context's GPU state.
//!
//! The render thread computes the next state from (current state, op) after
//! the native call succeeded and publishes it; the immediate path on the
//! calling thread only ever reads a published snapshot.

use serde::Serialize;

use crate::error::{BridgeError, BridgeResult};
use crate::ids::ObjectName;
use crate::op::{gl, BufferTarget, Capability, Op, Rect, Value};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextState {
    pub drawing_buffer_width: u32,
    pub drawing_buffer_height: u32,
    pub viewport: Rect,
    pub scissor_box: Rect,
    pub scissor_test: bool,
    pub blend: bool,
    pub depth_test: bool,
    pub cull_face: bool,
    pub clear_color: [f32; 4],
    pub array_buffer: Option<ObjectName>,
    pub element_array_buffer: Option<ObjectName>,
    pub texture_2d: Option<ObjectName>,
    pub current_program: Option<ObjectName>,
}

impl ContextState {
    /// Initial GL state for a drawing buffer of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        let full = Rect::new(0, 0, width, height);
        Self {
            drawing_buffer_width: width,
            drawing_buffer_height: height,
            viewport: full,
            scissor_box: full,
            scissor_test: false,
            blend: false,
            depth_test: false,
            cull_face: false,
            clear_color: [0.0; 4],
            array_buffer: None,
            element_array_buffer: None,
            texture_2d: None,
            current_program: None,
        }
    }

    pub fn capability(&self, cap: Capability) -> bool {
        match cap {
            Capability::Blend => self.blend,
            Capability::CullFace => self.cull_face,
            Capability::DepthTest => self.depth_test,
            Capability::ScissorTest => self.scissor_test,
        }
    }

    pub fn buffer_binding(&self, target: BufferTarget) -> Option<ObjectName> {
        match target {
            BufferTarget::Array => self.array_buffer,
            BufferTarget::ElementArray => self.element_array_buffer,
        }
    }

    /// State after `op` succeeded natively with `result`.
    ///
    /// Returns `None` when the op does not touch cached state.
    pub fn apply(&self, op: &Op, _result: &Value) -> Option<ContextState> {
        let mut next = self.clone();
        match op {
            Op::Viewport(rect) => next.viewport = *rect,
            Op::Scissor(rect) => next.scissor_box = *rect,
            Op::SetCapability { cap, enabled } => match cap {
                Capability::Blend => next.blend = *enabled,
                Capability::CullFace => next.cull_face = *enabled,
                Capability::DepthTest => next.depth_test = *enabled,
                Capability::ScissorTest => next.scissor_test = *enabled,
            },
            Op::ClearColor(rgba) => next.clear_color = *rgba,
            Op::BindBuffer { target, buffer } => match target {
                BufferTarget::Array => next.array_buffer = *buffer,
                BufferTarget::ElementArray => next.element_array_buffer = *buffer,
            },
            Op::DeleteBuffer(name) => {
                if next.array_buffer == Some(*name) {
                    next.array_buffer = None;
                }
                if next.element_array_buffer == Some(*name) {
                    next.element_array_buffer = None;
                }
            }
            Op::BindTexture(texture) => next.texture_2d = *texture,
            Op::DeleteTexture(name) => {
                if next.texture_2d == Some(*name) {
                    next.texture_2d = None;
                }
            }
            Op::UseProgram(program) => next.current_program = *program,
            _ => return None,
        }
        (next != *self).then_some(next)
    }

    /// Answer `getParameter(pname)` from cached state.
    pub fn parameter(&self, pname: u32) -> BridgeResult<Value> {
        let name = |n: Option<ObjectName>| n.map_or(Value::None, Value::Name);
        Ok(match pname {
            gl::VIEWPORT => Value::Ints(self.viewport.to_ints()),
            gl::SCISSOR_BOX => Value::Ints(self.scissor_box.to_ints()),
            gl::COLOR_CLEAR_VALUE => Value::Floats(self.clear_color.to_vec()),
            gl::SCISSOR_TEST => Value::Bool(self.scissor_test),
            gl::BLEND => Value::Bool(self.blend),
            gl::DEPTH_TEST => Value::Bool(self.depth_test),
            gl::CULL_FACE => Value::Bool(self.cull_face),
            gl::ARRAY_BUFFER_BINDING => name(self.array_buffer),
            gl::ELEMENT_ARRAY_BUFFER_BINDING => name(self.element_array_buffer),
            gl::TEXTURE_BINDING_2D => name(self.texture_2d),
            gl::CURRENT_PROGRAM => name(self.current_program),
            other => {
                return Err(BridgeError::invalid_argument(format!(
                    "parameter 0x{other:04X} is not answerable from cached state"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_covers_drawing_buffer() {
        let state = ContextState::new(300, 150);
        assert_eq!(state.viewport, Rect::new(0, 0, 300, 150));
        assert_eq!(state.scissor_box, state.viewport);
        assert_eq!(
            state.parameter(gl::VIEWPORT).unwrap(),
            Value::Ints(vec![0, 0, 300, 150])
        );
    }

    #[test]
    fn test_apply_viewport() {
        let state = ContextState::new(100, 100);
        let next = state
            .apply(&Op::Viewport(Rect::new(10, 10, 50, 50)), &Value::None)
            .unwrap();
        assert_eq!(next.viewport, Rect::new(10, 10, 50, 50));
        // Source state is untouched
        assert_eq!(state.viewport, Rect::new(0, 0, 100, 100));
    }

    #[test]
    fn test_apply_is_none_for_draws_and_noop_changes() {
        let state = ContextState::new(10, 10);
        assert!(state.apply(&Op::Flush, &Value::None).is_none());
        assert!(state
            .apply(&Op::Viewport(Rect::new(0, 0, 10, 10)), &Value::None)
            .is_none());
    }

    #[test]
    fn test_delete_unbinds() {
        let mut state = ContextState::new(10, 10);
        state.array_buffer = Some(3);
        state.element_array_buffer = Some(3);
        let next = state.apply(&Op::DeleteBuffer(3), &Value::None).unwrap();
        assert_eq!(next.array_buffer, None);
        assert_eq!(next.element_array_buffer, None);
        assert_eq!(next.parameter(gl::ARRAY_BUFFER_BINDING).unwrap(), Value::None);
    }

    #[test]
    fn test_capabilities() {
        let state = ContextState::new(10, 10);
        let op = Op::SetCapability { cap: Capability::ScissorTest, enabled: true };
        let next = state.apply(&op, &Value::None).unwrap();
        assert!(next.capability(Capability::ScissorTest));
        assert_eq!(next.parameter(gl::SCISSOR_TEST).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_unknown_parameter() {
        let state = ContextState::new(10, 10);
        assert!(matches!(
            state.parameter(0xFFFF),
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
