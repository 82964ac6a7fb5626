//! Size limits enforced before a command is queued.
//!
//! Image dimensions and buffer sizes come straight from script code, so the
//! byte counts derived from them are computed with checked arithmetic and
//! capped before anything is allocated on the render thread.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Bytes per RGBA8 pixel.
pub const RGBA8_BYTES: usize = 4;

/// Byte length of a `width` x `height` RGBA8 image, `None` on overflow.
pub fn rgba8_len(width: u32, height: u32) -> Option<usize> {
    (width as usize).checked_mul(height as usize)?.checked_mul(RGBA8_BYTES)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Largest width or height accepted for textures and read-backs.
    pub max_texture_size: u32,
    /// Largest byte count a single command may allocate.
    pub max_buffer_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_texture_size: 16_384,
            max_buffer_bytes: 256 << 20,
        }
    }
}

impl Limits {
    /// Byte length of an RGBA8 image of the given size, if within limits.
    pub fn image_bytes(&self, width: u32, height: u32) -> BridgeResult<usize> {
        if width > self.max_texture_size || height > self.max_texture_size {
            return Err(BridgeError::invalid_argument(format!(
                "{width}x{height} exceeds the maximum size of {}",
                self.max_texture_size
            )));
        }
        rgba8_len(width, height)
            .filter(|len| *len <= self.max_buffer_bytes)
            .ok_or_else(|| {
                BridgeError::invalid_argument(format!(
                    "{width}x{height} pixels exceed {} bytes",
                    self.max_buffer_bytes
                ))
            })
    }

    pub fn buffer_bytes(&self, byte_len: usize) -> BridgeResult<usize> {
        if byte_len > self.max_buffer_bytes {
            return Err(BridgeError::invalid_argument(format!(
                "{byte_len} bytes exceed the maximum of {}",
                self.max_buffer_bytes
            )));
        }
        Ok(byte_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgba8_len_overflow() {
        assert_eq!(rgba8_len(2, 3), Some(24));
        assert_eq!(rgba8_len(0, u32::MAX), Some(0));
        if usize::BITS == 64 {
            assert_eq!(rgba8_len(u32::MAX, u32::MAX), None);
        }
    }

    #[test]
    fn test_image_limits() {
        let limits = Limits { max_texture_size: 64, max_buffer_bytes: 4096 };
        assert_eq!(limits.image_bytes(32, 32).unwrap(), 4096);
        assert!(matches!(limits.image_bytes(65, 1), Err(BridgeError::InvalidArgument(_))));
        assert!(matches!(limits.image_bytes(64, 64), Err(BridgeError::InvalidArgument(_))));
        assert!(limits.image_bytes(0x8000_0000, 0x8000_0000).is_err());
    }

    #[test]
    fn test_buffer_limit() {
        let limits = Limits::default();
        assert_eq!(limits.buffer_bytes(1024).unwrap(), 1024);
        assert!(limits.buffer_bytes(usize::MAX).is_err());
    }
}
