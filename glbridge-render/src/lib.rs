//! # glbridge-render
//!
//! Native side of the graphics bridge.
//!
//! ```text
//!  SurfaceSource ──open() on render thread──► Box<dyn GraphicsDevice>
//!        │                                          │
//!        ├── SoftwareSurface ──► SoftwareDevice     ├── execute(Op) -> Value
//!        └── WgpuSurface     ──► WgpuDevice         ├── present()
//!                                                   └── release()
//! ```
//!
//! ## Modules
//!
//! - [`device`]: the `GraphicsDevice` / `SurfaceSource` seam
//! - [`software`]: CPU reference device and test probe
//! - [`wgpu_device`]: offscreen GPU device

pub mod device;
pub mod software;
pub mod wgpu_device;

pub use device::{GraphicsDevice, SurfaceSource};
pub use software::{DeviceProbe, SoftwareDevice, SoftwareSurface};
pub use wgpu_device::{WgpuDevice, WgpuSetupError, WgpuSurface};
