//! PlayStation GPU hardware renderer.
//!
//! Reproduces the console GPU's pixel semantics (dithering, mask bit,
//! semi-transparency, texture windows) on a host rasterizer at integer
//! multiples of the native resolution, while keeping a word-exact mirror of
//! the 1 MiB VRAM for the emulated CPU:
//!
//! - **VRAM**: 1024x512 16-bit words, 5:5:5:1 with the mask bit in bit 15
//! - **GpuHw**: state synchronisation between the CPU shadow and the GPU copy
//! - **Backends**: a CPU implementation of the hardware pipeline, and OpenGL
//!   behind the `opengl` feature
//! - **Shaders**: generated GLSL for every pipeline variant, cached on disk
//! - **Display**: 15/24-bit scanout, interlacing, downsampling
//! - **Presentation**: frame resource ring and an optional present thread
//!
//! ```text
//! CPU (read/write/fill/copy, draw) -> GpuHw -> GpuBackend -> HostDisplay
//!                                      |
//!                                      +-> Vram shadow (lazy readback)
//! ```

pub mod backend;
pub mod batch;
pub mod display;
pub mod frame_ring;
pub mod gpu_hw;
pub mod present;
pub mod programs;
mod rasterizer;
pub mod render_pass;
pub mod settings;
pub mod shader_cache;
pub mod shadergen;
pub mod snapshot;
pub mod stream_buffer;
pub mod types;
pub mod vram;

use emu_core::host_display::{DisplayError, RenderApi};
use thiserror::Error;

pub use backend::software::SoftwareBackend;
pub use backend::{Capabilities, GpuBackend, VramWritePath};
pub use gpu_hw::GpuHw;
pub use present::{PresentSink, PresentStatus, Presenter};
pub use settings::GpuSettings;
pub use snapshot::VramSnapshot;
pub use vram::{Rect, Vram, VRAM_HEIGHT, VRAM_WIDTH};

#[cfg(feature = "opengl")]
pub use backend::opengl::OpenGLBackend;

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Host display uses {found:?}, renderer needs {expected}")]
    IncompatibleRenderApi { expected: &'static str, found: RenderApi },

    #[error("Missing required capability: {0}")]
    MissingCapability(String),

    #[error("Failed to create {what}: {reason}")]
    ResourceCreation { what: String, reason: String },

    #[error("Failed to compile {program}: {log}")]
    ShaderCompile { program: String, log: String },

    #[error("Invalid VRAM snapshot: {0}")]
    InvalidState(String),

    #[error("Host display error: {0}")]
    Display(#[from] DisplayError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GpuError {
    pub(crate) fn resource(what: impl Into<String>, reason: impl Into<String>) -> Self {
        GpuError::ResourceCreation {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GpuError::IncompatibleRenderApi {
            expected: "OpenGL",
            found: RenderApi::Vulkan,
        };
        assert_eq!(err.to_string(), "Host display uses Vulkan, renderer needs OpenGL");

        let err = GpuError::resource("VRAM texture", "out of memory");
        assert_eq!(err.to_string(), "Failed to create VRAM texture: out of memory");

        let err: GpuError = DisplayError::UnknownTexture(3).into();
        assert!(matches!(err, GpuError::Display(DisplayError::UnknownTexture(3))));
    }
}
