//! Rasterizer backends.
//!
//! [`GpuHw`](crate::gpu_hw::GpuHw) owns the console-side state and talks to
//! the host graphics API only through [`GpuBackend`]:
//!
//! ```text
//! GpuHw (shadow, dirty tracking, batching) -> GpuBackend -> {Software, OpenGL}
//! ```
//!
//! Every backend keeps the same resources: a resolution-scaled VRAM color
//! target with a depth buffer that carries the mask bit, a single-sampled
//! copy of it used for texture sampling (the "read texture"), a display
//! target and a 1:1 texture for encoding readbacks and snapshots. All
//! coordinates passed in are native VRAM pixels; scaling happens inside.

use emu_core::host_display::HostDisplay;

use crate::batch::BatchDraw;
use crate::display::DisplayPlan;
use crate::settings::GpuSettings;
use crate::shader_cache::CacheStats;
use crate::shadergen::ShaderGen;
use crate::types::DrawingArea;
use crate::vram::{Rect, Vram};
use crate::GpuError;

#[cfg(feature = "opengl")]
pub mod opengl;
pub mod software;

/// How CPU writes reach the scaled VRAM texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VramWritePath {
    /// Fragment shader reading a shader storage buffer
    StorageBuffer,
    /// Fragment shader reading a texture buffer
    TextureBuffer,
    /// Plain texture upload; masked or wrapping writes need a CPU round trip
    Upload,
}

impl VramWritePath {
    /// Masked and wrapping writes can be done on the GPU
    pub fn is_shader(self) -> bool {
        !matches!(self, VramWritePath::Upload)
    }
}

/// What the backend can do on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_resolution_scale: u32,
    pub max_multisamples: u32,
    pub dual_source_blend: bool,
    pub per_sample_shading: bool,
    pub vram_write_path: VramWritePath,
    pub glsl_es: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_resolution_scale: 1,
            max_multisamples: 1,
            dual_source_blend: false,
            per_sample_shading: false,
            vram_write_path: VramWritePath::Upload,
            glsl_es: false,
        }
    }
}

/// Framebuffer-shaping subset of the settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferConfig {
    pub resolution_scale: u32,
    pub multisamples: u32,
    pub pgxp_depth: bool,
    pub downsample: bool,
}

impl FramebufferConfig {
    pub fn from_settings(settings: &GpuSettings) -> Self {
        Self {
            resolution_scale: settings.resolution_scale.max(1),
            multisamples: settings.multisamples.max(1),
            pgxp_depth: settings.pgxp_depth_buffer,
            downsample: settings.uses_downsampling(),
        }
    }

    pub fn width(&self) -> u32 {
        crate::vram::VRAM_WIDTH * self.resolution_scale
    }

    pub fn height(&self) -> u32 {
        crate::vram::VRAM_HEIGHT * self.resolution_scale
    }
}

/// Shader-side settings for a framebuffer configuration and backend
pub fn shader_gen_for(settings: &GpuSettings, caps: &Capabilities) -> ShaderGen {
    ShaderGen {
        glsl_es: caps.glsl_es,
        resolution_scale: settings.resolution_scale.max(1),
        multisamples: settings.multisamples.max(1),
        per_sample_shading: settings.per_sample_shading,
        true_color: settings.true_color,
        scaled_dithering: settings.scaled_dithering,
        texture_filter: settings.texture_filter,
        uv_limits: settings.uses_uv_limits(),
        pgxp_depth: settings.pgxp_depth_buffer,
        dual_source_blend: caps.dual_source_blend,
        chroma_smoothing: settings.chroma_smoothing_24bit,
        ssbo_writes: caps.vram_write_path == VramWritePath::StorageBuffer,
    }
}

/// Rectangle fill. Coordinates wrap; mask settings don't apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOp {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// 5:5:5:1, the mask bit lands in the depth buffer
    pub color: u16,
    /// Lines of this field are left alone
    pub skip_field: Option<u32>,
}

/// CPU to VRAM transfer
#[derive(Debug, Clone, Copy)]
pub struct WriteOp<'a> {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// `width * height` words, row-major
    pub data: &'a [u16],
    pub set_mask: bool,
    pub check_mask: bool,
    /// Depth stored for pixels that end up with the mask bit set
    pub depth: f32,
}

/// VRAM to VRAM transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CopyOp {
    pub src_x: u32,
    pub src_y: u32,
    pub dst_x: u32,
    pub dst_y: u32,
    pub width: u32,
    pub height: u32,
    pub set_mask: bool,
    pub check_mask: bool,
    pub depth: f32,
}

pub trait GpuBackend {
    fn name(&self) -> &'static str;

    fn is_hardware_accelerated(&self) -> bool {
        false
    }

    /// Only meaningful after [`GpuBackend::initialize`]
    fn capabilities(&self) -> &Capabilities;

    /// Check the host display and query what the device supports. Missing
    /// required features are a hard error; optional ones select fallbacks.
    fn initialize(&mut self, host: &mut dyn HostDisplay) -> Result<(), GpuError>;

    /// (Re)create every resolution-dependent target. Contents are undefined
    /// afterwards.
    fn create_framebuffer(&mut self, config: &FramebufferConfig) -> Result<(), GpuError>;

    /// Build the full program set, going through the program cache
    fn compile_programs(&mut self, gen: &ShaderGen, settings: &GpuSettings) -> Result<(), GpuError>;

    fn shader_cache_stats(&self) -> CacheStats;

    /// Color, depth and read texture to zero
    fn clear_framebuffer(&mut self);

    /// Encode `rect` of the scaled texture at 1:1 and store it in `vram`.
    /// `rect` never wraps.
    fn read_vram(&mut self, rect: &Rect, vram: &mut Vram) -> Result<(), GpuError>;

    fn fill_vram(&mut self, op: &FillOp);

    /// Shader write paths handle masking and wrapping themselves. Upload
    /// paths only receive unmasked, non-wrapping writes.
    fn update_vram(&mut self, op: &WriteOp<'_>);

    fn copy_vram(&mut self, op: &CopyOp);

    /// Copy `rect` of the render target into the read texture
    fn update_vram_read_texture(&mut self, rect: &Rect);

    /// Depth becomes 1.0 where the mask bit is set and 0.0 elsewhere
    fn update_depth_buffer_from_mask_bit(&mut self);

    fn clear_depth_buffer(&mut self);

    fn set_scissor(&mut self, area: &DrawingArea);

    fn draw_batch(&mut self, draw: &BatchDraw<'_>);

    /// Put the planned display image on the host display. Allocation
    /// failures are logged and the frame is skipped.
    fn update_display(&mut self, host: &mut dyn HostDisplay, plan: &DisplayPlan) -> Result<(), GpuError>;

    fn clear_display(&mut self, host: &mut dyn HostDisplay);

    /// Make sure the 1:1 snapshot texture has the given size. Returns true
    /// when it had to be recreated.
    fn prepare_state_texture(&mut self, width: u32, height: u32) -> Result<bool, GpuError>;

    /// Load a full native image through the snapshot texture into every
    /// sample of the scaled target
    fn upload_state(&mut self, words: &[u16]);

    /// Free host resources
    fn shutdown(&mut self, _host: &mut dyn HostDisplay) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextureFilter;

    #[test]
    fn test_write_path_kinds() {
        assert!(VramWritePath::StorageBuffer.is_shader());
        assert!(VramWritePath::TextureBuffer.is_shader());
        assert!(!VramWritePath::Upload.is_shader());
    }

    #[test]
    fn test_shader_gen_follows_settings() {
        let settings = GpuSettings {
            resolution_scale: 3,
            texture_filter: TextureFilter::Bilinear,
            ..Default::default()
        };
        let caps = Capabilities {
            dual_source_blend: false,
            vram_write_path: VramWritePath::StorageBuffer,
            ..Default::default()
        };
        let gen = shader_gen_for(&settings, &caps);
        assert_eq!(gen.resolution_scale, 3);
        assert!(gen.uv_limits);
        assert!(!gen.dual_source_blend);
        assert!(gen.ssbo_writes);

        let config = FramebufferConfig::from_settings(&settings);
        assert_eq!((config.width(), config.height()), (3072, 1536));
        assert!(!config.downsample);
    }
}
