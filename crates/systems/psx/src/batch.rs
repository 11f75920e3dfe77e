//! Batched primitive submission.
//!
//! Primitives with identical pipeline state are accumulated into one vertex
//! list and drawn with a single call. Any change to [`BatchConfig`] or to
//! the uniform block flushes the batch first.

use bytemuck::{Pod, Zeroable};
use emu_core::graphics::DepthFunc;

use crate::types::{BatchRenderMode, TextureMode, TransparencyMode};

/// Size of the vertex stream ring
pub const VERTEX_BUFFER_SIZE: u32 = 4 * 1024 * 1024;
/// Size of the uniform stream ring
pub const UNIFORM_BUFFER_SIZE: u32 = 2 * 1024 * 1024;
/// Size of the VRAM write staging ring
pub const VRAM_UPDATE_BUFFER_SIZE: u32 = 4 * 1024 * 1024;

pub const MAX_BATCH_VERTEX_COUNT: usize =
    VERTEX_BUFFER_SIZE as usize / std::mem::size_of::<BatchVertex>();

/// Number of distinct mask depth values before the depth buffer must be
/// regenerated from mask bits
pub const MAX_DEPTH_IDS: u32 = 65535;

/// Ordered dither offsets, indexed `[y & 3][x & 3]`
pub const DITHER_MATRIX: [[i32; 4]; 4] = [
    [-4, 0, -3, 1],
    [2, -2, 3, -1],
    [-3, 1, -4, 0],
    [3, -1, 2, -2],
];

/// Normalised depth for mask id `id`; later ids are strictly smaller
#[inline]
pub fn depth_for_id(id: u32) -> f32 {
    1.0 - (id as f32 / 65536.0)
}

/// One vertex as uploaded to the GPU
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct BatchVertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
    /// RGBA8, red in the low byte
    pub color: u32,
    /// [`crate::types::TexturePage::packed`]
    pub texpage: u32,
    pub u: u16,
    pub v: u16,
    /// min u, min v, max u, max v, 8 bits each from the low byte
    pub uv_limits: u32,
}

impl BatchVertex {
    pub fn pack_uv_limits(min_u: u32, min_v: u32, max_u: u32, max_v: u32) -> u32 {
        (min_u & 0xFF) | ((min_v & 0xFF) << 8) | ((max_u & 0xFF) << 16) | ((max_v & 0xFF) << 24)
    }

    /// (min_u, min_v, max_u, max_v)
    pub fn unpack_uv_limits(&self) -> (u32, u32, u32, u32) {
        let l = self.uv_limits;
        (l & 0xFF, (l >> 8) & 0xFF, (l >> 16) & 0xFF, l >> 24)
    }

    /// Attribute offsets within the vertex: position, color, texcoord,
    /// texpage, uv limits
    pub const ATTRIBUTE_OFFSETS: [u32; 5] = [0, 16, 24, 20, 28];
}

/// UV limits covering every vertex of a primitive
pub fn uv_limits_for(vertices: &[BatchVertex]) -> u32 {
    let (mut min_u, mut min_v, mut max_u, mut max_v) = (u32::MAX, u32::MAX, 0, 0);
    for v in vertices {
        min_u = min_u.min(v.u as u32);
        min_v = min_v.min(v.v as u32);
        max_u = max_u.max(v.u as u32);
        max_v = max_v.max(v.v as u32);
    }
    if vertices.is_empty() {
        return 0;
    }
    BatchVertex::pack_uv_limits(min_u, min_v, max_u, max_v)
}

/// Pipeline state shared by every primitive of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchConfig {
    pub texture_mode: TextureMode,
    pub transparency_mode: TransparencyMode,
    pub dithering: bool,
    pub interlacing: bool,
    pub set_mask_while_drawing: bool,
    pub check_mask_before_draw: bool,
    pub use_depth_buffer: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            texture_mode: TextureMode::Disabled,
            transparency_mode: TransparencyMode::Disabled,
            dithering: false,
            interlacing: false,
            set_mask_while_drawing: false,
            check_mask_before_draw: false,
            use_depth_buffer: false,
        }
    }
}

impl BatchConfig {
    /// Subtractive blending can't be combined with opaque texels in one
    /// pass, so textured subtractive batches draw twice.
    pub fn needs_two_pass_rendering(&self) -> bool {
        self.transparency_mode == TransparencyMode::BackgroundMinusForeground
            && self.texture_mode.is_textured()
    }

    pub fn render_mode(&self) -> BatchRenderMode {
        if self.transparency_mode == TransparencyMode::Disabled {
            BatchRenderMode::TransparencyDisabled
        } else {
            BatchRenderMode::TransparentAndOpaque
        }
    }

    /// Render passes needed to draw the batch, in order
    pub fn passes(&self) -> &'static [BatchRenderMode] {
        if self.needs_two_pass_rendering() {
            &[BatchRenderMode::OnlyOpaque, BatchRenderMode::OnlyTransparent]
        } else if self.transparency_mode == TransparencyMode::Disabled {
            &[BatchRenderMode::TransparencyDisabled]
        } else {
            &[BatchRenderMode::TransparentAndOpaque]
        }
    }

    pub fn depth_func(&self) -> DepthFunc {
        if self.use_depth_buffer {
            DepthFunc::LEqual
        } else if self.check_mask_before_draw {
            DepthFunc::GEqual
        } else {
            DepthFunc::Always
        }
    }
}

/// Batch uniform block, std140 layout
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct BatchUboData {
    pub texture_window_and: [u32; 2],
    pub texture_window_or: [u32; 2],
    pub src_alpha_factor: f32,
    pub dst_alpha_factor: f32,
    pub interlaced_displayed_field: u32,
    pub set_mask_while_drawing: u32,
    pub check_mask_before_draw: u32,
    pub _pad: [u32; 3],
}

impl Default for BatchUboData {
    fn default() -> Self {
        Self {
            texture_window_and: [0xFF, 0xFF],
            texture_window_or: [0, 0],
            src_alpha_factor: 1.0,
            dst_alpha_factor: 0.0,
            interlaced_displayed_field: 0,
            set_mask_while_drawing: 0,
            check_mask_before_draw: 0,
            _pad: [0; 3],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendEquation {
    Add,
    ReverseSubtract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    Src1Alpha,
    ConstantAlpha,
}

/// Fixed-function blend state for one pass. Alpha always takes the source
/// value, since it carries the mask bit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendState {
    pub enabled: bool,
    pub equation: BlendEquation,
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub constant_alpha: f32,
}

impl BlendState {
    pub const DISABLED: BlendState = BlendState {
        enabled: false,
        equation: BlendEquation::Add,
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::Zero,
        constant_alpha: 1.0,
    };

    /// The shader pre-multiplies the foreground; the background factor comes
    /// from the second color output, or from the blend constant when dual
    /// source blending is unavailable (opaque texels then blend too).
    pub fn for_pass(mode: TransparencyMode, pass: BatchRenderMode, dual_source: bool) -> BlendState {
        if mode == TransparencyMode::Disabled || !pass.blends() {
            return BlendState::DISABLED;
        }
        let equation = if mode == TransparencyMode::BackgroundMinusForeground {
            BlendEquation::ReverseSubtract
        } else {
            BlendEquation::Add
        };
        if dual_source {
            BlendState {
                enabled: true,
                equation,
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::Src1Alpha,
                constant_alpha: 1.0,
            }
        } else {
            BlendState {
                enabled: true,
                equation,
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::ConstantAlpha,
                constant_alpha: if mode == TransparencyMode::HalfBackgroundPlusHalfForeground {
                    0.5
                } else {
                    1.0
                },
            }
        }
    }
}

/// Primitives waiting to be drawn with one configuration
pub struct Batch {
    pub config: BatchConfig,
    pub ubo: BatchUboData,
    /// The uniform block changed since it was last uploaded
    pub ubo_dirty: bool,
    vertices: Vec<BatchVertex>,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    pub fn new() -> Self {
        Self {
            config: BatchConfig::default(),
            ubo: BatchUboData::default(),
            ubo_dirty: true,
            vertices: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertices(&self) -> &[BatchVertex] {
        &self.vertices
    }

    pub fn has_space_for(&self, count: usize) -> bool {
        self.vertices.len() + count <= MAX_BATCH_VERTEX_COUNT
    }

    pub fn push_triangle(&mut self, triangle: [BatchVertex; 3]) {
        self.vertices.extend_from_slice(&triangle);
    }

    /// Drop the queued vertices after they were drawn
    pub fn clear(&mut self) {
        self.vertices.clear();
    }
}

/// What the backend needs to draw a batch
pub struct BatchDraw<'a> {
    pub config: &'a BatchConfig,
    pub ubo: &'a BatchUboData,
    pub ubo_dirty: bool,
    pub vertices: &'a [BatchVertex],
}
