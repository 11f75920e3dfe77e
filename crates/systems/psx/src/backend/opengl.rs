//! OpenGL backend.
//!
//! **Resources** (all owned by [`OpenGLBackend`]):
//! - VRAM color target (RGBA8, multisampled when MSAA is on) sharing an FBO
//!   with a 32-bit float depth texture that carries the mask bit
//! - a depth-only FBO used to rebuild depth from the mask bits without
//!   sampling an attached color texture
//! - the read texture, a resolved single-sampled copy sampled by batches
//!   and copies
//! - a native-size encoding target for readbacks and a native-size upload
//!   target for plain texture uploads
//! - display and downsample targets
//!
//! Textures are stored bottom-up, GL style; the generated shaders flip Y
//! themselves and every blit and scissor here goes through [`gl_rect`].
//!
//! **Display**: when the host display runs on OpenGL the texture handles it
//! receives are GL texture names in the shared context.

use std::path::PathBuf;

use emu_core::graphics::{ColorOps, DepthFunc};
use emu_core::host_display::{DisplayView, HostDisplay, HostPixelFormat, TextureHandle};
use emu_core::logging::{log, LogCategory, LogLevel};
use glow::HasContext;

use super::{Capabilities, CopyOp, FillOp, FramebufferConfig, GpuBackend, VramWritePath, WriteOp};
use crate::batch::{
    BatchDraw, BatchUboData, BatchVertex, BlendEquation, BlendFactor, BlendState, UNIFORM_BUFFER_SIZE,
    VERTEX_BUFFER_SIZE, VRAM_UPDATE_BUFFER_SIZE,
};
use crate::display::{DisplayPath, DisplayPlan, ReinterpretPass};
use crate::programs::ProgramSet;
use crate::settings::{GpuSettings, MAX_RESOLUTION_SCALE};
use crate::shader_cache::{CacheStats, ProgramBinary, ProgramCompiler, ShaderCache};
use crate::shadergen::ShaderGen;
use crate::stream_buffer::{FenceOps, StreamBuffer, StreamStats};
use crate::types::{BatchRenderMode, DrawingArea, TextureMode};
use crate::vram::{
    is_oversized, split_wrapped, Rect, Vram, MASK_BIT, VRAM_HEIGHT, VRAM_HEIGHT_MASK, VRAM_WIDTH, VRAM_WIDTH_MASK,
};
use crate::GpuError;

const UBO_BINDING: u32 = 1;
const SSBO_BINDING: u32 = 0;
const UBO_SIZE: usize = std::mem::size_of::<BatchUboData>();
const VERTEX_STRIDE: i32 = std::mem::size_of::<BatchVertex>() as i32;

/// Batch vertex attributes in location order
const BATCH_ATTRIBUTES: [&str; 5] = ["a_pos", "a_col0", "a_texcoord", "a_texpage", "a_uv_limits"];

/// Wrapper for glow::Context that implements Send
/// Safety: the backend is created, used and dropped on the thread that owns
/// the context; it only crosses threads while no GL call is in flight.
struct SendContext(glow::Context);

unsafe impl Send for SendContext {}

impl std::ops::Deref for SendContext {
    type Target = glow::Context;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn gl_error(what: &str) -> impl FnOnce(String) -> GpuError + '_ {
    move |reason| GpuError::resource(what, reason)
}

/// Native `rect` as a bottom-up GL rectangle (x, y, width, height) of a
/// target scaled by `scale`
fn gl_rect(rect: &Rect, scale: u32) -> (i32, i32, i32, i32) {
    let target_height = VRAM_HEIGHT * scale;
    (
        (rect.left * scale) as i32,
        (target_height - rect.bottom * scale) as i32,
        (rect.width() * scale) as i32,
        (rect.height() * scale) as i32,
    )
}

fn gl_depth_func(func: DepthFunc) -> u32 {
    match func {
        DepthFunc::Always => glow::ALWAYS,
        DepthFunc::GEqual => glow::GEQUAL,
        DepthFunc::LEqual => glow::LEQUAL,
    }
}

fn gl_blend_factor(factor: BlendFactor) -> u32 {
    match factor {
        BlendFactor::Zero => glow::ZERO,
        BlendFactor::One => glow::ONE,
        BlendFactor::Src1Alpha => glow::SRC1_ALPHA,
        BlendFactor::ConstantAlpha => glow::CONSTANT_ALPHA,
    }
}

fn texture_name(texture: glow::Texture) -> TextureHandle {
    TextureHandle(texture.0.get() as u64)
}

fn rgba_bytes(words: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for &word in words {
        bytes.extend_from_slice(&ColorOps::rgba5551_to_rgba8888(word).to_le_bytes());
    }
    bytes
}

/// GL sync objects for the stream buffers
struct GlFences<'a> {
    gl: &'a glow::Context,
}

impl FenceOps for GlFences<'_> {
    type Fence = Option<glow::Fence>;

    fn insert(&mut self) -> Self::Fence {
        unsafe { self.gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0).ok() }
    }

    fn wait(&mut self, fence: Self::Fence) {
        let Some(fence) = fence else {
            return;
        };
        unsafe {
            let status = self.gl.client_wait_sync(fence, glow::SYNC_FLUSH_COMMANDS_BIT, i32::MAX);
            if status == glow::WAIT_FAILED {
                log(LogCategory::Sync, LogLevel::Warn, || "fence wait failed".to_string());
            }
            self.gl.delete_sync(fence);
        }
    }
}

/// Compiles and links generated GLSL
struct GlCompiler<'a> {
    gl: &'a glow::Context,
}

impl GlCompiler<'_> {
    unsafe fn compile_shader(&self, stage: u32, source: &str) -> Result<glow::Shader, String> {
        let shader = self.gl.create_shader(stage)?;
        self.gl.shader_source(shader, source);
        self.gl.compile_shader(shader);
        if !self.gl.get_shader_compile_status(shader) {
            let info = self.gl.get_shader_info_log(shader);
            self.gl.delete_shader(shader);
            let name = if stage == glow::VERTEX_SHADER { "vertex" } else { "fragment" };
            return Err(format!("{} shader compilation failed: {}", name, info));
        }
        Ok(shader)
    }
}

impl ProgramCompiler for GlCompiler<'_> {
    type Program = glow::Program;

    fn compile_program(
        &mut self,
        vertex: &str,
        fragment: &str,
        pre_link: &dyn Fn(&mut Self, &glow::Program),
    ) -> Result<glow::Program, String> {
        unsafe {
            let vs = self.compile_shader(glow::VERTEX_SHADER, vertex)?;
            let fs = match self.compile_shader(glow::FRAGMENT_SHADER, fragment) {
                Ok(fs) => fs,
                Err(e) => {
                    self.gl.delete_shader(vs);
                    return Err(e);
                }
            };
            let program = match self.gl.create_program() {
                Ok(program) => program,
                Err(e) => {
                    self.gl.delete_shader(vs);
                    self.gl.delete_shader(fs);
                    return Err(e);
                }
            };
            self.gl.attach_shader(program, vs);
            self.gl.attach_shader(program, fs);
            pre_link(self, &program);
            self.gl.link_program(program);

            self.gl.detach_shader(program, vs);
            self.gl.detach_shader(program, fs);
            self.gl.delete_shader(vs);
            self.gl.delete_shader(fs);

            if !self.gl.get_program_link_status(program) {
                let info = self.gl.get_program_info_log(program);
                self.gl.delete_program(program);
                return Err(format!("program linking failed: {}", info));
            }
            Ok(program)
        }
    }

    // glow 0.13 has no glGetProgramBinary/glProgramBinary bindings
    fn supports_binaries(&self) -> bool {
        false
    }

    fn get_program_binary(&mut self, _program: &glow::Program) -> Option<ProgramBinary> {
        None
    }

    fn create_program_from_binary(&mut self, _binary: &ProgramBinary) -> Option<glow::Program> {
        None
    }

    fn destroy_program(&mut self, program: glow::Program) {
        unsafe { self.gl.delete_program(program) }
    }
}

fn bind_batch_attributes(compiler: &mut GlCompiler<'_>, program: &glow::Program) {
    for (location, name) in BATCH_ATTRIBUTES.iter().enumerate() {
        unsafe { compiler.gl.bind_attrib_location(*program, location as u32, name) };
    }
}

/// Single-sampled RGBA8 texture with its own FBO
#[derive(Debug, Clone, Copy)]
struct ColorTarget {
    texture: glow::Texture,
    fbo: glow::Framebuffer,
    width: u32,
    height: u32,
}

impl ColorTarget {
    unsafe fn new(gl: &glow::Context, what: &str, width: u32, height: u32) -> Result<Self, GpuError> {
        let texture = gl.create_texture().map_err(gl_error(what))?;
        gl.bind_texture(glow::TEXTURE_2D, Some(texture));
        gl.tex_image_2d(
            glow::TEXTURE_2D,
            0,
            glow::RGBA8 as i32,
            width as i32,
            height as i32,
            0,
            glow::RGBA,
            glow::UNSIGNED_BYTE,
            None,
        );
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAX_LEVEL, 0);

        let fbo = match gl.create_framebuffer() {
            Ok(fbo) => fbo,
            Err(e) => {
                gl.delete_texture(texture);
                return Err(GpuError::resource(what, e));
            }
        };
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, glow::TEXTURE_2D, Some(texture), 0);
        let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        let target = Self { texture, fbo, width, height };
        if status != glow::FRAMEBUFFER_COMPLETE {
            target.destroy(gl);
            return Err(GpuError::resource(what, format!("framebuffer incomplete: status = 0x{:X}", status)));
        }
        Ok(target)
    }

    unsafe fn destroy(&self, gl: &glow::Context) {
        gl.delete_framebuffer(self.fbo);
        gl.delete_texture(self.texture);
    }
}

/// Everything that depends on the resolution scale and sample count
struct VramTargets {
    color: glow::Texture,
    depth: glow::Texture,
    fbo: glow::Framebuffer,
    depth_fbo: glow::Framebuffer,
    read: ColorTarget,
    encode: ColorTarget,
    upload: ColorTarget,
    /// TEXTURE_2D or TEXTURE_2D_MULTISAMPLE
    texture_target: u32,
}

impl VramTargets {
    unsafe fn new(gl: &glow::Context, config: &FramebufferConfig) -> Result<Self, GpuError> {
        let (width, height) = (config.width() as i32, config.height() as i32);
        let multisampled = config.multisamples > 1;
        let texture_target = if multisampled { glow::TEXTURE_2D_MULTISAMPLE } else { glow::TEXTURE_2D };

        let color = gl.create_texture().map_err(gl_error("VRAM texture"))?;
        let depth = gl.create_texture().map_err(gl_error("VRAM depth texture"))?;
        for (texture, internal_format, format, ty) in [
            (color, glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE),
            (depth, glow::DEPTH_COMPONENT32F, glow::DEPTH_COMPONENT, glow::FLOAT),
        ] {
            gl.bind_texture(texture_target, Some(texture));
            if multisampled {
                gl.tex_image_2d_multisample(
                    texture_target,
                    config.multisamples as i32,
                    internal_format as i32,
                    width,
                    height,
                    true,
                );
            } else {
                gl.tex_image_2d(texture_target, 0, internal_format as i32, width, height, 0, format, ty, None);
                gl.tex_parameter_i32(texture_target, glow::TEXTURE_MIN_FILTER, glow::NEAREST as i32);
                gl.tex_parameter_i32(texture_target, glow::TEXTURE_MAG_FILTER, glow::NEAREST as i32);
                gl.tex_parameter_i32(texture_target, glow::TEXTURE_MAX_LEVEL, 0);
            }
        }

        let fbo = gl.create_framebuffer().map_err(gl_error("VRAM framebuffer"))?;
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::COLOR_ATTACHMENT0, texture_target, Some(color), 0);
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::DEPTH_ATTACHMENT, texture_target, Some(depth), 0);
        let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
        if status != glow::FRAMEBUFFER_COMPLETE {
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            gl.delete_framebuffer(fbo);
            gl.delete_texture(color);
            gl.delete_texture(depth);
            return Err(GpuError::resource(
                "VRAM framebuffer",
                format!("framebuffer incomplete: status = 0x{:X}", status),
            ));
        }

        let depth_fbo = gl.create_framebuffer().map_err(gl_error("VRAM depth framebuffer"))?;
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(depth_fbo));
        gl.framebuffer_texture_2d(glow::FRAMEBUFFER, glow::DEPTH_ATTACHMENT, texture_target, Some(depth), 0);
        gl.draw_buffers(&[glow::NONE]);
        gl.read_buffer(glow::NONE);
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);

        let read = ColorTarget::new(gl, "VRAM read texture", config.width(), config.height())?;
        let encode = ColorTarget::new(gl, "VRAM encoding texture", VRAM_WIDTH, VRAM_HEIGHT)?;
        let upload = ColorTarget::new(gl, "VRAM upload texture", VRAM_WIDTH, VRAM_HEIGHT)?;

        Ok(Self {
            color,
            depth,
            fbo,
            depth_fbo,
            read,
            encode,
            upload,
            texture_target,
        })
    }

    unsafe fn destroy(&self, gl: &glow::Context) {
        self.read.destroy(gl);
        self.encode.destroy(gl);
        self.upload.destroy(gl);
        gl.delete_framebuffer(self.depth_fbo);
        gl.delete_framebuffer(self.fbo);
        gl.delete_texture(self.depth);
        gl.delete_texture(self.color);
    }
}

pub struct OpenGLBackend {
    gl: SendContext,
    caps: Capabilities,
    config: FramebufferConfig,
    ubo_alignment: u32,
    ssbo_alignment: u32,

    targets: Option<VramTargets>,
    display: Option<ColorTarget>,
    downsample: Option<ColorTarget>,
    state: Option<ColorTarget>,
    /// Bottom-up scissor of the drawing area
    scissor: (i32, i32, i32, i32),

    batch_vao: Option<glow::VertexArray>,
    empty_vao: Option<glow::VertexArray>,
    vertex_buffer: Option<glow::Buffer>,
    uniform_buffer: Option<glow::Buffer>,
    upload_buffer: Option<glow::Buffer>,
    vertex_stream: StreamBuffer<Option<glow::Fence>>,
    uniform_stream: StreamBuffer<Option<glow::Fence>>,
    upload_stream: StreamBuffer<Option<glow::Fence>>,
    ubo_bound: bool,

    shader_cache: Option<ShaderCache<glow::Program>>,
    cache_path: Option<PathBuf>,
    programs: Option<ProgramSet<glow::Program>>,
}

impl OpenGLBackend {
    /// Wrap a context created by the frontend. Nothing is touched until
    /// [`GpuBackend::initialize`].
    pub fn new(gl: glow::Context) -> Self {
        Self {
            gl: SendContext(gl),
            caps: Capabilities::default(),
            config: FramebufferConfig {
                resolution_scale: 1,
                multisamples: 1,
                pgxp_depth: false,
                downsample: false,
            },
            ubo_alignment: 256,
            ssbo_alignment: 256,
            targets: None,
            display: None,
            downsample: None,
            state: None,
            scissor: (0, 0, VRAM_WIDTH as i32, VRAM_HEIGHT as i32),
            batch_vao: None,
            empty_vao: None,
            vertex_buffer: None,
            uniform_buffer: None,
            upload_buffer: None,
            vertex_stream: StreamBuffer::new(VERTEX_BUFFER_SIZE),
            uniform_stream: StreamBuffer::new(UNIFORM_BUFFER_SIZE),
            upload_stream: StreamBuffer::new(VRAM_UPDATE_BUFFER_SIZE),
            ubo_bound: false,
            shader_cache: None,
            cache_path: None,
            programs: None,
        }
    }

    pub fn vertex_stream_stats(&self) -> StreamStats {
        self.vertex_stream.stats()
    }

    fn scale(&self) -> u32 {
        self.config.resolution_scale
    }

    fn mask_depth_func(&self, check_mask: bool) -> DepthFunc {
        if check_mask && !self.config.pgxp_depth {
            DepthFunc::GEqual
        } else {
            DepthFunc::Always
        }
    }

    fn query_capabilities(&mut self) -> Result<Capabilities, GpuError> {
        let gl = &*self.gl;
        let version = gl.version();
        let (major, minor, es) = (version.major, version.minor, version.is_embedded);
        let at_least = |maj: u32, min: u32| (major, minor) >= (maj, min);
        if (!es && !at_least(3, 3)) || (es && !at_least(3, 0)) {
            return Err(GpuError::MissingCapability(format!(
                "OpenGL 3.3 or OpenGL ES 3.0 (found {}.{}{})",
                major,
                minor,
                if es { " ES" } else { "" }
            )));
        }
        let extensions = gl.supported_extensions();
        let has = |name: &str| extensions.contains(name);

        let (max_texture_size, max_samples, ubo_alignment) = unsafe {
            (
                gl.get_parameter_i32(glow::MAX_TEXTURE_SIZE).max(0) as u32,
                gl.get_parameter_i32(glow::MAX_SAMPLES).max(1) as u32,
                gl.get_parameter_i32(glow::UNIFORM_BUFFER_OFFSET_ALIGNMENT).max(1) as u32,
            )
        };
        if max_texture_size < VRAM_WIDTH {
            return Err(GpuError::MissingCapability(format!(
                "{}x{} textures (max {})",
                VRAM_WIDTH, VRAM_HEIGHT, max_texture_size
            )));
        }
        self.ubo_alignment = ubo_alignment;

        let ssbo = if es { at_least(3, 1) } else { at_least(4, 3) || has("GL_ARB_shader_storage_buffer_object") };
        let vram_write_path = if ssbo {
            let (block_size, alignment) = unsafe {
                (
                    gl.get_parameter_i32(glow::MAX_SHADER_STORAGE_BLOCK_SIZE).max(0) as u32,
                    gl.get_parameter_i32(glow::SHADER_STORAGE_BUFFER_OFFSET_ALIGNMENT).max(1) as u32,
                )
            };
            self.ssbo_alignment = alignment;
            if block_size >= VRAM_UPDATE_BUFFER_SIZE {
                VramWritePath::StorageBuffer
            } else {
                log(LogCategory::Rasterizer, LogLevel::Warn, || {
                    format!("storage blocks limited to {} bytes, using texture uploads", block_size)
                });
                VramWritePath::Upload
            }
        } else {
            VramWritePath::Upload
        };

        Ok(Capabilities {
            max_resolution_scale: (max_texture_size / VRAM_WIDTH).clamp(1, MAX_RESOLUTION_SCALE),
            max_multisamples: max_samples.clamp(1, 16),
            dual_source_blend: !es,
            per_sample_shading: !es && (at_least(4, 0) || has("GL_ARB_gpu_shader5")),
            vram_write_path,
            glsl_es: es,
        })
    }

    unsafe fn create_streams(&mut self) -> Result<(), GpuError> {
        let gl = &*self.gl;
        let mut buffers = Vec::with_capacity(3);
        for (target, size, what) in [
            (glow::ARRAY_BUFFER, VERTEX_BUFFER_SIZE, "vertex stream"),
            (glow::UNIFORM_BUFFER, UNIFORM_BUFFER_SIZE, "uniform stream"),
            (glow::SHADER_STORAGE_BUFFER, VRAM_UPDATE_BUFFER_SIZE, "VRAM write stream"),
        ] {
            if target == glow::SHADER_STORAGE_BUFFER && !self.caps.vram_write_path.is_shader() {
                buffers.push(None);
                continue;
            }
            let buffer = gl.create_buffer().map_err(gl_error(what))?;
            gl.bind_buffer(target, Some(buffer));
            gl.buffer_data_size(target, size as i32, glow::STREAM_DRAW);
            gl.bind_buffer(target, None);
            buffers.push(Some(buffer));
        }
        self.vertex_buffer = buffers[0];
        self.uniform_buffer = buffers[1];
        self.upload_buffer = buffers[2];

        let vao = gl.create_vertex_array().map_err(gl_error("batch vertex array"))?;
        gl.bind_vertex_array(Some(vao));
        gl.bind_buffer(glow::ARRAY_BUFFER, self.vertex_buffer);
        let [pos, col, texcoord, texpage, uv_limits] = BatchVertex::ATTRIBUTE_OFFSETS.map(|o| o as i32);
        gl.enable_vertex_attrib_array(0);
        gl.vertex_attrib_pointer_f32(0, 4, glow::FLOAT, false, VERTEX_STRIDE, pos);
        gl.enable_vertex_attrib_array(1);
        gl.vertex_attrib_pointer_f32(1, 4, glow::UNSIGNED_BYTE, true, VERTEX_STRIDE, col);
        gl.enable_vertex_attrib_array(2);
        gl.vertex_attrib_pointer_i32(2, 1, glow::UNSIGNED_INT, VERTEX_STRIDE, texcoord);
        gl.enable_vertex_attrib_array(3);
        gl.vertex_attrib_pointer_i32(3, 1, glow::UNSIGNED_INT, VERTEX_STRIDE, texpage);
        gl.enable_vertex_attrib_array(4);
        gl.vertex_attrib_pointer_f32(4, 4, glow::UNSIGNED_BYTE, true, VERTEX_STRIDE, uv_limits);
        gl.bind_vertex_array(None);
        self.batch_vao = Some(vao);

        self.empty_vao = Some(gl.create_vertex_array().map_err(gl_error("utility vertex array"))?);
        Ok(())
    }

    /// Blocks and UBO bindings only exist after linking
    unsafe fn bind_program_resources(&self, programs: &ProgramSet<glow::Program>) {
        let gl = &*self.gl;
        for render_mode in BatchRenderMode::ALL {
            for texture_mode in TextureMode::ALL {
                for dithering in [false, true] {
                    for interlacing in [false, true] {
                        let program = *programs.batch(render_mode, texture_mode, dithering, interlacing);
                        if let Some(index) = gl.get_uniform_block_index(program, "UBOBlock") {
                            gl.uniform_block_binding(program, index, UBO_BINDING);
                        }
                        gl.use_program(Some(program));
                        let sampler = gl.get_uniform_location(program, "samp0");
                        gl.uniform_1_i32(sampler.as_ref(), 0);
                    }
                }
            }
        }
        gl.use_program(None);
    }

    /// Bind the VRAM framebuffer for a utility or batch pass
    unsafe fn begin_vram_pass(&self, depth_func: DepthFunc) -> Option<&VramTargets> {
        let targets = self.targets.as_ref()?;
        let gl = &*self.gl;
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(targets.fbo));
        gl.viewport(0, 0, self.config.width() as i32, self.config.height() as i32);
        gl.enable(glow::DEPTH_TEST);
        gl.depth_func(gl_depth_func(depth_func));
        gl.depth_mask(true);
        gl.disable(glow::BLEND);
        gl.color_mask(true, true, true, true);
        gl.enable(glow::SCISSOR_TEST);
        Some(targets)
    }

    /// One full-screen triangle per native piece, scissored to the piece
    unsafe fn draw_pieces(&self, pieces: impl IntoIterator<Item = Rect>) {
        let gl = &*self.gl;
        gl.bind_vertex_array(self.empty_vao);
        for piece in pieces {
            let (x, y, w, h) = gl_rect(&piece, self.scale());
            gl.scissor(x, y, w, h);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
        }
        let (x, y, w, h) = self.scissor;
        gl.scissor(x, y, w, h);
    }

    unsafe fn bind_texture(&self, unit: u32, target: u32, texture: glow::Texture) {
        self.gl.active_texture(glow::TEXTURE0 + unit);
        self.gl.bind_texture(target, Some(texture));
    }

    unsafe fn apply_blend(&self, blend: &BlendState) {
        let gl = &*self.gl;
        if !blend.enabled {
            gl.disable(glow::BLEND);
            return;
        }
        gl.enable(glow::BLEND);
        let equation = match blend.equation {
            BlendEquation::Add => glow::FUNC_ADD,
            BlendEquation::ReverseSubtract => glow::FUNC_REVERSE_SUBTRACT,
        };
        gl.blend_equation_separate(equation, glow::FUNC_ADD);
        gl.blend_func_separate(
            gl_blend_factor(blend.src_factor),
            gl_blend_factor(blend.dst_factor),
            glow::ONE,
            glow::ZERO,
        );
        gl.blend_color(0.0, 0.0, 0.0, blend.constant_alpha);
    }

    /// Copy `rect` (native, non-wrapping) of the read texture into the VRAM
    /// target with the copy program. Used after staging data in the read
    /// texture.
    unsafe fn resolve_read_region(&self, rect: &Rect, depth: f32) {
        let Some(programs) = self.programs.as_ref() else {
            return;
        };
        let Some(targets) = self.begin_vram_pass(DepthFunc::Always) else {
            return;
        };
        let gl = &*self.gl;
        gl.use_program(Some(programs.copy));
        self.bind_texture(0, glow::TEXTURE_2D, targets.read.texture);
        let location = |name: &str| gl.get_uniform_location(programs.copy, name);
        gl.uniform_1_i32(location("samp0").as_ref(), 0);
        gl.uniform_4_u32(location("u_src_dst").as_ref(), rect.left, rect.top, rect.left, rect.top);
        gl.uniform_2_u32(location("u_size").as_ref(), rect.width(), rect.height());
        gl.uniform_1_u32(location("u_set_mask_bit").as_ref(), 0);
        gl.uniform_1_f32(location("u_depth_value").as_ref(), depth);
        self.draw_pieces([*rect]);
    }

    /// Put native `words` for `rect` into the read texture, scaled up by a
    /// nearest blit from the upload target
    unsafe fn stage_native(&self, staging: &ColorTarget, rect: &Rect, words: &[u16]) {
        let gl = &*self.gl;
        let Some(targets) = self.targets.as_ref() else {
            return;
        };
        let (width, height) = (rect.width() as i32, rect.height() as i32);
        gl.bind_texture(glow::TEXTURE_2D, Some(staging.texture));
        gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 4);
        gl.tex_sub_image_2d(
            glow::TEXTURE_2D,
            0,
            0,
            0,
            width,
            height,
            glow::RGBA,
            glow::UNSIGNED_BYTE,
            glow::PixelUnpackData::Slice(&rgba_bytes(words)),
        );

        // Upload rows run top-down from GL row 0, so the blit flips them
        let (x, y, w, h) = gl_rect(rect, self.scale());
        gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(staging.fbo));
        gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, Some(targets.read.fbo));
        gl.disable(glow::SCISSOR_TEST);
        gl.blit_framebuffer(0, 0, width, height, x, y + h, x + w, y, glow::COLOR_BUFFER_BIT, glow::NEAREST);
        gl.enable(glow::SCISSOR_TEST);
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);
    }

    unsafe fn update_vram_ssbo(&mut self, op: &WriteOp<'_>, program: glow::Program) -> bool {
        let Some(buffer) = self.upload_buffer else {
            return false;
        };
        // The shader reads 32-bit words, so pad odd lengths
        let mut bytes: Vec<u8> = bytemuck::cast_slice(op.data).to_vec();
        if bytes.len() % 4 != 0 {
            bytes.extend_from_slice(&[0, 0]);
        }
        let mut fences = GlFences { gl: &self.gl };
        let Some(mapping) = self.upload_stream.map(&mut fences, self.ssbo_alignment, bytes.len() as u32) else {
            return false;
        };
        let gl = &*self.gl;
        gl.bind_buffer(glow::SHADER_STORAGE_BUFFER, Some(buffer));
        gl.buffer_sub_data_u8_slice(glow::SHADER_STORAGE_BUFFER, mapping.offset as i32, &bytes);
        self.upload_stream.unmap(bytes.len() as u32);
        gl.bind_buffer_range(
            glow::SHADER_STORAGE_BUFFER,
            SSBO_BINDING,
            Some(buffer),
            mapping.offset as i32,
            bytes.len() as i32,
        );

        if self.begin_vram_pass(self.mask_depth_func(op.check_mask)).is_none() {
            return false;
        }
        gl.use_program(Some(program));
        let location = |name: &str| gl.get_uniform_location(program, name);
        gl.uniform_4_u32(
            location("u_base_size").as_ref(),
            op.x & VRAM_WIDTH_MASK,
            op.y & VRAM_HEIGHT_MASK,
            op.width,
            op.height,
        );
        gl.uniform_1_u32(location("u_buffer_base_offset").as_ref(), 0);
        gl.uniform_1_u32(location("u_mask_or_bits").as_ref(), if op.set_mask { MASK_BIT as u32 } else { 0 });
        gl.uniform_1_f32(location("u_depth_value").as_ref(), op.depth);
        let pieces = split_wrapped(op.x, op.y, op.width, op.height).into_iter().map(|p| p.rect);
        self.draw_pieces(pieces);
        true
    }

    unsafe fn display_direct(&mut self, host: &mut dyn HostDisplay, rect: &Rect) -> Result<(), GpuError> {
        let (width, height) = (rect.width(), rect.height());
        let Some(display) = self.ensure_display_target(width, height)? else {
            return Ok(());
        };
        let Some(targets) = self.targets.as_ref() else {
            return Ok(());
        };
        let gl = &*self.gl;
        // `rect` is in scaled pixels, top-down
        let target_height = self.config.height() as i32;
        let (x0, x1) = (rect.left as i32, rect.right as i32);
        let (y0, y1) = (target_height - rect.bottom as i32, target_height - rect.top as i32);
        gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(targets.fbo));
        gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, Some(display.fbo));
        // Only planned for single-sampled targets
        gl.disable(glow::SCISSOR_TEST);
        gl.blit_framebuffer(
            x0,
            y0,
            x1,
            y1,
            0,
            0,
            width as i32,
            height as i32,
            glow::COLOR_BUFFER_BIT,
            glow::NEAREST,
        );
        gl.enable(glow::SCISSOR_TEST);
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);

        host.set_display_texture(DisplayView {
            handle: texture_name(display.texture),
            format: HostPixelFormat::Rgba8,
            texture_width: width,
            texture_height: height,
            view_x: 0,
            view_y: 0,
            view_width: width as i32,
            view_height: -(height as i32),
        });
        Ok(())
    }

    /// Returns `None` (after logging) when the target can't be allocated,
    /// in which case the frame is skipped
    unsafe fn ensure_display_target(&mut self, width: u32, height: u32) -> Result<Option<ColorTarget>, GpuError> {
        if let Some(display) = self.display {
            if display.width == width && display.height == height {
                return Ok(Some(display));
            }
            display.destroy(&self.gl);
            self.display = None;
        }
        match ColorTarget::new(&self.gl, "display texture", width, height) {
            Ok(display) => {
                let gl = &*self.gl;
                gl.bind_framebuffer(glow::FRAMEBUFFER, Some(display.fbo));
                gl.disable(glow::SCISSOR_TEST);
                gl.clear_color(0.0, 0.0, 0.0, 1.0);
                gl.clear(glow::COLOR_BUFFER_BIT);
                gl.enable(glow::SCISSOR_TEST);
                gl.bind_framebuffer(glow::FRAMEBUFFER, None);
                self.display = Some(display);
                Ok(Some(display))
            }
            Err(e) => {
                log(LogCategory::Display, LogLevel::Warn, || {
                    format!("display texture allocation failed, skipping frame: {}", e)
                });
                Ok(None)
            }
        }
    }

    unsafe fn display_reinterpret(&mut self, host: &mut dyn HostDisplay, pass: &ReinterpretPass) -> Result<(), GpuError> {
        let Some(programs) = self.programs.as_ref() else {
            return Ok(());
        };
        let program = *programs.display(pass.depth_24bit, pass.interlace);
        let downsample_program = programs.downsample;
        let Some(display) = self.ensure_display_target(pass.width, pass.height)? else {
            return Ok(());
        };
        let Some(targets) = self.targets.as_ref() else {
            return Ok(());
        };
        let gl = &*self.gl;
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(display.fbo));
        gl.viewport(0, 0, pass.width as i32, pass.height as i32);
        gl.disable(glow::DEPTH_TEST);
        gl.disable(glow::SCISSOR_TEST);
        gl.disable(glow::BLEND);
        gl.use_program(Some(program));
        self.bind_texture(0, targets.texture_target, targets.color);
        gl.uniform_1_i32(gl.get_uniform_location(program, "samp0").as_ref(), 0);
        let [x, y, z, w] = pass.uniforms.as_array();
        gl.uniform_4_i32(gl.get_uniform_location(program, "u_display_params").as_ref(), x, y, z, w);
        gl.uniform_1_i32(gl.get_uniform_location(program, "u_output_height").as_ref(), pass.height as i32);
        gl.bind_vertex_array(self.empty_vao);
        gl.draw_arrays(glow::TRIANGLES, 0, 3);

        let mut shown = display;
        if let (Some((width, height)), Some(program)) = (pass.downsample_to, downsample_program) {
            let current = self.downsample;
            let target = match current {
                Some(target) if target.width == width && target.height == height => target,
                _ => {
                    if let Some(stale) = self.downsample.take() {
                        stale.destroy(gl);
                    }
                    let target = ColorTarget::new(gl, "downsample texture", width, height)?;
                    self.downsample = Some(target);
                    target
                }
            };
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(target.fbo));
            gl.viewport(0, 0, width as i32, height as i32);
            gl.use_program(Some(program));
            self.bind_texture(0, glow::TEXTURE_2D, display.texture);
            gl.uniform_1_i32(gl.get_uniform_location(program, "samp0").as_ref(), 0);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
            shown = target;
        }
        gl.enable(glow::SCISSOR_TEST);
        gl.bind_framebuffer(glow::FRAMEBUFFER, None);

        host.set_display_texture(DisplayView {
            handle: texture_name(shown.texture),
            format: HostPixelFormat::Rgba8,
            texture_width: shown.width,
            texture_height: shown.height,
            view_x: 0,
            view_y: 0,
            view_width: shown.width as i32,
            view_height: -(shown.height as i32),
        });
        Ok(())
    }

    unsafe fn release(&mut self) {
        let gl = &*self.gl;
        if let Some(targets) = self.targets.take() {
            targets.destroy(gl);
        }
        for target in [self.display.take(), self.downsample.take(), self.state.take()].into_iter().flatten() {
            target.destroy(gl);
        }
        for vao in [self.batch_vao.take(), self.empty_vao.take()].into_iter().flatten() {
            gl.delete_vertex_array(vao);
        }
        for buffer in [self.vertex_buffer.take(), self.uniform_buffer.take(), self.upload_buffer.take()]
            .into_iter()
            .flatten()
        {
            gl.delete_buffer(buffer);
        }
        self.programs = None;
        if let Some(cache) = self.shader_cache.as_mut() {
            cache.clear(&mut GlCompiler { gl });
        }
    }
}

impl GpuBackend for OpenGLBackend {
    fn name(&self) -> &'static str {
        "OpenGL"
    }

    fn is_hardware_accelerated(&self) -> bool {
        true
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn initialize(&mut self, host: &mut dyn HostDisplay) -> Result<(), GpuError> {
        let api = host.render_api();
        if !api.is_opengl() {
            return Err(GpuError::IncompatibleRenderApi { expected: "OpenGL", found: api });
        }
        self.caps = self.query_capabilities()?;
        unsafe { self.create_streams()? };

        let caps = self.caps;
        log(LogCategory::Rasterizer, LogLevel::Info, || {
            format!(
                "OpenGL renderer: max scale {}, max {}x MSAA, dual-source {}, write path {:?}",
                caps.max_resolution_scale, caps.max_multisamples, caps.dual_source_blend, caps.vram_write_path
            )
        });
        if !caps.dual_source_blend {
            log(LogCategory::Rasterizer, LogLevel::Warn, || {
                "dual-source blending unavailable, using constant blend factors".to_string()
            });
        }
        if !caps.vram_write_path.is_shader() {
            log(LogCategory::Rasterizer, LogLevel::Warn, || {
                "no shader write path, masked VRAM writes go through the CPU".to_string()
            });
        }
        Ok(())
    }

    fn create_framebuffer(&mut self, config: &FramebufferConfig) -> Result<(), GpuError> {
        if config.resolution_scale > self.caps.max_resolution_scale
            || config.multisamples > self.caps.max_multisamples
        {
            return Err(GpuError::resource(
                "VRAM framebuffer",
                format!("{}x scale with {}x MSAA exceeds capabilities", config.resolution_scale, config.multisamples),
            ));
        }
        unsafe {
            if let Some(targets) = self.targets.take() {
                targets.destroy(&self.gl);
            }
            for target in [self.display.take(), self.downsample.take()].into_iter().flatten() {
                target.destroy(&self.gl);
            }
            self.targets = Some(VramTargets::new(&self.gl, config)?);
        }
        self.config = *config;
        self.scissor = gl_rect(&Rect::FULL_VRAM, config.resolution_scale);
        log(LogCategory::Rasterizer, LogLevel::Info, || {
            format!(
                "framebuffer {}x{} with {} sample(s)",
                config.width(),
                config.height(),
                config.multisamples
            )
        });
        Ok(())
    }

    fn compile_programs(&mut self, gen: &ShaderGen, settings: &GpuSettings) -> Result<(), GpuError> {
        let mut compiler = GlCompiler { gl: &self.gl };
        if self.shader_cache.is_none() || self.cache_path != settings.shader_cache_path {
            self.programs = None;
            if let Some(mut old) = self.shader_cache.take() {
                old.clear(&mut compiler);
            }
            self.cache_path = settings.shader_cache_path.clone();
            let flavor = if self.caps.glsl_es { "gles" } else { "gl" };
            self.shader_cache = Some(ShaderCache::open(self.cache_path.clone(), flavor));
        }
        let Some(cache) = self.shader_cache.as_mut() else {
            return Err(GpuError::resource("program cache", "not available"));
        };
        let programs = ProgramSet::recompile(
            gen,
            cache,
            &mut compiler,
            settings.uses_downsampling(),
            &bind_batch_attributes,
        )?;
        unsafe { self.bind_program_resources(&programs) };
        self.programs = Some(programs);
        self.ubo_bound = false;
        Ok(())
    }

    fn shader_cache_stats(&self) -> CacheStats {
        self.shader_cache.as_ref().map(|c| c.stats()).unwrap_or_default()
    }

    fn clear_framebuffer(&mut self) {
        let Some(targets) = self.targets.as_ref() else {
            return;
        };
        let gl = &*self.gl;
        unsafe {
            gl.disable(glow::SCISSOR_TEST);
            gl.color_mask(true, true, true, true);
            gl.depth_mask(true);
            gl.clear_color(0.0, 0.0, 0.0, 0.0);
            gl.clear_depth_f32(if self.config.pgxp_depth { 1.0 } else { 0.0 });
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(targets.fbo));
            gl.clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(targets.read.fbo));
            gl.clear(glow::COLOR_BUFFER_BIT);
            gl.enable(glow::SCISSOR_TEST);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
    }

    fn read_vram(&mut self, rect: &Rect, vram: &mut Vram) -> Result<(), GpuError> {
        let rect = rect.intersection(&Rect::FULL_VRAM);
        if rect.is_empty() {
            return Ok(());
        }
        let (Some(programs), Some(targets)) = (self.programs.as_ref(), self.targets.as_ref()) else {
            return Err(GpuError::resource("VRAM readback", "renderer not initialized"));
        };
        let gl = &*self.gl;
        let (width, height) = (rect.width(), rect.height());
        let mut bytes = vec![0u8; (width * height * 4) as usize];
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(targets.encode.fbo));
            gl.viewport(0, 0, width as i32, height as i32);
            gl.disable(glow::DEPTH_TEST);
            gl.disable(glow::SCISSOR_TEST);
            gl.disable(glow::BLEND);
            gl.use_program(Some(programs.read));
            self.bind_texture(0, targets.texture_target, targets.color);
            gl.uniform_1_i32(gl.get_uniform_location(programs.read, "samp0").as_ref(), 0);
            gl.uniform_4_u32(
                gl.get_uniform_location(programs.read, "u_read_rect").as_ref(),
                rect.left,
                rect.top,
                width,
                height,
            );
            gl.bind_vertex_array(self.empty_vao);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);

            gl.pixel_store_i32(glow::PACK_ALIGNMENT, 4);
            gl.read_pixels(
                0,
                0,
                width as i32,
                height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(&mut bytes),
            );
            gl.enable(glow::SCISSOR_TEST);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }

        let words: Vec<u16> = bytes
            .chunks_exact(4)
            .map(|p| ColorOps::rgba8888_to_rgba5551(u32::from_le_bytes([p[0], p[1], p[2], p[3]])))
            .collect();
        vram.store_rect(&rect, &words);
        Ok(())
    }

    fn fill_vram(&mut self, op: &FillOp) {
        let Some(programs) = self.programs.as_ref() else {
            return;
        };
        let wrapped = is_oversized(op.x, op.y, op.width, op.height);
        let program = *programs.fill(wrapped, op.skip_field.is_some());
        unsafe {
            if self.begin_vram_pass(DepthFunc::Always).is_none() {
                return;
            }
            let gl = &*self.gl;
            gl.use_program(Some(program));
            let [r, g, b, a] = ColorOps::unpack_rgba(ColorOps::rgba5551_to_rgba8888(op.color));
            gl.uniform_4_f32(
                gl.get_uniform_location(program, "u_fill_color").as_ref(),
                r as f32 / 255.0,
                g as f32 / 255.0,
                b as f32 / 255.0,
                a as f32 / 255.0,
            );
            gl.uniform_4_u32(
                gl.get_uniform_location(program, "u_fill_rect").as_ref(),
                op.x & VRAM_WIDTH_MASK,
                op.y & VRAM_HEIGHT_MASK,
                op.width,
                op.height,
            );
            gl.uniform_1_u32(
                gl.get_uniform_location(program, "u_interlaced_displayed_field").as_ref(),
                op.skip_field.unwrap_or(0),
            );
            let pieces = split_wrapped(op.x, op.y, op.width, op.height).into_iter().map(|p| p.rect);
            self.draw_pieces(pieces);
        }
    }

    fn update_vram(&mut self, op: &WriteOp<'_>) {
        if op.width == 0 || op.height == 0 {
            return;
        }
        let write_program = self.programs.as_ref().and_then(|p| p.write);
        unsafe {
            if let Some(program) = write_program {
                if self.update_vram_ssbo(op, program) {
                    return;
                }
                log(LogCategory::Vram, LogLevel::Warn, || {
                    format!("{}x{} write does not fit the write stream, uploading", op.width, op.height)
                });
            }
            // Plain uploads only see unmasked writes inside VRAM
            let Some(upload) = self.targets.as_ref().map(|t| t.upload) else {
                return;
            };
            let rect = Rect::from_extents(op.x, op.y, op.width, op.height).intersection(&Rect::FULL_VRAM);
            let words: Vec<u16> = if op.set_mask {
                op.data.iter().map(|w| w | MASK_BIT).collect()
            } else {
                op.data.to_vec()
            };
            self.stage_native(&upload, &rect, &words);
            self.resolve_read_region(&rect, 1.0);
        }
    }

    fn copy_vram(&mut self, op: &CopyOp) {
        let Some(programs) = self.programs.as_ref() else {
            return;
        };
        let program = programs.copy;
        unsafe {
            let Some(targets) = self.begin_vram_pass(self.mask_depth_func(op.check_mask)) else {
                return;
            };
            let gl = &*self.gl;
            gl.use_program(Some(program));
            self.bind_texture(0, glow::TEXTURE_2D, targets.read.texture);
            let location = |name: &str| gl.get_uniform_location(program, name);
            gl.uniform_1_i32(location("samp0").as_ref(), 0);
            gl.uniform_4_u32(
                location("u_src_dst").as_ref(),
                op.src_x & VRAM_WIDTH_MASK,
                op.src_y & VRAM_HEIGHT_MASK,
                op.dst_x & VRAM_WIDTH_MASK,
                op.dst_y & VRAM_HEIGHT_MASK,
            );
            gl.uniform_2_u32(location("u_size").as_ref(), op.width, op.height);
            gl.uniform_1_u32(location("u_set_mask_bit").as_ref(), op.set_mask as u32);
            gl.uniform_1_f32(location("u_depth_value").as_ref(), op.depth);
            let pieces = split_wrapped(op.dst_x, op.dst_y, op.width, op.height).into_iter().map(|p| p.rect);
            self.draw_pieces(pieces);
        }
    }

    fn update_vram_read_texture(&mut self, rect: &Rect) {
        let Some(targets) = self.targets.as_ref() else {
            return;
        };
        let rect = rect.intersection(&Rect::FULL_VRAM);
        if rect.is_empty() {
            return;
        }
        let (x, y, w, h) = gl_rect(&rect, self.scale());
        let gl = &*self.gl;
        unsafe {
            gl.bind_framebuffer(glow::READ_FRAMEBUFFER, Some(targets.fbo));
            gl.bind_framebuffer(glow::DRAW_FRAMEBUFFER, Some(targets.read.fbo));
            gl.disable(glow::SCISSOR_TEST);
            gl.blit_framebuffer(x, y, x + w, y + h, x, y, x + w, y + h, glow::COLOR_BUFFER_BIT, glow::NEAREST);
            gl.enable(glow::SCISSOR_TEST);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
    }

    fn update_depth_buffer_from_mask_bit(&mut self) {
        let (Some(programs), Some(targets)) = (self.programs.as_ref(), self.targets.as_ref()) else {
            return;
        };
        let program = programs.update_depth;
        let gl = &*self.gl;
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(targets.depth_fbo));
            gl.viewport(0, 0, self.config.width() as i32, self.config.height() as i32);
            gl.disable(glow::SCISSOR_TEST);
            gl.disable(glow::BLEND);
            gl.enable(glow::DEPTH_TEST);
            gl.depth_func(glow::ALWAYS);
            gl.depth_mask(true);
            gl.use_program(Some(program));
            self.bind_texture(0, targets.texture_target, targets.color);
            gl.uniform_1_i32(gl.get_uniform_location(program, "samp0").as_ref(), 0);
            gl.bind_vertex_array(self.empty_vao);
            gl.draw_arrays(glow::TRIANGLES, 0, 3);
            gl.enable(glow::SCISSOR_TEST);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
    }

    fn clear_depth_buffer(&mut self) {
        let Some(targets) = self.targets.as_ref() else {
            return;
        };
        let gl = &*self.gl;
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(targets.fbo));
            gl.disable(glow::SCISSOR_TEST);
            gl.depth_mask(true);
            gl.clear_depth_f32(if self.config.pgxp_depth { 1.0 } else { 0.0 });
            gl.clear(glow::DEPTH_BUFFER_BIT);
            gl.enable(glow::SCISSOR_TEST);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
    }

    fn set_scissor(&mut self, area: &DrawingArea) {
        self.scissor = area.flipped_scissor(self.scale(), self.config.height());
    }

    fn draw_batch(&mut self, draw: &BatchDraw<'_>) {
        if draw.vertices.len() < 3 {
            return;
        }
        let (Some(vertex_buffer), Some(uniform_buffer)) = (self.vertex_buffer, self.uniform_buffer) else {
            return;
        };
        let gl = &*self.gl;
        let mut fences = GlFences { gl };

        let bytes: &[u8] = bytemuck::cast_slice(draw.vertices);
        let Some(mapping) = self.vertex_stream.map(&mut fences, VERTEX_STRIDE as u32, bytes.len() as u32) else {
            log(LogCategory::Rasterizer, LogLevel::Warn, || {
                format!("batch of {} vertices does not fit the vertex stream", draw.vertices.len())
            });
            return;
        };
        unsafe {
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vertex_buffer));
            gl.buffer_sub_data_u8_slice(glow::ARRAY_BUFFER, mapping.offset as i32, bytes);
        }
        self.vertex_stream.unmap(bytes.len() as u32);
        let first = mapping.index_aligned as i32;

        if draw.ubo_dirty || !self.ubo_bound {
            if let Some(ubo) = self.uniform_stream.map(&mut fences, self.ubo_alignment, UBO_SIZE as u32) {
                unsafe {
                    gl.bind_buffer(glow::UNIFORM_BUFFER, Some(uniform_buffer));
                    gl.buffer_sub_data_u8_slice(glow::UNIFORM_BUFFER, ubo.offset as i32, bytemuck::bytes_of(draw.ubo));
                    gl.bind_buffer_range(
                        glow::UNIFORM_BUFFER,
                        UBO_BINDING,
                        Some(uniform_buffer),
                        ubo.offset as i32,
                        UBO_SIZE as i32,
                    );
                }
                self.uniform_stream.unmap(UBO_SIZE as u32);
                self.ubo_bound = true;
            }
        }

        let Some(programs) = self.programs.as_ref() else {
            return;
        };
        let config = draw.config;
        unsafe {
            let Some(targets) = self.begin_vram_pass(config.depth_func()) else {
                return;
            };
            let (x, y, w, h) = self.scissor;
            gl.scissor(x, y, w, h);
            self.bind_texture(0, glow::TEXTURE_2D, targets.read.texture);
            gl.bind_vertex_array(self.batch_vao);
            for &pass in config.passes() {
                let program = *programs.batch(pass, config.texture_mode, config.dithering, config.interlacing);
                gl.use_program(Some(program));
                self.apply_blend(&BlendState::for_pass(config.transparency_mode, pass, self.caps.dual_source_blend));
                gl.draw_arrays(glow::TRIANGLES, first, draw.vertices.len() as i32);
            }
            gl.disable(glow::BLEND);
        }
    }

    fn update_display(&mut self, host: &mut dyn HostDisplay, plan: &DisplayPlan) -> Result<(), GpuError> {
        host.set_display_parameters(plan.params);
        match &plan.path {
            DisplayPath::Clear => {
                self.clear_display(host);
                Ok(())
            }
            DisplayPath::Direct(rect) => unsafe { self.display_direct(host, rect) },
            DisplayPath::Reinterpret(pass) => unsafe { self.display_reinterpret(host, pass) },
        }
    }

    fn clear_display(&mut self, host: &mut dyn HostDisplay) {
        host.clear_display_texture();
    }

    fn prepare_state_texture(&mut self, width: u32, height: u32) -> Result<bool, GpuError> {
        if matches!(self.state, Some(t) if t.width == width && t.height == height) {
            return Ok(false);
        }
        if width == 0 || height == 0 || width > VRAM_WIDTH || height > VRAM_HEIGHT {
            return Err(GpuError::resource("state texture", format!("invalid size {}x{}", width, height)));
        }
        unsafe {
            if let Some(state) = self.state.take() {
                state.destroy(&self.gl);
            }
            self.state = Some(ColorTarget::new(&self.gl, "state texture", width, height)?);
        }
        Ok(true)
    }

    fn upload_state(&mut self, words: &[u16]) {
        let Some(state) = self.state else {
            log(LogCategory::Vram, LogLevel::Error, || "state upload without a state texture".to_string());
            return;
        };
        let rect = Rect::from_extents(0, 0, state.width, state.height);
        let count = (state.width * state.height) as usize;
        if words.len() < count {
            log(LogCategory::Vram, LogLevel::Error, || {
                format!("state upload of {} words for a {}x{} texture", words.len(), state.width, state.height)
            });
            return;
        }
        unsafe {
            self.stage_native(&state, &rect, &words[..count]);
            self.resolve_read_region(&rect, 1.0);
        }
    }

    fn shutdown(&mut self, _host: &mut dyn HostDisplay) {
        let mut fences = GlFences { gl: &self.gl };
        self.vertex_stream.wait_all(&mut fences);
        self.uniform_stream.wait_all(&mut fences);
        self.upload_stream.wait_all(&mut fences);
        unsafe { self.release() };
    }
}

impl Drop for OpenGLBackend {
    fn drop(&mut self) {
        unsafe { self.release() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::host_display::{HeadlessDisplay, RenderApi};

    #[test]
    fn test_gl_rect_flips_rows() {
        let rect = Rect::new(0, 0, 16, 8);
        assert_eq!(gl_rect(&rect, 1), (0, 504, 16, 8));
        assert_eq!(gl_rect(&rect, 2), (0, 1008, 32, 16));
        assert_eq!(gl_rect(&Rect::FULL_VRAM, 3), (0, 0, 3072, 1536));
    }

    #[test]
    fn test_state_mappings() {
        assert_eq!(gl_depth_func(DepthFunc::GEqual), glow::GEQUAL);
        assert_eq!(gl_depth_func(DepthFunc::LEqual), glow::LEQUAL);
        assert_eq!(gl_blend_factor(BlendFactor::Src1Alpha), glow::SRC1_ALPHA);
        assert_eq!(gl_blend_factor(BlendFactor::ConstantAlpha), glow::CONSTANT_ALPHA);
    }

    #[test]
    fn test_rgba_bytes_carry_mask_in_alpha() {
        assert_eq!(rgba_bytes(&[0x801F, 0x7C00]), vec![0xFF, 0, 0, 0xFF, 0, 0, 0xFF, 0]);
    }

    #[test]
    fn test_headless_host_is_not_opengl() {
        // No context can be made in unit tests; only the API check runs
        let host = HeadlessDisplay::with_render_api(RenderApi::Vulkan);
        assert!(!host.render_api().is_opengl());
        assert_eq!(BATCH_ATTRIBUTES.len(), BatchVertex::ATTRIBUTE_OFFSETS.len());
    }
}
