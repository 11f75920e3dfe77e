//! CPU implementation of the hardware renderer.
//!
//! Keeps the same resources a GPU backend would: a resolution-scaled,
//! optionally multisampled VRAM target whose depth buffer carries the mask
//! bit, a resolved read texture for sampling and copies, a display target
//! and a downsample target. Generated programs are still built through the
//! program cache (and checked for structural errors) so that both backends
//! go through the same initialisation.

use std::convert::Infallible;
use std::ops::Range;
use std::path::PathBuf;

use emu_core::graphics::{ColorOps, DepthFunc};
use emu_core::host_display::{DisplayView, HostDisplay, HostPixelFormat, TextureHandle};
use emu_core::logging::{log, LogCategory, LogLevel};

use super::{Capabilities, CopyOp, FillOp, FramebufferConfig, GpuBackend, VramWritePath, WriteOp};
use crate::batch::{
    BatchDraw, BatchUboData, BatchVertex, BlendState, UNIFORM_BUFFER_SIZE, VERTEX_BUFFER_SIZE,
    VRAM_UPDATE_BUFFER_SIZE,
};
use crate::display::{box_downsample, compose, DisplayPath, DisplayPlan, ReinterpretPass};
use crate::programs::ProgramSet;
use crate::rasterizer::{draw_triangle, DrawState, PipelineOptions, Surface, TextureSource};
use crate::render_pass::{AttachmentFormat, LoadOp, RenderPassCache, RenderPassKey};
use crate::settings::{GpuSettings, MAX_RESOLUTION_SCALE};
use crate::shader_cache::{CacheStats, ProgramBinary, ProgramCompiler, ShaderCache};
use crate::shadergen::ShaderGen;
use crate::stream_buffer::{ImmediateFences, StreamBuffer, StreamStats};
use crate::types::{DrawingArea, InterlacedRenderMode};
use crate::vram::{split_wrapped, Rect, Vram, MASK_BIT, VRAM_HEIGHT, VRAM_HEIGHT_MASK, VRAM_WIDTH, VRAM_WIDTH_MASK};
use crate::GpuError;

const BINARY_FORMAT: u32 = 0x5357_0001;
const UBO_SIZE: usize = std::mem::size_of::<BatchUboData>();

fn check_source(stage: &str, source: &str) -> Result<(), String> {
    if !source.starts_with("#version ") {
        return Err(format!("{} shader: missing #version", stage));
    }
    if !source.contains("void main()") {
        return Err(format!("{} shader: no entry point", stage));
    }
    let mut open = 0i32;
    for (number, line) in source.lines().enumerate() {
        let line = line.trim_start();
        if line.starts_with("#if") {
            open += 1;
        } else if line.starts_with("#endif") {
            open -= 1;
            if open < 0 {
                return Err(format!("{} shader:{}: #endif without #if", stage, number + 1));
            }
        }
    }
    if open != 0 {
        return Err(format!("{} shader: {} unterminated #if", stage, open));
    }
    Ok(())
}

/// Checks generated sources for structural errors. Programs are plain ids.
#[derive(Debug, Default)]
pub struct SoftwareCompiler {
    next_id: u32,
    live: usize,
}

impl ProgramCompiler for SoftwareCompiler {
    type Program = u32;

    fn compile_program(
        &mut self,
        vertex: &str,
        fragment: &str,
        pre_link: &dyn Fn(&mut Self, &u32),
    ) -> Result<u32, String> {
        check_source("vertex", vertex)?;
        check_source("fragment", fragment)?;
        self.next_id += 1;
        self.live += 1;
        let id = self.next_id;
        pre_link(self, &id);
        Ok(id)
    }

    fn get_program_binary(&mut self, program: &u32) -> Option<ProgramBinary> {
        Some(ProgramBinary {
            format: BINARY_FORMAT,
            data: program.to_le_bytes().to_vec(),
        })
    }

    fn create_program_from_binary(&mut self, binary: &ProgramBinary) -> Option<u32> {
        if binary.format != BINARY_FORMAT || binary.data.len() != 4 {
            return None;
        }
        self.next_id += 1;
        self.live += 1;
        Some(self.next_id)
    }

    fn destroy_program(&mut self, _program: u32) {
        self.live = self.live.saturating_sub(1);
    }
}

fn no_pre_link(_: &mut SoftwareCompiler, _: &u32) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TargetPass {
    load_op: LoadOp,
}

fn begin_pass(passes: &mut RenderPassCache<TargetPass>, key: RenderPassKey, target: &mut [u32]) {
    let pass = match passes.get_or_create(key, |k| Ok::<_, Infallible>(TargetPass { load_op: k.load_op })) {
        Ok(pass) => pass,
        Err(never) => match never {},
    };
    if pass.load_op == LoadOp::Clear {
        target.fill(0);
    }
}

#[derive(Debug, Clone, Copy)]
struct HostTexture {
    handle: TextureHandle,
    width: u32,
    height: u32,
}

/// Store `color` into every sample of the scaled block of native pixel
/// (`x`, `y`) that passes the depth test
#[allow(clippy::too_many_arguments)]
fn write_block(surface: &mut Surface, x: u32, y: u32, scale: u32, color: u32, depth: f32, func: DepthFunc) {
    let width = surface.width();
    for plane in surface.planes_mut() {
        for sy in y * scale..(y + 1) * scale {
            for sx in x * scale..(x + 1) * scale {
                if plane.depth.test_and_update(sx, sy, depth, func, true) {
                    plane.color[(sy * width + sx) as usize] = color;
                }
            }
        }
    }
}

pub struct SoftwareBackend {
    caps: Capabilities,
    config: FramebufferConfig,
    options: PipelineOptions,
    surface: Surface,
    read_texture: Vec<u32>,
    scissor: Rect,

    vertex_stream: StreamBuffer<u64>,
    vertex_storage: Vec<BatchVertex>,
    uniform_stream: StreamBuffer<u64>,
    uniform_storage: Vec<u8>,
    ubo_offset: Option<usize>,
    upload_stream: StreamBuffer<u64>,
    upload_storage: Vec<u16>,
    fences: ImmediateFences,

    render_passes: RenderPassCache<TargetPass>,
    display_texture: Vec<u32>,
    display_size: (u32, u32),
    downsample_texture: Vec<u32>,
    direct_texture: Option<HostTexture>,
    state_texture: Option<(u32, u32, Vec<u16>)>,

    compiler: SoftwareCompiler,
    shader_cache: Option<ShaderCache<u32>>,
    cache_path: Option<PathBuf>,
    programs: Option<ProgramSet<u32>>,
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareBackend {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities {
            max_resolution_scale: MAX_RESOLUTION_SCALE,
            max_multisamples: 4,
            dual_source_blend: true,
            per_sample_shading: true,
            vram_write_path: VramWritePath::StorageBuffer,
            glsl_es: false,
        })
    }

    /// Pretend to have a different feature set, e.g. no shader write path
    pub fn with_capabilities(caps: Capabilities) -> Self {
        let caps = Capabilities {
            max_resolution_scale: caps.max_resolution_scale.clamp(1, MAX_RESOLUTION_SCALE),
            max_multisamples: caps.max_multisamples.clamp(1, 4),
            ..caps
        };
        let config = FramebufferConfig {
            resolution_scale: 1,
            multisamples: 1,
            pgxp_depth: false,
            downsample: false,
        };
        Self {
            caps,
            config,
            options: PipelineOptions::default(),
            surface: Surface::new(VRAM_WIDTH, VRAM_HEIGHT, 1),
            read_texture: vec![0; (VRAM_WIDTH * VRAM_HEIGHT) as usize],
            scissor: Rect::FULL_VRAM,
            vertex_stream: StreamBuffer::new(VERTEX_BUFFER_SIZE),
            vertex_storage: vec![BatchVertex::default(); VERTEX_BUFFER_SIZE as usize / std::mem::size_of::<BatchVertex>()],
            uniform_stream: StreamBuffer::new(UNIFORM_BUFFER_SIZE),
            uniform_storage: vec![0; UNIFORM_BUFFER_SIZE as usize],
            ubo_offset: None,
            upload_stream: StreamBuffer::new(VRAM_UPDATE_BUFFER_SIZE),
            upload_storage: vec![0; VRAM_UPDATE_BUFFER_SIZE as usize / 2],
            fences: ImmediateFences::default(),
            render_passes: RenderPassCache::new(),
            display_texture: Vec::new(),
            display_size: (0, 0),
            downsample_texture: Vec::new(),
            direct_texture: None,
            state_texture: None,
            compiler: SoftwareCompiler::default(),
            shader_cache: None,
            cache_path: None,
            programs: None,
        }
    }

    pub fn vertex_stream_stats(&self) -> StreamStats {
        self.vertex_stream.stats()
    }

    /// Number of programs in the current set, 0 before compilation
    pub fn program_count(&self) -> usize {
        self.programs.as_ref().map_or(0, |p| p.count())
    }

    pub fn render_pass_count(&self) -> usize {
        self.render_passes.len()
    }

    fn scale(&self) -> u32 {
        self.config.resolution_scale
    }

    /// Depth stored alongside a utility write. With PGXP the buffer holds
    /// geometry depth and utility writes reset it to the far plane.
    fn mask_depth(&self, masked: bool, depth: f32) -> f32 {
        if self.config.pgxp_depth {
            1.0
        } else if masked {
            depth
        } else {
            0.0
        }
    }

    fn mask_depth_func(&self, check_mask: bool) -> DepthFunc {
        if check_mask && !self.config.pgxp_depth {
            DepthFunc::GEqual
        } else {
            DepthFunc::Always
        }
    }

    fn stage_vertices(&mut self, vertices: &[BatchVertex]) -> Option<Range<usize>> {
        let stride = std::mem::size_of::<BatchVertex>() as u32;
        let bytes = vertices.len() as u32 * stride;
        let mapping = self.vertex_stream.map(&mut self.fences, stride, bytes)?;
        let start = mapping.index_aligned as usize;
        self.vertex_storage[start..start + vertices.len()].copy_from_slice(vertices);
        self.vertex_stream.unmap(bytes);
        Some(start..start + vertices.len())
    }

    fn stage_ubo(&mut self, ubo: &BatchUboData) {
        match self.uniform_stream.map(&mut self.fences, 256, UBO_SIZE as u32) {
            Some(mapping) => {
                let offset = mapping.offset as usize;
                self.uniform_storage[offset..offset + UBO_SIZE].copy_from_slice(bytemuck::bytes_of(ubo));
                self.uniform_stream.unmap(UBO_SIZE as u32);
                self.ubo_offset = Some(offset);
            }
            None => self.ubo_offset = None,
        }
    }

    fn stage_upload(&mut self, data: &[u16]) -> Option<Range<usize>> {
        let bytes = data.len() as u32 * 2;
        let mapping = self.upload_stream.map(&mut self.fences, 2, bytes)?;
        let start = mapping.index_aligned as usize;
        self.upload_storage[start..start + data.len()].copy_from_slice(data);
        self.upload_stream.unmap(bytes);
        Some(start..start + data.len())
    }

    fn trace_program(&self, what: &str, program: Option<u32>) {
        log(LogCategory::Rasterizer, LogLevel::Trace, || match program {
            Some(id) => format!("{} with program {}", what, id),
            None => format!("{} without a program set", what),
        });
    }

    fn display_direct(&mut self, host: &mut dyn HostDisplay, rect: &Rect) -> Result<(), GpuError> {
        let (width, height) = (rect.width(), rect.height());
        let handle = match self.direct_texture {
            Some(texture) if texture.width == width && texture.height == height => texture.handle,
            stale => {
                if let Some(texture) = stale {
                    host.destroy_texture(texture.handle);
                    self.direct_texture = None;
                }
                match host.create_texture(width, height, 1, HostPixelFormat::Rgba8, None, 0, true) {
                    Ok(handle) => {
                        self.direct_texture = Some(HostTexture { handle, width, height });
                        handle
                    }
                    Err(e) => {
                        log(LogCategory::Display, LogLevel::Warn, || {
                            format!("display texture allocation failed, skipping frame: {}", e)
                        });
                        return Ok(());
                    }
                }
            }
        };

        let mut bytes = Vec::with_capacity((width * height * 4) as usize);
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                bytes.extend_from_slice(&(self.surface.resolved(x, y) | 0xFF00_0000).to_le_bytes());
            }
        }
        host.update_texture(handle, 0, 0, width, height, &bytes, width * 4)?;
        host.set_display_texture(DisplayView {
            handle,
            format: HostPixelFormat::Rgba8,
            texture_width: width,
            texture_height: height,
            view_x: 0,
            view_y: 0,
            view_width: width as i32,
            view_height: height as i32,
        });
        Ok(())
    }

    fn display_reinterpret(&mut self, host: &mut dyn HostDisplay, pass: &ReinterpretPass) {
        let program = self.programs.as_ref().map(|p| *p.display(pass.depth_24bit, pass.interlace));
        self.trace_program("display pass", program);

        let size = (pass.width, pass.height);
        let resized = self.display_size != size;
        if resized {
            self.display_texture.resize((pass.width * pass.height) as usize, 0);
            self.display_size = size;
        }
        let load_op = if resized {
            LoadOp::Clear
        } else if pass.interlace != InterlacedRenderMode::None {
            LoadOp::Load
        } else {
            LoadOp::DontCare
        };
        begin_pass(
            &mut self.render_passes,
            RenderPassKey::color(AttachmentFormat::Rgba8, load_op),
            &mut self.display_texture,
        );

        let scale = self.config.resolution_scale;
        let surface = &self.surface;
        let (surface_width, surface_height) = (surface.width(), surface.height());
        compose(
            pass,
            scale,
            |x, y| {
                ColorOps::rgba8888_to_rgba5551(
                    surface.first((x & VRAM_WIDTH_MASK) * scale, (y & VRAM_HEIGHT_MASK) * scale),
                )
            },
            |x, y| surface.resolved(x % surface_width, y % surface_height),
            &mut self.display_texture,
        );

        let (image, width, height) = match pass.downsample_to {
            Some((width, height)) => {
                begin_pass(
                    &mut self.render_passes,
                    RenderPassKey::color(AttachmentFormat::Rgba8, LoadOp::DontCare),
                    &mut self.downsample_texture,
                );
                self.downsample_texture = box_downsample(&self.display_texture, pass.width, pass.height, scale);
                (&self.downsample_texture, width, height)
            }
            None => (&self.display_texture, pass.width, pass.height),
        };

        match host.begin_set_display_pixels(HostPixelFormat::Rgba8, width, height) {
            Some(out) => {
                for (dst, pixel) in out.chunks_exact_mut(4).zip(image.iter()) {
                    dst.copy_from_slice(&pixel.to_le_bytes());
                }
                host.end_set_display_pixels();
            }
            None => log(LogCategory::Display, LogLevel::Warn, || {
                format!("no {}x{} display buffer available, skipping frame", width, height)
            }),
        }
    }
}

impl GpuBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "Software"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn initialize(&mut self, host: &mut dyn HostDisplay) -> Result<(), GpuError> {
        let caps = self.caps;
        log(LogCategory::Rasterizer, LogLevel::Info, || {
            format!(
                "software renderer on {:?} host: max scale {}, max {}x MSAA, write path {:?}",
                host.render_api(),
                caps.max_resolution_scale,
                caps.max_multisamples,
                caps.vram_write_path
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
        self.config = *config;
        self.options.scale = config.resolution_scale;
        self.surface = Surface::new(config.width(), config.height(), config.multisamples);
        self.read_texture = vec![0; (config.width() * config.height()) as usize];
        self.display_size = (0, 0);
        self.display_texture.clear();
        self.downsample_texture.clear();
        self.scissor = Rect::FULL_VRAM.scaled(config.resolution_scale);
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
        if self.shader_cache.is_none() || self.cache_path != settings.shader_cache_path {
            self.programs = None;
            if let Some(mut old) = self.shader_cache.take() {
                old.clear(&mut self.compiler);
            }
            self.cache_path = settings.shader_cache_path.clone();
            self.shader_cache = Some(ShaderCache::open(self.cache_path.clone(), "software"));
        }
        let Some(cache) = self.shader_cache.as_mut() else {
            return Err(GpuError::resource("program cache", "not available"));
        };
        let programs = ProgramSet::recompile(gen, cache, &mut self.compiler, settings.uses_downsampling(), &no_pre_link)?;
        self.options = PipelineOptions::from_gen(gen);
        self.options.scale = self.config.resolution_scale;
        self.programs = Some(programs);
        Ok(())
    }

    fn shader_cache_stats(&self) -> CacheStats {
        self.shader_cache.as_ref().map(|c| c.stats()).unwrap_or_default()
    }

    fn clear_framebuffer(&mut self) {
        self.surface.clear();
        self.read_texture.fill(0);
        if self.config.pgxp_depth {
            self.surface.clear_depth(1.0);
        }
    }

    fn read_vram(&mut self, rect: &Rect, vram: &mut Vram) -> Result<(), GpuError> {
        let rect = rect.intersection(&Rect::FULL_VRAM);
        if rect.is_empty() {
            return Ok(());
        }
        let program = self.programs.as_ref().map(|p| p.read);
        self.trace_program("vram read", program);

        let scale = self.scale();
        let mut words = Vec::with_capacity((rect.width() * rect.height()) as usize);
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                words.push(ColorOps::rgba8888_to_rgba5551(self.surface.first(x * scale, y * scale)));
            }
        }
        vram.store_rect(&rect, &words);
        Ok(())
    }

    fn fill_vram(&mut self, op: &FillOp) {
        let wrapped = crate::vram::is_oversized(op.x, op.y, op.width, op.height);
        let program = self.programs.as_ref().map(|p| *p.fill(wrapped, op.skip_field.is_some()));
        self.trace_program("vram fill", program);

        let scale = self.scale();
        let color = ColorOps::rgba5551_to_rgba8888(op.color);
        let depth = self.mask_depth(op.color & MASK_BIT != 0, 1.0);
        let width = self.surface.width();
        for piece in split_wrapped(op.x, op.y, op.width, op.height) {
            let rect = piece.rect;
            for ny in rect.top..rect.bottom {
                if op.skip_field.map_or(false, |field| (ny & 1) == field) {
                    continue;
                }
                for plane in self.surface.planes_mut() {
                    for sy in ny * scale..(ny + 1) * scale {
                        let row = (sy * width) as usize;
                        plane.color[row + (rect.left * scale) as usize..row + (rect.right * scale) as usize].fill(color);
                    }
                    plane.depth.fill_rect(rect.left * scale, ny * scale, rect.right * scale, (ny + 1) * scale, depth);
                }
            }
        }
    }

    fn update_vram(&mut self, op: &WriteOp<'_>) {
        let shader_path = self.caps.vram_write_path.is_shader();
        let program = if shader_path { self.programs.as_ref().and_then(|p| p.write) } else { None };
        self.trace_program("vram write", program);

        let staged = self.stage_upload(op.data);
        let scale = self.scale();
        let mask_or = if op.set_mask { MASK_BIT } else { 0 };
        let func = if shader_path { self.mask_depth_func(op.check_mask) } else { DepthFunc::Always };
        let set_depth = if shader_path { op.depth } else { 1.0 };
        let pgxp = self.config.pgxp_depth;

        let words: &[u16] = match staged {
            Some(range) => &self.upload_storage[range],
            None => op.data,
        };
        for row in 0..op.height {
            for col in 0..op.width {
                let value = words[(row * op.width + col) as usize] | mask_or;
                let x = (op.x + col) & VRAM_WIDTH_MASK;
                let y = (op.y + row) & VRAM_HEIGHT_MASK;
                let depth = if pgxp {
                    1.0
                } else if value & MASK_BIT != 0 {
                    set_depth
                } else {
                    0.0
                };
                write_block(&mut self.surface, x, y, scale, ColorOps::rgba5551_to_rgba8888(value), depth, func);
            }
        }
    }

    fn copy_vram(&mut self, op: &CopyOp) {
        let program = self.programs.as_ref().map(|p| p.copy);
        self.trace_program("vram copy", program);

        let scale = self.scale();
        let func = self.mask_depth_func(op.check_mask);
        let width = self.surface.width();
        for row in 0..op.height {
            for col in 0..op.width {
                let (sx, sy) = ((op.src_x + col) & VRAM_WIDTH_MASK, (op.src_y + row) & VRAM_HEIGHT_MASK);
                let (dx, dy) = ((op.dst_x + col) & VRAM_WIDTH_MASK, (op.dst_y + row) & VRAM_HEIGHT_MASK);
                for j in 0..scale {
                    for i in 0..scale {
                        let texel = self.read_texture[((sy * scale + j) * width + sx * scale + i) as usize];
                        let masked = op.set_mask || (texel >> 24) >= 0x80;
                        let color = (texel & 0x00FF_FFFF) | if masked { 0xFF00_0000 } else { 0 };
                        let depth = self.mask_depth(masked, op.depth);
                        let (tx, ty) = (dx * scale + i, dy * scale + j);
                        for plane in self.surface.planes_mut() {
                            if plane.depth.test_and_update(tx, ty, depth, func, true) {
                                plane.color[(ty * width + tx) as usize] = color;
                            }
                        }
                    }
                }
            }
        }
    }

    fn update_vram_read_texture(&mut self, rect: &Rect) {
        let scaled = rect.intersection(&Rect::FULL_VRAM).scaled(self.scale());
        let width = self.surface.width();
        for y in scaled.top..scaled.bottom {
            for x in scaled.left..scaled.right {
                self.read_texture[(y * width + x) as usize] = self.surface.resolved(x, y);
            }
        }
    }

    fn update_depth_buffer_from_mask_bit(&mut self) {
        let program = self.programs.as_ref().map(|p| p.update_depth);
        self.trace_program("depth from mask", program);

        let (width, height) = (self.surface.width(), self.surface.height());
        for y in 0..height {
            for x in 0..width {
                let depth = if self.surface.first(x, y) >> 31 != 0 { 1.0 } else { 0.0 };
                for plane in self.surface.planes_mut() {
                    plane.depth.set(x, y, depth);
                }
            }
        }
    }

    fn clear_depth_buffer(&mut self) {
        let value = if self.config.pgxp_depth { 1.0 } else { 0.0 };
        self.surface.clear_depth(value);
    }

    fn set_scissor(&mut self, area: &DrawingArea) {
        self.scissor = area.scissor(self.scale());
    }

    fn draw_batch(&mut self, draw: &BatchDraw<'_>) {
        if draw.vertices.len() < 3 {
            return;
        }
        let Some(range) = self.stage_vertices(draw.vertices) else {
            log(LogCategory::Rasterizer, LogLevel::Warn, || {
                format!("batch of {} vertices does not fit the vertex stream", draw.vertices.len())
            });
            return;
        };
        if draw.ubo_dirty || self.ubo_offset.is_none() {
            self.stage_ubo(draw.ubo);
        }
        let ubo: BatchUboData = match self.ubo_offset {
            Some(offset) => bytemuck::pod_read_unaligned(&self.uniform_storage[offset..offset + UBO_SIZE]),
            None => *draw.ubo,
        };

        let config = draw.config;
        let key = RenderPassKey {
            color_format: AttachmentFormat::Rgba8,
            depth_format: Some(AttachmentFormat::Depth32F),
            samples: self.surface.samples(),
            load_op: LoadOp::Load,
        };
        begin_pass(&mut self.render_passes, key, &mut []);

        for &pass in config.passes() {
            let program = self
                .programs
                .as_ref()
                .map(|p| *p.batch(pass, config.texture_mode, config.dithering, config.interlacing));
            self.trace_program("batch", program);

            let state = DrawState {
                config,
                ubo: &ubo,
                pass,
                blend: BlendState::for_pass(config.transparency_mode, pass, self.caps.dual_source_blend),
                depth_func: config.depth_func(),
                scissor: self.scissor,
                options: self.options,
            };
            let texture = TextureSource {
                texels: &self.read_texture,
                width: self.surface.width(),
                scale: self.config.resolution_scale,
            };
            for triangle in self.vertex_storage[range.clone()].chunks_exact(3) {
                draw_triangle(&mut self.surface, &texture, &state, triangle);
            }
        }
    }

    fn update_display(&mut self, host: &mut dyn HostDisplay, plan: &DisplayPlan) -> Result<(), GpuError> {
        host.set_display_parameters(plan.params);
        match &plan.path {
            DisplayPath::Clear => {
                self.clear_display(host);
                Ok(())
            }
            DisplayPath::Direct(rect) => self.display_direct(host, rect),
            DisplayPath::Reinterpret(pass) => {
                self.display_reinterpret(host, pass);
                Ok(())
            }
        }
    }

    fn clear_display(&mut self, host: &mut dyn HostDisplay) {
        host.clear_display_texture();
    }

    fn prepare_state_texture(&mut self, width: u32, height: u32) -> Result<bool, GpuError> {
        if matches!(&self.state_texture, Some((w, h, _)) if *w == width && *h == height) {
            return Ok(false);
        }
        if width == 0 || height == 0 || width > VRAM_WIDTH || height > VRAM_HEIGHT {
            return Err(GpuError::resource("state texture", format!("invalid size {}x{}", width, height)));
        }
        self.state_texture = Some((width, height, vec![0; (width * height) as usize]));
        Ok(true)
    }

    fn upload_state(&mut self, words: &[u16]) {
        let Some((width, height, texture)) = self.state_texture.as_mut() else {
            log(LogCategory::Vram, LogLevel::Error, || "state upload without a state texture".to_string());
            return;
        };
        let (width, height) = (*width, *height);
        let count = texture.len().min(words.len());
        texture[..count].copy_from_slice(&words[..count]);

        let scale = self.config.resolution_scale;
        for y in 0..height {
            for x in 0..width {
                let color = ColorOps::rgba5551_to_rgba8888(texture[(y * width + x) as usize]);
                for sy in y * scale..(y + 1) * scale {
                    for sx in x * scale..(x + 1) * scale {
                        self.surface.store(sx, sy, color, None);
                    }
                }
            }
        }
    }

    fn shutdown(&mut self, host: &mut dyn HostDisplay) {
        if let Some(texture) = self.direct_texture.take() {
            host.destroy_texture(texture.handle);
        }
        self.vertex_stream.wait_all(&mut self.fences);
        self.uniform_stream.wait_all(&mut self.fences);
        self.upload_stream.wait_all(&mut self.fences);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::shader_gen_for;
    use emu_core::host_display::HeadlessDisplay;

    fn backend(scale: u32, samples: u32) -> SoftwareBackend {
        let mut backend = SoftwareBackend::new();
        let settings = GpuSettings { resolution_scale: scale, multisamples: samples, ..Default::default() };
        backend.initialize(&mut HeadlessDisplay::new()).expect("initialize");
        backend
            .create_framebuffer(&FramebufferConfig::from_settings(&settings))
            .expect("framebuffer");
        let gen = shader_gen_for(&settings, backend.capabilities());
        backend.compile_programs(&gen, &settings).expect("programs");
        backend
    }

    fn read(backend: &mut SoftwareBackend, rect: Rect) -> Vec<u16> {
        let mut vram = Vram::new();
        backend.read_vram(&rect, &mut vram).expect("read");
        vram.read(rect.left, rect.top, rect.width(), rect.height())
    }

    #[test]
    fn test_source_checks() {
        assert!(check_source("vertex", "#version 330 core\nvoid main()\n{\n}\n").is_ok());
        assert!(check_source("vertex", "void main() {}").is_err());
        let err = check_source("fragment", "#version 330 core\n#if A\nvoid main() {}\n").unwrap_err();
        assert!(err.contains("unterminated"), "{}", err);
        assert!(check_source("fragment", "#version 330 core\n#endif\nvoid main() {}").is_err());
    }

    #[test]
    fn test_settings_change_releases_old_programs() {
        let mut backend = backend(1, 1);
        let live = backend.compiler.live;
        assert_eq!(live, 126);

        let scaled = GpuSettings { resolution_scale: 2, ..Default::default() };
        let gen = shader_gen_for(&scaled, backend.capabilities());
        backend.compile_programs(&gen, &scaled).expect("programs");
        assert_eq!(backend.compiler.live, live);
        assert_eq!(backend.shader_cache.as_ref().map(|c| c.len()), Some(live));

        // A new cache location starts over and drops the old cache's programs
        let dir = tempfile::tempdir().expect("tempdir");
        let moved = GpuSettings { shader_cache_path: Some(dir.path().to_path_buf()), ..scaled };
        backend.compile_programs(&gen, &moved).expect("programs");
        assert_eq!(backend.compiler.live, live);
        assert_eq!(backend.shader_cache_stats().compiles, live as u64);
    }

    #[test]
    fn test_programs_compile() {
        let backend = backend(1, 1);
        // Full cross product plus the storage buffer write program
        assert_eq!(backend.program_count(), 158);
        assert_eq!(backend.shader_cache_stats().compiles, 158 - 32);
    }

    #[test]
    fn test_fill_wraps_and_reads_back() {
        let mut backend = backend(2, 1);
        backend.fill_vram(&FillOp { x: 1020, y: 510, width: 8, height: 4, color: 0x8421, skip_field: None });
        assert_eq!(read(&mut backend, Rect::new(1020, 510, 1024, 512)), vec![0x8421; 8]);
        assert_eq!(read(&mut backend, Rect::new(0, 0, 4, 2)), vec![0x8421; 8]);
        assert_eq!(read(&mut backend, Rect::new(4, 0, 5, 1)), vec![0]);
    }

    #[test]
    fn test_fill_skips_displayed_field() {
        let mut backend = backend(1, 1);
        backend.fill_vram(&FillOp { x: 0, y: 0, width: 1, height: 4, color: 0x1234, skip_field: Some(1) });
        assert_eq!(read(&mut backend, Rect::new(0, 0, 1, 4)), vec![0x1234, 0, 0x1234, 0]);
    }

    #[test]
    fn test_masked_write_uses_depth() {
        let mut backend = backend(2, 2);
        let first = [0x0001u16; 4];
        backend.update_vram(&WriteOp {
            x: 10, y: 10, width: 2, height: 2, data: &first, set_mask: true, check_mask: false, depth: 0.9,
        });
        let second = [0x0002u16; 6];
        backend.update_vram(&WriteOp {
            x: 10, y: 10, width: 3, height: 2, data: &second, set_mask: false, check_mask: true, depth: 0.8,
        });
        assert_eq!(read(&mut backend, Rect::new(10, 10, 13, 11)), vec![0x8001, 0x8001, 0x0002]);
    }

    #[test]
    fn test_copy_reads_the_read_texture() {
        let mut backend = backend(1, 1);
        let data = [1u16, 2, 3, 4];
        backend.update_vram(&WriteOp {
            x: 0, y: 0, width: 4, height: 1, data: &data, set_mask: false, check_mask: false, depth: 1.0,
        });
        // Stale read texture: the copy sees zeros
        let op = CopyOp {
            src_x: 0, src_y: 0, dst_x: 1, dst_y: 0, width: 4, height: 1, set_mask: false, check_mask: false, depth: 1.0,
        };
        backend.copy_vram(&op);
        assert_eq!(read(&mut backend, Rect::new(0, 0, 5, 1)), vec![1, 0, 0, 0, 0]);

        backend.update_vram(&WriteOp {
            x: 0, y: 0, width: 4, height: 1, data: &data, set_mask: false, check_mask: false, depth: 1.0,
        });
        backend.update_vram_read_texture(&Rect::new(0, 0, 4, 1));
        backend.copy_vram(&op);
        // Overlapping copy sees the pre-copy source
        assert_eq!(read(&mut backend, Rect::new(0, 0, 5, 1)), vec![1, 1, 2, 3, 4]);
    }

    #[test]
    fn test_depth_from_mask_bit() {
        let mut backend = backend(1, 1);
        let data = [0x8000u16, 0x0000];
        backend.update_vram(&WriteOp {
            x: 0, y: 0, width: 2, height: 1, data: &data, set_mask: false, check_mask: false, depth: 0.5,
        });
        backend.clear_depth_buffer();
        backend.update_depth_buffer_from_mask_bit();
        let zero = [0x1111u16; 2];
        backend.update_vram(&WriteOp {
            x: 0, y: 0, width: 2, height: 1, data: &zero, set_mask: false, check_mask: true, depth: 0.5,
        });
        assert_eq!(read(&mut backend, Rect::new(0, 0, 2, 1)), vec![0x8000, 0x1111]);
    }

    #[test]
    fn test_vertex_stream_wraps() {
        let mut backend = backend(1, 1);
        let vertices = vec![BatchVertex::default(); crate::batch::MAX_BATCH_VERTEX_COUNT / 2 + 3];
        let config = crate::batch::BatchConfig::default();
        let ubo = BatchUboData::default();
        for _ in 0..3 {
            backend.draw_batch(&BatchDraw { config: &config, ubo: &ubo, ubo_dirty: true, vertices: &vertices });
        }
        assert!(backend.vertex_stream_stats().wraps >= 1);
        assert_eq!(backend.render_pass_count(), 1);
    }

    #[test]
    fn test_direct_display() {
        let mut backend = backend(2, 1);
        let mut host = HeadlessDisplay::new();
        backend.fill_vram(&FillOp { x: 0, y: 0, width: 4, height: 4, color: 0x001F, skip_field: None });
        let plan = DisplayPlan {
            path: DisplayPath::Direct(Rect::new(0, 0, 8, 8)),
            params: Default::default(),
        };
        backend.update_display(&mut host, &plan).expect("display");
        let view = host.display_view().copied().expect("view");
        assert_eq!((view.view_width, view.view_height), (8, 8));

        let mut frame = emu_core::types::Frame::default();
        assert!(host.render_screenshot(&mut frame));
        assert_eq!(frame.pixel(7, 7), 0xFFFF0000);

        host.fail_allocations = true;
        let plan = DisplayPlan { path: DisplayPath::Direct(Rect::new(0, 0, 4, 4)), ..plan };
        backend.update_display(&mut host, &plan).expect("skipped, not failed");
        backend.shutdown(&mut host);
        assert_eq!(host.texture_count(), 0);
    }
}
