//! The hardware renderer's front end.
//!
//! [`GpuHw`] sits between the emulated GPU command stream and a
//! [`GpuBackend`]. It keeps the CPU-visible copy of VRAM word-exact while
//! the backend renders at a higher resolution, batching primitives that
//! share pipeline state and tracking which regions of the scaled texture
//! the shadow and the read texture have not caught up with yet.
//!
//! Mask bit semantics ride on the depth buffer. Pixels with the mask bit
//! set hold a depth greater than zero, everything else holds zero, and
//! "check mask before draw" becomes a `GEQUAL` test. Fills and uploads
//! store 1.0 for masked pixels; every checking primitive, write or copy
//! takes the next id from a decreasing sequence so that what it writes
//! fails the test for the next checking operation too.

use emu_core::host_display::HostDisplay;
use emu_core::logging::{log, LogCategory, LogLevel};

use crate::backend::{shader_gen_for, CopyOp, FillOp, FramebufferConfig, GpuBackend, WriteOp};
use crate::batch::{depth_for_id, uv_limits_for, Batch, BatchConfig, BatchDraw, BatchUboData, BatchVertex, MAX_DEPTH_IDS};
use crate::display::{plan_display, DisplayConfig, DisplayOptions};
use crate::present::Presenter;
use crate::settings::{GpuSettings, SettingsChange};
use crate::snapshot::VramSnapshot;
use crate::types::{DrawingArea, TextureMode, TexturePage, TextureWindow, TransparencyMode};
use crate::vram::{
    is_oversized, transfer_bounds, DirtyRect, Rect, Vram, VRAM_HEIGHT, VRAM_HEIGHT_MASK, VRAM_WIDTH, VRAM_WIDTH_MASK,
};
use crate::GpuError;

/// Polygons at least this wide or tall are dropped, as on the console
pub const MAX_PRIMITIVE_WIDTH: i32 = 1024;
pub const MAX_PRIMITIVE_HEIGHT: i32 = 512;
/// Largest rectangle the console draws
pub const MAX_RECTANGLE_WIDTH: u32 = 1023;
pub const MAX_RECTANGLE_HEIGHT: u32 = 511;
/// View-space depth that maps to the far plane of the PGXP depth buffer
pub const PGXP_DEPTH_RANGE: f32 = 65536.0;

/// A vertex as decoded from a drawing command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub x: i32,
    pub y: i32,
    /// 0xBBGGRR
    pub color: u32,
    pub u: u8,
    pub v: u8,
    /// View-space depth from geometry correction, 0 when unknown
    pub w: f32,
}

impl Vertex {
    pub fn new(x: i32, y: i32, color: u32) -> Self {
        Self { x, y, color, u: 0, v: 0, w: 0.0 }
    }

    pub fn with_uv(self, u: u8, v: u8) -> Self {
        Self { u, v, ..self }
    }

    pub fn with_depth(self, w: f32) -> Self {
        Self { w, ..self }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrimitiveFlags {
    pub textured: bool,
    /// Texels are not modulated by the vertex color
    pub raw_texture: bool,
    pub semi_transparent: bool,
    /// Gouraud shading; otherwise the first vertex color is used throughout
    pub shaded: bool,
}

/// Drawing-related GPU registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawRegisters {
    pub drawing_area: DrawingArea,
    pub drawing_offset: (i32, i32),
    pub texture_page: TexturePage,
    pub texture_window: TextureWindow,
    pub set_mask_while_drawing: bool,
    pub check_mask_before_draw: bool,
    pub dithering: bool,
    /// Displayed field while the output is interlaced. Lines of that field
    /// are left alone by drawing and fills.
    pub interlaced_field: Option<u32>,
}

impl Default for DrawRegisters {
    fn default() -> Self {
        Self {
            drawing_area: DrawingArea::default(),
            drawing_offset: (0, 0),
            texture_page: TexturePage::default(),
            texture_window: TextureWindow::default(),
            set_mask_while_drawing: false,
            check_mask_before_draw: false,
            dithering: false,
            interlaced_field: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuStats {
    pub batches: u64,
    pub primitives: u64,
    pub culled: u64,
    /// Dirty regions read back into the shadow
    pub readbacks: u64,
    pub read_texture_updates: u64,
    /// Transfers applied on the CPU and uploaded in full
    pub round_trips: u64,
    pub depth_rebuilds: u64,
}

pub struct GpuHw<B: GpuBackend> {
    backend: B,
    settings: GpuSettings,
    vram: Vram,
    /// Backend regions the shadow may not match
    shadow_dirty: DirtyRect,
    /// Backend regions the read texture may not match
    read_dirty: DirtyRect,
    batch: Batch,
    regs: DrawRegisters,
    depth_id: u32,
    /// Output size of the last display update
    display_size: Option<(u32, u32)>,
    stats: GpuStats,
}

impl<B: GpuBackend> GpuHw<B> {
    /// Bring up `backend` on `host` with `settings`, clamped to what the
    /// backend supports
    pub fn new(mut backend: B, host: &mut dyn HostDisplay, settings: &GpuSettings) -> Result<Self, GpuError> {
        backend.initialize(host)?;
        let settings = sanitize(settings, &backend);
        backend.create_framebuffer(&FramebufferConfig::from_settings(&settings))?;
        backend.compile_programs(&shader_gen_for(&settings, backend.capabilities()), &settings)?;
        backend.clear_framebuffer();

        let regs = DrawRegisters::default();
        backend.set_scissor(&regs.drawing_area);
        log(LogCategory::Sync, LogLevel::Info, || {
            format!(
                "{} renderer ready at {}x scale, {}x MSAA",
                backend.name(),
                settings.resolution_scale,
                settings.multisamples
            )
        });

        let mut hw = Self {
            backend,
            settings,
            vram: Vram::new(),
            shadow_dirty: DirtyRect::default(),
            read_dirty: DirtyRect::default(),
            batch: Batch::new(),
            regs,
            depth_id: 1,
            display_size: None,
            stats: GpuStats::default(),
        };
        hw.restore_depth();
        Ok(hw)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Effective settings after clamping
    pub fn settings(&self) -> &GpuSettings {
        &self.settings
    }

    pub fn stats(&self) -> GpuStats {
        self.stats
    }

    pub fn registers(&self) -> &DrawRegisters {
        &self.regs
    }

    pub fn shadow_dirty_rect(&self) -> Option<Rect> {
        self.shadow_dirty.get()
    }

    pub fn read_dirty_rect(&self) -> Option<Rect> {
        self.read_dirty.get()
    }

    /// What the last [`Self::update_display`] put on screen, in pixels
    pub fn display_size(&self) -> Option<(u32, u32)> {
        self.display_size
    }

    pub fn depth_id(&self) -> u32 {
        self.depth_id
    }

    pub fn pending_vertices(&self) -> usize {
        self.batch.vertex_count()
    }

    /// The CPU-side copy without synchronising it first
    pub fn shadow(&self) -> &Vram {
        &self.vram
    }

    // ---- registers ----

    pub fn set_drawing_area(&mut self, area: DrawingArea) {
        if self.regs.drawing_area == area {
            return;
        }
        self.flush();
        self.regs.drawing_area = area;
        self.backend.set_scissor(&area);
    }

    pub fn set_drawing_offset(&mut self, x: i32, y: i32) {
        self.regs.drawing_offset = (x, y);
    }

    /// Page and CLUT travel with each vertex, so this never flushes by
    /// itself
    pub fn set_texture_page(&mut self, page: TexturePage) {
        self.regs.texture_page = page;
    }

    pub fn set_texture_window(&mut self, window: TextureWindow) {
        self.regs.texture_window = window;
    }

    pub fn set_mask_settings(&mut self, set_mask_while_drawing: bool, check_mask_before_draw: bool) {
        self.regs.set_mask_while_drawing = set_mask_while_drawing;
        self.regs.check_mask_before_draw = check_mask_before_draw;
    }

    pub fn set_dithering(&mut self, enabled: bool) {
        self.regs.dithering = enabled;
    }

    pub fn set_interlaced_field(&mut self, field: Option<u32>) {
        self.regs.interlaced_field = field.map(|f| f & 1);
    }

    fn interlaced_field(&self) -> Option<u32> {
        if self.settings.disable_interlacing {
            None
        } else {
            self.regs.interlaced_field
        }
    }

    // ---- synchronisation ----

    /// Draw whatever is queued
    pub fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let draw = BatchDraw {
            config: &self.batch.config,
            ubo: &self.batch.ubo,
            ubo_dirty: self.batch.ubo_dirty,
            vertices: self.batch.vertices(),
        };
        log(LogCategory::Rasterizer, LogLevel::Trace, || {
            format!("flushing {} vertices with {:?}", draw.vertices.len(), draw.config)
        });
        self.backend.draw_batch(&draw);
        self.batch.clear();
        self.batch.ubo_dirty = false;
        self.stats.batches += 1;
    }

    fn sync_shadow(&mut self) -> Result<(), GpuError> {
        if let Some(rect) = self.shadow_dirty.get() {
            log(LogCategory::Sync, LogLevel::Trace, || format!("reading back {:?}", rect));
            self.backend.read_vram(&rect, &mut self.vram)?;
            self.shadow_dirty.clear();
            self.stats.readbacks += 1;
        }
        Ok(())
    }

    fn refresh_read_texture(&mut self) {
        if let Some(rect) = self.read_dirty.get() {
            self.backend.update_vram_read_texture(&rect);
            self.read_dirty.clear();
            self.stats.read_texture_updates += 1;
        }
    }

    fn restore_depth(&mut self) {
        if self.settings.pgxp_depth_buffer {
            self.backend.clear_depth_buffer();
        } else {
            self.backend.update_depth_buffer_from_mask_bit();
        }
        self.depth_id = 1;
    }

    /// Replace the backend image with the shadow
    fn upload_shadow(&mut self) -> Result<(), GpuError> {
        if self.backend.prepare_state_texture(VRAM_WIDTH, VRAM_HEIGHT)? {
            log(LogCategory::Sync, LogLevel::Debug, || "state texture (re)created".to_string());
        }
        self.backend.upload_state(self.vram.words());
        self.restore_depth();
        self.shadow_dirty.clear();
        self.read_dirty.set_full();
        Ok(())
    }

    fn next_depth_id(&mut self) -> u32 {
        if self.depth_id >= MAX_DEPTH_IDS {
            self.flush();
            log(LogCategory::Sync, LogLevel::Debug, || {
                "mask depth ids exhausted, rebuilding depth from mask bits".to_string()
            });
            self.backend.update_depth_buffer_from_mask_bit();
            self.depth_id = 1;
            self.stats.depth_rebuilds += 1;
        }
        self.depth_id += 1;
        self.depth_id
    }

    // ---- CPU transfers ----

    /// Read VRAM as the CPU sees it
    pub fn read_vram(&mut self, x: u32, y: u32, width: u32, height: u32) -> Result<Vec<u16>, GpuError> {
        self.flush();
        let bounds = transfer_bounds(x, y, width, height);
        if self.shadow_dirty.intersects(&bounds) {
            self.sync_shadow()?;
        }
        Ok(self.vram.read(x, y, width, height))
    }

    pub fn fill_vram(&mut self, x: u32, y: u32, width: u32, height: u32, color: u16) {
        if width == 0 || height == 0 {
            return;
        }
        self.flush();
        let (x, y) = (x & VRAM_WIDTH_MASK, y & VRAM_HEIGHT_MASK);
        let skip_field = self.interlaced_field();
        self.vram.fill(x, y, width, height, color, skip_field);
        self.backend.fill_vram(&FillOp { x, y, width, height, color, skip_field });
        self.read_dirty.include(transfer_bounds(x, y, width, height));
    }

    /// CPU to VRAM transfer of `width * height` words
    #[allow(clippy::too_many_arguments)]
    pub fn update_vram(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u16],
        set_mask: bool,
        check_mask: bool,
    ) -> Result<(), GpuError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let count = width as usize * height as usize;
        if data.len() < count {
            log(LogCategory::Vram, LogLevel::Warn, || {
                format!("{}x{} write with only {} words, ignored", width, height, data.len())
            });
            return Ok(());
        }
        let data = &data[..count];
        let (x, y) = (x & VRAM_WIDTH_MASK, y & VRAM_HEIGHT_MASK);
        let bounds = transfer_bounds(x, y, width, height);
        self.flush();

        let pgxp = self.settings.pgxp_depth_buffer;
        let shader_path = self.backend.capabilities().vram_write_path.is_shader() && !(check_mask && pgxp);
        let round_trip = !shader_path && (set_mask || check_mask || is_oversized(x, y, width, height));

        // The shadow has to be right wherever the write looks at it, and
        // everywhere when it gets uploaded in full afterwards
        if round_trip || (check_mask && self.shadow_dirty.intersects(&bounds)) {
            self.sync_shadow()?;
        }
        self.vram.write(x, y, width, height, data, set_mask, check_mask);

        if round_trip {
            log(LogCategory::Vram, LogLevel::Warn, || {
                format!(
                    "{}x{} write at ({}, {}) set={} check={} goes through a CPU round trip",
                    width, height, x, y, set_mask, check_mask
                )
            });
            self.stats.round_trips += 1;
            return self.upload_shadow();
        }

        let depth = if check_mask && !pgxp { depth_for_id(self.next_depth_id()) } else { 1.0 };
        self.backend.update_vram(&WriteOp { x, y, width, height, data, set_mask, check_mask, depth });
        self.read_dirty.include(bounds);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_vram(
        &mut self,
        src_x: u32,
        src_y: u32,
        dst_x: u32,
        dst_y: u32,
        width: u32,
        height: u32,
        set_mask: bool,
        check_mask: bool,
    ) -> Result<(), GpuError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let (src_x, src_y) = (src_x & VRAM_WIDTH_MASK, src_y & VRAM_HEIGHT_MASK);
        let (dst_x, dst_y) = (dst_x & VRAM_WIDTH_MASK, dst_y & VRAM_HEIGHT_MASK);
        let src_bounds = transfer_bounds(src_x, src_y, width, height);
        let dst_bounds = transfer_bounds(dst_x, dst_y, width, height);
        self.flush();

        // With PGXP the depth buffer holds geometry, so masking is done here
        let cpu_path = check_mask && self.settings.pgxp_depth_buffer;
        if cpu_path || (check_mask && self.shadow_dirty.intersects(&dst_bounds)) {
            self.sync_shadow()?;
        }
        let src_dirty = self.shadow_dirty.intersects(&src_bounds);
        self.vram.copy(src_x, src_y, dst_x, dst_y, width, height, set_mask, check_mask);

        if cpu_path {
            log(LogCategory::Vram, LogLevel::Warn, || {
                format!("masked {}x{} copy goes through a CPU round trip", width, height)
            });
            self.stats.round_trips += 1;
            return self.upload_shadow();
        }
        if src_dirty {
            self.shadow_dirty.include(dst_bounds);
        }
        if self.read_dirty.intersects(&src_bounds) {
            self.refresh_read_texture();
        }

        let depth = if check_mask { depth_for_id(self.next_depth_id()) } else { 1.0 };
        self.backend.copy_vram(&CopyOp { src_x, src_y, dst_x, dst_y, width, height, set_mask, check_mask, depth });
        self.read_dirty.include(dst_bounds);
        Ok(())
    }

    // ---- drawing ----

    fn primitive_config(&self, flags: PrimitiveFlags, dithered: bool) -> BatchConfig {
        let page = self.regs.texture_page;
        BatchConfig {
            texture_mode: if flags.textured {
                TextureMode::from_color_mode(page.color_mode, flags.raw_texture)
            } else {
                TextureMode::Disabled
            },
            transparency_mode: if flags.semi_transparent {
                TransparencyMode::from_bits(page.transparency)
            } else {
                TransparencyMode::Disabled
            },
            dithering: dithered && self.regs.dithering && !self.settings.true_color,
            interlacing: self.interlaced_field().is_some(),
            set_mask_while_drawing: self.regs.set_mask_while_drawing,
            check_mask_before_draw: self.regs.check_mask_before_draw,
            use_depth_buffer: self.settings.pgxp_depth_buffer,
        }
    }

    fn primitive_ubo(&self, config: &BatchConfig) -> BatchUboData {
        let (src_alpha_factor, dst_alpha_factor) = config.transparency_mode.factors();
        let window = self.regs.texture_window;
        BatchUboData {
            texture_window_and: [window.and_x, window.and_y],
            texture_window_or: [window.or_x, window.or_y],
            src_alpha_factor,
            dst_alpha_factor,
            interlaced_displayed_field: self.interlaced_field().unwrap_or(0),
            set_mask_while_drawing: config.set_mask_while_drawing as u32,
            check_mask_before_draw: config.check_mask_before_draw as u32,
            ..Default::default()
        }
    }

    /// Native bounds of a primitive clipped to the drawing area
    fn clip_bounds(&self, left: i32, top: i32, right: i32, bottom: i32) -> Rect {
        let clamp_x = |v: i32| v.clamp(0, VRAM_WIDTH as i32) as u32;
        let clamp_y = |v: i32| v.clamp(0, VRAM_HEIGHT as i32) as u32;
        Rect::new(clamp_x(left), clamp_y(top), clamp_x(right), clamp_y(bottom))
            .intersection(&self.regs.drawing_area.rect())
    }

    fn vertex_depth(&self, w: f32) -> (f32, f32) {
        if w > 0.0 {
            ((w / PGXP_DEPTH_RANGE).clamp(0.0, 1.0), w)
        } else {
            (1.0, 1.0)
        }
    }

    /// Queue `vertices` as the given triangles, flushing first if the batch
    /// can't take them
    fn emit(&mut self, config: BatchConfig, vertices: &mut [BatchVertex], triangles: &[[usize; 3]], bounds: Rect) {
        if config.texture_mode.is_textured() {
            let sampled = self.regs.texture_page.sampled_rects(config.texture_mode);
            if sampled.iter().any(|r| self.read_dirty.intersects(r)) {
                self.flush();
                self.refresh_read_texture();
            }
        }
        // With PGXP the mask is checked against the read texture
        if config.use_depth_buffer && config.check_mask_before_draw && self.read_dirty.intersects(&bounds) {
            self.flush();
            self.refresh_read_texture();
        }

        let ubo = self.primitive_ubo(&config);
        if self.batch.config != config || !self.batch.has_space_for(triangles.len() * 3) {
            self.flush();
            self.batch.config = config;
        }
        if self.batch.ubo != ubo {
            self.flush();
            self.batch.ubo = ubo;
            self.batch.ubo_dirty = true;
        }

        if !config.use_depth_buffer {
            let z = if config.check_mask_before_draw {
                depth_for_id(self.next_depth_id())
            } else {
                depth_for_id(self.depth_id)
            };
            for v in vertices.iter_mut() {
                v.z = z;
            }
        }
        for t in triangles {
            self.batch.push_triangle([vertices[t[0]], vertices[t[1]], vertices[t[2]]]);
        }
        self.shadow_dirty.include(bounds);
        self.read_dirty.include(bounds);
        self.stats.primitives += 1;
    }

    fn batch_vertex(&self, x: i32, y: i32, color: u32, u: u16, v: u16, w: f32) -> BatchVertex {
        let (z, w) = if self.settings.pgxp_depth_buffer { self.vertex_depth(w) } else { (0.0, 1.0) };
        BatchVertex {
            x: x as f32,
            y: y as f32,
            z,
            w,
            color: color & 0x00FF_FFFF,
            texpage: self.regs.texture_page.packed(),
            u,
            v,
            uv_limits: 0,
        }
    }

    /// Triangle or quad; quads are split along the 1-2 diagonal
    pub fn draw_polygon(&mut self, vertices: &[Vertex], flags: PrimitiveFlags) {
        let triangles: &[[usize; 3]] = match vertices.len() {
            3 => &[[0, 1, 2]],
            4 => &[[0, 1, 2], [1, 2, 3]],
            n => {
                log(LogCategory::Rasterizer, LogLevel::Warn, || format!("polygon with {} vertices ignored", n));
                return;
            }
        };
        let config = self.primitive_config(flags, flags.shaded || (flags.textured && !flags.raw_texture));
        let (ox, oy) = self.regs.drawing_offset;

        for t in triangles {
            let corners = t.map(|i| vertices[i]);
            let xs = corners.map(|v| v.x + ox);
            let ys = corners.map(|v| v.y + oy);
            let (min_x, max_x) = (xs.iter().min().copied().unwrap_or(0), xs.iter().max().copied().unwrap_or(0));
            let (min_y, max_y) = (ys.iter().min().copied().unwrap_or(0), ys.iter().max().copied().unwrap_or(0));
            if max_x - min_x >= MAX_PRIMITIVE_WIDTH || max_y - min_y >= MAX_PRIMITIVE_HEIGHT {
                log(LogCategory::Rasterizer, LogLevel::Trace, || {
                    format!("culled {}x{} triangle", max_x - min_x, max_y - min_y)
                });
                self.stats.culled += 1;
                continue;
            }
            let bounds = self.clip_bounds(min_x, min_y, max_x + 1, max_y + 1);
            if bounds.is_empty() {
                continue;
            }

            let base_color = corners[0].color;
            let mut out = [0, 1, 2].map(|i| {
                let v = corners[i];
                let color = if flags.shaded { v.color } else { base_color };
                self.batch_vertex(xs[i], ys[i], color, v.u as u16, v.v as u16, v.w)
            });
            if flags.textured && self.settings.uses_uv_limits() {
                let limits = uv_limits_for(&out);
                for v in &mut out {
                    v.uv_limits = limits;
                }
            }
            self.emit(config, &mut out, &[[0, 1, 2]], bounds);
        }
    }

    /// Axis-aligned sprite or tile. `uv` is the top-left texel.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_rectangle(
        &mut self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
        color: u32,
        uv: (u8, u8),
        flags: PrimitiveFlags,
    ) {
        let (width, height) = (width.min(MAX_RECTANGLE_WIDTH), height.min(MAX_RECTANGLE_HEIGHT));
        if width == 0 || height == 0 {
            return;
        }
        let flags = PrimitiveFlags { shaded: false, ..flags };
        let config = self.primitive_config(flags, false);
        let (ox, oy) = self.regs.drawing_offset;
        let (x0, y0) = (x + ox, y + oy);
        let (x1, y1) = (x0 + width as i32, y0 + height as i32);
        let bounds = self.clip_bounds(x0, y0, x1, y1);
        if bounds.is_empty() {
            return;
        }

        let (u0, v0) = (uv.0 as u16, uv.1 as u16);
        let (u1, v1) = (u0 + width as u16, v0 + height as u16);
        let mut out = [
            self.batch_vertex(x0, y0, color, u0, v0, 0.0),
            self.batch_vertex(x1, y0, color, u1, v0, 0.0),
            self.batch_vertex(x0, y1, color, u0, v1, 0.0),
            self.batch_vertex(x1, y1, color, u1, v1, 0.0),
        ];
        if flags.textured && self.settings.uses_uv_limits() {
            let limits = BatchVertex::pack_uv_limits(
                u0 as u32,
                v0 as u32,
                (u1 as u32 - 1).min(0xFF),
                (v1 as u32 - 1).min(0xFF),
            );
            for v in &mut out {
                v.uv_limits = limits;
            }
        }
        self.emit(config, &mut out, &[[0, 1, 2], [1, 2, 3]], bounds);
    }

    /// Polyline through `points`. Lines are never textured.
    pub fn draw_line(&mut self, points: &[Vertex], flags: PrimitiveFlags) {
        let flags = PrimitiveFlags { textured: false, raw_texture: false, ..flags };
        let config = self.primitive_config(flags, flags.shaded);
        for pair in points.windows(2) {
            self.draw_line_segment(pair[0], pair[1], flags, config);
        }
    }

    /// A segment becomes a one pixel wide quad along its minor axis, with
    /// both end points included
    fn draw_line_segment(&mut self, a: Vertex, b: Vertex, flags: PrimitiveFlags, config: BatchConfig) {
        let (ox, oy) = self.regs.drawing_offset;
        let (x0, y0, x1, y1) = (a.x + ox, a.y + oy, b.x + ox, b.y + oy);
        let (dx, dy) = (x1 - x0, y1 - y0);
        if dx.abs() >= MAX_PRIMITIVE_WIDTH || dy.abs() >= MAX_PRIMITIVE_HEIGHT {
            self.stats.culled += 1;
            return;
        }
        // (x, y, far end)
        let corners: [(i32, i32, bool); 4] = if dx == 0 && dy == 0 {
            [(x0, y0, false), (x0 + 1, y0, false), (x0, y0 + 1, false), (x0 + 1, y0 + 1, false)]
        } else if dx.abs() >= dy.abs() {
            let (sx0, sx1) = if dx >= 0 { (x0, x1 + 1) } else { (x0 + 1, x1) };
            [(sx0, y0, false), (sx1, y1, true), (sx0, y0 + 1, false), (sx1, y1 + 1, true)]
        } else {
            let (sy0, sy1) = if dy >= 0 { (y0, y1 + 1) } else { (y0 + 1, y1) };
            [(x0, sy0, false), (x0 + 1, sy0, false), (x1, sy1, true), (x1 + 1, sy1, true)]
        };

        let left = corners.iter().map(|c| c.0).min().unwrap_or(0);
        let right = corners.iter().map(|c| c.0).max().unwrap_or(0);
        let top = corners.iter().map(|c| c.1).min().unwrap_or(0);
        let bottom = corners.iter().map(|c| c.1).max().unwrap_or(0);
        let bounds = self.clip_bounds(left, top, right, bottom);
        if bounds.is_empty() {
            return;
        }
        let far_color = if flags.shaded { b.color } else { a.color };
        let mut out = corners.map(|(x, y, far)| {
            if far {
                self.batch_vertex(x, y, far_color, 0, 0, b.w)
            } else {
                self.batch_vertex(x, y, a.color, 0, 0, a.w)
            }
        });
        self.emit(config, &mut out, &[[0, 1, 2], [1, 2, 3]], bounds);
    }

    // ---- settings, display and lifecycle ----

    /// Apply new settings. A framebuffer change round-trips VRAM through the
    /// shadow; a shader change rebuilds the program set.
    pub fn update_settings(&mut self, settings: &GpuSettings) -> Result<SettingsChange, GpuError> {
        let settings = sanitize(settings, &self.backend);
        let change = SettingsChange::between(&self.settings, &settings);
        if change.renderer_changed {
            log(LogCategory::Sync, LogLevel::Warn, || {
                format!("switching to {:?} needs a new renderer instance", settings.renderer)
            });
        }
        if !change.framebuffer_changed && !change.shaders_changed {
            self.settings = settings;
            return Ok(change);
        }

        self.flush();
        if change.framebuffer_changed {
            self.sync_shadow()?;
            self.backend.create_framebuffer(&FramebufferConfig::from_settings(&settings))?;
        }
        self.settings = settings;
        self.backend
            .compile_programs(&shader_gen_for(&self.settings, self.backend.capabilities()), &self.settings)?;
        if change.framebuffer_changed {
            self.backend.set_scissor(&self.regs.drawing_area);
            self.upload_shadow()?;
            log(LogCategory::Sync, LogLevel::Info, || {
                format!(
                    "framebuffer recreated at {}x scale, {}x MSAA",
                    self.settings.resolution_scale, self.settings.multisamples
                )
            });
        }
        Ok(change)
    }

    /// Back to power-on register state. Pending primitives are dropped.
    pub fn reset(&mut self, clear_vram: bool) {
        self.batch = Batch::new();
        self.regs = DrawRegisters::default();
        self.backend.set_scissor(&self.regs.drawing_area);
        if clear_vram {
            self.vram.clear();
            self.backend.clear_framebuffer();
            self.shadow_dirty.clear();
            self.read_dirty.clear();
        }
        self.restore_depth();
    }

    pub fn update_display(&mut self, host: &mut dyn HostDisplay, config: &DisplayConfig) -> Result<(), GpuError> {
        self.flush();
        let plan = plan_display(config, &DisplayOptions::from_settings(&self.settings));
        self.backend.update_display(host, &plan)?;
        self.display_size = plan.output_size();
        if self.settings.pgxp_depth_buffer {
            // Geometry depth doesn't carry over into the next frame
            self.backend.clear_depth_buffer();
        }
        Ok(())
    }

    /// Capture what the host displays and hand it to `presenter`. Returns
    /// false when there was nothing to show.
    pub fn present(&mut self, host: &mut dyn HostDisplay, presenter: &mut Presenter) -> bool {
        self.flush();
        let Some((width, height)) = self.display_size else {
            log(LogCategory::Present, LogLevel::Debug, || "display is off".to_string());
            return false;
        };
        let frame = presenter.begin_frame(width, height);
        if !host.render_screenshot(frame) {
            log(LogCategory::Present, LogLevel::Debug, || "nothing to present".to_string());
            return false;
        }
        presenter.submit();
        true
    }

    pub fn save_state(&mut self) -> Result<VramSnapshot, GpuError> {
        self.flush();
        self.backend.read_vram(&Rect::FULL_VRAM, &mut self.vram)?;
        self.shadow_dirty.clear();
        Ok(VramSnapshot {
            width: VRAM_WIDTH,
            height: VRAM_HEIGHT,
            samples: self.settings.multisamples,
            resolution_scale: self.settings.resolution_scale,
            words: self.vram.words().to_vec(),
        })
    }

    /// Restore native VRAM from `snapshot`, whatever scale and sample count
    /// it was captured at. The backend's 1:1 state texture is recreated when
    /// its size differs from the snapshot's. VRAM itself is always 1024x512,
    /// so a snapshot of any other size is rejected with
    /// [`GpuError::InvalidState`] and nothing is touched.
    pub fn load_state(&mut self, snapshot: &VramSnapshot) -> Result<(), GpuError> {
        snapshot.validate()?;
        self.batch.clear();
        self.vram.words_mut().copy_from_slice(&snapshot.words);
        if self.backend.prepare_state_texture(snapshot.width, snapshot.height)? {
            log(LogCategory::Sync, LogLevel::Debug, || {
                format!("state texture recreated at {}x{}", snapshot.width, snapshot.height)
            });
        }
        self.backend.upload_state(&snapshot.words);
        self.restore_depth();
        self.backend.update_vram_read_texture(&Rect::FULL_VRAM);
        self.shadow_dirty.clear();
        self.read_dirty.clear();
        log(LogCategory::Sync, LogLevel::Info, || {
            format!(
                "VRAM restored (captured at {}x scale, {}x MSAA)",
                snapshot.resolution_scale, snapshot.samples
            )
        });
        Ok(())
    }

    pub fn shutdown(&mut self, host: &mut dyn HostDisplay) {
        self.flush();
        self.backend.shutdown(host);
    }
}

fn sanitize<B: GpuBackend>(settings: &GpuSettings, backend: &B) -> GpuSettings {
    let (settings, notes) = settings.sanitized(backend.capabilities());
    for note in notes {
        log(LogCategory::Sync, LogLevel::Warn, || note.clone());
    }
    settings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Capabilities, VramWritePath};
    use crate::SoftwareBackend;
    use emu_core::host_display::HeadlessDisplay;

    const RED: u32 = 0x0000FF;

    fn gpu() -> GpuHw<SoftwareBackend> {
        GpuHw::new(SoftwareBackend::new(), &mut HeadlessDisplay::new(), &GpuSettings::default()).expect("gpu")
    }

    fn triangle(x: i32, y: i32, size: i32, color: u32) -> [Vertex; 3] {
        [Vertex::new(x, y, color), Vertex::new(x + size, y, color), Vertex::new(x, y + size, color)]
    }

    #[test]
    fn test_fill_keeps_shadow_clean() {
        let mut gpu = gpu();
        gpu.fill_vram(8, 8, 4, 4, 0x7FFF);
        assert_eq!(gpu.shadow_dirty_rect(), None);
        assert_eq!(gpu.read_dirty_rect(), Some(Rect::new(8, 8, 12, 12)));
        assert_eq!(gpu.read_vram(8, 8, 2, 1).expect("read"), vec![0x7FFF, 0x7FFF]);
        assert_eq!(gpu.stats().readbacks, 0);
    }

    #[test]
    fn test_draw_marks_both_dirty_rects() {
        let mut gpu = gpu();
        gpu.set_drawing_area(DrawingArea { left: 0, top: 0, right: 2, bottom: 100 });
        gpu.draw_polygon(&triangle(0, 0, 4, RED), PrimitiveFlags::default());
        assert_eq!(gpu.pending_vertices(), 3);
        assert_eq!(gpu.shadow_dirty_rect(), Some(Rect::new(0, 0, 3, 5)));

        let pixels = gpu.read_vram(0, 0, 4, 1).expect("read");
        assert_eq!(pixels, vec![0x001F, 0x001F, 0x001F, 0]);
        assert_eq!(gpu.pending_vertices(), 0);
        assert_eq!(gpu.shadow_dirty_rect(), None);
        assert_eq!(gpu.stats().batches, 1);
    }

    #[test]
    fn test_state_change_splits_batches() {
        let mut gpu = gpu();
        gpu.draw_polygon(&triangle(0, 0, 4, RED), PrimitiveFlags::default());
        gpu.draw_polygon(&triangle(10, 0, 4, RED), PrimitiveFlags::default());
        assert_eq!(gpu.stats().batches, 0);
        gpu.draw_polygon(&triangle(20, 0, 4, RED), PrimitiveFlags { semi_transparent: true, ..Default::default() });
        assert_eq!(gpu.stats().batches, 1);
        gpu.flush();
        assert_eq!(gpu.stats().batches, 2);
        assert_eq!(gpu.stats().primitives, 3);
    }

    #[test]
    fn test_oversized_polygons_are_culled() {
        let mut gpu = gpu();
        gpu.draw_polygon(&triangle(0, 0, 1024, RED), PrimitiveFlags::default());
        assert_eq!(gpu.stats().culled, 1);
        assert_eq!(gpu.pending_vertices(), 0);
        assert_eq!(gpu.shadow_dirty_rect(), None);
    }

    #[test]
    fn test_textured_draw_refreshes_read_texture() {
        let mut gpu = gpu();
        gpu.fill_vram(0, 0, 16, 16, 0x7C00);
        gpu.set_texture_page(TexturePage { color_mode: 2, ..Default::default() });
        gpu.draw_rectangle(100, 100, 8, 8, 0x808080, (0, 0), PrimitiveFlags { textured: true, ..Default::default() });
        assert_eq!(gpu.stats().read_texture_updates, 1);
        assert_eq!(gpu.read_vram(100, 100, 1, 1).expect("read"), vec![0x7C00]);
    }

    #[test]
    fn test_check_mask_ids_count_down() {
        let mut gpu = gpu();
        gpu.set_mask_settings(true, true);
        gpu.draw_polygon(&triangle(0, 0, 4, RED), PrimitiveFlags::default());
        gpu.draw_polygon(&triangle(0, 0, 4, 0x00FF00), PrimitiveFlags::default());
        assert_eq!(gpu.depth_id(), 3);
        // The second triangle hits pixels masked by the first
        assert_eq!(gpu.read_vram(0, 0, 1, 1).expect("read"), vec![0x801F]);
    }

    #[test]
    fn test_depth_id_overflow_rebuilds_depth() {
        let mut gpu = gpu();
        gpu.update_vram(0, 0, 1, 1, &[0x8001], false, false).expect("write");
        gpu.depth_id = MAX_DEPTH_IDS;
        gpu.update_vram(0, 0, 2, 1, &[0x0002, 0x0003], false, true).expect("write");
        assert_eq!(gpu.stats().depth_rebuilds, 1);
        assert_eq!(gpu.depth_id(), 2);
        assert_eq!(gpu.read_vram(0, 0, 2, 1).expect("read"), vec![0x8001, 0x0003]);
    }

    #[test]
    fn test_masked_write_without_shader_path_round_trips() {
        let caps = Capabilities { vram_write_path: VramWritePath::Upload, ..*SoftwareBackend::new().capabilities() };
        let backend = SoftwareBackend::with_capabilities(caps);
        let mut gpu = GpuHw::new(backend, &mut HeadlessDisplay::new(), &GpuSettings::default()).expect("gpu");

        gpu.draw_polygon(&triangle(0, 0, 8, RED), PrimitiveFlags::default());
        gpu.update_vram(0, 0, 2, 1, &[1, 2], true, false).expect("write");
        assert_eq!(gpu.stats().round_trips, 1);
        assert_eq!(gpu.shadow_dirty_rect(), None);
        assert_eq!(gpu.read_vram(0, 0, 3, 1).expect("read"), vec![0x8001, 0x8002, 0x001F]);

        // Plain writes upload directly
        gpu.update_vram(4, 4, 1, 1, &[5], false, false).expect("write");
        assert_eq!(gpu.stats().round_trips, 1);
    }

    #[test]
    fn test_line_includes_end_points() {
        let mut gpu = gpu();
        gpu.draw_line(&[Vertex::new(2, 5, RED), Vertex::new(5, 5, RED)], PrimitiveFlags::default());
        assert_eq!(gpu.read_vram(1, 5, 6, 1).expect("read"), vec![0, 0x001F, 0x001F, 0x001F, 0x001F, 0]);
        assert_eq!(gpu.read_vram(2, 4, 1, 1).expect("read"), vec![0]);
        assert_eq!(gpu.read_vram(2, 6, 1, 1).expect("read"), vec![0]);
    }

    #[test]
    fn test_interlaced_fill_skips_displayed_field() {
        let settings = GpuSettings { disable_interlacing: false, ..Default::default() };
        let mut gpu = GpuHw::new(SoftwareBackend::new(), &mut HeadlessDisplay::new(), &settings).expect("gpu");
        gpu.set_interlaced_field(Some(1));
        gpu.fill_vram(0, 0, 1, 4, 0x1234);
        assert_eq!(gpu.read_vram(0, 0, 1, 4).expect("read"), vec![0x1234, 0, 0x1234, 0]);
    }

    #[test]
    fn test_scale_change_preserves_vram() {
        let mut gpu = gpu();
        gpu.draw_rectangle(0, 0, 4, 4, RED, (0, 0), PrimitiveFlags::default());
        let change = gpu
            .update_settings(&GpuSettings { resolution_scale: 2, ..Default::default() })
            .expect("settings");
        assert!(change.framebuffer_changed);
        assert_eq!(gpu.settings().resolution_scale, 2);
        // Read back from the recreated framebuffer, not the shadow
        let snapshot = gpu.save_state().expect("save");
        assert_eq!(snapshot.resolution_scale, 2);
        assert_eq!(&snapshot.words[..5], &[0x001F, 0x001F, 0x001F, 0x001F, 0]);
        assert_eq!(snapshot.words[1024 * 3], 0x001F);
    }

    #[test]
    fn test_settings_are_clamped() {
        let caps = Capabilities {
            max_resolution_scale: 2,
            max_multisamples: 2,
            ..*SoftwareBackend::new().capabilities()
        };
        let settings = GpuSettings { resolution_scale: 64, multisamples: 8, ..Default::default() };
        let gpu = GpuHw::new(SoftwareBackend::with_capabilities(caps), &mut HeadlessDisplay::new(), &settings)
            .expect("gpu");
        assert_eq!(gpu.settings().resolution_scale, 2);
        assert_eq!(gpu.settings().multisamples, 2);
    }
}
