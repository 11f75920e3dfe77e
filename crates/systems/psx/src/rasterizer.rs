//! CPU implementation of the batch pixel pipeline.
//!
//! Mirrors the generated batch shaders fragment for fragment: the same
//! sample positions, attribute interpolation, texel fetch, modulation,
//! dithering, 15-bit truncation, blending and mask depth. Render targets
//! are stored top-down; nothing here is flipped.

use emu_core::graphics::{ColorOps, DepthBuffer, DepthFunc};

use crate::batch::{BatchConfig, BatchUboData, BatchVertex, BlendEquation, BlendFactor, BlendState, DITHER_MATRIX};
use crate::shadergen::ShaderGen;
use crate::types::{BatchRenderMode, TextureFilter, TexturePage};
use crate::vram::{Rect, VRAM_HEIGHT_MASK, VRAM_WIDTH_MASK};

const OFFSETS_1: [(f32, f32); 1] = [(0.5, 0.5)];
const OFFSETS_2: [(f32, f32); 2] = [(0.5, 0.5), (0.25, 0.25)];
const OFFSETS_4: [(f32, f32); 4] = [(0.5, 0.5), (0.875, 0.375), (0.125, 0.625), (0.625, 0.875)];

/// Sample positions within a pixel. Sample 0 sits on the centre so that it
/// carries native coverage; read-back and mask rebuilds only look at it.
pub(crate) fn sample_offsets(samples: u32) -> &'static [(f32, f32)] {
    match samples {
        2 => &OFFSETS_2,
        4 => &OFFSETS_4,
        _ => &OFFSETS_1,
    }
}

fn to_unorm8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Channel-wise average, rounded
pub(crate) fn average_rgba(colors: impl Iterator<Item = u32>) -> u32 {
    let mut sum = [0u32; 4];
    let mut count = 0u32;
    for color in colors {
        for (acc, c) in sum.iter_mut().zip(ColorOps::unpack_rgba(color)) {
            *acc += c as u32;
        }
        count += 1;
    }
    if count == 0 {
        return 0;
    }
    let [r, g, b, a] = sum.map(|c| ((c + count / 2) / count) as u8);
    ColorOps::pack_rgba(r, g, b, a)
}

pub(crate) struct Plane {
    pub color: Vec<u32>,
    pub depth: DepthBuffer,
}

/// Multisampled RGBA8 color target with a depth buffer per sample
pub(crate) struct Surface {
    width: u32,
    height: u32,
    planes: Vec<Plane>,
}

impl Surface {
    pub fn new(width: u32, height: u32, samples: u32) -> Self {
        let planes = (0..samples.max(1))
            .map(|_| Plane {
                color: vec![0; (width * height) as usize],
                depth: DepthBuffer::new(width, height),
            })
            .collect();
        Self { width, height, planes }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> u32 {
        self.planes.len() as u32
    }

    pub fn planes_mut(&mut self) -> &mut [Plane] {
        &mut self.planes
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }

    /// First sample, what the encode passes read
    #[inline]
    pub fn first(&self, x: u32, y: u32) -> u32 {
        self.planes[0].color[self.index(x, y)]
    }

    #[inline]
    pub fn resolved(&self, x: u32, y: u32) -> u32 {
        let index = self.index(x, y);
        if self.planes.len() == 1 {
            return self.planes[0].color[index];
        }
        average_rgba(self.planes.iter().map(|p| p.color[index]))
    }

    /// Write every sample of a pixel. `depth` is left alone when `None`.
    #[inline]
    pub fn store(&mut self, x: u32, y: u32, color: u32, depth: Option<f32>) {
        let index = self.index(x, y);
        for plane in &mut self.planes {
            plane.color[index] = color;
            if let Some(depth) = depth {
                plane.depth.set(x, y, depth);
            }
        }
    }

    pub fn clear(&mut self) {
        for plane in &mut self.planes {
            plane.color.fill(0);
            plane.depth.clear(0.0);
        }
    }

    pub fn clear_depth(&mut self, value: f32) {
        for plane in &mut self.planes {
            plane.depth.clear(value);
        }
    }
}

/// Single-sampled scaled texture the batch pipeline samples from
pub(crate) struct TextureSource<'a> {
    pub texels: &'a [u32],
    pub width: u32,
    pub scale: u32,
}

impl TextureSource<'_> {
    /// Native word at wrapped coordinates, from the top-left texel of its
    /// scaled block
    #[inline]
    pub fn native(&self, x: u32, y: u32) -> u16 {
        let sx = (x & VRAM_WIDTH_MASK) * self.scale;
        let sy = (y & VRAM_HEIGHT_MASK) * self.scale;
        ColorOps::rgba8888_to_rgba5551(self.texels[(sy * self.width + sx) as usize])
    }

    #[inline]
    pub fn scaled(&self, x: u32, y: u32) -> u32 {
        self.texels[(y * self.width + x) as usize]
    }
}

/// Settings baked into a program set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PipelineOptions {
    pub scale: u32,
    pub true_color: bool,
    pub scaled_dithering: bool,
    pub bilinear: bool,
    pub uv_limits: bool,
    pub pgxp_depth: bool,
    pub per_sample_shading: bool,
}

impl PipelineOptions {
    pub fn from_gen(gen: &ShaderGen) -> Self {
        Self {
            scale: gen.resolution_scale.max(1),
            true_color: gen.true_color,
            scaled_dithering: gen.scaled_dithering,
            bilinear: gen.texture_filter == TextureFilter::Bilinear,
            uv_limits: gen.uv_limits,
            pgxp_depth: gen.pgxp_depth,
            per_sample_shading: gen.per_sample_shading && gen.multisamples > 1,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_gen(&ShaderGen::default())
    }
}

/// Fixed state for one pass of a batch
pub(crate) struct DrawState<'a> {
    pub config: &'a BatchConfig,
    pub ubo: &'a BatchUboData,
    pub pass: BatchRenderMode,
    pub blend: BlendState,
    pub depth_func: DepthFunc,
    /// Scaled, top-left origin
    pub scissor: Rect,
    pub options: PipelineOptions,
}

#[derive(Clone, Copy)]
struct Varyings {
    rgb: [f32; 3],
    uv: [f32; 2],
    depth: f32,
}

#[derive(Clone, Copy)]
struct Fragment {
    rgb: [f32; 3],
    alpha: f32,
    semitransparent: bool,
    depth: f32,
}

/// Per-primitive values that don't interpolate
struct Flat {
    depth: f32,
    page: TexturePage,
    uv_limits: [f32; 4],
}

#[inline]
fn orient(a: (f32, f32), b: (f32, f32), c: (f32, f32)) -> f32 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

/// Edges shared by two triangles cover their pixels once: top and left
/// edges are inclusive, bottom and right exclusive.
#[inline]
fn is_top_left(a: (f32, f32), b: (f32, f32)) -> bool {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    (dy == 0.0 && dx > 0.0) || dy < 0.0
}

#[inline]
fn edge_covers(w: f32, top_left: bool) -> bool {
    w > 0.0 || (w == 0.0 && top_left)
}

fn vertex_rgb(color: u32) -> [f32; 3] {
    let [r, g, b, _] = ColorOps::unpack_rgba(color);
    [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0]
}

struct Setup<'v> {
    vertices: [&'v BatchVertex; 3],
    points: [(f32, f32); 3],
    area: f32,
    top_left: [bool; 3],
    perspective: bool,
}

impl Setup<'_> {
    /// Barycentric weights at `q`, or `None` when outside
    fn weights(&self, q: (f32, f32), test: bool) -> Option<[f32; 3]> {
        let p = &self.points;
        let w = [orient(p[1], p[2], q), orient(p[2], p[0], q), orient(p[0], p[1], q)];
        if test && !(0..3).all(|i| edge_covers(w[i], self.top_left[i])) {
            return None;
        }
        let mut l = w.map(|w| w / self.area);
        if self.perspective {
            for (li, v) in l.iter_mut().zip(self.vertices.iter()) {
                *li /= v.w;
            }
            let sum: f32 = l.iter().sum();
            if sum != 0.0 {
                l = l.map(|li| li / sum);
            }
        }
        Some(l)
    }

    fn varyings(&self, l: [f32; 3]) -> Varyings {
        let mut rgb = [0.0; 3];
        let mut uv = [0.0; 2];
        let mut depth = 0.0;
        for (li, v) in l.iter().zip(self.vertices.iter()) {
            for (acc, c) in rgb.iter_mut().zip(vertex_rgb(v.color)) {
                *acc += li * c;
            }
            uv[0] += li * v.u as f32;
            uv[1] += li * v.v as f32;
            depth += li * v.z;
        }
        Varyings { rgb, uv, depth }
    }
}

/// Rasterize one triangle (native coordinates) into `surface`
pub(crate) fn draw_triangle(
    surface: &mut Surface,
    texture: &TextureSource<'_>,
    state: &DrawState<'_>,
    triangle: &[BatchVertex],
) {
    let scale = state.options.scale as f32;
    let mut vertices = [&triangle[0], &triangle[1], &triangle[2]];
    let mut points = vertices.map(|v| (v.x * scale, v.y * scale));
    let mut area = orient(points[0], points[1], points[2]);
    if area == 0.0 || !area.is_finite() {
        return;
    }
    if area < 0.0 {
        vertices.swap(1, 2);
        points.swap(1, 2);
        area = -area;
    }

    let setup = Setup {
        vertices,
        points,
        area,
        top_left: [
            is_top_left(points[1], points[2]),
            is_top_left(points[2], points[0]),
            is_top_left(points[0], points[1]),
        ],
        perspective: state.options.pgxp_depth && vertices.iter().all(|v| v.w > 0.0),
    };
    // The last vertex provokes flat attributes
    let provoking = &triangle[2];
    let (min_u, min_v, max_u, max_v) = provoking.unpack_uv_limits();
    let flat = Flat {
        depth: provoking.z,
        page: TexturePage::from_packed(provoking.texpage),
        uv_limits: [min_u as f32, min_v as f32, max_u as f32, max_v as f32],
    };

    let min_x = points.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
    let max_x = points.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
    let min_y = points.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
    let max_y = points.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);
    let clip = state.scissor.intersection(&Rect::new(0, 0, surface.width(), surface.height()));
    let x0 = ((min_x - 0.5).floor().max(0.0) as u32).max(clip.left);
    let y0 = ((min_y - 0.5).floor().max(0.0) as u32).max(clip.top);
    let x1 = (((max_x + 0.5).ceil() + 1.0).max(0.0) as u32).min(clip.right);
    let y1 = (((max_y + 0.5).ceil() + 1.0).max(0.0) as u32).min(clip.bottom);

    let offsets = sample_offsets(surface.samples());
    let mut covered = [false; 4];
    for py in y0..y1 {
        for px in x0..x1 {
            let mut any = false;
            for (hit, &(ox, oy)) in covered.iter_mut().zip(offsets) {
                let q = (px as f32 + ox - 0.5, py as f32 + oy - 0.5);
                *hit = setup.weights(q, true).is_some();
                any |= *hit;
            }
            if !any {
                continue;
            }

            let shared = if state.options.per_sample_shading {
                None
            } else {
                setup
                    .weights((px as f32, py as f32), false)
                    .and_then(|l| shade(state, texture, &flat, &setup.varyings(l), px, py))
            };

            for (sample, &(ox, oy)) in offsets.iter().enumerate() {
                if !covered[sample] {
                    continue;
                }
                let fragment = if state.options.per_sample_shading {
                    let q = (px as f32 + ox - 0.5, py as f32 + oy - 0.5);
                    setup
                        .weights(q, false)
                        .and_then(|l| shade(state, texture, &flat, &setup.varyings(l), px, py))
                } else {
                    shared
                };
                if let Some(fragment) = fragment {
                    write_sample(surface, sample, px, py, &fragment, state);
                }
            }
        }
    }
}

fn fetch_texel(state: &DrawState<'_>, texture: &TextureSource<'_>, page: &TexturePage, u: u32, v: u32) -> u16 {
    let ubo = state.ubo;
    let u = ((u & 0xFF) & ubo.texture_window_and[0]) | ubo.texture_window_or[0];
    let v = ((v & 0xFF) & ubo.texture_window_and[1]) | ubo.texture_window_or[1];
    let (base_x, base_y) = (page.base_x(), page.base_y());
    match state.config.texture_mode.color_mode() {
        0 => {
            let word = texture.native(base_x + (u >> 2), base_y + v) as u32;
            let index = (word >> ((u & 3) * 4)) & 0xF;
            texture.native(page.clut_x as u32 + index, page.clut_y as u32)
        }
        1 => {
            let word = texture.native(base_x + (u >> 1), base_y + v) as u32;
            let index = (word >> ((u & 1) * 8)) & 0xFF;
            texture.native(page.clut_x as u32 + index, page.clut_y as u32)
        }
        _ => texture.native(base_x + u, base_y + v),
    }
}

fn clamp_uv(state: &DrawState<'_>, flat: &Flat, uv: [f32; 2]) -> (u32, u32) {
    let mut c = [uv[0].floor(), uv[1].floor()];
    if state.options.uv_limits {
        c[0] = c[0].clamp(flat.uv_limits[0], flat.uv_limits[2]);
        c[1] = c[1].clamp(flat.uv_limits[1], flat.uv_limits[3]);
    }
    (c[0].max(0.0) as u32, c[1].max(0.0) as u32)
}

fn rgb_of(texel: u16) -> [f32; 3] {
    let [r, g, b, _] = ColorOps::unpack_rgba(ColorOps::rgba5551_to_rgba8888(texel));
    [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0]
}

/// Texture color and its mask bit, `None` for fully transparent texels
fn sample_texture(state: &DrawState<'_>, texture: &TextureSource<'_>, flat: &Flat, uv: [f32; 2]) -> Option<([f32; 3], bool)> {
    let fetch = |uv: [f32; 2]| {
        let (u, v) = clamp_uv(state, flat, uv);
        fetch_texel(state, texture, &flat.page, u, v)
    };
    if !state.options.bilinear {
        let texel = fetch(uv);
        if texel == 0 {
            return None;
        }
        return Some((rgb_of(texel), texel & 0x8000 != 0));
    }

    let base = [uv[0] - 0.5, uv[1] - 0.5];
    let f = [base[0] - base[0].floor(), base[1] - base[1].floor()];
    let taps = [
        (fetch(base), (1.0 - f[0]) * (1.0 - f[1])),
        (fetch([base[0] + 1.0, base[1]]), f[0] * (1.0 - f[1])),
        (fetch([base[0], base[1] + 1.0]), (1.0 - f[0]) * f[1]),
        (fetch([base[0] + 1.0, base[1] + 1.0]), f[0] * f[1]),
    ];
    let mut total = 0.0;
    let mut rgb = [0.0f32; 3];
    for (texel, weight) in taps {
        if texel == 0 {
            continue;
        }
        total += weight;
        for (acc, c) in rgb.iter_mut().zip(rgb_of(texel)) {
            *acc += c * weight;
        }
    }
    if total <= 0.0 {
        return None;
    }
    let nearest = fetch(uv);
    Some((rgb.map(|c| c / total), nearest & 0x8000 != 0))
}

fn shade(
    state: &DrawState<'_>,
    texture: &TextureSource<'_>,
    flat: &Flat,
    varyings: &Varyings,
    x: u32,
    y: u32,
) -> Option<Fragment> {
    let config = state.config;
    let ubo = state.ubo;
    let scale = state.options.scale;

    if config.interlacing && ((y / scale) & 1) == ubo.interlaced_displayed_field {
        return None;
    }
    if state.options.pgxp_depth && ubo.check_mask_before_draw != 0 && texture.scaled(x, y) >> 31 != 0 {
        return None;
    }

    let vertcol = varyings.rgb.map(|c| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u32);
    let (mut icolor, semitransparent, texel_mask) = if config.texture_mode.is_textured() {
        let (texcol, mask) = sample_texture(state, texture, flat, varyings.uv)?;
        let tc = texcol.map(|c| (c * 255.0 + 0.5) as u32);
        let icolor = if config.texture_mode.is_raw() {
            tc
        } else {
            [0, 1, 2].map(|i| ((tc[i] * vertcol[i]) >> 7).min(255))
        };
        (icolor, mask, mask)
    } else {
        (vertcol, true, false)
    };

    if config.dithering {
        let (mut dx, mut dy) = (x, y);
        if state.options.scaled_dithering {
            dx /= scale;
            dy /= scale;
        }
        let d = DITHER_MATRIX[(dy & 3) as usize][(dx & 3) as usize];
        icolor = icolor.map(|c| (c as i32 + d).clamp(0, 255) as u32);
    }

    let mut rgb = if state.options.true_color {
        icolor.map(|c| c as f32 / 255.0)
    } else {
        icolor.map(|c| {
            let c5 = c >> 3;
            ((c5 << 3) | (c5 >> 2)) as f32 / 255.0
        })
    };

    let mask_out = ubo.set_mask_while_drawing != 0 || texel_mask;
    match state.pass {
        BatchRenderMode::TransparencyDisabled => {}
        pass => {
            if (pass == BatchRenderMode::OnlyOpaque && semitransparent)
                || (pass == BatchRenderMode::OnlyTransparent && !semitransparent)
            {
                return None;
            }
            if semitransparent {
                rgb = rgb.map(|c| c * ubo.src_alpha_factor);
            }
        }
    }

    let depth = if state.options.pgxp_depth {
        varyings.depth
    } else if mask_out {
        flat.depth
    } else {
        0.0
    };
    Some(Fragment {
        rgb,
        alpha: if mask_out { 1.0 } else { 0.0 },
        semitransparent,
        depth,
    })
}

fn blend_factor(factor: BlendFactor, blend: &BlendState, second_alpha: f32) -> f32 {
    match factor {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::Src1Alpha => second_alpha,
        BlendFactor::ConstantAlpha => blend.constant_alpha,
    }
}

fn write_sample(surface: &mut Surface, sample: usize, x: u32, y: u32, fragment: &Fragment, state: &DrawState<'_>) {
    let index = surface.index(x, y);
    let plane = &mut surface.planes[sample];
    if !plane.depth.test_and_update(x, y, fragment.depth, state.depth_func, true) {
        return;
    }

    let blend = &state.blend;
    let rgb = if blend.enabled {
        let second_alpha = if fragment.semitransparent { state.ubo.dst_alpha_factor } else { 0.0 };
        let sf = blend_factor(blend.src_factor, blend, second_alpha);
        let df = blend_factor(blend.dst_factor, blend, second_alpha);
        let [dr, dg, db, _] = ColorOps::unpack_rgba(plane.color[index]);
        let dst = [dr, dg, db].map(|c| c as f32 / 255.0);
        [0, 1, 2].map(|i| match blend.equation {
            BlendEquation::Add => fragment.rgb[i] * sf + dst[i] * df,
            BlendEquation::ReverseSubtract => dst[i] * df - fragment.rgb[i] * sf,
        })
    } else {
        fragment.rgb
    };
    let [r, g, b] = rgb.map(to_unorm8);
    plane.color[index] = ColorOps::pack_rgba(r, g, b, to_unorm8(fragment.alpha));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::depth_for_id;
    use crate::types::{TextureMode, TransparencyMode};

    fn vertex(x: f32, y: f32, color: u32) -> BatchVertex {
        BatchVertex { x, y, z: 1.0, w: 1.0, color, ..Default::default() }
    }

    fn quad(x0: f32, y0: f32, x1: f32, y1: f32, color: u32) -> [BatchVertex; 6] {
        [
            vertex(x0, y0, color),
            vertex(x1, y0, color),
            vertex(x0, y1, color),
            vertex(x1, y0, color),
            vertex(x0, y1, color),
            vertex(x1, y1, color),
        ]
    }

    struct Fixture {
        surface: Surface,
        texels: Vec<u32>,
        scale: u32,
    }

    impl Fixture {
        fn new(scale: u32, samples: u32) -> Self {
            let (w, h) = (64 * scale, 64 * scale);
            Self { surface: Surface::new(w, h, samples), texels: vec![0; (1024 * scale * 512 * scale) as usize], scale }
        }

        fn draw(&mut self, config: &BatchConfig, ubo: &BatchUboData, vertices: &[BatchVertex]) {
            let options = PipelineOptions { scale: self.scale, ..Default::default() };
            for &pass in config.passes() {
                let state = DrawState {
                    config,
                    ubo,
                    pass,
                    blend: BlendState::for_pass(config.transparency_mode, pass, true),
                    depth_func: config.depth_func(),
                    scissor: Rect::new(0, 0, self.surface.width(), self.surface.height()),
                    options,
                };
                let texture = TextureSource { texels: &self.texels, width: 1024 * self.scale, scale: self.scale };
                for triangle in vertices.chunks_exact(3) {
                    draw_triangle(&mut self.surface, &texture, &state, triangle);
                }
            }
        }

        fn set_texel(&mut self, x: u32, y: u32, word: u16) {
            let (sx, sy) = (x * self.scale, y * self.scale);
            self.texels[(sy * 1024 * self.scale + sx) as usize] = ColorOps::rgba5551_to_rgba8888(word);
        }

        fn native(&self, x: u32, y: u32) -> u16 {
            ColorOps::rgba8888_to_rgba5551(self.surface.first(x * self.scale, y * self.scale))
        }
    }

    const WHITE: u32 = 0xFFFFFFFF;

    #[test]
    fn test_quad_covers_exact_rect() {
        let mut fx = Fixture::new(1, 1);
        fx.draw(&BatchConfig::default(), &BatchUboData::default(), &quad(8.0, 8.0, 24.0, 16.0, WHITE));
        let mut count = 0;
        for y in 0..64 {
            for x in 0..64 {
                let inside = (8..24).contains(&x) && (8..16).contains(&y);
                assert_eq!(fx.native(x, y) != 0, inside, "pixel {},{}", x, y);
                count += inside as u32;
            }
        }
        assert_eq!(count, 16 * 8);
    }

    #[test]
    fn test_scaled_coverage_matches_native() {
        let mut fx = Fixture::new(4, 1);
        fx.draw(&BatchConfig::default(), &BatchUboData::default(), &quad(2.0, 3.0, 10.0, 7.0, WHITE));
        // Every sub-pixel of a covered native pixel is covered
        for y in 0..64 * 4 {
            for x in 0..64 * 4 {
                let inside = (8..40).contains(&x) && (12..28).contains(&y);
                assert_eq!(fx.surface.first(x, y) != 0, inside, "scaled pixel {},{}", x, y);
            }
        }
    }

    #[test]
    fn test_color_truncates_to_15_bit() {
        let mut fx = Fixture::new(1, 1);
        let color = ColorOps::pack_rgba(0x0F, 0x80, 0xFF, 0);
        fx.draw(&BatchConfig::default(), &BatchUboData::default(), &quad(0.0, 0.0, 1.0, 1.0, color));
        let [r, g, b, a] = ColorOps::unpack_rgba(fx.surface.first(0, 0));
        assert_eq!((r, g, b, a), (ColorOps::convert_5_to_8(1), ColorOps::convert_5_to_8(16), 255, 0));
    }

    #[test]
    fn test_dithering_offsets() {
        let mut fx = Fixture::new(1, 1);
        let config = BatchConfig { dithering: true, ..Default::default() };
        let grey = ColorOps::pack_rgba(128, 128, 128, 0);
        fx.draw(&config, &BatchUboData::default(), &quad(0.0, 0.0, 4.0, 4.0, grey));
        // (0,0) gets -4 -> 124 -> 15, (3,0) gets +1 -> 129 -> 16
        assert_eq!(fx.native(0, 0) & 0x1F, 15);
        assert_eq!(fx.native(3, 0) & 0x1F, 16);
    }

    #[test]
    fn test_average_blend() {
        let mut fx = Fixture::new(1, 1);
        let red = ColorOps::pack_rgba(248, 0, 0, 0);
        fx.draw(&BatchConfig::default(), &BatchUboData::default(), &quad(0.0, 0.0, 2.0, 2.0, red));

        let config = BatchConfig { transparency_mode: TransparencyMode::HalfBackgroundPlusHalfForeground, ..Default::default() };
        let ubo = BatchUboData { src_alpha_factor: 0.5, dst_alpha_factor: 0.5, ..Default::default() };
        let blue = ColorOps::pack_rgba(0, 0, 248, 0);
        fx.draw(&config, &ubo, &quad(0.0, 0.0, 2.0, 2.0, blue));
        // Half of each full channel, kept at 8 bits until read back
        let word = fx.native(0, 0);
        assert_eq!(word & 0x1F, 16);
        assert_eq!((word >> 10) & 0x1F, 16);
    }

    #[test]
    fn test_palette_4bit_texture() {
        let mut fx = Fixture::new(2, 1);
        // Page at (64, 0), CLUT at (0, 100)
        fx.set_texel(64, 0, 0x3210);
        fx.set_texel(2, 100, 0x801F);
        let page = TexturePage { page_x: 1, clut_x: 0, clut_y: 100, ..Default::default() };
        let mut v = quad(0.0, 0.0, 4.0, 1.0, WHITE);
        for (vert, u) in v.iter_mut().zip([0u16, 4, 0, 4, 0, 4]) {
            vert.u = u;
            vert.texpage = page.packed();
        }
        let config = BatchConfig { texture_mode: TextureMode::RawPalette4Bit, ..Default::default() };
        fx.draw(&config, &BatchUboData::default(), &v);
        // Index 2 at u=2 maps to the red, masked CLUT entry
        assert_eq!(fx.native(2, 0), 0x801F);
        // Index 0 points at a transparent entry
        assert_eq!(fx.native(0, 0), 0);
    }

    #[test]
    fn test_check_mask_rejects_masked_pixels() {
        let mut fx = Fixture::new(1, 1);
        let depth = depth_for_id(1);
        fx.surface.store(1, 0, ColorOps::rgba5551_to_rgba8888(0x8000), Some(1.0));
        let config = BatchConfig { check_mask_before_draw: true, ..Default::default() };
        let ubo = BatchUboData { check_mask_before_draw: 1, ..Default::default() };
        let mut v = quad(0.0, 0.0, 2.0, 1.0, WHITE);
        for vert in &mut v {
            vert.z = depth;
        }
        fx.draw(&config, &ubo, &v);
        assert_eq!(fx.native(0, 0), 0x7FFF);
        assert_eq!(fx.native(1, 0), 0x8000);
    }

    #[test]
    fn test_msaa_edge_is_partially_covered() {
        let mut fx = Fixture::new(1, 4);
        let tri = [vertex(0.0, 0.0, WHITE), vertex(8.0, 0.0, WHITE), vertex(0.0, 8.0, WHITE)];
        fx.draw(&BatchConfig::default(), &BatchUboData::default(), &tri);
        // A pixel on the diagonal resolves to a partial white
        let [r, ..] = ColorOps::unpack_rgba(fx.surface.resolved(4, 4));
        assert!(r > 0 && r < 255, "resolved {}", r);
        assert_eq!(fx.surface.resolved(1, 1), ColorOps::pack_rgba(255, 255, 255, 0));
    }

    #[test]
    fn test_msaa_first_sample_keeps_native_coverage() {
        for samples in [2, 4] {
            let mut fx = Fixture::new(2, samples);
            fx.draw(&BatchConfig::default(), &BatchUboData::default(), &quad(4.0, 4.0, 8.0, 6.0, WHITE));
            for y in 0..16 {
                for x in 0..16 {
                    let inside = (4..8).contains(&x) && (4..6).contains(&y);
                    assert_eq!(fx.native(x, y) != 0, inside, "{}x pixel {},{}", samples, x, y);
                }
            }
        }
    }

    #[test]
    fn test_average_rgba() {
        assert_eq!(average_rgba([0u32, 0xFFFFFFFF].into_iter()), 0x80808080);
        assert_eq!(average_rgba(std::iter::empty()), 0);
    }
}
