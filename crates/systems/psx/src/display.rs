//! Display composition: turning the visible part of VRAM into an image.
//!
//! [`plan_display`] decides how a frame reaches the host display. The plain
//! case shows a region of the VRAM texture directly. 24-bit output,
//! interlacing, multisampling and downsampling need a reinterpret pass into
//! a separate display texture, optionally followed by a box filter. The
//! helpers below implement that pass on the CPU, with the same arithmetic
//! as the generated display shader.

use emu_core::graphics::ColorOps;
use emu_core::host_display::DisplayParameters;

use crate::settings::GpuSettings;
use crate::types::InterlacedRenderMode;
use crate::vram::{Rect, VRAM_HEIGHT, VRAM_WIDTH};

/// Display registers, in native units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayConfig {
    pub enabled: bool,
    /// Display start in VRAM
    pub vram_x: u32,
    pub vram_y: u32,
    /// First visible pixel relative to `vram_x`, in output pixels
    pub crop_left: u32,
    pub width: u32,
    /// Output lines; twice the VRAM lines of one field for 240-line
    /// interlaced modes
    pub height: u32,
    pub color_24bit: bool,
    pub interlaced: bool,
    /// 480-line mode, both fields live in VRAM
    pub high_resolution: bool,
    /// Field being displayed
    pub field: u32,
    pub params: DisplayParameters,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vram_x: 0,
            vram_y: 0,
            crop_left: 0,
            width: 320,
            height: 240,
            color_24bit: false,
            interlaced: false,
            high_resolution: false,
            field: 0,
            params: DisplayParameters::default(),
        }
    }
}

impl DisplayConfig {
    pub fn interlaced_render_mode(&self, disable_interlacing: bool) -> InterlacedRenderMode {
        if !self.interlaced || disable_interlacing {
            InterlacedRenderMode::None
        } else if self.high_resolution {
            InterlacedRenderMode::InterleavedFields
        } else {
            InterlacedRenderMode::SeparateFields
        }
    }
}

/// Renderer settings that affect composition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayOptions {
    pub resolution_scale: u32,
    pub multisamples: u32,
    pub downsample: bool,
    pub chroma_smoothing: bool,
    pub disable_interlacing: bool,
}

impl DisplayOptions {
    pub fn from_settings(settings: &GpuSettings) -> Self {
        Self {
            resolution_scale: settings.resolution_scale.max(1),
            multisamples: settings.multisamples.max(1),
            downsample: settings.uses_downsampling(),
            chroma_smoothing: settings.chroma_smoothing_24bit,
            disable_interlacing: settings.disable_interlacing,
        }
    }
}

/// Display shader uniforms, native units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayUniforms {
    pub vram_x: i32,
    pub vram_y: i32,
    pub crop_left: i32,
    pub field: i32,
}

impl DisplayUniforms {
    pub fn as_array(&self) -> [i32; 4] {
        [self.vram_x, self.vram_y, self.crop_left, self.field]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReinterpretPass {
    pub depth_24bit: bool,
    pub interlace: InterlacedRenderMode,
    pub uniforms: DisplayUniforms,
    /// Display texture size
    pub width: u32,
    pub height: u32,
    /// Final size after the box filter
    pub downsample_to: Option<(u32, u32)>,
    pub chroma_smoothing: bool,
}

impl ReinterpretPass {
    /// Scale of the display texture relative to native pixels
    pub fn output_scale(&self, resolution_scale: u32) -> u32 {
        if self.depth_24bit {
            1
        } else {
            resolution_scale
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayPath {
    Clear,
    /// Show this scaled, top-left-origin region of the VRAM texture
    Direct(Rect),
    Reinterpret(ReinterpretPass),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayPlan {
    pub path: DisplayPath,
    pub params: DisplayParameters,
}

impl DisplayPlan {
    /// Size of the image the host ends up showing, `None` when cleared
    pub fn output_size(&self) -> Option<(u32, u32)> {
        match &self.path {
            DisplayPath::Clear => None,
            DisplayPath::Direct(rect) => Some((rect.width(), rect.height())),
            DisplayPath::Reinterpret(pass) => Some(pass.downsample_to.unwrap_or((pass.width, pass.height))),
        }
    }
}

pub fn plan_display(config: &DisplayConfig, options: &DisplayOptions) -> DisplayPlan {
    let params = config.params;
    if !config.enabled || config.width == 0 || config.height == 0 {
        return DisplayPlan { path: DisplayPath::Clear, params };
    }

    let scale = options.resolution_scale.max(1);
    let interlace = config.interlaced_render_mode(options.disable_interlacing);
    let start_x = config.vram_x + config.crop_left;
    let crop_fits = start_x + config.width <= VRAM_WIDTH && config.vram_y + config.height <= VRAM_HEIGHT;

    if !config.color_24bit
        && interlace == InterlacedRenderMode::None
        && options.multisamples == 1
        && !options.downsample
        && crop_fits
    {
        let rect = Rect::from_extents(start_x, config.vram_y, config.width, config.height).scaled(scale);
        return DisplayPlan { path: DisplayPath::Direct(rect), params };
    }

    let output_scale = if config.color_24bit { 1 } else { scale };
    let downsample_to = (options.downsample && !config.color_24bit && scale > 1)
        .then_some((config.width, config.height));
    let pass = ReinterpretPass {
        depth_24bit: config.color_24bit,
        interlace,
        uniforms: DisplayUniforms {
            vram_x: config.vram_x as i32,
            vram_y: config.vram_y as i32,
            crop_left: config.crop_left as i32,
            field: if interlace == InterlacedRenderMode::None { 0 } else { (config.field & 1) as i32 },
        },
        width: config.width * output_scale,
        height: config.height * output_scale,
        downsample_to,
        chroma_smoothing: config.color_24bit && options.chroma_smoothing,
    };
    DisplayPlan { path: DisplayPath::Reinterpret(pass), params }
}

/// Pixel `relative_x` of a 24-bit line from the two VRAM words covering it
#[inline]
pub fn decode_24bit(relative_x: u32, s0: u16, s1: u16) -> [u8; 3] {
    let s1s0 = (((s1 as u32) << 16) | s0 as u32) >> ((relative_x & 1) * 8);
    [s1s0 as u8, (s1s0 >> 8) as u8, (s1s0 >> 16) as u8]
}

fn rgb_to_yuv(rgb: [f32; 3]) -> [f32; 3] {
    let [r, g, b] = rgb;
    [
        0.299 * r + 0.587 * g + 0.114 * b,
        -0.14713 * r - 0.28886 * g + 0.436 * b,
        0.615 * r - 0.51499 * g - 0.10001 * b,
    ]
}

fn yuv_to_rgb(yuv: [f32; 3]) -> [f32; 3] {
    let [y, u, v] = yuv;
    [y + 1.13983 * v, y - 0.39465 * u - 0.58060 * v, y + 2.03211 * u]
}

/// Run the reinterpret pass on the CPU.
///
/// `native` returns the VRAM word at wrapped native coordinates and
/// `scaled` the resolved RGBA8 texel at wrapped scaled coordinates. Lines of
/// the other field are left untouched in `out`, which must hold
/// `pass.width * pass.height` RGBA8 pixels.
pub fn compose<N, S>(pass: &ReinterpretPass, resolution_scale: u32, native: N, scaled: S, out: &mut [u32])
where
    N: Fn(u32, u32) -> u16,
    S: Fn(u32, u32) -> u32,
{
    let output_scale = pass.output_scale(resolution_scale) as i32;
    let u = pass.uniforms;
    let load_24 = |x: i32, vy: u32| -> [f32; 3] {
        let relative_x = (x + u.crop_left).max(0) as u32;
        let vx = u.vram_x as u32 + (relative_x * 3) / 2;
        let rgb = decode_24bit(relative_x, native(vx, vy), native(vx + 1, vy));
        rgb.map(|c| c as f32 / 255.0)
    };

    for y in 0..pass.height as i32 {
        let mut sy = y;
        if pass.interlace != InterlacedRenderMode::None {
            let line = y / output_scale;
            if (line & 1) != u.field {
                continue;
            }
            if pass.interlace == InterlacedRenderMode::SeparateFields {
                sy = (line >> 1) * output_scale + y % output_scale;
            }
        }
        let row = &mut out[(y as u32 * pass.width) as usize..((y as u32 + 1) * pass.width) as usize];

        for (x, pixel) in row.iter_mut().enumerate() {
            let x = x as i32;
            *pixel = if pass.depth_24bit {
                let vy = (u.vram_y + sy) as u32;
                let mut rgb = load_24(x, vy);
                if pass.chroma_smoothing {
                    let yuv = rgb_to_yuv(rgb);
                    let left = rgb_to_yuv(load_24(x - 1, vy));
                    let right = rgb_to_yuv(load_24(x + 1, vy));
                    let smoothed = [
                        yuv[0],
                        (left[1] + yuv[1] + right[1]) / 3.0,
                        (left[2] + yuv[2] + right[2]) / 3.0,
                    ];
                    rgb = yuv_to_rgb(smoothed).map(|c| c.clamp(0.0, 1.0));
                }
                let [r, g, b] = rgb.map(|c| (c * 255.0).round() as u8);
                ColorOps::pack_rgba(r, g, b, 0xFF)
            } else {
                let sx = ((u.vram_x + u.crop_left) * output_scale + x) as u32;
                let sy = (u.vram_y * output_scale + sy) as u32;
                scaled(sx, sy) | 0xFF00_0000
            };
        }
    }
}

/// Average each `factor x factor` block of an RGBA8 image
pub fn box_downsample(src: &[u32], src_width: u32, src_height: u32, factor: u32) -> Vec<u32> {
    let factor = factor.max(1);
    let (width, height) = (src_width / factor, src_height / factor);
    let area = factor * factor;
    let mut out = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let mut sum = [0u32; 3];
            for by in 0..factor {
                let row = ((y * factor + by) * src_width + x * factor) as usize;
                for &texel in &src[row..row + factor as usize] {
                    let [r, g, b, _] = ColorOps::unpack_rgba(texel);
                    sum[0] += r as u32;
                    sum[1] += g as u32;
                    sum[2] += b as u32;
                }
            }
            let [r, g, b] = sum.map(|c| ((c + area / 2) / area) as u8);
            out.push(ColorOps::pack_rgba(r, g, b, 0xFF));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(scale: u32) -> DisplayOptions {
        DisplayOptions {
            resolution_scale: scale,
            multisamples: 1,
            downsample: false,
            chroma_smoothing: false,
            disable_interlacing: false,
        }
    }

    #[test]
    fn test_disabled_display_clears() {
        let config = DisplayConfig { enabled: false, ..Default::default() };
        assert_eq!(plan_display(&config, &options(1)).path, DisplayPath::Clear);
    }

    #[test]
    fn test_direct_path() {
        let config = DisplayConfig { vram_x: 0, vram_y: 256, crop_left: 8, width: 320, height: 240, ..Default::default() };
        let plan = plan_display(&config, &options(2));
        assert_eq!(plan.path, DisplayPath::Direct(Rect::new(16, 512, 656, 992)));
    }

    #[test]
    fn test_reinterpret_conditions() {
        let base = DisplayConfig::default();

        let c24 = DisplayConfig { color_24bit: true, ..base };
        match plan_display(&c24, &options(4)).path {
            DisplayPath::Reinterpret(pass) => {
                assert!(pass.depth_24bit);
                assert_eq!((pass.width, pass.height), (320, 240));
                assert_eq!(pass.downsample_to, None);
            }
            other => panic!("unexpected {:?}", other),
        }

        let msaa = DisplayOptions { multisamples: 4, ..options(1) };
        assert!(matches!(plan_display(&base, &msaa).path, DisplayPath::Reinterpret(_)));

        let down = DisplayOptions { downsample: true, ..options(3) };
        match plan_display(&base, &down).path {
            DisplayPath::Reinterpret(pass) => {
                assert_eq!((pass.width, pass.height), (960, 720));
                assert_eq!(pass.downsample_to, Some((320, 240)));
            }
            other => panic!("unexpected {:?}", other),
        }

        let wrapping = DisplayConfig { vram_x: 900, width: 320, ..base };
        assert!(matches!(plan_display(&wrapping, &options(1)).path, DisplayPath::Reinterpret(_)));
    }

    #[test]
    fn test_output_size_follows_the_path() {
        let base = DisplayConfig::default();
        assert_eq!(plan_display(&DisplayConfig { enabled: false, ..base }, &options(2)).output_size(), None);
        assert_eq!(plan_display(&base, &options(2)).output_size(), Some((640, 480)));
        let c24 = DisplayConfig { color_24bit: true, ..base };
        assert_eq!(plan_display(&c24, &options(4)).output_size(), Some((320, 240)));
        let down = DisplayOptions { downsample: true, ..options(3) };
        assert_eq!(plan_display(&base, &down).output_size(), Some((320, 240)));
        let msaa = DisplayOptions { multisamples: 4, ..options(2) };
        assert_eq!(plan_display(&base, &msaa).output_size(), Some((640, 480)));
    }

    #[test]
    fn test_interlace_modes() {
        let config = DisplayConfig { interlaced: true, high_resolution: true, field: 1, height: 480, ..Default::default() };
        match plan_display(&config, &options(1)).path {
            DisplayPath::Reinterpret(pass) => {
                assert_eq!(pass.interlace, InterlacedRenderMode::InterleavedFields);
                assert_eq!(pass.uniforms.field, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            DisplayConfig { interlaced: true, ..Default::default() }.interlaced_render_mode(false),
            InterlacedRenderMode::SeparateFields
        );
        let progressive = DisplayOptions { disable_interlacing: true, ..options(1) };
        assert!(matches!(plan_display(&config, &progressive).path, DisplayPath::Direct(_)));
    }

    #[test]
    fn test_decode_24bit() {
        // Bytes R0 G0 B0 R1 G1 B1 packed into three words
        let words = [0x2211u16, 0x4433, 0x6655];
        assert_eq!(decode_24bit(0, words[0], words[1]), [0x11, 0x22, 0x33]);
        assert_eq!(decode_24bit(1, words[1], words[2]), [0x44, 0x55, 0x66]);
    }

    #[test]
    fn test_compose_24bit_line() {
        let words = [0x2211u16, 0x4433, 0x6655, 0];
        let pass = ReinterpretPass {
            depth_24bit: true,
            interlace: InterlacedRenderMode::None,
            uniforms: DisplayUniforms::default(),
            width: 2,
            height: 1,
            downsample_to: None,
            chroma_smoothing: false,
        };
        let mut out = vec![0u32; 2];
        compose(&pass, 2, |x, y| if y == 0 { words[(x as usize).min(3)] } else { 0 }, |_, _| 0, &mut out);
        assert_eq!(out, vec![0xFF332211, 0xFF665544]);
    }

    #[test]
    fn test_compose_interleaved_keeps_other_field() {
        let pass = ReinterpretPass {
            depth_24bit: false,
            interlace: InterlacedRenderMode::InterleavedFields,
            uniforms: DisplayUniforms { field: 1, ..Default::default() },
            width: 1,
            height: 4,
            downsample_to: None,
            chroma_smoothing: false,
        };
        let mut out = vec![7u32; 4];
        compose(&pass, 1, |_, _| 0, |_, y| y, &mut out);
        assert_eq!(out, vec![7, 0xFF000001, 7, 0xFF000003]);
    }

    #[test]
    fn test_compose_separate_fields_halves_lines() {
        let pass = ReinterpretPass {
            depth_24bit: false,
            interlace: InterlacedRenderMode::SeparateFields,
            uniforms: DisplayUniforms { vram_y: 10, field: 0, ..Default::default() },
            width: 1,
            height: 4,
            downsample_to: None,
            chroma_smoothing: false,
        };
        let mut out = vec![0u32; 4];
        compose(&pass, 1, |_, _| 0, |_, y| y, &mut out);
        assert_eq!(out[0] & 0xFF, 10);
        assert_eq!(out[2] & 0xFF, 11);
        assert_eq!(out[1], 0);
    }

    #[test]
    fn test_box_downsample() {
        let src = vec![
            ColorOps::pack_rgba(0, 0, 0, 0),
            ColorOps::pack_rgba(255, 0, 0, 0),
            ColorOps::pack_rgba(0, 255, 0, 0),
            ColorOps::pack_rgba(255, 255, 0, 0),
        ];
        let out = box_downsample(&src, 2, 2, 2);
        assert_eq!(out, vec![ColorOps::pack_rgba(128, 128, 0, 0xFF)]);
    }
}
