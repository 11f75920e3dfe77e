//! Pipeline enums and draw-state registers.

use serde::{Deserialize, Serialize};

use crate::vram::{transfer_bounds, Rect, VRAM_HEIGHT, VRAM_WIDTH};

/// Texture color mode of a batch. Values 4-7 are the "raw" variants, which
/// skip modulation by the vertex color. `Disabled` is untextured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TextureMode {
    Palette4Bit = 0,
    Palette8Bit = 1,
    Direct16Bit = 2,
    Reserved16Bit = 3,
    RawPalette4Bit = 4,
    RawPalette8Bit = 5,
    RawDirect16Bit = 6,
    RawReserved16Bit = 7,
    Disabled = 8,
}

impl TextureMode {
    pub const COUNT: usize = 9;

    pub const ALL: [TextureMode; Self::COUNT] = [
        TextureMode::Palette4Bit,
        TextureMode::Palette8Bit,
        TextureMode::Direct16Bit,
        TextureMode::Reserved16Bit,
        TextureMode::RawPalette4Bit,
        TextureMode::RawPalette8Bit,
        TextureMode::RawDirect16Bit,
        TextureMode::RawReserved16Bit,
        TextureMode::Disabled,
    ];

    /// From the 2-bit color mode of the draw mode register
    pub fn from_color_mode(color_mode: u8, raw: bool) -> Self {
        Self::ALL[((color_mode & 3) | if raw { 4 } else { 0 }) as usize]
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn is_textured(self) -> bool {
        self != TextureMode::Disabled
    }

    #[inline]
    pub fn is_raw(self) -> bool {
        matches!(
            self,
            TextureMode::RawPalette4Bit
                | TextureMode::RawPalette8Bit
                | TextureMode::RawDirect16Bit
                | TextureMode::RawReserved16Bit
        )
    }

    /// The color mode with the raw flag dropped
    pub fn color_mode(self) -> u8 {
        (self as u8) & 3
    }

    pub fn is_paletted(self) -> bool {
        self.is_textured() && self.color_mode() < 2
    }

    /// Width in VRAM words of a 256-texel-wide page in this mode
    pub fn page_width(self) -> u32 {
        match self.color_mode() {
            0 => 64,
            1 => 128,
            _ => 256,
        }
    }
}

/// Semi-transparency blend equation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransparencyMode {
    /// B/2 + F/2
    HalfBackgroundPlusHalfForeground = 0,
    /// B + F
    BackgroundPlusForeground = 1,
    /// B - F
    BackgroundMinusForeground = 2,
    /// B + F/4
    BackgroundPlusQuarterForeground = 3,
    Disabled = 4,
}

impl TransparencyMode {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => TransparencyMode::HalfBackgroundPlusHalfForeground,
            1 => TransparencyMode::BackgroundPlusForeground,
            2 => TransparencyMode::BackgroundMinusForeground,
            _ => TransparencyMode::BackgroundPlusQuarterForeground,
        }
    }

    /// (foreground factor, background factor)
    pub fn factors(self) -> (f32, f32) {
        match self {
            TransparencyMode::HalfBackgroundPlusHalfForeground => (0.5, 0.5),
            TransparencyMode::BackgroundPlusForeground => (1.0, 1.0),
            TransparencyMode::BackgroundMinusForeground => (1.0, 1.0),
            TransparencyMode::BackgroundPlusQuarterForeground => (0.25, 1.0),
            TransparencyMode::Disabled => (1.0, 0.0),
        }
    }
}

/// Which pixels of a batch are drawn in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchRenderMode {
    TransparencyDisabled,
    TransparentAndOpaque,
    OnlyOpaque,
    OnlyTransparent,
}

impl BatchRenderMode {
    pub const COUNT: usize = 4;

    pub const ALL: [BatchRenderMode; Self::COUNT] = [
        BatchRenderMode::TransparencyDisabled,
        BatchRenderMode::TransparentAndOpaque,
        BatchRenderMode::OnlyOpaque,
        BatchRenderMode::OnlyTransparent,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Does this pass run the blend equation?
    pub fn blends(self) -> bool {
        matches!(
            self,
            BatchRenderMode::TransparentAndOpaque | BatchRenderMode::OnlyTransparent
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InterlacedRenderMode {
    #[default]
    None,
    /// Both fields live interleaved in one frame; each field updates its lines
    InterleavedFields,
    /// Each field is stored at half height and expanded on scanout
    SeparateFields,
}

impl InterlacedRenderMode {
    pub const ALL: [InterlacedRenderMode; 3] = [
        InterlacedRenderMode::None,
        InterlacedRenderMode::InterleavedFields,
        InterlacedRenderMode::SeparateFields,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureFilter {
    #[default]
    Nearest,
    Bilinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DownsampleMode {
    #[default]
    Disabled,
    /// Average each scale x scale block back to one native pixel
    Box,
}

/// Texture page and CLUT selection (draw mode and palette registers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TexturePage {
    /// Page base X in 64-word units (0-15)
    pub page_x: u8,
    /// Page base Y in 256-line units (0-1)
    pub page_y: u8,
    /// Texture color mode, 0-3
    pub color_mode: u8,
    /// Semi-transparency mode bits, 0-3
    pub transparency: u8,
    /// CLUT X in words, multiple of 16
    pub clut_x: u16,
    /// CLUT Y line
    pub clut_y: u16,
}

impl TexturePage {
    pub fn base_x(&self) -> u32 {
        (self.page_x as u32 & 0xF) * 64
    }

    pub fn base_y(&self) -> u32 {
        (self.page_y as u32 & 1) * 256
    }

    /// Vertex `texpage` attribute: draw mode bits low, palette bits high
    pub fn packed(&self) -> u32 {
        let mode = (self.page_x as u32 & 0xF)
            | ((self.page_y as u32 & 1) << 4)
            | ((self.transparency as u32 & 3) << 5)
            | ((self.color_mode as u32 & 3) << 7);
        let palette = ((self.clut_x as u32 / 16) & 0x3F) | ((self.clut_y as u32 & 0x1FF) << 6);
        mode | (palette << 16)
    }

    pub fn from_packed(packed: u32) -> Self {
        let palette = packed >> 16;
        Self {
            page_x: (packed & 0xF) as u8,
            page_y: ((packed >> 4) & 1) as u8,
            transparency: ((packed >> 5) & 3) as u8,
            color_mode: ((packed >> 7) & 3) as u8,
            clut_x: ((palette & 0x3F) * 16) as u16,
            clut_y: ((palette >> 6) & 0x1FF) as u16,
        }
    }

    /// VRAM area a primitive in `mode` can sample, page plus palette.
    /// Pages that run off the right edge cover the full width.
    pub fn sampled_rects(&self, mode: TextureMode) -> [Rect; 2] {
        let page = transfer_bounds(self.base_x(), self.base_y(), mode.page_width(), 256);
        let clut = if mode.is_paletted() {
            let entries = if mode.color_mode() == 0 { 16 } else { 256 };
            transfer_bounds(self.clut_x as u32, self.clut_y as u32, entries, 1)
        } else {
            Rect::default()
        };
        [page, clut]
    }
}

/// Texture window in AND/OR form: `u' = (u & and_x) | or_x`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureWindow {
    pub and_x: u32,
    pub and_y: u32,
    pub or_x: u32,
    pub or_y: u32,
}

impl Default for TextureWindow {
    fn default() -> Self {
        Self { and_x: 0xFF, and_y: 0xFF, or_x: 0, or_y: 0 }
    }
}

impl TextureWindow {
    /// From the register fields, each in 8-texel units (5 bits)
    pub fn from_register(mask_x: u8, mask_y: u8, offset_x: u8, offset_y: u8) -> Self {
        let (mx, my) = ((mask_x & 0x1F) as u32, (mask_y & 0x1F) as u32);
        let (ox, oy) = ((offset_x & 0x1F) as u32, (offset_y & 0x1F) as u32);
        Self {
            and_x: !(mx * 8) & 0xFF,
            and_y: !(my * 8) & 0xFF,
            or_x: (ox & mx) * 8,
            or_y: (oy & my) * 8,
        }
    }

    #[inline]
    pub fn apply(&self, u: u32, v: u32) -> (u32, u32) {
        (((u & 0xFF) & self.and_x) | self.or_x, ((v & 0xFF) & self.and_y) | self.or_y)
    }
}

/// Drawing area, inclusive on all edges, in native pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawingArea {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Default for DrawingArea {
    fn default() -> Self {
        Self { left: 0, top: 0, right: VRAM_WIDTH - 1, bottom: VRAM_HEIGHT - 1 }
    }
}

impl DrawingArea {
    /// Exclusive rectangle; an inverted area becomes one pixel wide/high
    pub fn rect(&self) -> Rect {
        Rect::new(
            self.left,
            self.top,
            self.right.max(self.left) + 1,
            self.bottom.max(self.top) + 1,
        )
    }

    /// Scissor in scaled, top-left-origin coordinates
    pub fn scissor(&self, scale: u32) -> Rect {
        self.rect().scaled(scale)
    }

    /// Scissor for a bottom-left-origin framebuffer of `framebuffer_height`
    /// scaled lines, as (x, y, width, height)
    pub fn flipped_scissor(&self, scale: u32, framebuffer_height: u32) -> (i32, i32, i32, i32) {
        let r = self.scissor(scale);
        (
            r.left as i32,
            framebuffer_height as i32 - r.bottom as i32,
            r.width() as i32,
            r.height() as i32,
        )
    }
}
