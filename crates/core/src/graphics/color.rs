//! Color conversion between the console's 16-bit VRAM format and 32-bit
//! host formats.
//!
//! VRAM words are 5:5:5:1 with red in the low bits and the mask bit in bit
//! 15. Host-side RGBA8888 values are packed the way they sit in memory on a
//! little-endian machine: red in the low byte, alpha in the high byte. Frames
//! use ARGB8888 (0xAARRGGBB).

/// Color operation utilities
pub struct ColorOps;

impl ColorOps {
    /// Expand a 5-bit channel to 8 bits, replicating the top bits into the
    /// low bits so that 31 maps to 255.
    #[inline]
    pub fn convert_5_to_8(c: u8) -> u8 {
        (c << 3) | (c >> 2)
    }

    /// Reduce an 8-bit channel to 5 bits by truncation.
    #[inline]
    pub fn convert_8_to_5(c: u8) -> u8 {
        c >> 3
    }

    /// Convert a VRAM word to RGBA8888. The mask bit becomes alpha 255 or 0.
    ///
    /// ```
    /// use emu_core::graphics::ColorOps;
    ///
    /// assert_eq!(ColorOps::rgba5551_to_rgba8888(0x801F), 0xFF0000FF);
    /// assert_eq!(ColorOps::rgba5551_to_rgba8888(0x7C00), 0x00FF0000);
    /// ```
    #[inline]
    pub fn rgba5551_to_rgba8888(color: u16) -> u32 {
        let r = Self::convert_5_to_8((color & 0x1F) as u8) as u32;
        let g = Self::convert_5_to_8(((color >> 5) & 0x1F) as u8) as u32;
        let b = Self::convert_5_to_8(((color >> 10) & 0x1F) as u8) as u32;
        let a = if color & 0x8000 != 0 { 0xFF } else { 0 };
        r | (g << 8) | (b << 16) | (a << 24)
    }

    /// Convert RGBA8888 back to a VRAM word. Alpha at or above 128 sets the
    /// mask bit. `rgba8888_to_rgba5551(rgba5551_to_rgba8888(x)) == x` for
    /// every 16-bit `x`.
    #[inline]
    pub fn rgba8888_to_rgba5551(color: u32) -> u16 {
        let [r, g, b, a] = Self::unpack_rgba(color);
        let r = Self::convert_8_to_5(r) as u16;
        let g = Self::convert_8_to_5(g) as u16;
        let b = Self::convert_8_to_5(b) as u16;
        let m = ((a >> 7) & 1) as u16;
        r | (g << 5) | (b << 10) | (m << 15)
    }

    #[inline]
    pub fn pack_rgba(r: u8, g: u8, b: u8, a: u8) -> u32 {
        r as u32 | ((g as u32) << 8) | ((b as u32) << 16) | ((a as u32) << 24)
    }

    #[inline]
    pub fn unpack_rgba(color: u32) -> [u8; 4] {
        color.to_le_bytes()
    }

    /// RGBA8888 to the ARGB8888 layout used by [`crate::types::Frame`]
    #[inline]
    pub fn rgba8888_to_argb(color: u32) -> u32 {
        let [r, g, b, a] = Self::unpack_rgba(color);
        ((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | b as u32
    }

    /// Opaque ARGB8888 from a VRAM word, ignoring the mask bit. Used for
    /// debug views of raw VRAM.
    #[inline]
    pub fn rgba5551_to_argb(color: u16) -> u32 {
        0xFF00_0000 | (Self::rgba8888_to_argb(Self::rgba5551_to_rgba8888(color)) & 0x00FF_FFFF)
    }

    /// Per-channel linear interpolation between two RGBA8888 colors
    #[inline]
    pub fn lerp(c0: u32, c1: u32, t: f32) -> u32 {
        let a = Self::unpack_rgba(c0);
        let b = Self::unpack_rgba(c1);
        let mut out = [0u8; 4];
        for i in 0..4 {
            let v = a[i] as f32 + (b[i] as f32 - a[i] as f32) * t;
            out[i] = v.round().clamp(0.0, 255.0) as u8;
        }
        u32::from_le_bytes(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_5_to_8_endpoints() {
        assert_eq!(ColorOps::convert_5_to_8(0), 0);
        assert_eq!(ColorOps::convert_5_to_8(31), 255);
        assert_eq!(ColorOps::convert_5_to_8(16), 132);
    }

    #[test]
    fn test_every_vram_word_survives_conversion() {
        for word in 0..=u16::MAX {
            let rgba = ColorOps::rgba5551_to_rgba8888(word);
            assert_eq!(ColorOps::rgba8888_to_rgba5551(rgba), word, "word {:04X}", word);
        }
    }

    #[test]
    fn test_mask_bit_maps_to_alpha() {
        assert_eq!(ColorOps::rgba5551_to_rgba8888(0x8000) >> 24, 0xFF);
        assert_eq!(ColorOps::rgba5551_to_rgba8888(0x7FFF) >> 24, 0);
        assert_eq!(ColorOps::rgba8888_to_rgba5551(0x7F00_0000), 0);
        assert_eq!(ColorOps::rgba8888_to_rgba5551(0x8000_0000), 0x8000);
    }

    #[test]
    fn test_argb_conversion() {
        let rgba = ColorOps::pack_rgba(0x11, 0x22, 0x33, 0x44);
        assert_eq!(ColorOps::rgba8888_to_argb(rgba), 0x44112233);
        assert_eq!(ColorOps::rgba5551_to_argb(0x001F), 0xFFFF0000);
    }

    #[test]
    fn test_lerp_midpoint() {
        let black = ColorOps::pack_rgba(0, 0, 0, 0);
        let white = ColorOps::pack_rgba(255, 255, 255, 255);
        assert_eq!(ColorOps::unpack_rgba(ColorOps::lerp(black, white, 0.5)), [128; 4]);
        assert_eq!(ColorOps::lerp(black, white, 0.0), black);
        assert_eq!(ColorOps::lerp(black, white, 1.0), white);
    }
}
