//! Host display interface
//!
//! The GPU renderer never talks to a window or swap chain directly. It hands
//! finished images to a [`HostDisplay`], which owns textures on the host side
//! and knows how to put them on screen:
//!
//! ```text
//! GpuHw (state, VRAM) -> GpuBackend -> HostDisplay -> {window, headless, ...}
//! ```
//!
//! Hardware backends usually point the display at a texture they own
//! ([`HostDisplay::set_display_texture`]); CPU backends write pixels through
//! [`HostDisplay::begin_set_display_pixels`]. [`HeadlessDisplay`] implements
//! the whole interface in memory and is what tests and tools use.

use std::collections::HashMap;

use thiserror::Error;

use crate::graphics::ColorOps;
use crate::types::Frame;

/// Graphics API the host display was created with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderApi {
    None,
    OpenGL,
    OpenGLES,
    Vulkan,
    D3D11,
}

impl RenderApi {
    pub fn is_opengl(self) -> bool {
        matches!(self, RenderApi::OpenGL | RenderApi::OpenGLES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPixelFormat {
    Rgba8,
    Bgra8,
    Rgb565,
    Rgba5551,
}

impl HostPixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            HostPixelFormat::Rgba8 | HostPixelFormat::Bgra8 => 4,
            HostPixelFormat::Rgb565 | HostPixelFormat::Rgba5551 => 2,
        }
    }

    /// Decode one pixel starting at `bytes[0]` to ARGB8888
    fn to_argb(self, bytes: &[u8]) -> u32 {
        match self {
            HostPixelFormat::Rgba8 => {
                ColorOps::rgba8888_to_argb(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            HostPixelFormat::Bgra8 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            HostPixelFormat::Rgb565 => {
                let v = u16::from_le_bytes([bytes[0], bytes[1]]);
                let r = ColorOps::convert_5_to_8((v >> 11) as u8 & 0x1F) as u32;
                let g = (((v >> 5) & 0x3F) as u32 * 255 + 31) / 63;
                let b = ColorOps::convert_5_to_8(v as u8 & 0x1F) as u32;
                0xFF00_0000 | (r << 16) | (g << 8) | b
            }
            HostPixelFormat::Rgba5551 => {
                ColorOps::rgba5551_to_argb(u16::from_le_bytes([bytes[0], bytes[1]]))
            }
        }
    }
}

/// Opaque handle to a host texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// The part of a texture the display should show. A negative
/// `view_height` means the rows are stored bottom-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayView {
    pub handle: TextureHandle,
    pub format: HostPixelFormat,
    pub texture_width: u32,
    pub texture_height: u32,
    pub view_x: i32,
    pub view_y: i32,
    pub view_width: i32,
    pub view_height: i32,
}

/// Geometry of the emulated display, used for aspect correction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayParameters {
    pub display_width: u32,
    pub display_height: u32,
    pub active_left: u32,
    pub active_top: u32,
    pub active_width: u32,
    pub active_height: u32,
    pub aspect_ratio: f32,
}

impl Default for DisplayParameters {
    fn default() -> Self {
        Self {
            display_width: 0,
            display_height: 0,
            active_left: 0,
            active_top: 0,
            active_width: 0,
            active_height: 0,
            aspect_ratio: 4.0 / 3.0,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DisplayError {
    #[error("Unknown texture handle {0}")]
    UnknownTexture(u64),

    #[error("Region {width}x{height} at ({x}, {y}) is outside the texture")]
    OutOfBounds { x: u32, y: u32, width: u32, height: u32 },

    #[error("Pixel data too small: need {needed} bytes, got {got}")]
    ShortBuffer { needed: usize, got: usize },

    #[error("Texture allocation failed: {0}")]
    Allocation(String),

    #[error("Unsupported: {0}")]
    Unsupported(&'static str),
}

/// Host display collaborator
///
/// All methods are called from the thread that owns the GPU renderer.
pub trait HostDisplay {
    fn render_api(&self) -> RenderApi;

    /// Create a texture, optionally initialised from `data` rows of `stride`
    /// bytes.
    #[allow(clippy::too_many_arguments)]
    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        samples: u32,
        format: HostPixelFormat,
        data: Option<&[u8]>,
        stride: u32,
        dynamic: bool,
    ) -> Result<TextureHandle, DisplayError>;

    fn destroy_texture(&mut self, handle: TextureHandle);

    #[allow(clippy::too_many_arguments)]
    fn update_texture(
        &mut self,
        handle: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
        stride: u32,
    ) -> Result<(), DisplayError>;

    #[allow(clippy::too_many_arguments)]
    fn download_texture(
        &mut self,
        handle: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u8],
        stride: u32,
    ) -> Result<(), DisplayError>;

    fn set_display_texture(&mut self, view: DisplayView);

    fn clear_display_texture(&mut self);

    fn set_display_parameters(&mut self, params: DisplayParameters);

    /// Start writing a CPU-side display image. Returns a tightly packed
    /// buffer of `width * height` pixels, or `None` when the host cannot
    /// provide one right now.
    fn begin_set_display_pixels(
        &mut self,
        format: HostPixelFormat,
        width: u32,
        height: u32,
    ) -> Option<&mut [u8]>;

    fn end_set_display_pixels(&mut self);

    /// Render what is currently displayed into `out`. Returns false when
    /// nothing can be captured.
    fn render_screenshot(&mut self, out: &mut Frame) -> bool;
}

struct HostTexture {
    width: u32,
    height: u32,
    format: HostPixelFormat,
    data: Vec<u8>,
}

impl HostTexture {
    fn check_region(&self, x: u32, y: u32, width: u32, height: u32) -> Result<(), DisplayError> {
        if x + width > self.width || y + height > self.height {
            return Err(DisplayError::OutOfBounds { x, y, width, height });
        }
        Ok(())
    }

    fn row_bytes(&self, width: u32) -> usize {
        (width * self.format.bytes_per_pixel()) as usize
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        ((y * self.width + x) * self.format.bytes_per_pixel()) as usize
    }
}

enum DisplaySource {
    None,
    Texture(DisplayView),
    Pixels { format: HostPixelFormat, width: u32, height: u32 },
}

/// In-memory host display
pub struct HeadlessDisplay {
    api: RenderApi,
    textures: HashMap<u64, HostTexture>,
    next_handle: u64,
    source: DisplaySource,
    params: DisplayParameters,
    pixel_buffer: Vec<u8>,
    pixels_pending: bool,
    /// Refuse texture creation, to exercise allocation-failure paths
    pub fail_allocations: bool,
}

impl HeadlessDisplay {
    pub fn new() -> Self {
        Self::with_render_api(RenderApi::None)
    }

    /// Pretend to be backed by `api`. Backends check this at initialisation.
    pub fn with_render_api(api: RenderApi) -> Self {
        Self {
            api,
            textures: HashMap::new(),
            next_handle: 1,
            source: DisplaySource::None,
            params: DisplayParameters::default(),
            pixel_buffer: Vec::new(),
            pixels_pending: false,
            fail_allocations: false,
        }
    }

    pub fn display_parameters(&self) -> &DisplayParameters {
        &self.params
    }

    pub fn display_view(&self) -> Option<&DisplayView> {
        match &self.source {
            DisplaySource::Texture(view) => Some(view),
            _ => None,
        }
    }

    pub fn has_display(&self) -> bool {
        !matches!(self.source, DisplaySource::None)
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn texture(&self, handle: TextureHandle) -> Result<&HostTexture, DisplayError> {
        self.textures
            .get(&handle.0)
            .ok_or(DisplayError::UnknownTexture(handle.0))
    }

    fn capture_view(&self, view: &DisplayView, out: &mut Frame) -> bool {
        let Ok(texture) = self.texture(view.handle) else {
            return false;
        };
        let width = view.view_width.unsigned_abs();
        let height = view.view_height.unsigned_abs();
        if view.view_x < 0
            || view.view_y < 0
            || texture
                .check_region(view.view_x as u32, view.view_y as u32, width, height)
                .is_err()
        {
            return false;
        }
        out.resize(width, height);
        let bpp = texture.format.bytes_per_pixel() as usize;
        for row in 0..height {
            let src_row = if view.view_height < 0 { height - 1 - row } else { row };
            let start = texture.offset(view.view_x as u32, view.view_y as u32 + src_row);
            for col in 0..width as usize {
                let p = start + col * bpp;
                out.pixels[(row * width) as usize + col] = texture.format.to_argb(&texture.data[p..p + bpp]);
            }
        }
        true
    }
}

impl Default for HeadlessDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDisplay for HeadlessDisplay {
    fn render_api(&self) -> RenderApi {
        self.api
    }

    fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        _samples: u32,
        format: HostPixelFormat,
        data: Option<&[u8]>,
        stride: u32,
        _dynamic: bool,
    ) -> Result<TextureHandle, DisplayError> {
        if self.fail_allocations {
            return Err(DisplayError::Allocation(format!("{}x{} texture", width, height)));
        }
        let mut texture = HostTexture {
            width,
            height,
            format,
            data: vec![0; (width * height * format.bytes_per_pixel()) as usize],
        };
        if let Some(data) = data {
            copy_rows(&mut texture, 0, 0, width, height, data, stride)?;
        }
        let handle = TextureHandle(self.next_handle);
        self.next_handle += 1;
        self.textures.insert(handle.0, texture);
        Ok(handle)
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        self.textures.remove(&handle.0);
        if matches!(&self.source, DisplaySource::Texture(view) if view.handle == handle) {
            self.source = DisplaySource::None;
        }
    }

    fn update_texture(
        &mut self,
        handle: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u8],
        stride: u32,
    ) -> Result<(), DisplayError> {
        let texture = self
            .textures
            .get_mut(&handle.0)
            .ok_or(DisplayError::UnknownTexture(handle.0))?;
        copy_rows(texture, x, y, width, height, data, stride)
    }

    fn download_texture(
        &mut self,
        handle: TextureHandle,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        out: &mut [u8],
        stride: u32,
    ) -> Result<(), DisplayError> {
        let texture = self.texture(handle)?;
        texture.check_region(x, y, width, height)?;
        let row_bytes = texture.row_bytes(width);
        let needed = stride as usize * height.saturating_sub(1) as usize + row_bytes;
        if out.len() < needed {
            return Err(DisplayError::ShortBuffer { needed, got: out.len() });
        }
        for row in 0..height {
            let src = texture.offset(x, y + row);
            let dst = (row * stride) as usize;
            out[dst..dst + row_bytes].copy_from_slice(&texture.data[src..src + row_bytes]);
        }
        Ok(())
    }

    fn set_display_texture(&mut self, view: DisplayView) {
        self.source = DisplaySource::Texture(view);
    }

    fn clear_display_texture(&mut self) {
        self.source = DisplaySource::None;
    }

    fn set_display_parameters(&mut self, params: DisplayParameters) {
        self.params = params;
    }

    fn begin_set_display_pixels(
        &mut self,
        format: HostPixelFormat,
        width: u32,
        height: u32,
    ) -> Option<&mut [u8]> {
        if self.fail_allocations {
            return None;
        }
        self.pixel_buffer
            .resize((width * height * format.bytes_per_pixel()) as usize, 0);
        self.source = DisplaySource::Pixels { format, width, height };
        self.pixels_pending = true;
        Some(self.pixel_buffer.as_mut_slice())
    }

    fn end_set_display_pixels(&mut self) {
        self.pixels_pending = false;
    }

    fn render_screenshot(&mut self, out: &mut Frame) -> bool {
        match &self.source {
            DisplaySource::None => false,
            DisplaySource::Texture(view) => self.capture_view(view, out),
            DisplaySource::Pixels { format, width, height } => {
                if self.pixels_pending {
                    return false;
                }
                let bpp = format.bytes_per_pixel() as usize;
                out.resize(*width, *height);
                for (i, pixel) in out.pixels.iter_mut().enumerate() {
                    *pixel = format.to_argb(&self.pixel_buffer[i * bpp..(i + 1) * bpp]);
                }
                true
            }
        }
    }
}

fn copy_rows(
    texture: &mut HostTexture,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    data: &[u8],
    stride: u32,
) -> Result<(), DisplayError> {
    texture.check_region(x, y, width, height)?;
    let row_bytes = texture.row_bytes(width);
    let needed = stride as usize * height.saturating_sub(1) as usize + row_bytes;
    if data.len() < needed {
        return Err(DisplayError::ShortBuffer { needed, got: data.len() });
    }
    for row in 0..height {
        let src = (row * stride) as usize;
        let dst = texture.offset(x, y + row);
        texture.data[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba_bytes(pixels: &[u32]) -> Vec<u8> {
        pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }

    #[test]
    fn test_create_update_download() {
        let mut display = HeadlessDisplay::new();
        let handle = display
            .create_texture(4, 2, 1, HostPixelFormat::Rgba8, None, 0, true)
            .expect("create");

        let data = rgba_bytes(&[0x11223344, 0x55667788]);
        display.update_texture(handle, 1, 1, 2, 1, &data, 8).expect("update");

        let mut out = vec![0u8; 8];
        display
            .download_texture(handle, 1, 1, 2, 1, &mut out, 8)
            .expect("download");
        assert_eq!(out, data);
    }

    #[test]
    fn test_update_out_of_bounds() {
        let mut display = HeadlessDisplay::new();
        let handle = display
            .create_texture(2, 2, 1, HostPixelFormat::Rgba5551, None, 0, false)
            .expect("create");
        let err = display
            .update_texture(handle, 1, 1, 2, 2, &[0; 8], 4)
            .unwrap_err();
        assert_eq!(err, DisplayError::OutOfBounds { x: 1, y: 1, width: 2, height: 2 });
    }

    #[test]
    fn test_unknown_handle() {
        let mut display = HeadlessDisplay::new();
        let mut out = [0u8; 4];
        assert_eq!(
            display.download_texture(TextureHandle(42), 0, 0, 1, 1, &mut out, 4),
            Err(DisplayError::UnknownTexture(42))
        );
    }

    #[test]
    fn test_screenshot_of_flipped_texture_view() {
        let mut display = HeadlessDisplay::new();
        // Row 0 red, row 1 blue (RGBA8888, opaque)
        let data = rgba_bytes(&[0xFF0000FF, 0xFF0000FF, 0xFFFF0000, 0xFFFF0000]);
        let handle = display
            .create_texture(2, 2, 1, HostPixelFormat::Rgba8, Some(&data), 8, false)
            .expect("create");
        display.set_display_texture(DisplayView {
            handle,
            format: HostPixelFormat::Rgba8,
            texture_width: 2,
            texture_height: 2,
            view_x: 0,
            view_y: 0,
            view_width: 2,
            view_height: -2,
        });

        let mut frame = Frame::default();
        assert!(display.render_screenshot(&mut frame));
        assert_eq!(frame.pixel(0, 0), 0xFF0000FF);
        assert_eq!(frame.pixel(1, 1), 0xFFFF0000);
    }

    #[test]
    fn test_display_pixels_screenshot() {
        let mut display = HeadlessDisplay::new();
        let buffer = display
            .begin_set_display_pixels(HostPixelFormat::Rgba5551, 2, 1)
            .expect("buffer");
        buffer.copy_from_slice(&[0x1F, 0x00, 0x00, 0x7C]);
        // Not readable until the write is finished
        let mut frame = Frame::default();
        assert!(!display.render_screenshot(&mut frame));
        display.end_set_display_pixels();

        assert!(display.render_screenshot(&mut frame));
        assert_eq!(frame.pixels, vec![0xFFFF0000, 0xFF0000FF]);
    }

    #[test]
    fn test_destroying_displayed_texture_clears_display() {
        let mut display = HeadlessDisplay::new();
        let handle = display
            .create_texture(1, 1, 1, HostPixelFormat::Bgra8, None, 0, false)
            .expect("create");
        display.set_display_texture(DisplayView {
            handle,
            format: HostPixelFormat::Bgra8,
            texture_width: 1,
            texture_height: 1,
            view_x: 0,
            view_y: 0,
            view_width: 1,
            view_height: 1,
        });
        assert!(display.has_display());
        display.destroy_texture(handle);
        assert!(!display.has_display());
        assert_eq!(display.texture_count(), 0);
    }

    #[test]
    fn test_allocation_failure() {
        let mut display = HeadlessDisplay::new();
        display.fail_allocations = true;
        assert!(matches!(
            display.create_texture(8, 8, 1, HostPixelFormat::Rgba8, None, 0, false),
            Err(DisplayError::Allocation(_))
        ));
        assert!(display
            .begin_set_display_pixels(HostPixelFormat::Rgba8, 8, 8)
            .is_none());
    }

    #[test]
    fn test_render_api() {
        assert!(HeadlessDisplay::with_render_api(RenderApi::OpenGLES)
            .render_api()
            .is_opengl());
        assert!(!HeadlessDisplay::new().render_api().is_opengl());
    }
}
