//! Core primitives shared by the GPU crates: logging, frames, pixel helpers
//! and the host display interface.

pub mod graphics;
pub mod host_display;
pub mod logging;

pub mod types {
    use serde::{Deserialize, Serialize};

    /// A CPU-side image in ARGB8888 (0xAARRGGBB), row-major.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u32>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }

        /// Change dimensions, keeping the allocation when it is large enough.
        /// Pixel contents are unspecified afterwards.
        pub fn resize(&mut self, width: u32, height: u32) {
            self.width = width;
            self.height = height;
            self.pixels.resize((width * height) as usize, 0);
        }

        #[inline]
        pub fn pixel(&self, x: u32, y: u32) -> u32 {
            self.pixels[(y * self.width + x) as usize]
        }
    }
}
