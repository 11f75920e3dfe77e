//! Floating-point depth buffer with a selectable compare function.
//!
//! Besides geometry depth, the GPU renderer stores the VRAM mask bit here: a
//! pixel whose mask bit is set holds a non-zero depth, and "check mask before
//! draw" becomes a `GEqual` test against a decreasing per-primitive value.
//!
//! ```
//! use emu_core::graphics::{DepthBuffer, DepthFunc};
//!
//! let mut depth = DepthBuffer::new(4, 4);
//! depth.set(1, 1, 1.0);
//! assert!(!depth.test_and_update(1, 1, 0.5, DepthFunc::GEqual, true));
//! assert!(depth.test_and_update(2, 1, 0.5, DepthFunc::GEqual, true));
//! ```

/// Depth comparison; the incoming value is on the left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthFunc {
    Always,
    GEqual,
    LEqual,
}

impl DepthFunc {
    #[inline]
    pub fn passes(self, incoming: f32, stored: f32) -> bool {
        match self {
            DepthFunc::Always => true,
            DepthFunc::GEqual => incoming >= stored,
            DepthFunc::LEqual => incoming <= stored,
        }
    }
}

pub struct DepthBuffer {
    width: u32,
    height: u32,
    /// Row-major: index = y * width + x
    buffer: Vec<f32>,
}

impl DepthBuffer {
    /// New buffer cleared to 0.0
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            buffer: vec![0.0; (width * height) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn clear(&mut self, value: f32) {
        self.buffer.fill(value);
    }

    /// Set every pixel of `[left, right) x [top, bottom)` to `value`,
    /// clipped to the buffer.
    pub fn fill_rect(&mut self, left: u32, top: u32, right: u32, bottom: u32, value: f32) {
        let right = right.min(self.width);
        let bottom = bottom.min(self.height);
        if left >= right {
            return;
        }
        for y in top..bottom {
            let row = (y * self.width) as usize;
            self.buffer[row + left as usize..row + right as usize].fill(value);
        }
    }

    /// Out-of-range reads return 0.0
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        if x >= self.width || y >= self.height {
            return 0.0;
        }
        self.buffer[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        if x < self.width && y < self.height {
            self.buffer[(y * self.width + x) as usize] = value;
        }
    }

    /// Compare `depth` against the stored value; when it passes and `write`
    /// is set, store it. Out-of-range pixels always fail.
    #[inline]
    pub fn test_and_update(&mut self, x: u32, y: u32, depth: f32, func: DepthFunc, write: bool) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let idx = (y * self.width + x) as usize;
        if !func.passes(depth, self.buffer[idx]) {
            return false;
        }
        if write {
            self.buffer[idx] = depth;
        }
        true
    }

    /// Recreate with new dimensions, cleared to 0.0
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.buffer.clear();
        self.buffer.resize((width * height) as usize, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_cleared() {
        let depth = DepthBuffer::new(8, 4);
        assert_eq!(depth.width(), 8);
        assert_eq!(depth.height(), 4);
        assert_eq!(depth.get(7, 3), 0.0);
    }

    #[test]
    fn test_always_writes_even_when_smaller() {
        let mut depth = DepthBuffer::new(2, 2);
        depth.set(0, 0, 1.0);
        assert!(depth.test_and_update(0, 0, 0.25, DepthFunc::Always, true));
        assert_eq!(depth.get(0, 0), 0.25);
    }

    #[test]
    fn test_gequal_rejects_smaller_values() {
        let mut depth = DepthBuffer::new(2, 2);
        depth.set(0, 0, 0.75);
        assert!(!depth.test_and_update(0, 0, 0.5, DepthFunc::GEqual, true));
        assert_eq!(depth.get(0, 0), 0.75);
        assert!(depth.test_and_update(0, 0, 0.75, DepthFunc::GEqual, true));
    }

    #[test]
    fn test_lequal_without_write() {
        let mut depth = DepthBuffer::new(2, 2);
        depth.clear(0.5);
        assert!(depth.test_and_update(1, 1, 0.25, DepthFunc::LEqual, false));
        assert_eq!(depth.get(1, 1), 0.5);
        assert!(!depth.test_and_update(1, 1, 0.75, DepthFunc::LEqual, false));
    }

    #[test]
    fn test_fill_rect_is_clipped() {
        let mut depth = DepthBuffer::new(4, 4);
        depth.fill_rect(2, 1, 10, 3, 1.0);
        assert_eq!(depth.get(1, 1), 0.0);
        assert_eq!(depth.get(2, 1), 1.0);
        assert_eq!(depth.get(3, 2), 1.0);
        assert_eq!(depth.get(3, 3), 0.0);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut depth = DepthBuffer::new(2, 2);
        assert!(!depth.test_and_update(2, 0, 1.0, DepthFunc::Always, true));
        depth.set(5, 5, 1.0);
        assert_eq!(depth.get(5, 5), 0.0);
    }

    #[test]
    fn test_resize_clears() {
        let mut depth = DepthBuffer::new(2, 2);
        depth.clear(1.0);
        depth.resize(3, 3);
        assert_eq!(depth.get(2, 2), 0.0);
        assert_eq!(depth.get(0, 0), 0.0);
    }
}
