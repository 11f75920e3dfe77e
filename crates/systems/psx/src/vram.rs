//! VRAM model shared by the CPU and the renderer.
//!
//! [`Vram`] is the CPU-visible shadow: 1024x512 16-bit words with exact
//! console semantics for fills, masked writes, copies and wrap-around. The
//! GPU holds a second, resolution-scaled copy; [`DirtyRect`] records where
//! the two may differ.

/// Width of VRAM in 16-bit words
pub const VRAM_WIDTH: u32 = 1024;
/// Height of VRAM in lines
pub const VRAM_HEIGHT: u32 = 512;
pub const VRAM_WIDTH_MASK: u32 = VRAM_WIDTH - 1;
pub const VRAM_HEIGHT_MASK: u32 = VRAM_HEIGHT - 1;
pub const VRAM_SIZE_BYTES: usize = (VRAM_WIDTH * VRAM_HEIGHT * 2) as usize;

/// Bit 15 of a VRAM word
pub const MASK_BIT: u16 = 0x8000;

/// Half-open rectangle `[left, right) x [top, bottom)` in native pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub const FULL_VRAM: Rect = Rect::new(0, 0, VRAM_WIDTH, VRAM_HEIGHT);

    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self { left, top, right, bottom }
    }

    pub const fn from_extents(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// True when the rectangles share at least one pixel
    #[inline]
    pub fn intersects(&self, other: &Rect) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.top < other.bottom
            && other.top < self.bottom
    }

    /// Smallest rectangle covering both. Empty rectangles are ignored.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rect::new(
            self.left.min(other.left),
            self.top.min(other.top),
            self.right.max(other.right),
            self.bottom.max(other.bottom),
        )
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        Rect::new(
            left,
            top,
            self.right.min(other.right).max(left),
            self.bottom.min(other.bottom).max(top),
        )
    }

    /// Multiply every edge by `scale`
    pub fn scaled(&self, scale: u32) -> Rect {
        Rect::new(
            self.left * scale,
            self.top * scale,
            self.right * scale,
            self.bottom * scale,
        )
    }

    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }
}

/// Conservative bounds of a transfer for dirty tracking: the origin wraps,
/// and an extent that crosses an edge widens to the whole axis.
pub fn transfer_bounds(x: u32, y: u32, width: u32, height: u32) -> Rect {
    let mut rect = Rect::from_extents(x % VRAM_WIDTH, y % VRAM_HEIGHT, width, height);
    if rect.right > VRAM_WIDTH {
        rect.left = 0;
        rect.right = VRAM_WIDTH;
    }
    if rect.bottom > VRAM_HEIGHT {
        rect.top = 0;
        rect.bottom = VRAM_HEIGHT;
    }
    rect
}

/// Does the transfer cross the right or bottom edge of VRAM?
pub fn is_oversized(x: u32, y: u32, width: u32, height: u32) -> bool {
    (x % VRAM_WIDTH) + width > VRAM_WIDTH || (y % VRAM_HEIGHT) + height > VRAM_HEIGHT
}

/// One non-wrapping part of a transfer. `src_x`/`src_y` locate the piece
/// inside the caller's source data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPiece {
    pub rect: Rect,
    pub src_x: u32,
    pub src_y: u32,
}

/// Split a transfer that wraps around VRAM into at most four rectangles
/// that don't. Extents are clamped to the VRAM size.
pub fn split_wrapped(x: u32, y: u32, width: u32, height: u32) -> Vec<TransferPiece> {
    fn spans(start: u32, len: u32, size: u32) -> [(u32, u32, u32); 2] {
        let start = start % size;
        let len = len.min(size);
        let first = len.min(size - start);
        // (destination start, length, offset into source)
        [(start, first, 0), (0, len - first, first)]
    }

    let mut pieces = Vec::with_capacity(4);
    for (dy, h, sy) in spans(y, height, VRAM_HEIGHT) {
        for (dx, w, sx) in spans(x, width, VRAM_WIDTH) {
            if w > 0 && h > 0 {
                pieces.push(TransferPiece {
                    rect: Rect::from_extents(dx, dy, w, h),
                    src_x: sx,
                    src_y: sy,
                });
            }
        }
    }
    pieces
}

/// Single bounding box over regions that may differ between two copies of
/// VRAM. Never smaller than the true difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyRect(Option<Rect>);

impl DirtyRect {
    pub fn include(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        self.0 = Some(match self.0 {
            Some(current) => current.union(&rect),
            None => rect,
        });
    }

    pub fn intersects(&self, rect: &Rect) -> bool {
        self.0.map_or(false, |r| r.intersects(rect))
    }

    pub fn get(&self) -> Option<Rect> {
        self.0
    }

    pub fn is_clean(&self) -> bool {
        self.0.is_none()
    }

    pub fn set_full(&mut self) {
        self.0 = Some(Rect::FULL_VRAM);
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}

/// CPU copy of VRAM
#[derive(Clone)]
pub struct Vram {
    words: Box<[u16]>,
}

impl Default for Vram {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Vram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vram")
            .field("width", &VRAM_WIDTH)
            .field("height", &VRAM_HEIGHT)
            .finish()
    }
}

impl Vram {
    pub fn new() -> Self {
        Self {
            words: vec![0; (VRAM_WIDTH * VRAM_HEIGHT) as usize].into_boxed_slice(),
        }
    }

    #[inline]
    fn index(x: u32, y: u32) -> usize {
        ((y & VRAM_HEIGHT_MASK) * VRAM_WIDTH + (x & VRAM_WIDTH_MASK)) as usize
    }

    /// Coordinates wrap
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u16 {
        self.words[Self::index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: u16) {
        self.words[Self::index(x, y)] = value;
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [u16] {
        &mut self.words
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Fill a rectangle, wrapping at the edges. Mask settings don't apply to
    /// fills. With `skip_field` set, rows whose low bit equals it are left
    /// alone (interlaced rendering keeps the displayed field).
    pub fn fill(&mut self, x: u32, y: u32, width: u32, height: u32, color: u16, skip_field: Option<u32>) {
        for row in 0..height {
            let vy = (y + row) & VRAM_HEIGHT_MASK;
            if skip_field.map_or(false, |field| (vy & 1) == field) {
                continue;
            }
            for col in 0..width {
                self.set(x + col, vy, color);
            }
        }
    }

    /// Store `data` (row-major, `width` words per row). Destination pixels
    /// with the mask bit set are skipped when `check_mask` is on; the mask
    /// bit is forced on written pixels when `set_mask` is on.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        data: &[u16],
        set_mask: bool,
        check_mask: bool,
    ) {
        let mask_or = if set_mask { MASK_BIT } else { 0 };
        for row in 0..height {
            let src = &data[(row * width) as usize..((row + 1) * width) as usize];
            for (col, &value) in src.iter().enumerate() {
                let (vx, vy) = (x + col as u32, y + row);
                if check_mask && self.get(vx, vy) & MASK_BIT != 0 {
                    continue;
                }
                self.set(vx, vy, value | mask_or);
            }
        }
    }

    /// VRAM to VRAM copy. The whole source is read before anything is
    /// written, so overlapping copies produce the pre-copy source image.
    #[allow(clippy::too_many_arguments)]
    pub fn copy(
        &mut self,
        src_x: u32,
        src_y: u32,
        dst_x: u32,
        dst_y: u32,
        width: u32,
        height: u32,
        set_mask: bool,
        check_mask: bool,
    ) {
        let source = self.read(src_x, src_y, width, height);
        self.write(dst_x, dst_y, width, height, &source, set_mask, check_mask);
    }

    /// Read a rectangle, wrapping at the edges
    pub fn read(&self, x: u32, y: u32, width: u32, height: u32) -> Vec<u16> {
        let mut out = Vec::with_capacity((width * height) as usize);
        for row in 0..height {
            for col in 0..width {
                out.push(self.get(x + col, y + row));
            }
        }
        out
    }

    /// Replace a non-wrapping rectangle with `data` verbatim. Used when the
    /// GPU copy is read back.
    pub fn store_rect(&mut self, rect: &Rect, data: &[u16]) {
        let width = rect.width() as usize;
        for (row, y) in (rect.top..rect.bottom).enumerate() {
            let start = (y * VRAM_WIDTH + rect.left) as usize;
            self.words[start..start + width].copy_from_slice(&data[row * width..(row + 1) * width]);
        }
    }

    /// Little-endian byte image of all of VRAM
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersects_is_strict() {
        let a = Rect::new(0, 0, 10, 10);
        assert!(a.intersects(&Rect::new(9, 9, 12, 12)));
        assert!(!a.intersects(&Rect::new(10, 0, 20, 10)));
        assert!(!a.intersects(&Rect::new(0, 10, 10, 20)));
    }

    #[test]
    fn test_rect_union_ignores_empty() {
        let a = Rect::new(4, 4, 8, 8);
        assert_eq!(a.union(&Rect::default()), a);
        assert_eq!(Rect::default().union(&a), a);
        assert_eq!(a.union(&Rect::new(0, 6, 5, 20)), Rect::new(0, 4, 8, 20));
    }

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0, 0, 10, 10);
        assert_eq!(a.intersection(&Rect::new(5, 5, 20, 20)), Rect::new(5, 5, 10, 10));
        assert!(a.intersection(&Rect::new(20, 20, 30, 30)).is_empty());
    }

    #[test]
    fn test_transfer_bounds() {
        assert_eq!(transfer_bounds(10, 20, 30, 40), Rect::new(10, 20, 40, 60));
        // Origin wraps
        assert_eq!(transfer_bounds(1034, 532, 4, 4), Rect::new(10, 20, 14, 24));
        // Crossing the right edge widens to the full width
        assert_eq!(transfer_bounds(1020, 0, 8, 2), Rect::new(0, 0, 1024, 2));
        assert_eq!(transfer_bounds(0, 510, 2, 4), Rect::new(0, 0, 2, 512));
    }

    #[test]
    fn test_split_wrapped_without_wrap() {
        let pieces = split_wrapped(100, 50, 16, 8);
        assert_eq!(
            pieces,
            vec![TransferPiece { rect: Rect::new(100, 50, 116, 58), src_x: 0, src_y: 0 }]
        );
    }

    #[test]
    fn test_split_wrapped_corner() {
        let pieces = split_wrapped(1020, 508, 8, 6);
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces[0], TransferPiece { rect: Rect::new(1020, 508, 1024, 512), src_x: 0, src_y: 0 });
        assert_eq!(pieces[1], TransferPiece { rect: Rect::new(0, 508, 4, 512), src_x: 4, src_y: 0 });
        assert_eq!(pieces[2], TransferPiece { rect: Rect::new(1020, 0, 1024, 2), src_x: 0, src_y: 4 });
        assert_eq!(pieces[3], TransferPiece { rect: Rect::new(0, 0, 4, 2), src_x: 4, src_y: 4 });
        let area: u32 = pieces.iter().map(|p| p.rect.width() * p.rect.height()).sum();
        assert_eq!(area, 48);
        assert!(is_oversized(1020, 508, 8, 6));
        assert!(!is_oversized(1016, 506, 8, 6));
    }

    #[test]
    fn test_dirty_rect_accumulates() {
        let mut dirty = DirtyRect::default();
        assert!(dirty.is_clean());
        dirty.include(Rect::new(0, 0, 4, 4));
        dirty.include(Rect::new(10, 10, 12, 12));
        assert_eq!(dirty.get(), Some(Rect::new(0, 0, 12, 12)));
        assert!(dirty.intersects(&Rect::new(5, 5, 6, 6)));
        dirty.clear();
        assert!(!dirty.intersects(&Rect::FULL_VRAM));
    }

    #[test]
    fn test_fill_wraps_and_ignores_mask() {
        let mut vram = Vram::new();
        vram.set(0, 0, MASK_BIT);
        vram.fill(1022, 511, 4, 2, 0x1234, None);
        assert_eq!(vram.get(1023, 511), 0x1234);
        assert_eq!(vram.get(0, 0), 0x1234);
        assert_eq!(vram.get(1, 0), 0x1234);
        assert_eq!(vram.get(2, 0), 0);
    }

    #[test]
    fn test_fill_skips_displayed_field() {
        let mut vram = Vram::new();
        vram.fill(0, 0, 2, 4, 0x7FFF, Some(1));
        assert_eq!(vram.get(0, 0), 0x7FFF);
        assert_eq!(vram.get(0, 1), 0);
        assert_eq!(vram.get(0, 2), 0x7FFF);
        assert_eq!(vram.get(0, 3), 0);
    }

    #[test]
    fn test_write_mask_semantics() {
        let mut vram = Vram::new();
        vram.write(0, 0, 2, 1, &[0x0001, 0x0002], true, false);
        assert_eq!(vram.read(0, 0, 2, 1), vec![0x8001, 0x8002]);

        vram.write(0, 0, 3, 1, &[0x0100, 0x0200, 0x0300], false, true);
        assert_eq!(vram.read(0, 0, 3, 1), vec![0x8001, 0x8002, 0x0300]);
    }

    #[test]
    fn test_copy_overlapping_uses_source_snapshot() {
        let mut vram = Vram::new();
        let data: Vec<u16> = (1..=16).collect();
        vram.write(0, 0, 4, 4, &data, false, false);

        vram.copy(0, 0, 1, 1, 4, 4, false, false);

        assert_eq!(vram.read(1, 1, 4, 4), data);
        assert_eq!(vram.get(0, 0), 1);
    }

    #[test]
    fn test_copy_wraps_against_modular_reference() {
        let mut vram = Vram::new();
        for y in 0..VRAM_HEIGHT {
            for x in 0..VRAM_WIDTH {
                vram.set(x, y, ((x * 7 + y * 13) & 0x7FFF) as u16);
            }
        }
        let reference = vram.clone();

        vram.copy(1000, 500, 1010, 505, 40, 20, false, false);

        for row in 0..20 {
            for col in 0..40 {
                let expected = reference.get((1000 + col) % 1024, (500 + row) % 512);
                assert_eq!(vram.get((1010 + col) % 1024, (505 + row) % 512), expected);
            }
        }
    }

    #[test]
    fn test_store_rect_and_bytes() {
        let mut vram = Vram::new();
        vram.store_rect(&Rect::new(2, 3, 4, 4), &[0xABCD, 0x1234]);
        assert_eq!(vram.get(2, 3), 0xABCD);
        assert_eq!(vram.get(3, 3), 0x1234);
        let bytes = vram.to_bytes();
        assert_eq!(bytes.len(), VRAM_SIZE_BYTES);
        let offset = ((3 * VRAM_WIDTH + 2) * 2) as usize;
        assert_eq!(&bytes[offset..offset + 2], &[0xCD, 0xAB]);
    }
}
