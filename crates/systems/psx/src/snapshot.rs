//! VRAM save-state stream.
//!
//! Layout, all little-endian:
//!
//! ```text
//! 0   magic "VRAMSNAP"
//! 8   version (u32)
//! 12  width, height (u32, u32)     native VRAM size
//! 20  samples, scale (u32, u32)    renderer state at capture, informational
//! 28  width * height u16 words
//! ```
//!
//! The words are the native 5:5:5:1 image, so a snapshot restores exactly
//! whatever resolution scale or sample count is active when it is loaded.

use crate::vram::{VRAM_HEIGHT, VRAM_WIDTH};
use crate::GpuError;

pub const SNAPSHOT_MAGIC: [u8; 8] = *b"VRAMSNAP";
pub const SNAPSHOT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VramSnapshot {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub resolution_scale: u32,
    pub words: Vec<u16>,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

impl VramSnapshot {
    /// Check the header against what this renderer can restore
    pub fn validate(&self) -> Result<(), GpuError> {
        if self.width != VRAM_WIDTH || self.height != VRAM_HEIGHT {
            return Err(GpuError::InvalidState(format!(
                "{}x{} image, expected {}x{}",
                self.width, self.height, VRAM_WIDTH, VRAM_HEIGHT
            )));
        }
        let expected = (self.width * self.height) as usize;
        if self.words.len() != expected {
            return Err(GpuError::InvalidState(format!(
                "{} words for a {}x{} image",
                self.words.len(),
                self.width,
                self.height
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.words.len() * 2);
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        for value in [SNAPSHOT_VERSION, self.width, self.height, self.samples, self.resolution_scale] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for word in &self.words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GpuError> {
        if bytes.len() < HEADER_SIZE {
            return Err(GpuError::InvalidState(format!("{} bytes is too short for a header", bytes.len())));
        }
        if bytes[..8] != SNAPSHOT_MAGIC {
            return Err(GpuError::InvalidState("bad magic".to_string()));
        }
        let version = read_u32(bytes, 8);
        if version != SNAPSHOT_VERSION {
            return Err(GpuError::InvalidState(format!(
                "version {} (supported: {})",
                version, SNAPSHOT_VERSION
            )));
        }
        let width = read_u32(bytes, 12);
        let height = read_u32(bytes, 16);
        let samples = read_u32(bytes, 20);
        let resolution_scale = read_u32(bytes, 24);

        let count = width as usize * height as usize;
        let body = &bytes[HEADER_SIZE..];
        if body.len() != count * 2 {
            return Err(GpuError::InvalidState(format!(
                "{} payload bytes for a {}x{} image",
                body.len(),
                width,
                height
            )));
        }
        let words = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let snapshot = Self { width, height, samples, resolution_scale, words };
        snapshot.validate()?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> VramSnapshot {
        let words = (0..VRAM_WIDTH * VRAM_HEIGHT).map(|i| (i * 7) as u16).collect();
        VramSnapshot { width: VRAM_WIDTH, height: VRAM_HEIGHT, samples: 4, resolution_scale: 2, words }
    }

    #[test]
    fn test_header_layout() {
        let bytes = snapshot().to_bytes();
        assert_eq!(&bytes[..8], b"VRAMSNAP");
        assert_eq!(read_u32(&bytes, 8), SNAPSHOT_VERSION);
        assert_eq!(read_u32(&bytes, 12), 1024);
        assert_eq!(read_u32(&bytes, 16), 512);
        assert_eq!(read_u32(&bytes, 20), 4);
        assert_eq!(read_u32(&bytes, 24), 2);
        assert_eq!(bytes.len(), HEADER_SIZE + 1024 * 512 * 2);
        // Second word is 7, little-endian
        assert_eq!(&bytes[30..32], &[7, 0]);
        assert_eq!(VramSnapshot::from_bytes(&bytes).expect("parse"), snapshot());
    }

    #[test]
    fn test_rejects_malformed_streams() {
        let bytes = snapshot().to_bytes();
        assert!(matches!(VramSnapshot::from_bytes(&bytes[..10]), Err(GpuError::InvalidState(_))));
        assert!(VramSnapshot::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(VramSnapshot::from_bytes(&bad_magic).is_err());

        let mut bad_version = bytes.clone();
        bad_version[8] = 99;
        let err = VramSnapshot::from_bytes(&bad_version).unwrap_err();
        assert!(err.to_string().contains("version 99"), "{}", err);

        let small = VramSnapshot { width: 2, height: 2, samples: 1, resolution_scale: 1, words: vec![0; 4] };
        assert!(VramSnapshot::from_bytes(&small.to_bytes()).is_err());
    }
}
