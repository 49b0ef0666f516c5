//! Frame buffers handed to the switcher's stills pool.
//!
//! A [`FrameBuffer`] is the writable block the device allocates for us;
//! once populated it is frozen into a [`Frame`], a cheaply cloneable,
//! read-only view that is reused for every upload attempt.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::StillsError;

/// Width of a full HD still.
pub const HD_WIDTH: u32 = 1920;
/// Height of a full HD still.
pub const HD_HEIGHT: u32 = 1080;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layouts accepted by the stills pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 10-bit YUV with alpha, packed into 4 bytes per pixel.
    #[default]
    Yuva10,
    /// 4 bytes per pixel: Alpha, Red, Green, Blue.
    Argb8,
    /// 4:2:2 8-bit YUV, 2 bytes per pixel.
    Yuv8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Yuva10 | PixelFormat::Argb8 => 4,
            PixelFormat::Yuv8 => 2,
        }
    }

    /// Byte length of a tightly packed `width × height` image.
    pub const fn frame_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

// ── FrameBuffer ──────────────────────────────────────────────────

/// Writable pixel storage allocated for one still.
#[derive(Debug)]
pub struct FrameBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: BytesMut,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer of exactly `width × height × bpp` bytes.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format,
            data: BytesMut::zeroed(format.frame_len(width, height)),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Raw write target for pixel data.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy a complete image into the buffer.
    ///
    /// The source must cover the buffer exactly; partial writes are
    /// rejected rather than leaving stale pixels behind.
    pub fn write(&mut self, src: &[u8]) -> Result<(), StillsError> {
        if src.len() != self.data.len() {
            return Err(StillsError::InvalidFrameLength {
                expected: self.data.len(),
                actual: src.len(),
            });
        }
        self.data.copy_from_slice(src);
        Ok(())
    }

    /// Fill the buffer with noise derived from `seed`.
    ///
    /// Uses the BLAKE3 extendable output, so the same seed always
    /// produces the same image.
    pub fn fill_seeded(&mut self, seed: u64) {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"stills-core frame fill");
        hasher.update(&seed.to_le_bytes());
        hasher.finalize_xof().fill(&mut self.data);
    }

    /// Finish writing and share the pixels read-only.
    pub fn freeze(self) -> Frame {
        Frame {
            width: self.width,
            height: self.height,
            format: self.format,
            data: self.data.freeze(),
        }
    }
}

// ── Frame ────────────────────────────────────────────────────────

/// Read-only still image, shared between the uploader and the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Content hash, used to confirm what the device stored.
    pub fn fingerprint(&self) -> blake3::Hash {
        blake3::hash(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hd_yuva_is_four_bytes_per_pixel() {
        let buf = FrameBuffer::new(PixelFormat::Yuva10, HD_WIDTH, HD_HEIGHT);
        assert_eq!(buf.byte_len(), 1920 * 1080 * 4);
    }

    #[test]
    fn seeded_fill_is_deterministic() {
        let mut a = FrameBuffer::new(PixelFormat::Yuva10, 64, 32);
        let mut b = FrameBuffer::new(PixelFormat::Yuva10, 64, 32);
        a.fill_seeded(7);
        b.fill_seeded(7);
        assert_eq!(a.freeze(), b.freeze());
    }

    #[test]
    fn different_seeds_differ() {
        let mut a = FrameBuffer::new(PixelFormat::Argb8, 16, 16);
        let mut b = FrameBuffer::new(PixelFormat::Argb8, 16, 16);
        a.fill_seeded(1);
        b.fill_seeded(2);
        assert_ne!(a.freeze().fingerprint(), b.freeze().fingerprint());
    }

    #[test]
    fn write_rejects_short_source() {
        let mut buf = FrameBuffer::new(PixelFormat::Yuv8, 4, 4);
        let err = buf.write(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            StillsError::InvalidFrameLength {
                expected: 32,
                actual: 10
            }
        ));
    }

    #[test]
    fn write_then_freeze_keeps_bytes() {
        let mut buf = FrameBuffer::new(PixelFormat::Argb8, 2, 1);
        buf.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let frame = buf.freeze();
        assert_eq!(frame.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.format(), PixelFormat::Argb8);
    }
}
