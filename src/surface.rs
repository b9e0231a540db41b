use glam::{IVec2, Vec4};
use std::marker::PhantomData;

use crate::config::{TILE_LOG2, TILE_SIZE};
use crate::error::{RasterError, RasterResult};

/// Pixel format of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// 8-bit red, green, blue, alpha packed into a u32.
    Rgba8,
    /// 32-bit depth (f32 bit pattern).
    Depth32,
}

pub fn rgba8_pack_vec4(color: Vec4) -> u32 {
    let c = color.clamp(Vec4::ZERO, Vec4::ONE);
    (((c.x * 255.0) as u32) << 24)
        | (((c.y * 255.0) as u32) << 16)
        | (((c.z * 255.0) as u32) << 8)
        | ((c.w * 255.0) as u32)
}

pub fn rgba8_unpack_vec4(rgba8: u32) -> Vec4 {
    let r = ((rgba8 >> 24) & 0xFF) as f32 / 255.0;
    let g = ((rgba8 >> 16) & 0xFF) as f32 / 255.0;
    let b = ((rgba8 >> 8) & 0xFF) as f32 / 255.0;
    let a = (rgba8 & 0xFF) as f32 / 255.0;
    Vec4::new(r, g, b, a)
}

/// Tile-aligned color or depth render target.
///
/// Storage is tile-major: the 64 samples of an 8x8 tile are contiguous, and
/// tiles are replicated once per sample for multisample targets. FineRaster
/// addresses a tile's region directly; `pixel`/`set_pixel` do the layout
/// conversion for callers that think in screen coordinates.
pub struct SurfaceTarget {
    size: IVec2,
    rounded_size: IVec2,
    size_tiles: IVec2,
    format: Format,
    num_samples: i32,
    samples_log2: i32,
    data: Vec<u32>,
}

impl SurfaceTarget {
    pub fn new(size: IVec2, format: Format, num_samples: i32) -> RasterResult<Self> {
        if size.x <= 0 || size.y <= 0 {
            return Err(RasterError::InvalidSurfaceSize(size.x, size.y));
        }
        if !matches!(num_samples, 1 | 2 | 4 | 8) {
            return Err(RasterError::UnsupportedSampleCount(num_samples));
        }
        let rounded_size = IVec2::new(
            (size.x + TILE_SIZE - 1) & !(TILE_SIZE - 1),
            (size.y + TILE_SIZE - 1) & !(TILE_SIZE - 1),
        );
        let size_tiles = rounded_size >> TILE_LOG2;
        let samples_log2 = num_samples.trailing_zeros() as i32;
        let num_words =
            (size_tiles.x * size_tiles.y * num_samples) as usize * (TILE_SIZE * TILE_SIZE) as usize;
        let clear = match format {
            Format::Rgba8 => 0,
            Format::Depth32 => 1.0f32.to_bits(),
        };
        Ok(Self {
            size,
            rounded_size,
            size_tiles,
            format,
            num_samples,
            samples_log2,
            data: vec![clear; num_words],
        })
    }

    /// Original size specified at creation.
    pub fn size(&self) -> IVec2 {
        self.size
    }

    /// Size rounded up to full 8x8 tiles.
    pub fn rounded_size(&self) -> IVec2 {
        self.rounded_size
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn num_samples(&self) -> i32 {
        self.num_samples
    }

    pub fn samples_log2(&self) -> i32 {
        self.samples_log2
    }

    pub fn fill(&mut self, value: u32) {
        self.data.fill(value);
    }

    /// Word offset of a tile's sample plane within the backing store.
    #[inline]
    pub(crate) fn tile_offset(&self, tile_index: i32, sample: i32) -> usize {
        (((tile_index << self.samples_log2) + sample) as usize) << (2 * TILE_LOG2)
    }

    #[inline]
    fn word_index(&self, x: i32, y: i32, sample: i32) -> usize {
        let tile = (y >> TILE_LOG2) * self.size_tiles.x + (x >> TILE_LOG2);
        let local = ((y & (TILE_SIZE - 1)) << TILE_LOG2) | (x & (TILE_SIZE - 1));
        self.tile_offset(tile, sample) + local as usize
    }

    pub fn pixel(&self, x: i32, y: i32, sample: i32) -> u32 {
        self.data[self.word_index(x, y, sample)]
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, sample: i32, value: u32) {
        let idx = self.word_index(x, y, sample);
        self.data[idx] = value;
    }

    pub fn depth_at(&self, x: i32, y: i32, sample: i32) -> f32 {
        f32::from_bits(self.pixel(x, y, sample))
    }

    /// Shared view for concurrent per-tile writes during FineRaster.
    pub(crate) fn shared(&mut self) -> SharedPixels<'_> {
        SharedPixels {
            ptr: self.data.as_mut_ptr(),
            len: self.data.len(),
            _marker: PhantomData,
        }
    }
}

/// Raw view over a surface's words, writable from multiple workers at once.
/// Tiles are spatially disjoint, so each word is touched by at most one
/// worker between barriers.
pub(crate) struct SharedPixels<'a> {
    ptr: *mut u32,
    len: usize,
    _marker: PhantomData<&'a mut [u32]>,
}

// Don't worry, we've got this, probably
unsafe impl Send for SharedPixels<'_> {}
unsafe impl Sync for SharedPixels<'_> {}

impl SharedPixels<'_> {
    /// Safety: callers must not hand the same index to two workers.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: u32) {
        debug_assert!(index < self.len);
        unsafe {
            *self.ptr.add(index) = value;
        }
    }

    /// Safety: no concurrent writer for the same index.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> u32 {
        debug_assert!(index < self.len);
        unsafe { *self.ptr.add(index) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_full_tiles() {
        let s = SurfaceTarget::new(IVec2::new(100, 60), Format::Rgba8, 1).unwrap();
        assert_eq!(s.size(), IVec2::new(100, 60));
        assert_eq!(s.rounded_size(), IVec2::new(104, 64));
    }

    #[test]
    fn rejects_bad_configs() {
        assert!(matches!(
            SurfaceTarget::new(IVec2::new(0, 64), Format::Rgba8, 1),
            Err(RasterError::InvalidSurfaceSize(0, 64))
        ));
        assert!(matches!(
            SurfaceTarget::new(IVec2::new(64, 64), Format::Rgba8, 3),
            Err(RasterError::UnsupportedSampleCount(3))
        ));
        assert!(matches!(
            SurfaceTarget::new(IVec2::new(64, 64), Format::Rgba8, 16),
            Err(RasterError::UnsupportedSampleCount(16))
        ));
    }

    #[test]
    fn pixel_addressing_roundtrip() {
        let mut s = SurfaceTarget::new(IVec2::new(32, 32), Format::Rgba8, 4).unwrap();
        s.set_pixel(13, 22, 2, 0xDEADBEEF);
        assert_eq!(s.pixel(13, 22, 2), 0xDEADBEEF);
        assert_eq!(s.pixel(13, 22, 1), 0);
        assert_eq!(s.pixel(12, 22, 2), 0);
    }

    #[test]
    fn depth_surface_clears_to_one() {
        let s = SurfaceTarget::new(IVec2::new(16, 16), Format::Depth32, 1).unwrap();
        assert_eq!(s.depth_at(5, 5, 0), 1.0);
    }

    #[test]
    fn rgba8_pack_unpack() {
        let c = Vec4::new(1.0, 0.5, 0.0, 1.0);
        let packed = rgba8_pack_vec4(c);
        let back = rgba8_unpack_vec4(packed);
        assert!((back - c).abs().max_element() < 2.0 / 255.0);
    }
}
