use glam::IVec2;

use crate::surface::SurfaceTarget;

// Size (width and height) of raster tiles in pixels
pub const TILE_LOG2: i32 = 3;
pub const TILE_SIZE: i32 = 1 << TILE_LOG2;

// Bins are square groups of tiles, one level above tiles
pub const BIN_TILE_LOG2: i32 = 4;
pub const BIN_TILE_SIZE: i32 = 1 << BIN_TILE_LOG2;
pub const BIN_PIXEL_SIZE: i32 = TILE_SIZE * BIN_TILE_SIZE;

// Vertex positions snap to a 1/16 pixel grid so edge tests are exact integer
// comparisons at every sample position
pub const SUBPIXEL_LOG2: i32 = 4;
pub const SUBPIXEL_SCALE: i32 = 1 << SUBPIXEL_LOG2;
pub const SUBPIXEL_SCALE_F: f32 = SUBPIXEL_SCALE as f32;

// Keeps edge coefficients and their products comfortably inside i64
pub const MAX_SUBPIXEL_COORD: i64 = 1 << 22;

// A single setup record addresses at most this many bins per axis; larger
// triangles are split into subtriangle records over disjoint bin slices
pub const RECORD_BIN_SPAN: i32 = 8;

const SAMPLE_POS_1: [IVec2; 1] = [IVec2::new(8, 8)];
const SAMPLE_POS_2: [IVec2; 2] = [IVec2::new(4, 4), IVec2::new(12, 12)];
const SAMPLE_POS_4: [IVec2; 4] = [
    IVec2::new(6, 2),
    IVec2::new(14, 6),
    IVec2::new(2, 10),
    IVec2::new(10, 14),
];
const SAMPLE_POS_8: [IVec2; 8] = [
    IVec2::new(9, 5),
    IVec2::new(7, 11),
    IVec2::new(13, 9),
    IVec2::new(5, 3),
    IVec2::new(3, 13),
    IVec2::new(1, 7),
    IVec2::new(11, 15),
    IVec2::new(15, 1),
];

/// Sample positions within a pixel, in subpixel units.
pub fn sample_positions(samples_log2: i32) -> &'static [IVec2] {
    match samples_log2 {
        0 => &SAMPLE_POS_1,
        1 => &SAMPLE_POS_2,
        2 => &SAMPLE_POS_4,
        _ => &SAMPLE_POS_8,
    }
}

/// Which screen-space winding is treated as front-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Winding {
    #[default]
    Ccw,
    Cw,
}

/// Geometry constants derived from the bound render target. Recomputed
/// whenever the target surface or sample count changes.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub viewport: IVec2,
    pub size_pixels: IVec2,
    pub size_bins: IVec2,
    pub num_bins: i32,
    pub size_tiles: IVec2,
    pub num_tiles: i32,
    pub num_samples: i32,
    pub samples_log2: i32,
    pub bin_batch_size: usize,
    pub winding: Winding,
}

impl PipelineConfig {
    pub fn for_surface(surface: &SurfaceTarget, bin_batch_size: usize, winding: Winding) -> Self {
        let size_pixels = surface.rounded_size();
        let size_tiles = IVec2::new(size_pixels.x >> TILE_LOG2, size_pixels.y >> TILE_LOG2);
        let size_bins = IVec2::new(
            (size_tiles.x + BIN_TILE_SIZE - 1) >> BIN_TILE_LOG2,
            (size_tiles.y + BIN_TILE_SIZE - 1) >> BIN_TILE_LOG2,
        );
        Self {
            viewport: surface.size(),
            size_pixels,
            size_bins,
            num_bins: size_bins.x * size_bins.y,
            size_tiles,
            num_tiles: size_tiles.x * size_tiles.y,
            num_samples: surface.num_samples(),
            samples_log2: surface.samples_log2(),
            bin_batch_size,
            winding,
        }
    }

    #[inline]
    pub fn bin_index(&self, bin: IVec2) -> i32 {
        bin.y * self.size_bins.x + bin.x
    }

    #[inline]
    pub fn tile_index(&self, tile: IVec2) -> i32 {
        tile.y * self.size_tiles.x + tile.x
    }

    #[inline]
    pub fn tile_coords(&self, tile_index: i32) -> IVec2 {
        IVec2::new(tile_index % self.size_tiles.x, tile_index / self.size_tiles.x)
    }

    /// Inclusive-lo, exclusive-hi tile range covered by a bin, clamped to the
    /// tile grid (the last bin row/column may be partial).
    pub fn bin_tile_range(&self, bin: IVec2) -> (IVec2, IVec2) {
        let lo = bin << BIN_TILE_LOG2;
        let hi = ((bin + IVec2::ONE) << BIN_TILE_LOG2).min(self.size_tiles);
        (lo, hi)
    }

    /// Inclusive-lo, exclusive-hi pixel range covered by a tile.
    pub fn tile_pixel_range(&self, tile: IVec2) -> (IVec2, IVec2) {
        let lo = tile << TILE_LOG2;
        (lo, lo + IVec2::splat(TILE_SIZE))
    }
}
