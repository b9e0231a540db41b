use glam::IVec2;
use rayon::prelude::*;

use crate::buffers::{ActiveTileList, SegmentArena, TriangleBuffer};
use crate::config::{PipelineConfig, TILE_LOG2};
use crate::context::AcceleratorContext;
use crate::error::RasterResult;

/// Third pipeline stage: narrow each bin's triangle list down to the tiles
/// inside the bin, and record which tiles became active.
///
/// Bins are processed independently, one worker per bin. Each tile belongs
/// to exactly one bin, so per-tile appends are single-owner: sorting the
/// bin's gathered references by subtriangle index restores submission order
/// and the tile chains inherit it.
pub trait CoarseStage: Send + Sync {
    fn run(
        &self,
        ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        bins: &SegmentArena,
        tiles: &mut SegmentArena,
        active: &mut ActiveTileList,
    ) -> RasterResult<()>;
}

pub struct ParallelCoarse;
pub struct ReferenceCoarse;

fn coarse_bin(
    tris: &TriangleBuffer,
    cfg: &PipelineConfig,
    bins: &SegmentArena,
    tiles: &SegmentArena,
    active: &ActiveTileList,
    bin: usize,
) -> RasterResult<()> {
    let mut refs: Vec<u32> = bins.lane_refs(bin).collect();
    if refs.is_empty() {
        return Ok(());
    }
    refs.sort_unstable();

    let bin_coords = IVec2::new(bin as i32 % cfg.size_bins.x, bin as i32 / cfg.size_bins.x);
    let (bin_tile_lo, bin_tile_hi) = cfg.bin_tile_range(bin_coords);

    for &subtri in &refs {
        let rec = &tris.records[subtri as usize];
        let tile_lo = (rec.pixel_lo >> TILE_LOG2).max(bin_tile_lo);
        let tile_hi = ((rec.pixel_hi - IVec2::ONE) >> TILE_LOG2).min(bin_tile_hi - IVec2::ONE);
        for ty in tile_lo.y..=tile_hi.y {
            for tx in tile_lo.x..=tile_hi.x {
                let tile = (ty * cfg.size_tiles.x + tx) as usize;
                if tiles.lane_total(tile) == 0 {
                    // First reference activates the tile, exactly once
                    active.push(tile as i32);
                }
                tiles.append(tile, subtri)?;
            }
        }
    }
    Ok(())
}

impl CoarseStage for ParallelCoarse {
    fn run(
        &self,
        ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        bins: &SegmentArena,
        tiles: &mut SegmentArena,
        active: &mut ActiveTileList,
    ) -> RasterResult<()> {
        tiles.reset(cfg.num_tiles as usize);
        active.reset(cfg.num_tiles as usize);
        let tiles_shared = &*tiles;
        let active_shared = &*active;
        ctx.install(|| {
            (0..cfg.num_bins as usize)
                .into_par_iter()
                .try_for_each(|bin| coarse_bin(tris, cfg, bins, tiles_shared, active_shared, bin))
        })
    }
}

impl CoarseStage for ReferenceCoarse {
    fn run(
        &self,
        _ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        bins: &SegmentArena,
        tiles: &mut SegmentArena,
        active: &mut ActiveTileList,
    ) -> RasterResult<()> {
        tiles.reset(cfg.num_tiles as usize);
        active.reset(cfg.num_tiles as usize);
        for bin in 0..cfg.num_bins as usize {
            coarse_bin(tris, cfg, bins, tiles, active, bin)?;
        }
        Ok(())
    }
}
