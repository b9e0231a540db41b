use rayon::prelude::*;

use crate::buffers::{SegmentArena, TriangleBuffer};
use crate::config::PipelineConfig;
use crate::context::AcceleratorContext;
use crate::error::RasterResult;

/// Second pipeline stage: scatter subtriangle references into the coarse
/// bins their bounding boxes intersect.
///
/// Appends race across batches, so a bin's segment chain is not in
/// submission order here; every reference carries the subtriangle index as
/// its sequence number and CoarseRaster restores the order per bin.
pub trait BinStage: Send + Sync {
    fn run(
        &self,
        ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        bins: &mut SegmentArena,
    ) -> RasterResult<()>;
}

pub struct ParallelBin;
pub struct ReferenceBin;

fn bin_record(
    tris: &TriangleBuffer,
    cfg: &PipelineConfig,
    bins: &SegmentArena,
    subtri: usize,
) -> RasterResult<()> {
    let rec = &tris.records[subtri];
    for by in rec.bin_lo.y..=rec.bin_hi.y {
        for bx in rec.bin_lo.x..=rec.bin_hi.x {
            let bin = (by * cfg.size_bins.x + bx) as usize;
            bins.append(bin, subtri as u32)?;
        }
    }
    Ok(())
}

impl BinStage for ParallelBin {
    fn run(
        &self,
        ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        bins: &mut SegmentArena,
    ) -> RasterResult<()> {
        bins.reset(cfg.num_bins as usize);
        let shared = &*bins;
        ctx.install(|| {
            (0..tris.len())
                .into_par_iter()
                .with_min_len(cfg.bin_batch_size.max(1))
                .try_for_each(|subtri| bin_record(tris, cfg, shared, subtri))
        })
    }
}

impl BinStage for ReferenceBin {
    fn run(
        &self,
        _ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        bins: &mut SegmentArena,
    ) -> RasterResult<()> {
        bins.reset(cfg.num_bins as usize);
        for subtri in 0..tris.len() {
            bin_record(tris, cfg, bins, subtri)?;
        }
        Ok(())
    }
}
