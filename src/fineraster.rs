use glam::{IVec2, Vec3};
use rayon::prelude::*;

use crate::buffers::{ActiveTileList, SegmentArena, TriangleBuffer};
use crate::config::{PipelineConfig, SUBPIXEL_LOG2, TILE_LOG2, TILE_SIZE, sample_positions};
use crate::context::AcceleratorContext;
use crate::error::RasterResult;
use crate::pixelpipe::{Fragment, PixelPipe};
use crate::surface::{SharedPixels, SurfaceTarget, rgba8_pack_vec4, rgba8_unpack_vec4};

/// Clear values applied to a tile right before its first triangle when a
/// deferred clear is pending.
#[derive(Debug, Clone, Copy)]
pub struct ClearValues {
    pub color: u32,
    pub depth: f32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: 0,
            depth: 1.0,
        }
    }
}

/// Final pipeline stage: per-sample coverage, depth and blending for every
/// active tile. With a deferred clear pending it visits all tiles so that
/// empty ones still get cleared.
pub trait FineStage: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        tiles: &SegmentArena,
        active: &ActiveTileList,
        pipe: &dyn PixelPipe,
        clear: Option<ClearValues>,
        color: &mut SurfaceTarget,
        depth: Option<&mut SurfaceTarget>,
    ) -> RasterResult<()>;
}

pub struct ParallelFine;
pub struct ReferenceFine;

struct TileCtx<'a> {
    tris: &'a TriangleBuffer,
    cfg: &'a PipelineConfig,
    tiles: &'a SegmentArena,
    pipe: &'a dyn PixelPipe,
    clear: Option<ClearValues>,
    color: SharedPixels<'a>,
    depth: Option<SharedPixels<'a>>,
}

const TILE_WORDS: usize = (TILE_SIZE * TILE_SIZE) as usize;

fn raster_tile(ctx: &TileCtx<'_>, tile: usize) {
    let cfg = ctx.cfg;
    let num_samples = cfg.num_samples;
    let positions = sample_positions(cfg.samples_log2);
    let depth_enabled = ctx.depth.is_some() && ctx.pipe.depth_test();

    if let Some(clear) = ctx.clear {
        let depth_bits = clear.depth.to_bits();
        for sample in 0..num_samples {
            let base = ((tile as i32) << cfg.samples_log2) as usize + sample as usize;
            let base = base * TILE_WORDS;
            for local in 0..TILE_WORDS {
                // Tile regions are disjoint between workers
                unsafe {
                    ctx.color.write(base + local, clear.color);
                    if let Some(depth) = &ctx.depth {
                        depth.write(base + local, depth_bits);
                    }
                }
            }
        }
    }

    let tile_coords = cfg.tile_coords(tile as i32);
    let origin = tile_coords << TILE_LOG2;

    for subtri in ctx.tiles.lane_refs(tile) {
        let rec = &ctx.tris.records[subtri as usize];

        let lo = rec.pixel_lo.max(origin);
        let hi = rec.pixel_hi.min(origin + IVec2::splat(TILE_SIZE));
        for py in lo.y..hi.y {
            for px in lo.x..hi.x {
                let pixel_sub = IVec2::new(px, py) << SUBPIXEL_LOG2;
                for (sample, &offset) in positions.iter().enumerate() {
                    let p = pixel_sub + offset;
                    // All three edge functions non-negative means covered;
                    // the fill-rule bias is baked into the c terms
                    let e01 = rec.edges[0].eval(p);
                    if e01 < 0 {
                        continue;
                    }
                    let e12 = rec.edges[1].eval(p);
                    if e12 < 0 {
                        continue;
                    }
                    let e20 = rec.edges[2].eval(p);
                    if e20 < 0 {
                        continue;
                    }

                    // Barycentrics over canonical vertices: each weight is
                    // the edge function opposite that vertex
                    let b0 = e12 as f32 * rec.inv_area2;
                    let b1 = e20 as f32 * rec.inv_area2;
                    let b2 = 1.0 - b0 - b1;

                    let local =
                        (((py - origin.y) << TILE_LOG2) | (px - origin.x)) as usize;
                    let word = (((tile as i32) << cfg.samples_log2) as usize
                        + sample)
                        * TILE_WORDS
                        + local;

                    let z = b0 * rec.z[0] + b1 * rec.z[1] + b2 * rec.z[2];
                    if depth_enabled {
                        if let Some(depth) = &ctx.depth {
                            let stored = f32::from_bits(unsafe { depth.read(word) });
                            if z > stored {
                                continue;
                            }
                        }
                    }

                    let frag = Fragment {
                        record: rec,
                        bary: Vec3::new(b0, b1, b2),
                        pixel: IVec2::new(px, py),
                        sample: sample as i32,
                    };
                    let src = ctx.pipe.shade(&frag);
                    let dst = rgba8_unpack_vec4(unsafe { ctx.color.read(word) });
                    let out = ctx.pipe.blend().apply(src, dst);
                    unsafe {
                        ctx.color.write(word, rgba8_pack_vec4(out));
                        if depth_enabled {
                            if let Some(depth) = &ctx.depth {
                                depth.write(word, z.to_bits());
                            }
                        }
                    }
                }
            }
        }
    }
}

fn tile_worklist(cfg: &PipelineConfig, active: &ActiveTileList, clear: bool) -> Vec<i32> {
    if clear {
        // Deferred clear touches every tile, active or not
        (0..cfg.num_tiles).collect()
    } else {
        active.snapshot()
    }
}

impl FineStage for ParallelFine {
    fn run(
        &self,
        ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        tiles: &SegmentArena,
        active: &ActiveTileList,
        pipe: &dyn PixelPipe,
        clear: Option<ClearValues>,
        color: &mut SurfaceTarget,
        depth: Option<&mut SurfaceTarget>,
    ) -> RasterResult<()> {
        let worklist = tile_worklist(cfg, active, clear.is_some());
        let tile_ctx = TileCtx {
            tris,
            cfg,
            tiles,
            pipe,
            clear,
            color: color.shared(),
            depth: depth.map(|d| d.shared()),
        };
        ctx.install(|| {
            worklist
                .par_iter()
                .with_max_len(1)
                .for_each(|&tile| raster_tile(&tile_ctx, tile as usize));
        });
        Ok(())
    }
}

impl FineStage for ReferenceFine {
    fn run(
        &self,
        _ctx: &AcceleratorContext,
        tris: &TriangleBuffer,
        cfg: &PipelineConfig,
        tiles: &SegmentArena,
        active: &ActiveTileList,
        pipe: &dyn PixelPipe,
        clear: Option<ClearValues>,
        color: &mut SurfaceTarget,
        depth: Option<&mut SurfaceTarget>,
    ) -> RasterResult<()> {
        let worklist = tile_worklist(cfg, active, clear.is_some());
        let tile_ctx = TileCtx {
            tris,
            cfg,
            tiles,
            pipe,
            clear,
            color: color.shared(),
            depth: depth.map(|d| d.shared()),
        };
        for tile in worklist {
            raster_tile(&tile_ctx, tile as usize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binraster::{BinStage, ReferenceBin};
    use crate::buffers::{Buffer, InputVertex};
    use crate::coarseraster::{CoarseStage, ReferenceCoarse};
    use crate::config::Winding;
    use crate::error::BufferKind;
    use crate::pixelpipe::{BlendOp, GouraudPipe, PipeSpec};
    use crate::setup::{ReferenceSetup, SetupInputs, SetupStage};
    use crate::surface::Format;
    use glam::Vec4;

    struct Frame {
        cfg: PipelineConfig,
        tris: TriangleBuffer,
        tiles: SegmentArena,
        active: ActiveTileList,
        ctx: AcceleratorContext,
    }

    fn prepare(verts: &[InputVertex], index_tris: &[[u32; 3]], size: i32) -> Frame {
        let surface = SurfaceTarget::new(IVec2::splat(size), Format::Rgba8, 1).unwrap();
        let cfg = PipelineConfig::for_surface(&surface, 4, Winding::Ccw);
        let vertices = Buffer::from_vertices(verts);
        let indices = Buffer::from_triangle_indices(index_tris);
        let input = SetupInputs {
            vertices: &vertices,
            vertex_ofs: 0,
            vertex_stride: InputVertex::STRIDE,
            indices: &indices,
            index_ofs: 0,
            num_tris: index_tris.len(),
        };
        let ctx = AcceleratorContext::with_threads(4).unwrap();
        let mut tris = TriangleBuffer::new(1 << 16);
        ReferenceSetup.run(&ctx, &input, &cfg, &mut tris).unwrap();
        let mut bins = SegmentArena::new(BufferKind::BinSegs, 1024, cfg.num_bins as usize);
        ReferenceBin.run(&ctx, &tris, &cfg, &mut bins).unwrap();
        let mut tiles = SegmentArena::new(BufferKind::TileSegs, 4096, cfg.num_tiles as usize);
        let mut active = ActiveTileList::new(cfg.num_tiles as usize);
        ReferenceCoarse
            .run(&ctx, &tris, &cfg, &bins, &mut tiles, &mut active)
            .unwrap();
        Frame {
            cfg,
            tris,
            tiles,
            active,
            ctx,
        }
    }

    fn colored(x: f32, y: f32, color: Vec4) -> InputVertex {
        InputVertex::new(Vec4::new(x, y, 0.5, 1.0), color)
    }

    #[test]
    fn shared_edge_covers_each_sample_once() {
        // A quad split along its diagonal; SrcOver with 50% alpha makes
        // double coverage visible as a brighter pixel
        let white = Vec4::new(1.0, 1.0, 1.0, 0.5);
        let verts = [
            colored(-0.8, 0.8, white),
            colored(-0.8, -0.8, white),
            colored(0.8, 0.8, white),
            colored(0.8, -0.8, white),
        ];
        let frame = prepare(&verts, &[[0, 1, 2], [2, 1, 3]], 64);
        assert_eq!(frame.tris.len(), 2);

        let mut color = SurfaceTarget::new(IVec2::splat(64), Format::Rgba8, 1).unwrap();
        let spec = PipeSpec {
            samples_log2: 0,
            depth_test: false,
        };
        let pipe = GouraudPipe::new(BlendOp::SrcOver, &spec);
        ReferenceFine
            .run(
                &frame.ctx,
                &frame.tris,
                &frame.cfg,
                &frame.tiles,
                &frame.active,
                &pipe,
                Some(ClearValues::default()),
                &mut color,
                None,
            )
            .unwrap();

        // Every covered pixel blended exactly once: 0.5 * white over black
        let single = rgba8_pack_vec4(Vec4::new(0.5, 0.5, 0.5, 0.5));
        for y in 0..64 {
            for x in 0..64 {
                let c = color.pixel(x, y, 0);
                assert!(
                    c == 0 || c == single,
                    "pixel ({x}, {y}) covered more than once: {c:#010x}"
                );
            }
        }

        // The quad interior is actually covered
        assert_eq!(color.pixel(32, 32, 0), single);
    }

    #[test]
    fn later_triangle_wins_with_replace() {
        let red = Vec4::new(1.0, 0.0, 0.0, 1.0);
        let blue = Vec4::new(0.0, 0.0, 1.0, 1.0);
        let verts = [
            colored(-1.0, 1.0, red),
            colored(-1.0, -3.0, red),
            colored(3.0, 1.0, red),
            colored(-1.0, 1.0, blue),
            colored(-1.0, -3.0, blue),
            colored(3.0, 1.0, blue),
        ];
        let frame = prepare(&verts, &[[0, 1, 2], [3, 4, 5]], 64);
        let mut color = SurfaceTarget::new(IVec2::splat(64), Format::Rgba8, 1).unwrap();
        let spec = PipeSpec {
            samples_log2: 0,
            depth_test: false,
        };
        let pipe = GouraudPipe::new(BlendOp::Replace, &spec);
        ParallelFine
            .run(
                &frame.ctx,
                &frame.tris,
                &frame.cfg,
                &frame.tiles,
                &frame.active,
                &pipe,
                Some(ClearValues::default()),
                &mut color,
                None,
            )
            .unwrap();
        let expected = rgba8_pack_vec4(blue);
        for y in 0..64 {
            for x in 0..64 {
                assert_eq!(color.pixel(x, y, 0), expected, "pixel ({x}, {y})");
            }
        }
    }

    #[test]
    fn depth_test_keeps_nearer_fragment() {
        let red = Vec4::new(1.0, 0.0, 0.0, 1.0);
        let blue = Vec4::new(0.0, 0.0, 1.0, 1.0);
        // Red at z = 0.25 in front, blue at z = 0.75 submitted after
        let mut verts = vec![
            colored(-1.0, 1.0, red),
            colored(-1.0, -3.0, red),
            colored(3.0, 1.0, red),
            colored(-1.0, 1.0, blue),
            colored(-1.0, -3.0, blue),
            colored(3.0, 1.0, blue),
        ];
        for v in verts.iter_mut().take(3) {
            v.pos_clip.z = 0.25;
        }
        for v in verts.iter_mut().skip(3) {
            v.pos_clip.z = 0.75;
        }
        let frame = prepare(&verts, &[[0, 1, 2], [3, 4, 5]], 64);
        let mut color = SurfaceTarget::new(IVec2::splat(64), Format::Rgba8, 1).unwrap();
        let mut depth = SurfaceTarget::new(IVec2::splat(64), Format::Depth32, 1).unwrap();
        let spec = PipeSpec {
            samples_log2: 0,
            depth_test: true,
        };
        let pipe = GouraudPipe::new(BlendOp::Replace, &spec);
        ReferenceFine
            .run(
                &frame.ctx,
                &frame.tris,
                &frame.cfg,
                &frame.tiles,
                &frame.active,
                &pipe,
                Some(ClearValues::default()),
                &mut color,
                Some(&mut depth),
            )
            .unwrap();
        assert_eq!(color.pixel(20, 20, 0), rgba8_pack_vec4(red));
        assert!((depth.depth_at(20, 20, 0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn deferred_clear_without_triangles_clears_everything() {
        let frame = prepare(&[], &[], 64);
        let mut color = SurfaceTarget::new(IVec2::splat(64), Format::Rgba8, 1).unwrap();
        color.fill(0x12345678);
        let clear_color = rgba8_pack_vec4(Vec4::new(0.0, 1.0, 0.0, 1.0));
        ParallelFine
            .run(
                &frame.ctx,
                &frame.tris,
                &frame.cfg,
                &frame.tiles,
                &frame.active,
                &GouraudPipe::new(
                    BlendOp::Replace,
                    &PipeSpec {
                        samples_log2: 0,
                        depth_test: false,
                    },
                ),
                Some(ClearValues {
                    color: clear_color,
                    depth: 1.0,
                }),
                &mut color,
                None,
            )
            .unwrap();
        for y in 0..64 {
            for x in 0..64 {
                assert_eq!(color.pixel(x, y, 0), clear_color);
            }
        }
    }
}
