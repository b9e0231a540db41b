use glam::{IVec2, Vec4};
use rayon::prelude::*;

use crate::buffers::{Buffer, EdgePleq, InputVertex, TriangleBuffer, TriangleRecord};
use crate::config::{
    BIN_PIXEL_SIZE, MAX_SUBPIXEL_COORD, PipelineConfig, RECORD_BIN_SPAN, SUBPIXEL_LOG2,
    SUBPIXEL_SCALE, SUBPIXEL_SCALE_F, Winding,
};
use crate::context::AcceleratorContext;
use crate::error::RasterResult;

/// Geometry inputs for one draw call. Ranges are validated by the
/// orchestrator before any stage runs.
pub struct SetupInputs<'a> {
    pub vertices: &'a Buffer,
    pub vertex_ofs: usize,
    pub vertex_stride: usize,
    pub indices: &'a Buffer,
    pub index_ofs: usize,
    pub num_tris: usize,
}

/// First pipeline stage: index/vertex fetch, perspective divide, viewport
/// transform, winding cull, plane-equation setup and subtriangle splitting.
pub trait SetupStage: Send + Sync {
    fn run(
        &self,
        ctx: &AcceleratorContext,
        input: &SetupInputs<'_>,
        cfg: &PipelineConfig,
        out: &mut TriangleBuffer,
    ) -> RasterResult<()>;
}

pub struct ParallelSetup;
pub struct ReferenceSetup;

impl SetupStage for ParallelSetup {
    fn run(
        &self,
        ctx: &AcceleratorContext,
        input: &SetupInputs<'_>,
        cfg: &PipelineConfig,
        out: &mut TriangleBuffer,
    ) -> RasterResult<()> {
        out.records.clear();
        // Ordered parallel collect keeps records in submission order no
        // matter how batches are scheduled
        ctx.install(|| {
            out.records.par_extend(
                (0..input.num_tris)
                    .into_par_iter()
                    .with_min_len(cfg.bin_batch_size.max(1))
                    .flat_map_iter(|tri| setup_triangle(input, cfg, tri)),
            );
        });
        out.check_capacity()
    }
}

impl SetupStage for ReferenceSetup {
    fn run(
        &self,
        _ctx: &AcceleratorContext,
        input: &SetupInputs<'_>,
        cfg: &PipelineConfig,
        out: &mut TriangleBuffer,
    ) -> RasterResult<()> {
        out.records.clear();
        for tri in 0..input.num_tris {
            out.records.extend(setup_triangle(input, cfg, tri));
        }
        out.check_capacity()
    }
}

// Top edges point right, left edges point up. Exactly one of a directed
// edge and its reverse satisfies this, which is what keeps shared edges
// from double-covering or gapping.
#[inline]
fn is_top_left(d: IVec2) -> bool {
    d.y < 0 || (d.y == 0 && d.x > 0)
}

#[inline]
fn edge_pleq(va: IVec2, vb: IVec2) -> EdgePleq {
    let a = va.y - vb.y;
    let b = vb.x - va.x;
    let c = -(a as i64 * va.x as i64 + b as i64 * va.y as i64);
    let bias = if is_top_left(vb - va) { 0 } else { -1 };
    EdgePleq { a, b, c: c + bias }
}

/// Clip space -> integer subpixel screen coordinates (y down).
fn clip_to_subpixel(pos: Vec4, viewport: IVec2) -> IVec2 {
    let inv_w = 1.0 / pos.w;
    let sx = (pos.x * inv_w + 1.0) * 0.5 * viewport.x as f32;
    let sy = (1.0 - pos.y * inv_w) * 0.5 * viewport.y as f32;
    let clamp = MAX_SUBPIXEL_COORD as f32;
    IVec2::new(
        (sx * SUBPIXEL_SCALE_F).round().clamp(-clamp, clamp) as i32,
        (sy * SUBPIXEL_SCALE_F).round().clamp(-clamp, clamp) as i32,
    )
}

/// Set up one input triangle, yielding zero records when it is culled and
/// more than one when its bin extent exceeds a single record's span.
fn setup_triangle(
    input: &SetupInputs<'_>,
    cfg: &PipelineConfig,
    tri: usize,
) -> Vec<TriangleRecord> {
    let idx = input.indices.read_tri_indices(input.index_ofs, tri);
    let v0 = input
        .vertices
        .read_vertex(input.vertex_ofs, input.vertex_stride, idx[0] as usize);
    let v1 = input
        .vertices
        .read_vertex(input.vertex_ofs, input.vertex_stride, idx[1] as usize);
    let v2 = input
        .vertices
        .read_vertex(input.vertex_ofs, input.vertex_stride, idx[2] as usize);

    // Near-plane clipping belongs to the external vertex stage
    if v0.pos_clip.w <= 0.0 || v1.pos_clip.w <= 0.0 || v2.pos_clip.w <= 0.0 {
        return Vec::new();
    }

    let p0 = clip_to_subpixel(v0.pos_clip, cfg.viewport);
    let p1 = clip_to_subpixel(v1.pos_clip, cfg.viewport);
    let p2 = clip_to_subpixel(v2.pos_clip, cfg.viewport);

    // Signed doubled area in subpixel units; positive is clockwise on screen
    let area2 = (p1.x - p0.x) as i64 * (p2.y - p0.y) as i64
        - (p2.x - p0.x) as i64 * (p1.y - p0.y) as i64;

    let front = match cfg.winding {
        Winding::Ccw => area2 < 0,
        Winding::Cw => area2 > 0,
    };
    if !front {
        // Degenerate or back-facing; not an error, just not emitted
        return Vec::new();
    }

    // Canonicalize to positive area so all three edge functions are
    // non-negative inside
    let (p1, p2, v1, v2) = if area2 < 0 {
        (p2, p1, v2, v1)
    } else {
        (p1, p2, v1, v2)
    };
    let area2 = area2.abs();

    let ndc_z = |v: &InputVertex| v.pos_clip.z / v.pos_clip.w;
    let z = [ndc_z(&v0), ndc_z(&v1), ndc_z(&v2)];
    let color = [v0.color, v1.color, v2.color];

    // Conservative pixel bounding box, clamped to the render target
    let min_sub = p0.min(p1).min(p2);
    let max_sub = p0.max(p1).max(p2);
    let pixel_lo = (min_sub >> SUBPIXEL_LOG2).max(IVec2::ZERO);
    let pixel_hi = ((max_sub + IVec2::splat(SUBPIXEL_SCALE - 1)) >> SUBPIXEL_LOG2)
        .min(cfg.size_pixels);
    if pixel_lo.x >= pixel_hi.x || pixel_lo.y >= pixel_hi.y {
        return Vec::new();
    }

    let bin_lo = pixel_lo / BIN_PIXEL_SIZE;
    let bin_hi = (pixel_hi - IVec2::ONE) / BIN_PIXEL_SIZE;

    let edges = [edge_pleq(p0, p1), edge_pleq(p1, p2), edge_pleq(p2, p0)];
    let inv_area2 = 1.0 / area2 as f32;

    // Split into records over disjoint bin-range slices so BinRaster sees a
    // bounded fan-out per record
    let mut records = Vec::with_capacity(1);
    let mut by = bin_lo.y;
    while by <= bin_hi.y {
        let slice_hi_y = (by + RECORD_BIN_SPAN - 1).min(bin_hi.y);
        let mut bx = bin_lo.x;
        while bx <= bin_hi.x {
            let slice_hi_x = (bx + RECORD_BIN_SPAN - 1).min(bin_hi.x);
            records.push(TriangleRecord {
                tri_index: tri as u32,
                bin_lo: IVec2::new(bx, by),
                bin_hi: IVec2::new(slice_hi_x, slice_hi_y),
                pixel_lo,
                pixel_hi,
                edges,
                inv_area2,
                z,
                color,
            });
            bx = slice_hi_x + 1;
        }
        by = slice_hi_y + 1;
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::InputVertex;
    use crate::config::sample_positions;
    use crate::surface::{Format, SurfaceTarget};

    fn config(size: i32) -> PipelineConfig {
        let surface = SurfaceTarget::new(IVec2::splat(size), Format::Rgba8, 1).unwrap();
        PipelineConfig::for_surface(&surface, 64, Winding::Ccw)
    }

    fn vertex(x: f32, y: f32) -> InputVertex {
        InputVertex::new(Vec4::new(x, y, 0.5, 1.0), Vec4::ONE)
    }

    fn run_setup(
        verts: &[InputVertex],
        tris: &[[u32; 3]],
        cfg: &PipelineConfig,
    ) -> TriangleBuffer {
        let vertices = Buffer::from_vertices(verts);
        let indices = Buffer::from_triangle_indices(tris);
        let input = SetupInputs {
            vertices: &vertices,
            vertex_ofs: 0,
            vertex_stride: InputVertex::STRIDE,
            indices: &indices,
            index_ofs: 0,
            num_tris: tris.len(),
        };
        let ctx = AcceleratorContext::with_threads(2).unwrap();
        let mut out = TriangleBuffer::new(1 << 16);
        ReferenceSetup.run(&ctx, &input, cfg, &mut out).unwrap();
        out
    }

    #[test]
    fn ccw_triangle_is_emitted_cw_is_culled() {
        let cfg = config(64);
        let verts = [vertex(-0.5, -0.5), vertex(0.5, -0.5), vertex(0.0, 0.5)];
        let ccw = run_setup(&verts, &[[0, 1, 2]], &cfg);
        assert_eq!(ccw.len(), 1);
        let cw = run_setup(&verts, &[[0, 2, 1]], &cfg);
        assert_eq!(cw.len(), 0);
    }

    #[test]
    fn degenerate_triangle_is_culled() {
        let cfg = config(64);
        let verts = [vertex(-0.5, -0.5), vertex(0.5, 0.5), vertex(0.0, 0.0)];
        let out = run_setup(&verts, &[[0, 1, 2]], &cfg);
        assert_eq!(out.len(), 0);
    }

    #[test]
    fn behind_camera_triangle_is_culled() {
        let cfg = config(64);
        let mut verts = [vertex(-0.5, -0.5), vertex(0.5, -0.5), vertex(0.0, 0.5)];
        verts[1].pos_clip.w = -1.0;
        let out = run_setup(&verts, &[[0, 1, 2]], &cfg);
        assert_eq!(out.len(), 0);
    }

    #[test]
    fn edge_functions_cover_interior_samples() {
        let cfg = config(64);
        let verts = [vertex(-0.9, 0.9), vertex(-0.9, -0.9), vertex(0.9, 0.9)];
        let out = run_setup(&verts, &[[0, 1, 2]], &cfg);
        assert_eq!(out.len(), 1);
        let rec = &out.records[0];
        let center = sample_positions(0)[0];

        // Pixel near the triangle centroid
        let inside = IVec2::new(16, 16) * SUBPIXEL_SCALE + center;
        assert!(rec.edges.iter().all(|e| e.eval(inside) >= 0));

        // Pixel in the empty corner of the bounding box
        let outside = IVec2::new(60, 60) * SUBPIXEL_SCALE + center;
        assert!(rec.edges.iter().any(|e| e.eval(outside) < 0));
    }

    #[test]
    fn bbox_is_clamped_to_target() {
        let cfg = config(64);
        let verts = [vertex(-4.0, 4.0), vertex(-4.0, -4.0), vertex(4.0, 4.0)];
        let out = run_setup(&verts, &[[0, 1, 2]], &cfg);
        assert_eq!(out.len(), 1);
        let rec = &out.records[0];
        assert_eq!(rec.pixel_lo, IVec2::ZERO);
        assert_eq!(rec.pixel_hi, cfg.size_pixels);
    }

    #[test]
    fn wide_triangles_split_into_subtriangles() {
        // 2048 px -> 16x16 bins, above the 8-bin record span on both axes
        let cfg = config(2048);
        let verts = [vertex(-1.0, 1.0), vertex(-1.0, -3.0), vertex(3.0, 1.0)];
        let out = run_setup(&verts, &[[0, 1, 2]], &cfg);
        assert_eq!(out.len(), 4);
        // Slices are disjoint and share plane equations
        for r in &out.records {
            assert_eq!(r.tri_index, 0);
            assert_eq!(r.edges[0].a, out.records[0].edges[0].a);
        }
        let mut slices: Vec<(i32, i32)> = out
            .records
            .iter()
            .map(|r| (r.bin_lo.x, r.bin_lo.y))
            .collect();
        slices.sort_unstable();
        assert_eq!(slices, vec![(0, 0), (0, 8), (8, 0), (8, 8)]);
    }

    #[test]
    fn parallel_matches_reference() {
        let cfg = config(256);
        let mut verts = Vec::new();
        let mut tris = Vec::new();
        for i in 0..40 {
            let t = i as f32 / 40.0;
            let x = t * 1.6 - 0.8;
            verts.push(vertex(x, -0.5));
            verts.push(vertex(x + 0.3, -0.5));
            verts.push(vertex(x, 0.6));
            let b = (i * 3) as u32;
            tris.push([b, b + 1, b + 2]);
        }
        let vertices = Buffer::from_vertices(&verts);
        let indices = Buffer::from_triangle_indices(&tris);
        let input = SetupInputs {
            vertices: &vertices,
            vertex_ofs: 0,
            vertex_stride: InputVertex::STRIDE,
            indices: &indices,
            index_ofs: 0,
            num_tris: tris.len(),
        };
        let ctx = AcceleratorContext::with_threads(4).unwrap();
        let mut par = TriangleBuffer::new(1 << 16);
        let mut seq = TriangleBuffer::new(1 << 16);
        ParallelSetup.run(&ctx, &input, &cfg, &mut par).unwrap();
        ReferenceSetup.run(&ctx, &input, &cfg, &mut seq).unwrap();
        assert_eq!(par.len(), seq.len());
        for (a, b) in par.records.iter().zip(seq.records.iter()) {
            assert_eq!(a.tri_index, b.tri_index);
            assert_eq!(a.bin_lo, b.bin_lo);
            assert_eq!(a.pixel_hi, b.pixel_hi);
        }
    }
}
