use glam::Vec4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::binraster::{BinStage, ParallelBin, ReferenceBin};
use crate::buffers::{ActiveTileList, Buffer, InputVertex, SegmentArena, TriangleBuffer};
use crate::coarseraster::{CoarseStage, ParallelCoarse, ReferenceCoarse};
use crate::config::{PipelineConfig, Winding};
use crate::context::AcceleratorContext;
use crate::error::{BufferKind, RasterError, RasterResult};
use crate::fineraster::{ClearValues, FineStage, ParallelFine, ReferenceFine};
use crate::pixelpipe::{PipeModule, PipeSpec};
use crate::setup::{ParallelSetup, ReferenceSetup, SetupInputs, SetupStage};
use crate::surface::{Format, SurfaceTarget, rgba8_pack_vec4};

/// What to do when a stage overflows one of the fixed-capacity buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapacityPolicy {
    /// Enlarge the buffer and rerun the failed stage. The draw either
    /// completes with the full triangle set or fails after repeated growth.
    #[default]
    Grow,
    /// Abort the draw with the capacity error. The frame is discarded, never
    /// partially rendered.
    Fatal,
}

/// Per-stage overrides, mainly for differential testing: each flag swaps a
/// parallel stage for its single-threaded reference twin.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugParams {
    pub reference_setup: bool,
    pub reference_bin: bool,
    pub reference_coarse: bool,
    pub reference_fine: bool,
}

/// Timings and counters from the most recent draw call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrawStats {
    pub setup_time: Duration,
    pub bin_time: Duration,
    pub coarse_time: Duration,
    pub fine_time: Duration,
    pub input_tris: usize,
    pub subtris: usize,
    pub bin_segs_used: usize,
    pub tile_segs_used: usize,
    pub active_tiles: usize,
}

const DEFAULT_MAX_SUBTRIS: usize = 1 << 16;
const DEFAULT_BIN_SEGS: usize = 1 << 13;
const DEFAULT_TILE_SEGS: usize = 1 << 15;

// Buffers double per retry, so this bounds growth at 2^12 of the configured
// capacity before a draw gives up
const MAX_GROW_ATTEMPTS: usize = 12;

/// The rasterization pipeline front end.
///
/// Owns the render surfaces, the geometry bindings and the intermediate
/// buffers that live between stages. A draw call runs the four stages in
/// order with a full barrier between each; nothing of a draw is observable
/// until `draw_triangles` returns.
pub struct Pipeline {
    ctx: AcceleratorContext,
    pipes: PipeModule,
    color: Option<SurfaceTarget>,
    depth: Option<SurfaceTarget>,
    pipe_name: Option<String>,
    vertex: Option<(Arc<Buffer>, usize)>,
    index: Option<(Arc<Buffer>, usize)>,
    pending_clear: Option<ClearValues>,
    winding: Winding,
    bin_batch_size: usize,
    policy: CapacityPolicy,
    debug: DebugParams,
    tris: TriangleBuffer,
    bins: SegmentArena,
    tiles: SegmentArena,
    active: ActiveTileList,
    stats: DrawStats,
}

impl Pipeline {
    pub fn new(ctx: AcceleratorContext) -> Self {
        Self {
            ctx,
            pipes: PipeModule::with_builtins(),
            color: None,
            depth: None,
            pipe_name: None,
            vertex: None,
            index: None,
            pending_clear: None,
            winding: Winding::default(),
            bin_batch_size: 1024,
            policy: CapacityPolicy::default(),
            debug: DebugParams::default(),
            tris: TriangleBuffer::new(DEFAULT_MAX_SUBTRIS),
            bins: SegmentArena::new(BufferKind::BinSegs, DEFAULT_BIN_SEGS, 0),
            tiles: SegmentArena::new(BufferKind::TileSegs, DEFAULT_TILE_SEGS, 0),
            active: ActiveTileList::new(0),
            stats: DrawStats::default(),
        }
    }

    pub fn context(&self) -> &AcceleratorContext {
        &self.ctx
    }

    /// Bind the render targets. The depth surface, when present, must match
    /// the color surface in size and sample count.
    pub fn set_surfaces(
        &mut self,
        color: SurfaceTarget,
        depth: Option<SurfaceTarget>,
    ) -> RasterResult<()> {
        if color.format() != Format::Rgba8 {
            return Err(RasterError::SurfaceMismatch(
                "color surface must be Rgba8".to_string(),
            ));
        }
        if let Some(depth) = &depth {
            if depth.format() != Format::Depth32 {
                return Err(RasterError::SurfaceMismatch(
                    "depth surface must be Depth32".to_string(),
                ));
            }
            if depth.size() != color.size() {
                return Err(RasterError::SurfaceMismatch(format!(
                    "depth size {} != color size {}",
                    depth.size(),
                    color.size()
                )));
            }
            if depth.num_samples() != color.num_samples() {
                return Err(RasterError::SurfaceMismatch(format!(
                    "depth samples {} != color samples {}",
                    depth.num_samples(),
                    color.num_samples()
                )));
            }
        }
        self.color = Some(color);
        self.depth = depth;
        Ok(())
    }

    pub fn color_surface(&self) -> Option<&SurfaceTarget> {
        self.color.as_ref()
    }

    pub fn depth_surface(&self) -> Option<&SurfaceTarget> {
        self.depth.as_ref()
    }

    /// Unbind and return the surfaces, e.g. to present or inspect them.
    pub fn take_surfaces(&mut self) -> (Option<SurfaceTarget>, Option<SurfaceTarget>) {
        (self.color.take(), self.depth.take())
    }

    /// Record a clear that is applied per tile at the start of the next
    /// draw's fine stage, fused with rasterization instead of a separate
    /// full-surface pass.
    pub fn deferred_clear(&mut self, color: Vec4, depth: f32) {
        self.pending_clear = Some(ClearValues {
            color: rgba8_pack_vec4(color),
            depth,
        });
    }

    /// Select the pixel pipe by registry name. Unknown names fail here, at
    /// bind time; resolution against the surface configuration happens per
    /// draw and is cached.
    pub fn set_pixel_pipe(&mut self, name: &str) -> RasterResult<()> {
        if !self.pipes.is_registered(name) {
            return Err(RasterError::UnknownPixelPipe(name.to_string()));
        }
        self.pipe_name = Some(name.to_string());
        Ok(())
    }

    /// Registry access, for installing custom pipes.
    pub fn pipes_mut(&mut self) -> &mut PipeModule {
        &mut self.pipes
    }

    pub fn set_vertex_buffer(&mut self, buffer: Arc<Buffer>, ofs: usize) {
        self.vertex = Some((buffer, ofs));
    }

    pub fn set_index_buffer(&mut self, buffer: Arc<Buffer>, ofs: usize) {
        self.index = Some((buffer, ofs));
    }

    pub fn set_winding(&mut self, winding: Winding) {
        self.winding = winding;
    }

    pub fn set_capacity_policy(&mut self, policy: CapacityPolicy) {
        self.policy = policy;
    }

    pub fn set_debug_params(&mut self, debug: DebugParams) {
        self.debug = debug;
    }

    /// Override the intermediate buffer capacities. Under the `Grow` policy
    /// these are starting sizes; under `Fatal` they are hard limits.
    pub fn set_capacities(&mut self, max_subtris: usize, bin_segs: usize, tile_segs: usize) {
        self.tris.set_max_subtris(max_subtris);
        self.bins.grow(bin_segs);
        self.tiles.grow(tile_segs);
    }

    pub fn stats(&self) -> &DrawStats {
        &self.stats
    }

    fn validate_geometry(
        vertices: &Buffer,
        vertex_ofs: usize,
        indices: &Buffer,
        index_ofs: usize,
        num_tris: usize,
    ) -> RasterResult<()> {
        let index_bytes = num_tris * 12;
        if index_ofs + index_bytes > indices.len() {
            return Err(RasterError::InvalidBufferRange(format!(
                "index range {}..{} exceeds buffer of {} bytes",
                index_ofs,
                index_ofs + index_bytes,
                indices.len()
            )));
        }
        let mut max_index = 0u32;
        for tri in 0..num_tris {
            for i in indices.read_tri_indices(index_ofs, tri) {
                max_index = max_index.max(i);
            }
        }
        if num_tris > 0 {
            let needed = vertex_ofs + (max_index as usize + 1) * InputVertex::STRIDE;
            if needed > vertices.len() {
                return Err(RasterError::InvalidBufferRange(format!(
                    "vertex index {} needs {} bytes, buffer has {}",
                    max_index,
                    needed,
                    vertices.len()
                )));
            }
        }
        Ok(())
    }

    fn grows(&self, attempt: usize, err: &RasterError) -> bool {
        self.policy == CapacityPolicy::Grow
            && attempt < MAX_GROW_ATTEMPTS
            && matches!(err, RasterError::CapacityExceeded { .. })
    }

    fn run_setup(&mut self, input: &SetupInputs<'_>, cfg: &PipelineConfig) -> RasterResult<()> {
        let stage: &dyn SetupStage = if self.debug.reference_setup {
            &ReferenceSetup
        } else {
            &ParallelSetup
        };
        let mut attempt = 0;
        loop {
            match stage.run(&self.ctx, input, cfg, &mut self.tris) {
                Ok(()) => return Ok(()),
                Err(err) if self.grows(attempt, &err) => {
                    let required = self.tris.len().max(self.tris.max_subtris() * 2);
                    log::debug!("triangle buffer overflow, growing to {required}");
                    self.tris.set_max_subtris(required);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_bin(&mut self, cfg: &PipelineConfig) -> RasterResult<()> {
        let stage: &dyn BinStage = if self.debug.reference_bin {
            &ReferenceBin
        } else {
            &ParallelBin
        };
        let mut attempt = 0;
        loop {
            match stage.run(&self.ctx, &self.tris, cfg, &mut self.bins) {
                Ok(()) => return Ok(()),
                Err(err) if self.grows(attempt, &err) => {
                    let required = self.bins.capacity() * 2;
                    log::debug!("bin segment overflow, growing to {required}");
                    self.bins.grow(required);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_coarse(&mut self, cfg: &PipelineConfig) -> RasterResult<()> {
        let stage: &dyn CoarseStage = if self.debug.reference_coarse {
            &ReferenceCoarse
        } else {
            &ParallelCoarse
        };
        let mut attempt = 0;
        loop {
            match stage.run(
                &self.ctx,
                &self.tris,
                cfg,
                &self.bins,
                &mut self.tiles,
                &mut self.active,
            ) {
                Ok(()) => return Ok(()),
                Err(err) if self.grows(attempt, &err) => {
                    let required = self.tiles.capacity() * 2;
                    log::debug!("tile segment overflow, growing to {required}");
                    self.tiles.grow(required);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Rasterize `num_tris` triangles from the bound index buffer.
    ///
    /// Runs all four stages back to back. On success the bound surfaces hold
    /// the result, a pending deferred clear has been consumed and the
    /// returned stats describe the draw. On error the surfaces are untouched
    /// and the clear stays pending.
    pub fn draw_triangles(&mut self, num_tris: usize) -> RasterResult<DrawStats> {
        let color = self.color.as_ref().ok_or(RasterError::MissingSurface)?;
        let pipe_name = self
            .pipe_name
            .clone()
            .ok_or(RasterError::MissingPixelPipe)?;
        let (vertices, vertex_ofs) = self
            .vertex
            .clone()
            .ok_or_else(|| RasterError::InvalidBufferRange("no vertex buffer bound".to_string()))?;
        let (indices, index_ofs) = self
            .index
            .clone()
            .ok_or_else(|| RasterError::InvalidBufferRange("no index buffer bound".to_string()))?;
        Self::validate_geometry(&vertices, vertex_ofs, &indices, index_ofs, num_tris)?;

        let cfg = PipelineConfig::for_surface(color, self.bin_batch_size, self.winding);
        let spec = PipeSpec {
            samples_log2: cfg.samples_log2,
            depth_test: self.depth.is_some(),
        };
        let pipe = self.pipes.resolve(&pipe_name, &spec)?;

        let input = SetupInputs {
            vertices: &vertices,
            vertex_ofs,
            vertex_stride: InputVertex::STRIDE,
            indices: &indices,
            index_ofs,
            num_tris,
        };

        let mut stats = DrawStats {
            input_tris: num_tris,
            ..DrawStats::default()
        };

        let t0 = Instant::now();
        self.run_setup(&input, &cfg)?;
        stats.setup_time = t0.elapsed();
        stats.subtris = self.tris.len();

        let t1 = Instant::now();
        self.run_bin(&cfg)?;
        stats.bin_time = t1.elapsed();
        stats.bin_segs_used = self.bins.segs_used();

        let t2 = Instant::now();
        self.run_coarse(&cfg)?;
        stats.coarse_time = t2.elapsed();
        stats.tile_segs_used = self.tiles.segs_used();
        stats.active_tiles = self.active.len();

        let t3 = Instant::now();
        let fine: &dyn FineStage = if self.debug.reference_fine {
            &ReferenceFine
        } else {
            &ParallelFine
        };
        let clear = self.pending_clear.take();
        let color = self.color.as_mut().ok_or(RasterError::MissingSurface)?;
        fine.run(
            &self.ctx,
            &self.tris,
            &cfg,
            &self.tiles,
            &self.active,
            pipe.as_ref(),
            clear,
            color,
            self.depth.as_mut(),
        )?;
        stats.fine_time = t3.elapsed();

        log::debug!(
            "draw: {} tris -> {} subtris, {} active tiles, setup {:?} bin {:?} coarse {:?} fine {:?}",
            stats.input_tris,
            stats.subtris,
            stats.active_tiles,
            stats.setup_time,
            stats.bin_time,
            stats.coarse_time,
            stats.fine_time,
        );
        self.stats = stats;
        Ok(stats)
    }
}
