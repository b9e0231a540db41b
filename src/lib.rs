//! Tile-based software rasterizer with a fixed four-stage pipeline:
//! triangle setup, bin rasterization, coarse (tile) rasterization and fine
//! (sample) rasterization. Stages run data-parallel on a thread pool with a
//! full barrier between them, and the result is independent of the worker
//! count and scheduling.

mod binraster;
mod buffers;
mod coarseraster;
mod config;
mod context;
mod error;
mod fineraster;
mod pipeline;
mod pixelpipe;
mod setup;
mod surface;

pub use binraster::{BinStage, ParallelBin, ReferenceBin};
pub use buffers::{
    ActiveTileList, Buffer, EdgePleq, InputVertex, SEG_SIZE, SegmentArena, TriangleBuffer,
    TriangleRecord,
};
pub use coarseraster::{CoarseStage, ParallelCoarse, ReferenceCoarse};
pub use config::{
    BIN_PIXEL_SIZE, BIN_TILE_LOG2, BIN_TILE_SIZE, PipelineConfig, RECORD_BIN_SPAN, SUBPIXEL_LOG2,
    SUBPIXEL_SCALE, TILE_LOG2, TILE_SIZE, Winding, sample_positions,
};
pub use context::AcceleratorContext;
pub use error::{BufferKind, RasterError, RasterResult};
pub use fineraster::{ClearValues, FineStage, ParallelFine, ReferenceFine};
pub use pipeline::{CapacityPolicy, DebugParams, DrawStats, Pipeline};
pub use pixelpipe::{BlendOp, Fragment, GouraudPipe, PipeModule, PipeSpec, PixelPipe};
pub use setup::{ParallelSetup, ReferenceSetup, SetupInputs, SetupStage};
pub use surface::{Format, SurfaceTarget, rgba8_pack_vec4, rgba8_unpack_vec4};
