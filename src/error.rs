use std::fmt;
use thiserror::Error;

pub type RasterResult<T> = Result<T, RasterError>;

/// Which statically sized device buffer ran out of room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Subtris,
    BinSegs,
    TileSegs,
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Subtris => write!(f, "triangle buffer"),
            BufferKind::BinSegs => write!(f, "bin segment buffer"),
            BufferKind::TileSegs => write!(f, "tile segment buffer"),
        }
    }
}

/// Errors produced by the rasterization pipeline.
///
/// Configuration errors are detected eagerly at the setter call. Capacity
/// errors are detected during the stage that overflowed and abort the draw
/// call; there is no partial execution.
#[derive(Error, Debug)]
pub enum RasterError {
    #[error("unsupported sample count: {0} (must be 1, 2, 4 or 8)")]
    UnsupportedSampleCount(i32),

    #[error("invalid surface size: {0}x{1}")]
    InvalidSurfaceSize(i32, i32),

    #[error("color/depth surface mismatch: {0}")]
    SurfaceMismatch(String),

    #[error("no color surface bound")]
    MissingSurface,

    #[error("no pixel pipe bound")]
    MissingPixelPipe,

    #[error("unknown pixel pipe: {0:?}")]
    UnknownPixelPipe(String),

    #[error("vertex/index buffer range out of bounds: {0}")]
    InvalidBufferRange(String),

    #[error("{buffer} capacity exceeded: required {required}, capacity {capacity}")]
    CapacityExceeded {
        buffer: BufferKind,
        required: usize,
        capacity: usize,
    },

    #[error("accelerator backend error: {0}")]
    Backend(String),
}
