use crossbeam_utils::Backoff;
use glam::{IVec2, Vec4};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::error::{BufferKind, RasterError, RasterResult};

/// Triangle references per segment.
pub const SEG_SIZE: usize = 32;

/// Arena index meaning "no segment".
pub const SEG_NIL: i32 = -1;

// ---------------------------------------------------------------------------
// Host-managed vertex/index byte buffers
// ---------------------------------------------------------------------------

/// Vertex record as read from the vertex buffer: a clip-space position
/// followed by a vertex color, both little-endian f32 quads.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputVertex {
    pub pos_clip: Vec4,
    pub color: Vec4,
}

impl InputVertex {
    pub const STRIDE: usize = 32;

    pub fn new(pos_clip: Vec4, color: Vec4) -> Self {
        Self { pos_clip, color }
    }
}

/// An opaque byte range. The pipeline only requires random-indexed reads;
/// ranges are validated once at the start of a draw, before any stage runs.
pub struct Buffer {
    bytes: Vec<u8>,
}

impl Buffer {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn from_vertices(vertices: &[InputVertex]) -> Self {
        let mut bytes = Vec::with_capacity(vertices.len() * InputVertex::STRIDE);
        for v in vertices {
            for f in [
                v.pos_clip.x,
                v.pos_clip.y,
                v.pos_clip.z,
                v.pos_clip.w,
                v.color.x,
                v.color.y,
                v.color.z,
                v.color.w,
            ] {
                bytes.extend_from_slice(&f.to_le_bytes());
            }
        }
        Self { bytes }
    }

    pub fn from_triangle_indices(tris: &[[u32; 3]]) -> Self {
        let mut bytes = Vec::with_capacity(tris.len() * 12);
        for t in tris {
            for i in t {
                bytes.extend_from_slice(&i.to_le_bytes());
            }
        }
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[inline]
    fn read_u32(&self, ofs: usize) -> u32 {
        let b = &self.bytes[ofs..ofs + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    #[inline]
    fn read_f32(&self, ofs: usize) -> f32 {
        f32::from_bits(self.read_u32(ofs))
    }

    #[inline]
    fn read_vec4(&self, ofs: usize) -> Vec4 {
        Vec4::new(
            self.read_f32(ofs),
            self.read_f32(ofs + 4),
            self.read_f32(ofs + 8),
            self.read_f32(ofs + 12),
        )
    }

    pub(crate) fn read_vertex(&self, ofs: usize, stride: usize, index: usize) -> InputVertex {
        let base = ofs + index * stride;
        InputVertex {
            pos_clip: self.read_vec4(base),
            color: self.read_vec4(base + 16),
        }
    }

    pub(crate) fn read_tri_indices(&self, ofs: usize, tri: usize) -> [u32; 3] {
        let base = ofs + tri * 12;
        [
            self.read_u32(base),
            self.read_u32(base + 4),
            self.read_u32(base + 8),
        ]
    }
}

// ---------------------------------------------------------------------------
// Triangle buffer written by TriangleSetup
// ---------------------------------------------------------------------------

/// One edge function plane equation in subpixel fixed point. The fill-rule
/// bias is folded into `c`, so a sample is inside the edge iff eval >= 0.
#[derive(Debug, Clone, Copy)]
pub struct EdgePleq {
    pub a: i32,
    pub b: i32,
    pub c: i64,
}

impl EdgePleq {
    /// Evaluate at a position in global subpixel coordinates.
    #[inline]
    pub fn eval(&self, p: IVec2) -> i64 {
        self.a as i64 * p.x as i64 + self.b as i64 * p.y as i64 + self.c
    }
}

/// A (sub)triangle record produced by TriangleSetup. Subtriangle records of
/// one input triangle share plane equations and attributes but cover
/// disjoint bin-range slices.
#[derive(Debug, Clone, Copy)]
pub struct TriangleRecord {
    /// Index of the source triangle in the index buffer.
    pub tri_index: u32,
    /// Inclusive bin range addressed by this record.
    pub bin_lo: IVec2,
    pub bin_hi: IVec2,
    /// Clamped pixel-space bounding box, exclusive hi.
    pub pixel_lo: IVec2,
    pub pixel_hi: IVec2,
    /// Edges v0->v1, v1->v2, v2->v0 of the canonicalized triangle.
    pub edges: [EdgePleq; 3],
    /// 1 / (2 * area) in subpixel units, for barycentrics.
    pub inv_area2: f32,
    /// NDC depth per canonical vertex.
    pub z: [f32; 3],
    /// Vertex colors per canonical vertex.
    pub color: [Vec4; 3],
}

/// Append-only per-frame triangle storage, fully overwritten each draw.
pub struct TriangleBuffer {
    pub records: Vec<TriangleRecord>,
    max_subtris: usize,
}

impl TriangleBuffer {
    pub fn new(max_subtris: usize) -> Self {
        Self {
            records: Vec::new(),
            max_subtris,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_subtris(&self) -> usize {
        self.max_subtris
    }

    pub fn set_max_subtris(&mut self, max_subtris: usize) {
        self.max_subtris = max_subtris;
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Subtriangle demand is known exactly once setup has emitted, so the
    /// overflow check runs before anything downstream consumes the buffer.
    pub fn check_capacity(&self) -> RasterResult<()> {
        if self.records.len() > self.max_subtris {
            return Err(RasterError::CapacityExceeded {
                buffer: BufferKind::Subtris,
                required: self.records.len(),
                capacity: self.max_subtris,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Segment arena shared by BinRaster and CoarseRaster outputs
// ---------------------------------------------------------------------------

/// Singly linked lists of fixed-capacity segments in a flat arena, one list
/// per lane (a lane is a bin or a tile). Concurrent appends reserve a slot
/// with a per-lane fetch-add; the reserver of a segment's first slot
/// allocates and links it, everyone else spins briefly until the link is
/// published. This is the pointer-free GPU pattern: all links are arena
/// indices, the atomic counters are the only synchronization.
pub struct SegmentArena {
    kind: BufferKind,
    max_segs: usize,
    refs: Box<[UnsafeCell<u32>]>,
    seg_next: Vec<AtomicI32>,
    seg_count: Vec<AtomicU32>,
    lane_first: Vec<AtomicI32>,
    lane_total: Vec<AtomicU32>,
    alloc: AtomicI32,
    overflowed: AtomicBool,
}

// Slot writes go through reserved, never-shared indices
unsafe impl Sync for SegmentArena {}
unsafe impl Send for SegmentArena {}

impl SegmentArena {
    pub fn new(kind: BufferKind, max_segs: usize, num_lanes: usize) -> Self {
        let mut arena = Self {
            kind,
            max_segs: 0,
            refs: Box::new([]),
            seg_next: Vec::new(),
            seg_count: Vec::new(),
            lane_first: Vec::new(),
            lane_total: Vec::new(),
            alloc: AtomicI32::new(0),
            overflowed: AtomicBool::new(false),
        };
        arena.grow(max_segs);
        arena.reset(num_lanes);
        arena
    }

    pub fn capacity(&self) -> usize {
        self.max_segs
    }

    pub fn num_lanes(&self) -> usize {
        self.lane_first.len()
    }

    /// Number of segments handed out so far.
    pub fn segs_used(&self) -> usize {
        (self.alloc.load(Ordering::Relaxed).max(0) as usize).min(self.max_segs)
    }

    /// Enlarge the arena. Existing contents are discarded; callers rerun the
    /// stage that overflowed.
    pub fn grow(&mut self, max_segs: usize) {
        self.max_segs = max_segs;
        self.refs = (0..max_segs * SEG_SIZE)
            .map(|_| UnsafeCell::new(0))
            .collect();
        self.seg_next = (0..max_segs).map(|_| AtomicI32::new(SEG_NIL)).collect();
        self.seg_count = (0..max_segs).map(|_| AtomicU32::new(0)).collect();
    }

    /// Prepare for a new stage run: empty every lane, recycle all segments.
    pub fn reset(&mut self, num_lanes: usize) {
        if self.lane_first.len() != num_lanes {
            self.lane_first = (0..num_lanes).map(|_| AtomicI32::new(SEG_NIL)).collect();
            self.lane_total = (0..num_lanes).map(|_| AtomicU32::new(0)).collect();
        } else {
            for first in &self.lane_first {
                first.store(SEG_NIL, Ordering::Relaxed);
            }
            for total in &self.lane_total {
                total.store(0, Ordering::Relaxed);
            }
        }
        self.alloc.store(0, Ordering::Relaxed);
        self.overflowed.store(false, Ordering::Relaxed);
    }

    fn overflow_error(&self) -> RasterError {
        RasterError::CapacityExceeded {
            buffer: self.kind,
            required: self.max_segs * 2,
            capacity: self.max_segs,
        }
    }

    /// Find the segment holding the given ordinal of a lane's chain, waiting
    /// for a concurrent allocator to publish the link when necessary.
    fn wait_segment(&self, lane: usize, seg_ord: usize) -> RasterResult<usize> {
        let backoff = Backoff::new();
        loop {
            let mut seg = self.lane_first[lane].load(Ordering::Acquire);
            let mut hops = seg_ord;
            while seg != SEG_NIL && hops > 0 {
                seg = self.seg_next[seg as usize].load(Ordering::Acquire);
                hops -= 1;
            }
            if seg != SEG_NIL {
                return Ok(seg as usize);
            }
            if self.overflowed.load(Ordering::Relaxed) {
                return Err(self.overflow_error());
            }
            // Waiting for the slot-0 reserver to allocate the segment
            backoff.snooze();
        }
    }

    /// Append a triangle reference to a lane's chain.
    pub fn append(&self, lane: usize, value: u32) -> RasterResult<()> {
        let idx = self.lane_total[lane].fetch_add(1, Ordering::Relaxed) as usize;
        let seg_ord = idx / SEG_SIZE;
        let local = idx % SEG_SIZE;

        if local == 0 {
            let seg = self.alloc.fetch_add(1, Ordering::Relaxed);
            if seg as usize >= self.max_segs {
                self.overflowed.store(true, Ordering::Relaxed);
                return Err(self.overflow_error());
            }
            self.seg_next[seg as usize].store(SEG_NIL, Ordering::Relaxed);
            self.seg_count[seg as usize].store(0, Ordering::Relaxed);
            if seg_ord == 0 {
                self.lane_first[lane].store(seg, Ordering::Release);
            } else {
                let prev = self.wait_segment(lane, seg_ord - 1)?;
                self.seg_next[prev].store(seg, Ordering::Release);
            }
        }

        let seg = self.wait_segment(lane, seg_ord)?;
        let cell = &self.refs[seg * SEG_SIZE + local];
        unsafe {
            *cell.get() = value;
        }
        self.seg_count[seg].fetch_add(1, Ordering::Release);
        Ok(())
    }

    pub fn lane_total(&self, lane: usize) -> usize {
        self.lane_total[lane].load(Ordering::Relaxed) as usize
    }

    /// Walk a lane's references in chain order. Only valid between stage
    /// barriers, when no appends are in flight.
    pub fn lane_refs(&self, lane: usize) -> LaneIter<'_> {
        LaneIter {
            arena: self,
            seg: self.lane_first[lane].load(Ordering::Acquire),
            local: 0,
            remaining: self.lane_total(lane),
        }
    }
}

pub struct LaneIter<'a> {
    arena: &'a SegmentArena,
    seg: i32,
    local: usize,
    remaining: usize,
}

impl Iterator for LaneIter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 || self.seg == SEG_NIL {
            return None;
        }
        let cell = &self.arena.refs[self.seg as usize * SEG_SIZE + self.local];
        let value = unsafe { *cell.get() };
        self.remaining -= 1;
        self.local += 1;
        if self.local == SEG_SIZE {
            self.local = 0;
            self.seg = self.arena.seg_next[self.seg as usize].load(Ordering::Acquire);
        }
        Some(value)
    }
}

// ---------------------------------------------------------------------------
// Active tile list written by CoarseRaster
// ---------------------------------------------------------------------------

/// Tiles that received at least one triangle reference. Each tile has a
/// single owning bin worker, so a tile is pushed at most once and the list
/// never overflows its `num_tiles` backing store.
pub struct ActiveTileList {
    tiles: Vec<AtomicI32>,
    count: AtomicUsize,
}

impl ActiveTileList {
    pub fn new(num_tiles: usize) -> Self {
        Self {
            tiles: (0..num_tiles).map(|_| AtomicI32::new(SEG_NIL)).collect(),
            count: AtomicUsize::new(0),
        }
    }

    pub fn reset(&mut self, num_tiles: usize) {
        if self.tiles.len() != num_tiles {
            self.tiles = (0..num_tiles).map(|_| AtomicI32::new(SEG_NIL)).collect();
        }
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn push(&self, tile: i32) {
        let idx = self.count.fetch_add(1, Ordering::Relaxed);
        self.tiles[idx].store(tile, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed).min(self.tiles.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> i32 {
        self.tiles[idx].load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Vec<i32> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn vertex_roundtrip() {
        let verts = [
            InputVertex::new(Vec4::new(0.5, -1.0, 0.25, 1.0), Vec4::new(1.0, 0.0, 0.0, 1.0)),
            InputVertex::new(Vec4::new(-0.5, 1.0, 0.75, 2.0), Vec4::new(0.0, 1.0, 0.0, 0.5)),
        ];
        let buf = Buffer::from_vertices(&verts);
        assert_eq!(buf.len(), 2 * InputVertex::STRIDE);
        assert_eq!(buf.read_vertex(0, InputVertex::STRIDE, 0), verts[0]);
        assert_eq!(buf.read_vertex(0, InputVertex::STRIDE, 1), verts[1]);
    }

    #[test]
    fn index_roundtrip() {
        let buf = Buffer::from_triangle_indices(&[[0, 1, 2], [2, 1, 3]]);
        assert_eq!(buf.read_tri_indices(0, 0), [0, 1, 2]);
        assert_eq!(buf.read_tri_indices(0, 1), [2, 1, 3]);
    }

    #[test]
    fn arena_sequential_chain_order() {
        let arena = SegmentArena::new(BufferKind::BinSegs, 16, 4);
        for i in 0..100u32 {
            arena.append(2, i).unwrap();
        }
        assert_eq!(arena.lane_total(2), 100);
        let refs: Vec<u32> = arena.lane_refs(2).collect();
        assert_eq!(refs, (0..100).collect::<Vec<u32>>());
        assert_eq!(arena.lane_total(0), 0);
        assert_eq!(arena.lane_refs(0).count(), 0);
    }

    #[test]
    fn arena_parallel_appends_conserve_refs() {
        let arena = SegmentArena::new(BufferKind::BinSegs, 256, 8);
        (0..1000u32)
            .into_par_iter()
            .try_for_each(|i| arena.append((i % 8) as usize, i))
            .unwrap();
        let mut seen: Vec<u32> = (0..8).flat_map(|lane| arena.lane_refs(lane)).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<u32>>());
        for lane in 0..8 {
            assert_eq!(arena.lane_total(lane), 125);
        }
    }

    #[test]
    fn arena_overflow_is_reported() {
        let arena = SegmentArena::new(BufferKind::TileSegs, 2, 1);
        for i in 0..(2 * SEG_SIZE) as u32 {
            arena.append(0, i).unwrap();
        }
        let err = arena.append(0, 999).unwrap_err();
        match err {
            RasterError::CapacityExceeded { buffer, capacity, .. } => {
                assert_eq!(buffer, BufferKind::TileSegs);
                assert_eq!(capacity, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn arena_reset_reuses_segments() {
        let mut arena = SegmentArena::new(BufferKind::BinSegs, 4, 2);
        for i in 0..(4 * SEG_SIZE) as u32 {
            arena.append(0, i).unwrap();
        }
        arena.reset(2);
        assert_eq!(arena.lane_total(0), 0);
        for i in 0..(4 * SEG_SIZE) as u32 {
            arena.append(1, i).unwrap();
        }
        assert_eq!(arena.lane_refs(1).count(), 4 * SEG_SIZE);
    }

    #[test]
    fn triangle_buffer_capacity_check() {
        let mut tris = TriangleBuffer::new(1);
        assert!(tris.check_capacity().is_ok());
        let rec = TriangleRecord {
            tri_index: 0,
            bin_lo: IVec2::ZERO,
            bin_hi: IVec2::ZERO,
            pixel_lo: IVec2::ZERO,
            pixel_hi: IVec2::ONE,
            edges: [EdgePleq { a: 0, b: 0, c: 0 }; 3],
            inv_area2: 1.0,
            z: [0.0; 3],
            color: [Vec4::ONE; 3],
        };
        tris.records.push(rec);
        tris.records.push(rec);
        assert!(matches!(
            tris.check_capacity(),
            Err(RasterError::CapacityExceeded {
                buffer: BufferKind::Subtris,
                required: 2,
                capacity: 1,
            })
        ));
    }

    #[test]
    fn active_tile_list_snapshot() {
        let active = ActiveTileList::new(16);
        active.push(3);
        active.push(7);
        let mut tiles = active.snapshot();
        tiles.sort_unstable();
        assert_eq!(tiles, vec![3, 7]);
    }
}
