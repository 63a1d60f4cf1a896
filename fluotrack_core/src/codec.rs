//! Binary track-map files.
//!
//! Layout (all integers `u32`, all reals `f64`, little endian):
//! - 16-byte ASCII header `FluoRender links`
//! - `[FPCOUNT][counter]` and `[NUM][frames]`
//! - per frame: `[FRAM][index]`, vertices with their cells, contact
//!   edges, and from frame 1 on the link graph to the previous frame
//!
//! Fields added in later revisions sit behind a version tag. The reader
//! peeks for the tag and falls back to a default when it is absent, so
//! older files still load.

use crate::cell::{BoundingBox, Cell, Vertex};
use crate::graph::{ContactEdge, InterGraph, InterNode, LinkEdge, LinkState, NodeKey};
use crate::processor::TrackMapProcessor;
use crate::track_map::{FrameData, TrackMap, VolumeInfo};
use fluotrack_env::VolumeCache;
use nalgebra::Point3;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

pub const HEADER: &[u8; 16] = b"FluoRender links";

pub const TAG_CELL: u8 = 1;
pub const TAG_VERT: u8 = 2;
pub const TAG_INTRA_EDGE: u8 = 3;
pub const TAG_INTER_EDGE: u8 = 4;
pub const TAG_FRAM: u8 = 5;
pub const TAG_FPCOUNT: u8 = 6;
pub const TAG_NUM: u8 = 7;
/// Flip counts on link edges
pub const TAG_VER219: u8 = 8;
/// Contact distances, cell bounds, link graph index and counter
pub const TAG_VER220: u8 = 9;
/// Cell brick id
pub const TAG_VER221: u8 = 10;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a track map file")]
    BadHeader,

    #[error("Expected tag {expected}, found {found}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("Invalid link state {0}")]
    InvalidLink(u32),

    #[error("Map has {frames} frames but {graphs} link graphs")]
    InconsistentFrames { frames: usize, graphs: usize },
}

impl CodecError {
    fn truncated() -> Self {
        CodecError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
    }
}

// ============================================================================
// WRITER
// ============================================================================

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn tag(&mut self, tag: u8) {
        self.buf.push(tag);
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn point(&mut self, p: &Point3<f64>) {
        self.f64(p.x);
        self.f64(p.y);
        self.f64(p.z);
    }

    fn cell(&mut self, cell: &Cell) {
        self.tag(TAG_CELL);
        self.u32(cell.id);
        self.tag(TAG_VER221);
        self.u32(cell.brick_id);
        self.u32(cell.size_ui);
        self.f64(cell.size_d);
        self.u32(cell.ext_ui);
        self.f64(cell.ext_d);
        self.point(&cell.center);
        self.tag(TAG_VER220);
        self.point(&cell.bbox.min);
        self.point(&cell.bbox.max);
    }

    fn vertex(&mut self, vertex: &Vertex, frame: &FrameData) {
        let cells: Vec<&Cell> = vertex.cells.iter().filter_map(|c| frame.cells.get(c)).collect();
        self.tag(TAG_VERT);
        self.u32(vertex.id);
        self.u32(vertex.size_ui);
        self.f64(vertex.size_d);
        self.point(&vertex.center);
        self.u32(cells.len() as u32);
        for cell in cells {
            self.cell(cell);
        }
    }
}

/// Serializes `map`.
///
/// Fails before producing any bytes when the map has no frames or the
/// number of link graphs does not match.
pub fn encode_map(map: &TrackMap) -> Result<Vec<u8>, CodecError> {
    let frames = map.frames.len();
    if frames == 0 || map.inter.len() + 1 != frames {
        return Err(CodecError::InconsistentFrames {
            frames,
            graphs: map.inter.len(),
        });
    }

    let mut w = Writer { buf: Vec::new() };
    w.buf.extend_from_slice(HEADER);
    w.tag(TAG_FPCOUNT);
    w.u32(map.counter);
    w.tag(TAG_NUM);
    w.u32(frames as u32);

    for (i, frame) in map.frames.iter().enumerate() {
        w.tag(TAG_FRAM);
        w.u32(i as u32);

        w.u32(frame.vertices.len() as u32);
        for vertex in frame.vertices.values() {
            w.vertex(vertex, frame);
        }

        w.u32(frame.intra.edge_count() as u32);
        for ((a, b), edge) in frame.intra.edges() {
            w.tag(TAG_INTRA_EDGE);
            w.u32(a);
            w.u32(b);
            w.u32(edge.size_ui);
            w.f64(edge.size_d);
            w.tag(TAG_VER220);
            w.f64(edge.dist_v);
            w.f64(edge.dist_s);
        }

        if i == 0 {
            continue;
        }
        let ig = &map.inter[i - 1];
        w.tag(TAG_VER220);
        w.u32(ig.index as u32);
        w.u32(ig.counter);
        w.u32(ig.graph.edge_count() as u32);
        for ((a, b), edge) in ig.graph.edges() {
            let (early, late) = if a.frame <= b.frame { (a, b) } else { (b, a) };
            w.tag(TAG_INTER_EDGE);
            w.u32(early.id);
            w.u32(late.id);
            w.u32(edge.size_ui);
            w.f64(edge.size_d);
            w.f64(edge.dist);
            w.u32(edge.link.as_u32());
            w.tag(TAG_VER219);
            w.u32(ig.node_count(early));
            w.u32(ig.node_count(late));
            w.u32(edge.count);
        }
    }
    Ok(w.buf)
}

// ============================================================================
// READER
// ============================================================================

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let end = self.pos + N;
        let bytes = self.data.get(self.pos..end).ok_or_else(CodecError::truncated)?;
        self.pos = end;
        bytes.try_into().map_err(|_| CodecError::truncated())
    }

    fn tag(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    /// Consumes the next byte only if it is `tag`.
    fn optional_tag(&mut self, tag: u8) -> bool {
        if self.data.get(self.pos) == Some(&tag) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), CodecError> {
        let found = self.tag()?;
        if found != expected {
            return Err(CodecError::UnexpectedTag { expected, found });
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    fn point(&mut self) -> Result<Point3<f64>, CodecError> {
        Ok(Point3::new(self.f64()?, self.f64()?, self.f64()?))
    }

    fn cell(&mut self) -> Result<Cell, CodecError> {
        self.expect_tag(TAG_CELL)?;
        let mut cell = Cell::new(self.u32()?);
        if self.optional_tag(TAG_VER221) {
            cell.brick_id = self.u32()?;
        }
        cell.size_ui = self.u32()?;
        cell.size_d = self.f64()?;
        cell.ext_ui = self.u32()?;
        cell.ext_d = self.f64()?;
        cell.center = self.point()?;
        if self.optional_tag(TAG_VER220) {
            cell.bbox = BoundingBox::new(self.point()?, self.point()?);
        }
        Ok(cell)
    }

    /// Reads one vertex and its cells into `frame`. Repeated ids are read
    /// and dropped.
    fn vertex(&mut self, index: usize, frame: &mut FrameData) -> Result<(), CodecError> {
        self.expect_tag(TAG_VERT)?;
        let mut vertex = Vertex::empty(index, self.u32()?);
        vertex.size_ui = self.u32()?;
        vertex.size_d = self.f64()?;
        vertex.center = self.point()?;
        let count = self.u32()?;
        let duplicate = frame.vertices.contains_key(&vertex.id);

        for _ in 0..count {
            let mut cell = self.cell()?;
            if duplicate || frame.cells.contains_key(&cell.id) {
                continue;
            }
            cell.vertex = Some(vertex.id);
            vertex.cells.insert(cell.id);
            vertex.bbox.extend(&cell.bbox);
            frame.intra.add_node(cell.id, ());
            frame.cells.insert(cell.id, cell);
        }
        if !duplicate {
            frame.vertices.insert(vertex.id, vertex);
        }
        Ok(())
    }
}

/// Parses a map written by [`encode_map`]. Any malformed part fails the
/// whole decode.
pub fn decode_map(data: &[u8], info: VolumeInfo) -> Result<TrackMap, CodecError> {
    if data.len() < HEADER.len() || &data[..HEADER.len()] != HEADER {
        return Err(CodecError::BadHeader);
    }
    let mut r = Reader {
        data,
        pos: HEADER.len(),
    };
    let mut map = TrackMap::new(info);

    if r.optional_tag(TAG_FPCOUNT) {
        map.counter = r.u32()?;
    }
    r.optional_tag(TAG_NUM);
    let frames = r.u32()? as usize;

    for i in 0..frames {
        r.expect_tag(TAG_FRAM)?;
        r.u32()?;

        let mut frame = FrameData::default();
        for _ in 0..r.u32()? {
            r.vertex(i, &mut frame)?;
        }
        for _ in 0..r.u32()? {
            r.expect_tag(TAG_INTRA_EDGE)?;
            let (a, b) = (r.u32()?, r.u32()?);
            let mut edge = ContactEdge {
                size_ui: r.u32()?,
                size_d: r.f64()?,
                ..Default::default()
            };
            if r.optional_tag(TAG_VER220) {
                edge.dist_v = r.f64()?;
                edge.dist_s = r.f64()?;
            }
            if frame.cells.contains_key(&a) && frame.cells.contains_key(&b) {
                frame.intra.set_edge(a, b, edge);
            }
        }
        map.frames.push(frame);

        if i == 0 {
            continue;
        }
        let mut ig = InterGraph::new(i - 1);
        if r.optional_tag(TAG_VER220) {
            ig.index = r.u32()? as usize;
            ig.counter = r.u32()?;
        }
        for _ in 0..r.u32()? {
            r.expect_tag(TAG_INTER_EDGE)?;
            let (id1, id2) = (r.u32()?, r.u32()?);
            let size_ui = r.u32()?;
            let size_d = r.f64()?;
            let dist = r.f64()?;
            let raw = r.u32()?;
            let link = LinkState::from_u32(raw).ok_or(CodecError::InvalidLink(raw))?;
            let (mut c1, mut c2, mut count) = (0, 0, 0);
            if r.optional_tag(TAG_VER219) {
                c1 = r.u32()?;
                c2 = r.u32()?;
                count = r.u32()?;
            }
            let (k1, k2) = (NodeKey::new(i - 1, id1), NodeKey::new(i, id2));
            if !map.frames[i - 1].vertices.contains_key(&id1) || !map.frames[i].vertices.contains_key(&id2) {
                continue;
            }
            ig.graph.ensure_node(k1, InterNode::default).count = c1;
            ig.graph.ensure_node(k2, InterNode::default).count = c2;
            match ig.graph.edge_mut(k1, k2) {
                Some(existing) => existing.count = count,
                None => {
                    ig.graph.set_edge(
                        k1,
                        k2,
                        LinkEdge {
                            size_ui,
                            size_d,
                            dist,
                            link,
                            count,
                        },
                    );
                }
            }
        }
        map.inter.push(ig);
    }
    Ok(map)
}

impl<C> TrackMapProcessor<C>
where
    C: VolumeCache,
{
    /// Writes the map to `path`.
    pub fn export_map(&self, path: impl AsRef<Path>) -> Result<(), CodecError> {
        let bytes = encode_map(&self.map)?;
        std::fs::write(path.as_ref(), &bytes)?;
        info!(
            "Exported {} frames ({} bytes) to {}",
            self.map.frame_count(),
            bytes.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Replaces the map with the one stored at `path`.
    ///
    /// The current map is cleared first, so a failed import leaves an empty
    /// map behind. Volume info is kept.
    pub fn import_map(&mut self, path: impl AsRef<Path>) -> Result<(), CodecError> {
        self.map.clear();
        let result = std::fs::read(path.as_ref())
            .map_err(CodecError::from)
            .and_then(|bytes| decode_map(&bytes, self.map.info));
        match result {
            Ok(map) => {
                info!("Imported {} frames from {}", map.frame_count(), path.as_ref().display());
                self.map = map;
                Ok(())
            }
            Err(e) => {
                warn!("Import of {} failed: {}", path.as_ref().display(), e);
                Err(e)
            }
        }
    }
}
