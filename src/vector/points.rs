//! BKD-style point tree for projected 8-d points.
//!
//! One tree is written per (segment, projection) pair. The tree is a binary
//! space partition: every inner node splits its cell at a stored dimension
//! and value, and every leaf lists at most `max_points_per_leaf` points.
//! Cell bounds are not stored per node; readers start from the global
//! min/max and derive child bounds from the split values, exactly like the
//! nearest-neighbor search does.
//!
//! # File Format
//!
//! Little-endian, written to `segment_{n}.{field}_{i}.pts`:
//! - Header (16 bytes): magic `SPTS`, version, point dimensions, point count
//! - u32 max points per leaf, u32 node count
//! - Nodes (20 bytes each): kind, then (split dim, split value, left, right)
//!   for inner nodes or (start, end, 0, 0) for leaves
//! - Global min point, global max point (8 f32 each)
//! - Points: u32 doc id followed by 8 f32 values, in leaf order

use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;

use crate::error::{SegmentError, SegmentResult};
use crate::vector::types::{DocId, POINT_DIMS, ProjectedPoint, VectorError};

/// Current point file format version.
const POINTS_VERSION: u32 = 1;

/// Magic bytes to identify point files.
const MAGIC_BYTES: &[u8; 4] = b"SPTS";

const NODE_LEAF: u32 = 0;
const NODE_INNER: u32 = 1;

/// Default leaf capacity.
pub const DEFAULT_MAX_POINTS_PER_LEAF: usize = 512;

/// Index of a node inside a tree. The root is always node 0.
pub type NodeId = u32;

/// One node of the partition tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointNode {
    Inner {
        split_dim: usize,
        split_value: f32,
        left: NodeId,
        right: NodeId,
    },
    Leaf {
        start: u32,
        end: u32,
    },
}

/// Read contract the nearest-neighbor search relies on.
pub trait PointTreeReader: Send + Sync {
    /// Component-wise minimum over all points.
    fn min_packed(&self) -> ProjectedPoint;

    /// Component-wise maximum over all points.
    fn max_packed(&self) -> ProjectedPoint;

    /// Root node, or `None` for an empty tree.
    fn root(&self) -> Option<NodeId>;

    /// Node by id.
    fn node(&self, id: NodeId) -> PointNode;

    /// Doc ids and points of a leaf range, in the same order.
    fn leaf(&self, start: u32, end: u32) -> (&[DocId], &[ProjectedPoint]);

    /// Number of points, live or not.
    fn point_count(&self) -> usize;
}

/// In-memory point tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BkdTree {
    nodes: Vec<PointNode>,
    docs: Vec<DocId>,
    points: Vec<ProjectedPoint>,
    min: ProjectedPoint,
    max: ProjectedPoint,
    max_points_per_leaf: usize,
}

impl BkdTree {
    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Iterates `(doc, point)` pairs in leaf order.
    pub fn iter(&self) -> impl Iterator<Item = (DocId, &ProjectedPoint)> {
        self.docs.iter().copied().zip(self.points.iter())
    }

    /// Writes the tree to `path`.
    pub fn write_to(&self, path: &Path) -> SegmentResult<()> {
        let file = File::create(path).map_err(|source| SegmentError::FileWrite {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        self.write(&mut writer)
            .and_then(|()| writer.flush())
            .map_err(|source| SegmentError::FileWrite {
                path: path.to_path_buf(),
                source,
            })
    }

    fn write(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(MAGIC_BYTES)?;
        out.write_u32::<LittleEndian>(POINTS_VERSION)?;
        out.write_u32::<LittleEndian>(POINT_DIMS as u32)?;
        out.write_u32::<LittleEndian>(self.points.len() as u32)?;
        out.write_u32::<LittleEndian>(self.max_points_per_leaf as u32)?;
        out.write_u32::<LittleEndian>(self.nodes.len() as u32)?;

        for node in &self.nodes {
            match *node {
                PointNode::Inner {
                    split_dim,
                    split_value,
                    left,
                    right,
                } => {
                    out.write_u32::<LittleEndian>(NODE_INNER)?;
                    out.write_u32::<LittleEndian>(split_dim as u32)?;
                    out.write_f32::<LittleEndian>(split_value)?;
                    out.write_u32::<LittleEndian>(left)?;
                    out.write_u32::<LittleEndian>(right)?;
                }
                PointNode::Leaf { start, end } => {
                    out.write_u32::<LittleEndian>(NODE_LEAF)?;
                    out.write_u32::<LittleEndian>(start)?;
                    out.write_u32::<LittleEndian>(end)?;
                    out.write_u32::<LittleEndian>(0)?;
                    out.write_u32::<LittleEndian>(0)?;
                }
            }
        }

        for value in self.min.iter().chain(self.max.iter()) {
            out.write_f32::<LittleEndian>(*value)?;
        }
        for (doc, point) in self.iter() {
            out.write_u32::<LittleEndian>(doc)?;
            for value in point {
                out.write_f32::<LittleEndian>(*value)?;
            }
        }
        Ok(())
    }

    /// Opens a point file through a memory map and validates it.
    pub fn open(path: &Path) -> SegmentResult<Self> {
        let file = File::open(path).map_err(|source| SegmentError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        // SAFETY: sealed segment files are never modified after they are written.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| SegmentError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::read(&mmap).map_err(|reason| SegmentError::corrupt(path.display(), reason))
    }

    fn read(bytes: &[u8]) -> Result<Self, String> {
        let truncated = |_| "unexpected end of file".to_string();
        if bytes.len() < 24 || &bytes[0..4] != MAGIC_BYTES {
            return Err("invalid magic bytes".to_string());
        }
        let mut input = Cursor::new(&bytes[4..]);
        let version = input.read_u32::<LittleEndian>().map_err(truncated)?;
        if version != POINTS_VERSION {
            return Err(format!(
                "unsupported version {version}, expected {POINTS_VERSION}"
            ));
        }
        let dims = input.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        if dims != POINT_DIMS {
            return Err(format!("point dimension {dims}, expected {POINT_DIMS}"));
        }
        let count = input.read_u32::<LittleEndian>().map_err(truncated)?;
        let max_points_per_leaf = input.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        let node_count = input.read_u32::<LittleEndian>().map_err(truncated)?;

        let mut nodes = Vec::with_capacity(node_count as usize);
        for id in 0..node_count {
            let kind = input.read_u32::<LittleEndian>().map_err(truncated)?;
            let a = input.read_u32::<LittleEndian>().map_err(truncated)?;
            let b = input.read_u32::<LittleEndian>().map_err(truncated)?;
            let c = input.read_u32::<LittleEndian>().map_err(truncated)?;
            let d = input.read_u32::<LittleEndian>().map_err(truncated)?;
            let node = match kind {
                NODE_INNER => {
                    // Children always follow their parent
                    if a as usize >= POINT_DIMS
                        || c <= id
                        || d <= id
                        || c >= node_count
                        || d >= node_count
                    {
                        return Err("inner node out of range".to_string());
                    }
                    PointNode::Inner {
                        split_dim: a as usize,
                        split_value: f32::from_bits(b),
                        left: c,
                        right: d,
                    }
                }
                NODE_LEAF => {
                    if a > b || b > count {
                        return Err("leaf range out of bounds".to_string());
                    }
                    PointNode::Leaf { start: a, end: b }
                }
                other => return Err(format!("unknown node kind {other}")),
            };
            nodes.push(node);
        }
        if count > 0 && nodes.is_empty() {
            return Err("points without a tree".to_string());
        }

        let read_point = |input: &mut Cursor<&[u8]>| -> Result<ProjectedPoint, String> {
            let mut point = [0.0f32; POINT_DIMS];
            for value in point.iter_mut() {
                *value = input.read_f32::<LittleEndian>().map_err(truncated)?;
            }
            Ok(point)
        };
        let min = read_point(&mut input)?;
        let max = read_point(&mut input)?;

        let mut docs = Vec::with_capacity(count as usize);
        let mut points = Vec::with_capacity(count as usize);
        for _ in 0..count {
            docs.push(input.read_u32::<LittleEndian>().map_err(truncated)?);
            points.push(read_point(&mut input)?);
        }
        let mut rest = Vec::new();
        input.read_to_end(&mut rest).map_err(truncated)?;
        if !rest.is_empty() {
            return Err(format!("{} trailing bytes", rest.len()));
        }

        Ok(Self {
            nodes,
            docs,
            points,
            min,
            max,
            max_points_per_leaf,
        })
    }
}

impl PointTreeReader for BkdTree {
    fn min_packed(&self) -> ProjectedPoint {
        self.min
    }

    fn max_packed(&self) -> ProjectedPoint {
        self.max
    }

    fn root(&self) -> Option<NodeId> {
        if self.nodes.is_empty() { None } else { Some(0) }
    }

    fn node(&self, id: NodeId) -> PointNode {
        self.nodes[id as usize]
    }

    fn leaf(&self, start: u32, end: u32) -> (&[DocId], &[ProjectedPoint]) {
        let range = start as usize..end as usize;
        (&self.docs[range.clone()], &self.points[range])
    }

    fn point_count(&self) -> usize {
        self.points.len()
    }
}

/// Accumulates points for one projection and builds the tree.
#[derive(Debug)]
pub struct BkdWriter {
    max_points_per_leaf: usize,
    docs: Vec<DocId>,
    points: Vec<ProjectedPoint>,
}

impl BkdWriter {
    #[must_use]
    pub fn new(max_points_per_leaf: usize) -> Self {
        Self {
            max_points_per_leaf: max_points_per_leaf.max(1),
            docs: Vec::new(),
            points: Vec::new(),
        }
    }

    /// Adds one point. Non-finite components are rejected.
    pub fn add(&mut self, doc: DocId, point: ProjectedPoint) -> Result<(), VectorError> {
        if point.iter().any(|v| !v.is_finite()) {
            return Err(VectorError::InvalidParameter {
                name: "point".to_string(),
                reason: "projected point has a non-finite component".to_string(),
            });
        }
        self.docs.push(doc);
        self.points.push(point);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Builds the tree, consuming the writer.
    #[must_use]
    pub fn finish(self) -> BkdTree {
        let Self {
            max_points_per_leaf,
            docs,
            points,
        } = self;
        if points.is_empty() {
            return BkdTree {
                max_points_per_leaf,
                ..BkdTree::default()
            };
        }

        let (min, max) = bounds(&points);
        let mut order: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::new();
        build(&mut nodes, &points, &mut order, 0, max_points_per_leaf);

        let docs = order.iter().map(|&i| docs[i]).collect();
        let points = order.iter().map(|&i| points[i]).collect();
        BkdTree {
            nodes,
            docs,
            points,
            min,
            max,
            max_points_per_leaf,
        }
    }
}

fn bounds(points: &[ProjectedPoint]) -> (ProjectedPoint, ProjectedPoint) {
    let mut min = [f32::INFINITY; POINT_DIMS];
    let mut max = [f32::NEG_INFINITY; POINT_DIMS];
    for point in points {
        for d in 0..POINT_DIMS {
            min[d] = min[d].min(point[d]);
            max[d] = max[d].max(point[d]);
        }
    }
    (min, max)
}

/// Recursively partitions `order[..]` (which starts at `offset` in leaf order).
fn build(
    nodes: &mut Vec<PointNode>,
    points: &[ProjectedPoint],
    order: &mut [usize],
    offset: usize,
    max_points_per_leaf: usize,
) -> NodeId {
    let id = nodes.len() as NodeId;
    let leaf = PointNode::Leaf {
        start: offset as u32,
        end: (offset + order.len()) as u32,
    };
    nodes.push(leaf);
    if order.len() <= max_points_per_leaf {
        return id;
    }

    // Split on the dimension with the widest spread.
    let mut split_dim = 0;
    let mut widest = 0.0f32;
    for d in 0..POINT_DIMS {
        let (lo, hi) = order.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |acc, &i| {
            (acc.0.min(points[i][d]), acc.1.max(points[i][d]))
        });
        if hi - lo > widest {
            widest = hi - lo;
            split_dim = d;
        }
    }
    if widest == 0.0 {
        // All points identical; nothing left to partition.
        return id;
    }

    order.sort_unstable_by(|&a, &b| points[a][split_dim].total_cmp(&points[b][split_dim]));
    let mid = order.len() / 2;
    let split_value = points[order[mid]][split_dim];

    let (left_order, right_order) = order.split_at_mut(mid);
    let left = build(nodes, points, left_order, offset, max_points_per_leaf);
    let right = build(nodes, points, right_order, offset + mid, max_points_per_leaf);
    nodes[id as usize] = PointNode::Inner {
        split_dim,
        split_value,
        left,
        right,
    };
    id
}
