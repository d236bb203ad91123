//! Exact k-nearest-neighbor search over a point tree.
//!
//! Best-first traversal: cells are visited in order of their lower-bound
//! distance to the origin, while a bounded max-heap keeps the `top_n` best
//! hits seen so far. Once the heap is full, the distance of its worst hit
//! defines an axis-aligned window around the origin. Points outside the
//! window are skipped and inner cells disjoint from it are pruned.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio_util::sync::CancellationToken;

use crate::error::{SegmentError, SegmentResult};
use crate::vector::points::{NodeId, PointNode, PointTreeReader};
use crate::vector::storage::LiveDocs;
use crate::vector::types::{DocId, POINT_DIMS, ProjectedPoint, VectorError};

/// Window refreshes that always recompute before sampling kicks in.
const EAGER_WINDOW_UPDATES: usize = 1024;

/// After the eager phase, recompute on every 64th replacement.
const WINDOW_UPDATE_MASK: usize = 0x3F;

/// Leaf points visited between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// A document and its squared distance to the query point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestHit {
    pub doc: DocId,
    pub distance_squared: f64,
}

impl NearestHit {
    /// Greater means worse: farther, then higher doc id.
    fn worse_cmp(&self, other: &Self) -> Ordering {
        self.distance_squared
            .total_cmp(&other.distance_squared)
            .then(self.doc.cmp(&other.doc))
    }
}

/// Heap entry ordering the worst hit on top.
#[derive(Debug, Clone, Copy)]
struct WorstFirst(NearestHit);

impl PartialEq for WorstFirst {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WorstFirst {}

impl PartialOrd for WorstFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorstFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.worse_cmp(&other.0)
    }
}

/// Pending cell of the traversal.
#[derive(Debug, Clone, Copy)]
struct Cell {
    node: NodeId,
    min: ProjectedPoint,
    max: ProjectedPoint,
    distance_squared: f64,
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cell {}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cell {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance_squared.total_cmp(&other.distance_squared)
    }
}

/// Finds the `top_n` live points closest to `origin`, ascending by distance
/// with ties broken by lower doc id.
pub fn nearest<R>(
    reader: &R,
    live: &LiveDocs,
    origin: &ProjectedPoint,
    top_n: usize,
    cancel: &CancellationToken,
) -> SegmentResult<Vec<NearestHit>>
where
    R: PointTreeReader + ?Sized,
{
    if top_n == 0 {
        return Err(VectorError::InvalidParameter {
            name: "top_n".to_string(),
            reason: "must be at least 1".to_string(),
        }
        .into());
    }
    let Some(root) = reader.root() else {
        return Ok(Vec::new());
    };

    let mut visitor = NearestVisitor::new(origin, live, top_n);
    let mut cells = BinaryHeap::new();
    let (min, max) = (reader.min_packed(), reader.max_packed());
    cells.push(Reverse(Cell {
        node: root,
        min,
        max,
        distance_squared: approx_best_distance_squared(&min, &max, origin),
    }));

    while let Some(Reverse(cell)) = cells.pop() {
        if cancel.is_cancelled() {
            return Err(SegmentError::Cancelled {
                operation: "nearest neighbor search",
            });
        }

        match reader.node(cell.node) {
            PointNode::Leaf { start, end } => {
                let (docs, points) = reader.leaf(start, end);
                for (doc, point) in docs.iter().zip(points) {
                    visitor.points_seen += 1;
                    if visitor.points_seen % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                        return Err(SegmentError::Cancelled {
                            operation: "nearest neighbor search",
                        });
                    }
                    visitor.visit(*doc, point);
                }
            }
            PointNode::Inner {
                split_dim,
                split_value,
                left,
                right,
            } => {
                if visitor.is_full() && visitor.is_outside_window(&cell.min, &cell.max) {
                    continue;
                }

                let mut left_max = cell.max;
                left_max[split_dim] = split_value;
                let mut right_min = cell.min;
                right_min[split_dim] = split_value;

                cells.push(Reverse(Cell {
                    node: left,
                    min: cell.min,
                    max: left_max,
                    distance_squared: approx_best_distance_squared(&cell.min, &left_max, origin),
                }));
                cells.push(Reverse(Cell {
                    node: right,
                    min: right_min,
                    max: cell.max,
                    distance_squared: approx_best_distance_squared(&right_min, &cell.max, origin),
                }));
            }
        }
    }

    Ok(visitor.into_sorted_hits())
}

struct NearestVisitor<'a> {
    origin: &'a ProjectedPoint,
    live: &'a LiveDocs,
    top_n: usize,
    hits: BinaryHeap<WorstFirst>,
    window_min: ProjectedPoint,
    window_max: ProjectedPoint,
    window_updates: usize,
    points_seen: usize,
}

impl<'a> NearestVisitor<'a> {
    fn new(origin: &'a ProjectedPoint, live: &'a LiveDocs, top_n: usize) -> Self {
        Self {
            origin,
            live,
            top_n,
            hits: BinaryHeap::with_capacity(top_n),
            window_min: [f32::NEG_INFINITY; POINT_DIMS],
            window_max: [f32::INFINITY; POINT_DIMS],
            window_updates: 0,
            points_seen: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.hits.len() == self.top_n
    }

    fn visit(&mut self, doc: DocId, point: &ProjectedPoint) {
        if !self.live.is_live(doc) {
            return;
        }
        if (0..POINT_DIMS)
            .any(|d| point[d] < self.window_min[d] || point[d] > self.window_max[d])
        {
            return;
        }

        let distance_squared = squared_distance(point, self.origin);
        let hit = NearestHit {
            doc,
            distance_squared,
        };
        if !self.is_full() {
            self.hits.push(WorstFirst(hit));
            return;
        }

        let Some(mut bottom) = self.hits.peek_mut() else {
            return;
        };
        if hit.worse_cmp(&bottom.0) == Ordering::Less {
            *bottom = WorstFirst(hit);
            drop(bottom);
            self.maybe_update_window();
        }
    }

    /// Shrinks the window to the current worst hit's radius.
    fn maybe_update_window(&mut self) {
        if self.window_updates < EAGER_WINDOW_UPDATES
            || (self.window_updates & WINDOW_UPDATE_MASK) == WINDOW_UPDATE_MASK
        {
            if let Some(worst) = self.hits.peek() {
                let distance = worst.0.distance_squared.sqrt() as f32;
                let delta = min_delta(distance);
                for d in 0..POINT_DIMS {
                    self.window_min[d] = self.origin[d] - distance - delta;
                    self.window_max[d] = self.origin[d] + distance + delta;
                }
            }
        }
        self.window_updates += 1;
    }

    fn is_outside_window(&self, min: &ProjectedPoint, max: &ProjectedPoint) -> bool {
        (0..POINT_DIMS).any(|d| max[d] < self.window_min[d] || min[d] > self.window_max[d])
    }

    fn into_sorted_hits(self) -> Vec<NearestHit> {
        let mut hits: Vec<NearestHit> = self.hits.into_iter().map(|h| h.0).collect();
        hits.sort_by(NearestHit::worse_cmp);
        hits
    }
}

/// Padding added to the window radius so rounding in the f32 window bounds
/// can never exclude a point at exactly the current worst distance. Scales
/// with the exponent of `distance`.
fn min_delta(distance: f32) -> f32 {
    let exponent = (distance.to_bits() >> 23) & 0xFF;
    if exponent == 0 {
        return f32::from_bits(1);
    }
    let exponent = if exponent <= 23 { 1 } else { exponent - 23 };
    f32::from_bits(exponent << 23)
}

/// Lower bound of the squared distance from `origin` to any point of the box.
fn approx_best_distance_squared(
    min: &ProjectedPoint,
    max: &ProjectedPoint,
    origin: &ProjectedPoint,
) -> f64 {
    let inside = (0..POINT_DIMS).all(|d| origin[d] >= min[d] && origin[d] <= max[d]);
    if inside {
        return 0.0;
    }
    (0..POINT_DIMS)
        .map(|d| {
            let to_min = (f64::from(origin[d]) - f64::from(min[d])).abs();
            let to_max = (f64::from(origin[d]) - f64::from(max[d])).abs();
            let diff = to_min.min(to_max);
            diff * diff
        })
        .sum()
}

fn squared_distance(a: &ProjectedPoint, b: &ProjectedPoint) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let diff = f64::from(x) - f64::from(y);
            diff * diff
        })
        .sum()
}
