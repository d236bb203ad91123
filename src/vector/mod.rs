//! Vector search over segmented, immutable indexes.
//!
//! Dense vectors are kept twice per segment: as encoded records in a
//! per-document store, used for exact scoring, and as `P` random
//! projections to 8 dimensions, each indexed in its own point tree. A query
//! collects the nearest projected neighbours of every tree as ANN
//! candidates, then ranks them with the cosine or L2 scorer.
//!
//! # Architecture
//! - [`codec`]: byte encodings of vectors, records and bit vectors
//! - [`projection`]: seeded Gaussian projection bases
//! - [`points`] and [`nearest`]: point trees and exact k-NN over them
//! - [`ann`]: candidate query unioning the per-projection hits
//! - [`quantizer`]: k-means compaction of large segments
//! - [`scoring`]: similarity scorers over doc-value cursors
//! - [`segment`] and [`index`]: flush, merge and multi-segment search

pub mod ann;
pub mod codec;
pub mod field;
pub mod index;
pub mod nearest;
pub mod points;
pub mod projection;
pub mod quantizer;
pub mod scoring;
pub mod script;
pub mod segment;
pub mod storage;
mod types;

// Re-export core types for public API
pub use ann::{AnnQuery, CandidateScorer};
pub use field::{
    BitVectorField, DenseVectorField, DenseVectorParams, IndexedVector, VectorFieldType,
};
pub use index::{IndexHit, IndexMeta, VectorIndex};
pub use nearest::{NearestHit, nearest};
pub use points::{BkdTree, BkdWriter, PointNode, PointTreeReader};
pub use projection::RandomProjector;
pub use quantizer::{
    IterationStats, QuantizationObserver, QuantizedVectors, TracingObserver, VectorQuantizer,
};
pub use scoring::{CosineScorer, L2Scorer, Metric, VectorScorer};
pub use script::VectorScript;
pub use segment::{
    ScoredDoc, SegmentMeta, SegmentVectorReader, SegmentVectorWriter, VectorFormat, merge,
};
pub use storage::{LiveDocs, QuantizedVectorStore, RawVectorStore, VectorDocValues};
pub use types::{
    CentroidId, DocId, MAX_DIMS, POINT_DIMS, ProjectedPoint, SegmentOrdinal, TERMINATED,
    VectorDimension, VectorEncoding, VectorError,
};
