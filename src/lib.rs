//! Approximate and exact nearest-neighbor search over dense vectors stored
//! in segmented, immutable indexes.

pub mod config;
pub mod error;
pub mod logging;
pub mod vector;

// Explicit exports for better API clarity
pub use config::Settings;
pub use error::{SegmentError, SegmentResult};
pub use vector::{
    AnnQuery, DenseVectorField, DenseVectorParams, Metric, SegmentVectorReader,
    SegmentVectorWriter, VectorDimension, VectorError, VectorIndex, VectorScript,
};
