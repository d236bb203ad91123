//! Type-safe wrappers and core types for the vector subsystem.
//!
//! Newtypes here keep dimensions, segment ordinals and centroid indexes from
//! being mixed up with plain integers, and `VectorError` carries the field
//! name and document id of whatever input was rejected.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use tantivy::{DocId, TERMINATED};

/// Maximum number of dimensions a vector field may declare.
pub const MAX_DIMS: usize = 1024;

/// Number of dimensions of every projected point.
pub const POINT_DIMS: usize = 8;

/// A point produced by one projection basis.
pub type ProjectedPoint = [f32; POINT_DIMS];

/// Type-safe wrapper for vector dimensions.
///
/// Always within `1..=MAX_DIMS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct VectorDimension(usize);

impl VectorDimension {
    /// Creates a new `VectorDimension` with validation.
    pub fn new(dim: usize) -> Result<Self, VectorError> {
        if dim == 0 {
            return Err(VectorError::InvalidDimension {
                dimension: 0,
                reason: "Vector dimension cannot be zero",
            });
        }
        if dim > MAX_DIMS {
            return Err(VectorError::InvalidDimension {
                dimension: dim,
                reason: "Vector dimension cannot exceed 1024",
            });
        }
        Ok(Self(dim))
    }

    /// Returns the underlying dimension value.
    #[must_use]
    pub const fn get(&self) -> usize {
        self.0
    }

    /// Validates that a vector has the expected dimension.
    pub fn validate_vector(&self, vector: &[f32]) -> Result<(), VectorError> {
        self.validate_len(vector.len())
    }

    /// Validates a raw value count against this dimension.
    pub fn validate_len(&self, len: usize) -> Result<(), VectorError> {
        if len != self.0 {
            return Err(VectorError::DimensionMismatch {
                expected: self.0,
                actual: len,
                field: None,
            });
        }
        Ok(())
    }
}

impl TryFrom<usize> for VectorDimension {
    type Error = VectorError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<VectorDimension> for usize {
    fn from(value: VectorDimension) -> Self {
        value.0
    }
}

/// Type-safe wrapper for segment ordinals.
///
/// Segment ordinals can be zero (for the first segment), so we use
/// a plain u32 rather than NonZeroU32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentOrdinal(u32);

impl SegmentOrdinal {
    /// Creates a new `SegmentOrdinal`.
    #[must_use]
    pub const fn new(ordinal: u32) -> Self {
        Self(ordinal)
    }

    /// Returns the underlying u32 value.
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SegmentOrdinal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a centroid inside one segment's quantized store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CentroidId(u32);

impl CentroidId {
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

/// On-disk encoding of the vector part of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorEncoding {
    /// Four bytes per dimension, big-endian IEEE-754.
    #[default]
    Float32,
    /// Two bytes per dimension, the top half of the IEEE-754 bit pattern.
    Half,
}

impl VectorEncoding {
    /// Bytes used by one dimension.
    #[must_use]
    pub const fn bytes_per_dim(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Half => 2,
        }
    }

    /// Stable tag written into store headers.
    #[must_use]
    pub const fn tag(&self) -> u32 {
        match self {
            Self::Float32 => 0,
            Self::Half => 1,
        }
    }

    /// Inverse of [`VectorEncoding::tag`].
    #[must_use]
    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Float32),
            1 => Some(Self::Half),
            _ => None,
        }
    }
}

/// Errors raised while validating or decoding vectors.
///
/// All error messages include actionable suggestions for resolution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error(
        "Vector dimension mismatch{}: expected {expected}, got {actual}\nSuggestion: Send exactly as many values as the field declares in `dims`",
        field_suffix(.field)
    )]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        /// Field the vector was sent for, when known
        field: Option<String>,
    },

    #[error("Invalid vector dimension: {dimension}\nReason: {reason}")]
    InvalidDimension {
        dimension: usize,
        reason: &'static str,
    },

    #[error("Missing vector value\nSuggestion: A document doesn't have a value for this vector field")]
    MissingValue,

    #[error(
        "Malformed vector bytes: length {length} is not a multiple of {width}\nSuggestion: Check that the value was written with the same encoding it is read with"
    )]
    MalformedLength { length: usize, width: usize },

    #[error("Field [{field}] of doc [{doc}]: {source}")]
    InvalidDocument {
        field: String,
        doc: DocId,
        #[source]
        source: Box<VectorError>,
    },

    #[error("Invalid parameter [{name}]: {reason}")]
    InvalidParameter { name: String, reason: String },
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_ref()
        .map(|name| format!(" for field [{name}]"))
        .unwrap_or_default()
}

impl VectorError {
    /// Names the field of a dimension mismatch; other errors pass through.
    #[must_use]
    pub fn in_field(self, name: &str) -> Self {
        match self {
            Self::DimensionMismatch {
                expected, actual, ..
            } => Self::DimensionMismatch {
                expected,
                actual,
                field: Some(name.to_string()),
            },
            other => other,
        }
    }

    /// Attaches the offending field and document to a validation error.
    #[must_use]
    pub fn for_document(self, field: &str, doc: DocId) -> Self {
        Self::InvalidDocument {
            field: field.to_string(),
            doc,
            source: Box::new(self),
        }
    }
}
