//! Vector field types.
//!
//! A field definition turns one document value into what a segment stores
//! for it: the encoded record for the per-document store and, for dense
//! fields, one projected point per basis for the point trees. Values whose
//! length differs from the declared `dims` reject the whole document.

use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ProjectionConfig;
use crate::error::{SegmentError, SegmentResult};
use crate::vector::ann::AnnQuery;
use crate::vector::codec::{encode_bits, encode_record, hamming_distance};
use crate::vector::projection::RandomProjector;
use crate::vector::types::{DocId, ProjectedPoint, VectorDimension, VectorEncoding, VectorError};

/// Projections used when a field does not declare any.
pub const DEFAULT_PROJECTIONS: usize = 4;

/// Hits per projection when a field does not declare any.
pub const DEFAULT_TOP_HITS: usize = 10;

fn default_projections() -> usize {
    DEFAULT_PROJECTIONS
}
fn default_top_hits() -> usize {
    DEFAULT_TOP_HITS
}
fn random_seed() -> u64 {
    rand::random()
}

/// Capabilities shared by vector field types.
///
/// Vector values are only reachable through scoring and candidate queries.
pub trait VectorFieldType {
    /// Field name.
    fn name(&self) -> &str;

    /// Type name used in error messages.
    fn type_name(&self) -> &'static str;

    /// Doc-value formatting is not offered.
    fn doc_value_format(&self) -> SegmentResult<Infallible> {
        Err(self.unsupported("docvalue_fields"))
    }

    /// Aggregations are not offered.
    fn aggregate(&self) -> SegmentResult<Infallible> {
        Err(self.unsupported("aggregations"))
    }

    fn unsupported(&self, operation: &'static str) -> SegmentError {
        SegmentError::UnsupportedOperation {
            field: self.name().to_string(),
            field_type: self.type_name(),
            operation,
        }
    }
}

/// Mapping parameters of a dense vector field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseVectorParams {
    pub dims: VectorDimension,

    #[serde(default = "default_projections")]
    pub projections: usize,

    #[serde(default = "default_top_hits")]
    pub top_hits: usize,

    #[serde(default)]
    pub encoding: VectorEncoding,

    /// Seed of the projection bases, fixed when the field is created
    #[serde(default = "random_seed")]
    pub seed: u64,
}

impl DenseVectorParams {
    /// Defaults with a freshly drawn seed.
    #[must_use]
    pub fn new(dims: VectorDimension) -> Self {
        Self {
            dims,
            projections: DEFAULT_PROJECTIONS,
            top_hits: DEFAULT_TOP_HITS,
            encoding: VectorEncoding::default(),
            seed: random_seed(),
        }
    }

    /// Defaults taken from the projection settings.
    #[must_use]
    pub fn from_config(dims: VectorDimension, config: &ProjectionConfig) -> Self {
        Self {
            projections: config.default_projections,
            top_hits: config.default_top_hits,
            ..Self::new(dims)
        }
    }

    #[must_use]
    pub fn with_projections(mut self, projections: usize) -> Self {
        self.projections = projections;
        self
    }

    #[must_use]
    pub fn with_top_hits(mut self, top_hits: usize) -> Self {
        self.top_hits = top_hits;
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: VectorEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<(), VectorError> {
        if self.projections == 0 {
            return Err(VectorError::InvalidParameter {
                name: "projections".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.top_hits == 0 {
            return Err(VectorError::InvalidParameter {
                name: "top_hits".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// What a segment stores for one dense vector value.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedVector {
    /// `encode(vector) ++ magnitude`
    pub record: Vec<u8>,
    /// One point per projection, in projection order
    pub points: Vec<ProjectedPoint>,
}

/// Dense float vector field.
#[derive(Debug, Clone)]
pub struct DenseVectorField {
    name: String,
    params: DenseVectorParams,
    projector: Arc<RandomProjector>,
}

impl PartialEq for DenseVectorField {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.params == other.params
    }
}

impl DenseVectorField {
    pub fn new(name: impl Into<String>, params: DenseVectorParams) -> SegmentResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(VectorError::InvalidParameter {
                name: "name".to_string(),
                reason: "field name cannot be empty".to_string(),
            }
            .into());
        }
        params.validate()?;
        let projector = RandomProjector::with_seed(params.dims, params.projections, params.seed);
        Ok(Self {
            name,
            params,
            projector: Arc::new(projector),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn params(&self) -> &DenseVectorParams {
        &self.params
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.params.dims
    }

    #[must_use]
    pub fn projector(&self) -> &Arc<RandomProjector> {
        &self.projector
    }

    /// Name of the point sub-field of projection `i`.
    #[must_use]
    pub fn sub_field_name(&self, i: usize) -> String {
        format!("{}_{i}", self.name)
    }

    /// Names of every point sub-field.
    #[must_use]
    pub fn sub_field_names(&self) -> Vec<String> {
        (0..self.params.projections)
            .map(|i| self.sub_field_name(i))
            .collect()
    }

    /// Validates and encodes the value of `doc`.
    pub fn index_document(&self, doc: DocId, vector: &[f32]) -> Result<IndexedVector, VectorError> {
        self.encode_value(vector)
            .map_err(|e| e.for_document(&self.name, doc))
    }

    fn encode_value(&self, vector: &[f32]) -> Result<IndexedVector, VectorError> {
        if vector.is_empty() {
            return Err(VectorError::MissingValue);
        }
        self.params.dims.validate_vector(vector)?;
        if let Some(dim) = vector.iter().position(|v| !v.is_finite()) {
            return Err(VectorError::InvalidParameter {
                name: "vector".to_string(),
                reason: format!("value at dimension {dim} is not finite"),
            });
        }
        let points = self.projector.project(vector)?;
        if points.iter().flatten().any(|v| !v.is_finite()) {
            return Err(VectorError::InvalidParameter {
                name: "vector".to_string(),
                reason: "projection overflows f32".to_string(),
            });
        }
        Ok(IndexedVector {
            record: encode_record(vector, self.params.encoding),
            points,
        })
    }

    /// Candidate query using the field's `top_hits`.
    pub fn ann_query(&self, query: &[f32]) -> SegmentResult<AnnQuery> {
        AnnQuery::new(
            self.name.clone(),
            &self.projector,
            query,
            self.params.top_hits,
        )
    }
}

impl VectorFieldType for DenseVectorField {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "dense_vector"
    }
}

/// Boolean vector field stored as packed bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitVectorField {
    name: String,
    dims: VectorDimension,
}

impl BitVectorField {
    #[must_use]
    pub fn new(name: impl Into<String>, dims: VectorDimension) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.dims
    }

    /// Validates and packs the value of `doc`.
    pub fn index_document(&self, doc: DocId, vector: &[bool]) -> Result<Vec<u8>, VectorError> {
        if vector.is_empty() {
            return Err(VectorError::MissingValue.for_document(&self.name, doc));
        }
        self.dims
            .validate_len(vector.len())
            .map_err(|e| e.for_document(&self.name, doc))?;
        Ok(encode_bits(vector))
    }

    /// Hamming distance between a stored value and a query.
    pub fn hamming(&self, encoded: &[u8], query: &[bool]) -> Result<u32, VectorError> {
        self.dims.validate_len(query.len())?;
        hamming_distance(encoded, query)
    }
}

impl VectorFieldType for BitVectorField {
    fn name(&self) -> &str {
        &self.name
    }

    fn type_name(&self) -> &'static str {
        "bit_vector"
    }
}
