//! Cosine and L2 similarity scorers over a vector doc-values cursor.
//!
//! Scorers walk the documents of one segment in cursor order and score each
//! stored vector against a fixed query. They depend on a live cursor, so
//! their results are never cached.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tantivy::query::Scorer;
use tantivy::{DocSet, Score};

use crate::vector::codec::{FULL_BYTES, HALF_BYTES, l2_norm, read_be_f32, read_be_half};
use crate::vector::storage::VectorDocValues;
use crate::vector::types::{DocId, VectorEncoding, VectorError};

/// Similarity metric of a score script or scoring query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Metric {
    Cosine,
    L2,
}

impl Metric {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "COSINE",
            Self::L2 => "L2",
        }
    }

    /// Builds the scorer for this metric.
    pub fn scorer(
        &self,
        query: &[f32],
        values: Box<dyn VectorDocValues>,
    ) -> Result<VectorScorer, VectorError> {
        Ok(match self {
            Self::Cosine => VectorScorer::Cosine(CosineScorer::new(query, values)?),
            Self::L2 => VectorScorer::L2(L2Scorer::new(query, values)?),
        })
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("cosine") {
            Ok(Self::Cosine)
        } else if s.eq_ignore_ascii_case("l2") {
            Ok(Self::L2)
        } else {
            Err(VectorError::InvalidParameter {
                name: "metric".to_string(),
                reason: format!("unknown metric [{s}], expected COSINE or L2"),
            })
        }
    }
}

/// Component `dim` of an encoded record.
#[inline]
fn component(record: &[u8], encoding: VectorEncoding, dim: usize) -> f32 {
    match encoding {
        VectorEncoding::Float32 => read_be_f32(record, dim * FULL_BYTES),
        VectorEncoding::Half => read_be_half(record, dim * HALF_BYTES),
    }
}

fn check_query(query: &[f32], values: &dyn VectorDocValues) -> Result<(), VectorError> {
    if query.is_empty() {
        return Err(VectorError::MissingValue);
    }
    values.dimension().validate_vector(query)
}

/// Scores `dot(query / |query|, doc) / |doc| + 1.0`.
///
/// Scores fall in `[0, 2]`. A document with zero norm scores 1.0.
pub struct CosineScorer {
    query: Vec<f32>,
    values: Box<dyn VectorDocValues>,
}

impl CosineScorer {
    /// Normalizes the query. A zero query has no direction and is rejected.
    pub fn new(query: &[f32], values: Box<dyn VectorDocValues>) -> Result<Self, VectorError> {
        check_query(query, values.as_ref())?;
        let norm = l2_norm(query);
        if norm == 0.0 || !norm.is_finite() {
            return Err(VectorError::InvalidParameter {
                name: "query_vector".to_string(),
                reason: "cosine similarity needs a query with a finite, non-zero norm".to_string(),
            });
        }
        Ok(Self {
            query: query.iter().map(|v| v / norm).collect(),
            values,
        })
    }

    fn current_score(&self) -> Score {
        let record = self.values.binary_value();
        if record.is_empty() {
            return 0.0;
        }
        let encoding = self.values.encoding();
        let mut dot = 0.0f32;
        for (dim, q) in self.query.iter().enumerate() {
            dot += q * component(record, encoding, dim);
        }
        let doc_norm = read_be_f32(record, record.len() - 4);
        if doc_norm == 0.0 {
            return 1.0;
        }
        dot / doc_norm + 1.0
    }
}

/// Scores `1 / (1 + |query - doc|)`.
pub struct L2Scorer {
    query: Vec<f32>,
    values: Box<dyn VectorDocValues>,
}

impl L2Scorer {
    pub fn new(query: &[f32], values: Box<dyn VectorDocValues>) -> Result<Self, VectorError> {
        check_query(query, values.as_ref())?;
        Ok(Self {
            query: query.to_vec(),
            values,
        })
    }

    fn current_score(&self) -> Score {
        let record = self.values.binary_value();
        if record.is_empty() {
            return 0.0;
        }
        let encoding = self.values.encoding();
        let mut sum = 0.0f32;
        for (dim, q) in self.query.iter().enumerate() {
            let diff = q - component(record, encoding, dim);
            sum += diff * diff;
        }
        1.0 / (1.0 + sum.sqrt())
    }
}

macro_rules! impl_vector_scorer {
    ($scorer:ty) => {
        impl DocSet for $scorer {
            fn advance(&mut self) -> DocId {
                self.values.next_doc()
            }

            fn seek(&mut self, target: DocId) -> DocId {
                self.values.advance(target)
            }

            fn doc(&self) -> DocId {
                self.values.doc_id()
            }

            fn size_hint(&self) -> u32 {
                self.values.cost().min(u64::from(u32::MAX)) as u32
            }
        }

        impl Scorer for $scorer {
            fn score(&mut self) -> Score {
                self.current_score()
            }
        }
    };
}

impl_vector_scorer!(CosineScorer);
impl_vector_scorer!(L2Scorer);

/// Scorer for either metric.
pub enum VectorScorer {
    Cosine(CosineScorer),
    L2(L2Scorer),
}

impl VectorScorer {
    #[must_use]
    pub fn metric(&self) -> Metric {
        match self {
            Self::Cosine(_) => Metric::Cosine,
            Self::L2(_) => Metric::L2,
        }
    }

    /// Scores depend on a per-segment cursor and cannot be cached.
    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        false
    }
}

impl fmt::Debug for VectorScorer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorScorer")
            .field("metric", &self.metric())
            .finish_non_exhaustive()
    }
}

impl DocSet for VectorScorer {
    fn advance(&mut self) -> DocId {
        match self {
            Self::Cosine(s) => s.advance(),
            Self::L2(s) => s.advance(),
        }
    }

    fn seek(&mut self, target: DocId) -> DocId {
        match self {
            Self::Cosine(s) => s.seek(target),
            Self::L2(s) => s.seek(target),
        }
    }

    fn doc(&self) -> DocId {
        match self {
            Self::Cosine(s) => s.doc(),
            Self::L2(s) => s.doc(),
        }
    }

    fn size_hint(&self) -> u32 {
        match self {
            Self::Cosine(s) => s.size_hint(),
            Self::L2(s) => s.size_hint(),
        }
    }
}

impl Scorer for VectorScorer {
    fn score(&mut self) -> Score {
        match self {
            Self::Cosine(s) => s.score(),
            Self::L2(s) => s.score(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::codec::encode_record;
    use crate::vector::storage::{QuantizedVectorStore, RawVectorStore};
    use crate::vector::types::{CentroidId, TERMINATED, VectorDimension};
    use tempfile::TempDir;

    fn raw_store(dir: &TempDir, vectors: &[(DocId, Vec<f32>)], encoding: VectorEncoding) -> RawVectorStore {
        let path = dir.path().join("segment_0.vector.vec");
        let dim = VectorDimension::new(vectors[0].1.len()).unwrap();
        let records: Vec<(DocId, Vec<u8>)> = vectors
            .iter()
            .map(|(doc, v)| (*doc, encode_record(v, encoding)))
            .collect();
        RawVectorStore::write(&path, dim, encoding, &records).unwrap();
        RawVectorStore::open(&path).unwrap()
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!("COSINE".parse::<Metric>().unwrap(), Metric::Cosine);
        assert_eq!("cosine".parse::<Metric>().unwrap(), Metric::Cosine);
        assert_eq!("l2".parse::<Metric>().unwrap(), Metric::L2);
        assert!("dot".parse::<Metric>().is_err());
        assert_eq!(serde_json::to_string(&Metric::L2).unwrap(), "\"L2\"");
        assert_eq!(
            serde_json::from_str::<Metric>("\"COSINE\"").unwrap(),
            Metric::Cosine
        );
        assert_eq!(Metric::Cosine.to_string(), "COSINE");
    }

    #[test]
    fn test_cosine_scores() {
        let temp_dir = TempDir::new().unwrap();
        let store = raw_store(
            &temp_dir,
            &[(0, vec![1.0, 0.0]), (1, vec![0.0, 1.0]), (2, vec![-2.0, 0.0])],
            VectorEncoding::Float32,
        );
        let mut scorer = CosineScorer::new(&[1.0, 0.0], Box::new(store.cursor())).unwrap();

        assert_eq!(scorer.doc(), 0);
        assert_eq!(scorer.score(), 2.0);
        assert_eq!(scorer.advance(), 1);
        assert_eq!(scorer.score(), 1.0);
        assert_eq!(scorer.advance(), 2);
        assert_eq!(scorer.score(), 0.0);
        assert_eq!(scorer.advance(), TERMINATED);
    }

    #[test]
    fn test_cosine_normalizes_query() {
        let temp_dir = TempDir::new().unwrap();
        let store = raw_store(&temp_dir, &[(0, vec![3.0, 4.0])], VectorEncoding::Float32);
        let mut scorer = CosineScorer::new(&[30.0, 40.0], Box::new(store.cursor())).unwrap();
        assert!((scorer.score() - 2.0).abs() < 1e-6);

        let zero = CosineScorer::new(&[0.0, 0.0], Box::new(store.cursor()));
        assert!(zero.is_err());
    }

    #[test]
    fn test_l2_scores() {
        let temp_dir = TempDir::new().unwrap();
        let store = raw_store(
            &temp_dir,
            &[(0, vec![1.0, 1.0]), (3, vec![4.0, 5.0])],
            VectorEncoding::Float32,
        );
        let mut scorer = L2Scorer::new(&[1.0, 1.0], Box::new(store.cursor())).unwrap();
        assert_eq!(scorer.score(), 1.0);
        assert_eq!(scorer.seek(2), 3);
        // Distance 5 from the query.
        assert!((scorer.score() - 1.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_half_encoded_values() {
        let temp_dir = TempDir::new().unwrap();
        let store = raw_store(&temp_dir, &[(0, vec![0.5, -0.25])], VectorEncoding::Half);
        let mut scorer = Metric::L2
            .scorer(&[0.5, -0.25], Box::new(store.cursor()))
            .unwrap();
        assert_eq!(scorer.metric(), Metric::L2);
        assert_eq!(scorer.score(), 1.0);
        assert!(!scorer.is_cacheable());
    }

    #[test]
    fn test_quantized_store_scoring() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("segment_0.vector.qvec");
        let dim = VectorDimension::new(2).unwrap();
        let centroids = vec![
            encode_record(&[1.0, 0.0], VectorEncoding::Float32),
            encode_record(&[0.0, 2.0], VectorEncoding::Float32),
        ];
        QuantizedVectorStore::write(
            &path,
            dim,
            &centroids,
            &[(0, CentroidId::new(1)), (5, CentroidId::new(0))],
        )
        .unwrap();
        let store = QuantizedVectorStore::open(&path).unwrap();

        let mut scorer = Metric::Cosine
            .scorer(&[1.0, 0.0], Box::new(store.cursor()))
            .unwrap();
        assert_eq!(scorer.score(), 1.0);
        assert_eq!(scorer.seek(5), 5);
        assert_eq!(scorer.score(), 2.0);
        assert_eq!(scorer.size_hint(), 2);
    }

    #[test]
    fn test_query_dimension_checked() {
        let temp_dir = TempDir::new().unwrap();
        let store = raw_store(&temp_dir, &[(0, vec![1.0, 0.0, 0.0])], VectorEncoding::Float32);
        assert!(matches!(
            L2Scorer::new(&[1.0, 0.0], Box::new(store.cursor())),
            Err(VectorError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            CosineScorer::new(&[], Box::new(store.cursor())),
            Err(VectorError::MissingValue)
        ));
    }
}
