//! Approximate candidate retrieval through random projections.
//!
//! The query vector is projected once per basis, every projected point is
//! searched exactly in its own point tree, and the per-projection results
//! are unioned. The candidate set is unranked: exact ranking is left to a
//! similarity scorer over the stored vectors.

use roaring::RoaringBitmap;
use tantivy::query::Scorer;
use tantivy::{DocSet, Score};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SegmentResult;
use crate::vector::nearest::nearest;
use crate::vector::points::PointTreeReader;
use crate::vector::projection::RandomProjector;
use crate::vector::storage::LiveDocs;
use crate::vector::types::{DocId, ProjectedPoint, TERMINATED, VectorError};

/// Candidate query for one vector field.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnQuery {
    field: String,
    points: Vec<ProjectedPoint>,
    top_hits: usize,
}

impl AnnQuery {
    /// Projects `query` with the field's projector.
    pub fn new(
        field: impl Into<String>,
        projector: &RandomProjector,
        query: &[f32],
        top_hits: usize,
    ) -> SegmentResult<Self> {
        let field = field.into();
        if top_hits == 0 {
            return Err(VectorError::InvalidParameter {
                name: "top_hits".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        let points = projector.project(query).map_err(|e| e.in_field(&field))?;
        Ok(Self {
            field,
            points,
            top_hits,
        })
    }

    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// One projected point per basis.
    #[must_use]
    pub fn points(&self) -> &[ProjectedPoint] {
        &self.points
    }

    #[must_use]
    pub fn top_hits(&self) -> usize {
        self.top_hits
    }

    /// Union of the `top_hits` nearest live docs of every projection.
    ///
    /// `trees[i]` must be the point tree of projection `i`.
    pub fn candidates<R>(
        &self,
        trees: &[R],
        live: &LiveDocs,
        cancel: &CancellationToken,
    ) -> SegmentResult<RoaringBitmap>
    where
        R: PointTreeReader,
    {
        if trees.len() != self.points.len() {
            return Err(VectorError::InvalidParameter {
                name: "projections".to_string(),
                reason: format!(
                    "field [{}] has {} point trees but the query has {} projections",
                    self.field,
                    trees.len(),
                    self.points.len()
                ),
            }
            .into());
        }

        let mut candidates = RoaringBitmap::new();
        for (tree, point) in trees.iter().zip(&self.points) {
            let hits = nearest(tree, live, point, self.top_hits, cancel)?;
            candidates.extend(hits.iter().map(|hit| hit.doc));
        }
        debug!(
            field = %self.field,
            candidates = candidates.len(),
            "Collected ANN candidates"
        );
        Ok(candidates)
    }

    /// Constant-score scorer over [`AnnQuery::candidates`].
    pub fn scorer<R>(
        &self,
        trees: &[R],
        live: &LiveDocs,
        cancel: &CancellationToken,
        boost: Score,
    ) -> SegmentResult<CandidateScorer>
    where
        R: PointTreeReader,
    {
        Ok(CandidateScorer::new(
            &self.candidates(trees, live, cancel)?,
            boost,
        ))
    }
}

/// Matches every candidate with the same score.
#[derive(Debug, Clone)]
pub struct CandidateScorer {
    docs: Vec<DocId>,
    pos: usize,
    boost: Score,
}

impl CandidateScorer {
    #[must_use]
    pub fn new(candidates: &RoaringBitmap, boost: Score) -> Self {
        Self {
            docs: candidates.iter().collect(),
            pos: 0,
            boost,
        }
    }
}

impl DocSet for CandidateScorer {
    fn advance(&mut self) -> DocId {
        if self.pos < self.docs.len() {
            self.pos += 1;
        }
        self.doc()
    }

    fn seek(&mut self, target: DocId) -> DocId {
        let offset = self.docs[self.pos..].partition_point(|&doc| doc < target);
        self.pos += offset;
        self.doc()
    }

    fn doc(&self) -> DocId {
        self.docs.get(self.pos).copied().unwrap_or(TERMINATED)
    }

    fn size_hint(&self) -> u32 {
        self.docs.len() as u32
    }
}

impl Scorer for CandidateScorer {
    fn score(&mut self) -> Score {
        self.boost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SegmentError;
    use crate::vector::codec::squared_l2_distance;
    use crate::vector::points::{BkdTree, BkdWriter};
    use crate::vector::types::VectorDimension;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn index(projector: &RandomProjector, vectors: &[Vec<f32>]) -> Vec<BkdTree> {
        let mut writers: Vec<BkdWriter> = (0..projector.num_projections())
            .map(|_| BkdWriter::new(16))
            .collect();
        for (doc, vector) in vectors.iter().enumerate() {
            for (writer, point) in writers.iter_mut().zip(projector.project(vector).unwrap()) {
                writer.add(doc as DocId, point).unwrap();
            }
        }
        writers.into_iter().map(BkdWriter::finish).collect()
    }

    #[test]
    fn test_candidates_contain_exact_match() {
        let dim = VectorDimension::new(32).unwrap();
        let projector = RandomProjector::with_seed(dim, 4, 1);
        let mut rng = StdRng::seed_from_u64(2);
        let vectors: Vec<Vec<f32>> = (0..500)
            .map(|_| (0..32).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect();
        let trees = index(&projector, &vectors);
        let live = LiveDocs::all_live(500);

        let query = AnnQuery::new("vector", &projector, &vectors[42], 10).unwrap();
        let candidates = query
            .candidates(&trees, &live, &CancellationToken::new())
            .unwrap();
        assert!(candidates.contains(42));
        assert!(candidates.len() >= 10 && candidates.len() <= 40);
    }

    #[test]
    fn test_candidates_have_reasonable_recall() {
        let dim = VectorDimension::new(16).unwrap();
        let projector = RandomProjector::with_seed(dim, 8, 3);
        let mut rng = StdRng::seed_from_u64(4);
        let vectors: Vec<Vec<f32>> = (0..1000)
            .map(|_| (0..16).map(|_| rng.random_range(-1.0..1.0)).collect())
            .collect();
        let trees = index(&projector, &vectors);
        let live = LiveDocs::all_live(1000);
        let cancel = CancellationToken::new();

        let mut found = 0;
        for q in 0..20 {
            let query_vector = &vectors[q * 37];
            let mut exact: Vec<(f64, DocId)> = vectors
                .iter()
                .enumerate()
                .map(|(doc, v)| (squared_l2_distance(query_vector, v), doc as DocId))
                .collect();
            exact.sort_by(|a, b| a.0.total_cmp(&b.0));

            let query = AnnQuery::new("vector", &projector, query_vector, 20).unwrap();
            let candidates = query.candidates(&trees, &live, &cancel).unwrap();
            found += exact[..5]
                .iter()
                .filter(|(_, doc)| candidates.contains(*doc))
                .count();
        }
        // The query vector itself always comes back, the rest is probabilistic.
        assert!(found >= 20 + 5, "recall too low: {found}/100");
    }

    #[test]
    fn test_deleted_docs_never_returned() {
        let dim = VectorDimension::new(4).unwrap();
        let projector = RandomProjector::with_seed(dim, 2, 5);
        let vectors: Vec<Vec<f32>> = (0..50).map(|i| vec![i as f32, 0.0, 1.0, -1.0]).collect();
        let trees = index(&projector, &vectors);
        let mut live = LiveDocs::all_live(50);
        live.delete(10);

        let query = AnnQuery::new("vector", &projector, &vectors[10], 5).unwrap();
        let candidates = query
            .candidates(&trees, &live, &CancellationToken::new())
            .unwrap();
        assert!(!candidates.contains(10));
        assert!(!candidates.is_empty());
    }

    #[test]
    fn test_invalid_query_rejected() {
        let dim = VectorDimension::new(4).unwrap();
        let projector = RandomProjector::with_seed(dim, 2, 5);
        let err = AnnQuery::new("vector", &projector, &[1.0, 2.0], 5).unwrap_err();
        assert!(err.is_invalid_input());
        assert!(err.to_string().contains("[vector]"));
        assert!(matches!(
            err,
            SegmentError::InvalidInput(VectorError::DimensionMismatch {
                expected: 4,
                actual: 2,
                field: Some(ref field),
            }) if field == "vector"
        ));
        assert!(AnnQuery::new("vector", &projector, &[1.0; 4], 0).is_err());
    }

    #[test]
    fn test_projection_count_mismatch() {
        let dim = VectorDimension::new(4).unwrap();
        let projector = RandomProjector::with_seed(dim, 2, 5);
        let trees = index(&projector, &[vec![1.0; 4]]);
        let query = AnnQuery::new("vector", &projector, &[1.0; 4], 5).unwrap();
        let result = query.candidates(&trees[..1], &LiveDocs::all_live(1), &CancellationToken::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_candidate_scorer_docset() {
        let mut candidates = RoaringBitmap::new();
        candidates.extend([2u32, 5, 9, 14]);
        let mut scorer = CandidateScorer::new(&candidates, 2.0);

        assert_eq!(scorer.size_hint(), 4);
        assert_eq!(scorer.doc(), 2);
        assert_eq!(scorer.score(), 2.0);
        assert_eq!(scorer.advance(), 5);
        assert_eq!(scorer.seek(6), 9);
        assert_eq!(scorer.seek(9), 9);
        assert_eq!(scorer.seek(20), TERMINATED);
        assert_eq!(scorer.advance(), TERMINATED);

        let mut empty = CandidateScorer::new(&RoaringBitmap::new(), 1.0);
        assert_eq!(empty.doc(), TERMINATED);
        assert_eq!(empty.advance(), TERMINATED);
    }
}
