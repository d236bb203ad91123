//! ANN candidates plus exact reranking over several segments.

use crate::common::{dense_field, random_vectors, test_settings};
use segvec::vector::codec::squared_l2_distance;
use segvec::vector::{Metric, VectorIndex};
use tantivy::query::Scorer;
use tantivy::{DocSet, TERMINATED};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn build_index(dir: &TempDir, vectors: &[Vec<f32>], per_segment: usize) -> VectorIndex {
    let index = VectorIndex::open(&test_settings(dir, 1_000_000)).unwrap();
    for chunk in vectors.chunks(per_segment) {
        let mut writer = index.writer(vec![dense_field("embedding", 16, 21)]).unwrap();
        for v in chunk {
            writer.add_document(&[("embedding", v.as_slice())]).unwrap();
        }
        index.commit(writer, &CancellationToken::new()).unwrap();
    }
    index
}

#[test]
fn test_indexed_vector_finds_itself() {
    let dir = TempDir::new().unwrap();
    let vectors = random_vectors(400, 16, 7);
    let index = build_index(&dir, &vectors, 100);
    assert_eq!(index.segments().len(), 4);

    for (i, v) in vectors.iter().enumerate().step_by(37) {
        let hits = index
            .search("embedding", v, Metric::Cosine, 5, &CancellationToken::new())
            .unwrap();
        let top = hits[0];
        assert_eq!(top.segment.get() as usize, i / 100);
        assert_eq!(top.doc as usize, i % 100);
        assert!((top.score - 2.0).abs() < 1e-4);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }
}

#[test]
fn test_candidates_contain_true_neighbour_often() {
    let dir = TempDir::new().unwrap();
    let vectors = random_vectors(300, 16, 8);
    let index = build_index(&dir, &vectors, 300);
    let segment = &index.segments()[0];
    let queries = random_vectors(50, 16, 99);

    let mut found = 0;
    for query in &queries {
        let nearest_doc = vectors
            .iter()
            .enumerate()
            .min_by(|a, b| {
                squared_l2_distance(query, a.1).total_cmp(&squared_l2_distance(query, b.1))
            })
            .map(|(doc, _)| doc as u32)
            .unwrap();
        let ann = segment.ann_query("embedding", query).unwrap();
        let candidates = segment
            .ann_candidates(&ann, &CancellationToken::new())
            .unwrap();
        assert!(candidates.len() <= 40, "at most top_hits per projection");
        if candidates.contains(nearest_doc) {
            found += 1;
        }
    }
    // Recall is probabilistic; projections must still beat random picks (40/300)
    assert!(found >= 12, "true neighbour found for only {found}/50 queries");
}

#[test]
fn test_candidate_scorer_is_constant() {
    let dir = TempDir::new().unwrap();
    let vectors = random_vectors(60, 16, 10);
    let index = build_index(&dir, &vectors, 60);
    let segment = &index.segments()[0];

    let ann = segment.ann_query("embedding", &vectors[3]).unwrap();
    let candidates = segment
        .ann_candidates(&ann, &CancellationToken::new())
        .unwrap();
    let mut scorer = segment
        .ann_scorer(&ann, &CancellationToken::new(), 1.0)
        .unwrap();

    let mut matched = Vec::new();
    while scorer.doc() != TERMINATED {
        assert_eq!(scorer.score(), 1.0);
        matched.push(scorer.doc());
        scorer.advance();
    }
    assert_eq!(matched, candidates.iter().collect::<Vec<_>>());
    assert!(matched.contains(&3));
}

#[test]
fn test_deleted_docs_never_returned() {
    let dir = TempDir::new().unwrap();
    let vectors = random_vectors(100, 16, 11);
    let index = build_index(&dir, &vectors, 100);
    let segment = index.segments()[0].segment();
    index.delete(segment, &[42]).unwrap();

    let hits = index
        .search("embedding", &vectors[42], Metric::L2, 10, &CancellationToken::new())
        .unwrap();
    assert!(hits.iter().all(|hit| hit.doc != 42));
    assert!(!hits.is_empty());
}

#[test]
fn test_cancelled_search() {
    let dir = TempDir::new().unwrap();
    let vectors = random_vectors(20, 16, 12);
    let index = build_index(&dir, &vectors, 10);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = index
        .search("embedding", &vectors[0], Metric::Cosine, 3, &cancel)
        .unwrap_err();
    assert_eq!(err.status_code(), "CANCELLED");
}

#[test]
fn test_query_dimension_mismatch() {
    let dir = TempDir::new().unwrap();
    let vectors = random_vectors(10, 16, 13);
    let index = build_index(&dir, &vectors, 10);

    let err = index
        .search("embedding", &[1.0, 2.0], Metric::Cosine, 3, &CancellationToken::new())
        .unwrap_err();
    assert!(err.is_invalid_input());
}
